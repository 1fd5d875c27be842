use crate::capture::match_host;
use crate::config::Config;
use crate::host::normalize_host;

/// Decides which hosts get captured and which response bodies are kept
#[derive(Debug, Clone, Default)]
pub struct CaptureAdmission {
    include: Vec<String>,
    exclude: Vec<String>,
    excluded_content_types: Vec<String>,
}

impl CaptureAdmission {
    pub fn new(
        include: &[String],
        exclude: &[String],
        excluded_content_types: &[String],
    ) -> Self {
        let lower = |items: &[String]| -> Vec<String> {
            items
                .iter()
                .map(|s| s.trim().to_ascii_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        };
        Self {
            include: lower(include),
            exclude: lower(exclude),
            excluded_content_types: lower(excluded_content_types),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config.include_hosts,
            &config.exclude_hosts,
            &config.exclude_content_types,
        )
    }

    /// Exclusions win; a non-empty include list acts as a whitelist
    pub fn should_capture(&self, host: &str) -> bool {
        let host = normalize_host(host);

        if self.exclude.iter().any(|pattern| match_host(&host, pattern)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|pattern| match_host(&host, pattern))
    }

    /// Whether a response body of this type should be left out of the
    /// capture. The exchange itself is still relayed and recorded.
    pub fn should_exclude_content_type(&self, content_type: &str) -> bool {
        let content_type = content_type.trim().to_ascii_lowercase();
        self.excluded_content_types
            .iter()
            .any(|prefix| content_type.starts_with(prefix.as_str()))
    }
}
