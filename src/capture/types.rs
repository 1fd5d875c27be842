use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Multi-valued header map with lowercase names
pub type HeaderValues = HashMap<String, Vec<String>>;

/// One observed request/response exchange.
///
/// Records are created once the exchange finishes (or fails) and are shared
/// read-only afterwards. A transport failure leaves `status_code` at 0 and
/// sets `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedRequest {
    pub id: String,
    pub timestamp: DateTime<Utc>,

    pub method: String,
    pub url: String,
    /// Host without port
    pub host: String,
    pub path: String,

    pub request_headers: HeaderValues,
    #[serde(with = "body_bytes")]
    pub request_body: Vec<u8>,
    pub request_size: u64,

    pub status_code: u16,
    pub status_text: String,
    pub response_headers: HeaderValues,
    #[serde(with = "body_bytes")]
    pub response_body: Vec<u8>,
    pub response_size: u64,

    pub duration: Duration,

    pub is_https: bool,
    pub tls_version: Option<String>,
    pub tls_cipher: Option<String>,

    pub client_ip: String,
    pub client_port: u16,

    pub error: Option<String>,
}

impl Default for CapturedRequest {
    fn default() -> Self {
        Self {
            id: String::new(),
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            method: String::new(),
            url: String::new(),
            host: String::new(),
            path: String::new(),
            request_headers: HeaderValues::new(),
            request_body: Vec::new(),
            request_size: 0,
            status_code: 0,
            status_text: String::new(),
            response_headers: HeaderValues::new(),
            response_body: Vec::new(),
            response_size: 0,
            duration: Duration::ZERO,
            is_https: false,
            tls_version: None,
            tls_cipher: None,
            client_ip: String::new(),
            client_port: 0,
            error: None,
        }
    }
}

impl CapturedRequest {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// First value of a response header, looked up case-insensitively
    pub fn response_header(&self, name: &str) -> Option<&str> {
        header_value(&self.response_headers, name)
    }

    pub fn request_header(&self, name: &str) -> Option<&str> {
        header_value(&self.request_headers, name)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.response_header("content-type")
    }

    /// Attach a transport failure, clearing any response status
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self.status_code = 0;
        self.status_text.clear();
        self
    }
}

fn header_value<'a>(headers: &'a HeaderValues, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .and_then(|(_, values)| values.first())
        .map(String::as_str)
}

/// Query predicate for [`crate::capture::CaptureStore::list`].
///
/// Unset fields do not constrain the result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterOptions {
    pub method: Option<String>,
    /// Exact host or `*.suffix` wildcard
    pub host: Option<String>,
    pub path_prefix: Option<String>,
    pub status_min: Option<u16>,
    pub status_max: Option<u16>,
    /// Response content-type prefix
    pub content_type: Option<String>,
    pub search: Option<String>,
    /// Bounds on the response size
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    pub https_only: bool,
    pub http_only: bool,
    pub offset: usize,
    pub limit: Option<usize>,
}

/// Aggregate view over everything currently in the store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureStats {
    pub total_count: usize,
    pub total_request_size: u64,
    pub total_response_size: u64,
    pub by_method: HashMap<String, usize>,
    pub by_status: HashMap<u16, usize>,
    pub by_host: HashMap<String, usize>,
    pub avg_duration: Duration,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// Bodies serialize as a string when they are valid UTF-8, as a byte array
/// otherwise.
mod body_bytes {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        Bytes(Vec<u8>),
    }

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        match std::str::from_utf8(body) {
            Ok(text) => serializer.serialize_str(text),
            Err(_) => body.serialize(serializer),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        Ok(match Repr::deserialize(deserializer)? {
            Repr::Text(text) => text.into_bytes(),
            Repr::Bytes(bytes) => bytes,
        })
    }
}
