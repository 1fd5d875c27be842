use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use std::path::Path;

use super::schema::Config;
use crate::error::{ConfigError, Result};

const ENV_PREFIX: &str = "TAPWIRE_";

/// Load configuration from defaults, an optional file, then `TAPWIRE_*`
/// environment variables, in increasing precedence.
///
/// Without an explicit path, `tapwire.toml`, `tapwire.json`, `tapwire.yaml`
/// and `tapwire.yml` in the working directory are merged when present.
pub fn load(path: Option<&Path>) -> Result<Config> {
    let figment = Figment::from(Serialized::defaults(Config::default()));

    let figment = match path {
        Some(path) => merge_file(figment, path)?,
        None => figment
            .merge(Toml::file("tapwire.toml"))
            .merge(Json::file("tapwire.json"))
            .merge(Yaml::file("tapwire.yaml"))
            .merge(Yaml::file("tapwire.yml")),
    };

    extract(figment.merge(Env::prefixed(ENV_PREFIX)))
}

fn merge_file(figment: Figment, path: &Path) -> Result<Figment> {
    if !path.exists() {
        return Err(ConfigError::Parse(format!(
            "Config file not found: {}",
            path.display()
        ))
        .into());
    }

    let figment = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => figment.merge(Toml::file(path)),
        Some("json") => figment.merge(Json::file(path)),
        Some("yaml") | Some("yml") => figment.merge(Yaml::file(path)),
        _ => {
            return Err(ConfigError::Parse(
                "Unsupported config file format. Use .toml, .json, .yaml, or .yml".into(),
            )
            .into())
        }
    };
    Ok(figment)
}

fn extract(figment: Figment) -> Result<Config> {
    let config: Config = figment
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;
    config.validate()?;
    Ok(config)
}
