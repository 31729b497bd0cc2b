//! Layered client configuration: defaults, optional file, `COACH__*` env.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::Result;

pub const DEFAULT_PROFILE_ENDPOINT: &str = "https://2hhn1oxz51.execute-api.us-east-1.amazonaws.com/prod";
pub const DEFAULT_ARTIFACT_ENDPOINT: &str = "https://la41byvnkj.execute-api.us-east-1.amazonaws.com/prod";

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ClientConfig {
    /// Base URL for `GET {profile_endpoint}/{key prefix}`.
    pub profile_endpoint: String,
    /// Base URL for version-scoped artifact downloads.
    pub artifact_endpoint: String,
    pub request_timeout_secs: u64,
    /// Root under which each model gets its own directory.
    pub cache_dir: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            profile_endpoint: DEFAULT_PROFILE_ENDPOINT.into(),
            artifact_endpoint: DEFAULT_ARTIFACT_ENDPOINT.into(),
            request_timeout_secs: 300,
            cache_dir: PathBuf::from("."),
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration { Duration::from_secs(self.request_timeout_secs) }

    /// Builds the config from defaults, then `file` if given, then `COACH__*`
    /// environment variables.
    pub fn load_from(file: Option<&Path>) -> Result<Self> {
        let d = Self::default();
        let mut builder = config::Config::builder()
            .set_default("profile_endpoint", d.profile_endpoint)?
            .set_default("artifact_endpoint", d.artifact_endpoint)?
            .set_default("request_timeout_secs", d.request_timeout_secs)?
            .set_default("cache_dir", d.cache_dir.to_string_lossy().into_owned())?;
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix("COACH").separator("__"));
        let cfg: ClientConfig = builder.build()?.try_deserialize()?;
        debug!(?cfg, "client config loaded");
        Ok(cfg)
    }
}

/// Loads the client config, reading `COACH_CONFIG_FILE` when set.
pub fn load_config() -> Result<ClientConfig> {
    let file = std::env::var_os("COACH_CONFIG_FILE").map(PathBuf::from);
    ClientConfig::load_from(file.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let cfg = ClientConfig::load_from(None).unwrap();
        assert_eq!(cfg.profile_endpoint, DEFAULT_PROFILE_ENDPOINT);
        assert_eq!(cfg.request_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coach.toml");
        std::fs::write(&path, "profile_endpoint = \"http://localhost:9000\"\nrequest_timeout_secs = 5\ncache_dir = \"/var/cache/coach\"\n").unwrap();
        let cfg = ClientConfig::load_from(Some(&path)).unwrap();
        assert_eq!(cfg.profile_endpoint, "http://localhost:9000");
        assert_eq!(cfg.artifact_endpoint, DEFAULT_ARTIFACT_ENDPOINT);
        assert_eq!(cfg.request_timeout_secs, 5);
        assert_eq!(cfg.cache_dir, PathBuf::from("/var/cache/coach"));
    }

    #[test]
    fn missing_file_is_not_fatal() {
        let cfg = ClientConfig::load_from(Some(Path::new("/nonexistent/coach.toml"))).unwrap();
        assert_eq!(cfg.artifact_endpoint, DEFAULT_ARTIFACT_ENDPOINT);
    }
}
