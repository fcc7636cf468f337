//! Application configuration, loadable from TOML.
//!
//! ```
//! let config = webx::Config::from_toml_str(r#"
//!     address = "0.0.0.0:3000"
//!     request_timeout_ms = 5000
//!
//!     [session]
//!     engine = "memory"
//!     name = "APPSID"
//! "#).unwrap();
//! assert_eq!(config.session.name, "APPSID");
//! assert_eq!(config.render.default_tmpl, "index");
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::render::RenderConfig;
use crate::session::SessionOptions;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Settings for an [`App`](crate::App) and the built-in server. Every field
/// has a default, so a config file only lists what it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen address for [`Server::serve`](crate::server::Server::serve).
    pub address: String,
    /// Surface raw error text in error responses.
    pub debug: bool,
    /// Per-request deadline in milliseconds; `0` disables it.
    pub request_timeout_ms: u64,
    pub session: SessionOptions,
    pub render: RenderConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8080".to_owned(),
            debug: false,
            request_timeout_ms: 0,
            session: SessionOptions::default(),
            render: RenderConfig::default(),
        }
    }
}

impl Config {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml_str(&source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_source_gives_defaults() {
        assert_eq!(Config::from_toml_str("").unwrap(), Config::default());
    }

    #[test]
    fn nested_sections_override_fields() {
        let config = Config::from_toml_str(
            r#"
            debug = true
            [session]
            max_age = -1
            secure = true
            [render]
            default_error_tmpl = "error"
            "#,
        )
        .unwrap();
        assert!(config.debug);
        assert_eq!(config.session.max_age, -1);
        assert!(config.session.secure);
        assert_eq!(config.session.name, "SID");
        assert_eq!(config.render.default_error_tmpl, "error");
    }

    #[test]
    fn wrong_types_are_rejected() {
        assert!(matches!(
            Config::from_toml_str("debug = \"yes\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "address = \"0.0.0.0:9000\"").unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.address, "0.0.0.0:9000");

        assert!(matches!(
            Config::from_file("/definitely/not/here.toml"),
            Err(ConfigError::Read { .. })
        ));
    }
}
