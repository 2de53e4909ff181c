//! Start-up configuration for the binding.
//!
//! The host passes a JSON object once when the module is initialised. Every
//! field is optional:
//!
//! ```json
//! {
//!   "mode": "development",
//!   "defaultDirectory": "/var/lib/app",
//!   "logFilter": "couchbase_lite_node=trace",
//!   "readChunkSize": 1024,
//!   "replyPollMillis": 50
//! }
//! ```

use std::time::Duration;

use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use crate::error::{BindingError, BindingResult};

pub const DEFAULT_READ_CHUNK_SIZE: usize = 1024;
pub const DEFAULT_REPLY_POLL_MILLIS: u64 = 50;

/// Deployment mode. Only affects the default log filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    #[serde(alias = "dev")]
    Development,
    Test,
    #[serde(alias = "prod")]
    Production,
}

impl Mode {
    pub fn default_log_filter(self) -> &'static str {
        match self {
            Mode::Development => "couchbase_lite_node=debug",
            Mode::Test => "couchbase_lite_node=warn",
            Mode::Production => "couchbase_lite_node=error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct BindingConfig {
    pub mode: Mode,
    /// Directory used by `openDatabase` when the caller names none.
    pub default_directory: Option<String>,
    /// Overrides the mode's log filter. `EnvFilter` directive syntax.
    pub log_filter: Option<String>,
    /// Bytes returned by `readBlobReader` when the caller asks for 0.
    pub read_chunk_size: usize,
    /// How often a native thread waiting on a host callback checks that the
    /// listener is still alive.
    pub reply_poll_millis: u64,
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            default_directory: None,
            log_filter: None,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            reply_poll_millis: DEFAULT_REPLY_POLL_MILLIS,
        }
    }
}

impl BindingConfig {
    pub fn from_json(value: serde_json::Value) -> BindingResult<Self> {
        let config: BindingConfig = match value {
            serde_json::Value::Null => BindingConfig::default(),
            value => serde_json::from_value(value).map_err(|e| BindingError::Config(e.to_string()))?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> BindingResult<()> {
        if self.read_chunk_size == 0 {
            return Err(BindingError::Config("readChunkSize must be greater than 0".into()));
        }
        if self.reply_poll_millis == 0 {
            return Err(BindingError::Config("replyPollMillis must be greater than 0".into()));
        }
        if let Some(dir) = &self.default_directory {
            if dir.is_empty() {
                return Err(BindingError::Config("defaultDirectory must not be empty".into()));
            }
        }
        Ok(())
    }

    pub fn reply_poll(&self) -> Duration {
        Duration::from_millis(self.reply_poll_millis)
    }

    pub fn log_filter(&self) -> &str {
        self.log_filter
            .as_deref()
            .unwrap_or_else(|| self.mode.default_log_filter())
    }
}

/// Install the global tracing subscriber.
///
/// Returns `false` if a subscriber was already installed, which is not an
/// error: the embedding application's subscriber wins.
pub fn init_logging(config: &BindingConfig) -> BindingResult<bool> {
    let filter = EnvFilter::try_new(config.log_filter())
        .map_err(|e| BindingError::Config(format!("invalid logFilter: {}", e)))?;
    Ok(tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_apply_to_missing_fields() {
        let config = BindingConfig::from_json(json!({})).unwrap();
        assert_eq!(config, BindingConfig::default());
        assert_eq!(config.read_chunk_size, 1024);
        assert_eq!(config.reply_poll(), Duration::from_millis(50));
        assert_eq!(BindingConfig::from_json(serde_json::Value::Null).unwrap(), config);
    }

    #[test]
    fn mode_aliases() {
        let config = BindingConfig::from_json(json!({"mode": "prod"})).unwrap();
        assert_eq!(config.mode, Mode::Production);
        assert_eq!(config.log_filter(), "couchbase_lite_node=error");

        let config =
            BindingConfig::from_json(json!({"mode": "dev", "logFilter": "trace"})).unwrap();
        assert_eq!(config.mode, Mode::Development);
        assert_eq!(config.log_filter(), "trace");
    }

    #[test]
    fn invalid_values_are_config_errors() {
        for bad in [
            json!({"readChunkSize": 0}),
            json!({"replyPollMillis": 0}),
            json!({"mode": "staging"}),
            json!({"defaultDirectory": ""}),
            json!({"unknownField": true}),
            json!("production"),
        ] {
            let err = BindingConfig::from_json(bad.clone()).unwrap_err();
            assert_eq!(err.code(), "ERR_CONFIG", "{}", bad);
        }
    }

    #[test]
    fn bad_log_filter_is_rejected() {
        let config = BindingConfig {
            log_filter: Some("couchbase_lite_node=loud".into()),
            ..BindingConfig::default()
        };
        assert!(init_logging(&config).is_err());
    }
}
