//! Service Configuration Settings
//!
//! Configuration types for the stream consumer, loaded from environment
//! variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::application::services::CoordinatorConfig;
use crate::domain::quota::QuotaConfig;
use crate::infrastructure::cardata::{
    AuthError, BackoffConfig, Credentials, StreamManagerConfig, stream,
};

/// rumqttc rejects keepalives below this.
const MIN_KEEPALIVE_SECS: u64 = 5;

/// Streaming broker settings.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Broker host.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// MQTT keepalive.
    pub keepalive: Duration,
    /// Wait limit for the first CONNACK.
    pub connect_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            host: stream::DEFAULT_STREAM_HOST.to_string(),
            port: stream::DEFAULT_STREAM_PORT,
            keepalive: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(30),
            reconnect_delay_initial: Duration::from_secs(5),
            reconnect_delay_max: Duration::from_secs(300),
        }
    }
}

/// State persistence and housekeeping settings.
#[derive(Debug, Clone)]
pub struct StateSettings {
    /// Directory holding the quota log and descriptor snapshot.
    pub state_dir: PathBuf,
    /// Watchdog tick for SOC extrapolation and diagnostics.
    pub diagnostic_interval: Duration,
}

impl Default for StateSettings {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("./data"),
            diagnostic_interval: Duration::from_secs(60),
        }
    }
}

impl StateSettings {
    /// Quota request log.
    #[must_use]
    pub fn request_log_path(&self) -> PathBuf {
        self.state_dir.join("request_log.json")
    }

    /// Descriptor and SOC snapshot.
    #[must_use]
    pub fn descriptor_state_path(&self) -> PathBuf {
        self.state_dir.join("descriptor_state.json")
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health check HTTP port (0 = disabled).
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Complete service configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Stream credentials.
    pub credentials: Credentials,
    /// Broker settings.
    pub stream: StreamSettings,
    /// API quota limits.
    pub quota: QuotaConfig,
    /// Persistence settings.
    pub state: StateSettings,
    /// Server port settings.
    pub server: ServerSettings,
    /// Verbose logging for every component.
    pub debug_log: bool,
}

impl AppConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or a
    /// value cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Same as [`Self::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);

        let gcid = env.required("CARDATA_GCID")?;
        let id_token = env.required("CARDATA_ID_TOKEN")?;
        let credentials = Credentials::new(gcid, id_token).map_err(|e| match e {
            AuthError::EmptyGcid => ConfigError::EmptyValue("CARDATA_GCID".to_string()),
            AuthError::EmptyIdToken => ConfigError::EmptyValue("CARDATA_ID_TOKEN".to_string()),
        })?;

        let defaults = StreamSettings::default();
        let keepalive = env.secs("CARDATA_MQTT_KEEPALIVE_SECS", defaults.keepalive)?;
        if keepalive.as_secs() < MIN_KEEPALIVE_SECS {
            return Err(ConfigError::InvalidValue {
                key: "CARDATA_MQTT_KEEPALIVE_SECS".to_string(),
                value: keepalive.as_secs().to_string(),
            });
        }
        let stream = StreamSettings {
            host: env
                .optional("CARDATA_STREAM_HOST")
                .unwrap_or(defaults.host),
            port: env.parse("CARDATA_STREAM_PORT", defaults.port)?,
            keepalive,
            connect_timeout: env.secs("CARDATA_CONNECT_TIMEOUT_SECS", defaults.connect_timeout)?,
            reconnect_delay_initial: env.secs(
                "CARDATA_RECONNECT_DELAY_INITIAL_SECS",
                defaults.reconnect_delay_initial,
            )?,
            reconnect_delay_max: env.secs(
                "CARDATA_RECONNECT_DELAY_MAX_SECS",
                defaults.reconnect_delay_max,
            )?,
        };

        let quota_defaults = QuotaConfig::default();
        let quota = QuotaConfig {
            limit: env.parse("CARDATA_REQUEST_LIMIT", quota_defaults.limit)?,
            window_secs: env.parse("CARDATA_REQUEST_WINDOW_SECS", quota_defaults.window_secs)?,
        };

        let state_defaults = StateSettings::default();
        let state = StateSettings {
            state_dir: env
                .optional("CARDATA_STATE_DIR")
                .map_or(state_defaults.state_dir, PathBuf::from),
            diagnostic_interval: env.secs(
                "CARDATA_DIAGNOSTIC_INTERVAL_SECS",
                state_defaults.diagnostic_interval,
            )?,
        };

        let server = ServerSettings {
            health_port: env.parse("CARDATA_HEALTH_PORT", ServerSettings::default().health_port)?,
        };

        let debug_log = env
            .optional("CARDATA_DEBUG_LOG")
            .is_some_and(|v| parse_bool(&v));

        Ok(Self {
            credentials,
            stream,
            quota,
            state,
            server,
            debug_log,
        })
    }

    /// Stream manager configuration.
    #[must_use]
    pub fn stream_manager_config(&self) -> StreamManagerConfig {
        StreamManagerConfig {
            host: self.stream.host.clone(),
            port: self.stream.port,
            keepalive: self.stream.keepalive,
            connect_timeout: self.stream.connect_timeout,
            backoff: BackoffConfig::doubling(
                self.stream.reconnect_delay_initial,
                self.stream.reconnect_delay_max,
            ),
            debug_log: self.debug_log,
        }
    }

    /// State coordinator configuration.
    #[must_use]
    pub const fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            debug_log: self.debug_log,
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable cannot be parsed.
    #[error("environment variable {key} has invalid value {value:?}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Offending value.
        value: String,
    },
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Trimmed value; blank counts as unset.
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        let value = (self.0)(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))?;
        if value.trim().is_empty() {
            return Err(ConfigError::EmptyValue(key.to_string()));
        }
        Ok(value.trim().to_string())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.optional(key) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse::<u64>(key, default.as_secs())
            .map(Duration::from_secs)
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    const REQUIRED: [(&str, &str); 2] = [("CARDATA_GCID", "gcid-1"), ("CARDATA_ID_TOKEN", "token")];

    #[test]
    fn defaults_apply_when_only_credentials_set() {
        let config = load(&REQUIRED).unwrap();

        assert_eq!(config.credentials.gcid(), "gcid-1");
        assert_eq!(config.stream.host, "customer.streaming-cardata.bmwgroup.com");
        assert_eq!(config.stream.port, 9000);
        assert_eq!(config.stream.keepalive, Duration::from_secs(120));
        assert_eq!(config.stream.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.quota.limit, 50);
        assert!((config.quota.window_secs - 86_400.0).abs() < f64::EPSILON);
        assert_eq!(config.state.state_dir, PathBuf::from("./data"));
        assert_eq!(config.state.diagnostic_interval, Duration::from_secs(60));
        assert_eq!(config.server.health_port, 8083);
        assert!(!config.debug_log);
    }

    #[test]
    fn missing_credentials_are_reported() {
        assert!(matches!(
            load(&[("CARDATA_GCID", "gcid-1")]),
            Err(ConfigError::MissingEnvVar(key)) if key == "CARDATA_ID_TOKEN"
        ));
        assert!(matches!(
            load(&[("CARDATA_GCID", " "), ("CARDATA_ID_TOKEN", "token")]),
            Err(ConfigError::EmptyValue(key)) if key == "CARDATA_GCID"
        ));
    }

    #[test]
    fn overrides_are_parsed() {
        let mut vars = REQUIRED.to_vec();
        vars.extend([
            ("CARDATA_STREAM_HOST", "localhost"),
            ("CARDATA_STREAM_PORT", "8883"),
            ("CARDATA_RECONNECT_DELAY_INITIAL_SECS", "1"),
            ("CARDATA_RECONNECT_DELAY_MAX_SECS", "10"),
            ("CARDATA_REQUEST_LIMIT", "10"),
            ("CARDATA_REQUEST_WINDOW_SECS", "3600"),
            ("CARDATA_STATE_DIR", "/var/lib/cardata"),
            ("CARDATA_HEALTH_PORT", "0"),
            ("CARDATA_DEBUG_LOG", "TRUE"),
        ]);
        let config = load(&vars).unwrap();

        assert_eq!(config.stream.host, "localhost");
        assert_eq!(config.stream.port, 8883);
        assert_eq!(config.quota.limit, 10);
        assert_eq!(
            config.state.request_log_path(),
            PathBuf::from("/var/lib/cardata/request_log.json")
        );
        assert_eq!(config.server.health_port, 0);
        assert!(config.debug_log);

        let stream = config.stream_manager_config();
        assert_eq!(stream.backoff.initial_delay, Duration::from_secs(1));
        assert_eq!(stream.backoff.max_delay, Duration::from_secs(10));
        assert!(stream.debug_log);
        assert!(config.coordinator_config().debug_log);
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("CARDATA_STREAM_PORT", "ninety"));
        assert!(matches!(
            load(&vars),
            Err(ConfigError::InvalidValue { key, .. }) if key == "CARDATA_STREAM_PORT"
        ));

        let mut vars = REQUIRED.to_vec();
        vars.push(("CARDATA_MQTT_KEEPALIVE_SECS", "2"));
        assert!(matches!(
            load(&vars),
            Err(ConfigError::InvalidValue { key, .. }) if key == "CARDATA_MQTT_KEEPALIVE_SECS"
        ));
    }

    #[test]
    fn bool_parsing() {
        assert!(parse_bool("1"));
        assert!(parse_bool("yes"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("nope"));
    }

    #[test]
    fn debug_output_hides_token() {
        let config = load(&[("CARDATA_GCID", "gcid-1"), ("CARDATA_ID_TOKEN", "secret-token")])
            .unwrap();
        assert!(!format!("{config:?}").contains("secret-token"));
    }
}
