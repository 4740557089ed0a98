//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and `#[serde(default)]`
//! so a settings file may contain any subset of fields.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// Loaded from `~/.khplayer/settings.json` with defaults applied for
/// missing fields. Environment variables can override specific values.
///
/// ```json
/// {
///   "obs": { "host": "studio.local", "password": "hunter2" },
///   "logging": { "level": "info" }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KhpSettings {
    /// Settings schema version.
    pub version: String,
    /// Application name.
    pub name: String,
    /// obs-websocket connection settings.
    pub obs: ObsSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl Default for KhpSettings {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            name: "khplayer".to_string(),
            obs: ObsSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl KhpSettings {
    /// Reject values the client cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.obs.host.trim().is_empty() {
            return Err(SettingsError::InvalidValue("obs.host is empty".into()));
        }
        if self.obs.port == 0 {
            return Err(SettingsError::InvalidValue("obs.port must not be 0".into()));
        }
        if self.obs.request_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "obs.requestTimeoutMs must not be 0".into(),
            ));
        }
        Ok(())
    }
}

/// Connection settings for the obs-websocket server.
///
/// Matches the `OBS_WEBSOCKET = {hostname, port, password}` block of the
/// web application's config, plus client tuning.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObsSettings {
    /// Host name or address of the machine running OBS.
    pub host: String,
    /// obs-websocket port.
    pub port: u16,
    /// Server password, if authentication is enabled in OBS.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// How long a request waits for its response, in milliseconds.
    pub request_timeout_ms: u64,
    /// Event subscription bitmask sent in `Identify`.
    pub event_subscriptions: u32,
}

impl Default for ObsSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 4455,
            password: None,
            request_timeout_ms: 10_000,
            event_subscriptions: 0x7FF,
        }
    }
}

impl fmt::Debug for ObsSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObsSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("event_subscriptions", &self.event_subscriptions)
            .finish()
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn obs_defaults_match_stock_obs() {
        let obs = ObsSettings::default();
        assert_eq!(obs.host, "localhost");
        assert_eq!(obs.port, 4455);
        assert!(obs.password.is_none());
        assert_eq!(obs.request_timeout_ms, 10_000);
        assert_eq!(obs.event_subscriptions, 0x7FF);
    }

    #[test]
    fn password_omitted_when_none() {
        let json = serde_json::to_value(ObsSettings::default()).unwrap();
        assert!(json.get("password").is_none());
        assert_eq!(json["requestTimeoutMs"], 10_000);
    }

    #[test]
    fn debug_redacts_password() {
        let obs = ObsSettings {
            password: Some("hunter2".into()),
            ..ObsSettings::default()
        };
        let debug = format!("{obs:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn validate_accepts_defaults() {
        KhpSettings::default().validate().unwrap();
    }

    #[test]
    fn validate_rejects_zero_port() {
        let mut settings = KhpSettings::default();
        settings.obs.port = 0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("obs.port"));
    }

    #[test]
    fn validate_rejects_blank_host() {
        let mut settings = KhpSettings::default();
        settings.obs.host = "  ".into();
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::InvalidValue(_))
        ));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let settings: KhpSettings =
            serde_json::from_str(r#"{"obs": {"port": 4444}}"#).unwrap();
        assert_eq!(settings.obs.port, 4444);
        assert_eq!(settings.obs.host, "localhost");
        assert_eq!(settings.logging.level, "warn");
    }
}
