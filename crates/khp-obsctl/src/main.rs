//! # obsctl
//!
//! Command-line client for OBS: send one raw request, send a batch, or watch
//! events. Connection settings come from `~/.khplayer/settings.json`, `KHP_*`
//! environment variables and the flags below, in increasing priority.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use khp_logging::LogFormat;
use khp_obs::protocol::subscription;
use khp_obs::{BatchItem, BatchMode, ConnectionState, Endpoint, Event, Session, SessionConfig};
use khp_settings::{KhpSettings, ObsSettings};
use serde_json::Value;
use tracing::info;

/// How often `events` checks whether the connection is still up.
const EVENTS_POLL: Duration = Duration::from_millis(250);

/// Send requests to OBS over obs-websocket.
#[derive(Parser, Debug)]
#[command(name = "obsctl", about = "Send requests to OBS over obs-websocket")]
struct Cli {
    /// Settings file (default `~/.khplayer/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// OBS host (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// obs-websocket port (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Request timeout in milliseconds (overrides settings).
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Log filter when `RUST_LOG` is unset (overrides settings).
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send one request and print the response.
    Request {
        /// Request type, e.g. `GetSceneList`.
        request_type: String,
        /// Request data as a JSON object.
        data: Option<String>,
    },
    /// Send several requests as one batch and print every result.
    Batch {
        /// `halt`, `continue` or `parallel`.
        #[arg(long, default_value = "halt")]
        mode: BatchMode,
        /// Items as `Type` or `Type={json}`.
        #[arg(required = true)]
        items: Vec<String>,
    },
    /// Print events until the connection drops.
    Events {
        /// Category names (`Scenes`, `Outputs`, ...) or event types. Every
        /// named category when empty.
        categories: Vec<String>,
    },
}

impl Cli {
    fn apply_overrides(&self, settings: &mut KhpSettings) {
        if let Some(host) = &self.host {
            settings.obs.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.obs.port = port;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            settings.obs.request_timeout_ms = timeout_ms;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
    }
}

fn load_settings(cli: &Cli) -> Result<KhpSettings> {
    let mut settings = match &cli.config {
        Some(path) => khp_settings::load_settings_from_path(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => khp_settings::load_settings().context("failed to load settings")?,
    };
    cli.apply_overrides(&mut settings);
    settings.validate().context("invalid settings")?;
    Ok(settings)
}

fn session_config(obs: &ObsSettings) -> SessionConfig {
    let mut config = SessionConfig::new(Endpoint::new(obs.host.clone(), obs.port))
        .with_request_timeout(Duration::from_millis(obs.request_timeout_ms))
        .with_event_subscriptions(obs.event_subscriptions);
    if let Some(password) = &obs.password {
        config = config.with_password(password.clone());
    }
    config
}

fn parse_data(text: Option<&str>) -> Result<Value> {
    match text {
        None => Ok(Value::Null),
        Some(text) => {
            let value: Value =
                serde_json::from_str(text).with_context(|| format!("invalid JSON: {text}"))?;
            if !value.is_object() {
                bail!("request data must be a JSON object, got: {text}");
            }
            Ok(value)
        }
    }
}

fn parse_item(spec: &str) -> Result<BatchItem> {
    let (request_type, data) = match spec.split_once('=') {
        Some((request_type, data)) => (request_type, Some(data)),
        None => (spec, None),
    };
    if request_type.is_empty() {
        bail!("batch item has no request type: {spec}");
    }
    Ok(BatchItem::new(request_type, parse_data(data)?))
}

/// Categories to watch, and the subscription mask that delivers them.
fn watch_plan(categories: Vec<String>, configured_mask: u32) -> (Vec<String>, u32) {
    if categories.is_empty() {
        let all = subscription::CATEGORIES
            .iter()
            .filter(|(_, bit)| subscription::ALL & bit != 0)
            .map(|(name, _)| (*name).to_string())
            .collect();
        return (all, configured_mask | subscription::ALL);
    }
    let mask = categories
        .iter()
        .filter_map(|name| subscription::category_bit(name))
        .fold(configured_mask, |mask, bit| mask | bit);
    (categories, mask)
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run_request(session: &Session, request_type: &str, data: Option<&str>) -> Result<()> {
    let data = parse_data(data)?;
    let response = session
        .send(request_type, data)
        .with_context(|| format!("{request_type} failed"))?;
    print_json(&response)
}

fn run_batch(session: &Session, mode: BatchMode, items: &[String]) -> Result<()> {
    let items = items
        .iter()
        .map(|spec| parse_item(spec))
        .collect::<Result<Vec<_>>>()?;
    let results = session.send_batch(&items, mode).context("batch failed")?;
    let failed = results.iter().filter(|r| !r.is_success()).count();
    print_json(&results)?;
    if failed > 0 {
        bail!("{failed} of {} batch items failed", results.len());
    }
    Ok(())
}

fn run_events(session: &Session, categories: &[String]) -> Result<()> {
    for category in categories {
        let _ = session.subscribe(category.clone(), |event: &Event| {
            match serde_json::to_string(event) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::warn!(error = %e, "cannot print event"),
            }
            Ok(())
        });
    }
    session.connect().context("cannot connect to OBS")?;
    info!(categories = categories.len(), "watching events");

    while session.state() == ConnectionState::Ready {
        thread::sleep(EVENTS_POLL);
    }
    bail!("connection to OBS closed")
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = load_settings(&cli)?;

    let format = if settings.logging.json {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };
    khp_logging::init_subscriber(&settings.logging.level, format);

    match &cli.command {
        Command::Request { request_type, data } => {
            let session = Session::websocket(session_config(&settings.obs))?;
            run_request(&session, request_type, data.as_deref())
        }
        Command::Batch { mode, items } => {
            let session = Session::websocket(session_config(&settings.obs))?;
            run_batch(&session, *mode, items)
        }
        Command::Events { categories } => {
            let (categories, mask) =
                watch_plan(categories.clone(), settings.obs.event_subscriptions);
            settings.obs.event_subscriptions = mask;
            let session = Session::websocket(session_config(&settings.obs))?;
            run_events(&session, &categories)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_request_command() {
        let cli = Cli::parse_from([
            "obsctl",
            "--host",
            "studio",
            "request",
            "CreateScene",
            r#"{"sceneName": "Song"}"#,
        ]);
        assert_eq!(cli.host.as_deref(), Some("studio"));
        match cli.command {
            Command::Request { request_type, data } => {
                assert_eq!(request_type, "CreateScene");
                assert!(data.unwrap().contains("Song"));
            }
            other => panic!("expected Request, got {other:?}"),
        }
    }

    #[test]
    fn parse_batch_command() {
        let cli = Cli::parse_from([
            "obsctl",
            "batch",
            "--mode",
            "parallel",
            "GetVersion",
            "GetStats",
        ]);
        match cli.command {
            Command::Batch { mode, items } => {
                assert_eq!(mode, BatchMode::Parallel);
                assert_eq!(items, vec!["GetVersion", "GetStats"]);
            }
            other => panic!("expected Batch, got {other:?}"),
        }
    }

    #[test]
    fn batch_mode_defaults_to_halt() {
        let cli = Cli::parse_from(["obsctl", "batch", "GetVersion"]);
        assert!(matches!(
            cli.command,
            Command::Batch {
                mode: BatchMode::HaltOnFailure,
                ..
            }
        ));
    }

    #[test]
    fn batch_requires_items() {
        assert!(Cli::try_parse_from(["obsctl", "batch"]).is_err());
        assert!(Cli::try_parse_from(["obsctl", "batch", "--mode", "maybe", "X"]).is_err());
    }

    #[test]
    fn flags_override_settings() {
        let cli = Cli::parse_from([
            "obsctl",
            "--port",
            "4444",
            "--timeout-ms",
            "500",
            "--log-level",
            "debug",
            "events",
        ]);
        let mut settings = KhpSettings::default();
        cli.apply_overrides(&mut settings);
        assert_eq!(settings.obs.port, 4444);
        assert_eq!(settings.obs.host, "localhost");
        assert_eq!(settings.obs.request_timeout_ms, 500);
        assert_eq!(settings.logging.level, "debug");
    }

    #[test]
    fn load_settings_from_config_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"obs": {"host": "booth", "port": 4460}}"#).unwrap();
        let cli = Cli::parse_from([
            "obsctl",
            "--config",
            path.to_str().unwrap(),
            "--port",
            "4470",
            "events",
        ]);
        let settings = load_settings(&cli).unwrap();
        assert_eq!(settings.obs.host, "booth");
        assert_eq!(settings.obs.port, 4470);
    }

    #[test]
    fn session_config_from_settings() {
        let obs = ObsSettings {
            host: "booth".into(),
            port: 4460,
            password: Some("pw".into()),
            request_timeout_ms: 1500,
            event_subscriptions: subscription::SCENES,
        };
        let config = session_config(&obs);
        assert_eq!(config.endpoint.url(), "ws://booth:4460");
        assert_eq!(config.password.as_deref(), Some("pw"));
        assert_eq!(config.request_timeout, Duration::from_millis(1500));
        assert_eq!(config.event_subscriptions, subscription::SCENES);
    }

    #[test]
    fn parse_items() {
        let item = parse_item(r#"SetCurrentProgramScene={"sceneName":"Song"}"#).unwrap();
        assert_eq!(item.request_type, "SetCurrentProgramScene");
        assert_eq!(item.request_data["sceneName"], "Song");

        let bare = parse_item("GetSceneList").unwrap();
        assert!(bare.request_data.is_null());

        assert!(parse_item("=").is_err());
        assert!(parse_item("X={not json}").is_err());
        assert!(parse_item("X=[1]").is_err());
    }

    #[test]
    fn watch_plan_defaults_to_named_categories() {
        let (categories, mask) = watch_plan(Vec::new(), 0);
        assert_eq!(categories.len(), 11);
        assert!(categories.contains(&"Scenes".to_string()));
        assert!(!categories.contains(&"InputVolumeMeters".to_string()));
        assert_eq!(mask, subscription::ALL);
    }

    #[test]
    fn watch_plan_adds_high_volume_bits() {
        let (categories, mask) = watch_plan(
            vec!["InputVolumeMeters".into(), "StreamStateChanged".into()],
            subscription::ALL,
        );
        assert_eq!(categories.len(), 2);
        assert_eq!(mask, subscription::ALL | subscription::INPUT_VOLUME_METERS);
    }
}
