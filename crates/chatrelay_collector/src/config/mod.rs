#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use chatrelay_platform::SecretString;
use serde::Deserialize;
use tracing::{info, warn};

/// Default config path: `~/.chatrelay/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".chatrelay").join("config.toml"))
}

/// Default credential file path: `~/.chatrelay/credentials.env`.
fn default_env_file() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".chatrelay").join("credentials.env"))
}

/// Load the collector config from TOML and env overrides.
pub fn load_collector_config_from_path(path: &Path) -> anyhow::Result<CollectorConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = CollectorConfig::from_file(file_cfg)?;

	apply_env_overrides(&mut cfg);

	if let (Some(min), Some(max)) = (cfg.reconnect_min_delay, cfg.reconnect_max_delay)
		&& min > max
	{
		warn!(
			min_ms = min.as_millis(),
			max_ms = max.as_millis(),
			"collector config: reconnect_min_delay > reconnect_max_delay; swapping"
		);
		cfg.reconnect_min_delay = Some(max);
		cfg.reconnect_max_delay = Some(min);
	}

	Ok(cfg)
}

/// Collector config (v1).
#[derive(Debug, Clone)]
pub struct CollectorConfig {
	/// Channel logins to join (`#` prefix optional).
	pub channels: Vec<String>,
	/// Nick used for the handshake; anonymous default when unset.
	pub nick: Option<String>,
	/// Chat relay websocket URL (optional override).
	pub ws_url: Option<String>,
	/// Reconnect backoff min/max (optional).
	pub reconnect_min_delay: Option<Duration>,
	pub reconnect_max_delay: Option<Duration>,
	/// Give up after this many consecutive failed attempts.
	pub max_reconnect_attempts: Option<u32>,
	/// Reconnect after this long without inbound traffic.
	pub liveness_timeout: Option<Duration>,
	/// Credential file rewritten when tokens rotate.
	pub env_file: PathBuf,
	pub twitch: TwitchSettings,
}

/// Twitch OAuth settings loaded by the collector.
#[derive(Debug, Clone, Default)]
pub struct TwitchSettings {
	pub client_id: Option<String>,
	pub client_secret: Option<SecretString>,
	/// Seed tokens; the credential file takes precedence once it
	/// exists.
	pub access_token: Option<SecretString>,
	pub refresh_token: Option<SecretString>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	collector: FileCollectorSettings,

	#[serde(default)]
	twitch: FileTwitchSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileCollectorSettings {
	#[serde(default)]
	channels: Vec<String>,
	nick: Option<String>,
	ws_url: Option<String>,
	reconnect_min_delay_ms: Option<u64>,
	reconnect_max_delay_ms: Option<u64>,
	max_reconnect_attempts: Option<u32>,
	liveness_timeout_secs: Option<u64>,
	env_file: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTwitchSettings {
	client_id: Option<String>,
	client_secret: Option<String>,
	access_token: Option<String>,
	refresh_token: Option<String>,
}

impl CollectorConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let env_file = match file.collector.env_file.filter(|s| !s.trim().is_empty()) {
			Some(p) => PathBuf::from(p),
			None => default_env_file()?,
		};

		Ok(Self {
			channels: file
				.collector
				.channels
				.into_iter()
				.map(|c| c.trim().to_string())
				.filter(|c| !c.is_empty())
				.collect(),
			nick: file.collector.nick.filter(|s| !s.trim().is_empty()),
			ws_url: file.collector.ws_url.filter(|s| !s.trim().is_empty()),
			reconnect_min_delay: file.collector.reconnect_min_delay_ms.map(Duration::from_millis),
			reconnect_max_delay: file.collector.reconnect_max_delay_ms.map(Duration::from_millis),
			max_reconnect_attempts: file.collector.max_reconnect_attempts,
			liveness_timeout: file.collector.liveness_timeout_secs.map(Duration::from_secs),
			env_file,
			twitch: TwitchSettings {
				client_id: file.twitch.client_id.filter(|s| !s.trim().is_empty()),
				client_secret: file
					.twitch
					.client_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				access_token: file
					.twitch
					.access_token
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				refresh_token: file
					.twitch
					.refresh_token
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
			},
		})
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut CollectorConfig) {
	if let Ok(v) = std::env::var("CHATRELAY_CHANNELS") {
		let channels: Vec<String> = v
			.split(',')
			.map(|c| c.trim().to_string())
			.filter(|c| !c.is_empty())
			.collect();
		if !channels.is_empty() {
			cfg.channels = channels;
			info!("collector config: channels overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CHATRELAY_NICK") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.nick = Some(v);
			info!("collector config: nick overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CHATRELAY_WS_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.ws_url = Some(v);
			info!("collector config: ws_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CHATRELAY_ENV_FILE") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.env_file = PathBuf::from(v);
			info!("collector config: env_file overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CHATRELAY_RECONNECT_MIN_DELAY_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
	{
		cfg.reconnect_min_delay = Some(Duration::from_millis(ms));
		info!(ms, "collector config: reconnect_min_delay overridden by env");
	}

	if let Ok(v) = std::env::var("CHATRELAY_RECONNECT_MAX_DELAY_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
	{
		cfg.reconnect_max_delay = Some(Duration::from_millis(ms));
		info!(ms, "collector config: reconnect_max_delay overridden by env");
	}

	if let Ok(v) = std::env::var("CHATRELAY_MAX_RECONNECT_ATTEMPTS")
		&& let Ok(attempts) = v.trim().parse::<u32>()
	{
		cfg.max_reconnect_attempts = Some(attempts);
		info!(attempts, "collector config: max_reconnect_attempts overridden by env");
	}

	if let Ok(v) = std::env::var("CHATRELAY_LIVENESS_TIMEOUT_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.liveness_timeout = Some(Duration::from_secs(secs));
		info!(secs, "collector config: liveness_timeout overridden by env");
	}

	if let Ok(v) = std::env::var("CHATRELAY_TWITCH_CLIENT_ID") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.twitch.client_id = Some(v);
			info!("twitch config: client_id overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CHATRELAY_TWITCH_CLIENT_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.twitch.client_secret = Some(SecretString::new(v));
			info!("twitch config: client_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CHATRELAY_TWITCH_ACCESS_TOKEN") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.twitch.access_token = Some(SecretString::new(v));
			info!("twitch config: access_token overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CHATRELAY_TWITCH_REFRESH_TOKEN") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.twitch.refresh_token = Some(SecretString::new(v));
			info!("twitch config: refresh_token overridden by env");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn file_config_parses_all_sections() {
		let toml = r#"
			[collector]
			channels = ["demo", " #other "]
			nick = "collector"
			ws_url = "wss://localhost:4443"
			reconnect_min_delay_ms = 250
			reconnect_max_delay_ms = 15000
			max_reconnect_attempts = 3
			liveness_timeout_secs = 120
			env_file = "/tmp/creds.env"

			[twitch]
			client_id = "abc"
			client_secret = "shh"
			access_token = "tok"
			refresh_token = "ref"
		"#;

		let file: FileConfig = toml::from_str(toml).expect("parse");
		let cfg = CollectorConfig::from_file(file).expect("from_file");

		assert_eq!(cfg.channels, vec!["demo".to_string(), "#other".to_string()]);
		assert_eq!(cfg.nick.as_deref(), Some("collector"));
		assert_eq!(cfg.ws_url.as_deref(), Some("wss://localhost:4443"));
		assert_eq!(cfg.reconnect_min_delay, Some(Duration::from_millis(250)));
		assert_eq!(cfg.reconnect_max_delay, Some(Duration::from_millis(15000)));
		assert_eq!(cfg.max_reconnect_attempts, Some(3));
		assert_eq!(cfg.liveness_timeout, Some(Duration::from_secs(120)));
		assert_eq!(cfg.env_file, PathBuf::from("/tmp/creds.env"));
		assert_eq!(cfg.twitch.client_id.as_deref(), Some("abc"));
		assert_eq!(cfg.twitch.client_secret.as_ref().map(|s| s.expose()), Some("shh"));
	}

	#[test]
	fn empty_strings_collapse_to_none() {
		let toml = r#"
			[collector]
			channels = ["", "  "]
			nick = ""

			[twitch]
			client_id = " "
		"#;

		let file: FileConfig = toml::from_str(toml).expect("parse");
		let cfg = CollectorConfig::from_file(file).expect("from_file");

		assert!(cfg.channels.is_empty());
		assert!(cfg.nick.is_none());
		assert!(cfg.twitch.client_id.is_none());
	}
}
