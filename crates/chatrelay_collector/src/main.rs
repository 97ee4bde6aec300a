#![forbid(unsafe_code)]

mod config;
mod store;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use chatrelay_domain::{ChannelName, ConnectionSignal};
use chatrelay_platform::SecretString;
use chatrelay_platform::auth::{
	ACCESS_TOKEN_KEY, CredentialStore, REFRESH_TOKEN_KEY, TokenManager, TokenState, TwitchIdentityApi,
};
use chatrelay_platform::irc::{Engine, EngineConfig};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::store::EnvFileStore;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: chatrelay_collector [--config path] [--channels a,b,c]\n\
\n\
Options:\n\
\t--config    Config file path (default: ~/.chatrelay/config.toml)\n\
\t--channels  Comma-separated channel logins to join\n\
\t--help      Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	config_path: Option<PathBuf>,
	channels: Vec<String>,
}

fn parse_args() -> Args {
	let mut args = Args {
		config_path: None,
		channels: Vec::new(),
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				args.config_path = Some(PathBuf::from(v));
			}
			"--channels" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.channels = v
					.split(',')
					.map(|c| c.trim().to_string())
					.filter(|c| !c.is_empty())
					.collect();
				if args.channels.is_empty() {
					eprintln!("--channels must name at least one channel");
					usage_and_exit();
				}
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,chatrelay_collector=debug".to_string());

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.init();
}

/// Build the token manager when refresh credentials are configured;
/// `None` falls back to an anonymous read-only connection.
fn build_token_manager(cfg: &config::CollectorConfig, store: Arc<EnvFileStore>) -> anyhow::Result<Option<TokenManager>> {
	let (Some(client_id), Some(client_secret)) = (cfg.twitch.client_id.clone(), cfg.twitch.client_secret.clone()) else {
		info!("no twitch client credentials configured; connecting anonymously");
		return Ok(None);
	};

	// The credential file wins over the config: it holds whatever the
	// last refresh rotated in.
	let access_token = store
		.read(ACCESS_TOKEN_KEY)?
		.map(SecretString::new)
		.or_else(|| cfg.twitch.access_token.clone());
	let refresh_token = store
		.read(REFRESH_TOKEN_KEY)?
		.map(SecretString::new)
		.or_else(|| cfg.twitch.refresh_token.clone());

	let Some(refresh_token) = refresh_token else {
		warn!("twitch client credentials configured but no refresh token found; connecting anonymously");
		return Ok(None);
	};

	let api = TwitchIdentityApi::new(client_id, client_secret)?;
	let state = TokenState::from_persisted(access_token.unwrap_or_else(|| SecretString::new("")), refresh_token);
	Ok(Some(TokenManager::new(Arc::new(api), store, state)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = match args.config_path {
		Some(p) => p,
		None => config::default_config_path()?,
	};
	let mut cfg = config::load_collector_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded collector config (toml + env overrides)");

	if !args.channels.is_empty() {
		cfg.channels = args.channels;
	}
	if cfg.channels.is_empty() {
		anyhow::bail!("no channels configured (set [collector].channels or pass --channels)");
	}

	let channels = cfg
		.channels
		.iter()
		.map(|c| ChannelName::new(c).with_context(|| format!("invalid channel name {c:?}")))
		.collect::<anyhow::Result<Vec<_>>>()?;

	let store = Arc::new(EnvFileStore::new(cfg.env_file.clone()));
	let tokens = build_token_manager(&cfg, store)?;

	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	let mut validation_timer = None;

	if let Some(tokens) = &tokens {
		// Validate before dialing so a stale pair is repaired up front.
		tokens.validate_now().await.context("startup token validation")?;
		validation_timer = Some(tokens.spawn_validation_timer(shutdown_rx.clone()));
	}

	let mut engine_cfg = EngineConfig::new(channels);
	engine_cfg.tokens = tokens;
	if let Some(ws_url) = cfg.ws_url {
		engine_cfg.ws_url = ws_url;
	}
	if let Some(nick) = cfg.nick {
		engine_cfg.nick = nick;
	}
	if let Some(min) = cfg.reconnect_min_delay {
		engine_cfg.reconnect_min_delay = min;
	}
	if let Some(max) = cfg.reconnect_max_delay {
		engine_cfg.reconnect_max_delay = max;
	}
	if let Some(attempts) = cfg.max_reconnect_attempts {
		engine_cfg.max_reconnect_attempts = attempts;
	}
	if let Some(timeout) = cfg.liveness_timeout {
		engine_cfg.liveness_timeout = timeout;
	}

	let (engine, handle) = Engine::new(engine_cfg);
	let engine = engine
		.on_chat(|chat| {
			info!(
				channel = %chat.channel,
				sender = %chat.sender_login,
				bits = chat.bits,
				text = %chat.text,
				"chat"
			);
		})
		.on_deleted(|deleted| {
			info!(
				channel = %deleted.channel,
				message_id = deleted.message_id.as_deref().unwrap_or("<unknown>"),
				"message deleted"
			);
		})
		.on_moderated(|moderated| {
			info!(
				channel = %moderated.channel,
				target = %moderated.target_login,
				permanent = moderated.is_permanent(),
				duration_secs = moderated.duration.map(|d| d.as_secs()),
				"user moderated"
			);
		})
		.on_signal(|signal| match signal {
			ConnectionSignal::Notice(text) => info!(notice = %text, "server notice"),
			other => debug!(signal = ?other, "connection signal"),
		});

	let mut run = tokio::spawn(engine.run());

	let outcome = tokio::select! {
		res = &mut run => res.context("engine task")?,
		_ = tokio::signal::ctrl_c() => {
			info!("shutdown requested");
			handle.stop().await;
			run.await.context("engine task")?
		}
	};

	let _ = shutdown_tx.send(true);
	if let Some(timer) = validation_timer {
		let _ = timer.await;
	}

	outcome.context("connection engine")
}
