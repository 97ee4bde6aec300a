#![forbid(unsafe_code)]

use std::time::Duration;

use chatrelay_domain::{ChannelName, ChatEvent, ChatPosted, ConnectionSignal, MessageDeleted, UserModerated};
use chatrelay_protocol::{parse_line, translate};
use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use super::state::ConnectionState;
use super::transport::{BoxTransport, TransportConnector, WsTransport};
use crate::auth::{AuthError, TokenManager};

#[derive(Debug, Error)]
pub enum EngineError {
	#[error("invalid relay url {url:?}: {source}")]
	InvalidUrl {
		url: String,
		#[source]
		source: url::ParseError,
	},

	/// The reconnect ceiling was hit without a successful join.
	#[error("gave up after {attempts} consecutive failed connection attempts")]
	ReconnectExhausted { attempts: u32 },

	/// The credential could not be recovered; re-authentication is
	/// required.
	#[error(transparent)]
	Auth(#[from] AuthError),
}

/// Chat relay connection configuration.
#[derive(Clone)]
pub struct EngineConfig {
	pub ws_url: String,
	pub nick: String,
	pub channels: Vec<ChannelName>,
	/// `None` connects anonymously (read-only, no PASS).
	pub tokens: Option<TokenManager>,
	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,
	pub max_reconnect_attempts: u32,
	/// Reconnect when no inbound traffic arrives for this long. The
	/// relay pings every few minutes, so silence past this is a dead
	/// peer.
	pub liveness_timeout: Duration,
	pub connector: Option<TransportConnector>,
}

impl EngineConfig {
	pub fn new(channels: Vec<ChannelName>) -> Self {
		Self {
			ws_url: "wss://irc-ws.chat.twitch.tv:443".to_string(),
			nick: "justinfan12345".to_string(),
			channels,
			tokens: None,
			reconnect_min_delay: Duration::from_millis(500),
			reconnect_max_delay: Duration::from_secs(30),
			max_reconnect_attempts: 10,
			liveness_timeout: Duration::from_secs(360),
			connector: None,
		}
	}
}

enum ControlMsg {
	Shutdown,
}

/// Requests a running [`Engine`] to stop. Cheap to clone.
#[derive(Clone)]
pub struct EngineHandle {
	control_tx: mpsc::Sender<ControlMsg>,
}

impl EngineHandle {
	pub async fn stop(&self) {
		let _ = self.control_tx.send(ControlMsg::Shutdown).await;
	}
}

/// Why a session ended, decided by the read loop.
enum SessionEnd {
	Shutdown,
	/// Peer went away or asked us to move. Server-requested reconnects
	/// are orderly and do not count against the attempt ceiling.
	Reconnect { count_failure: bool },
	AuthRejected,
}

type Handler<T> = Box<dyn Fn(T) + Send + Sync>;

/// One logical connection to the chat relay: dials, authenticates,
/// joins the configured channels, and dispatches translated events to
/// the registered handlers until told to stop.
///
/// Handlers run synchronously on the read loop, so a slow handler
/// directly delays protocol handling (including PING replies). Keep
/// them cheap and hand heavy work to a channel.
pub struct Engine {
	cfg: EngineConfig,
	state: ConnectionState,
	/// Consecutive failed attempts; reset on a confirmed channel join.
	attempt: u32,
	control_rx: mpsc::Receiver<ControlMsg>,
	on_chat: Vec<Handler<ChatPosted>>,
	on_deleted: Vec<Handler<MessageDeleted>>,
	on_moderated: Vec<Handler<UserModerated>>,
	on_signal: Vec<Handler<ConnectionSignal>>,
}

impl Engine {
	pub fn new(cfg: EngineConfig) -> (Self, EngineHandle) {
		let (control_tx, control_rx) = mpsc::channel(8);
		let engine = Self {
			cfg,
			state: ConnectionState::Disconnected,
			attempt: 0,
			control_rx,
			on_chat: Vec::new(),
			on_deleted: Vec::new(),
			on_moderated: Vec::new(),
			on_signal: Vec::new(),
		};
		(engine, EngineHandle { control_tx })
	}

	pub fn on_chat(mut self, f: impl Fn(ChatPosted) + Send + Sync + 'static) -> Self {
		self.on_chat.push(Box::new(f));
		self
	}

	pub fn on_deleted(mut self, f: impl Fn(MessageDeleted) + Send + Sync + 'static) -> Self {
		self.on_deleted.push(Box::new(f));
		self
	}

	pub fn on_moderated(mut self, f: impl Fn(UserModerated) + Send + Sync + 'static) -> Self {
		self.on_moderated.push(Box::new(f));
		self
	}

	pub fn on_signal(mut self, f: impl Fn(ConnectionSignal) + Send + Sync + 'static) -> Self {
		self.on_signal.push(Box::new(f));
		self
	}

	pub(crate) fn backoff_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
		let pow = attempt.min(16);
		let ms = min.as_millis().saturating_mul(1u128 << pow);
		let d = Duration::from_millis(ms.min(u64::MAX as u128) as u64);
		d.min(max).max(min)
	}

	fn transition(&mut self, to: ConnectionState) {
		let from = self.state;
		if from == to {
			return;
		}
		debug_assert!(
			ConnectionState::is_legal_transition(from, to),
			"illegal connection state transition {from} -> {to}"
		);
		debug!(%from, %to, "connection state");
		self.state = to;
	}

	fn dispatch(&self, event: ChatEvent) {
		match event {
			ChatEvent::Chat(chat) => {
				for f in &self.on_chat {
					f(chat.clone());
				}
			}
			ChatEvent::Deleted(deleted) => {
				for f in &self.on_deleted {
					f(deleted.clone());
				}
			}
			ChatEvent::Moderated(moderated) => {
				for f in &self.on_moderated {
					f(moderated.clone());
				}
			}
			ChatEvent::Signal(signal) => {
				for f in &self.on_signal {
					f(signal.clone());
				}
			}
		}
	}

	fn connector(&self) -> TransportConnector {
		match &self.cfg.connector {
			Some(c) => c.clone(),
			None => WsTransport::connector(),
		}
	}

	/// Run until shutdown is requested, the reconnect ceiling is hit,
	/// or the credential is rejected beyond recovery.
	pub async fn run(mut self) -> Result<(), EngineError> {
		let url = Url::parse(&self.cfg.ws_url).map_err(|source| EngineError::InvalidUrl {
			url: self.cfg.ws_url.clone(),
			source,
		})?;
		let connector = self.connector();

		loop {
			if self.attempt > self.cfg.max_reconnect_attempts {
				error!(attempts = self.attempt, "reconnect ceiling reached; giving up");
				self.transition(ConnectionState::Failed);
				return Err(EngineError::ReconnectExhausted { attempts: self.attempt });
			}

			if self.attempt > 0 {
				let delay = Self::backoff_delay(self.attempt, self.cfg.reconnect_min_delay, self.cfg.reconnect_max_delay);
				info!(attempt = self.attempt, delay_ms = delay.as_millis() as u64, "reconnecting after backoff");
				sleep(delay).await;
			}

			self.transition(ConnectionState::Connecting);

			let mut transport = match connector(url.clone()).await {
				Ok(t) => t,
				Err(e) => {
					warn!(error = %e, "failed to connect to relay");
					self.attempt = self.attempt.saturating_add(1);
					self.transition(ConnectionState::Reconnecting);
					continue;
				}
			};

			match self.handshake(&mut transport).await {
				Ok(()) => {}
				Err(HandshakeError::Fatal(e)) => {
					self.transition(ConnectionState::Failed);
					return Err(e);
				}
				Err(HandshakeError::Retry(e)) => {
					warn!(error = %e, "handshake failed");
					let _ = transport.close().await;
					self.attempt = self.attempt.saturating_add(1);
					self.transition(ConnectionState::Reconnecting);
					continue;
				}
			}

			match self.run_session(&mut transport).await {
				Ok(SessionEnd::Shutdown) => {
					let _ = transport.close().await;
					info!("engine stopped");
					return Ok(());
				}
				Ok(SessionEnd::Reconnect { count_failure }) => {
					let _ = transport.close().await;
					if count_failure {
						self.attempt = self.attempt.saturating_add(1);
					}
					self.transition(ConnectionState::Reconnecting);
				}
				Ok(SessionEnd::AuthRejected) => {
					let _ = transport.close().await;
					self.attempt = self.attempt.saturating_add(1);
					self.transition(ConnectionState::Reconnecting);
					self.recover_credential().await?;
				}
				Err(e) => {
					warn!(error = %e, "session ended with a transport error");
					let _ = transport.close().await;
					self.attempt = self.attempt.saturating_add(1);
					self.transition(ConnectionState::Reconnecting);
				}
			}
		}
	}

	/// Refresh after the relay rejected the credential mid-session. A
	/// rejected refresh token cannot be recovered without interactive
	/// re-authentication, so that failure is terminal.
	async fn recover_credential(&mut self) -> Result<(), EngineError> {
		let Some(tokens) = self.cfg.tokens.clone() else {
			warn!("relay rejected an anonymous connection; retrying");
			return Ok(());
		};

		match tokens.force_refresh().await {
			Ok(()) => {
				info!("credential refreshed after rejection");
				Ok(())
			}
			Err(e) if e.is_fatal() => {
				error!(error = %e, "credential rejected beyond recovery");
				self.transition(ConnectionState::Failed);
				Err(EngineError::Auth(e))
			}
			Err(e) => {
				warn!(error = %e, "credential refresh failed; retrying on next attempt");
				Ok(())
			}
		}
	}

	/// Capability request, then credential, then nick. The relay only
	/// answers once all three have arrived.
	async fn handshake(&mut self, transport: &mut BoxTransport) -> Result<(), HandshakeError> {
		transport
			.send_line("CAP REQ :twitch.tv/tags twitch.tv/commands")
			.await
			.map_err(HandshakeError::Retry)?;

		self.transition(ConnectionState::Authenticating);

		if let Some(tokens) = self.cfg.tokens.clone() {
			let token = match tokens.get_token().await {
				Ok(t) => t,
				Err(e) if e.is_fatal() => return Err(HandshakeError::Fatal(EngineError::Auth(e))),
				Err(e) => return Err(HandshakeError::Retry(anyhow::Error::new(e))),
			};
			transport
				.send_line(&format!("PASS oauth:{}", token.expose()))
				.await
				.map_err(HandshakeError::Retry)?;
		}

		transport
			.send_line(&format!("NICK {}", self.cfg.nick))
			.await
			.map_err(HandshakeError::Retry)?;

		self.transition(ConnectionState::CapNegotiating);
		Ok(())
	}

	async fn run_session(&mut self, transport: &mut BoxTransport) -> anyhow::Result<SessionEnd> {
		let mut last_activity = Instant::now();

		loop {
			tokio::select! {
				cmd = self.control_rx.recv() => match cmd {
					Some(ControlMsg::Shutdown) | None => return Ok(SessionEnd::Shutdown),
				},

				payload = transport.next_text() => {
					let Some(payload) = payload? else {
						info!("relay closed the connection");
						return Ok(SessionEnd::Reconnect { count_failure: true });
					};

					last_activity = Instant::now();
					for raw in payload.lines().filter(|l| !l.trim().is_empty()) {
						if let Some(end) = self.handle_line(raw, transport).await? {
							return Ok(end);
						}
					}
				}

				_ = sleep(self.cfg.liveness_timeout) => {
					if last_activity.elapsed() > self.cfg.liveness_timeout {
						warn!(
							timeout_secs = self.cfg.liveness_timeout.as_secs(),
							"no traffic inside the liveness window; reconnecting"
						);
						if self.state == ConnectionState::Joined {
							self.transition(ConnectionState::Degraded);
						}
						return Ok(SessionEnd::Reconnect { count_failure: true });
					}
				}
			}
		}
	}

	/// Parse, translate, and dispatch one protocol line. Malformed
	/// lines are dropped with a warning; the session keeps going.
	async fn handle_line(&mut self, raw: &str, transport: &mut BoxTransport) -> anyhow::Result<Option<SessionEnd>> {
		let msg = match parse_line(raw) {
			Ok(m) => m,
			Err(e) => {
				warn!(error = %e, line = raw, "dropping malformed line");
				return Ok(None);
			}
		};

		let Some(event) = translate(&msg, Utc::now()) else {
			trace!(command = %msg.command, "ignoring unhandled command");
			return Ok(None);
		};

		let mut end = None;
		if let ChatEvent::Signal(signal) = &event {
			match signal {
				ConnectionSignal::Ping(param) => {
					transport.send_line(&format!("PONG :{param}")).await?;
				}
				ConnectionSignal::ReconnectRequested => {
					info!("relay requested a reconnect");
					end = Some(SessionEnd::Reconnect { count_failure: false });
				}
				ConnectionSignal::AuthRejected => {
					warn!("relay rejected the credential");
					end = Some(SessionEnd::AuthRejected);
				}
				ConnectionSignal::Joined(None) => {
					debug!("handshake acknowledged; joining channels");
					for channel in &self.cfg.channels {
						transport.send_line(&format!("JOIN {}", channel.as_str())).await?;
					}
				}
				ConnectionSignal::Joined(Some(channel)) => {
					info!(channel = %channel.as_str(), "channel join confirmed");
					if self.state != ConnectionState::Joined {
						self.transition(ConnectionState::Joined);
						self.attempt = 0;
					}
				}
				ConnectionSignal::Notice(text) => {
					debug!(notice = %text, "server notice");
				}
			}
		}

		self.dispatch(event);
		Ok(end)
	}
}

enum HandshakeError {
	/// Counts as a failed attempt; retried with backoff.
	Retry(anyhow::Error),
	Fatal(EngineError),
}
