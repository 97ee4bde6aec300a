#![forbid(unsafe_code)]

mod identity;
#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use crate::SecretString;

pub use identity::TwitchIdentityApi;

/// Credential-store key for the bearer token.
pub const ACCESS_TOKEN_KEY: &str = "TWITCH_ACCESS_TOKEN";
/// Credential-store key for the refresh token.
pub const REFRESH_TOKEN_KEY: &str = "TWITCH_REFRESH_TOKEN";

/// A token closer than this to expiry is refreshed before use.
const EXPIRY_SAFETY_MARGIN: Duration = Duration::from_secs(10 * 60);

/// Fixed validation cadence required by the identity provider.
pub const VALIDATION_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Scope required for receive-only chat access.
const REQUIRED_SCOPE: &str = "chat:read";

#[derive(Debug, Error)]
pub enum AuthError {
	/// The refresh token is invalid or revoked. Fatal: a new refresh
	/// token can only come from interactive re-authentication.
	#[error("refresh token rejected: {detail}")]
	RefreshRejected { detail: String },

	/// Validation failed transiently; retried on the next tick.
	#[error("token validation failed: {detail}")]
	ValidationFailed { detail: String },

	/// Transport-level failure talking to the identity provider.
	#[error("identity request failed: {0}")]
	Http(#[source] anyhow::Error),

	/// Persisting rotated credentials failed.
	#[error("credential persistence failed: {0}")]
	Persist(#[source] anyhow::Error),
}

impl AuthError {
	pub fn is_fatal(&self) -> bool {
		matches!(self, AuthError::RefreshRejected { .. })
	}
}

/// Successful validation response.
#[derive(Debug, Clone)]
pub struct TokenValidation {
	pub login: String,
	pub user_id: String,
	pub scopes: Vec<String>,
	pub expires_in: Duration,
}

/// Successful refresh response. `refresh_token` is `None` when the
/// provider chose not to rotate it.
#[derive(Debug, Clone)]
pub struct RefreshedTokens {
	pub access_token: SecretString,
	pub refresh_token: Option<SecretString>,
	pub expires_in: Duration,
}

/// OAuth identity endpoints (validate + refresh).
#[async_trait]
pub trait IdentityApi: Send + Sync {
	/// Validate a bearer token. `Ok(None)` means the provider
	/// explicitly rejected it (unauthorized).
	async fn validate(&self, access_token: &str) -> Result<Option<TokenValidation>, AuthError>;

	/// Exchange a refresh token for a new token pair.
	async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens, AuthError>;
}

/// Narrow persistence interface for rotated credentials.
pub trait CredentialStore: Send + Sync {
	fn read(&self, key: &str) -> anyhow::Result<Option<String>>;
	fn write(&self, key: &str, value: &str) -> anyhow::Result<()>;
}

/// Current credential state. Callers only ever see clones of this;
/// the manager is the single writer.
#[derive(Debug, Clone)]
pub struct TokenState {
	pub access_token: SecretString,
	pub refresh_token: SecretString,
	pub expires_at: SystemTime,
	pub last_validated_at: Option<SystemTime>,
}

impl TokenState {
	/// Seed state from persisted credentials. The expiry is unknown
	/// until the first validation, so the token starts inside the
	/// safety margin and the first use validates or refreshes it.
	pub fn from_persisted(access_token: SecretString, refresh_token: SecretString) -> Self {
		Self {
			access_token,
			refresh_token,
			expires_at: SystemTime::now(),
			last_validated_at: None,
		}
	}
}

struct Versioned {
	state: TokenState,
	/// Bumped on every successful refresh; lets gate waiters detect
	/// that the refresh they queued for already happened.
	generation: u64,
}

/// Owns the OAuth credential for the process lifetime.
///
/// All refreshes are single-flight: concurrent callers serialize on
/// one in-flight exchange and share its result. The provider rotates
/// refresh tokens, so duplicate concurrent refreshes would invalidate
/// each other.
#[derive(Clone)]
pub struct TokenManager {
	api: Arc<dyn IdentityApi>,
	store: Arc<dyn CredentialStore>,
	state: Arc<RwLock<Versioned>>,
	refresh_gate: Arc<Mutex<()>>,
}

impl TokenManager {
	pub fn new(api: Arc<dyn IdentityApi>, store: Arc<dyn CredentialStore>, initial: TokenState) -> Self {
		Self {
			api,
			store,
			state: Arc::new(RwLock::new(Versioned {
				state: initial,
				generation: 0,
			})),
			refresh_gate: Arc::new(Mutex::new(())),
		}
	}

	/// Snapshot of the current credential state.
	pub fn snapshot(&self) -> TokenState {
		self.state.read().state.clone()
	}

	/// Current access token, refreshing first when it is within the
	/// safety margin of its expiry.
	pub async fn get_token(&self) -> Result<SecretString, AuthError> {
		{
			let guard = self.state.read();
			let usable_until = guard.state.expires_at.checked_sub(EXPIRY_SAFETY_MARGIN);
			if usable_until.is_some_and(|deadline| SystemTime::now() < deadline) {
				return Ok(guard.state.access_token.clone());
			}
		}

		debug!("access token inside expiry safety margin; refreshing");
		self.force_refresh().await?;
		Ok(self.snapshot().access_token)
	}

	/// Unconditionally exchange the refresh token for a new pair and
	/// persist the result. Single-flight: a caller that queued behind
	/// an in-flight refresh adopts its result instead of issuing a
	/// second exchange.
	pub async fn force_refresh(&self) -> Result<(), AuthError> {
		let seen_generation = self.state.read().generation;
		let _gate = self.refresh_gate.lock().await;

		if self.state.read().generation != seen_generation {
			debug!("refresh already completed while waiting on the gate");
			return Ok(());
		}

		let refresh_token = self.state.read().state.refresh_token.clone();
		info!("refreshing access token");
		let refreshed = self.api.refresh(refresh_token.expose()).await?;
		let rotated = refreshed.refresh_token.is_some();

		let new_state = {
			let mut guard = self.state.write();
			guard.state.access_token = refreshed.access_token;
			if let Some(new_refresh) = refreshed.refresh_token {
				guard.state.refresh_token = new_refresh;
			}
			guard.state.expires_at = SystemTime::now() + refreshed.expires_in;
			guard.generation += 1;
			guard.state.clone()
		};

		info!(
			rotated_refresh_token = rotated,
			expires_in_secs = refreshed.expires_in.as_secs(),
			"access token refreshed"
		);

		self.persist(&new_state)?;
		Ok(())
	}

	/// Validate the current token against the provider. A rejection
	/// triggers an immediate refresh; transient failures are reported
	/// as [`AuthError::ValidationFailed`] and retried on the next
	/// scheduled tick.
	pub async fn validate_now(&self) -> Result<(), AuthError> {
		let access_token = self.snapshot().access_token;

		let outcome = self.api.validate(access_token.expose()).await.map_err(|e| match e {
			AuthError::Http(source) => AuthError::ValidationFailed {
				detail: source.to_string(),
			},
			other => other,
		})?;

		match outcome {
			Some(validation) => {
				if !validation.scopes.iter().any(|s| s == REQUIRED_SCOPE) {
					warn!(scopes = ?validation.scopes, "token is missing the {REQUIRED_SCOPE} scope");
				}

				let now = SystemTime::now();
				{
					let mut guard = self.state.write();
					guard.state.expires_at = now + validation.expires_in;
					guard.state.last_validated_at = Some(now);
				}

				debug!(
					login = %validation.login,
					expires_in_secs = validation.expires_in.as_secs(),
					"token validated"
				);
				Ok(())
			}
			None => {
				warn!("token rejected by validation endpoint; forcing refresh");
				self.force_refresh().await
			}
		}
	}

	/// Validate once per hour, until `shutdown` signals. The first tick
	/// is a full interval out; the caller is expected to have validated
	/// at startup. A rejected refresh token stops the task; everything
	/// else is retried on the next tick.
	pub fn spawn_validation_timer(&self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
		let manager = self.clone();
		tokio::spawn(async move {
			let start = tokio::time::Instant::now() + VALIDATION_INTERVAL;
			let mut ticker = tokio::time::interval_at(start, VALIDATION_INTERVAL);
			loop {
				tokio::select! {
					_ = ticker.tick() => match manager.validate_now().await {
						Ok(()) => {}
						Err(e) if e.is_fatal() => {
							error!(error = %e, "scheduled validation hit a rejected refresh token; re-authentication required");
							return;
						}
						Err(e) => warn!(error = %e, "scheduled validation failed; retrying next tick"),
					},
					_ = shutdown.changed() => {
						debug!("validation timer stopping");
						return;
					}
				}
			}
		})
	}

	fn persist(&self, state: &TokenState) -> Result<(), AuthError> {
		self.store
			.write(ACCESS_TOKEN_KEY, state.access_token.expose())
			.and_then(|()| self.store.write(REFRESH_TOKEN_KEY, state.refresh_token.expose()))
			.map_err(AuthError::Persist)
	}
}
