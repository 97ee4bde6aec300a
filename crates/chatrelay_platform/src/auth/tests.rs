#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::{
	ACCESS_TOKEN_KEY, AuthError, CredentialStore, IdentityApi, REFRESH_TOKEN_KEY, RefreshedTokens, TokenManager,
	TokenState, TokenValidation, VALIDATION_INTERVAL,
};
use crate::SecretString;

struct MockIdentity {
	refresh_calls: AtomicUsize,
	validate_calls: AtomicUsize,
	/// `None` simulates a 401 from the validation endpoint.
	validate_result: Option<Duration>,
	reject_refresh: bool,
}

impl MockIdentity {
	fn new() -> Self {
		Self {
			refresh_calls: AtomicUsize::new(0),
			validate_calls: AtomicUsize::new(0),
			validate_result: Some(Duration::from_secs(4 * 3600)),
			reject_refresh: false,
		}
	}

	fn rejecting_validation() -> Self {
		Self {
			validate_result: None,
			..Self::new()
		}
	}

	fn rejecting_refresh() -> Self {
		Self {
			reject_refresh: true,
			..Self::new()
		}
	}
}

#[async_trait]
impl IdentityApi for MockIdentity {
	async fn validate(&self, _access_token: &str) -> Result<Option<TokenValidation>, AuthError> {
		self.validate_calls.fetch_add(1, Ordering::SeqCst);
		Ok(self.validate_result.map(|expires_in| TokenValidation {
			login: "collector".to_string(),
			user_id: "42".to_string(),
			scopes: vec!["chat:read".to_string()],
			expires_in,
		}))
	}

	async fn refresh(&self, _refresh_token: &str) -> Result<RefreshedTokens, AuthError> {
		self.refresh_calls.fetch_add(1, Ordering::SeqCst);
		if self.reject_refresh {
			return Err(AuthError::RefreshRejected {
				detail: "Invalid refresh token".to_string(),
			});
		}

		// Widen the in-flight window so concurrent callers pile up
		// behind the gate.
		tokio::time::sleep(Duration::from_millis(50)).await;

		Ok(RefreshedTokens {
			access_token: SecretString::new("new-access"),
			refresh_token: Some(SecretString::new("new-refresh")),
			expires_in: Duration::from_secs(4 * 3600),
		})
	}
}

#[derive(Default)]
struct MemoryStore {
	entries: Mutex<HashMap<String, String>>,
}

impl CredentialStore for MemoryStore {
	fn read(&self, key: &str) -> anyhow::Result<Option<String>> {
		Ok(self.entries.lock().get(key).cloned())
	}

	fn write(&self, key: &str, value: &str) -> anyhow::Result<()> {
		self.entries.lock().insert(key.to_string(), value.to_string());
		Ok(())
	}
}

fn state_expiring_in(delta: Duration) -> TokenState {
	TokenState {
		access_token: SecretString::new("old-access"),
		refresh_token: SecretString::new("old-refresh"),
		expires_at: SystemTime::now() + delta,
		last_validated_at: None,
	}
}

fn manager(api: Arc<MockIdentity>, state: TokenState) -> (TokenManager, Arc<MemoryStore>) {
	let store = Arc::new(MemoryStore::default());
	(TokenManager::new(api, store.clone(), state), store)
}

#[tokio::test]
async fn fresh_token_is_returned_without_refresh() {
	let api = Arc::new(MockIdentity::new());
	let (manager, _) = manager(api.clone(), state_expiring_in(Duration::from_secs(2 * 3600)));

	let token = manager.get_token().await.expect("get_token");
	assert_eq!(token.expose(), "old-access");
	assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn token_inside_safety_margin_triggers_exactly_one_refresh() {
	// 5 minutes left is inside the 10 minute margin.
	let api = Arc::new(MockIdentity::new());
	let (manager, _) = manager(api.clone(), state_expiring_in(Duration::from_secs(5 * 60)));

	let token = manager.get_token().await.expect("get_token");
	assert_eq!(token.expose(), "new-access");
	assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_share_a_single_refresh() {
	let api = Arc::new(MockIdentity::new());
	let (manager, _) = manager(api.clone(), state_expiring_in(Duration::ZERO));

	let mut tasks = Vec::new();
	for _ in 0..8 {
		let manager = manager.clone();
		tasks.push(tokio::spawn(async move { manager.get_token().await }));
	}

	for task in tasks {
		let token = task.await.expect("join").expect("get_token");
		assert_eq!(token.expose(), "new-access");
	}

	assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_force_refreshes_collapse_into_one_exchange() {
	let api = Arc::new(MockIdentity::new());
	let (manager, _) = manager(api.clone(), state_expiring_in(Duration::from_secs(2 * 3600)));

	let mut tasks = Vec::new();
	for _ in 0..4 {
		let manager = manager.clone();
		tasks.push(tokio::spawn(async move { manager.force_refresh().await }));
	}
	for task in tasks {
		task.await.expect("join").expect("force_refresh");
	}

	assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 1);
	assert_eq!(manager.snapshot().access_token.expose(), "new-access");
}

#[tokio::test]
async fn refresh_persists_both_rotated_credentials() {
	let api = Arc::new(MockIdentity::new());
	let (manager, store) = manager(api, state_expiring_in(Duration::ZERO));

	manager.force_refresh().await.expect("force_refresh");

	assert_eq!(store.read(ACCESS_TOKEN_KEY).unwrap().as_deref(), Some("new-access"));
	assert_eq!(store.read(REFRESH_TOKEN_KEY).unwrap().as_deref(), Some("new-refresh"));

	let state = manager.snapshot();
	assert_eq!(state.refresh_token.expose(), "new-refresh");
	assert!(state.expires_at > SystemTime::now());
}

#[tokio::test]
async fn rejected_refresh_keeps_the_existing_token() {
	let api = Arc::new(MockIdentity::rejecting_refresh());
	let (manager, store) = manager(api, state_expiring_in(Duration::from_secs(30 * 60)));

	let err = manager.force_refresh().await.expect_err("must fail");
	assert!(matches!(err, AuthError::RefreshRejected { .. }));
	assert!(err.is_fatal());

	// The possibly-still-valid pair stays in place until a new one is
	// confirmed.
	let state = manager.snapshot();
	assert_eq!(state.access_token.expose(), "old-access");
	assert_eq!(state.refresh_token.expose(), "old-refresh");
	assert_eq!(store.read(ACCESS_TOKEN_KEY).unwrap(), None);
}

#[tokio::test]
async fn validation_success_extends_expiry() {
	let api = Arc::new(MockIdentity::new());
	let (manager, _) = manager(api.clone(), state_expiring_in(Duration::ZERO));

	manager.validate_now().await.expect("validate_now");

	let state = manager.snapshot();
	assert!(state.last_validated_at.is_some());
	assert!(state.expires_at > SystemTime::now() + Duration::from_secs(3 * 3600));
	assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn validation_rejection_forces_a_refresh() {
	let api = Arc::new(MockIdentity::rejecting_validation());
	let (manager, _) = manager(api.clone(), state_expiring_in(Duration::from_secs(2 * 3600)));

	manager.validate_now().await.expect("validate_now");

	assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 1);
	assert_eq!(manager.snapshot().access_token.expose(), "new-access");
}

#[tokio::test(start_paused = true)]
async fn validation_timer_waits_a_full_interval_before_first_check() {
	let api = Arc::new(MockIdentity::new());
	let (manager, _) = manager(api.clone(), state_expiring_in(Duration::from_secs(2 * 3600)));

	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	let timer = manager.spawn_validation_timer(shutdown_rx);
	tokio::task::yield_now().await;

	// Startup validation is the caller's job; the timer stays quiet
	// until a full interval has passed.
	tokio::time::sleep(VALIDATION_INTERVAL - Duration::from_secs(1)).await;
	assert_eq!(api.validate_calls.load(Ordering::SeqCst), 0);

	tokio::time::sleep(Duration::from_secs(2)).await;
	assert_eq!(api.validate_calls.load(Ordering::SeqCst), 1);

	shutdown_tx.send(true).expect("signal shutdown");
	timer.await.expect("timer task");
}
