#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

use super::{AuthError, IdentityApi, RefreshedTokens, TokenValidation};
use crate::SecretString;

const TOKEN_VALIDATE_URL: &str = "https://id.twitch.tv/oauth2/validate";
const TOKEN_REFRESH_URL: &str = "https://id.twitch.tv/oauth2/token";

#[derive(Debug, Deserialize)]
struct ValidateResponse {
	login: String,
	user_id: String,
	expires_in: u64,
	#[serde(default)]
	scopes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
	access_token: String,
	#[serde(default)]
	refresh_token: Option<String>,
	expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct OauthErrorBody {
	#[serde(default)]
	message: String,
}

/// Identity endpoints of the Twitch OAuth service.
#[derive(Clone)]
pub struct TwitchIdentityApi {
	http: reqwest::Client,
	client_id: String,
	client_secret: SecretString,
	validate_url: Url,
	token_url: Url,
}

impl TwitchIdentityApi {
	pub fn new(client_id: impl Into<String>, client_secret: SecretString) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("chatrelay/0.x (oauth)")
			.timeout(Duration::from_secs(10))
			.build()
			.context("build reqwest client")?;

		Ok(Self {
			http,
			client_id: client_id.into(),
			client_secret,
			validate_url: Url::parse(TOKEN_VALIDATE_URL).context("parse validate url")?,
			token_url: Url::parse(TOKEN_REFRESH_URL).context("parse token url")?,
		})
	}

	/// Override the endpoint base, for tests against a local server.
	pub fn with_urls(mut self, validate_url: Url, token_url: Url) -> Self {
		self.validate_url = validate_url;
		self.token_url = token_url;
		self
	}
}

#[async_trait]
impl IdentityApi for TwitchIdentityApi {
	async fn validate(&self, access_token: &str) -> Result<Option<TokenValidation>, AuthError> {
		let resp = self
			.http
			.get(self.validate_url.clone())
			.header("Authorization", format!("OAuth {access_token}"))
			.send()
			.await
			.map_err(|e| AuthError::Http(anyhow!(e).context("validate token request")))?;

		let status = resp.status();
		let body = resp
			.text()
			.await
			.map_err(|e| AuthError::Http(anyhow!(e).context("validate token read body")))?;

		if status == StatusCode::UNAUTHORIZED {
			return Ok(None);
		}
		if !status.is_success() {
			return Err(AuthError::ValidationFailed {
				detail: format!("status={status} body={body}"),
			});
		}

		let parsed: ValidateResponse = serde_json::from_str(&body).map_err(|e| AuthError::ValidationFailed {
			detail: format!("parse validate response: {e}"),
		})?;

		Ok(Some(TokenValidation {
			login: parsed.login,
			user_id: parsed.user_id,
			scopes: parsed.scopes,
			expires_in: Duration::from_secs(parsed.expires_in),
		}))
	}

	async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens, AuthError> {
		let resp = self
			.http
			.post(self.token_url.clone())
			.form(&[
				("grant_type", "refresh_token"),
				("client_id", self.client_id.as_str()),
				("client_secret", self.client_secret.expose()),
				("refresh_token", refresh_token),
			])
			.send()
			.await
			.map_err(|e| AuthError::Http(anyhow!(e).context("refresh token request")))?;

		let status = resp.status();
		let body = resp
			.text()
			.await
			.map_err(|e| AuthError::Http(anyhow!(e).context("refresh token read body")))?;

		// 400/401 mean the refresh token itself is dead (revoked app
		// access, password change, or expiry); that is not retryable.
		if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
			let message = serde_json::from_str::<OauthErrorBody>(&body)
				.map(|b| b.message)
				.ok()
				.filter(|m| !m.is_empty())
				.unwrap_or(body);
			return Err(AuthError::RefreshRejected { detail: message });
		}

		if !status.is_success() {
			return Err(AuthError::Http(anyhow!("refresh token failed: status={status} body={body}")));
		}

		let parsed: RefreshResponse =
			serde_json::from_str(&body).map_err(|e| AuthError::Http(anyhow!(e).context("parse refresh response")))?;

		Ok(RefreshedTokens {
			access_token: SecretString::new(parsed.access_token),
			refresh_token: parsed.refresh_token.map(SecretString::new),
			expires_in: Duration::from_secs(parsed.expires_in),
		})
	}
}
