#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// IRC channel name, normalized to lowercase with a leading `#`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelName(String);

impl ChannelName {
	/// Create a normalized `ChannelName` from a login or `#channel` form.
	pub fn new(name: impl AsRef<str>) -> Result<Self, ParseIdError> {
		let name = name.as_ref().trim();
		if name.is_empty() || name == "#" {
			return Err(ParseIdError::Empty);
		}

		let mut normalized = String::with_capacity(name.len() + 1);
		if !name.starts_with('#') {
			normalized.push('#');
		}
		normalized.push_str(&name.to_ascii_lowercase());
		Ok(Self(normalized))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// Channel login without the `#` prefix.
	pub fn login(&self) -> &str {
		self.0.trim_start_matches('#')
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for ChannelName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ChannelName {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ChannelName::new(s)
	}
}

/// Platform-assigned user identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
	/// Create a non-empty `UserId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		UserId::new(s.to_string())
	}
}

/// One `name/version` entry from a `badges` tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Badge {
	pub name: String,
	pub version: String,
}

/// A chat message posted to a joined channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatPosted {
	pub channel: ChannelName,
	pub message_id: Option<String>,
	pub sender_id: Option<UserId>,
	pub sender_login: String,
	pub sender_name: String,
	pub text: String,
	pub badges: Vec<Badge>,
	pub bits: u64,
	pub is_subscriber: bool,
	pub is_moderator: bool,
	pub timestamp: DateTime<Utc>,
}

/// A single message removed by a moderator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDeleted {
	pub channel: ChannelName,
	pub message_id: Option<String>,
	pub target_user_id: Option<UserId>,
	pub target_login: Option<String>,
	pub text: String,
	pub deleted_at: DateTime<Utc>,
}

/// A user banned or timed out in a channel.
///
/// `duration: None` means a permanent ban.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserModerated {
	pub channel: ChannelName,
	pub target_user_id: Option<UserId>,
	pub target_login: String,
	pub moderator_id: Option<UserId>,
	pub reason: Option<String>,
	pub duration: Option<Duration>,
	pub timestamp: DateTime<Utc>,
}

impl UserModerated {
	pub fn is_permanent(&self) -> bool {
		self.duration.is_none()
	}
}

/// Connection-control signal decoded from the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionSignal {
	/// Server liveness probe; must be answered with `PONG <param>`.
	Ping(String),

	/// Server asked for a graceful reconnect.
	ReconnectRequested,

	/// The relay rejected our credential.
	AuthRejected,

	/// Handshake or channel join acknowledged.
	Joined(Option<ChannelName>),

	/// Informational server notice.
	Notice(String),
}

/// Closed set of events produced by the translator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChatEvent {
	Chat(ChatPosted),
	Deleted(MessageDeleted),
	Moderated(UserModerated),
	Signal(ConnectionSignal),
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn channel_name_normalizes() {
		let c = ChannelName::new("Shroud").unwrap();
		assert_eq!(c.as_str(), "#shroud");
		assert_eq!(c.login(), "shroud");

		let c = ChannelName::new("#ALREADY").unwrap();
		assert_eq!(c.as_str(), "#already");
	}

	#[test]
	fn channel_name_rejects_empty() {
		assert_eq!(ChannelName::new(""), Err(ParseIdError::Empty));
		assert_eq!(ChannelName::new("  "), Err(ParseIdError::Empty));
		assert_eq!(ChannelName::new("#"), Err(ParseIdError::Empty));
	}

	#[test]
	fn user_id_rejects_empty() {
		assert!(UserId::new("123").is_ok());
		assert_eq!(UserId::new(" "), Err(ParseIdError::Empty));
	}

	#[test]
	fn permanent_ban_has_no_duration() {
		let banned = UserModerated {
			channel: ChannelName::new("demo").unwrap(),
			target_user_id: None,
			target_login: "baduser".to_string(),
			moderator_id: None,
			reason: None,
			duration: None,
			timestamp: Utc::now(),
		};
		assert!(banned.is_permanent());
	}
}
