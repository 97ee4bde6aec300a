#![forbid(unsafe_code)]

use std::time::Duration;

use chatrelay_domain::{
	Badge, ChannelName, ChatEvent, ChatPosted, ConnectionSignal, MessageDeleted, UserId, UserModerated,
};
use chrono::{DateTime, Utc};

use crate::line::ParsedMessage;

/// NOTICE texts the relay sends when it rejects a credential.
const AUTH_FAILURE_NOTICES: &[&str] = &["Login authentication failed", "Improperly formatted auth"];

/// `msg-id` tag values signalling credential rejection.
const AUTH_FAILURE_MSG_IDS: &[&str] = &["login_authentication_failed", "login_unsuccessful"];

/// Translate one parsed line into a domain event.
///
/// Unrecognized commands yield `None` and are skipped by the engine
/// (forward compatibility with commands we never requested).
pub fn translate(msg: &ParsedMessage, now: DateTime<Utc>) -> Option<ChatEvent> {
	match msg.command.as_str() {
		"PRIVMSG" => translate_privmsg(msg, now),
		"CLEARMSG" => translate_clearmsg(msg, now),
		"CLEARCHAT" => translate_clearchat(msg, now),
		"PING" => Some(ChatEvent::Signal(ConnectionSignal::Ping(
			msg.trailing().unwrap_or_default().to_string(),
		))),
		"RECONNECT" => Some(ChatEvent::Signal(ConnectionSignal::ReconnectRequested)),
		"NOTICE" => translate_notice(msg),
		"001" => Some(ChatEvent::Signal(ConnectionSignal::Joined(None))),
		"366" => {
			let channel = msg.params.get(1).and_then(|c| ChannelName::new(c).ok());
			Some(ChatEvent::Signal(ConnectionSignal::Joined(channel)))
		}
		_ => None,
	}
}

fn channel_param(msg: &ParsedMessage) -> Option<ChannelName> {
	ChannelName::new(msg.params.first()?).ok()
}

fn tag_user_id(msg: &ParsedMessage, key: &str) -> Option<UserId> {
	msg.tag(key).and_then(|v| UserId::new(v).ok())
}

fn parse_badges(raw: &str) -> Vec<Badge> {
	raw.split(',')
		.filter(|entry| !entry.is_empty())
		.map(|entry| match entry.split_once('/') {
			Some((name, version)) => Badge {
				name: name.to_string(),
				version: version.to_string(),
			},
			None => Badge {
				name: entry.to_string(),
				version: String::new(),
			},
		})
		.collect()
}

/// `tmi-sent-ts` carries milliseconds since the epoch.
fn tag_timestamp(msg: &ParsedMessage, now: DateTime<Utc>) -> DateTime<Utc> {
	msg.tag("tmi-sent-ts")
		.and_then(|v| v.parse::<i64>().ok())
		.and_then(DateTime::from_timestamp_millis)
		.unwrap_or(now)
}

fn translate_privmsg(msg: &ParsedMessage, now: DateTime<Utc>) -> Option<ChatEvent> {
	let channel = channel_param(msg)?;
	let text = msg.params.get(1)?.clone();

	let sender_name = msg.tag("display-name").unwrap_or_default().to_string();
	let sender_login = msg
		.prefix_nick()
		.map(str::to_string)
		.filter(|nick| !nick.is_empty())
		.unwrap_or_else(|| sender_name.to_ascii_lowercase());

	Some(ChatEvent::Chat(ChatPosted {
		channel,
		message_id: msg.tag("id").map(str::to_string),
		sender_id: tag_user_id(msg, "user-id"),
		sender_login,
		sender_name,
		badges: msg.tag("badges").map(parse_badges).unwrap_or_default(),
		bits: msg.tag("bits").and_then(|v| v.parse().ok()).unwrap_or(0),
		is_subscriber: msg.tag("subscriber") == Some("1"),
		is_moderator: msg.tag("mod") == Some("1"),
		timestamp: tag_timestamp(msg, now),
		text,
	}))
}

fn translate_clearmsg(msg: &ParsedMessage, now: DateTime<Utc>) -> Option<ChatEvent> {
	let channel = channel_param(msg)?;

	Some(ChatEvent::Deleted(MessageDeleted {
		channel,
		message_id: msg.tag("target-msg-id").map(str::to_string),
		target_user_id: tag_user_id(msg, "target-user-id"),
		target_login: msg.tag("login").map(str::to_string),
		text: msg.params.get(1).cloned().unwrap_or_default(),
		deleted_at: now,
	}))
}

fn translate_clearchat(msg: &ParsedMessage, now: DateTime<Utc>) -> Option<ChatEvent> {
	let channel = channel_param(msg)?;

	// Without a target param this is a channel-wide chat clear, not a
	// moderation action against a user.
	let Some(target_login) = msg.params.get(1) else {
		return Some(ChatEvent::Signal(ConnectionSignal::Notice(format!(
			"chat cleared in {channel}"
		))));
	};

	let duration = msg
		.tag("ban-duration")
		.and_then(|v| v.parse::<u64>().ok())
		.map(Duration::from_secs);

	Some(ChatEvent::Moderated(UserModerated {
		channel,
		target_user_id: tag_user_id(msg, "target-user-id"),
		target_login: target_login.trim().to_string(),
		moderator_id: None,
		reason: None,
		duration,
		timestamp: tag_timestamp(msg, now),
	}))
}

fn translate_notice(msg: &ParsedMessage) -> Option<ChatEvent> {
	let text = msg.trailing().unwrap_or_default();

	let rejected = AUTH_FAILURE_NOTICES.iter().any(|m| text.contains(m))
		|| msg.tag("msg-id").is_some_and(|id| AUTH_FAILURE_MSG_IDS.contains(&id));

	if rejected {
		return Some(ChatEvent::Signal(ConnectionSignal::AuthRejected));
	}

	Some(ChatEvent::Signal(ConnectionSignal::Notice(text.to_string())))
}
