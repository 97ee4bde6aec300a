use std::collections::BTreeMap;

use chatrelay_protocol::{LineError, escape_tag_value, parse_line, unescape_tag_value};
use proptest::prelude::*;

#[test]
fn parses_full_tagged_line() {
	let msg = parse_line("@badges=subscriber/1;user-id=123;display-name=Foo :foo!foo@foo.tmi.twitch.tv PRIVMSG #bar :hello world")
		.expect("parse");

	assert_eq!(msg.command, "PRIVMSG");
	assert_eq!(msg.prefix.as_deref(), Some("foo!foo@foo.tmi.twitch.tv"));
	assert_eq!(msg.prefix_nick(), Some("foo"));
	assert_eq!(msg.tag("badges"), Some("subscriber/1"));
	assert_eq!(msg.tag("user-id"), Some("123"));
	assert_eq!(msg.tag("display-name"), Some("Foo"));
	assert_eq!(msg.params, vec!["#bar".to_string(), "hello world".to_string()]);
}

#[test]
fn trailing_param_keeps_spaces_verbatim() {
	let msg = parse_line("PRIVMSG #bar :  two  leading and  inner spaces ").expect("parse");
	assert_eq!(msg.params[1], "  two  leading and  inner spaces ");
}

#[test]
fn line_without_tags_has_empty_map() {
	let msg = parse_line(":tmi.twitch.tv RECONNECT").expect("parse");
	assert!(msg.tags.is_empty());
	assert_eq!(msg.command, "RECONNECT");
	assert!(msg.params.is_empty());
}

#[test]
fn ping_without_prefix() {
	let msg = parse_line("PING :tmi.twitch.tv").expect("parse");
	assert_eq!(msg.command, "PING");
	assert_eq!(msg.trailing(), Some("tmi.twitch.tv"));
}

#[test]
fn tag_without_value_becomes_empty_string() {
	let msg = parse_line("@flagged;id=abc PING :x").expect("parse");
	assert_eq!(msg.tag("flagged"), Some(""));
	assert_eq!(msg.tag("id"), Some("abc"));
}

#[test]
fn crlf_terminator_is_stripped() {
	let msg = parse_line("PING :tmi.twitch.tv\r\n").expect("parse");
	assert_eq!(msg.trailing(), Some("tmi.twitch.tv"));
}

#[test]
fn escape_sequences_unescape() {
	assert_eq!(unescape_tag_value("a\\sb"), "a b");
	assert_eq!(unescape_tag_value("a\\:b"), "a;b");
	assert_eq!(unescape_tag_value("a\\\\b"), "a\\b");
	assert_eq!(unescape_tag_value("a\\rb\\nc"), "a\rb\nc");

	// Composite: `\s\:\\` -> space, semicolon, backslash.
	assert_eq!(unescape_tag_value("\\s\\:\\\\"), " ;\\");
}

#[test]
fn trailing_lone_backslash_is_dropped() {
	assert_eq!(unescape_tag_value("abc\\"), "abc");
}

#[test]
fn unknown_escape_drops_backslash() {
	assert_eq!(unescape_tag_value("a\\qb"), "aqb");
}

#[test]
fn empty_line_is_malformed() {
	assert!(matches!(parse_line(""), Err(LineError::Malformed { .. })));
	assert!(matches!(parse_line("\r\n"), Err(LineError::Malformed { .. })));
}

#[test]
fn tags_without_command_are_malformed() {
	assert!(matches!(parse_line("@id=1"), Err(LineError::Malformed { .. })));
	assert!(matches!(parse_line(":prefix.only"), Err(LineError::Malformed { .. })));
}

fn tag_key() -> impl Strategy<Value = String> {
	"[a-z][a-z0-9-]{0,15}"
}

fn tag_value() -> impl Strategy<Value = String> {
	// Any printable-ish content including the characters that need escaping.
	proptest::collection::vec(
		prop_oneof![
			proptest::char::range('a', 'z').prop_map(|c| c.to_string()),
			Just(";".to_string()),
			Just(" ".to_string()),
			Just("\\".to_string()),
			Just("\r".to_string()),
			Just("\n".to_string()),
		],
		0..24,
	)
	.prop_map(|parts| parts.concat())
}

proptest! {
	#[test]
	fn tag_value_escape_roundtrip(value in tag_value()) {
		prop_assert_eq!(unescape_tag_value(&escape_tag_value(&value)), value);
	}

	#[test]
	fn constructed_line_roundtrips(
		entries in proptest::collection::btree_map(tag_key(), tag_value(), 0..6),
		trailing in "[ -~]{0,40}",
	) {
		let mut line = String::new();
		if !entries.is_empty() {
			line.push('@');
			let rendered: Vec<String> = entries
				.iter()
				.map(|(k, v)| format!("{k}={}", escape_tag_value(v)))
				.collect();
			line.push_str(&rendered.join(";"));
			line.push(' ');
		}
		line.push_str(":user!user@relay.example PRIVMSG #chan :");
		line.push_str(&trailing);

		let msg = parse_line(&line).expect("constructed line parses");

		let expected: BTreeMap<String, String> = entries;
		prop_assert_eq!(&msg.tags, &expected);
		prop_assert_eq!(msg.command.as_str(), "PRIVMSG");
		prop_assert_eq!(msg.params[0].as_str(), "#chan");
		prop_assert_eq!(msg.params[1].as_str(), trailing.as_str());
	}
}
