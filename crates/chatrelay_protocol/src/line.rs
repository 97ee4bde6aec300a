#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LineError {
	#[error("malformed line: {reason}")]
	Malformed { reason: &'static str },
}

impl LineError {
	fn malformed(reason: &'static str) -> Self {
		Self::Malformed { reason }
	}
}

/// One decoded tag-augmented protocol line.
///
/// `tags` is empty (never absent) when the line carried no tag segment.
/// The trailing parameter, if present, is the last element of `params`
/// and may contain spaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
	pub tags: BTreeMap<String, String>,
	pub prefix: Option<String>,
	pub command: String,
	pub params: Vec<String>,
}

impl ParsedMessage {
	pub fn tag(&self, key: &str) -> Option<&str> {
		self.tags.get(key).map(String::as_str)
	}

	/// The trailing parameter, when the line had one or more params.
	pub fn trailing(&self) -> Option<&str> {
		self.params.last().map(String::as_str)
	}

	/// Nick portion of the prefix (`nick!user@host` -> `nick`).
	pub fn prefix_nick(&self) -> Option<&str> {
		let prefix = self.prefix.as_deref()?;
		Some(prefix.split('!').next().unwrap_or(prefix))
	}
}

/// Unescape an IRCv3 tag value.
///
/// `\:` -> `;`, `\s` -> space, `\r` -> CR, `\n` -> LF, `\\` -> `\`.
/// An unrecognized escape drops the backslash; a trailing lone
/// backslash is dropped entirely.
pub fn unescape_tag_value(value: &str) -> String {
	let mut out = String::with_capacity(value.len());
	let mut chars = value.chars();

	while let Some(c) = chars.next() {
		if c != '\\' {
			out.push(c);
			continue;
		}

		match chars.next() {
			Some(':') => out.push(';'),
			Some('s') => out.push(' '),
			Some('r') => out.push('\r'),
			Some('n') => out.push('\n'),
			Some('\\') => out.push('\\'),
			Some(other) => out.push(other),
			None => {}
		}
	}

	out
}

/// Escape a tag value for the wire (inverse of `unescape_tag_value`).
pub fn escape_tag_value(value: &str) -> String {
	let mut out = String::with_capacity(value.len());
	for c in value.chars() {
		match c {
			';' => out.push_str("\\:"),
			' ' => out.push_str("\\s"),
			'\r' => out.push_str("\\r"),
			'\n' => out.push_str("\\n"),
			'\\' => out.push_str("\\\\"),
			other => out.push(other),
		}
	}
	out
}

fn parse_tags(segment: &str) -> BTreeMap<String, String> {
	let mut tags = BTreeMap::new();

	for entry in segment.split(';') {
		if entry.is_empty() {
			continue;
		}
		match entry.split_once('=') {
			Some((key, value)) => tags.insert(key.to_string(), unescape_tag_value(value)),
			None => tags.insert(entry.to_string(), String::new()),
		};
	}

	tags
}

/// Parse one raw protocol line into a [`ParsedMessage`].
pub fn parse_line(raw: &str) -> Result<ParsedMessage, LineError> {
	let mut rest = raw.trim_end_matches(['\r', '\n']);
	if rest.is_empty() {
		return Err(LineError::malformed("empty line"));
	}

	let mut tags = BTreeMap::new();
	if let Some(after_at) = rest.strip_prefix('@') {
		let (segment, remainder) = after_at
			.split_once(' ')
			.ok_or_else(|| LineError::malformed("tag segment without command"))?;
		tags = parse_tags(segment);
		rest = remainder.trim_start_matches(' ');
	}

	let mut prefix = None;
	if let Some(after_colon) = rest.strip_prefix(':') {
		let (source, remainder) = after_colon
			.split_once(' ')
			.ok_or_else(|| LineError::malformed("prefix without command"))?;
		prefix = Some(source.to_string());
		rest = remainder.trim_start_matches(' ');
	}

	if rest.is_empty() {
		return Err(LineError::malformed("missing command"));
	}

	let mut params = Vec::new();
	let command = match rest.split_once(' ') {
		None => rest.to_string(),
		Some((command, mut param_text)) => {
			loop {
				param_text = param_text.trim_start_matches(' ');
				if param_text.is_empty() {
					break;
				}

				// Everything after a `:` marker is one trailing param, verbatim.
				if let Some(trailing) = param_text.strip_prefix(':') {
					params.push(trailing.to_string());
					break;
				}

				match param_text.split_once(' ') {
					Some((param, remainder)) => {
						params.push(param.to_string());
						param_text = remainder;
					}
					None => {
						params.push(param_text.to_string());
						break;
					}
				}
			}
			command.to_string()
		}
	};

	if command.is_empty() {
		return Err(LineError::malformed("missing command"));
	}

	Ok(ParsedMessage {
		tags,
		prefix,
		command,
		params,
	})
}
