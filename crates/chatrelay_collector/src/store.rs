#![forbid(unsafe_code)]

use std::fs;
use std::path::PathBuf;

use anyhow::{Context as _, anyhow};
use chatrelay_platform::auth::CredentialStore;
use tracing::debug;

/// `KEY=VALUE` credential file, rewritten in place when tokens rotate.
/// A `.backup` copy of the previous contents is taken before every
/// rewrite so an interrupted write never loses the old pair.
pub struct EnvFileStore {
	path: PathBuf,
}

impl EnvFileStore {
	pub fn new(path: PathBuf) -> Self {
		Self { path }
	}

	fn backup_path(&self) -> PathBuf {
		let mut name = self.path.file_name().unwrap_or_default().to_os_string();
		name.push(".backup");
		self.path.with_file_name(name)
	}

	fn read_lines(&self) -> anyhow::Result<Vec<String>> {
		match fs::read_to_string(&self.path) {
			Ok(s) => Ok(s.lines().map(str::to_string).collect()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
			Err(e) => Err(anyhow!(e).context(format!("read credential file {}", self.path.display()))),
		}
	}
}

fn split_entry(line: &str) -> Option<(&str, &str)> {
	let trimmed = line.trim();
	if trimmed.is_empty() || trimmed.starts_with('#') {
		return None;
	}
	let (key, value) = trimmed.split_once('=')?;
	Some((key.trim(), unquote(value.trim())))
}

fn unquote(value: &str) -> &str {
	let bytes = value.as_bytes();
	if bytes.len() >= 2 && (bytes[0] == b'"' || bytes[0] == b'\'') && bytes[bytes.len() - 1] == bytes[0] {
		&value[1..value.len() - 1]
	} else {
		value
	}
}

impl CredentialStore for EnvFileStore {
	fn read(&self, key: &str) -> anyhow::Result<Option<String>> {
		for line in self.read_lines()? {
			if let Some((k, v)) = split_entry(&line)
				&& k == key
			{
				return Ok(Some(v.to_string()));
			}
		}
		Ok(None)
	}

	fn write(&self, key: &str, value: &str) -> anyhow::Result<()> {
		let mut lines = self.read_lines()?;

		let entry = format!("{key}={value}");
		match lines.iter_mut().find(|l| split_entry(l).is_some_and(|(k, _)| k == key)) {
			Some(line) => *line = entry,
			None => lines.push(entry),
		}

		if self.path.exists() {
			let backup = self.backup_path();
			fs::copy(&self.path, &backup).with_context(|| format!("back up credential file to {}", backup.display()))?;
		} else if let Some(parent) = self.path.parent() {
			fs::create_dir_all(parent).with_context(|| format!("create credential dir {}", parent.display()))?;
		}

		let mut contents = lines.join("\n");
		contents.push('\n');
		fs::write(&self.path, contents).with_context(|| format!("write credential file {}", self.path.display()))?;

		debug!(key, path = %self.path.display(), "persisted credential");
		Ok(())
	}
}
