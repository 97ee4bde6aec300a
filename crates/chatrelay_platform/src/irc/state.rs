#![forbid(unsafe_code)]

use core::fmt;

/// Lifecycle of one logical connection. Mutated only by the engine's
/// own loop (single writer); `Failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
	Disconnected,
	Connecting,
	Authenticating,
	CapNegotiating,
	Joined,
	Degraded,
	Reconnecting,
	Failed,
}

impl ConnectionState {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Disconnected => "disconnected",
			Self::Connecting => "connecting",
			Self::Authenticating => "authenticating",
			Self::CapNegotiating => "cap_negotiating",
			Self::Joined => "joined",
			Self::Degraded => "degraded",
			Self::Reconnecting => "reconnecting",
			Self::Failed => "failed",
		}
	}

	/// True while the connection is somewhere between dialing and a
	/// live session (any state an auth rejection can arrive in).
	pub const fn is_active(self) -> bool {
		matches!(
			self,
			Self::Connecting | Self::Authenticating | Self::CapNegotiating | Self::Joined | Self::Degraded
		)
	}

	/// The defined edge set. `Failed` is reachable only from
	/// `Reconnecting` (attempt ceiling) or an active state (rejected
	/// credential refresh).
	pub fn is_legal_transition(from: Self, to: Self) -> bool {
		use ConnectionState::*;

		match (from, to) {
			(Disconnected, Connecting) => true,
			(Connecting, Authenticating) => true,
			(Authenticating, CapNegotiating) => true,
			(CapNegotiating, Joined) => true,
			(Joined, Degraded) => true,
			(Reconnecting, Connecting) => true,
			(Reconnecting, Failed) => true,
			(from, Reconnecting) => from.is_active(),
			(from, Failed) => from.is_active(),
			_ => false,
		}
	}
}

impl fmt::Display for ConnectionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}
