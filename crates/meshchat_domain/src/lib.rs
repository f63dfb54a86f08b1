#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid integer: {0}")]
	InvalidInteger(String),
	#[error("unknown context key: {0}")]
	UnknownContextKey(String),
}

fn parse_u64(s: &str) -> Result<u64, ParseIdError> {
	let s = s.trim();
	if s.is_empty() {
		return Err(ParseIdError::Empty);
	}
	s.parse::<u64>().map_err(|_| ParseIdError::InvalidInteger(s.to_string()))
}

/// Opaque handle for one live client connection, scoped to the owning substrate node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
	pub const fn get(self) -> u64 {
		self.0
	}
}

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for ConnectionId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		parse_u64(s).map(Self)
	}
}

/// Substrate node (process) that owns a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl NodeId {
	pub const fn get(self) -> u64 {
		self.0
	}
}

impl fmt::Display for NodeId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for NodeId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		parse_u64(s).map(Self)
	}
}

/// Identity of an authenticated principal.
///
/// `0` is the sentinel for "not authenticated" and for a failed auth attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl UserId {
	pub const ANONYMOUS: Self = Self(0);

	pub const fn get(self) -> u64 {
		self.0
	}

	pub const fn is_authenticated(self) -> bool {
		self.0 != 0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		parse_u64(s).map(Self)
	}
}

/// Fan-out channel identifier.
///
/// Room ids, user ids and the broadcast channel share one namespace; no prefix
/// is applied, so a room named `"42"` and user `42` address the same subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelName(String);

impl ChannelName {
	/// Literal channel used by `sendbroadcast`.
	pub const BROADCAST: &'static str = "broadcast";

	/// Wrap a caller-supplied channel. Empty names are accepted as-is.
	pub fn new(name: impl Into<String>) -> Self {
		Self(name.into())
	}

	pub fn broadcast() -> Self {
		Self(Self::BROADCAST.to_string())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}

	pub fn is_broadcast(&self) -> bool {
		self.0 == Self::BROADCAST
	}
}

impl fmt::Display for ChannelName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<String> for ChannelName {
	fn from(s: String) -> Self {
		Self(s)
	}
}

impl From<&str> for ChannelName {
	fn from(s: &str) -> Self {
		Self(s.to_string())
	}
}

/// Key of the per-connection context slot the substrate script blocks on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKey {
	#[default]
	Uid,
	UserId,
}

impl ContextKey {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			ContextKey::Uid => "uid",
			ContextKey::UserId => "user_id",
		}
	}
}

impl fmt::Display for ContextKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for ContextKey {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"uid" => Ok(ContextKey::Uid),
			"user_id" | "userid" => Ok(ContextKey::UserId),
			other => Err(ParseIdError::UnknownContextKey(other.to_string())),
		}
	}
}

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}
