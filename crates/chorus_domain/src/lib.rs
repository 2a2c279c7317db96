#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum accepted topic path length in bytes.
pub const MAX_TOPIC_LEN: usize = 512;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// A topic path that failed syntax validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid topic path {path:?}: {reason}")]
pub struct InvalidPath {
	pub path: String,
	pub reason: &'static str,
}

impl InvalidPath {
	fn new(path: &str, reason: &'static str) -> Self {
		Self {
			path: path.to_string(),
			reason,
		}
	}
}

/// Stable identifier of one live connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
	/// Create a non-empty `SessionId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	/// Random session id (`s-<uuid>`).
	pub fn random() -> Self {
		Self(format!("s-{}", uuid::Uuid::new_v4().simple()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for SessionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for SessionId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		SessionId::new(s.trim().to_string())
	}
}

/// Registry-wide unique subscription identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub uuid::Uuid);

impl SubscriptionId {
	/// Create a new random subscription id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for SubscriptionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for SubscriptionId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		uuid::Uuid::parse_str(s)
			.map(Self)
			.map_err(|e| ParseIdError::InvalidFormat(e.to_string()))
	}
}

/// Authenticated principal bound to a connection at handshake time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
	pub id: String,

	#[serde(default)]
	pub extra: BTreeMap<String, String>,
}

impl Identity {
	pub fn new(id: impl Into<String>) -> Self {
		Self {
			id: id.into(),
			extra: BTreeMap::new(),
		}
	}

	/// The identity of a context that has not been bound to any principal.
	pub fn empty() -> Self {
		Self::default()
	}

	pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.extra.insert(key.into(), value.into());
		self
	}

	pub fn is_empty(&self) -> bool {
		self.id.is_empty()
	}
}

/// Validated, path-shaped topic name (e.g. `/room/1`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TopicPath(String);

impl TopicPath {
	/// Parse a topic path of the form `/<segment>[/<segment>...]`.
	///
	/// Segments are non-empty, may not be `.` or `..`, and only contain ASCII
	/// alphanumerics and `-_.~:@+=,`.
	pub fn parse(s: &str) -> Result<Self, InvalidPath> {
		if s.is_empty() {
			return Err(InvalidPath::new(s, "empty path"));
		}
		if s.len() > MAX_TOPIC_LEN {
			return Err(InvalidPath::new(s, "path too long"));
		}

		let rest = s
			.strip_prefix('/')
			.ok_or_else(|| InvalidPath::new(s, "path must start with '/'"))?;

		for segment in rest.split('/') {
			if segment.is_empty() {
				return Err(InvalidPath::new(s, "empty path segment"));
			}
			if segment == "." || segment == ".." {
				return Err(InvalidPath::new(s, "relative path segment"));
			}
			if !segment.bytes().all(is_topic_byte) {
				return Err(InvalidPath::new(s, "unsupported character in path segment"));
			}
		}

		Ok(Self(s.to_string()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// Whether this topic equals `prefix` or lives below it.
	pub fn is_under(&self, prefix: &str) -> bool {
		let prefix = prefix.trim_end_matches('/');
		if prefix.is_empty() {
			return true;
		}
		match self.0.strip_prefix(prefix) {
			Some(rest) => rest.is_empty() || rest.starts_with('/'),
			None => false,
		}
	}
}

#[inline]
fn is_topic_byte(b: u8) -> bool {
	b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~' | b':' | b'@' | b'+' | b'=' | b',')
}

impl fmt::Display for TopicPath {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for TopicPath {
	type Err = InvalidPath;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		TopicPath::parse(s)
	}
}

impl<'de> Deserialize<'de> for TopicPath {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		TopicPath::parse(&s).map_err(serde::de::Error::custom)
	}
}
