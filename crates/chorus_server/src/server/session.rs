#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chorus_domain::{Identity, SessionId};
use thiserror::Error;

/// Attribute key holding the authenticated user id.
pub const USER_ID_ATTRIBUTE: &str = "chorus.user_id";

/// Prefix for identity extras copied into session attributes.
pub const EXTRA_ATTRIBUTE_PREFIX: &str = "chorus.extra.";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
	#[error("session closed")]
	Closed,

	#[error("transport error: {0}")]
	Transport(String),
}

/// One live connection as seen by the protocol layer.
#[async_trait]
pub trait Session: Send + Sync {
	fn id(&self) -> &SessionId;

	fn attributes(&self) -> &Attributes;

	/// Queue one text frame for the peer.
	async fn send(&self, text: String) -> Result<(), SendError>;
}

pub type SessionRef = Arc<dyn Session>;

/// String attributes attached to a session at handshake time.
#[derive(Debug, Default)]
pub struct Attributes {
	inner: RwLock<BTreeMap<String, String>>,
}

impl Attributes {
	pub fn new() -> Self {
		Self::default()
	}

	/// Attributes carrying the user id and extras of `identity`.
	pub fn from_identity(identity: &Identity) -> Self {
		let attrs = Self::new();
		attrs.attach_identity(identity);
		attrs
	}

	pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) {
		self.inner
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.insert(key.into(), value.into());
	}

	pub fn get(&self, key: &str) -> Option<String> {
		self.inner.read().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
	}

	pub fn snapshot(&self) -> BTreeMap<String, String> {
		self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
	}

	pub fn attach_identity(&self, identity: &Identity) {
		let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
		inner.insert(USER_ID_ATTRIBUTE.to_string(), identity.id.clone());
		for (k, v) in &identity.extra {
			inner.insert(format!("{EXTRA_ATTRIBUTE_PREFIX}{k}"), v.clone());
		}
	}

	/// Identity read back from the attributes; empty when none was attached.
	pub fn identity(&self) -> Identity {
		let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
		let Some(id) = inner.get(USER_ID_ATTRIBUTE) else {
			return Identity::empty();
		};

		let extra = inner
			.iter()
			.filter_map(|(k, v)| k.strip_prefix(EXTRA_ATTRIBUTE_PREFIX).map(|k| (k.to_string(), v.clone())))
			.collect();

		Identity { id: id.clone(), extra }
	}
}
