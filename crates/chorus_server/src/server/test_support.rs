#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chorus_domain::{Identity, SessionId};
use chorus_protocol::{DEFAULT_MAX_FRAME_SIZE, ResponseFrame, decode_response};

use crate::server::session::{Attributes, SendError, Session, SessionRef};

/// In-memory session that records every frame sent to it.
pub struct RecordingSession {
	id: SessionId,
	attributes: Attributes,
	sent: Mutex<Vec<String>>,
	fail_sends: AtomicBool,
	send_delay: Option<Duration>,
}

impl RecordingSession {
	pub fn new(id: &str) -> Arc<Self> {
		Self::build(id, Identity::new(format!("user-{id}")), None)
	}

	pub fn with_identity(id: &str, identity: Identity) -> Arc<Self> {
		Self::build(id, identity, None)
	}

	/// A session whose every send takes `delay` to complete.
	pub fn slow(id: &str, delay: Duration) -> Arc<Self> {
		Self::build(id, Identity::new(format!("user-{id}")), Some(delay))
	}

	fn build(id: &str, identity: Identity, send_delay: Option<Duration>) -> Arc<Self> {
		Arc::new(Self {
			id: SessionId::new(id).expect("valid session id"),
			attributes: Attributes::from_identity(&identity),
			sent: Mutex::new(Vec::new()),
			fail_sends: AtomicBool::new(false),
			send_delay,
		})
	}

	pub fn set_failing(&self, failing: bool) {
		self.fail_sends.store(failing, Ordering::SeqCst);
	}

	pub fn sent(&self) -> Vec<String> {
		self.sent.lock().unwrap().clone()
	}

	pub fn responses(&self) -> Vec<ResponseFrame> {
		self.sent()
			.iter()
			.map(|t| decode_response(t, DEFAULT_MAX_FRAME_SIZE).expect("server sent a decodable response"))
			.collect()
	}

	pub fn last_response(&self) -> ResponseFrame {
		self.responses().pop().expect("at least one response")
	}

	pub fn as_session(self: &Arc<Self>) -> SessionRef {
		Arc::clone(self) as SessionRef
	}
}

#[async_trait]
impl Session for RecordingSession {
	fn id(&self) -> &SessionId {
		&self.id
	}

	fn attributes(&self) -> &Attributes {
		&self.attributes
	}

	async fn send(&self, text: String) -> Result<(), SendError> {
		if let Some(delay) = self.send_delay {
			tokio::time::sleep(delay).await;
		}
		if self.fail_sends.load(Ordering::SeqCst) {
			return Err(SendError::Transport("simulated failure".to_string()));
		}
		self.sent.lock().unwrap().push(text);
		Ok(())
	}
}
