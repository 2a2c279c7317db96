#![forbid(unsafe_code)]

use std::sync::Arc;

use chorus_protocol::{
	CodecError, DEFAULT_MAX_FRAME_SIZE, Inbound, ResponseFrame, StatusCode, decode_inbound, encode_response,
	validate_request,
};
use tracing::{debug, error, trace, warn};

use crate::server::context::{ContextManager, ContextScope, ExecutionContext};
use crate::server::filter::FilterChain;
use crate::server::session::SessionRef;

#[derive(Debug, Clone)]
pub struct EngineSettings {
	pub max_frame_bytes: usize,
}

impl Default for EngineSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
		}
	}
}

/// Turns one inbound text frame into at most one response frame.
pub struct ProtocolEngine {
	chain: FilterChain,
	contexts: Arc<ContextManager>,
	settings: EngineSettings,
}

impl ProtocolEngine {
	pub fn new(chain: FilterChain, contexts: Arc<ContextManager>, settings: EngineSettings) -> Self {
		Self {
			chain,
			contexts,
			settings,
		}
	}

	pub fn contexts(&self) -> &Arc<ContextManager> {
		&self.contexts
	}

	/// Handle one text frame from `session`.
	///
	/// Returns `false` when the frame was ignored (not a request) and nothing
	/// was sent; `true` otherwise, even if sending the response failed.
	pub async fn handle(&self, session: &SessionRef, raw: &str) -> bool {
		metrics::counter!("chorus_server_frames_in_total").increment(1);

		let mut scope = self
			.contexts
			.begin_with(ExecutionContext::inbound(session.attributes().identity()));

		let Some(response) = self.process(&mut scope, session, raw).await else {
			return false;
		};
		drop(scope);

		self.respond(session, &response).await;
		true
	}

	async fn process(&self, scope: &mut ContextScope<'_>, session: &SessionRef, raw: &str) -> Option<ResponseFrame> {
		let request = match decode_inbound(raw, self.settings.max_frame_bytes) {
			Ok(Inbound::Request(request)) => request,
			Ok(Inbound::Ignored(kind)) => {
				trace!(session_id = %session.id(), ?kind, "ignoring non-request frame");
				return None;
			}
			Err(e) => {
				match &e {
					CodecError::FrameTooLarge { len, max } => {
						warn!(session_id = %session.id(), len, max, "inbound frame too large");
					}
					CodecError::Json(_) | CodecError::NotAnObject => {
						debug!(session_id = %session.id(), error = %e, "inbound frame did not decode");
					}
				}
				metrics::counter!("chorus_server_decode_errors_total").increment(1);
				return Some(ResponseFrame::failure(StatusCode::Other, None));
			}
		};

		let unit = scope.unit();
		if let Err(e) = validate_request(&request) {
			debug!(session_id = %session.id(), unit, request_id = ?request.id, error = %e, "invalid request");
			return Some(ResponseFrame::failure(StatusCode::ProtocolError, request.id.clone()));
		}

		let mut response = ResponseFrame::ok();
		response.request_id = request.id.clone();

		let ctx = scope.get_context();
		match self.chain.filter(ctx, &request, &mut response, session).await {
			Ok(_) => Some(response),
			Err(e) => {
				error!(
					session_id = %session.id(),
					unit,
					request_id = ?request.id,
					path = request.path_str(),
					error = %e,
					"filter chain failed"
				);
				Some(ResponseFrame::failure(StatusCode::InternalServerError, request.id.clone()))
			}
		}
	}

	async fn respond(&self, session: &SessionRef, response: &ResponseFrame) {
		metrics::counter!("chorus_server_responses_total", "status" => response.status.as_str()).increment(1);

		let text = match encode_response(response) {
			Ok(text) => text,
			Err(e) => {
				error!(session_id = %session.id(), error = %e, "failed to encode response");
				return;
			}
		};

		if let Err(e) = session.send(text).await {
			metrics::counter!("chorus_server_send_failures_total", "kind" => "response").increment(1);
			warn!(session_id = %session.id(), request_id = ?response.request_id, error = %e, "failed to send response");
		}
	}
}
