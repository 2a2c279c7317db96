#![forbid(unsafe_code)]

pub mod codec;
pub mod frame;

pub use codec::{
	CodecError, DEFAULT_MAX_FRAME_SIZE, MAX_HEADER_NAME_LEN, MAX_HEADER_VALUE_LEN, MAX_ID_LEN, MAX_PATH_LEN,
	Inbound, ValidationError, Violation, decode_inbound, decode_request, decode_response, encode_request, encode_response, validate_request,
};
pub use frame::{REQUEST_TYPE, RESPONSE_TYPE, RequestFrame, ResponseFrame, StatusCode, UnknownStatus};

/// Reserved header names.
pub mod headers {
	/// Request header; `"1"` (or `"true"`) turns the request into an unsubscribe.
	pub const UNSUBSCRIBE: &str = "unsubscribe";

	/// Response/event header carrying the subscription's topic.
	pub const SUBSCRIPTION_TOPIC: &str = "subscription-topic";

	/// Response/event header carrying the subscription's id. On an unsubscribe
	/// request it selects a single subscription instead of the whole topic.
	pub const SUBSCRIPTION_ID: &str = "subscription-id";

	/// Whether an unsubscribe marker value means "unsubscribe".
	#[inline]
	pub fn is_truthy(value: &str) -> bool {
		let v = value.trim();
		v == "1" || v.eq_ignore_ascii_case("true")
	}
}

/// Protocol version constants.
pub mod version {
	/// WebSocket subprotocol name advertised by servers speaking v1.
	pub const SUBPROTOCOL: &str = "chorus.v1";
}
