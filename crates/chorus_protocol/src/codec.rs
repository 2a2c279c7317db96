#![forbid(unsafe_code)]

use core::fmt;

use serde_json::Value;
use thiserror::Error;

use crate::frame::{REQUEST_TYPE, RequestFrame, ResponseFrame};

/// Default maximum text frame size.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024; // 1 MiB

pub const MAX_ID_LEN: usize = 128;
pub const MAX_PATH_LEN: usize = 1024;
pub const MAX_HEADER_NAME_LEN: usize = 128;
pub const MAX_HEADER_VALUE_LEN: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),

	#[error("frame is not a json object")]
	NotAnObject,
}

/// What an inbound text frame turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
	Request(RequestFrame),
	/// Any other object; carries its `type` when that is a string.
	Ignored(Option<String>),
}

/// One failed field constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
	Missing(&'static str),
	TooLong {
		field: &'static str,
		max: usize,
	},
	HeaderName(String),
	HeaderValue(String),
}

impl fmt::Display for Violation {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Violation::Missing(field) => write!(f, "{field} is required"),
			Violation::TooLong { field, max } => write!(f, "{field} exceeds {max} bytes"),
			Violation::HeaderName(name) => write!(f, "invalid header name {name:?}"),
			Violation::HeaderValue(name) => write!(f, "value of header {name:?} exceeds {MAX_HEADER_VALUE_LEN} bytes"),
		}
	}
}

/// A request frame that decoded fine but breaks one or more field constraints.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("request failed validation: {}", join_violations(.violations))]
pub struct ValidationError {
	pub violations: Vec<Violation>,
}

fn join_violations(violations: &[Violation]) -> String {
	violations.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

/// Decode a request frame from a text payload.
///
/// Unknown fields are ignored. Anything that is not a JSON object with
/// correctly typed fields is a decode error.
pub fn decode_request(text: &str, max_frame_size: usize) -> Result<RequestFrame, CodecError> {
	Ok(serde_json::from_value(parse_object(text, max_frame_size)?)?)
}

/// Decode an inbound frame, looking at `type` before anything else.
///
/// Objects whose `type` is not `"request"` are [`Inbound::Ignored`] whatever
/// their other fields hold. Only request frames go through the typed decode.
pub fn decode_inbound(text: &str, max_frame_size: usize) -> Result<Inbound, CodecError> {
	let value = parse_object(text, max_frame_size)?;
	let kind = value.get("type").and_then(Value::as_str);
	if kind != Some(REQUEST_TYPE) {
		return Ok(Inbound::Ignored(kind.map(str::to_owned)));
	}
	Ok(Inbound::Request(serde_json::from_value(value)?))
}

fn parse_object(text: &str, max_frame_size: usize) -> Result<Value, CodecError> {
	check_len(text.len(), max_frame_size)?;
	let value: Value = serde_json::from_str(text)?;
	if !value.is_object() {
		return Err(CodecError::NotAnObject);
	}
	Ok(value)
}

pub fn encode_request(frame: &RequestFrame) -> Result<String, CodecError> {
	Ok(serde_json::to_string(frame)?)
}

pub fn decode_response(text: &str, max_frame_size: usize) -> Result<ResponseFrame, CodecError> {
	check_len(text.len(), max_frame_size)?;
	Ok(serde_json::from_str(text)?)
}

pub fn encode_response(frame: &ResponseFrame) -> Result<String, CodecError> {
	Ok(serde_json::to_string(frame)?)
}

#[inline]
fn check_len(len: usize, max: usize) -> Result<(), CodecError> {
	if len > max {
		return Err(CodecError::FrameTooLarge { len, max });
	}
	Ok(())
}

/// Check the structural constraints of a decoded request.
///
/// `id` and `path` are required and non-blank, and lengths are bounded.
/// Path syntax is left to whoever consumes the path.
pub fn validate_request(frame: &RequestFrame) -> Result<(), ValidationError> {
	let mut violations = Vec::new();

	match frame.id.as_deref() {
		None => violations.push(Violation::Missing("id")),
		Some(id) if id.trim().is_empty() => violations.push(Violation::Missing("id")),
		Some(id) if id.len() > MAX_ID_LEN => violations.push(Violation::TooLong {
			field: "id",
			max: MAX_ID_LEN,
		}),
		Some(_) => {}
	}

	match frame.path.as_deref() {
		None => violations.push(Violation::Missing("path")),
		Some(path) if path.trim().is_empty() => violations.push(Violation::Missing("path")),
		Some(path) if path.len() > MAX_PATH_LEN => violations.push(Violation::TooLong {
			field: "path",
			max: MAX_PATH_LEN,
		}),
		Some(_) => {}
	}

	if let Some(headers) = &frame.headers {
		for (name, value) in headers {
			if name.trim().is_empty() || name.len() > MAX_HEADER_NAME_LEN {
				violations.push(Violation::HeaderName(name.clone()));
			}
			if value.len() > MAX_HEADER_VALUE_LEN {
				violations.push(Violation::HeaderValue(name.clone()));
			}
		}
	}

	if violations.is_empty() {
		Ok(())
	} else {
		Err(ValidationError { violations })
	}
}
