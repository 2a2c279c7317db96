#![forbid(unsafe_code)]

use core::fmt;
use std::collections::BTreeMap;

use chorus_domain::{SubscriptionId, TopicPath};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::headers;

/// `type` value of a request frame.
pub const REQUEST_TYPE: &str = "request";

/// `type` value some peers put on responses travelling the other way over a reused connection.
pub const RESPONSE_TYPE: &str = "response";

/// Response status with stable integer ids on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum StatusCode {
	#[default]
	Ok,
	NotFound,
	ProtocolError,
	InternalServerError,
	Other,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("unknown status code: {0}")]
pub struct UnknownStatus(pub u16);

impl StatusCode {
	pub const ALL: [StatusCode; 5] = [
		StatusCode::Ok,
		StatusCode::NotFound,
		StatusCode::ProtocolError,
		StatusCode::InternalServerError,
		StatusCode::Other,
	];

	pub const fn as_u16(self) -> u16 {
		match self {
			StatusCode::Ok => 200,
			StatusCode::NotFound => 404,
			StatusCode::ProtocolError => 400,
			StatusCode::InternalServerError => 500,
			StatusCode::Other => 520,
		}
	}

	/// Stable string identifier (used as a metrics label).
	pub const fn as_str(self) -> &'static str {
		match self {
			StatusCode::Ok => "ok",
			StatusCode::NotFound => "not_found",
			StatusCode::ProtocolError => "protocol_error",
			StatusCode::InternalServerError => "internal_server_error",
			StatusCode::Other => "other",
		}
	}
}

impl From<StatusCode> for u16 {
	fn from(status: StatusCode) -> Self {
		status.as_u16()
	}
}

impl TryFrom<u16> for StatusCode {
	type Error = UnknownStatus;

	fn try_from(code: u16) -> Result<Self, Self::Error> {
		StatusCode::ALL
			.into_iter()
			.find(|s| s.as_u16() == code)
			.ok_or(UnknownStatus(code))
	}
}

impl fmt::Display for StatusCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} ({})", self.as_str(), self.as_u16())
	}
}

/// Inbound frame. Every field is optional at decode time so that
/// non-request traffic and incomplete requests still decode; structural
/// requirements are enforced by [`crate::validate_request`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RequestFrame {
	#[serde(rename = "type", default)]
	pub kind: Option<String>,

	#[serde(default)]
	pub id: Option<String>,

	#[serde(default)]
	pub path: Option<String>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub headers: Option<BTreeMap<String, String>>,

	#[serde(default)]
	pub body: Value,
}

impl RequestFrame {
	/// A `type: "request"` frame with the given id and path.
	pub fn request(id: impl Into<String>, path: impl Into<String>) -> Self {
		Self {
			kind: Some(REQUEST_TYPE.to_string()),
			id: Some(id.into()),
			path: Some(path.into()),
			headers: None,
			body: Value::Null,
		}
	}

	pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.headers.get_or_insert_with(BTreeMap::new).insert(name.into(), value.into());
		self
	}

	pub fn with_body(mut self, body: Value) -> Self {
		self.body = body;
		self
	}

	/// Only frames typed `"request"` are handled; everything else is ignored.
	pub fn is_request(&self) -> bool {
		self.kind.as_deref() == Some(REQUEST_TYPE)
	}

	pub fn header(&self, name: &str) -> Option<&str> {
		self.headers.as_ref()?.get(name).map(String::as_str)
	}

	pub fn path_str(&self) -> &str {
		self.path.as_deref().unwrap_or_default()
	}
}

/// Outbound frame: a response to a request, or a pushed subscription event.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResponseFrame {
	#[serde(rename = "requestId", default)]
	pub request_id: Option<String>,

	pub status: StatusCode,

	#[serde(default)]
	pub headers: BTreeMap<String, String>,

	#[serde(default)]
	pub body: Value,
}

impl ResponseFrame {
	pub fn ok() -> Self {
		Self::default()
	}

	/// A body-less response with the given status.
	pub fn failure(status: StatusCode, request_id: Option<String>) -> Self {
		Self {
			request_id,
			status,
			..Self::default()
		}
	}

	/// An event frame pushed to one subscriber of `topic`.
	pub fn event(topic: &TopicPath, subscription_id: SubscriptionId, body: Value) -> Self {
		let mut frame = Self {
			body,
			..Self::default()
		};
		frame.set_header(headers::SUBSCRIPTION_TOPIC, topic.as_str());
		frame.set_header(headers::SUBSCRIPTION_ID, subscription_id.to_string());
		frame
	}

	pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
		self.headers.insert(name.into(), value.into());
	}

	pub fn header(&self, name: &str) -> Option<&str> {
		self.headers.get(name).map(String::as_str)
	}
}
