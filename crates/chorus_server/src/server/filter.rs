#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chorus_domain::{SubscriptionId, TopicPath};
use chorus_protocol::{RequestFrame, ResponseFrame, StatusCode, headers};
use futures::FutureExt as _;
use thiserror::Error;
use tracing::debug;

use crate::server::context::ExecutionContext;
use crate::server::session::SessionRef;
use crate::server::subscriptions::{SubscriptionRegistry, SubscriptionSelector};

/// One step of request processing.
///
/// Returning `Ok(false)` stops the chain without error; the response as
/// mutated so far is still sent.
#[async_trait]
pub trait Filter: Send + Sync {
	fn name(&self) -> &'static str;

	async fn filter(
		&self,
		ctx: &ExecutionContext,
		request: &RequestFrame,
		response: &mut ResponseFrame,
		session: &SessionRef,
	) -> anyhow::Result<bool>;
}

#[derive(Debug, Error)]
pub enum FilterError {
	#[error("filter {filter} failed: {error:#}")]
	Failed {
		filter: &'static str,
		error: anyhow::Error,
	},

	#[error("filter {filter} panicked: {message}")]
	Panicked {
		filter: &'static str,
		message: String,
	},
}

/// Ordered filters run for every valid request.
#[derive(Clone, Default)]
pub struct FilterChain {
	filters: Vec<Arc<dyn Filter>>,
}

impl FilterChain {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with(mut self, filter: Arc<dyn Filter>) -> Self {
		self.filters.push(filter);
		self
	}

	pub fn push(&mut self, filter: Arc<dyn Filter>) {
		self.filters.push(filter);
	}

	pub fn len(&self) -> usize {
		self.filters.len()
	}

	pub fn is_empty(&self) -> bool {
		self.filters.is_empty()
	}

	pub fn names(&self) -> Vec<&'static str> {
		self.filters.iter().map(|f| f.name()).collect()
	}

	/// Run the filters in order. Returns `Ok(false)` if one of them stopped
	/// the chain; a failing or panicking filter aborts it.
	pub async fn filter(
		&self,
		ctx: &ExecutionContext,
		request: &RequestFrame,
		response: &mut ResponseFrame,
		session: &SessionRef,
	) -> Result<bool, FilterError> {
		for f in &self.filters {
			let outcome = AssertUnwindSafe(f.filter(ctx, request, &mut *response, session))
				.catch_unwind()
				.await;

			match outcome {
				Ok(Ok(true)) => {}
				Ok(Ok(false)) => {
					debug!(filter = f.name(), "filter chain stopped");
					return Ok(false);
				}
				Ok(Err(error)) => {
					return Err(FilterError::Failed {
						filter: f.name(),
						error,
					});
				}
				Err(payload) => {
					return Err(FilterError::Panicked {
						filter: f.name(),
						message: panic_message(&*payload),
					});
				}
			}
		}
		Ok(true)
	}
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
	if let Some(s) = payload.downcast_ref::<&str>() {
		s.to_string()
	} else if let Some(s) = payload.downcast_ref::<String>() {
		s.clone()
	} else {
		"non-string panic payload".to_string()
	}
}

/// Where the subscription filter sits relative to the other filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterPhase {
	/// Before the other filters.
	#[default]
	Pre,

	/// After the other filters.
	Post,
}

impl FilterPhase {
	pub const fn as_str(self) -> &'static str {
		match self {
			FilterPhase::Pre => "pre",
			FilterPhase::Post => "post",
		}
	}
}

impl fmt::Display for FilterPhase {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown filter phase {0:?} (expected pre or post)")]
pub struct UnknownPhase(pub String);

impl FromStr for FilterPhase {
	type Err = UnknownPhase;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"pre" => Ok(FilterPhase::Pre),
			"post" => Ok(FilterPhase::Post),
			other => Err(UnknownPhase(other.to_string())),
		}
	}
}

/// Treats a request path as a topic: subscribes the session to it, or
/// unsubscribes when the request carries a truthy `unsubscribe` header.
///
/// The filter never stops the chain.
pub struct SubscriptionFilter {
	registry: Arc<SubscriptionRegistry>,
	phase: FilterPhase,
	subscribable_prefixes: Vec<String>,
}

impl SubscriptionFilter {
	pub fn new(registry: Arc<SubscriptionRegistry>, phase: FilterPhase) -> Self {
		Self {
			registry,
			phase,
			subscribable_prefixes: Vec::new(),
		}
	}

	/// Only paths under one of `prefixes` are subscribed. Empty means every path.
	pub fn with_subscribable_prefixes(mut self, prefixes: Vec<String>) -> Self {
		self.subscribable_prefixes = prefixes;
		self
	}

	pub fn phase(&self) -> FilterPhase {
		self.phase
	}

	fn is_subscribable(&self, topic: &TopicPath) -> bool {
		self.subscribable_prefixes.is_empty() || self.subscribable_prefixes.iter().any(|p| topic.is_under(p))
	}

	fn unsubscribe(&self, request: &RequestFrame, response: &mut ResponseFrame, session: &SessionRef) {
		let path = request.path_str();
		let selector = match request.header(headers::SUBSCRIPTION_ID) {
			Some(raw) => match raw.parse::<SubscriptionId>() {
				Ok(id) => SubscriptionSelector::Id(id),
				Err(e) => {
					debug!(session_id = %session.id(), error = %e, "unsubscribe with invalid subscription id");
					response.status = StatusCode::NotFound;
					return;
				}
			},
			None => SubscriptionSelector::Topic(path),
		};

		match self.registry.unsubscribe(selector, session.id()) {
			Ok(removed) => {
				debug!(session_id = %session.id(), path, removed, "unsubscribed");
			}
			Err(e) => {
				debug!(session_id = %session.id(), error = %e, "unsubscribe rejected");
				response.status = StatusCode::NotFound;
			}
		}
	}

	fn subscribe(&self, request: &RequestFrame, response: &mut ResponseFrame, session: &SessionRef) {
		let topic = match TopicPath::parse(request.path_str()) {
			Ok(topic) => topic,
			Err(e) => {
				debug!(session_id = %session.id(), error = %e, "subscribe rejected");
				response.status = StatusCode::NotFound;
				return;
			}
		};

		if !self.is_subscribable(&topic) {
			return;
		}

		match self.registry.subscribe(topic.as_str(), session) {
			Ok(sub) => {
				response.set_header(headers::SUBSCRIPTION_TOPIC, sub.topic.as_str());
				response.set_header(headers::SUBSCRIPTION_ID, sub.id.to_string());
			}
			Err(e) => {
				debug!(session_id = %session.id(), error = %e, "subscribe rejected");
				response.status = StatusCode::NotFound;
			}
		}
	}
}

#[async_trait]
impl Filter for SubscriptionFilter {
	fn name(&self) -> &'static str {
		"subscription"
	}

	async fn filter(
		&self,
		_ctx: &ExecutionContext,
		request: &RequestFrame,
		response: &mut ResponseFrame,
		session: &SessionRef,
	) -> anyhow::Result<bool> {
		match request.header(headers::UNSUBSCRIBE) {
			Some(marker) if headers::is_truthy(marker) => self.unsubscribe(request, response, session),
			// Present but not truthy: neither subscribe nor unsubscribe.
			Some(_) => {}
			None => self.subscribe(request, response, session),
		}
		Ok(true)
	}
}

/// Logs every request that reaches it.
#[derive(Debug, Default)]
pub struct AccessLogFilter;

#[async_trait]
impl Filter for AccessLogFilter {
	fn name(&self) -> &'static str {
		"access_log"
	}

	async fn filter(
		&self,
		ctx: &ExecutionContext,
		request: &RequestFrame,
		_response: &mut ResponseFrame,
		session: &SessionRef,
	) -> anyhow::Result<bool> {
		debug!(
			session_id = %session.id(),
			user_id = %ctx.identity.id,
			request_id = request.id.as_deref().unwrap_or_default(),
			path = request.path_str(),
			"request"
		);
		Ok(true)
	}
}

/// Assemble the default chain, placing the subscription filter according to
/// its phase.
pub fn build_chain(subscription: SubscriptionFilter, others: Vec<Arc<dyn Filter>>) -> FilterChain {
	let phase = subscription.phase();
	let subscription: Arc<dyn Filter> = Arc::new(subscription);

	let mut chain = FilterChain::new();
	match phase {
		FilterPhase::Pre => {
			chain.push(subscription);
			others.into_iter().for_each(|f| chain.push(f));
		}
		FilterPhase::Post => {
			others.into_iter().for_each(|f| chain.push(f));
			chain.push(subscription);
		}
	}
	chain
}
