#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chorus_domain::{Identity, InvalidPath, TopicPath};
use serde_json::Value;
use thiserror::Error;
use tracing::{Instrument as _, debug, info_span, warn};

use crate::server::context::{ContextManager, ExecutionContext};
use crate::server::subscriptions::{PublishReport, SubscriptionRegistry};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
	#[error(transparent)]
	InvalidPath(#[from] InvalidPath),

	#[error("no publisher registered under {0:?}")]
	UnknownPublisher(String),
}

/// Server-side entry point for pushing events to subscribers.
#[async_trait]
pub trait EventPublisher: Send + Sync {
	async fn publish(&self, topic: &str, payload: Value) -> Result<PublishReport, PublishError>;
}

/// Publishes straight into a registry under an internal execution context.
pub struct RegistryEventPublisher {
	registry: Arc<SubscriptionRegistry>,
	contexts: Arc<ContextManager>,
	identity: Identity,
}

impl RegistryEventPublisher {
	pub const DEFAULT_IDENTITY: &'static str = "system";

	pub fn new(registry: Arc<SubscriptionRegistry>, contexts: Arc<ContextManager>) -> Self {
		Self {
			registry,
			contexts,
			identity: Identity::new(Self::DEFAULT_IDENTITY),
		}
	}

	/// Publish as `identity` instead of the default system identity.
	pub fn with_identity(mut self, identity: Identity) -> Self {
		self.identity = identity;
		self
	}
}

#[async_trait]
impl EventPublisher for RegistryEventPublisher {
	async fn publish(&self, topic: &str, payload: Value) -> Result<PublishReport, PublishError> {
		let mut scope = self
			.contexts
			.begin_with(ExecutionContext::internal(self.identity.clone()));
		let unit = scope.unit();
		let ctx = scope.get_context();
		let span = info_span!("publish", unit, topic, origin = %ctx.identity.id, internal = ctx.internal);

		let report = self.registry.publish(topic, payload).instrument(span).await?;
		debug!(topic, delivered = report.delivered, failed = report.failed, "event published");
		Ok(report)
	}
}

/// How a named publisher is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
	/// The caller waits for delivery.
	#[default]
	Sync,

	/// Delivery runs on a spawned task; the caller gets no report.
	Detached,
}

struct Entry {
	publisher: Arc<dyn EventPublisher>,
	mode: DispatchMode,
}

/// Named publishers, looked up by name at call time.
#[derive(Default)]
pub struct PublisherTable {
	entries: HashMap<String, Entry>,
}

impl PublisherTable {
	pub fn new() -> Self {
		Self::default()
	}

	/// Register `publisher` under `name`, replacing any previous entry.
	pub fn register(&mut self, name: impl Into<String>, publisher: Arc<dyn EventPublisher>, mode: DispatchMode) {
		let name = name.into();
		if self
			.entries
			.insert(name.clone(), Entry { publisher, mode })
			.is_some()
		{
			warn!(name = %name, "publisher replaced");
		}
	}

	/// Registered names with their dispatch modes, sorted by name.
	pub fn names(&self) -> Vec<(&str, DispatchMode)> {
		let mut names: Vec<_> = self.entries.iter().map(|(name, e)| (name.as_str(), e.mode)).collect();
		names.sort_unstable_by_key(|(name, _)| *name);
		names
	}

	/// Publish through the publisher registered as `name`.
	///
	/// Returns `Ok(None)` for detached publishers. The topic is validated
	/// before a detached delivery is spawned.
	pub async fn publish(&self, name: &str, topic: &str, payload: Value) -> Result<Option<PublishReport>, PublishError> {
		let Some(entry) = self.entries.get(name) else {
			return Err(PublishError::UnknownPublisher(name.to_string()));
		};

		match entry.mode {
			DispatchMode::Sync => entry.publisher.publish(topic, payload).await.map(Some),
			DispatchMode::Detached => {
				TopicPath::parse(topic)?;
				let publisher = Arc::clone(&entry.publisher);
				let topic = topic.to_string();
				let name = name.to_string();
				tokio::spawn(async move {
					if let Err(e) = publisher.publish(&topic, payload).await {
						warn!(publisher = %name, topic = %topic, error = %e, "detached publish failed");
					}
				});
				Ok(None)
			}
		}
	}
}
