#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use chorus_domain::{InvalidPath, SessionId, SubscriptionId, TopicPath};
use chorus_protocol::{ResponseFrame, encode_response};
use dashmap::DashMap;
use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, warn};

use crate::server::session::SessionRef;

/// How repeated subscribes from one session to one topic are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
	/// Every subscribe creates a new subscription.
	#[default]
	AllowDuplicates,

	/// A repeated subscribe returns the session's existing subscription.
	DedupePerSession,
}

#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
	pub duplicates: DuplicatePolicy,

	pub debug_logs: bool,
}

/// One (session, topic) binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
	pub id: SubscriptionId,
	pub topic: TopicPath,
	pub owner: SessionId,
}

/// Which subscriptions an unsubscribe removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionSelector<'a> {
	/// Every subscription the session holds on this topic.
	Topic(&'a str),

	/// One subscription, if the session owns it.
	Id(SubscriptionId),
}

/// Outcome of fanning one payload out to a topic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
	pub recipients: usize,
	pub delivered: usize,
	pub failed: usize,
}

struct Subscriber {
	subscription: Subscription,
	session: SessionRef,
}

/// Topic to subscriber index.
///
/// Guards on `topics` and `sessions` are never held at the same time, and
/// never across an await point.
#[derive(Default)]
pub struct SubscriptionRegistry {
	topics: DashMap<TopicPath, HashMap<SubscriptionId, Subscriber>>,
	sessions: DashMap<SessionId, HashMap<SubscriptionId, TopicPath>>,
	cfg: RegistryConfig,
}

impl SubscriptionRegistry {
	pub fn new(cfg: RegistryConfig) -> Self {
		Self {
			topics: DashMap::new(),
			sessions: DashMap::new(),
			cfg,
		}
	}

	/// Bind `session` to `topic`.
	pub fn subscribe(&self, topic: &str, session: &SessionRef) -> Result<Subscription, InvalidPath> {
		let topic = TopicPath::parse(topic)?;
		let owner = session.id().clone();

		let mut entry = self.topics.entry(topic.clone()).or_default();

		if self.cfg.duplicates == DuplicatePolicy::DedupePerSession
			&& let Some(existing) = entry.values().find(|s| s.subscription.owner == owner)
		{
			return Ok(existing.subscription.clone());
		}

		let subscription = Subscription {
			id: SubscriptionId::new_v4(),
			topic: topic.clone(),
			owner: owner.clone(),
		};
		entry.insert(
			subscription.id,
			Subscriber {
				subscription: subscription.clone(),
				session: Arc::clone(session),
			},
		);
		let topic_subs = entry.len();
		drop(entry);

		self.sessions
			.entry(owner)
			.or_default()
			.insert(subscription.id, topic.clone());

		metrics::gauge!("chorus_server_subscriptions_active").increment(1.0);
		if self.cfg.debug_logs {
			debug!(topic = %topic, subscription_id = %subscription.id, subs = topic_subs, "registry: subscribed");
		}

		Ok(subscription)
	}

	/// Remove the selected subscriptions owned by `owner`. Returns how many
	/// were removed; removing nothing is not an error.
	pub fn unsubscribe(&self, selector: SubscriptionSelector<'_>, owner: &SessionId) -> Result<usize, InvalidPath> {
		let removed: Vec<(SubscriptionId, TopicPath)> = match selector {
			SubscriptionSelector::Topic(topic) => {
				let topic = TopicPath::parse(topic)?;
				match self.sessions.get_mut(owner) {
					Some(mut owned) => {
						let ids: Vec<SubscriptionId> =
							owned.iter().filter(|(_, t)| **t == topic).map(|(id, _)| *id).collect();
						ids.into_iter()
							.filter_map(|id| owned.remove(&id).map(|t| (id, t)))
							.collect()
					}
					None => Vec::new(),
				}
			}
			SubscriptionSelector::Id(id) => match self.sessions.get_mut(owner) {
				Some(mut owned) => owned.remove(&id).map(|t| (id, t)).into_iter().collect(),
				None => Vec::new(),
			},
		};

		self.sessions.remove_if(owner, |_, owned| owned.is_empty());

		for (id, topic) in &removed {
			self.detach(topic, id);
		}

		if self.cfg.debug_logs && !removed.is_empty() {
			debug!(session_id = %owner, removed = removed.len(), "registry: unsubscribed");
		}

		Ok(removed.len())
	}

	/// Drop every subscription owned by `owner`.
	pub fn remove_all_for_session(&self, owner: &SessionId) -> usize {
		let Some((_, owned)) = self.sessions.remove(owner) else {
			return 0;
		};

		for (id, topic) in &owned {
			self.detach(topic, id);
		}

		debug!(session_id = %owner, removed = owned.len(), "registry: session subscriptions removed");
		owned.len()
	}

	fn detach(&self, topic: &TopicPath, id: &SubscriptionId) {
		let (removed, now_empty) = match self.topics.get_mut(topic) {
			Some(mut subs) => {
				let removed = subs.remove(id).is_some();
				(removed, subs.is_empty())
			}
			None => (false, false),
		};

		if removed {
			metrics::gauge!("chorus_server_subscriptions_active").decrement(1.0);
		}
		if now_empty {
			self.topics.remove_if(topic, |_, subs| subs.is_empty());
		}
	}

	/// Deliver `payload` to every current subscriber of `topic`.
	///
	/// Recipients are snapshotted before any send; one failing or slow
	/// recipient does not prevent delivery to the others.
	pub async fn publish(&self, topic: &str, payload: Value) -> Result<PublishReport, InvalidPath> {
		let topic = TopicPath::parse(topic)?;

		let recipients: Vec<(SubscriptionId, SessionRef)> = match self.topics.get(&topic) {
			Some(subs) => subs
				.values()
				.map(|s| (s.subscription.id, Arc::clone(&s.session)))
				.collect(),
			None => Vec::new(),
		};

		let mut report = PublishReport {
			recipients: recipients.len(),
			..PublishReport::default()
		};
		if recipients.is_empty() {
			return Ok(report);
		}

		let sends = recipients.into_iter().map(|(id, session)| {
			let frame = ResponseFrame::event(&topic, id, payload.clone());
			async move {
				let text = match encode_response(&frame) {
					Ok(text) => text,
					Err(e) => return Err((session.id().clone(), e.to_string())),
				};
				session.send(text).await.map_err(|e| (session.id().clone(), e.to_string()))
			}
		});

		for result in join_all(sends).await {
			match result {
				Ok(()) => report.delivered += 1,
				Err((session_id, error)) => {
					report.failed += 1;
					metrics::counter!("chorus_server_send_failures_total", "kind" => "event").increment(1);
					warn!(topic = %topic, session_id = %session_id, error = %error, "event delivery failed");
				}
			}
		}

		metrics::counter!("chorus_server_publish_deliveries_total").increment(report.delivered as u64);
		if self.cfg.debug_logs {
			debug!(topic = %topic, delivered = report.delivered, failed = report.failed, "registry: published");
		}

		Ok(report)
	}

	pub fn subscriber_count(&self, topic: &str) -> usize {
		match TopicPath::parse(topic) {
			Ok(topic) => self.topics.get(&topic).map(|subs| subs.len()).unwrap_or(0),
			Err(_) => 0,
		}
	}

	pub fn subscriptions_for_session(&self, owner: &SessionId) -> Vec<Subscription> {
		let Some(owned) = self.sessions.get(owner) else {
			return Vec::new();
		};
		let mut subs: Vec<Subscription> = owned
			.iter()
			.map(|(id, topic)| Subscription {
				id: *id,
				topic: topic.clone(),
				owner: owner.clone(),
			})
			.collect();
		subs.sort_by(|a, b| a.topic.cmp(&b.topic).then(a.id.cmp(&b.id)));
		subs
	}

	pub fn topic_count(&self) -> usize {
		self.topics.len()
	}

	pub fn subscription_count(&self) -> usize {
		self.topics.iter().map(|e| e.value().len()).sum()
	}
}
