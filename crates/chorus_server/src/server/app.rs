#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chorus_domain::Identity;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{AuthSettings, ServerConfig};
use crate::server::auth::{AnonymousAuthenticator, AuthenticatorChain, HmacTokenAuthenticator, StaticTokenAuthenticator};
use crate::server::connection::{ConnectionSettings, Transport};
use crate::server::context::ContextManager;
use crate::server::engine::{EngineSettings, ProtocolEngine};
use crate::server::filter::{AccessLogFilter, Filter, SubscriptionFilter, build_chain};
use crate::server::publisher::{DispatchMode, PublisherTable, RegistryEventPublisher};
use crate::server::subscriptions::{DuplicatePolicy, RegistryConfig, SubscriptionRegistry};
use crate::util::time::unix_ms_now;

/// Name of the publisher every server registers.
pub const EVENTS_PUBLISHER: &str = "events";

pub const HEARTBEAT_TOPIC: &str = "/system/heartbeat";

const STATIC_USER_ID_DEFAULT: &str = "static";

/// The wired server: registry, engine, transport and publishers.
pub struct App {
	pub registry: Arc<SubscriptionRegistry>,
	pub contexts: Arc<ContextManager>,
	pub engine: Arc<ProtocolEngine>,
	pub transport: Arc<Transport>,
	pub publishers: Arc<PublisherTable>,
}

impl App {
	pub fn from_config(cfg: &ServerConfig) -> anyhow::Result<Self> {
		let authenticator = build_authenticator(&cfg.auth)?;

		let registry = Arc::new(SubscriptionRegistry::new(RegistryConfig {
			duplicates: if cfg.subscriptions.dedupe_per_session {
				DuplicatePolicy::DedupePerSession
			} else {
				DuplicatePolicy::AllowDuplicates
			},
			debug_logs: false,
		}));
		let contexts = Arc::new(ContextManager::new());

		let subscription = SubscriptionFilter::new(Arc::clone(&registry), cfg.subscriptions.phase)
			.with_subscribable_prefixes(cfg.subscriptions.subscribable_prefixes.clone());
		let chain = build_chain(subscription, vec![Arc::new(AccessLogFilter) as Arc<dyn Filter>]);
		debug!(filters = ?chain.names(), "filter chain assembled");

		let engine = Arc::new(ProtocolEngine::new(
			chain,
			Arc::clone(&contexts),
			EngineSettings {
				max_frame_bytes: cfg.server.max_frame_bytes,
			},
		));

		let transport = Arc::new(Transport {
			engine: Arc::clone(&engine),
			registry: Arc::clone(&registry),
			authenticator: Arc::new(authenticator),
			settings: ConnectionSettings {
				outbound_queue_capacity: cfg.server.outbound_queue_capacity,
				..ConnectionSettings::default()
			},
		});

		let mut publishers = PublisherTable::new();
		publishers.register(
			EVENTS_PUBLISHER,
			Arc::new(RegistryEventPublisher::new(Arc::clone(&registry), Arc::clone(&contexts))),
			DispatchMode::Sync,
		);
		debug!(publishers = ?publishers.names(), "event publishers registered");

		Ok(Self {
			registry,
			contexts,
			engine,
			transport,
			publishers: Arc::new(publishers),
		})
	}
}

/// Build the handshake authenticator from `[auth]`. Fails if nothing would
/// ever accept a connection.
pub fn build_authenticator(auth: &AuthSettings) -> anyhow::Result<AuthenticatorChain> {
	let mut chain = AuthenticatorChain::new();

	if let Some(token) = auth.static_token.clone() {
		let user_id = auth.static_user_id.as_deref().unwrap_or(STATIC_USER_ID_DEFAULT);
		chain = chain.with(StaticTokenAuthenticator::new(token, Identity::new(user_id)));
		info!(user_id, "server auth: static token enabled");
	}

	if let Some(secret) = auth.hmac_secret.clone() {
		chain = chain.with(HmacTokenAuthenticator::new(secret));
		info!("server auth: hmac tokens enabled");
	}

	if auth.allow_anonymous {
		chain = chain.with(AnonymousAuthenticator::new());
		warn!("server auth: anonymous connections enabled");
	}

	if chain.is_empty() {
		return Err(anyhow!(
			"no authenticator configured (set auth.hmac_secret, auth.static_token or auth.allow_anonymous)"
		));
	}

	Ok(chain)
}

/// Publish `{"ts": <unix ms>}` to the heartbeat topic every `interval`.
pub fn spawn_heartbeat(publishers: Arc<PublisherTable>, interval: Duration) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(interval);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		loop {
			ticker.tick().await;
			match publishers
				.publish(EVENTS_PUBLISHER, HEARTBEAT_TOPIC, json!({ "ts": unix_ms_now() }))
				.await
			{
				Ok(report) => {
					if let Some(report) = report
						&& report.failed > 0
					{
						debug!(failed = report.failed, "heartbeat partially delivered");
					}
				}
				Err(e) => warn!(error = %e, "heartbeat publish failed"),
			}
		}
	})
}

#[cfg(test)]
mod tests {
	use chorus_protocol::headers;

	use super::*;
	use crate::server::auth::HandshakeAuthenticator;
	use crate::server::test_support::RecordingSession;
	use crate::util::secret::SecretString;

	#[test]
	fn no_authenticator_is_a_startup_error() {
		assert!(build_authenticator(&AuthSettings::default()).is_err());
		assert!(App::from_config(&ServerConfig::default()).is_err());
	}

	#[test]
	fn static_token_uses_configured_user_id() {
		let auth = AuthSettings {
			static_token: Some(SecretString::new("tok")),
			static_user_id: Some("ops".to_string()),
			..AuthSettings::default()
		};
		let chain = build_authenticator(&auth).unwrap();
		assert_eq!(chain.authenticate(Some("tok")).unwrap().id, "ops");
		assert!(chain.authenticate(None).is_err());
	}

	#[tokio::test]
	async fn heartbeat_reaches_subscribers() {
		let mut cfg = ServerConfig::default();
		cfg.auth.allow_anonymous = true;
		let app = App::from_config(&cfg).unwrap();

		let s = RecordingSession::new("s");
		app.registry.subscribe(HEARTBEAT_TOPIC, &s.as_session()).unwrap();

		let task = spawn_heartbeat(Arc::clone(&app.publishers), Duration::from_millis(10));
		tokio::time::timeout(Duration::from_secs(1), async {
			while s.sent().is_empty() {
				tokio::time::sleep(Duration::from_millis(5)).await;
			}
		})
		.await
		.expect("heartbeat delivered");
		task.abort();

		let ev = &s.responses()[0];
		assert_eq!(ev.header(headers::SUBSCRIPTION_TOPIC), Some(HEARTBEAT_TOPIC));
		assert!(ev.body["ts"].as_i64().unwrap() > 0);
	}
}
