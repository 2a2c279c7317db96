#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::anyhow;
use async_trait::async_trait;
use chorus_domain::Identity;
use chorus_protocol::{RequestFrame, ResponseFrame, StatusCode, encode_request, headers};
use serde_json::json;

use crate::server::context::{ContextManager, ExecutionContext};
use crate::server::engine::{EngineSettings, ProtocolEngine};
use crate::server::filter::{AccessLogFilter, Filter, FilterChain, FilterPhase, SubscriptionFilter, build_chain};
use crate::server::session::{Session, SessionRef};
use crate::server::subscriptions::{RegistryConfig, SubscriptionRegistry};
use crate::server::test_support::RecordingSession;

fn engine_with(chain: FilterChain) -> ProtocolEngine {
	ProtocolEngine::new(chain, Arc::new(ContextManager::new()), EngineSettings::default())
}

fn subscribing_engine() -> (ProtocolEngine, Arc<SubscriptionRegistry>) {
	let registry = Arc::new(SubscriptionRegistry::new(RegistryConfig::default()));
	let chain = build_chain(
		SubscriptionFilter::new(Arc::clone(&registry), FilterPhase::Pre),
		vec![Arc::new(AccessLogFilter) as Arc<dyn Filter>],
	);
	(engine_with(chain), registry)
}

/// Records the context it observed and optionally fails, panics or stops.
#[derive(Default)]
struct RecordingFilter {
	seen: std::sync::Mutex<Vec<ExecutionContext>>,
	calls: AtomicUsize,
	behavior: FilterBehavior,
}

#[derive(Default, Clone, Copy)]
enum FilterBehavior {
	#[default]
	Continue,
	Stop,
	Fail,
	Panic,
}

impl RecordingFilter {
	fn new(behavior: FilterBehavior) -> Arc<Self> {
		Arc::new(Self {
			behavior,
			..Self::default()
		})
	}
}

#[async_trait]
impl Filter for RecordingFilter {
	fn name(&self) -> &'static str {
		"recording"
	}

	async fn filter(
		&self,
		ctx: &ExecutionContext,
		_request: &RequestFrame,
		response: &mut ResponseFrame,
		_session: &SessionRef,
	) -> anyhow::Result<bool> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		self.seen.lock().unwrap().push(ctx.clone());
		response.set_header("x-recorded", "1");
		match self.behavior {
			FilterBehavior::Continue => Ok(true),
			FilterBehavior::Stop => Ok(false),
			FilterBehavior::Fail => Err(anyhow!("filter failure")),
			FilterBehavior::Panic => panic!("filter panic"),
		}
	}
}

#[tokio::test]
async fn ping_with_noop_chain_gets_ok() {
	let engine = engine_with(FilterChain::new());
	let s = RecordingSession::new("s");

	assert!(
		engine
			.handle(&s.as_session(), r#"{"type":"request","id":"r1","path":"/ping"}"#)
			.await
	);

	assert_eq!(s.sent(), vec![r#"{"requestId":"r1","status":200,"headers":{},"body":null}"#.to_string()]);
}

#[tokio::test]
async fn undecodable_frame_gets_other_with_null_request_id() {
	let engine = engine_with(FilterChain::new());
	let s = RecordingSession::new("s");

	for raw in ["not-json-at-all", "[1,2]", r#"{"type":"request","id":5}"#, ""] {
		assert!(engine.handle(&s.as_session(), raw).await);
		let resp = s.last_response();
		assert_eq!(resp.status, StatusCode::Other, "for {raw:?}");
		assert_eq!(resp.request_id, None);
	}
}

#[tokio::test]
async fn oversized_frame_gets_other() {
	let engine = ProtocolEngine::new(
		FilterChain::new(),
		Arc::new(ContextManager::new()),
		EngineSettings { max_frame_bytes: 32 },
	);
	let s = RecordingSession::new("s");
	let raw = encode_request(&RequestFrame::request("r1", "/ping").with_body(json!("x".repeat(64)))).unwrap();

	assert!(engine.handle(&s.as_session(), &raw).await);
	assert_eq!(s.last_response().status, StatusCode::Other);
}

#[tokio::test]
async fn non_request_frames_are_ignored_silently() {
	let recorder = RecordingFilter::new(FilterBehavior::Continue);
	let engine = engine_with(FilterChain::new().with(recorder.clone()));
	let s = RecordingSession::new("s");

	for raw in [
		r#"{"type":"response","id":"r2"}"#,
		r#"{"id":"r2","path":"/ping"}"#,
		r#"{"type":"REQUEST","id":"r2","path":"/ping"}"#,
		r#"{"type":"response","id":7,"headers":{"n":1}}"#,
		r#"{"type":"response","requestId":null,"status":"weird","body":[1]}"#,
		r#"{"type":null,"path":42}"#,
	] {
		assert!(!engine.handle(&s.as_session(), raw).await);
	}
	assert!(s.sent().is_empty());
	assert_eq!(recorder.calls.load(Ordering::SeqCst), 0);
	assert_eq!(engine.contexts().active_units(), 0);
}

#[tokio::test]
async fn invalid_request_gets_protocol_error_with_its_id() {
	let recorder = RecordingFilter::new(FilterBehavior::Continue);
	let engine = engine_with(FilterChain::new().with(recorder.clone()));
	let s = RecordingSession::new("s");

	assert!(engine.handle(&s.as_session(), r#"{"type":"request","id":"r9"}"#).await);
	let resp = s.last_response();
	assert_eq!(resp.status, StatusCode::ProtocolError);
	assert_eq!(resp.request_id.as_deref(), Some("r9"));

	assert!(engine.handle(&s.as_session(), r#"{"type":"request","path":"/ping"}"#).await);
	let resp = s.last_response();
	assert_eq!(resp.status, StatusCode::ProtocolError);
	assert_eq!(resp.request_id, None);

	assert_eq!(recorder.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn relative_and_malformed_paths_share_the_not_found_answer() {
	let (engine, registry) = subscribing_engine();
	let s = RecordingSession::new("s");

	for (id, path) in [("a", "room/1"), ("b", "/room//1"), ("c", "room")] {
		let raw = encode_request(&RequestFrame::request(id, path)).unwrap();
		assert!(engine.handle(&s.as_session(), &raw).await);
		let resp = s.last_response();
		assert_eq!(resp.status, StatusCode::NotFound, "for {path:?}");
		assert_eq!(resp.request_id.as_deref(), Some(id));
	}
	assert_eq!(registry.subscription_count(), 0);
}

#[tokio::test]
async fn subscribe_request_returns_subscription_headers() {
	let (engine, registry) = subscribing_engine();
	let s = RecordingSession::new("s");

	assert!(
		engine
			.handle(&s.as_session(), r#"{"type":"request","id":"r3","path":"/room/1","headers":{}}"#)
			.await
	);

	let resp = s.last_response();
	assert_eq!(resp.status, StatusCode::Ok);
	assert_eq!(resp.request_id.as_deref(), Some("r3"));
	assert_eq!(resp.header(headers::SUBSCRIPTION_TOPIC), Some("/room/1"));

	let subs = registry.subscriptions_for_session(s.id());
	assert_eq!(subs.len(), 1);
	assert_eq!(resp.header(headers::SUBSCRIPTION_ID), Some(subs[0].id.to_string().as_str()));
}

#[tokio::test]
async fn unsubscribe_without_prior_subscription_is_ok_and_changes_nothing() {
	let (engine, registry) = subscribing_engine();
	let s = RecordingSession::new("s");
	let other = RecordingSession::new("o");
	registry.subscribe("/room/1", &other.as_session()).unwrap();

	assert!(
		engine
			.handle(
				&s.as_session(),
				r#"{"type":"request","id":"r4","path":"/room/1","headers":{"unsubscribe":"1"}}"#
			)
			.await
	);

	let resp = s.last_response();
	assert_eq!(resp.status, StatusCode::Ok);
	assert_eq!(resp.request_id.as_deref(), Some("r4"));
	assert!(resp.headers.is_empty());
	assert_eq!(registry.subscription_count(), 1);
	assert_eq!(registry.subscriber_count("/room/1"), 1);
}

#[tokio::test]
async fn subscribe_then_unsubscribe_round_trip() {
	let (engine, registry) = subscribing_engine();
	let s = RecordingSession::new("s");
	let session = s.as_session();

	engine.handle(&session, r#"{"type":"request","id":"a","path":"/room/1"}"#).await;
	engine.handle(&session, r#"{"type":"request","id":"b","path":"/room/1"}"#).await;
	assert_eq!(registry.subscriber_count("/room/1"), 2);

	let first_id = s.responses()[0].header(headers::SUBSCRIPTION_ID).unwrap().to_string();
	let by_id = RequestFrame::request("c", "/room/1")
		.with_header(headers::UNSUBSCRIBE, "true")
		.with_header(headers::SUBSCRIPTION_ID, first_id);
	engine.handle(&session, &encode_request(&by_id).unwrap()).await;
	assert_eq!(s.last_response().status, StatusCode::Ok);
	assert_eq!(registry.subscriber_count("/room/1"), 1);

	engine
		.handle(
			&session,
			r#"{"type":"request","id":"d","path":"/room/1","headers":{"unsubscribe":"1"}}"#,
		)
		.await;
	assert_eq!(registry.subscriber_count("/room/1"), 0);
}

#[tokio::test]
async fn non_truthy_unsubscribe_marker_does_nothing() {
	let (engine, registry) = subscribing_engine();
	let s = RecordingSession::new("s");

	engine
		.handle(
			&s.as_session(),
			r#"{"type":"request","id":"r5","path":"/room/1","headers":{"unsubscribe":"0"}}"#,
		)
		.await;

	let resp = s.last_response();
	assert_eq!(resp.status, StatusCode::Ok);
	assert!(resp.header(headers::SUBSCRIPTION_ID).is_none());
	assert_eq!(registry.subscription_count(), 0);
}

#[tokio::test]
async fn malformed_topic_is_not_found() {
	let (engine, registry) = subscribing_engine();
	let s = RecordingSession::new("s");

	engine
		.handle(&s.as_session(), r#"{"type":"request","id":"r6","path":"/room/{id}"}"#)
		.await;
	let resp = s.last_response();
	assert_eq!(resp.status, StatusCode::NotFound);
	assert_eq!(resp.request_id.as_deref(), Some("r6"));

	engine
		.handle(
			&s.as_session(),
			r#"{"type":"request","id":"r7","path":"/room/1","headers":{"unsubscribe":"1","subscription-id":"nope"}}"#,
		)
		.await;
	assert_eq!(s.last_response().status, StatusCode::NotFound);
	assert_eq!(registry.topic_count(), 0);
}

#[tokio::test]
async fn subscribable_prefixes_limit_what_gets_subscribed() {
	let registry = Arc::new(SubscriptionRegistry::new(RegistryConfig::default()));
	let chain = build_chain(
		SubscriptionFilter::new(Arc::clone(&registry), FilterPhase::Post)
			.with_subscribable_prefixes(vec!["/room".to_string()]),
		Vec::new(),
	);
	let engine = engine_with(chain);
	let s = RecordingSession::new("s");

	engine.handle(&s.as_session(), r#"{"type":"request","id":"p","path":"/ping"}"#).await;
	let resp = s.last_response();
	assert_eq!(resp.status, StatusCode::Ok);
	assert!(resp.headers.is_empty());

	engine.handle(&s.as_session(), r#"{"type":"request","id":"r","path":"/room/7"}"#).await;
	assert_eq!(s.last_response().header(headers::SUBSCRIPTION_TOPIC), Some("/room/7"));
	assert_eq!(registry.subscription_count(), 1);
}

#[tokio::test]
async fn failing_filter_yields_internal_server_error() {
	let after = RecordingFilter::new(FilterBehavior::Continue);
	let engine = engine_with(
		FilterChain::new()
			.with(RecordingFilter::new(FilterBehavior::Fail))
			.with(after.clone()),
	);
	let s = RecordingSession::new("s");

	assert!(
		engine
			.handle(&s.as_session(), r#"{"type":"request","id":"r8","path":"/x"}"#)
			.await
	);
	let resp = s.last_response();
	assert_eq!(resp.status, StatusCode::InternalServerError);
	assert_eq!(resp.request_id.as_deref(), Some("r8"));
	assert!(resp.headers.is_empty());
	assert_eq!(after.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn panicking_filter_yields_internal_server_error_and_releases_context() {
	let engine = engine_with(FilterChain::new().with(RecordingFilter::new(FilterBehavior::Panic)));
	let s = RecordingSession::new("s");

	assert!(
		engine
			.handle(&s.as_session(), r#"{"type":"request","id":"r9","path":"/x"}"#)
			.await
	);
	assert_eq!(s.last_response().status, StatusCode::InternalServerError);
	assert_eq!(engine.contexts().active_units(), 0);
}

#[tokio::test]
async fn stopping_filter_short_circuits_but_still_responds() {
	let after = RecordingFilter::new(FilterBehavior::Continue);
	let engine = engine_with(
		FilterChain::new()
			.with(RecordingFilter::new(FilterBehavior::Stop))
			.with(after.clone()),
	);
	let s = RecordingSession::new("s");

	assert!(
		engine
			.handle(&s.as_session(), r#"{"type":"request","id":"r10","path":"/x"}"#)
			.await
	);
	let resp = s.last_response();
	assert_eq!(resp.status, StatusCode::Ok);
	assert_eq!(resp.header("x-recorded"), Some("1"));
	assert_eq!(after.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn filters_see_the_sessions_identity() {
	let recorder = RecordingFilter::new(FilterBehavior::Continue);
	let engine = engine_with(FilterChain::new().with(recorder.clone()));
	let s = RecordingSession::with_identity("s", Identity::new("alice").with_extra("tenant", "acme"));

	engine
		.handle(&s.as_session(), r#"{"type":"request","id":"r","path":"/x"}"#)
		.await;

	let seen = recorder.seen.lock().unwrap().clone();
	assert_eq!(seen.len(), 1);
	assert_eq!(seen[0].identity.id, "alice");
	assert_eq!(seen[0].identity.extra.get("tenant").map(String::as_str), Some("acme"));
	assert!(!seen[0].internal);
	assert_eq!(engine.contexts().active_units(), 0);
}

#[tokio::test]
async fn send_failure_is_swallowed() {
	let engine = engine_with(FilterChain::new());
	let s = RecordingSession::new("s");
	s.set_failing(true);

	assert!(
		engine
			.handle(&s.as_session(), r#"{"type":"request","id":"r1","path":"/ping"}"#)
			.await
	);
	assert!(s.sent().is_empty());
}

#[tokio::test]
async fn pre_and_post_phases_place_the_subscription_filter() {
	let registry = Arc::new(SubscriptionRegistry::new(RegistryConfig::default()));
	let pre = build_chain(
		SubscriptionFilter::new(Arc::clone(&registry), FilterPhase::Pre),
		vec![Arc::new(AccessLogFilter) as Arc<dyn Filter>],
	);
	let post = build_chain(
		SubscriptionFilter::new(registry, FilterPhase::Post),
		vec![Arc::new(AccessLogFilter) as Arc<dyn Filter>],
	);
	assert_eq!(pre.names(), vec!["subscription", "access_log"]);
	assert_eq!(post.names(), vec!["access_log", "subscription"]);
}
