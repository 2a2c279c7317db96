#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use async_trait::async_trait;
use chorus_domain::SessionId;
use chorus_protocol::version::SUBPROTOCOL;
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode, header};
use tracing::{debug, info, warn};

use crate::server::auth::HandshakeAuthenticator;
use crate::server::engine::ProtocolEngine;
use crate::server::session::{Attributes, SendError, Session, SessionRef};
use crate::server::subscriptions::SubscriptionRegistry;

/// Attribute key holding the peer's socket address.
pub const REMOTE_ADDR_ATTRIBUTE: &str = "chorus.remote_addr";

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	/// Outbound frames buffered per connection before `send` waits.
	pub outbound_queue_capacity: usize,

	/// How long teardown waits for queued frames to flush.
	pub close_timeout: Duration,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			outbound_queue_capacity: 256,
			close_timeout: Duration::from_secs(5),
		}
	}
}

/// Everything a connection needs once accepted.
pub struct Transport {
	pub engine: Arc<ProtocolEngine>,
	pub registry: Arc<SubscriptionRegistry>,
	pub authenticator: Arc<dyn HandshakeAuthenticator>,
	pub settings: ConnectionSettings,
}

/// Accept connections until the listener fails.
pub async fn serve(listener: TcpListener, transport: Arc<Transport>) -> anyhow::Result<()> {
	loop {
		let (stream, remote) = listener.accept().await.context("accept tcp connection")?;
		metrics::counter!("chorus_server_connections_total").increment(1);

		let transport = Arc::clone(&transport);
		tokio::spawn(async move {
			if let Err(e) = handle_connection(stream, remote, transport).await {
				warn!(remote = %remote, error = %e, "connection handler exited with error");
			}
		});
	}
}

/// Credential presented at upgrade: `Authorization: Bearer <token>`, else
/// the `token` query parameter.
pub fn extract_credential(req: &Request) -> Option<String> {
	if let Some(value) = req.headers().get(header::AUTHORIZATION)
		&& let Ok(value) = value.to_str()
		&& let Some((scheme, token)) = value.trim().split_once(' ')
		&& scheme.eq_ignore_ascii_case("bearer")
	{
		let token = token.trim();
		if !token.is_empty() {
			return Some(token.to_string());
		}
	}

	req.uri()
		.query()?
		.split('&')
		.filter_map(|pair| pair.split_once('='))
		.find(|(k, _)| *k == "token")
		.map(|(_, v)| v.to_string())
		.filter(|v| !v.is_empty())
}

fn unauthorized() -> ErrorResponse {
	let mut resp = ErrorResponse::new(Some("unauthorized".to_string()));
	*resp.status_mut() = StatusCode::UNAUTHORIZED;
	resp
}

fn offers_subprotocol(req: &Request) -> bool {
	req.headers()
		.get_all(header::SEC_WEBSOCKET_PROTOCOL)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.flat_map(|v| v.split(','))
		.any(|p| p.trim() == SUBPROTOCOL)
}

pub async fn handle_connection(stream: TcpStream, remote: SocketAddr, transport: Arc<Transport>) -> anyhow::Result<()> {
	let authenticator = Arc::clone(&transport.authenticator);
	let (identity_tx, mut identity_rx) = oneshot::channel();

	let ws = tokio_tungstenite::accept_hdr_async(stream, move |req: &Request, mut resp: Response| {
		let credential = extract_credential(req);
		match authenticator.authenticate(credential.as_deref()) {
			Ok(identity) => {
				if offers_subprotocol(req) {
					resp.headers_mut()
						.insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));
				}
				let _ = identity_tx.send(identity);
				Ok(resp)
			}
			Err(e) => {
				metrics::counter!("chorus_server_handshake_rejections_total").increment(1);
				warn!(remote = %remote, error = %e, "handshake rejected");
				Err(unauthorized())
			}
		}
	})
	.await
	.context("websocket handshake")?;

	let identity = identity_rx
		.try_recv()
		.map_err(|_| anyhow!("handshake completed without an identity"))?;

	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("chorus_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("chorus_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let (out_tx, mut out_rx) = mpsc::channel::<Message>(transport.settings.outbound_queue_capacity.max(1));
	let attributes = Attributes::from_identity(&identity);
	attributes.insert(REMOTE_ADDR_ATTRIBUTE, remote.to_string());
	let ws_session = Arc::new(WsSession {
		id: SessionId::random(),
		attributes,
		outbound: out_tx.clone(),
		closed: AtomicBool::new(false),
	});
	let session: SessionRef = ws_session.clone();

	info!(session_id = %session.id(), user_id = %identity.id, remote = %remote, "session opened");

	let (mut sink, mut stream) = ws.split();

	let writer = tokio::spawn(async move {
		while let Some(msg) = out_rx.recv().await {
			let closing = matches!(msg, Message::Close(_));
			if let Err(e) = sink.send(msg).await {
				debug!(error = %e, "websocket write failed");
				break;
			}
			if closing {
				break;
			}
		}
		let _ = sink.close().await;
	});

	while let Some(msg) = stream.next().await {
		match msg {
			Ok(Message::Text(text)) => {
				transport.engine.handle(&session, text.as_str()).await;
			}
			Ok(Message::Binary(data)) => {
				let text = String::from_utf8_lossy(&data);
				transport.engine.handle(&session, &text).await;
			}
			Ok(Message::Close(frame)) => {
				debug!(session_id = %session.id(), ?frame, "peer closed");
				break;
			}
			Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
			Err(e) => {
				debug!(session_id = %session.id(), error = %e, "websocket read failed");
				break;
			}
		}
	}

	let removed = transport.registry.remove_all_for_session(session.id());
	ws_session.closed.store(true, Ordering::Release);

	let _ = out_tx.try_send(Message::Close(None));
	drop(out_tx);
	let mut writer = writer;
	if tokio::time::timeout(transport.settings.close_timeout, &mut writer).await.is_err() {
		writer.abort();
	}

	info!(session_id = %session.id(), removed_subscriptions = removed, "session closed");
	Ok(())
}

/// A WebSocket connection seen as a [`Session`].
struct WsSession {
	id: SessionId,
	attributes: Attributes,
	outbound: mpsc::Sender<Message>,
	closed: AtomicBool,
}

#[async_trait]
impl Session for WsSession {
	fn id(&self) -> &SessionId {
		&self.id
	}

	fn attributes(&self) -> &Attributes {
		&self.attributes
	}

	async fn send(&self, text: String) -> Result<(), SendError> {
		if self.closed.load(Ordering::Acquire) {
			return Err(SendError::Closed);
		}
		self.outbound
			.send(Message::Text(text.into()))
			.await
			.map_err(|_| SendError::Closed)
	}
}
