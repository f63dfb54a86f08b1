#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use futures::{SinkExt, StreamExt};
use meshchat_domain::{ChannelName, ConnectionId, ContextKey, NodeId, UserId};
use meshchat_protocol::{MeshMessage, RpcFailure, RpcOutcome, RpcRequest, decode_mesh_message};
use meshchat_util::endpoint::MeshEndpoint;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::mesh::{MeshClient, MeshNode};

type MeshWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Settings for `WsMeshClient`.
#[derive(Debug, Clone)]
pub struct WsMeshConfig {
	pub endpoint: MeshEndpoint,
	/// Queues to `consume` after every (re)connect. Empty disables the direct path.
	pub consume_queues: Vec<String>,
	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,
	/// How long an acknowledged request waits for its reply.
	pub request_timeout: Duration,
}

#[derive(Debug)]
enum RpcReply {
	Ok(RpcOutcome),
	Err(RpcFailure),
}

struct ClientInner {
	cmd_tx: mpsc::UnboundedSender<String>,
	next_id: AtomicU64,
	pending: Mutex<HashMap<u64, oneshot::Sender<RpcReply>>>,
	request_timeout: Duration,
}

/// JSON-RPC 2.0 client for the substrate over a single websocket.
///
/// All outbound frames go through one writer (the connection task) in enqueue order, so a
/// `set_context_value` issued before a `mesh_send` reaches the substrate first. Consume pushes
/// and unmatched replies are forwarded to the direct-path adapter.
#[derive(Clone)]
pub struct WsMeshClient {
	inner: Arc<ClientInner>,
}

impl WsMeshClient {
	/// Start the connection task. Inbound substrate messages are sent on `inbound_tx`; without
	/// one (no direct path) unmatched replies are logged and dropped.
	pub fn spawn(
		cfg: WsMeshConfig,
		inbound_tx: Option<mpsc::UnboundedSender<MeshMessage>>,
		shutdown: watch::Receiver<bool>,
	) -> (Self, JoinHandle<()>) {
		let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
		let inner = Arc::new(ClientInner {
			cmd_tx,
			next_id: AtomicU64::new(1),
			pending: Mutex::new(HashMap::new()),
			request_timeout: cfg.request_timeout,
		});

		let conn = Connection {
			cfg,
			inner: Arc::clone(&inner),
			cmd_rx,
			inbound_tx,
			shutdown,
		};
		let handle = tokio::spawn(conn.run());

		(Self { inner }, handle)
	}

	/// Enqueue a request. With `await_reply`, wait for the substrate's answer.
	async fn request(&self, build: impl FnOnce(u64) -> RpcRequest, await_reply: bool) -> anyhow::Result<()> {
		let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
		let req = build(id);
		let method = req.method;
		let text = req.to_text().context("encode rpc request")?;

		metrics::counter!("meshchat_mesh_requests_total", "method" => method).increment(1);

		let reply_rx = if await_reply {
			let (tx, rx) = oneshot::channel();
			self.inner.pending.lock().insert(id, tx);
			Some(rx)
		} else {
			None
		};

		if self.inner.cmd_tx.send(text).is_err() {
			self.inner.pending.lock().remove(&id);
			bail!("{method}: mesh client stopped");
		}

		let Some(reply_rx) = reply_rx else {
			return Ok(());
		};

		match tokio::time::timeout(self.inner.request_timeout, reply_rx).await {
			Ok(Ok(RpcReply::Ok(outcome))) => {
				if outcome.fail > 0 {
					debug!(method, id, success = outcome.success, fail = outcome.fail, "mesh request partially failed");
				}
				Ok(())
			}
			Ok(Ok(RpcReply::Err(failure))) => Err(anyhow!(
				"{method} rejected by mesh: {} (code {})",
				failure.message,
				failure.code
			)),
			Ok(Err(_)) => Err(anyhow!("{method}: mesh connection lost before reply")),
			Err(_) => {
				self.inner.pending.lock().remove(&id);
				Err(anyhow!(
					"{method}: no reply within {}ms",
					self.inner.request_timeout.as_millis()
				))
			}
		}
	}
}

impl MeshClient for WsMeshClient {
	fn node(&self, node: NodeId) -> Arc<dyn MeshNode> {
		Arc::new(WsNode {
			client: self.clone(),
			node,
		})
	}
}

struct WsNode {
	client: WsMeshClient,
	node: NodeId,
}

#[async_trait::async_trait]
impl MeshNode for WsNode {
	async fn subscribe(&self, conn: ConnectionId, channels: &[ChannelName]) -> anyhow::Result<()> {
		self.client
			.request(|id| RpcRequest::subscribe(id, self.node, conn, channels), true)
			.await
	}

	async fn unsubscribe(&self, conn: ConnectionId, channels: &[ChannelName]) -> anyhow::Result<()> {
		self.client
			.request(|id| RpcRequest::unsubscribe(id, self.node, conn, channels), true)
			.await
	}

	async fn set_context_value(&self, conn: ConnectionId, key: ContextKey, value: UserId) -> anyhow::Result<()> {
		self.client
			.request(|id| RpcRequest::set_context_value(id, self.node, conn, key, value), true)
			.await
	}

	async fn mesh_send(&self, conn: ConnectionId, payload: &str) -> anyhow::Result<()> {
		self.client
			.request(|id| RpcRequest::send(id, self.node, conn, payload), false)
			.await
	}

	async fn mesh_publish(&self, channel: &ChannelName, payload: &str) -> anyhow::Result<()> {
		self.client
			.request(|id| RpcRequest::publish(id, channel, payload), false)
			.await
	}
}

struct Connection {
	cfg: WsMeshConfig,
	inner: Arc<ClientInner>,
	cmd_rx: mpsc::UnboundedReceiver<String>,
	inbound_tx: Option<mpsc::UnboundedSender<MeshMessage>>,
	shutdown: watch::Receiver<bool>,
}

enum SessionEnd {
	Shutdown,
	Disconnected,
}

impl Connection {
	async fn run(mut self) {
		let url = self.cfg.endpoint.url();
		let mut reconnect_attempt: u32 = 0;

		loop {
			if *self.shutdown.borrow() {
				break;
			}

			if reconnect_attempt > 0 {
				let delay = backoff_delay(
					reconnect_attempt,
					self.cfg.reconnect_min_delay,
					self.cfg.reconnect_max_delay,
				);
				info!(%url, attempt = reconnect_attempt, delay_ms = delay.as_millis(), "mesh: reconnecting");
				tokio::select! {
					_ = sleep(delay) => {}
					_ = self.shutdown.changed() => break,
				}
			}

			let ws = match tokio_tungstenite::connect_async(url.as_str()).await {
				Ok((ws, _resp)) => ws,
				Err(e) => {
					reconnect_attempt = reconnect_attempt.saturating_add(1);
					warn!(%url, error = %e, "mesh: connect failed");
					continue;
				}
			};

			info!(%url, "mesh: connected");
			metrics::counter!("meshchat_mesh_connects_total").increment(1);
			reconnect_attempt = 0;

			let end = self.session(ws).await;
			self.fail_pending();

			match end {
				SessionEnd::Shutdown => break,
				SessionEnd::Disconnected => {
					reconnect_attempt = 1;
				}
			}
		}

		info!("mesh: connection task exiting");
	}

	async fn session(&mut self, mut ws: MeshWs) -> SessionEnd {
		if !self.cfg.consume_queues.is_empty() {
			let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
			match RpcRequest::consume(id, &self.cfg.consume_queues).to_text() {
				Ok(text) => {
					if let Err(e) = ws.send(Message::Text(text.into())).await {
						warn!(error = %e, "mesh: consume request failed");
						return SessionEnd::Disconnected;
					}
					info!(queues = ?self.cfg.consume_queues, "mesh: consuming");
				}
				Err(e) => warn!(error = %e, "mesh: failed to encode consume request"),
			}
		}

		loop {
			tokio::select! {
				_ = self.shutdown.changed() => {
					let _ = ws.close(None).await;
					return SessionEnd::Shutdown;
				}

				cmd = self.cmd_rx.recv() => {
					let Some(text) = cmd else {
						let _ = ws.close(None).await;
						return SessionEnd::Shutdown;
					};
					if let Err(e) = ws.send(Message::Text(text.into())).await {
						warn!(error = %e, "mesh: write failed");
						return SessionEnd::Disconnected;
					}
				}

				msg = ws.next() => {
					let Some(msg) = msg else {
						warn!("mesh: websocket ended");
						return SessionEnd::Disconnected;
					};

					match msg {
						Ok(Message::Text(text)) => self.handle_text(text.as_str()),
						Ok(Message::Ping(p)) => {
							let _ = ws.send(Message::Pong(p)).await;
						}
						Ok(Message::Close(frame)) => {
							warn!(?frame, "mesh: websocket closed");
							return SessionEnd::Disconnected;
						}
						Ok(_) => {}
						Err(e) => {
							warn!(error = %e, "mesh: websocket read error");
							return SessionEnd::Disconnected;
						}
					}
				}
			}
		}
	}

	fn handle_text(&self, text: &str) {
		let msg = match decode_mesh_message(text) {
			Ok(msg) => msg,
			Err(e) => {
				metrics::counter!("meshchat_decode_failures_total", "stage" => "mesh").increment(1);
				warn!(error = %e, "mesh: undecodable frame");
				return;
			}
		};

		let msg = match msg {
			MeshMessage::Result(outcome) => match self.take_pending(outcome.id) {
				Some(tx) => {
					let _ = tx.send(RpcReply::Ok(outcome));
					return;
				}
				None => MeshMessage::Result(outcome),
			},
			MeshMessage::Error(failure) => match self.take_pending(failure.id) {
				Some(tx) => {
					let _ = tx.send(RpcReply::Err(failure));
					return;
				}
				None => MeshMessage::Error(failure),
			},
			other => other,
		};

		let Some(inbound_tx) = &self.inbound_tx else {
			match msg {
				MeshMessage::Error(failure) => {
					warn!(id = ?failure.id, code = failure.code, message = %failure.message, "mesh error");
				}
				other => debug!(msg = ?other, "mesh: no direct path; dropping message"),
			}
			return;
		};
		if inbound_tx.send(msg).is_err() {
			debug!("mesh: inbound receiver dropped");
		}
	}

	fn take_pending(&self, id: Option<u64>) -> Option<oneshot::Sender<RpcReply>> {
		id.and_then(|id| self.inner.pending.lock().remove(&id))
	}

	/// Dropping the senders wakes every waiter with "connection lost".
	fn fail_pending(&self) {
		let dropped = {
			let mut pending = self.inner.pending.lock();
			let n = pending.len();
			pending.clear();
			n
		};
		if dropped > 0 {
			warn!(dropped, "mesh: abandoned in-flight requests");
		}
	}
}

fn backoff_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
	let pow = attempt.saturating_sub(1).min(16);
	let ms = min.as_millis().saturating_mul(1u128 << pow);
	let d = Duration::from_millis(ms.min(u64::MAX as u128) as u64);
	d.min(max).max(min)
}
