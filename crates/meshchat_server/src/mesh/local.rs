#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use meshchat_domain::{ChannelName, ConnectionId, ContextKey, NodeId, UserId};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use crate::mesh::{MeshClient, MeshNode};

/// One call made against the substrate, in issue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshCall {
	Subscribe {
		node: NodeId,
		conn: ConnectionId,
		channels: Vec<ChannelName>,
	},
	Unsubscribe {
		node: NodeId,
		conn: ConnectionId,
		channels: Vec<ChannelName>,
	},
	SetContext {
		node: NodeId,
		conn: ConnectionId,
		key: ContextKey,
		value: UserId,
	},
	Send {
		node: NodeId,
		conn: ConnectionId,
		payload: String,
	},
	Publish {
		node: NodeId,
		channel: ChannelName,
		payload: String,
	},
}

type SlotKey = (NodeId, ConnectionId, ContextKey);
type ConnKey = (NodeId, ConnectionId);

/// In-process substrate: records and logs every call, tracks subscriptions and delivers unicast
/// and fan-out frames into per-connection inboxes. Backs `mesh.backend = "local"` dev runs.
#[derive(Clone, Default)]
pub struct LocalMesh {
	inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
	calls: Mutex<Vec<MeshCall>>,
	subscriptions: Mutex<HashMap<ConnKey, HashSet<ChannelName>>>,
	inboxes: Mutex<HashMap<ConnKey, Vec<String>>>,
	slots: Mutex<HashMap<SlotKey, watch::Sender<Option<UserId>>>>,
	failing: AtomicBool,
}

impl LocalMesh {
	pub fn new() -> Self {
		Self::default()
	}

	fn slot(&self, node: NodeId, conn: ConnectionId, key: ContextKey) -> watch::Sender<Option<UserId>> {
		self.inner
			.slots
			.lock()
			.entry((node, conn, key))
			.or_insert_with(|| watch::channel(None).0)
			.clone()
	}

	fn record(&self, call: MeshCall) -> anyhow::Result<()> {
		if self.inner.failing.load(Ordering::Acquire) {
			return Err(anyhow!("local mesh: injected failure"));
		}
		log_call(&call);
		self.inner.calls.lock().push(call);
		Ok(())
	}

	fn deliver(&self, node: NodeId, conn: ConnectionId, payload: &str) {
		self.inner
			.inboxes
			.lock()
			.entry((node, conn))
			.or_default()
			.push(payload.to_string());
	}
}

/// Inspection helpers used by tests.
#[allow(dead_code)]
impl LocalMesh {
	/// Make every subsequent call fail until reset.
	pub fn set_failing(&self, failing: bool) {
		self.inner.failing.store(failing, Ordering::Release);
	}

	pub fn calls(&self) -> Vec<MeshCall> {
		self.inner.calls.lock().clone()
	}

	pub fn clear_calls(&self) {
		self.inner.calls.lock().clear();
	}

	/// Unicast replies sent to `conn` (`mesh_send` only).
	pub fn sent_to(&self, node: NodeId, conn: ConnectionId) -> Vec<String> {
		self.inner
			.calls
			.lock()
			.iter()
			.filter_map(|c| match c {
				MeshCall::Send {
					node: n,
					conn: cid,
					payload,
				} if *n == node && *cid == conn => Some(payload.clone()),
				_ => None,
			})
			.collect()
	}

	pub fn published(&self) -> Vec<(ChannelName, String)> {
		self.inner
			.calls
			.lock()
			.iter()
			.filter_map(|c| match c {
				MeshCall::Publish { channel, payload, .. } => Some((channel.clone(), payload.clone())),
				_ => None,
			})
			.collect()
	}

	/// Every frame delivered to `conn`, unicast and fan-out, in delivery order.
	pub fn inbox(&self, node: NodeId, conn: ConnectionId) -> Vec<String> {
		self.inner.inboxes.lock().get(&(node, conn)).cloned().unwrap_or_default()
	}

	pub fn is_subscribed(&self, node: NodeId, conn: ConnectionId, channel: &ChannelName) -> bool {
		self.inner
			.subscriptions
			.lock()
			.get(&(node, conn))
			.is_some_and(|chs| chs.contains(channel))
	}

	/// Current slot value, if it was ever written.
	pub fn context_value(&self, node: NodeId, conn: ConnectionId, key: ContextKey) -> Option<UserId> {
		self.inner
			.slots
			.lock()
			.get(&(node, conn, key))
			.and_then(|tx| *tx.borrow())
	}

	/// Block like the substrate's connection script until the slot is written, or `timeout`.
	pub async fn wait_for_context(
		&self,
		node: NodeId,
		conn: ConnectionId,
		key: ContextKey,
		timeout: Duration,
	) -> Option<UserId> {
		let mut rx = self.slot(node, conn, key).subscribe();
		let waited = tokio::time::timeout(timeout, rx.wait_for(|v| v.is_some())).await;
		match waited {
			Ok(Ok(value)) => *value,
			_ => None,
		}
	}

	/// Forget a closed connection's subscriptions, slots and inbox.
	pub fn drop_connection(&self, node: NodeId, conn: ConnectionId) {
		self.inner.subscriptions.lock().remove(&(node, conn));
		self.inner.inboxes.lock().remove(&(node, conn));
		self.inner.slots.lock().retain(|(n, c, _), _| !(*n == node && *c == conn));
	}

}

fn log_call(call: &MeshCall) {
	match call {
		MeshCall::Subscribe { node, conn, channels } => {
			debug!(node_id = %node, conn_id = %conn, ?channels, "local mesh: subscribe");
		}
		MeshCall::Unsubscribe { node, conn, channels } => {
			debug!(node_id = %node, conn_id = %conn, ?channels, "local mesh: unsubscribe");
		}
		MeshCall::SetContext { node, conn, key, value } => {
			debug!(node_id = %node, conn_id = %conn, %key, %value, "local mesh: set context");
		}
		MeshCall::Send { node, conn, payload } => {
			debug!(node_id = %node, conn_id = %conn, %payload, "local mesh: send");
		}
		MeshCall::Publish { node, channel, payload } => {
			debug!(node_id = %node, %channel, %payload, "local mesh: publish");
		}
	}
}

impl MeshClient for LocalMesh {
	fn node(&self, node: NodeId) -> Arc<dyn MeshNode> {
		Arc::new(LocalNode {
			mesh: self.clone(),
			node,
		})
	}
}

struct LocalNode {
	mesh: LocalMesh,
	node: NodeId,
}

#[async_trait::async_trait]
impl MeshNode for LocalNode {
	async fn subscribe(&self, conn: ConnectionId, channels: &[ChannelName]) -> anyhow::Result<()> {
		self.mesh.record(MeshCall::Subscribe {
			node: self.node,
			conn,
			channels: channels.to_vec(),
		})?;
		self.mesh
			.inner
			.subscriptions
			.lock()
			.entry((self.node, conn))
			.or_default()
			.extend(channels.iter().cloned());
		Ok(())
	}

	async fn unsubscribe(&self, conn: ConnectionId, channels: &[ChannelName]) -> anyhow::Result<()> {
		self.mesh.record(MeshCall::Unsubscribe {
			node: self.node,
			conn,
			channels: channels.to_vec(),
		})?;
		if let Some(chs) = self.mesh.inner.subscriptions.lock().get_mut(&(self.node, conn)) {
			for ch in channels {
				chs.remove(ch);
			}
		}
		Ok(())
	}

	async fn set_context_value(&self, conn: ConnectionId, key: ContextKey, value: UserId) -> anyhow::Result<()> {
		self.mesh.record(MeshCall::SetContext {
			node: self.node,
			conn,
			key,
			value,
		})?;
		// watch::Sender::send_replace stores with release semantics; waiters observe it on wake.
		self.mesh.slot(self.node, conn, key).send_replace(Some(value));
		Ok(())
	}

	async fn mesh_send(&self, conn: ConnectionId, payload: &str) -> anyhow::Result<()> {
		self.mesh.record(MeshCall::Send {
			node: self.node,
			conn,
			payload: payload.to_string(),
		})?;
		self.mesh.deliver(self.node, conn, payload);
		Ok(())
	}

	async fn mesh_publish(&self, channel: &ChannelName, payload: &str) -> anyhow::Result<()> {
		self.mesh.record(MeshCall::Publish {
			node: self.node,
			channel: channel.clone(),
			payload: payload.to_string(),
		})?;

		let targets: Vec<ConnKey> = self
			.mesh
			.inner
			.subscriptions
			.lock()
			.iter()
			.filter(|(_, chs)| chs.contains(channel))
			.map(|(k, _)| *k)
			.collect();

		debug!(channel = %channel, subscribers = targets.len(), "local mesh: fan-out");

		for (node, conn) in targets {
			self.mesh.deliver(node, conn, payload);
		}
		Ok(())
	}
}
