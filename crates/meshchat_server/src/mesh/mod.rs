#![forbid(unsafe_code)]

//! Client side of the mesh substrate that owns client sockets and pub/sub transport.

pub mod local;
pub mod ws;


use std::sync::Arc;

use meshchat_domain::{ChannelName, ConnectionId, ContextKey, NodeId, UserId};

/// Operations against the substrate node that owns a set of connections.
#[async_trait::async_trait]
pub trait MeshNode: Send + Sync {
	async fn subscribe(&self, conn: ConnectionId, channels: &[ChannelName]) -> anyhow::Result<()>;

	async fn unsubscribe(&self, conn: ConnectionId, channels: &[ChannelName]) -> anyhow::Result<()>;

	/// Write `key = value` into the connection's context slot.
	///
	/// Once this returns, a later `mesh_send` on the same node must not overtake the write.
	async fn set_context_value(&self, conn: ConnectionId, key: ContextKey, value: UserId) -> anyhow::Result<()>;

	/// Unicast a raw text frame to one connection.
	async fn mesh_send(&self, conn: ConnectionId, payload: &str) -> anyhow::Result<()>;

	/// Fan a raw payload out to every subscriber of `channel`, mesh-wide.
	async fn mesh_publish(&self, channel: &ChannelName, payload: &str) -> anyhow::Result<()>;
}

pub trait MeshClient: Send + Sync {
	/// Handle bound to the node that owns connections tagged with `node`.
	fn node(&self, node: NodeId) -> Arc<dyn MeshNode>;
}
