#![forbid(unsafe_code)]

use meshchat_domain::{ChannelName, ConnectionId, ContextKey, NodeId, UserId};
use serde::Serialize;
use serde_json::{Value, json};

/// Substrate method names.
pub mod method {
	pub const CONSUME: &str = "consume";
	pub const SUBSCRIBE: &str = "mesh.subscribe";
	pub const UNSUBSCRIBE: &str = "mesh.unsubscribe";
	pub const SET_CONTEXT_VALUE: &str = "mesh.setcontextvalue";
	pub const SEND: &str = "mesh.send";
	pub const PUBLISH: &str = "mesh.publish";
}

/// JSON-RPC 2.0 request sent to the substrate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcRequest {
	pub jsonrpc: &'static str,
	pub id: u64,
	pub method: &'static str,
	pub params: Value,
}

impl RpcRequest {
	fn new(id: u64, method: &'static str, params: Value) -> Self {
		Self {
			jsonrpc: "2.0",
			id,
			method,
			params,
		}
	}

	/// Start delivering the named queues to this client.
	pub fn consume(id: u64, queues: &[String]) -> Self {
		Self::new(id, method::CONSUME, json!({ "queues": queues }))
	}

	pub fn subscribe(id: u64, node: NodeId, conn: ConnectionId, channels: &[ChannelName]) -> Self {
		Self::new(
			id,
			method::SUBSCRIBE,
			json!({ "node_id": node, "client_id": conn, "channels": channels }),
		)
	}

	pub fn unsubscribe(id: u64, node: NodeId, conn: ConnectionId, channels: &[ChannelName]) -> Self {
		Self::new(
			id,
			method::UNSUBSCRIBE,
			json!({ "node_id": node, "client_id": conn, "channels": channels }),
		)
	}

	pub fn set_context_value(id: u64, node: NodeId, conn: ConnectionId, key: ContextKey, value: UserId) -> Self {
		Self::new(
			id,
			method::SET_CONTEXT_VALUE,
			json!({ "node_id": node, "client_id": conn, "key": key, "value": value }),
		)
	}

	/// Unicast `data` to one connection.
	pub fn send(id: u64, node: NodeId, conn: ConnectionId, data: &str) -> Self {
		Self::new(
			id,
			method::SEND,
			json!({ "node_id": node, "client_id": conn, "data": data }),
		)
	}

	/// Fan `data` out to every subscriber of `channel`, mesh-wide.
	pub fn publish(id: u64, channel: &ChannelName, data: &str) -> Self {
		Self::new(id, method::PUBLISH, json!({ "channel": channel, "data": data }))
	}

	pub fn to_text(&self) -> Result<String, serde_json::Error> {
		serde_json::to_string(self)
	}
}
