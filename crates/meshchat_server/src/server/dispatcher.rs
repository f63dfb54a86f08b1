#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context;
use meshchat_domain::{ConnectionId, ContextKey, NodeId, UserId};
use meshchat_protocol::wire::{self, ERR_NO_ACCESS};
use meshchat_protocol::{ChatData, ConnEvent, Envelope, EnvelopeData, Headers, OpCode, decode_operation};
use tracing::{debug, trace};

use crate::mesh::{MeshClient, MeshNode};
use crate::server::{auth, lifecycle, publisher, subscription};
use crate::store::{CredentialStore, PresenceCounter};

/// Collaborators shared by every handler. Cheap to clone.
#[derive(Clone)]
pub struct Services {
	pub mesh: Arc<dyn MeshClient>,
	pub credentials: Arc<dyn CredentialStore>,
	pub presence: Arc<dyn PresenceCounter>,
}

/// Per-envelope view handed to the `chat` handlers.
pub struct ChatContext<'a> {
	pub node: Arc<dyn MeshNode>,
	pub node_id: NodeId,
	pub conn: ConnectionId,
	/// UserID attached to the connection when the envelope was produced.
	pub uid: UserId,
	pub headers: &'a Headers,
	/// Slot key the connection script waits on for this ingestion path.
	pub context_key: ContextKey,
}

impl ChatContext<'_> {
	/// Unicast a reply body to the originating connection.
	pub async fn reply(&self, body: &str) -> anyhow::Result<()> {
		self.node
			.mesh_send(self.conn, body)
			.await
			.with_context(|| format!("send reply to conn {}", self.conn))
	}
}

/// What the dispatcher did with an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
	/// Frame text did not decode; the format error was replied.
	FormatError,
	/// Known operation handled (possibly rejected with an error reply).
	Op(OpCode),
	/// Privileged operation from an unauthenticated connection.
	NoAccess(OpCode),
	Lifecycle(ConnEvent),
	/// Unknown op, unknown conn event or unrouted queue.
	Dropped,
}

/// Stateless router from envelopes to handlers. Safe to share across tasks and paths.
#[derive(Clone)]
pub struct Dispatcher {
	services: Services,
}

impl Dispatcher {
	pub fn new(services: Services) -> Self {
		Self { services }
	}

	pub async fn dispatch(&self, envelope: &Envelope, context_key: ContextKey) -> anyhow::Result<Dispatched> {
		match &envelope.data {
			EnvelopeData::Chat(chat) => self.dispatch_chat(envelope, chat, context_key).await,
			EnvelopeData::Conn(conn) => {
				lifecycle::handle_conn_event(&self.services, envelope.connection_id, conn).await
			}
			EnvelopeData::Unrouted(_) => {
				debug!(
					queue = %envelope.queue,
					conn_id = %envelope.connection_id,
					"dropping envelope for unknown queue"
				);
				Ok(Dispatched::Dropped)
			}
		}
	}

	async fn dispatch_chat(
		&self,
		envelope: &Envelope,
		chat: &ChatData,
		context_key: ContextKey,
	) -> anyhow::Result<Dispatched> {
		let ctx = ChatContext {
			node: self.services.mesh.node(envelope.node_id),
			node_id: envelope.node_id,
			conn: envelope.connection_id,
			uid: chat.uid,
			headers: &chat.headers,
			context_key,
		};

		let op = match decode_operation(&chat.frame_data) {
			Ok(op) => op,
			Err(e) => {
				metrics::counter!("meshchat_decode_failures_total", "stage" => "frame").increment(1);
				debug!(conn_id = %ctx.conn, error = %e, "frame decode failed");
				ctx.reply(wire::JSON_FORMAT_ERROR).await?;
				return Ok(Dispatched::FormatError);
			}
		};

		let code = op.code();
		if code == OpCode::Unknown {
			trace!(conn_id = %ctx.conn, op = %op.op, "dropping unknown op");
			return Ok(Dispatched::Dropped);
		}

		metrics::counter!("meshchat_ops_total", "op" => code.as_str()).increment(1);

		if code.requires_auth() && !ctx.uid.is_authenticated() {
			metrics::counter!("meshchat_no_access_total", "op" => code.as_str()).increment(1);
			debug!(conn_id = %ctx.conn, op = %code, "rejecting unauthenticated op");
			ctx.reply(&wire::error_reply(code, ERR_NO_ACCESS)).await?;
			return Ok(Dispatched::NoAccess(code));
		}

		match code {
			OpCode::Ping => ctx.reply(wire::PONG).await?,
			OpCode::Auth => {
				auth::handle_auth(&ctx, self.services.credentials.as_ref(), &op.args).await?;
			}
			OpCode::Subscribe | OpCode::Unsubscribe => {
				subscription::handle_subscription(&ctx, code, &op.args).await?;
			}
			OpCode::SendToRoom | OpCode::SendToUser | OpCode::SendBroadcast => {
				publisher::handle_send(&ctx, code, &op.args).await?;
			}
			OpCode::Unknown => return Ok(Dispatched::Dropped),
		}

		Ok(Dispatched::Op(code))
	}
}
