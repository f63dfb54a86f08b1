#![forbid(unsafe_code)]

use anyhow::Context;
use meshchat_domain::ChannelName;
use meshchat_protocol::wire::{self, ERR_INVALID_ARGS};
use meshchat_protocol::{ArityError, BroadcastArgs, OpCode, SendArgs};
use tracing::debug;

use crate::server::dispatcher::ChatContext;

/// Target channel and message of a send operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanOut<'a> {
	pub channel: ChannelName,
	pub message: &'a str,
}

/// Resolve the target of `sendtoroom`, `sendtouser` or `sendbroadcast`.
///
/// Room ids and user ids are both used as bare channel names, so room `"42"` and user 42
/// address the same subscribers.
pub fn resolve_target(op: OpCode, args: &[String]) -> Result<FanOut<'_>, ArityError> {
	match op {
		OpCode::SendBroadcast => {
			let a = BroadcastArgs::from_args(args)?;
			Ok(FanOut {
				channel: ChannelName::broadcast(),
				message: a.message,
			})
		}
		_ => {
			let a = SendArgs::from_args(op, args)?;
			Ok(FanOut {
				channel: ChannelName::new(a.channel),
				message: a.message,
			})
		}
	}
}

/// Publish the sender's message to the target channel, then confirm to the sender.
///
/// The publish is not acknowledged by subscribers; success only means it was issued.
pub async fn handle_send(ctx: &ChatContext<'_>, op: OpCode, args: &[String]) -> anyhow::Result<()> {
	let target = match resolve_target(op, args) {
		Ok(t) => t,
		Err(e) => {
			debug!(conn_id = %ctx.conn, error = %e, "send: bad arity");
			return ctx.reply(&wire::error_reply(op, ERR_INVALID_ARGS)).await;
		}
	};

	let data = wire::compose_message(ctx.uid, target.message);
	let payload = wire::publish_payload(&target.channel, &data);

	ctx.node
		.mesh_publish(&target.channel, &payload)
		.await
		.with_context(|| format!("publish to {}", target.channel))?;

	metrics::counter!("meshchat_publishes_total", "op" => op.as_str()).increment(1);
	debug!(conn_id = %ctx.conn, uid = %ctx.uid, op = %op, channel = %target.channel, "published");

	ctx.reply(&wire::success_reply(op)).await
}
