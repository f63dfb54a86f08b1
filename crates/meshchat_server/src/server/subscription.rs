#![forbid(unsafe_code)]

use anyhow::Context;
use meshchat_domain::ChannelName;
use meshchat_protocol::OpCode;
use meshchat_protocol::wire;
use tracing::debug;

use crate::server::dispatcher::ChatContext;

/// `subscribe` / `unsubscribe`: join or leave every channel in `args` (zero or more).
///
/// Caller must already be authenticated. Success is replied once the substrate accepted the
/// request as a whole; per-channel failures are not reported back.
pub async fn handle_subscription(ctx: &ChatContext<'_>, op: OpCode, args: &[String]) -> anyhow::Result<()> {
	let channels: Vec<ChannelName> = args.iter().map(|a| ChannelName::new(a.as_str())).collect();

	if !channels.is_empty() {
		match op {
			OpCode::Subscribe => ctx
				.node
				.subscribe(ctx.conn, &channels)
				.await
				.with_context(|| format!("subscribe conn {}", ctx.conn))?,
			OpCode::Unsubscribe => ctx
				.node
				.unsubscribe(ctx.conn, &channels)
				.await
				.with_context(|| format!("unsubscribe conn {}", ctx.conn))?,
			_ => return Ok(()),
		}
	}

	metrics::counter!("meshchat_subscription_changes_total", "op" => op.as_str()).increment(channels.len() as u64);
	debug!(
		conn_id = %ctx.conn,
		uid = %ctx.uid,
		op = %op,
		channels = ?channels.iter().map(ChannelName::as_str).collect::<Vec<_>>(),
		"subscription change"
	);

	ctx.reply(&wire::success_reply(op)).await
}
