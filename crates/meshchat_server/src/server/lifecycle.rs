#![forbid(unsafe_code)]

use anyhow::Context;
use meshchat_domain::ConnectionId;
use meshchat_protocol::{ConnData, ConnEvent};
use tracing::{debug, trace, warn};

use crate::server::dispatcher::{Dispatched, Services};

/// Presence and online-flag bookkeeping for `conn` events. Never replies: by the time a
/// `close` is handled the connection may be gone.
pub async fn handle_conn_event(
	services: &Services,
	conn_id: ConnectionId,
	data: &ConnData,
) -> anyhow::Result<Dispatched> {
	match &data.event {
		ConnEvent::Connect | ConnEvent::Handshake => {
			trace!(conn_id = %conn_id, headers = ?data.headers, event = data.event.as_str(), "connection opened");
			services.presence.increment().await.context("presence increment")?;
		}
		ConnEvent::Close => {
			// Both updates are attempted even if the first one fails.
			let decremented = services.presence.decrement().await.context("presence decrement");

			let offline = if data.uid.is_authenticated() {
				services
					.credentials
					.set_online(data.uid, false)
					.await
					.with_context(|| format!("mark user {} offline", data.uid))
			} else {
				Ok(())
			};

			debug!(conn_id = %conn_id, uid = %data.uid, "connection closed");

			if let Err(e) = &offline
				&& decremented.is_err()
			{
				warn!(conn_id = %conn_id, error = %e, "close: offline update also failed");
			}
			decremented?;
			offline?;
		}
		ConnEvent::Other(event) => {
			debug!(conn_id = %conn_id, event = %event, "dropping unknown conn event");
			return Ok(Dispatched::Dropped);
		}
	}

	metrics::counter!("meshchat_lifecycle_events_total", "event" => data.event.as_str().to_string()).increment(1);
	Ok(Dispatched::Lifecycle(data.event.clone()))
}
