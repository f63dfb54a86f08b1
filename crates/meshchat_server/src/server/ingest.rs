#![forbid(unsafe_code)]

//! The two ingestion paths. Both decode into the same `Envelope` and hand it to the shared
//! `Dispatcher`; neither retries, and no failure of a single record ends the loop.
//!
//! Known hazard: when one connection's traffic is split across the direct and durable paths
//! (or across worker processes), operations for that connection are not ordered relative to
//! each other. Nothing here serializes them.

use std::sync::Arc;
use std::time::Duration;

use meshchat_domain::ContextKey;
use meshchat_protocol::{Envelope, MeshMessage, parse_durable_record};
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use crate::server::dispatcher::{Dispatched, Dispatcher};
use crate::store::DurableQueue;

const POP_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Which path an envelope arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestPath {
	Direct,
	Durable,
}

impl IngestPath {
	pub const fn as_str(self) -> &'static str {
		match self {
			IngestPath::Direct => "direct",
			IngestPath::Durable => "durable",
		}
	}
}

/// Dispatch one envelope, logging instead of propagating failures.
pub async fn process_envelope(
	dispatcher: &Dispatcher,
	envelope: &Envelope,
	context_key: ContextKey,
	path: IngestPath,
) -> Option<Dispatched> {
	metrics::counter!("meshchat_envelopes_total", "path" => path.as_str(), "queue" => envelope.queue.metric_label())
		.increment(1);

	match dispatcher.dispatch(envelope, context_key).await {
		Ok(outcome) => {
			trace!(
				path = path.as_str(),
				queue = %envelope.queue,
				conn_id = %envelope.connection_id,
				node_id = %envelope.node_id,
				?outcome,
				"envelope handled"
			);
			Some(outcome)
		}
		Err(e) => {
			metrics::counter!("meshchat_record_failures_total", "path" => path.as_str()).increment(1);
			warn!(
				path = path.as_str(),
				queue = %envelope.queue,
				conn_id = %envelope.connection_id,
				node_id = %envelope.node_id,
				error = %format!("{e:#}"),
				"envelope handling failed"
			);
			None
		}
	}
}

/// Direct path: messages pushed by the substrate connection (`WsMeshClient` or a test feed).
pub struct DirectIngest {
	dispatcher: Dispatcher,
	context_key: ContextKey,
}

impl DirectIngest {
	pub fn new(dispatcher: Dispatcher, context_key: ContextKey) -> Self {
		Self {
			dispatcher,
			context_key,
		}
	}

	/// Handle one inbound substrate message.
	pub async fn handle(&self, msg: MeshMessage) -> Option<Dispatched> {
		match msg {
			MeshMessage::Consume(envelope) => {
				process_envelope(&self.dispatcher, &envelope, self.context_key, IngestPath::Direct).await
			}
			MeshMessage::Result(outcome) => {
				debug!(
					id = ?outcome.id,
					success = outcome.success,
					fail = outcome.fail,
					total = outcome.total,
					"mesh result"
				);
				None
			}
			MeshMessage::Error(failure) => {
				warn!(id = ?failure.id, code = failure.code, message = %failure.message, "mesh error");
				None
			}
			MeshMessage::Other(payload) => {
				trace!(%payload, "ignoring mesh message");
				None
			}
		}
	}

	/// Handle messages in arrival order until the feed closes or shutdown is signalled.
	pub async fn run(self, mut inbound_rx: mpsc::UnboundedReceiver<MeshMessage>, mut shutdown: watch::Receiver<bool>) {
		info!(context_key = %self.context_key, "direct ingest started");

		loop {
			tokio::select! {
				_ = shutdown.changed() => {
					info!("direct ingest: shutdown");
					break;
				}
				msg = inbound_rx.recv() => {
					let Some(msg) = msg else {
						info!("direct ingest: feed closed");
						break;
					};
					self.handle(msg).await;
				}
			}
		}
	}
}

/// Durable path: bounded blocking pops from an external queue.
pub struct DurableIngest {
	dispatcher: Dispatcher,
	queue: Arc<dyn DurableQueue>,
	pop_timeout: Duration,
	context_key: ContextKey,
}

impl DurableIngest {
	pub fn new(
		dispatcher: Dispatcher,
		queue: Arc<dyn DurableQueue>,
		pop_timeout: Duration,
		context_key: ContextKey,
	) -> Self {
		Self {
			dispatcher,
			queue,
			pop_timeout: pop_timeout.max(Duration::from_millis(1)),
			context_key,
		}
	}

	/// Decode and dispatch one raw record.
	pub async fn handle_record(&self, raw: &str) -> Option<Dispatched> {
		let envelope = match parse_durable_record(raw) {
			Ok(env) => env,
			Err(e) => {
				metrics::counter!("meshchat_decode_failures_total", "stage" => "durable_record").increment(1);
				warn!(error = %e, len = raw.len(), "durable ingest: undecodable record");
				return None;
			}
		};

		process_envelope(&self.dispatcher, &envelope, self.context_key, IngestPath::Durable).await
	}

	/// Pop and handle records until shutdown. Shutdown is observed between pops, so at the
	/// latest after one pop timeout; an in-flight pop is never abandoned since a popped record
	/// is already gone from the queue.
	pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
		info!(
			pop_timeout_ms = self.pop_timeout.as_millis(),
			context_key = %self.context_key,
			"durable ingest started"
		);

		loop {
			if *shutdown.borrow() {
				break;
			}

			match self.queue.pop(self.pop_timeout).await {
				Ok(Some(raw)) => {
					self.handle_record(&raw).await;
				}
				Ok(None) => {
					metrics::counter!("meshchat_durable_pop_timeouts_total").increment(1);
				}
				Err(e) => {
					metrics::counter!("meshchat_record_failures_total", "path" => IngestPath::Durable.as_str()).increment(1);
					warn!(error = %format!("{e:#}"), "durable ingest: pop failed");
					tokio::select! {
						_ = shutdown.changed() => break,
						_ = sleep(POP_ERROR_BACKOFF) => {}
					}
				}
			}
		}

		info!("durable ingest: shutdown");
	}
}
