#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Context;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;

use crate::store::{DurableQueue, StorePool};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// FIFO over `queue_records`, one logical queue per `name`.
#[derive(Clone, Debug)]
pub struct SqlDurableQueue {
	pool: StorePool,
	name: String,
	poll_interval: Duration,
}

impl SqlDurableQueue {
	pub fn new(pool: StorePool, name: impl Into<String>) -> Self {
		Self {
			pool,
			name: name.into(),
			poll_interval: DEFAULT_POLL_INTERVAL,
		}
	}

	#[allow(dead_code)]
	pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
		self.poll_interval = poll_interval.max(Duration::from_millis(1));
		self
	}

	#[allow(dead_code)]
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Append a raw record.
	#[allow(dead_code)]
	pub async fn push(&self, payload: &str) -> anyhow::Result<()> {
		match &self.pool {
			StorePool::Sqlite(pool) => {
				sqlx::query("INSERT INTO queue_records (queue, payload) VALUES (?, ?)")
					.bind(&self.name)
					.bind(payload)
					.execute(pool)
					.await
					.context("push queue record (sqlite)")?;
			}
			StorePool::Postgres(pool) => {
				sqlx::query("INSERT INTO queue_records (queue, payload) VALUES ($1, $2)")
					.bind(&self.name)
					.bind(payload)
					.execute(pool)
					.await
					.context("push queue record (postgres)")?;
			}
		}
		Ok(())
	}

	async fn try_pop(&self) -> anyhow::Result<Option<String>> {
		let row: Option<(String,)> = match &self.pool {
			StorePool::Sqlite(pool) => sqlx::query_as(
				"DELETE FROM queue_records WHERE id = \
				(SELECT id FROM queue_records WHERE queue = ? ORDER BY id ASC LIMIT 1) \
				RETURNING payload",
			)
			.bind(&self.name)
			.fetch_optional(pool)
			.await
			.context("pop queue record (sqlite)")?,
			StorePool::Postgres(pool) => sqlx::query_as(
				"DELETE FROM queue_records WHERE id = \
				(SELECT id FROM queue_records WHERE queue = $1 ORDER BY id ASC LIMIT 1 FOR UPDATE SKIP LOCKED) \
				RETURNING payload",
			)
			.bind(&self.name)
			.fetch_optional(pool)
			.await
			.context("pop queue record (postgres)")?,
		};

		Ok(row.map(|(payload,)| payload))
	}
}

#[async_trait::async_trait]
impl DurableQueue for SqlDurableQueue {
	async fn pop(&self, timeout: Duration) -> anyhow::Result<Option<String>> {
		let deadline = Instant::now() + timeout;

		loop {
			if let Some(payload) = self.try_pop().await? {
				return Ok(Some(payload));
			}

			let now = Instant::now();
			if now >= deadline {
				return Ok(None);
			}

			tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
		}
	}
}

/// Process-local queue fed through `push`.
#[derive(Debug)]
pub struct InMemoryDurableQueue {
	tx: mpsc::UnboundedSender<String>,
	rx: Mutex<mpsc::UnboundedReceiver<String>>,
}

impl Default for InMemoryDurableQueue {
	fn default() -> Self {
		let (tx, rx) = mpsc::unbounded_channel();
		Self { tx, rx: Mutex::new(rx) }
	}
}

impl InMemoryDurableQueue {
	pub fn new() -> Self {
		Self::default()
	}

	#[allow(dead_code)]
	pub fn push(&self, payload: impl Into<String>) {
		// The receiver lives in `self`, so the channel cannot be closed here.
		let _ = self.tx.send(payload.into());
	}
}

#[async_trait::async_trait]
impl DurableQueue for InMemoryDurableQueue {
	async fn pop(&self, timeout: Duration) -> anyhow::Result<Option<String>> {
		let mut rx = self.rx.lock().await;
		match tokio::time::timeout(timeout, rx.recv()).await {
			Ok(item) => Ok(item),
			Err(_elapsed) => Ok(None),
		}
	}
}
