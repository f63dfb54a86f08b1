#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::Context;

use crate::store::{PresenceCounter, StorePool};

/// Presence count kept in the single-row `presence` table.
#[derive(Clone, Debug)]
pub struct SqlPresenceCounter {
	pool: StorePool,
}

impl SqlPresenceCounter {
	pub fn new(pool: StorePool) -> Self {
		Self { pool }
	}

	#[allow(dead_code)]
	pub async fn current(&self) -> anyhow::Result<i64> {
		let row: (i64,) = match &self.pool {
			StorePool::Sqlite(pool) => sqlx::query_as("SELECT online FROM presence WHERE id = 1")
				.fetch_one(pool)
				.await
				.context("select presence (sqlite)")?,
			StorePool::Postgres(pool) => sqlx::query_as("SELECT online FROM presence WHERE id = 1")
				.fetch_one(pool)
				.await
				.context("select presence (postgres)")?,
		};
		Ok(row.0)
	}

	async fn add(&self, delta: i64) -> anyhow::Result<()> {
		match &self.pool {
			StorePool::Sqlite(pool) => {
				sqlx::query("UPDATE presence SET online = online + ? WHERE id = 1")
					.bind(delta)
					.execute(pool)
					.await
					.context("update presence (sqlite)")?;
			}
			StorePool::Postgres(pool) => {
				sqlx::query("UPDATE presence SET online = online + $1 WHERE id = 1")
					.bind(delta)
					.execute(pool)
					.await
					.context("update presence (postgres)")?;
			}
		}
		Ok(())
	}
}

#[async_trait::async_trait]
impl PresenceCounter for SqlPresenceCounter {
	async fn increment(&self) -> anyhow::Result<()> {
		self.add(1).await
	}

	async fn decrement(&self) -> anyhow::Result<()> {
		self.add(-1).await
	}
}

/// Process-local presence count, mirrored into the `meshchat_presence_online` gauge.
#[derive(Debug, Default)]
pub struct InMemoryPresenceCounter {
	online: AtomicI64,
}

impl InMemoryPresenceCounter {
	pub fn new() -> Self {
		Self::default()
	}

	#[allow(dead_code)]
	pub fn current(&self) -> i64 {
		self.online.load(Ordering::Acquire)
	}

	fn add(&self, delta: i64) {
		let now = self.online.fetch_add(delta, Ordering::AcqRel) + delta;
		metrics::gauge!("meshchat_presence_online").set(now as f64);
	}
}

#[async_trait::async_trait]
impl PresenceCounter for InMemoryPresenceCounter {
	async fn increment(&self) -> anyhow::Result<()> {
		self.add(1);
		Ok(())
	}

	async fn decrement(&self) -> anyhow::Result<()> {
		self.add(-1);
		Ok(())
	}
}
