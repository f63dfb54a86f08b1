#![forbid(unsafe_code)]

//! External stores the relay core delegates shared state to: principals, the presence
//! counter and the durable queue.

pub mod credentials;
pub mod presence;
pub mod queue;
pub mod verifier;


use std::time::Duration;

use anyhow::{Context, anyhow};
use meshchat_domain::{SecretString, UserId};
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;

/// Principal record returned by a successful credential lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
	pub id: UserId,
	pub name: String,
}

#[async_trait::async_trait]
pub trait CredentialStore: Send + Sync {
	/// Principal whose name and password both match, if any.
	async fn find_principal(&self, name: &str, password: &SecretString) -> anyhow::Result<Option<Principal>>;

	async fn set_online(&self, id: UserId, online: bool) -> anyhow::Result<()>;
}

/// Mesh-wide count of live connections. Each call is a single atomic store update.
#[async_trait::async_trait]
pub trait PresenceCounter: Send + Sync {
	async fn increment(&self) -> anyhow::Result<()>;

	async fn decrement(&self) -> anyhow::Result<()>;
}

#[async_trait::async_trait]
pub trait DurableQueue: Send + Sync {
	/// Pop the oldest raw record, waiting at most `timeout`. `None` on timeout.
	async fn pop(&self, timeout: Duration) -> anyhow::Result<Option<String>>;
}

/// Connection pool for the SQL-backed stores.
#[derive(Clone, Debug)]
pub enum StorePool {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

impl StorePool {
	/// Connect by URL scheme (`sqlite:` or `postgres:`) and run migrations.
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			// Every connection to `sqlite::memory:` is its own database, so pin exactly one.
			let options = if database_url.contains(":memory:") {
				SqlitePoolOptions::new()
					.max_connections(1)
					.idle_timeout(None)
					.max_lifetime(None)
			} else {
				SqlitePoolOptions::new().max_connections(5)
			};
			let pool = options
				.connect(database_url)
				.await
				.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			Ok(Self::Sqlite(pool))
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = PgPoolOptions::new()
				.max_connections(5)
				.connect(database_url)
				.await
				.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			Ok(Self::Postgres(pool))
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}

	pub fn backend_name(&self) -> &'static str {
		match self {
			StorePool::Sqlite(_) => "sqlite",
			StorePool::Postgres(_) => "postgres",
		}
	}
}
