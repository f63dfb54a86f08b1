#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use meshchat_domain::{SecretString, UserId};
use parking_lot::Mutex;
use tracing::debug;

use crate::store::verifier::{CredentialVerifier, PlaintextVerifier};
use crate::store::{CredentialStore, Principal, StorePool};

/// Principals in the `users` table.
#[derive(Clone)]
pub struct SqlCredentialStore {
	pool: StorePool,
	verifier: Arc<dyn CredentialVerifier>,
}

impl SqlCredentialStore {
	pub fn new(pool: StorePool, verifier: Arc<dyn CredentialVerifier>) -> Self {
		Self { pool, verifier }
	}

	/// Insert a principal with an already-encoded stored credential. Used for provisioning and tests.
	pub async fn insert_principal(&self, name: &str, stored_password: &str) -> anyhow::Result<UserId> {
		let id: i64 = match &self.pool {
			StorePool::Sqlite(pool) => {
				let row: (i64,) = sqlx::query_as("INSERT INTO users (name, password, online) VALUES (?, ?, 0) RETURNING id")
					.bind(name)
					.bind(stored_password)
					.fetch_one(pool)
					.await
					.context("insert user (sqlite)")?;
				row.0
			}
			StorePool::Postgres(pool) => {
				let row: (i64,) =
					sqlx::query_as("INSERT INTO users (name, password, online) VALUES ($1, $2, 0) RETURNING id")
						.bind(name)
						.bind(stored_password)
						.fetch_one(pool)
						.await
						.context("insert user (postgres)")?;
				row.0
			}
		};

		Ok(UserId(u64::try_from(id).context("negative user id")?))
	}

	/// Add a principal, encoding `password` with this store's verifier.
	pub async fn provision(&self, name: &str, password: &SecretString) -> anyhow::Result<UserId> {
		let stored = self.verifier.encode(password)?;
		self.insert_principal(name, &stored).await
	}

	#[allow(dead_code)]
	pub async fn is_online(&self, id: UserId) -> anyhow::Result<bool> {
		let id = i64::try_from(id.get()).context("user id out of range")?;
		let online: Option<(i64,)> = match &self.pool {
			StorePool::Sqlite(pool) => sqlx::query_as("SELECT online FROM users WHERE id = ?")
				.bind(id)
				.fetch_optional(pool)
				.await
				.context("select online (sqlite)")?,
			StorePool::Postgres(pool) => sqlx::query_as("SELECT online::BIGINT FROM users WHERE id = $1")
				.bind(id)
				.fetch_optional(pool)
				.await
				.context("select online (postgres)")?,
		};

		Ok(online.is_some_and(|(v,)| v != 0))
	}
}

#[async_trait::async_trait]
impl CredentialStore for SqlCredentialStore {
	async fn find_principal(&self, name: &str, password: &SecretString) -> anyhow::Result<Option<Principal>> {
		let rows: Vec<(i64, String)> = match &self.pool {
			StorePool::Sqlite(pool) => sqlx::query_as("SELECT id, password FROM users WHERE name = ? ORDER BY id ASC")
				.bind(name)
				.fetch_all(pool)
				.await
				.context("select users by name (sqlite)")?,
			StorePool::Postgres(pool) => {
				sqlx::query_as("SELECT id, password FROM users WHERE name = $1 ORDER BY id ASC")
					.bind(name)
					.fetch_all(pool)
					.await
					.context("select users by name (postgres)")?
			}
		};

		let found = rows
			.into_iter()
			.filter(|(_, stored)| self.verifier.verify(stored, password))
			.find_map(|(id, _)| u64::try_from(id).ok().filter(|id| *id != 0));

		debug!(
			scheme = %self.verifier.scheme(),
			matched = found.is_some(),
			"credential lookup"
		);

		Ok(found.map(|id| Principal {
			id: UserId(id),
			name: name.to_string(),
		}))
	}

	async fn set_online(&self, id: UserId, online: bool) -> anyhow::Result<()> {
		let id = i64::try_from(id.get()).context("user id out of range")?;
		let flag: i16 = if online { 1 } else { 0 };

		match &self.pool {
			StorePool::Sqlite(pool) => {
				sqlx::query("UPDATE users SET online = ? WHERE id = ?")
					.bind(flag)
					.bind(id)
					.execute(pool)
					.await
					.context("update user online (sqlite)")?;
			}
			StorePool::Postgres(pool) => {
				sqlx::query("UPDATE users SET online = $1 WHERE id = $2")
					.bind(flag)
					.bind(id)
					.execute(pool)
					.await
					.context("update user online (postgres)")?;
			}
		}

		Ok(())
	}
}

#[derive(Debug, Clone)]
struct MemoryPrincipal {
	name: String,
	password: String,
	online: bool,
}

/// Process-local principal table.
#[derive(Debug)]
pub struct InMemoryCredentialStore {
	users: Mutex<BTreeMap<u64, MemoryPrincipal>>,
	verifier: Arc<dyn CredentialVerifier>,
}

impl Default for InMemoryCredentialStore {
	fn default() -> Self {
		Self::with_verifier(Arc::new(PlaintextVerifier))
	}
}

impl InMemoryCredentialStore {
	#[allow(dead_code)]
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_verifier(verifier: Arc<dyn CredentialVerifier>) -> Self {
		Self {
			users: Mutex::new(BTreeMap::new()),
			verifier,
		}
	}

	#[allow(dead_code)]
	pub fn insert(&self, id: UserId, name: impl Into<String>, stored_password: impl Into<String>) {
		self.users.lock().insert(
			id.get(),
			MemoryPrincipal {
				name: name.into(),
				password: stored_password.into(),
				online: false,
			},
		);
	}

	#[allow(dead_code)]
	pub fn is_online(&self, id: UserId) -> bool {
		self.users.lock().get(&id.get()).is_some_and(|u| u.online)
	}
}

#[async_trait::async_trait]
impl CredentialStore for InMemoryCredentialStore {
	async fn find_principal(&self, name: &str, password: &SecretString) -> anyhow::Result<Option<Principal>> {
		let users = self.users.lock();
		Ok(users
			.iter()
			.find(|(id, u)| **id != 0 && u.name == name && self.verifier.verify(&u.password, password))
			.map(|(id, u)| Principal {
				id: UserId(*id),
				name: u.name.clone(),
			}))
	}

	async fn set_online(&self, id: UserId, online: bool) -> anyhow::Result<()> {
		if let Some(u) = self.users.lock().get_mut(&id.get()) {
			u.online = online;
		}
		Ok(())
	}
}
