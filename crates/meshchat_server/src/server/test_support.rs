#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::anyhow;
use meshchat_domain::{ConnectionId, NodeId, SecretString, UserId};
use meshchat_protocol::{Envelope, QueueKind};
use serde_json::json;

use crate::mesh::local::LocalMesh;
use crate::server::dispatcher::{Dispatcher, Services};
use crate::store::credentials::InMemoryCredentialStore;
use crate::store::presence::InMemoryPresenceCounter;
use crate::store::{CredentialStore, Principal};

pub const NODE: NodeId = NodeId(1);
pub const CONN: ConnectionId = ConnectionId(100);

pub struct Harness {
	pub mesh: LocalMesh,
	pub credentials: Arc<InMemoryCredentialStore>,
	pub presence: Arc<InMemoryPresenceCounter>,
	pub dispatcher: Dispatcher,
}

impl Harness {
	/// Dispatcher over a local mesh with users alice (7, "pw-a") and bob (42, "pw-b").
	pub fn new() -> Self {
		let credentials = Arc::new(InMemoryCredentialStore::new());
		credentials.insert(UserId(7), "alice", "pw-a");
		credentials.insert(UserId(42), "bob", "pw-b");
		Self::with_credentials(credentials)
	}

	pub fn with_credentials(credentials: Arc<InMemoryCredentialStore>) -> Self {
		let mesh = LocalMesh::new();
		let presence = Arc::new(InMemoryPresenceCounter::new());
		let dispatcher = Dispatcher::new(Services {
			mesh: Arc::new(mesh.clone()),
			credentials: credentials.clone(),
			presence: presence.clone(),
		});

		Self {
			mesh,
			credentials,
			presence,
			dispatcher,
		}
	}

	/// Replies sent to `CONN` on `NODE`.
	pub fn replies(&self) -> Vec<String> {
		self.mesh.sent_to(NODE, CONN)
	}
}

pub fn chat(uid: u64, frame: &str) -> Envelope {
	Envelope::new(
		QueueKind::Chat,
		CONN,
		NODE,
		&json!({ "uid": uid, "headers": {}, "frame": { "data": frame } }),
	)
}

pub fn conn_event(event: &str, uid: u64) -> Envelope {
	Envelope::new(QueueKind::Conn, CONN, NODE, &json!({ "event": event, "uid": uid }))
}

pub fn op(op: &str, args: &[&str]) -> String {
	json!({ "op": op, "args": args }).to_string()
}

/// Credential store whose every call fails.
pub struct BrokenCredentials;

#[async_trait::async_trait]
impl CredentialStore for BrokenCredentials {
	async fn find_principal(&self, _name: &str, _password: &SecretString) -> anyhow::Result<Option<Principal>> {
		Err(anyhow!("credential store unavailable"))
	}

	async fn set_online(&self, _id: UserId, _online: bool) -> anyhow::Result<()> {
		Err(anyhow!("credential store unavailable"))
	}
}
