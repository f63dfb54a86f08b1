#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use meshchat_domain::{ContextKey, UserId};
use meshchat_protocol::OpCode;

use crate::mesh::local::MeshCall;
use crate::server::dispatcher::{Dispatched, Dispatcher, Services};
use crate::server::test_support::{BrokenCredentials, CONN, Harness, NODE, chat, op};

#[tokio::test]
async fn valid_credentials_set_slot_online_and_reply_success() {
	let h = Harness::new();

	let out = h
		.dispatcher
		.dispatch(&chat(0, &op("auth", &["alice", "pw-a"])), ContextKey::Uid)
		.await
		.expect("dispatch");

	assert_eq!(out, Dispatched::Op(OpCode::Auth));
	assert_eq!(h.mesh.context_value(NODE, CONN, ContextKey::Uid), Some(UserId(7)));
	assert!(h.credentials.is_online(UserId(7)));
	assert_eq!(h.replies(), vec![r#"{"op":"auth","success":true}"#.to_string()]);
}

#[tokio::test]
async fn slot_is_written_before_reply() {
	let h = Harness::new();

	h.dispatcher
		.dispatch(&chat(0, &op("auth", &["alice", "pw-a"])), ContextKey::Uid)
		.await
		.expect("dispatch");

	let calls = h.mesh.calls();
	let slot_at = calls
		.iter()
		.position(|c| matches!(c, MeshCall::SetContext { .. }))
		.expect("slot write");
	let reply_at = calls
		.iter()
		.position(|c| matches!(c, MeshCall::Send { .. }))
		.expect("reply");
	assert!(slot_at < reply_at, "slot must be written before the reply: {calls:?}");
}

#[tokio::test]
async fn waiting_script_is_released_with_user_id() {
	let h = Harness::new();

	let waiter = {
		let mesh = h.mesh.clone();
		tokio::spawn(async move {
			mesh.wait_for_context(NODE, CONN, ContextKey::Uid, Duration::from_secs(2))
				.await
		})
	};

	h.dispatcher
		.dispatch(&chat(0, &op("auth", &["bob", "pw-b"])), ContextKey::Uid)
		.await
		.expect("dispatch");

	assert_eq!(waiter.await.expect("join"), Some(UserId(42)));
}

#[tokio::test]
async fn wrong_password_writes_zero_and_leaves_online_flag() {
	let h = Harness::new();

	h.dispatcher
		.dispatch(&chat(0, &op("auth", &["alice", "nope"])), ContextKey::Uid)
		.await
		.expect("dispatch");

	assert_eq!(h.mesh.context_value(NODE, CONN, ContextKey::Uid), Some(UserId(0)));
	assert!(!h.credentials.is_online(UserId(7)));
	assert_eq!(
		h.replies(),
		vec![r#"{"op":"auth","error":"Invalid name or password"}"#.to_string()]
	);
}

#[tokio::test]
async fn alternate_slot_key_is_honoured() {
	let h = Harness::new();

	h.dispatcher
		.dispatch(&chat(0, &op("auth", &["ghost", "x"])), ContextKey::UserId)
		.await
		.expect("dispatch");

	assert_eq!(h.mesh.context_value(NODE, CONN, ContextKey::UserId), Some(UserId(0)));
	assert_eq!(h.mesh.context_value(NODE, CONN, ContextKey::Uid), None);
}

#[tokio::test]
async fn wrong_arity_releases_slot_and_replies_invalid_args() {
	let h = Harness::new();

	for args in [&["alice"][..], &["alice", "pw-a", "extra"][..], &[][..]] {
		h.mesh.clear_calls();
		h.dispatcher
			.dispatch(&chat(0, &op("auth", args)), ContextKey::Uid)
			.await
			.expect("dispatch");

		assert_eq!(h.mesh.context_value(NODE, CONN, ContextKey::Uid), Some(UserId(0)));
		assert_eq!(h.replies(), vec![r#"{"op":"auth","error":"Invalid args"}"#.to_string()]);
	}
	assert!(!h.credentials.is_online(UserId(7)));
}

#[tokio::test]
async fn reauth_is_refused_without_touching_slot() {
	let h = Harness::new();

	h.dispatcher
		.dispatch(&chat(7, &op("auth", &["bob", "pw-b"])), ContextKey::Uid)
		.await
		.expect("dispatch");

	assert_eq!(h.mesh.context_value(NODE, CONN, ContextKey::Uid), None);
	assert!(!h.credentials.is_online(UserId(42)));
	assert_eq!(
		h.replies(),
		vec![r#"{"op":"auth","error":"Already authenticated"}"#.to_string()]
	);
}

#[tokio::test]
async fn store_failure_releases_slot_and_surfaces_error() {
	let h = Harness::new();
	let dispatcher = Dispatcher::new(Services {
		mesh: Arc::new(h.mesh.clone()),
		credentials: Arc::new(BrokenCredentials),
		presence: h.presence.clone(),
	});

	let res = dispatcher
		.dispatch(&chat(0, &op("auth", &["alice", "pw-a"])), ContextKey::Uid)
		.await;

	assert!(res.is_err());
	assert_eq!(h.mesh.context_value(NODE, CONN, ContextKey::Uid), Some(UserId(0)));
	assert!(h.replies().is_empty());
}

struct OnlineFlagDown;

#[async_trait::async_trait]
impl crate::store::CredentialStore for OnlineFlagDown {
	async fn find_principal(
		&self,
		name: &str,
		_password: &meshchat_domain::SecretString,
	) -> anyhow::Result<Option<crate::store::Principal>> {
		Ok(Some(crate::store::Principal {
			id: UserId(7),
			name: name.to_string(),
		}))
	}

	async fn set_online(&self, _id: UserId, _online: bool) -> anyhow::Result<()> {
		Err(anyhow::anyhow!("online flag unavailable"))
	}
}

#[tokio::test]
async fn online_flag_failure_still_releases_slot() {
	let h = Harness::new();
	let dispatcher = Dispatcher::new(Services {
		mesh: Arc::new(h.mesh.clone()),
		credentials: Arc::new(OnlineFlagDown),
		presence: h.presence.clone(),
	});

	let res = dispatcher
		.dispatch(&chat(0, &op("auth", &["alice", "pw-a"])), ContextKey::Uid)
		.await;

	assert!(res.is_err());
	assert_eq!(h.mesh.context_value(NODE, CONN, ContextKey::Uid), Some(UserId(0)));
	assert!(h.replies().is_empty());
}
