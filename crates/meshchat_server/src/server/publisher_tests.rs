#![forbid(unsafe_code)]

use meshchat_domain::{ChannelName, ConnectionId, ContextKey};
use meshchat_protocol::OpCode;

use crate::mesh::local::MeshCall;
use crate::server::dispatcher::Dispatched;
use crate::server::test_support::{CONN, Harness, NODE, chat, op};

#[tokio::test]
async fn broadcast_publishes_composed_message() {
	let h = Harness::new();

	let out = h
		.dispatcher
		.dispatch(&chat(42, &op("sendbroadcast", &["hello"])), ContextKey::Uid)
		.await
		.expect("dispatch");

	assert_eq!(out, Dispatched::Op(OpCode::SendBroadcast));
	assert_eq!(
		h.mesh.published(),
		vec![(
			ChannelName::broadcast(),
			r#"{"event":"subscribe","channel":"broadcast","data":"uid:42,message:hello"}"#.to_string()
		)]
	);
	assert_eq!(h.replies(), vec![r#"{"op":"sendbroadcast","success":true}"#.to_string()]);
}

#[tokio::test]
async fn room_and_user_targets_are_bare_channels() {
	let h = Harness::new();

	h.dispatcher
		.dispatch(&chat(7, &op("sendtoroom", &["room1", "hi"])), ContextKey::Uid)
		.await
		.expect("dispatch");
	h.dispatcher
		.dispatch(&chat(7, &op("sendtouser", &["42", "psst", "ignored"])), ContextKey::Uid)
		.await
		.expect("dispatch");

	assert_eq!(
		h.mesh.published(),
		vec![
			(
				ChannelName::new("room1"),
				r#"{"event":"subscribe","channel":"room1","data":"uid:7,message:hi"}"#.to_string()
			),
			(
				ChannelName::new("42"),
				r#"{"event":"subscribe","channel":"42","data":"uid:7,message:psst"}"#.to_string()
			),
		]
	);
	assert_eq!(
		h.replies(),
		vec![
			r#"{"op":"sendtoroom","success":true}"#.to_string(),
			r#"{"op":"sendtouser","success":true}"#.to_string(),
		]
	);
}

#[tokio::test]
async fn publish_happens_before_reply() {
	let h = Harness::new();

	h.dispatcher
		.dispatch(&chat(7, &op("sendtoroom", &["room1", "hi"])), ContextKey::Uid)
		.await
		.expect("dispatch");

	let calls = h.mesh.calls();
	assert!(matches!(calls.first(), Some(MeshCall::Publish { .. })), "{calls:?}");
	assert!(matches!(calls.get(1), Some(MeshCall::Send { .. })), "{calls:?}");
}

#[tokio::test]
async fn short_send_args_reply_invalid_args() {
	for (name, args) in [
		("sendtoroom", vec!["room1"]),
		("sendtouser", vec![]),
		("sendbroadcast", vec![]),
	] {
		let h = Harness::new();

		h.dispatcher
			.dispatch(&chat(7, &op(name, &args)), ContextKey::Uid)
			.await
			.expect("dispatch");

		assert!(h.mesh.published().is_empty(), "op {name}");
		assert_eq!(h.replies(), vec![format!(r#"{{"op":"{name}","error":"Invalid args"}}"#)]);
	}
}

#[tokio::test]
async fn subscribers_receive_fan_out() {
	let h = Harness::new();
	let listener = ConnectionId(200);
	let bystander = ConnectionId(300);

	let mut sub = chat(42, &op("subscribe", &["room1", "broadcast"]));
	sub.connection_id = listener;
	h.dispatcher.dispatch(&sub, ContextKey::Uid).await.expect("subscribe");

	let mut other = chat(42, &op("subscribe", &["room2"]));
	other.connection_id = bystander;
	h.dispatcher.dispatch(&other, ContextKey::Uid).await.expect("subscribe");

	assert!(h.mesh.is_subscribed(NODE, listener, &ChannelName::new("room1")));
	assert!(h.mesh.is_subscribed(NODE, listener, &ChannelName::broadcast()));

	h.dispatcher
		.dispatch(&chat(7, &op("sendtoroom", &["room1", "hi"])), ContextKey::Uid)
		.await
		.expect("send");

	assert_eq!(
		h.mesh.inbox(NODE, listener),
		vec![
			r#"{"op":"subscribe","success":true}"#.to_string(),
			r#"{"event":"subscribe","channel":"room1","data":"uid:7,message:hi"}"#.to_string(),
		]
	);
	assert_eq!(h.mesh.inbox(NODE, bystander), vec![r#"{"op":"subscribe","success":true}"#.to_string()]);
	assert!(!h.mesh.inbox(NODE, CONN).iter().any(|m| m.contains("uid:7")));
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
	let h = Harness::new();

	h.dispatcher
		.dispatch(&chat(7, &op("subscribe", &["room1"])), ContextKey::Uid)
		.await
		.expect("subscribe");
	h.dispatcher
		.dispatch(&chat(7, &op("unsubscribe", &["room1"])), ContextKey::Uid)
		.await
		.expect("unsubscribe");

	assert!(!h.mesh.is_subscribed(NODE, CONN, &ChannelName::new("room1")));
	assert_eq!(
		h.replies(),
		vec![
			r#"{"op":"subscribe","success":true}"#.to_string(),
			r#"{"op":"unsubscribe","success":true}"#.to_string(),
		]
	);

	h.dispatcher
		.dispatch(&chat(42, &op("sendtoroom", &["room1", "late"])), ContextKey::Uid)
		.await
		.expect("send");
	assert!(!h.mesh.inbox(NODE, CONN).iter().any(|m| m.contains("late")));
}

#[tokio::test]
async fn subscription_with_no_channels_still_succeeds() {
	let h = Harness::new();

	for name in ["subscribe", "unsubscribe"] {
		h.dispatcher
			.dispatch(&chat(7, &op(name, &[])), ContextKey::Uid)
			.await
			.expect("dispatch");
	}

	assert!(
		h.mesh
			.calls()
			.iter()
			.all(|c| matches!(c, MeshCall::Send { .. }))
	);
	assert_eq!(
		h.replies(),
		vec![
			r#"{"op":"subscribe","success":true}"#.to_string(),
			r#"{"op":"unsubscribe","success":true}"#.to_string(),
		]
	);
}

#[tokio::test]
async fn failed_publish_sends_no_reply() {
	let h = Harness::new();
	h.mesh.set_failing(true);

	let res = h
		.dispatcher
		.dispatch(&chat(7, &op("sendbroadcast", &["hello"])), ContextKey::Uid)
		.await;

	h.mesh.set_failing(false);
	assert!(res.is_err());
	assert!(h.replies().is_empty());
}
