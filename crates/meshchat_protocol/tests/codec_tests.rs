use meshchat_domain::{ConnectionId, NodeId, UserId};
use meshchat_protocol::{
	CodecError, ConnEvent, EnvelopeData, MeshMessage, MessageKind, OpCode, QueueKind, decode_mesh_message,
	decode_operation, parse_durable_record,
};
use proptest::prelude::*;
use serde_json::json;

fn direct_frame(queue: &str, node: u64, client: u64, data: serde_json::Value) -> String {
	json!({
		"method": "consume",
		"params": { "queue": queue, "node_id": node, "client_id": client, "data": data }
	})
	.to_string()
}

fn durable_record(node: u64, client: u64, data: serde_json::Value) -> String {
	json!({ "node_id": node, "client_id": client, "data": data }).to_string()
}

fn consume(text: &str) -> meshchat_protocol::Envelope {
	match decode_mesh_message(text).expect("decode") {
		MeshMessage::Consume(env) => env,
		other => panic!("expected consume, got: {other:?}"),
	}
}

#[test]
fn decodes_well_formed_operation() {
	let op = decode_operation(r#"{"op":"auth","args":["alice","secret"]}"#).expect("decode");
	assert_eq!(op.code(), OpCode::Auth);
	assert_eq!(op.args, vec!["alice".to_string(), "secret".to_string()]);
}

#[test]
fn defaults_for_missing_op_and_args() {
	let op = decode_operation(r#"{"args":["x"]}"#).expect("decode");
	assert_eq!(op.op, "");
	assert_eq!(op.code(), OpCode::Unknown);

	let op = decode_operation(r#"{"op":"ping"}"#).expect("decode");
	assert!(op.args.is_empty());

	let op = decode_operation(r#"{"op":"subscribe","args":"room1"}"#).expect("decode");
	assert!(op.args.is_empty());
}

#[test]
fn rejects_malformed_payloads() {
	for raw in ["", "   ", "not json", "{", "[]", "[1,2]", "\"text\"", "42", "null", "{}"] {
		let err = decode_operation(raw).unwrap_err();
		match err {
			CodecError::Empty | CodecError::InvalidJson(_) | CodecError::NotAnObject => {}
			other => panic!("unexpected error for {raw:?}: {other:?}"),
		}
	}
}

#[test]
fn direct_chat_envelope() {
	let env = consume(&direct_frame(
		"chat",
		2,
		11,
		json!({ "uid": 7, "headers": { "user-agent": ["x"] }, "frame": { "data": "{\"op\":\"ping\"}" } }),
	));
	assert_eq!(env.queue, QueueKind::Chat);
	assert_eq!(env.connection_id, ConnectionId(11));
	assert_eq!(env.node_id, NodeId(2));
	assert_eq!(env.uid(), UserId(7));
	match env.data {
		EnvelopeData::Chat(chat) => {
			assert_eq!(chat.frame_data, r#"{"op":"ping"}"#);
			assert!(chat.headers.contains_key("user-agent"));
		}
		other => panic!("expected chat data, got: {other:?}"),
	}
}

#[test]
fn direct_conn_envelope() {
	let env = consume(&direct_frame("conn", 1, 4, json!({ "event": "close", "uid": 5 })));
	assert_eq!(env.queue, QueueKind::Conn);
	match env.data {
		EnvelopeData::Conn(conn) => {
			assert_eq!(conn.event, ConnEvent::Close);
			assert_eq!(conn.uid, UserId(5));
		}
		other => panic!("expected conn data, got: {other:?}"),
	}
}

#[test]
fn unknown_queue_is_unrouted() {
	let env = consume(&direct_frame("metrics", 1, 4, json!({ "x": 1 })));
	assert_eq!(env.queue, QueueKind::Other("metrics".to_string()));
	assert!(matches!(env.data, EnvelopeData::Unrouted(_)));
}

#[test]
fn consume_requires_queue_and_client_id() {
	let no_queue = json!({ "method": "consume", "params": { "client_id": 1 } }).to_string();
	assert!(matches!(
		decode_mesh_message(&no_queue),
		Err(CodecError::MissingField("queue"))
	));

	let no_client = json!({ "method": "consume", "params": { "queue": "chat" } }).to_string();
	assert!(matches!(
		decode_mesh_message(&no_client),
		Err(CodecError::MissingField("client_id"))
	));

	let bad_client = json!({ "method": "consume", "params": { "queue": "chat", "client_id": "abc" } }).to_string();
	assert!(matches!(
		decode_mesh_message(&bad_client),
		Err(CodecError::InvalidField { field: "client_id", .. })
	));
}

#[test]
fn result_error_and_other_messages() {
	let result = decode_mesh_message(r#"{"id":3,"result":{"success":2,"fail":1,"total":3}}"#).expect("decode");
	match result {
		MeshMessage::Result(r) => {
			assert_eq!(r.id, Some(3));
			assert_eq!((r.success, r.fail, r.total), (2, 1, 3));
		}
		other => panic!("expected result, got: {other:?}"),
	}

	let err = decode_mesh_message(r#"{"id":4,"error":{"code":-32601,"message":"no such method"}}"#).expect("decode");
	assert_eq!(err.kind(), MessageKind::Error);
	match err {
		MeshMessage::Error(e) => {
			assert_eq!(e.id, Some(4));
			assert_eq!(e.code, -32601);
			assert_eq!(e.message, "no such method");
		}
		other => panic!("expected error, got: {other:?}"),
	}

	let other = decode_mesh_message(r#"{"hello":"world"}"#).expect("decode");
	assert_eq!(other.kind(), MessageKind::Other);
}

#[test]
fn durable_routes_by_event() {
	let chat = parse_durable_record(&durable_record(
		1,
		9,
		json!({ "event": "message", "uid": 3, "frame": { "data": "{}" } }),
	))
	.expect("decode");
	assert_eq!(chat.queue, QueueKind::Chat);

	let conn = parse_durable_record(&durable_record(1, 9, json!({ "event": "handshake", "uid": 0 }))).expect("decode");
	assert_eq!(conn.queue, QueueKind::Conn);

	let other = parse_durable_record(&durable_record(1, 9, json!({ "event": "ping" }))).expect("decode");
	assert_eq!(other.queue, QueueKind::Other("ping".to_string()));
}

#[test]
fn durable_rejects_garbage() {
	assert!(parse_durable_record("").is_err());
	assert!(parse_durable_record("[1]").is_err());
	assert!(parse_durable_record("{\"data\":{}}").is_err());
}

#[test]
fn chat_paths_are_equivalent() {
	let frame = r#"{"op":"sendtoroom","args":["room1","hi"]}"#;
	let headers = json!({ "origin": "https://example.com" });

	let direct = consume(&direct_frame(
		"chat",
		3,
		77,
		json!({ "uid": 7, "headers": headers, "frame": { "data": frame } }),
	));
	let durable = parse_durable_record(&durable_record(
		3,
		77,
		json!({ "event": "message", "uid": 7, "headers": headers, "frame": { "data": frame } }),
	))
	.expect("decode");

	assert_eq!(direct, durable);
}

#[test]
fn close_paths_are_equivalent() {
	let direct = consume(&direct_frame("conn", 1, 5, json!({ "event": "close", "uid": 5 })));
	let durable = parse_durable_record(&durable_record(1, 5, json!({ "event": "close", "uid": 5 }))).expect("decode");
	assert_eq!(direct, durable);
}

#[test]
fn unknown_queues_share_one_metric_label() {
	let direct = consume(&direct_frame("telemetry-7f3a", 1, 5, json!({})));
	let durable = parse_durable_record(&durable_record(1, 5, json!({ "event": "x-9" }))).expect("decode");

	assert_eq!(direct.queue, QueueKind::Other("telemetry-7f3a".to_string()));
	assert_eq!(direct.queue.metric_label(), "other");
	assert_eq!(durable.queue.metric_label(), "other");
	assert_eq!(QueueKind::Chat.metric_label(), "chat");
	assert_eq!(QueueKind::Conn.metric_label(), "conn");
}

proptest! {
	#[test]
	fn decode_operation_never_panics(raw in ".*") {
		let _ = decode_operation(&raw);
	}

	#[test]
	fn decoded_operation_keeps_op_and_args(op in "[a-z]{0,12}", args in proptest::collection::vec(".*", 0..4)) {
		let raw = json!({ "op": op, "args": args }).to_string();
		let decoded = decode_operation(&raw).expect("object with op is decodable");
		prop_assert_eq!(decoded.op, op);
		prop_assert_eq!(decoded.args, args);
	}

	#[test]
	fn paths_agree_for_any_chat_frame(
		uid in 0u64..10_000,
		node in 0u64..64,
		client in 1u64..1_000_000,
		frame in ".*",
	) {
		let direct = consume(&direct_frame(
			"chat",
			node,
			client,
			json!({ "uid": uid, "frame": { "data": frame } }),
		));
		let durable = parse_durable_record(&durable_record(
			node,
			client,
			json!({ "event": "message", "uid": uid, "frame": { "data": frame } }),
		))
		.expect("decode");
		prop_assert_eq!(direct, durable);
	}
}
