#![forbid(unsafe_code)]

use core::fmt;

use meshchat_domain::{ConnectionId, NodeId, UserId};
use serde_json::{Map, Value};

use crate::CodecError;

/// Handshake headers the substrate attaches to a connection.
pub type Headers = Map<String, Value>;

/// Kind of an inbound substrate message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
	Consume,
	Result,
	Error,
	Other,
}

impl MessageKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			MessageKind::Consume => "consume",
			MessageKind::Result => "result",
			MessageKind::Error => "error",
			MessageKind::Other => "other",
		}
	}
}

impl fmt::Display for MessageKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Routing tag of an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueueKind {
	Chat,
	Conn,
	/// Unrecognized queue name (direct path) or event tag (durable path).
	Other(String),
}

impl QueueKind {
	pub fn parse(s: &str) -> Self {
		match s {
			"chat" => QueueKind::Chat,
			"conn" => QueueKind::Conn,
			other => QueueKind::Other(other.to_string()),
		}
	}

	/// Maps the `event` field of a durable record to the queue that handles it.
	pub fn from_durable_event(event: &str) -> Self {
		match event {
			"message" => QueueKind::Chat,
			"close" | "handshake" => QueueKind::Conn,
			other => QueueKind::Other(other.to_string()),
		}
	}

	pub fn as_str(&self) -> &str {
		match self {
			QueueKind::Chat => "chat",
			QueueKind::Conn => "conn",
			QueueKind::Other(s) => s.as_str(),
		}
	}

	/// Bounded label for metrics; every unknown queue collapses to `other`.
	pub fn metric_label(&self) -> &'static str {
		match self {
			QueueKind::Chat => "chat",
			QueueKind::Conn => "conn",
			QueueKind::Other(_) => "other",
		}
	}
}

impl fmt::Display for QueueKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Connection lifecycle event carried on the `conn` queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConnEvent {
	Connect,
	Handshake,
	Close,
	Other(String),
}

impl ConnEvent {
	pub fn parse(s: &str) -> Self {
		match s {
			"connect" => ConnEvent::Connect,
			"handshake" => ConnEvent::Handshake,
			"close" => ConnEvent::Close,
			other => ConnEvent::Other(other.to_string()),
		}
	}

	pub fn as_str(&self) -> &str {
		match self {
			ConnEvent::Connect => "connect",
			ConnEvent::Handshake => "handshake",
			ConnEvent::Close => "close",
			ConnEvent::Other(s) => s.as_str(),
		}
	}
}

/// Payload of a `chat` envelope.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChatData {
	/// UserID the substrate has attached to the connection (`0` if none).
	pub uid: UserId,
	pub headers: Headers,
	/// Raw client frame text; empty when the frame carried no text.
	pub frame_data: String,
}

impl ChatData {
	pub fn from_value(data: &Value) -> Self {
		let Some(obj) = data.as_object() else {
			return Self::default();
		};

		let frame_data = obj
			.get("frame")
			.and_then(Value::as_object)
			.and_then(|frame| frame.get("data"))
			.and_then(Value::as_str)
			.unwrap_or_default()
			.to_string();

		Self {
			uid: uid_field(obj),
			headers: headers_field(obj),
			frame_data,
		}
	}
}

/// Payload of a `conn` envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnData {
	pub event: ConnEvent,
	pub uid: UserId,
	pub headers: Headers,
}

impl ConnData {
	pub fn from_value(data: &Value) -> Self {
		let obj = data.as_object();
		let event = obj
			.and_then(|o| o.get("event"))
			.and_then(Value::as_str)
			.unwrap_or_default();

		Self {
			event: ConnEvent::parse(event),
			uid: obj.map(uid_field).unwrap_or_default(),
			headers: obj.map(headers_field).unwrap_or_default(),
		}
	}
}

/// Queue-specific envelope payload.
#[derive(Debug, Clone, PartialEq)]
pub enum EnvelopeData {
	Chat(ChatData),
	Conn(ConnData),
	/// Payload of an envelope with an unrecognized routing tag; kept for logging only.
	Unrouted(Value),
}

/// Transport-neutral unit of inbound work.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
	pub queue: QueueKind,
	pub connection_id: ConnectionId,
	pub node_id: NodeId,
	pub data: EnvelopeData,
}

impl Envelope {
	/// Build an envelope, decoding `data` according to `queue`.
	pub fn new(queue: QueueKind, connection_id: ConnectionId, node_id: NodeId, data: &Value) -> Self {
		let data = match &queue {
			QueueKind::Chat => EnvelopeData::Chat(ChatData::from_value(data)),
			QueueKind::Conn => EnvelopeData::Conn(ConnData::from_value(data)),
			QueueKind::Other(_) => EnvelopeData::Unrouted(data.clone()),
		};

		Self {
			queue,
			connection_id,
			node_id,
			data,
		}
	}

	/// UserID attached to the connection at the time the envelope was produced.
	pub fn uid(&self) -> UserId {
		match &self.data {
			EnvelopeData::Chat(c) => c.uid,
			EnvelopeData::Conn(c) => c.uid,
			EnvelopeData::Unrouted(_) => UserId::ANONYMOUS,
		}
	}
}

/// Counters returned for an earlier substrate request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RpcOutcome {
	pub id: Option<u64>,
	pub success: u64,
	pub fail: u64,
	pub total: u64,
}

/// Error returned by the substrate for an earlier request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcFailure {
	pub id: Option<u64>,
	pub code: i64,
	pub message: String,
}

/// Inbound message on the direct (in-process) path.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshMessage {
	Consume(Envelope),
	Result(RpcOutcome),
	Error(RpcFailure),
	Other(Value),
}

impl MeshMessage {
	pub fn kind(&self) -> MessageKind {
		match self {
			MeshMessage::Consume(_) => MessageKind::Consume,
			MeshMessage::Result(_) => MessageKind::Result,
			MeshMessage::Error(_) => MessageKind::Error,
			MeshMessage::Other(_) => MessageKind::Other,
		}
	}
}

/// Decode a text frame pushed by the substrate on the direct path.
///
/// `{"method":"consume","params":{"queue":..,"node_id":..,"client_id":..,"data":{..}}}` yields an
/// envelope; JSON-RPC responses yield `Result`/`Error`; anything else is `Other`.
pub fn decode_mesh_message(text: &str) -> Result<MeshMessage, CodecError> {
	let value = parse_object(text)?;
	let Value::Object(obj) = &value else {
		return Err(CodecError::NotAnObject);
	};

	if obj.get("method").and_then(Value::as_str) == Some("consume") {
		let params = obj
			.get("params")
			.and_then(Value::as_object)
			.ok_or(CodecError::MissingField("params"))?;

		let queue = params
			.get("queue")
			.and_then(Value::as_str)
			.ok_or(CodecError::MissingField("queue"))?;

		let connection_id = client_id_field(params)?;
		let node_id = node_id_field(params);
		let data = params.get("data").cloned().unwrap_or(Value::Null);

		return Ok(MeshMessage::Consume(Envelope::new(
			QueueKind::parse(queue),
			connection_id,
			node_id,
			&data,
		)));
	}

	let id = obj.get("id").and_then(lenient_u64);

	if let Some(err) = obj.get("error").filter(|e| !e.is_null()) {
		let failure = match err {
			Value::Object(e) => RpcFailure {
				id,
				code: e.get("code").and_then(Value::as_i64).unwrap_or_default(),
				message: e
					.get("message")
					.and_then(Value::as_str)
					.unwrap_or_default()
					.to_string(),
			},
			Value::String(s) => RpcFailure {
				id,
				code: 0,
				message: s.clone(),
			},
			other => RpcFailure {
				id,
				code: 0,
				message: other.to_string(),
			},
		};
		return Ok(MeshMessage::Error(failure));
	}

	if let Some(result) = obj.get("result") {
		let counter = |k: &str| result.get(k).and_then(lenient_u64).unwrap_or_default();
		return Ok(MeshMessage::Result(RpcOutcome {
			id,
			success: counter("success"),
			fail: counter("fail"),
			total: counter("total"),
		}));
	}

	Ok(MeshMessage::Other(value))
}

/// Decode a raw record popped from the durable queue.
///
/// Records look like `{"node_id":..,"client_id":..,"data":{"event":..,..}}`; the `event` field of
/// `data` selects the queue (`message` → chat, `close`/`handshake` → conn).
pub fn parse_durable_record(text: &str) -> Result<Envelope, CodecError> {
	let value = parse_object(text)?;
	let Value::Object(obj) = &value else {
		return Err(CodecError::NotAnObject);
	};

	let connection_id = client_id_field(obj)?;
	let node_id = node_id_field(obj);
	let data = obj.get("data").cloned().unwrap_or(Value::Null);

	let event = data.get("event").and_then(Value::as_str).unwrap_or_default();

	Ok(Envelope::new(
		QueueKind::from_durable_event(event),
		connection_id,
		node_id,
		&data,
	))
}

fn parse_object(text: &str) -> Result<Value, CodecError> {
	if text.trim().is_empty() {
		return Err(CodecError::Empty);
	}

	let value: Value = serde_json::from_str(text)?;
	if !value.is_object() {
		return Err(CodecError::NotAnObject);
	}
	Ok(value)
}

fn client_id_field(obj: &Map<String, Value>) -> Result<ConnectionId, CodecError> {
	let raw = obj.get("client_id").ok_or(CodecError::MissingField("client_id"))?;
	lenient_u64(raw).map(ConnectionId).ok_or_else(|| CodecError::InvalidField {
		field: "client_id",
		detail: raw.to_string(),
	})
}

fn node_id_field(obj: &Map<String, Value>) -> NodeId {
	obj.get("node_id").and_then(lenient_u64).map(NodeId).unwrap_or_default()
}

fn uid_field(obj: &Map<String, Value>) -> UserId {
	obj.get("uid").and_then(lenient_u64).map(UserId).unwrap_or_default()
}

fn headers_field(obj: &Map<String, Value>) -> Headers {
	obj.get("headers").and_then(Value::as_object).cloned().unwrap_or_default()
}

/// Integer or numeric string; anything else is `None`.
fn lenient_u64(v: &Value) -> Option<u64> {
	match v {
		Value::Number(n) => n.as_u64(),
		Value::String(s) => s.trim().parse().ok(),
		_ => None,
	}
}
