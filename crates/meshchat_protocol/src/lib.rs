#![forbid(unsafe_code)]

pub mod envelope;
pub mod operation;
pub mod rpc;
pub mod wire;

use thiserror::Error;

pub use envelope::{
	ChatData, ConnData, ConnEvent, Envelope, EnvelopeData, Headers, MeshMessage, MessageKind, QueueKind, RpcFailure,
	RpcOutcome, decode_mesh_message, parse_durable_record,
};
pub use operation::{Arity, ArityError, AuthArgs, BroadcastArgs, OpCode, Operation, SendArgs, decode_operation};
pub use rpc::RpcRequest;

/// Decode failures for frames, envelopes and durable records.
#[derive(Debug, Error)]
pub enum CodecError {
	#[error("empty payload")]
	Empty,

	#[error("invalid json: {0}")]
	InvalidJson(#[from] serde_json::Error),

	#[error("expected a json object")]
	NotAnObject,

	#[error("missing field: {0}")]
	MissingField(&'static str),

	#[error("invalid field {field}: {detail}")]
	InvalidField {
		field: &'static str,
		detail: String,
	},
}
