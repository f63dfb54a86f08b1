#![forbid(unsafe_code)]

//! Literal reply and publish bodies. Clients match on these exact byte shapes, so key
//! order is fixed and nothing is re-serialized.

use meshchat_domain::{ChannelName, UserId};

use crate::operation::OpCode;

/// Reply for a frame that failed to decode.
pub const JSON_FORMAT_ERROR: &str = r#"{"error":"Json format error"}"#;

/// Reply to `ping`.
pub const PONG: &str = r#"{"op":"pong"}"#;

pub const ERR_NO_ACCESS: &str = "No access";
pub const ERR_INVALID_CREDENTIALS: &str = "Invalid name or password";
pub const ERR_INVALID_ARGS: &str = "Invalid args";
pub const ERR_ALREADY_AUTHENTICATED: &str = "Already authenticated";

/// `{"op":"<op>","success":true}`
pub fn success_reply(op: OpCode) -> String {
	format!(r#"{{"op":"{}","success":true}}"#, op.as_str())
}

/// `{"op":"<op>","error":"<error>"}`
pub fn error_reply(op: OpCode, error: &str) -> String {
	format!(r#"{{"op":"{}","error":"{}"}}"#, op.as_str(), error)
}

/// Fan-out message body: `uid:<uid>,message:<message>`.
///
/// The message is not escaped; a message containing `,` or `:` cannot be split back
/// into its fields unambiguously by the receiver.
pub fn compose_message(uid: UserId, message: &str) -> String {
	format!("uid:{uid},message:{message}")
}

/// Substrate publish body: `{"event":"subscribe","channel":"<channel>","data":"<data>"}`.
///
/// `event` is the substrate's delivery tag, not a client opcode. Channel and data are
/// interpolated verbatim.
pub fn publish_payload(channel: &ChannelName, data: &str) -> String {
	format!(r#"{{"event":"subscribe","channel":"{channel}","data":"{data}"}}"#)
}
