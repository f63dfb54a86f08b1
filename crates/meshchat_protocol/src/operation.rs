#![forbid(unsafe_code)]

use core::fmt;

use meshchat_domain::SecretString;
use serde_json::Value;
use thiserror::Error;

use crate::CodecError;

/// Decoded business request: `{"op": .., "args": [..]}`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Operation {
	pub op: String,
	pub args: Vec<String>,
}

impl Operation {
	pub fn new(op: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
		Self {
			op: op.into(),
			args: args.into_iter().map(Into::into).collect(),
		}
	}

	pub fn code(&self) -> OpCode {
		OpCode::parse(&self.op)
	}
}

/// Known operations. Matching is exact and case-sensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
	Ping,
	Auth,
	Subscribe,
	Unsubscribe,
	SendToRoom,
	SendToUser,
	SendBroadcast,
	Unknown,
}

impl OpCode {
	pub fn parse(op: &str) -> Self {
		match op {
			"ping" => OpCode::Ping,
			"auth" => OpCode::Auth,
			"subscribe" => OpCode::Subscribe,
			"unsubscribe" => OpCode::Unsubscribe,
			"sendtoroom" => OpCode::SendToRoom,
			"sendtouser" => OpCode::SendToUser,
			"sendbroadcast" => OpCode::SendBroadcast,
			_ => OpCode::Unknown,
		}
	}

	/// Wire name echoed in replies.
	pub const fn as_str(self) -> &'static str {
		match self {
			OpCode::Ping => "ping",
			OpCode::Auth => "auth",
			OpCode::Subscribe => "subscribe",
			OpCode::Unsubscribe => "unsubscribe",
			OpCode::SendToRoom => "sendtoroom",
			OpCode::SendToUser => "sendtouser",
			OpCode::SendBroadcast => "sendbroadcast",
			OpCode::Unknown => "",
		}
	}

	/// Operations that require a non-zero UserID.
	pub const fn requires_auth(self) -> bool {
		matches!(
			self,
			OpCode::Subscribe | OpCode::Unsubscribe | OpCode::SendToRoom | OpCode::SendToUser | OpCode::SendBroadcast
		)
	}
}

impl fmt::Display for OpCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Decode the raw frame text of a `chat` envelope.
///
/// Empty, unparseable, non-object and empty-object payloads are decode failures. A missing
/// or non-string `op` decodes to the empty op, a missing or non-array `args` to no args.
pub fn decode_operation(raw: &str) -> Result<Operation, CodecError> {
	if raw.trim().is_empty() {
		return Err(CodecError::Empty);
	}

	let value: Value = serde_json::from_str(raw)?;
	let Value::Object(obj) = value else {
		return Err(CodecError::NotAnObject);
	};
	if obj.is_empty() {
		return Err(CodecError::Empty);
	}

	let op = obj.get("op").and_then(Value::as_str).unwrap_or_default().to_string();
	let args = match obj.get("args") {
		Some(Value::Array(items)) => items.iter().map(arg_to_string).collect(),
		_ => Vec::new(),
	};

	Ok(Operation { op, args })
}

fn arg_to_string(v: &Value) -> String {
	match v {
		Value::String(s) => s.clone(),
		Value::Null => String::new(),
		other => other.to_string(),
	}
}

/// Expected argument count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
	Exactly(usize),
	AtLeast(usize),
}

impl fmt::Display for Arity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Arity::Exactly(n) => write!(f, "exactly {n}"),
			Arity::AtLeast(n) => write!(f, "at least {n}"),
		}
	}
}

/// Argument list did not match the operation's arity.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{op} expects {expected} args, got {got}")]
pub struct ArityError {
	pub op: OpCode,
	pub expected: Arity,
	pub got: usize,
}

/// `auth` args: `[name, password]`.
#[derive(Debug, Clone)]
pub struct AuthArgs {
	pub name: String,
	pub password: SecretString,
}

impl AuthArgs {
	pub fn from_args(args: &[String]) -> Result<Self, ArityError> {
		match args {
			[name, password] => Ok(Self {
				name: name.clone(),
				password: SecretString::new(password.clone()),
			}),
			_ => Err(ArityError {
				op: OpCode::Auth,
				expected: Arity::Exactly(2),
				got: args.len(),
			}),
		}
	}
}

/// `sendtoroom` / `sendtouser` args: `[channel, message, ..]`. Extra args are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendArgs<'a> {
	pub channel: &'a str,
	pub message: &'a str,
}

impl<'a> SendArgs<'a> {
	pub fn from_args(op: OpCode, args: &'a [String]) -> Result<Self, ArityError> {
		match args {
			[channel, message, ..] => Ok(Self { channel, message }),
			_ => Err(ArityError {
				op,
				expected: Arity::AtLeast(2),
				got: args.len(),
			}),
		}
	}
}

/// `sendbroadcast` args: `[message, ..]`. Extra args are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastArgs<'a> {
	pub message: &'a str,
}

impl<'a> BroadcastArgs<'a> {
	pub fn from_args(args: &'a [String]) -> Result<Self, ArityError> {
		match args {
			[message, ..] => Ok(Self { message }),
			[] => Err(ArityError {
				op: OpCode::SendBroadcast,
				expected: Arity::AtLeast(1),
				got: 0,
			}),
		}
	}
}
