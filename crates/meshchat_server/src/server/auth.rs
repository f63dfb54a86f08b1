#![forbid(unsafe_code)]

//! `auth`: credential check plus the context-slot handoff to the connection script.
//!
//! The script on the substrate side blocks until the slot is written, so every path through
//! here writes the slot exactly once (`0` on failure, the principal's id on success) and the
//! write is issued before the reply. The one exception is a connection that is already
//! authenticated: its script has long been released and the slot is left alone.

use anyhow::Context;
use meshchat_domain::UserId;
use meshchat_protocol::wire::{self, ERR_ALREADY_AUTHENTICATED, ERR_INVALID_ARGS, ERR_INVALID_CREDENTIALS};
use meshchat_protocol::{AuthArgs, OpCode};
use tracing::{debug, info, trace, warn};

use crate::server::dispatcher::ChatContext;
use crate::store::CredentialStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
	Authenticated(UserId),
	InvalidCredentials,
	InvalidArgs,
	AlreadyAuthenticated,
}

impl AuthOutcome {
	fn as_str(self) -> &'static str {
		match self {
			AuthOutcome::Authenticated(_) => "authenticated",
			AuthOutcome::InvalidCredentials => "invalid_credentials",
			AuthOutcome::InvalidArgs => "invalid_args",
			AuthOutcome::AlreadyAuthenticated => "already_authenticated",
		}
	}
}

pub async fn handle_auth(
	ctx: &ChatContext<'_>,
	credentials: &dyn CredentialStore,
	args: &[String],
) -> anyhow::Result<AuthOutcome> {
	let outcome = authenticate(ctx, credentials, args).await?;
	metrics::counter!("meshchat_auth_total", "result" => outcome.as_str()).increment(1);
	Ok(outcome)
}

async fn authenticate(
	ctx: &ChatContext<'_>,
	credentials: &dyn CredentialStore,
	args: &[String],
) -> anyhow::Result<AuthOutcome> {
	trace!(conn_id = %ctx.conn, headers = ?ctx.headers, "auth request");

	if ctx.uid.is_authenticated() {
		debug!(conn_id = %ctx.conn, uid = %ctx.uid, "auth on authenticated connection");
		ctx.reply(&wire::error_reply(OpCode::Auth, ERR_ALREADY_AUTHENTICATED))
			.await?;
		return Ok(AuthOutcome::AlreadyAuthenticated);
	}

	let args = match AuthArgs::from_args(args) {
		Ok(args) => args,
		Err(e) => {
			debug!(conn_id = %ctx.conn, error = %e, "auth: bad arity");
			write_slot(ctx, UserId::ANONYMOUS).await?;
			ctx.reply(&wire::error_reply(OpCode::Auth, ERR_INVALID_ARGS)).await?;
			return Ok(AuthOutcome::InvalidArgs);
		}
	};

	let principal = match credentials.find_principal(&args.name, &args.password).await {
		Ok(p) => p,
		Err(e) => {
			// Release the waiting script before surfacing the store failure.
			if let Err(slot_err) = write_slot(ctx, UserId::ANONYMOUS).await {
				warn!(conn_id = %ctx.conn, error = %slot_err, "auth: failed to release context slot");
			}
			return Err(e.context("credential lookup"));
		}
	};

	let Some(principal) = principal else {
		info!(conn_id = %ctx.conn, name = %args.name, "auth: invalid name or password");
		write_slot(ctx, UserId::ANONYMOUS).await?;
		ctx.reply(&wire::error_reply(OpCode::Auth, ERR_INVALID_CREDENTIALS))
			.await?;
		return Ok(AuthOutcome::InvalidCredentials);
	};

	if let Err(e) = credentials.set_online(principal.id, true).await {
		if let Err(slot_err) = write_slot(ctx, UserId::ANONYMOUS).await {
			warn!(conn_id = %ctx.conn, error = %slot_err, "auth: failed to release context slot");
		}
		return Err(e.context(format!("mark user {} online", principal.id)));
	}

	write_slot(ctx, principal.id).await?;
	ctx.reply(&wire::success_reply(OpCode::Auth)).await?;

	info!(conn_id = %ctx.conn, node_id = %ctx.node_id, uid = %principal.id, "auth: authenticated");
	Ok(AuthOutcome::Authenticated(principal.id))
}

async fn write_slot(ctx: &ChatContext<'_>, value: UserId) -> anyhow::Result<()> {
	ctx.node
		.set_context_value(ctx.conn, ctx.context_key, value)
		.await
		.with_context(|| format!("set context {}={} on conn {}", ctx.context_key, value, ctx.conn))
}
