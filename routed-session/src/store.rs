use std::fmt;

use routed_core::middleware::BoxFuture;
use routed_core::Context;

use crate::session::Session;

/// Errors surfaced by session stores.
#[derive(Debug, Clone)]
pub enum SessionError {
    Store(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Store(msg) => write!(f, "session store error: {msg}"),
        }
    }
}

impl std::error::Error for SessionError {}

/// Persistence contract for sessions.
///
/// `read` resolves the request's cookie to a session, returning a fresh
/// one when there is no usable cookie. `write` persists the session and
/// queues the cookie on the response; for destroyed sessions it deletes
/// persisted state and queues an expiring cookie instead.
pub trait SessionStore: Send + Sync + 'static {
    fn read<'a>(
        &'a self,
        ctx: &'a Context,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Session, SessionError>>;

    fn write<'a>(
        &'a self,
        ctx: &'a mut Context,
        session: &'a Session,
    ) -> BoxFuture<'a, Result<(), SessionError>>;
}
