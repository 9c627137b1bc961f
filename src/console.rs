//! Server-side console for one connected peer.
//!
//! A console turns a connection into something that behaves like a local
//! terminal: `echo` prints a line on the peer, `prompt` prints a question and
//! waits for the answer.
//!
//! The wire carries no request IDs, so a reply is simply the next line the
//! peer sends after the question. Only one prompt may be outstanding per
//! console; a second concurrent prompt is rejected instead of interleaved.
//! Lines the peer sent before the question was asked are still queued and
//! will be taken as the reply.

use crate::connection::{Connection, Recv};
use crate::error::{ConsoleError, Result};
use crate::registry::Registry;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;
use std::time::Duration;
use tracing::debug;

/// Outcome of a [`Console::prompt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptOutcome {
    /// The peer answered.
    Reply(String),
    /// Nothing arrived within the wait. Not an error.
    TimedOut,
    /// The connection went away before a reply arrived.
    Disconnected,
}

impl PromptOutcome {
    /// The reply text, if there was one.
    pub fn reply(self) -> Option<String> {
        match self {
            PromptOutcome::Reply(reply) => Some(reply),
            _ => None,
        }
    }
}

/// Addressable handle for one peer connected to a server.
pub struct Console {
    key: SocketAddr,
    conn: Connection,
    prompt_pending: AtomicBool,
    registry: Weak<Registry>,
}

/// Clears the pending-prompt marker on every exit path, including a
/// dropped `prompt` future.
struct PromptGuard<'a>(&'a AtomicBool);

impl<'a> PromptGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PromptGuard(flag))
    }
}

impl Drop for PromptGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Console {
    /// Wrap a connection. `registry` is where `close` removes the entry from.
    pub fn new(conn: Connection, registry: Weak<Registry>) -> Self {
        Self {
            key: conn.peer(),
            conn,
            prompt_pending: AtomicBool::new(false),
            registry,
        }
    }

    /// Registry key: the peer's remote address.
    pub fn key(&self) -> SocketAddr {
        self.key
    }

    /// Send a line without waiting for anything back.
    pub async fn echo(&self, message: &str) -> Result<()> {
        debug!(peer = %self.key, "echo");
        self.conn.send_line(message).await
    }

    /// Send `message` and wait up to `wait` for the peer's next line.
    ///
    /// An empty `message` sends nothing and only waits for input.
    pub async fn prompt(&self, message: &str, wait: Duration) -> Result<PromptOutcome> {
        let _guard = PromptGuard::acquire(&self.prompt_pending)
            .ok_or(ConsoleError::PromptInProgress(self.key))?;

        if !message.is_empty() {
            self.conn.send_line(message).await?;
        } else if !self.conn.is_alive() {
            return Err(ConsoleError::ConnectionClosed);
        }

        let outcome = match self.conn.recv_line(Some(wait)).await {
            Recv::Line(reply) => PromptOutcome::Reply(reply),
            Recv::TimedOut => PromptOutcome::TimedOut,
            Recv::Closed => PromptOutcome::Disconnected,
        };
        debug!(peer = %self.key, ?outcome, "prompt finished");
        Ok(outcome)
    }

    /// Whether a prompt is currently waiting for a reply.
    pub fn prompt_pending(&self) -> bool {
        self.prompt_pending.load(Ordering::Acquire)
    }

    /// Non-blocking liveness check.
    pub fn is_alive(&self) -> bool {
        self.conn.is_alive()
    }

    /// Close the transport and drop the registry entry. Idempotent.
    pub async fn close(&self) {
        self.conn.close().await;
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_if_same(&self.key, self);
        }
    }

    /// Fire the shutdown signal without waiting on the transport.
    pub(crate) fn signal_close(&self) {
        self.conn.signal_close();
    }
}

impl std::fmt::Debug for Console {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Console")
            .field("key", &self.key)
            .field("alive", &self.is_alive())
            .field("prompt_pending", &self.prompt_pending())
            .finish()
    }
}
