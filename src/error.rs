//! Error types for sockconsole.

use std::net::SocketAddr;
use thiserror::Error;

/// Main error type for console operations.
///
/// A prompt that receives no reply in time is not an error; see
/// [`PromptOutcome`](crate::console::PromptOutcome).
#[derive(Debug, Error)]
pub enum ConsoleError {
    /// The transport could not be established.
    #[error("Failed to connect: {0}")]
    Connection(#[source] std::io::Error),

    /// Operation attempted on a connection that is no longer alive.
    #[error("Connection closed")]
    ConnectionClosed,

    /// No live console is registered under the key.
    #[error("No console for peer {0}")]
    NotFound(SocketAddr),

    /// A prompt is already waiting for a reply on this console.
    #[error("Prompt already in progress for peer {0}")]
    PromptInProgress(SocketAddr),

    /// The listening socket could not be set up.
    #[error("Failed to bind {0}: {1}")]
    Bind(SocketAddr, #[source] std::io::Error),

    /// An address string did not resolve to a socket address.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Other I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using ConsoleError.
pub type Result<T> = std::result::Result<T, ConsoleError>;
