//! sockconsole: interactive line consoles for many remote peers.
//!
//! A [`Server`] accepts any number of TCP peers and files each one in a
//! registry under its remote address. Every peer gets a [`Console`] that
//! behaves like a local terminal:
//! - `echo` writes a line to the peer
//! - `prompt` writes a line and waits, up to a bound, for the peer's answer
//!
//! Peers talk through a [`Client`], reading lines in order and writing
//! answers back. Traffic is newline-delimited UTF-8; see [`framing`].
//!
//! ```no_run
//! use sockconsole::{Client, PromptOutcome, Server, ServerConfig};
//! use std::time::Duration;
//!
//! # async fn demo() -> sockconsole::Result<()> {
//! let server = Server::new(ServerConfig::default());
//! let addr = server.listen("127.0.0.1:10111")?;
//!
//! let client = Client::connect("127.0.0.1", addr.port()).await?;
//! # tokio::time::sleep(Duration::from_millis(50)).await;
//! let console = server.get_console(&client.local_addr())?;
//! console.echo("hello from server").await?;
//! assert_eq!(client.read().await?, "hello from server");
//!
//! let outcome = console.prompt("say something", Duration::from_millis(10)).await?;
//! assert_eq!(outcome, PromptOutcome::TimedOut);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod console;
pub mod error;
pub mod framing;
pub mod registry;
pub mod server;

pub use client::{Client, ClientOptions};
pub use console::{Console, PromptOutcome};
pub use error::{ConsoleError, Result};
pub use registry::Registry;
pub use server::{Server, ServerConfig};
