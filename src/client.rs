//! Peer-side endpoint.
//!
//! A client holds exactly one connection to a server. Lines sent by the
//! server's `echo` and by the question half of its `prompt` arrive the same
//! way and are read in order with [`Client::read`]; answers go back with
//! [`Client::write`].

use crate::connection::{Connection, Recv};
use crate::error::{ConsoleError, Result};
use crate::framing::DEFAULT_MAX_LINE_LENGTH;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Connection options for a [`Client`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Longest accepted inbound line in bytes
    pub max_line_length: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

/// Connected console client.
pub struct Client {
    conn: Connection,
    local_addr: SocketAddr,
}

impl Client {
    /// Connect to a server at `host:port` with default options.
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(ConsoleError::Connection)?;
        Self::from_stream(stream, ClientOptions::default())
    }

    /// Connect to `address` (`host:port`) with explicit options.
    pub async fn connect_with(address: &str, options: ClientOptions) -> Result<Self> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(ConsoleError::Connection)?;
        Self::from_stream(stream, options)
    }

    fn from_stream(stream: TcpStream, options: ClientOptions) -> Result<Self> {
        let peer = stream.peer_addr().map_err(ConsoleError::Connection)?;
        let local_addr = stream.local_addr().map_err(ConsoleError::Connection)?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let (read_half, write_half) = stream.into_split();
        let (conn, reader) = Connection::new(peer, read_half, write_half, options.max_line_length);
        tokio::spawn(reader.run());

        info!(server = %peer, local = %local_addr, "Connected");
        Ok(Self { conn, local_addr })
    }

    /// Wait for the next line from the server.
    ///
    /// Fails with `ConnectionClosed` once the connection is gone and every
    /// line received before that has been read.
    pub async fn read(&self) -> Result<String> {
        match self.conn.recv_line(None).await {
            Recv::Line(line) => Ok(line),
            _ => Err(ConsoleError::ConnectionClosed),
        }
    }

    /// Like [`read`](Self::read) but gives up after `wait`, returning `None`.
    pub async fn read_timeout(&self, wait: Duration) -> Result<Option<String>> {
        match self.conn.recv_line(Some(wait)).await {
            Recv::Line(line) => Ok(Some(line)),
            Recv::TimedOut => Ok(None),
            Recv::Closed => Err(ConsoleError::ConnectionClosed),
        }
    }

    /// Send one line to the server.
    pub async fn write(&self, message: &str) -> Result<()> {
        self.conn.send_line(message).await
    }

    /// Probe the connection by sending a heartbeat the server ignores.
    ///
    /// Returns whether the write went through.
    pub async fn heartbeat(&self) -> bool {
        self.conn.send_heartbeat().await.is_ok()
    }

    /// Whether the connection is still open.
    pub fn alive(&self) -> bool {
        self.conn.is_alive()
    }

    /// Wait until the connection is gone, whether the server hung up or
    /// [`close`](Self::close) was called.
    pub async fn closed(&self) {
        self.conn.closed().await;
    }

    /// Server address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.conn.peer()
    }

    /// Local address; this is the key the server files the client under.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Close the connection. Idempotent.
    pub async fn close(&self) {
        self.conn.close().await;
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.conn.signal_close();
    }
}
