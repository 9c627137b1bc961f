//! Connection core shared by server consoles and clients.
//!
//! A `Connection` owns the write half of a transport behind an async write
//! lock, the consuming end of the inbound queue, an alive flag and a
//! shutdown signal. The matching [`Reader`] owns the read half and the
//! producing end of the queue; it must be spawned on its own task.
//!
//! ```text
//!   transport ──read──> Reader ──mpsc──> inbound queue ──> recv_line()
//!   transport <─write── send_line() (serialized by the write lock)
//! ```
//!
//! Closing flips the alive flag and fires the shutdown signal. The Reader
//! observes the signal next to its blocking read, drops the queue sender
//! and exits, so consumers waiting in `recv_line` return promptly. The alive
//! flag is itself a `watch` channel, so [`Connection::closed`] can wait for
//! the connection to die whichever side ended it.

use crate::error::{ConsoleError, Result};
use crate::framing::{self, ParseResult};
use bytes::{Buf, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, trace, warn};

/// Initial read buffer size
const BUFFER_SIZE: usize = 4096;

/// Write half of a transport, type-erased so any stream can back a connection.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Result of waiting for the next inbound line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recv {
    /// Next line in arrival order.
    Line(String),
    /// The wait elapsed with nothing queued.
    TimedOut,
    /// The connection is gone and nothing is left to drain.
    Closed,
}

/// Why a reader stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderExit {
    /// Peer closed its side of the stream.
    Eof,
    /// Local close was requested.
    Shutdown,
    /// Transport error or undecodable input.
    Failed,
}

/// Live half of a connection used by callers.
pub struct Connection {
    peer: SocketAddr,
    writer: Mutex<BoxedWriter>,
    inbound: Mutex<mpsc::UnboundedReceiver<String>>,
    alive: Arc<watch::Sender<bool>>,
    shutdown: watch::Sender<bool>,
}

/// Per-connection task draining the transport into the inbound queue.
pub struct Reader<R> {
    peer: SocketAddr,
    stream: R,
    buffer: BytesMut,
    /// Leading bytes of `buffer` already searched for a terminator
    scanned: usize,
    inbound: mpsc::UnboundedSender<String>,
    alive: Arc<watch::Sender<bool>>,
    shutdown: watch::Receiver<bool>,
    max_line_length: usize,
}

impl Connection {
    /// Pair a transport with a fresh inbound queue.
    ///
    /// The returned reader must be driven (usually via `tokio::spawn`) for
    /// any inbound line to reach the connection.
    pub fn new<R, W>(
        peer: SocketAddr,
        read_half: R,
        write_half: W,
        max_line_length: usize,
    ) -> (Self, Reader<R>)
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let alive = Arc::new(watch::Sender::new(true));

        let connection = Self {
            peer,
            writer: Mutex::new(Box::new(write_half)),
            inbound: Mutex::new(rx),
            alive: Arc::clone(&alive),
            shutdown: shutdown_tx,
        };

        let reader = Reader {
            peer,
            stream: read_half,
            buffer: BytesMut::with_capacity(BUFFER_SIZE),
            scanned: 0,
            inbound: tx,
            alive,
            shutdown: shutdown_rx,
            max_line_length,
        };

        (connection, reader)
    }

    /// Remote endpoint of this connection.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Non-blocking liveness check.
    pub fn is_alive(&self) -> bool {
        *self.alive.borrow()
    }

    /// Resolve once the connection is dead, by local close or by the Reader
    /// stopping.
    pub async fn closed(&self) {
        let mut alive = self.alive.subscribe();
        let _ = alive.wait_for(|alive| !*alive).await;
    }

    /// Frame and write one line, returning once it is flushed to the transport.
    pub async fn send_line(&self, message: &str) -> Result<()> {
        self.write_frame(&framing::encode(message)).await
    }

    /// Write the bare heartbeat line the peer's Reader discards.
    pub async fn send_heartbeat(&self) -> Result<()> {
        self.write_frame(framing::HEARTBEAT_FRAME).await
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<()> {
        if !self.is_alive() {
            return Err(ConsoleError::ConnectionClosed);
        }

        let mut shutdown = self.shutdown.subscribe();
        let mut writer = self.writer.lock().await;

        // Re-check under the lock: close may have won the race.
        if !self.is_alive() {
            return Err(ConsoleError::ConnectionClosed);
        }

        let written = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => return Err(ConsoleError::ConnectionClosed),
            res = async {
                writer.write_all(frame).await?;
                writer.flush().await
            } => res,
        };

        match written {
            Ok(()) => {
                trace!(peer = %self.peer, len = frame.len(), "Line written");
                Ok(())
            }
            Err(e) => {
                debug!(peer = %self.peer, error = %e, "Write failed");
                self.signal_close();
                Err(ConsoleError::ConnectionClosed)
            }
        }
    }

    /// Wait for the next inbound line, optionally bounded by `timeout`.
    ///
    /// Lines that arrived before the connection closed are still returned;
    /// `Recv::Closed` is reported only once the queue is drained.
    pub async fn recv_line(&self, timeout: Option<Duration>) -> Recv {
        let mut inbound = self.inbound.lock().await;
        let mut shutdown = self.shutdown.subscribe();

        let next = async {
            tokio::select! {
                biased;
                line = inbound.recv() => line.map_or(Recv::Closed, Recv::Line),
                _ = shutdown_requested(&mut shutdown) => {
                    inbound.try_recv().map_or(Recv::Closed, Recv::Line)
                }
            }
        };

        match timeout {
            Some(wait) => tokio::time::timeout(wait, next)
                .await
                .unwrap_or(Recv::TimedOut),
            None => next.await,
        }
    }

    /// Mark the connection dead and wake the reader without touching the transport.
    ///
    /// Safe to call from `Drop`.
    pub fn signal_close(&self) {
        self.alive.send_replace(false);
        self.shutdown.send_replace(true);
    }

    /// Close the connection. Idempotent.
    ///
    /// Blocked `recv_line` and `send_line` calls return promptly; the write
    /// side of the transport is shut down so the peer sees end-of-stream.
    pub async fn close(&self) {
        let was_open = !self.shutdown.send_replace(true);
        self.alive.send_replace(false);

        if was_open {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                trace!(peer = %self.peer, error = %e, "Transport shutdown failed");
            }
            debug!(peer = %self.peer, "Connection closed");
        }
    }
}

impl<R: AsyncRead + Unpin> Reader<R> {
    /// Drain the transport until end-of-stream, error, or shutdown.
    ///
    /// Never fails: every outcome ends with the connection marked dead and
    /// the queue sender dropped.
    pub async fn run(mut self) -> ReaderExit {
        let exit = self.read_loop().await;
        self.alive.send_replace(false);
        trace!(peer = %self.peer, ?exit, "Reader stopped");
        exit
    }

    async fn read_loop(&mut self) -> ReaderExit {
        loop {
            // Deliver every complete frame already buffered
            loop {
                match framing::parse_from(&self.buffer, self.scanned, self.max_line_length) {
                    ParseResult::Heartbeat(consumed) => {
                        self.buffer.advance(consumed);
                        self.scanned = 0;
                        trace!(peer = %self.peer, "Heartbeat received");
                    }
                    ParseResult::Complete(line, consumed) => {
                        self.buffer.advance(consumed);
                        self.scanned = 0;
                        trace!(peer = %self.peer, %line, "Line received");
                        if self.inbound.send(line).is_err() {
                            // Connection handle is gone, nobody can read this
                            return ReaderExit::Shutdown;
                        }
                    }
                    ParseResult::Incomplete => {
                        self.scanned = self.buffer.len();
                        break;
                    }
                    ParseResult::Invalid(e) => {
                        warn!(peer = %self.peer, error = %e, "Malformed stream");
                        return ReaderExit::Failed;
                    }
                }
            }

            tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown) => return ReaderExit::Shutdown,
                res = self.stream.read_buf(&mut self.buffer) => match res {
                    Ok(0) => {
                        debug!(peer = %self.peer, "Connection closed by peer");
                        return ReaderExit::Eof;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(peer = %self.peer, error = %e, "Read failed");
                        return ReaderExit::Failed;
                    }
                },
            }
        }
    }
}

/// Resolve once `shutdown` carries `true` or its sender is gone.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closed| *closed).await;
}
