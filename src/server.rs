//! TCP server hosting one console per connected peer.
//!
//! `listen` binds and returns immediately; the accept loop and the periodic
//! cleaner run as background tasks. Each accepted connection gets a
//! [`Console`] whose reader task is spawned before the console is published
//! in the [`Registry`], and which removes itself again when the reader stops.

use crate::connection::{shutdown_requested, Connection};
use crate::console::Console;
use crate::error::{ConsoleError, Result};
use crate::framing::DEFAULT_MAX_LINE_LENGTH;
use crate::registry::Registry;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Tuning knobs for a [`Server`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen backlog passed to the kernel
    pub backlog: i32,
    /// Maximum number of simultaneously connected peers
    pub max_connections: usize,
    /// Interval between sweeps for dead consoles
    pub clean_interval: Duration,
    /// Longest accepted inbound line in bytes
    pub max_line_length: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            backlog: 5,
            max_connections: 10000,
            clean_interval: Duration::from_secs(5),
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

struct Running {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
}

/// Server instance
pub struct Server {
    config: ServerConfig,
    registry: Arc<Registry>,
    connection_limit: Arc<Semaphore>,
    running: Mutex<Option<Running>>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: ServerConfig) -> Self {
        let connection_limit = Arc::new(Semaphore::new(config.max_connections));
        Server {
            config,
            registry: Arc::new(Registry::new()),
            connection_limit,
            running: Mutex::new(None),
        }
    }

    /// Bind `address` and start accepting in the background.
    ///
    /// Returns the bound address, so `"127.0.0.1:0"` picks a free port.
    /// Calling it again while running only logs a warning and returns the
    /// existing address. Must be called from within a tokio runtime.
    pub fn listen(&self, address: &str) -> Result<SocketAddr> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = running.as_ref() {
            warn!(address = %current.local_addr, "Server is already running");
            return Ok(current.local_addr);
        }

        let addr = resolve(address)?;
        let listener = create_listener(addr, self.config.backlog)
            .and_then(TcpListener::from_std)
            .map_err(|e| ConsoleError::Bind(addr, e))?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "Server listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(clean_task(
            Arc::clone(&self.registry),
            self.config.clean_interval,
            shutdown_rx.clone(),
        ));
        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.registry),
            Arc::clone(&self.connection_limit),
            self.config.max_line_length,
            shutdown_rx,
        ));

        *running = Some(Running {
            local_addr,
            shutdown: shutdown_tx,
        });
        Ok(local_addr)
    }

    /// Snapshot of the keys of all live consoles.
    pub fn get_keys(&self) -> Vec<SocketAddr> {
        self.registry.keys()
    }

    /// Console for a live peer.
    ///
    /// A missing key is routine: the peer disconnected or never existed.
    pub fn get_console(&self, key: &SocketAddr) -> Result<Arc<Console>> {
        self.registry.get(key).ok_or(ConsoleError::NotFound(*key))
    }

    /// Close and drop every console that is no longer alive.
    pub async fn clean(&self) -> usize {
        sweep(&self.registry).await
    }

    /// Number of live consoles.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Address the server is bound to, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|r| r.local_addr)
    }

    /// Whether the accept loop is running.
    pub fn alive(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Stop accepting and close every console. Idempotent.
    pub async fn close(&self) {
        let stopped = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(running) = stopped {
            running.shutdown.send_replace(true);
        }

        for console in self.registry.drain() {
            console.close().await;
        }
        info!("Server closed");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let running = self
            .running
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(running) = running {
            running.shutdown.send_replace(true);
        }
        for console in self.registry.drain() {
            console.signal_close();
        }
    }
}

/// Accept connections until shutdown, isolating every per-peer failure.
async fn accept_loop(
    listener: TcpListener,
    registry: Arc<Registry>,
    connection_limit: Arc<Semaphore>,
    max_line_length: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        // Wait for a connection slot
        let permit = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break,
            permit = Arc::clone(&connection_limit).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let accepted = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                info!(peer = %addr, "New connection");
                register(stream, addr, &registry, max_line_length, permit);
            }
            Err(e) if is_fatal_accept_error(&e) => {
                error!(error = %e, "Listener failed, no longer accepting");
                break;
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    info!("Accept loop stopped");
}

/// Errors that mean the listening socket itself is unusable. Everything else
/// (descriptor or buffer exhaustion, aborted handshakes) is worth retrying.
fn is_fatal_accept_error(e: &std::io::Error) -> bool {
    #[cfg(unix)]
    {
        matches!(
            e.raw_os_error(),
            Some(libc::EBADF | libc::EINVAL | libc::ENOTSOCK | libc::EOPNOTSUPP)
        )
    }
    #[cfg(not(unix))]
    {
        let _ = e;
        false
    }
}

/// Wrap an accepted stream in a console, start its reader, then publish it.
fn register(
    stream: TcpStream,
    addr: SocketAddr,
    registry: &Arc<Registry>,
    max_line_length: usize,
    permit: OwnedSemaphorePermit,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = %addr, error = %e, "Failed to set TCP_NODELAY");
    }

    let (read_half, write_half) = stream.into_split();
    let (conn, reader) = Connection::new(addr, read_half, write_half, max_line_length);
    let console = Arc::new(Console::new(conn, Arc::downgrade(registry)));

    let reader_console = Arc::clone(&console);
    tokio::spawn(async move {
        let exit = reader.run().await;
        reader_console.close().await;
        info!(peer = %addr, ?exit, "Connection lost");
        drop(permit);
    });

    if !registry.insert(console) {
        debug!(peer = %addr, "Connection closed before registration");
    }
}

/// Background task that sweeps dead consoles out of the registry
async fn clean_task(registry: Arc<Registry>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break,
            _ = interval.tick() => {
                let count = sweep(&registry).await;
                if count > 0 {
                    debug!(count, "Cleaned up dead connections");
                }
            }
        }
    }
}

async fn sweep(registry: &Registry) -> usize {
    let evicted = registry.clean();
    for console in &evicted {
        info!(peer = %console.key(), "Connection removed");
        console.close().await;
    }
    evicted.len()
}

fn resolve(address: &str) -> Result<SocketAddr> {
    address
        .to_socket_addrs()
        .map_err(|_| ConsoleError::InvalidAddress(address.to_string()))?
        .next()
        .ok_or_else(|| ConsoleError::InvalidAddress(address.to_string()))
}

/// Create a non-blocking TCP listener with SO_REUSEADDR and the given backlog.
fn create_listener(addr: SocketAddr, backlog: i32) -> std::io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
