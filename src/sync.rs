//! Cross-process stop signal between the client and server roles.
//!
//! Two transports share one contract: `signal()` is idempotent and is never
//! lost even if it lands before the waiter starts, and `wait_for_signal`
//! polls at a fixed interval so it can also notice that the supervised
//! process died or that the run was interrupted.

use crate::config::{SyncConfig, SyncStrategy};
use crate::signals::Shutdown;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

/// How a wait on the channel ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A stop signal was observed.
    Signaled,
    /// The liveness check reported the supervised process gone first.
    Aborted,
    /// The run is shutting down.
    Cancelled,
}

#[derive(Debug)]
pub enum ChannelError {
    /// The transport cannot be used; the current iteration must be abandoned.
    Unavailable {
        transport: String,
        source: std::io::Error,
    },
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::Unavailable { transport, source } => {
                write!(f, "sync channel {transport} unavailable: {source}")
            }
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChannelError::Unavailable { source, .. } => Some(source),
        }
    }
}

/// Presence of a file is the signal.
#[derive(Debug)]
pub struct FileMarker {
    path: PathBuf,
    /// The owning side removes the marker when dropped.
    owned: bool,
}

impl FileMarker {
    pub fn new(path: impl Into<PathBuf>, owned: bool) -> Self {
        Self {
            path: path.into(),
            owned,
        }
    }

    fn unavailable(&self, source: std::io::Error) -> ChannelError {
        ChannelError::Unavailable {
            transport: format!("marker {}", self.path.display()),
            source,
        }
    }

    pub fn signal(&self) -> Result<(), ChannelError> {
        std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.path)
            .map(|_| ())
            .map_err(|e| self.unavailable(e))
    }

    pub fn is_set(&self) -> Result<bool, ChannelError> {
        self.path.try_exists().map_err(|e| self.unavailable(e))
    }

    /// Remove the marker. Already absent is fine.
    pub fn clear(&self) -> Result<(), ChannelError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "removed stop marker");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.unavailable(e)),
        }
    }
}

impl Drop for FileMarker {
    fn drop(&mut self) {
        if self.owned {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// A connection to a fixed port is the signal.
#[derive(Debug)]
pub struct SocketSignal {
    addr: String,
    listener: Option<TcpListener>,
    connect_attempts: u32,
    retry_delay: Duration,
}

impl SocketSignal {
    /// Bind the listening side. Must happen before any client signals.
    pub fn listen(host: &str, port: u16) -> Result<Self, ChannelError> {
        let addr = format!("{host}:{port}");
        let listener = bind_listener(&addr).map_err(|e| ChannelError::Unavailable {
            transport: format!("socket {addr}"),
            source: e,
        })?;
        tracing::info!(addr = %addr, "stop-signal listener bound");
        Ok(Self {
            addr,
            listener: Some(listener),
            connect_attempts: 1,
            retry_delay: Duration::ZERO,
        })
    }

    /// Connecting side only; `wait_for_signal` is unavailable.
    pub fn connector(host: &str, port: u16, connect_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            addr: format!("{host}:{port}"),
            listener: None,
            connect_attempts: connect_attempts.max(1),
            retry_delay,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    fn unavailable(&self, source: std::io::Error) -> ChannelError {
        ChannelError::Unavailable {
            transport: format!("socket {}", self.addr),
            source,
        }
    }

    pub async fn signal(&self) -> Result<(), ChannelError> {
        let mut last_err = None;
        for attempt in 1..=self.connect_attempts {
            match TcpStream::connect(&self.addr).await {
                Ok(stream) => {
                    drop(stream);
                    tracing::debug!(addr = %self.addr, attempt, "stop signal sent");
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!(addr = %self.addr, attempt, error = %e, "stop signal connect failed");
                    last_err = Some(e);
                    if attempt < self.connect_attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }
        Err(self.unavailable(last_err.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "no connect attempts made")
        })))
    }

    /// Drop connections queued by an earlier iteration.
    async fn drain(&self) {
        let Some(listener) = &self.listener else {
            return;
        };
        while let Ok(Ok((_, peer))) = tokio::time::timeout(Duration::ZERO, listener.accept()).await {
            tracing::debug!(%peer, "discarded stale stop signal");
        }
    }
}

/// Bind with SO_REUSEADDR so back-to-back runs don't trip over TIME_WAIT.
fn bind_listener(addr: &str) -> std::io::Result<TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};

    let sock_addr: SocketAddr = std::net::ToSocketAddrs::to_socket_addrs(addr)?
        .next()
        .ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("no address for {addr}"))
        })?;
    let socket = Socket::new(Domain::for_address(sock_addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&sock_addr.into())?;
    socket.listen(16)?;
    TcpListener::from_std(socket.into())
}

/// The configured stop-signal transport.
#[derive(Debug)]
pub enum SyncChannel {
    File(FileMarker),
    Socket(SocketSignal),
}

impl SyncChannel {
    /// Waiting side. Owns the marker or binds the listener.
    pub fn for_server(config: &SyncConfig) -> Result<Self, ChannelError> {
        match config.strategy {
            SyncStrategy::File => Ok(SyncChannel::File(FileMarker::new(&config.marker, true))),
            SyncStrategy::Socket => Ok(SyncChannel::Socket(SocketSignal::listen(
                &config.host,
                config.port,
            )?)),
        }
    }

    /// Signalling side.
    pub fn for_client(config: &SyncConfig) -> Self {
        match config.strategy {
            SyncStrategy::File => SyncChannel::File(FileMarker::new(&config.marker, false)),
            SyncStrategy::Socket => SyncChannel::Socket(SocketSignal::connector(
                &config.host,
                config.port,
                config.connect_attempts,
                config.poll_interval(),
            )),
        }
    }

    pub async fn signal(&self) -> Result<(), ChannelError> {
        match self {
            SyncChannel::File(marker) => marker.signal(),
            SyncChannel::Socket(socket) => socket.signal().await,
        }
    }

    /// Clear any signal left over from a previous iteration.
    pub async fn reset(&self) -> Result<(), ChannelError> {
        match self {
            SyncChannel::File(marker) => marker.clear(),
            SyncChannel::Socket(socket) => {
                socket.drain().await;
                Ok(())
            }
        }
    }

    /// Block until signalled, the process behind `alive` dies, or shutdown.
    pub async fn wait_for_signal<F>(
        &self,
        poll_interval: Duration,
        mut alive: F,
        shutdown: &Shutdown,
    ) -> Result<WaitOutcome, ChannelError>
    where
        F: FnMut() -> bool,
    {
        match self {
            SyncChannel::File(marker) => loop {
                if marker.is_set()? {
                    return Ok(WaitOutcome::Signaled);
                }
                if !alive() {
                    return Ok(WaitOutcome::Aborted);
                }
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown.cancelled() => return Ok(WaitOutcome::Cancelled),
                }
            },
            SyncChannel::Socket(socket) => {
                let Some(listener) = &socket.listener else {
                    return Err(socket.unavailable(std::io::Error::new(
                        std::io::ErrorKind::NotConnected,
                        "no listener bound on this side",
                    )));
                };
                loop {
                    tokio::select! {
                        res = listener.accept() => {
                            let (_, peer) = res.map_err(|e| socket.unavailable(e))?;
                            tracing::debug!(%peer, "stop signal accepted");
                            return Ok(WaitOutcome::Signaled);
                        }
                        _ = tokio::time::sleep(poll_interval) => {
                            if !alive() {
                                return Ok(WaitOutcome::Aborted);
                            }
                        }
                        _ = shutdown.cancelled() => return Ok(WaitOutcome::Cancelled),
                    }
                }
            }
        }
    }
}
