//! Listening-port checks for the measured server.

use crate::signals::Shutdown;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

const PROBE_INTERVAL: Duration = Duration::from_millis(200);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Whether some process already listens on `port`.
///
/// Binds with SO_REUSEADDR so sockets lingering in TIME_WAIT from the previous
/// iteration don't count; only a live listener makes the bind fail.
pub fn port_in_use(port: u16) -> bool {
    use socket2::{Domain, Protocol, Socket, Type};

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let result = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).and_then(|socket| {
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1)
    });

    match result {
        Ok(()) => false,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => true,
        Err(e) => {
            tracing::warn!(port, error = %e, "port check failed, assuming free");
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    TimedOut,
    Cancelled,
}

/// Probe `host:port` with TCP connects until one succeeds or `timeout` passes.
pub async fn wait_until_ready(
    host: &str,
    port: u16,
    timeout: Duration,
    shutdown: &Shutdown,
) -> Readiness {
    let addr = format!("{host}:{port}");
    let deadline = Instant::now() + timeout;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(_)) => {
                tracing::debug!(addr = %addr, attempts, "server is accepting connections");
                return Readiness::Ready;
            }
            Ok(Err(e)) => tracing::trace!(addr = %addr, error = %e, "readiness probe refused"),
            Err(_) => tracing::trace!(addr = %addr, "readiness probe timed out"),
        }

        if Instant::now() >= deadline {
            return Readiness::TimedOut;
        }
        tokio::select! {
            _ = tokio::time::sleep(PROBE_INTERVAL) => {}
            _ = shutdown.cancelled() => return Readiness::Cancelled,
        }
    }
}
