/// Signal handling for graceful shutdown.
///
/// SIGINT (Ctrl-C) and SIGTERM flip a shared shutdown flag. Loops and the
/// supervisor hold a `Shutdown` token and check it at every wait, so an
/// interrupt unwinds through the normal cleanup paths instead of exiting
/// from inside a handler.
use tokio::sync::watch;

/// Cloneable view of the shutdown flag.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

/// Owner side of the shutdown flag.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> (ShutdownTrigger, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (ShutdownTrigger { tx }, Shutdown { rx })
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been requested. Never resolves if the
    /// trigger is dropped without firing.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let closed = rx.wait_for(|v| *v).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

pub struct SignalHandler {
    task: tokio::task::JoinHandle<()>,
}

impl SignalHandler {
    /// Spawn the listener task and return the token it controls.
    pub fn install() -> std::io::Result<(SignalHandler, Shutdown)> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let (trigger, shutdown) = Shutdown::new();

        let task = tokio::spawn(async move {
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    if let Err(e) = res {
                        tracing::error!(error = %e, "failed to listen for Ctrl-C");
                        return;
                    }
                    tracing::info!("received SIGINT, shutting down");
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down");
                }
            }
            trigger.trigger();
        });

        Ok((SignalHandler { task }, shutdown))
    }
}

impl Drop for SignalHandler {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_starts_clear() {
        let (_trigger, shutdown) = Shutdown::new();
        assert!(!shutdown.is_cancelled());
        let res = tokio::time::timeout(Duration::from_millis(50), shutdown.cancelled()).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_trigger_visible_to_clones() {
        let (trigger, shutdown) = Shutdown::new();
        let clone = shutdown.clone();
        trigger.trigger();
        assert!(shutdown.is_cancelled());
        assert!(clone.is_cancelled());
        tokio::time::timeout(Duration::from_millis(100), clone.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_wakes_pending_waiter() {
        let (trigger, shutdown) = Shutdown::new();
        let waiter = tokio::spawn(async move { shutdown.cancelled().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_dropped_trigger_never_cancels() {
        let (trigger, shutdown) = Shutdown::new();
        drop(trigger);
        let res = tokio::time::timeout(Duration::from_millis(50), shutdown.cancelled()).await;
        assert!(res.is_err());
        assert!(!shutdown.is_cancelled());
    }
}
