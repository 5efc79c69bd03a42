use std::sync::Arc;

use tokio::sync::watch;

/// Process-wide shutdown signal.
///
/// Fires at most once. Observers hold a `watch::Receiver<bool>` obtained from
/// [`Shutdown::subscribe`] and wait on it with [`wait`].
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fires the signal. Returns `true` only for the call that actually fired it.
    pub fn trigger(&self) -> bool {
        self.tx.send_if_modified(|fired| {
            if *fired {
                false
            } else {
                *fired = true;
                true
            }
        })
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves once shutdown has fired. A dropped sender counts as shutdown.
pub async fn wait(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|fired| *fired).await;
}

/// Resolves on Ctrl-C, or SIGTERM on unix. Returns the signal name.
pub async fn os_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return "interrupt";
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => "interrupt",
            _ = term.recv() => "terminated",
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "interrupt"
    }
}
