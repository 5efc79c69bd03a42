use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{
    sync::watch,
    task::{JoinError, JoinSet},
};

use crate::tunnelfwd::{
    forward::{ForwardError, ForwardSummary, Forwarder},
    shutdown::{self, Shutdown},
    tunnel::{Tunnel, TunnelError},
};

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(100);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(2);

/// Closes the tunnel at most once, whichever path gets there first.
pub struct TunnelCloser {
    tunnel: Arc<dyn Tunnel>,
    closed: AtomicBool,
}

impl TunnelCloser {
    pub fn new(tunnel: Arc<dyn Tunnel>) -> Self {
        Self {
            tunnel,
            closed: AtomicBool::new(false),
        }
    }

    /// Returns `true` if this call performed the close. Later calls are no-ops.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        match self.tunnel.close().await {
            Ok(()) => {}
            // Closed underneath us by the collaborator.
            Err(TunnelError::Closed) => {}
            Err(err) => tracing::warn!(err = %err, "lifecycle: closing tunnel failed"),
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Draining,
    Stopped,
}

/// Why the accept loop stopped.
#[derive(Debug)]
pub enum LoopExit {
    /// Shutdown was requested.
    Shutdown,
    /// The tunnel closed without a shutdown request (e.g. the relay dropped it).
    TunnelLost,
}

type ForwardResult = Result<ForwardSummary, ForwardError>;

/// Forwarders that were dispatched and may still be running.
pub struct InFlight {
    tasks: JoinSet<ForwardResult>,
}

impl InFlight {
    pub fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
        }
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    async fn join_next(&mut self) -> Option<Result<ForwardResult, JoinError>> {
        self.tasks.join_next().await
    }

    /// Waits for in-flight forwarders, aborting whatever is left after `timeout`.
    /// A zero timeout waits indefinitely.
    pub async fn drain(&mut self, timeout: Duration) {
        if self.tasks.is_empty() {
            return;
        }
        tracing::info!(in_flight = self.tasks.len(), "lifecycle: draining connections");

        let drain = async {
            while let Some(res) = self.tasks.join_next().await {
                // Teardown: only panics are worth a line.
                if let Err(err) = res {
                    if err.is_panic() {
                        tracing::warn!(err = %err, "lifecycle: forwarder panicked");
                    }
                }
            }
        };

        if timeout == Duration::from_millis(0) {
            drain.await;
            return;
        }
        if tokio::time::timeout(timeout, drain).await.is_err() {
            tracing::warn!(
                remaining = self.tasks.len(),
                timeout = %humantime::format_duration(timeout),
                "lifecycle: drain timed out; aborting connections"
            );
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }
    }
}

impl Default for InFlight {
    fn default() -> Self {
        Self::new()
    }
}

/// Accepts tunneled connections and dispatches each to its own forwarder task.
pub struct AcceptLoop {
    tunnel: Arc<dyn Tunnel>,
    forwarder: Arc<Forwarder>,
    shutdown: Shutdown,
    state: LoopState,
}

impl AcceptLoop {
    pub fn new(tunnel: Arc<dyn Tunnel>, forwarder: Arc<Forwarder>, shutdown: Shutdown) -> Self {
        Self {
            tunnel,
            forwarder,
            shutdown,
            state: LoopState::Running,
        }
    }

    #[allow(dead_code)]
    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Runs until shutdown, tunnel loss, or a fatal forward error.
    ///
    /// Dispatched forwarders are left in `in_flight`; the caller decides how
    /// long to wait for them.
    pub async fn run(&mut self, in_flight: &mut InFlight) -> Result<LoopExit, ForwardError> {
        if self.state != LoopState::Running {
            return Ok(LoopExit::Shutdown);
        }

        tracing::info!(url = %self.tunnel.url(), upstream = %self.forwarder.upstream(), "lifecycle: running");

        let res = self.accept_until_exit(in_flight).await;

        self.transition(LoopState::Draining);
        match &res {
            Ok(LoopExit::Shutdown) => tracing::info!("lifecycle: shutdown requested; stopped accepting"),
            Ok(LoopExit::TunnelLost) => tracing::error!("lifecycle: tunnel closed unexpectedly"),
            Err(err) => tracing::error!(err = %err, "lifecycle: fatal forward error"),
        }
        self.transition(LoopState::Stopped);
        res
    }

    async fn accept_until_exit(&self, in_flight: &mut InFlight) -> Result<LoopExit, ForwardError> {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut backoff = ACCEPT_BACKOFF_MIN;

        loop {
            if self.shutdown.is_triggered() {
                return Ok(LoopExit::Shutdown);
            }

            tokio::select! {
                _ = shutdown::wait(&mut shutdown_rx) => return Ok(LoopExit::Shutdown),
                Some(res) = in_flight.join_next(), if !in_flight.is_empty() => {
                    reap(res)?;
                }
                res = self.tunnel.accept() => match res {
                    Ok(down) => {
                        backoff = ACCEPT_BACKOFF_MIN;
                        tracing::debug!(origin = %down.origin, "lifecycle: accepted");
                        let fwd = self.forwarder.clone();
                        let rx = self.shutdown.subscribe();
                        in_flight.tasks.spawn(async move { fwd.forward(down, rx).await });
                    }
                    Err(TunnelError::Closed) => {
                        if self.shutdown.is_triggered() {
                            return Ok(LoopExit::Shutdown);
                        }
                        return Ok(LoopExit::TunnelLost);
                    }
                    Err(err) => {
                        tracing::warn!(
                            err = %err,
                            backoff = %humantime::format_duration(backoff),
                            "lifecycle: failed to accept connection; retrying"
                        );
                        if let Some(exit) = pause(backoff, in_flight, &mut shutdown_rx).await? {
                            return Ok(exit);
                        }
                        backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                    }
                }
            }
        }
    }

    fn transition(&mut self, next: LoopState) {
        if self.state == next {
            return;
        }
        tracing::debug!(from = ?self.state, to = ?next, "lifecycle: state");
        self.state = next;
    }
}

/// Sleeps for `delay`, still reaping forwarders that finish meanwhile.
/// Returns early on shutdown or on a fatal forward error.
async fn pause(
    delay: Duration,
    in_flight: &mut InFlight,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<Option<LoopExit>, ForwardError> {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = shutdown::wait(shutdown_rx) => return Ok(Some(LoopExit::Shutdown)),
            Some(res) = in_flight.join_next(), if !in_flight.is_empty() => reap(res)?,
            _ = &mut sleep => return Ok(None),
        }
    }
}

fn reap(res: Result<ForwardResult, JoinError>) -> Result<(), ForwardError> {
    match res {
        Ok(Ok(_summary)) => Ok(()),
        Ok(Err(err)) => Err(err),
        Err(err) => {
            if err.is_panic() {
                tracing::warn!(err = %err, "lifecycle: forwarder panicked");
            }
            Ok(())
        }
    }
}
