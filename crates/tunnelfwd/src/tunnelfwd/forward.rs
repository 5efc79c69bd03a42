use std::str::FromStr;

use thiserror::Error;
use tokio::{io::AsyncWriteExt, sync::watch};

use crate::tunnelfwd::{
    dialer::{self, DialError, DialOptions},
    net::UpstreamAddress,
    relay::{self, RelayReport},
    telemetry,
    tls::TlsPolicy,
    tunnel::Downstream,
};

/// What to do when the local service cannot be dialed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DialErrorPolicy {
    /// Close this downstream connection and keep serving others.
    #[default]
    Drop,
    /// Treat the failure as fatal to the whole process.
    Abort,
}

impl FromStr for DialErrorPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "drop" => Ok(DialErrorPolicy::Drop),
            "abort" => Ok(DialErrorPolicy::Abort),
            other => Err(format!("unknown dial error policy {other:?} (expected drop|abort)")),
        }
    }
}

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("failed to connect to upstream service: {0}")]
    Dial(#[from] DialError),
}

#[derive(Debug)]
pub enum ForwardSummary {
    Relayed(RelayReport),
    /// Dial failed and the connection was dropped.
    Dropped,
    /// Shutdown fired before the upstream was reached.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ForwarderOptions {
    pub upstream: UpstreamAddress,
    pub tls: Option<TlsPolicy>,
    pub dial: DialOptions,
    pub buffer_size: usize,
    pub on_dial_error: DialErrorPolicy,
}

/// Forwards accepted downstream connections to the local service.
#[derive(Debug)]
pub struct Forwarder {
    opts: ForwarderOptions,
}

impl Forwarder {
    pub fn new(opts: ForwarderOptions) -> Self {
        Self { opts }
    }

    pub fn upstream(&self) -> &UpstreamAddress {
        &self.opts.upstream
    }

    /// Dials upstream and relays until either side closes.
    ///
    /// The downstream connection is closed on every path. Only a dial failure
    /// under [`DialErrorPolicy::Abort`] is returned as an error.
    pub async fn forward(
        &self,
        down: Downstream,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<ForwardSummary, ForwardError> {
        let _active = telemetry::ActiveConnGuard::new();
        let cid = telemetry::new_conn_id();
        let Downstream { mut stream, origin } = down;

        tracing::info!(cid = %cid, origin = %origin, upstream = %self.opts.upstream, "forward: new connection");

        let up = match dialer::dial(
            &self.opts.upstream,
            self.opts.tls.as_ref(),
            &self.opts.dial,
            &mut shutdown,
        )
        .await
        {
            Ok(up) => up,
            Err(err) if err.is_cancelled() => {
                tracing::debug!(cid = %cid, "forward: dial cancelled by shutdown");
                let _ = stream.shutdown().await;
                return Ok(ForwardSummary::Cancelled);
            }
            Err(err) => {
                telemetry::record_dial_failure();
                let _ = stream.shutdown().await;
                drop(stream);
                return match self.opts.on_dial_error {
                    DialErrorPolicy::Drop => {
                        tracing::warn!(cid = %cid, origin = %origin, err = %err, "forward: upstream dial failed; dropping connection");
                        Ok(ForwardSummary::Dropped)
                    }
                    DialErrorPolicy::Abort => {
                        tracing::error!(cid = %cid, origin = %origin, err = %err, "forward: upstream dial failed");
                        Err(ForwardError::Dial(err))
                    }
                };
            }
        };

        let report = relay::relay(stream, up, self.opts.buffer_size).await;
        telemetry::record_relay_bytes(report.a_to_b, report.b_to_a);

        tracing::debug!(
            cid = %cid,
            to_upstream = report.a_to_b,
            to_downstream = report.b_to_a,
            finished_first = %report.finished_first,
            "forward: connection closed"
        );

        Ok(ForwardSummary::Relayed(report))
    }
}
