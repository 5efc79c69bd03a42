use std::sync::Arc;

use anyhow::Context;

use crate::tunnelfwd::{
    config,
    dialer::DialOptions,
    forward::{Forwarder, ForwarderOptions},
    lifecycle::{AcceptLoop, InFlight, LoopExit, TunnelCloser},
    logging,
    shutdown::{self, Shutdown},
    telemetry,
    tls::TlsPolicy,
    tunnel::{Tunnel, tcp::TcpTunnel},
};

pub async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let _logrt_guard = logging::init(&cfg.logging)?;

    let tls = cfg
        .tls
        .as_ref()
        .map(TlsPolicy::from_options)
        .transpose()
        .context("load local TLS settings")?;

    if let Some(addr) = cfg.metrics_addr {
        telemetry::init_prometheus(addr)?;
    }

    tracing::info!(
        upstream = %cfg.upstream,
        tls = tls.is_some(),
        listen_addr = %cfg.tunnel.listen_addr,
        on_dial_error = ?cfg.on_dial_error,
        "tunnelfwd: starting"
    );

    let tunnel: Arc<dyn Tunnel> = Arc::new(
        TcpTunnel::bind(&cfg.tunnel.listen_addr, cfg.tunnel.public_url.clone())
            .await
            .context("failed to initialize tunnel")?,
    );
    println!("your url is: {}", tunnel.url());

    let closer = Arc::new(TunnelCloser::new(tunnel.clone()));
    let shutdown = Shutdown::new();

    // Signal path: fire shutdown once, then close the tunnel so a pending accept returns.
    let signals = tokio::spawn({
        let shutdown = shutdown.clone();
        let closer = closer.clone();
        async move {
            loop {
                let sig = shutdown::os_signal().await;
                if shutdown.trigger() {
                    println!("{sig} received, exiting...");
                    tracing::info!(signal = sig, "shutdown: signal");
                    closer.close().await;
                } else {
                    tracing::info!(signal = sig, "shutdown: already in progress");
                }
            }
        }
    });

    let forwarder = Arc::new(Forwarder::new(ForwarderOptions {
        upstream: cfg.upstream.clone(),
        tls,
        dial: DialOptions {
            timeout: cfg.dial_timeout,
        },
        buffer_size: cfg.buffer_size,
        on_dial_error: cfg.on_dial_error,
    }));

    let mut accept = AcceptLoop::new(tunnel.clone(), forwarder, shutdown.clone());
    let mut in_flight = InFlight::new();
    let res = accept.run(&mut in_flight).await;

    // Abort dials still pending; established relays are left to finish.
    shutdown.trigger();
    closer.close().await;
    in_flight.drain(cfg.drain_timeout).await;
    signals.abort();

    tracing::info!("tunnelfwd: stopped");

    match res {
        Ok(LoopExit::Shutdown) => Ok(()),
        Ok(LoopExit::TunnelLost) => anyhow::bail!("tunnel closed unexpectedly"),
        Err(err) => Err(err.into()),
    }
}
