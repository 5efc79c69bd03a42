use std::net::SocketAddr;

use anyhow::Context;
use async_trait::async_trait;
use tokio::{net::TcpListener, sync::watch};

use crate::tunnelfwd::{
    net,
    tunnel::{Downstream, Tunnel, TunnelError},
};

/// Tunnel endpoint that receives tunneled sessions as plain TCP connections.
///
/// A relay agent connects here once per client session. The public URL is
/// whatever the relay advertises; without one, the local endpoint is reported.
pub struct TcpTunnel {
    ln: TcpListener,
    url: String,
    closed: watch::Sender<bool>,
}

impl TcpTunnel {
    pub async fn bind(addr: &str, public_url: Option<String>) -> anyhow::Result<Self> {
        let bind_addr = net::normalize_bind_addr(addr);
        let ln = TcpListener::bind(&*bind_addr)
            .await
            .with_context(|| format!("tunnel: bind {addr}"))?;
        let local = ln.local_addr().context("tunnel: local_addr")?;
        let url = public_url
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| format!("tcp://{local}"));

        tracing::info!(listen_addr = %local, url = %url, "tunnel: listening");

        let (closed, _) = watch::channel(false);
        Ok(Self { ln, url, closed })
    }

    #[allow(dead_code)]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.ln.local_addr().ok()
    }
}

#[async_trait]
impl Tunnel for TcpTunnel {
    async fn accept(&self) -> Result<Downstream, TunnelError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(TunnelError::Closed);
        }
        tokio::select! {
            // The only transition is false -> true.
            _ = closed.changed() => Err(TunnelError::Closed),
            res = self.ln.accept() => {
                let (c, peer) = res?;
                Ok(Downstream::new(c, peer.to_string()))
            }
        }
    }

    async fn close(&self) -> Result<(), TunnelError> {
        if self.closed.send_replace(true) {
            return Err(TunnelError::Closed);
        }
        tracing::debug!(url = %self.url, "tunnel: closed");
        Ok(())
    }

    fn url(&self) -> String {
        self.url.clone()
    }
}
