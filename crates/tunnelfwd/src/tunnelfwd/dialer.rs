use std::time::Duration;

use socket2::SockRef;
use thiserror::Error;
use tokio::{net::TcpStream, sync::watch};

use crate::tunnelfwd::{
    net::UpstreamAddress, shutdown, tls::TlsPolicy, tunnel::BoxedStream,
};

#[derive(Debug, Error)]
pub enum DialError {
    /// Shutdown fired while dialing. Expected; not a failure.
    #[error("dial cancelled")]
    Cancelled,
    #[error("connect {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("dial {addr}: timed out after {}", humantime::format_duration(*.after))]
    Timeout { addr: String, after: Duration },
    #[error("tls handshake with {addr}: {source}")]
    Tls {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

impl DialError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DialError::Cancelled)
    }
}

#[derive(Debug, Clone)]
pub struct DialOptions {
    /// Bounds connect plus TLS handshake. Zero disables the bound.
    pub timeout: Duration,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
        }
    }
}

/// Opens a connection to the local service, wrapped in TLS when `tls` is set.
///
/// Aborts with [`DialError::Cancelled`] as soon as shutdown fires; the pending
/// socket is dropped with the connect future.
pub async fn dial(
    addr: &UpstreamAddress,
    tls: Option<&TlsPolicy>,
    opts: &DialOptions,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<BoxedStream, DialError> {
    if *shutdown.borrow() {
        return Err(DialError::Cancelled);
    }

    let attempt = async {
        if opts.timeout > Duration::from_millis(0) {
            tokio::time::timeout(opts.timeout, connect(addr, tls))
                .await
                .map_err(|_| DialError::Timeout {
                    addr: addr.to_string(),
                    after: opts.timeout,
                })?
        } else {
            connect(addr, tls).await
        }
    };

    tokio::select! {
        _ = shutdown::wait(shutdown) => Err(DialError::Cancelled),
        res = attempt => res,
    }
}

async fn connect(addr: &UpstreamAddress, tls: Option<&TlsPolicy>) -> Result<BoxedStream, DialError> {
    let tcp = TcpStream::connect((addr.host(), addr.port()))
        .await
        .map_err(|source| DialError::Connect {
            addr: addr.to_string(),
            source,
        })?;

    if let Err(err) = SockRef::from(&tcp).set_keepalive(true) {
        tracing::debug!(upstream = %addr, err = %err, "dial: enable keepalive failed");
    }

    let Some(tls) = tls else {
        return Ok(Box::new(tcp));
    };

    let st = tls
        .connector()
        .connect(tls.server_name().clone(), tcp)
        .await
        .map_err(|source| DialError::Tls {
            addr: addr.to_string(),
            source,
        })?;
    Ok(Box::new(st))
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;
    use crate::tunnelfwd::{
        shutdown::Shutdown,
        tls::{TlsOptions, testutil},
    };

    async fn closed_port() -> UpstreamAddress {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = ln.local_addr().unwrap().port();
        drop(ln);
        UpstreamAddress::new("127.0.0.1", port)
    }

    #[tokio::test]
    async fn plain_dial_enables_keepalive() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = UpstreamAddress::new("127.0.0.1", ln.local_addr().unwrap().port());
        let server = tokio::spawn(async move {
            let (mut s, _) = ln.accept().await.unwrap();
            let mut buf = [0u8; 5];
            s.read_exact(&mut buf).await.unwrap();
            buf
        });

        let s = Shutdown::new();
        let mut up = dial(&addr, None, &DialOptions::default(), &mut s.subscribe())
            .await
            .unwrap();
        up.write_all(b"hello").await.unwrap();
        assert_eq!(&server.await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn refused_connect_is_a_connect_error() {
        let addr = closed_port().await;
        let s = Shutdown::new();
        let err = dial(&addr, None, &DialOptions::default(), &mut s.subscribe())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DialError::Connect { .. }), "got {err:?}");
        assert!(!err.is_cancelled());
    }

    #[tokio::test]
    async fn already_fired_shutdown_cancels_without_dialing() {
        let addr = closed_port().await;
        let s = Shutdown::new();
        s.trigger();
        let err = dial(&addr, None, &DialOptions::default(), &mut s.subscribe())
            .await
            .err()
            .unwrap();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn shutdown_aborts_hanging_handshake() {
        // Accepts TCP but never answers the TLS ClientHello.
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = UpstreamAddress::new("127.0.0.1", ln.local_addr().unwrap().port());
        let _server = tokio::spawn(async move {
            let (s, _) = ln.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(s);
        });

        let policy = TlsPolicy::from_options(&TlsOptions {
            server_name: "localhost".into(),
            allow_invalid_cert: true,
            ..Default::default()
        })
        .unwrap();

        let s = Shutdown::new();
        let mut rx = s.subscribe();
        let opts = DialOptions {
            timeout: Duration::from_secs(30),
        };
        let trigger = s.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.trigger();
        });

        let started = Instant::now();
        let err = dial(&addr, Some(&policy), &opts, &mut rx).await.err().unwrap();
        assert!(err.is_cancelled(), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn hanging_handshake_times_out() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = UpstreamAddress::new("127.0.0.1", ln.local_addr().unwrap().port());
        let _server = tokio::spawn(async move {
            let (s, _) = ln.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(s);
        });

        let policy = TlsPolicy::from_options(&TlsOptions {
            server_name: "localhost".into(),
            allow_invalid_cert: true,
            ..Default::default()
        })
        .unwrap();

        let s = Shutdown::new();
        let opts = DialOptions {
            timeout: Duration::from_millis(100),
        };
        let err = dial(&addr, Some(&policy), &opts, &mut s.subscribe())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DialError::Timeout { .. }), "got {err:?}");
    }

    async fn tls_echo_upstream(ss: &testutil::SelfSigned) -> UpstreamAddress {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = UpstreamAddress::new("127.0.0.1", ln.local_addr().unwrap().port());
        let acceptor = testutil::acceptor(ss);
        tokio::spawn(async move {
            let (s, _) = ln.accept().await.unwrap();
            let Ok(mut st) = acceptor.accept(s).await else {
                return;
            };
            let mut buf = [0u8; 4];
            if st.read_exact(&mut buf).await.is_ok() {
                let _ = st.write_all(&buf).await;
                let _ = st.flush().await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn self_signed_upstream_with_allow_invalid_cert() {
        let ss = testutil::self_signed("localhost");
        let addr = tls_echo_upstream(&ss).await;

        let policy = TlsPolicy::from_options(&TlsOptions {
            server_name: "localhost".into(),
            allow_invalid_cert: true,
            ..Default::default()
        })
        .unwrap();

        let s = Shutdown::new();
        let mut up = dial(&addr, Some(&policy), &DialOptions::default(), &mut s.subscribe())
            .await
            .unwrap();
        up.write_all(b"ping").await.unwrap();
        up.flush().await.unwrap();
        let mut buf = [0u8; 4];
        up.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn self_signed_upstream_is_rejected_by_default() {
        let ss = testutil::self_signed("localhost");
        let addr = tls_echo_upstream(&ss).await;

        let policy = TlsPolicy::from_options(&TlsOptions {
            server_name: "localhost".into(),
            ..Default::default()
        })
        .unwrap();

        let s = Shutdown::new();
        let err = dial(&addr, Some(&policy), &DialOptions::default(), &mut s.subscribe())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DialError::Tls { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn self_signed_upstream_trusted_via_ca_file() {
        let ss = testutil::self_signed("localhost");
        let addr = tls_echo_upstream(&ss).await;

        let dir = testutil::temp_dir("dial_ca");
        let ca = dir.join("ca.pem");
        std::fs::write(&ca, &ss.cert_pem).unwrap();

        let policy = TlsPolicy::from_options(&TlsOptions {
            server_name: "localhost".into(),
            ca_file: Some(ca),
            ..Default::default()
        })
        .unwrap();

        let s = Shutdown::new();
        dial(&addr, Some(&policy), &DialOptions::default(), &mut s.subscribe())
            .await
            .unwrap();

        let _ = std::fs::remove_dir_all(&dir);
    }
}
