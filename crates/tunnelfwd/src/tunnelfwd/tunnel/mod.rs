use async_trait::async_trait;
use thiserror::Error;

pub mod tcp;

/// A bidirectional async byte stream.
///
/// Trait objects can only have a single non-auto "principal" trait, so
/// `AsyncRead + AsyncWrite` is wrapped into one.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

#[derive(Debug, Error)]
pub enum TunnelError {
    /// The handle was closed, locally or by the remote relay.
    #[error("tunnel closed")]
    Closed,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

impl TunnelError {
    #[allow(dead_code)]
    pub fn is_closed(&self) -> bool {
        matches!(self, TunnelError::Closed)
    }
}

/// One tunneled client session.
pub struct Downstream {
    pub stream: BoxedStream,
    /// Where the session came from, for logs. Free-form.
    pub origin: String,
}

impl Downstream {
    pub fn new<S>(stream: S, origin: impl Into<String>) -> Self
    where
        S: AsyncStream + Unpin + Send + 'static,
    {
        Self {
            stream: Box::new(stream),
            origin: origin.into(),
        }
    }
}

impl std::fmt::Debug for Downstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downstream")
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

/// The established tunnel as seen by the forwarding engine.
///
/// How the tunnel was negotiated with the remote relay is up to the
/// implementation. `accept` must return [`TunnelError::Closed`] once the
/// handle is closed, and must be cancel-safe.
#[async_trait]
pub trait Tunnel: Send + Sync {
    async fn accept(&self) -> Result<Downstream, TunnelError>;
    /// Closing an already closed handle returns [`TunnelError::Closed`].
    async fn close(&self) -> Result<(), TunnelError>;
    fn url(&self) -> String;
}
