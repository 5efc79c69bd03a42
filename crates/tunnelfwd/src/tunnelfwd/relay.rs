use std::{future::Future, io, pin::Pin, time::Duration};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Bytes read from `a`, written to `b`.
    AToB,
    /// Bytes read from `b`, written to `a`.
    BToA,
}

impl Direction {
    fn other(self) -> Self {
        match self {
            Direction::AToB => Direction::BToA,
            Direction::BToA => Direction::AToB,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::AToB => write!(f, "a->b"),
            Direction::BToA => write!(f, "b->a"),
        }
    }
}

/// How one copy direction ended.
#[derive(Debug)]
pub enum Outcome {
    /// Source hit EOF and everything read was written.
    Eof,
    Failed(io::Error),
    /// Dropped unfinished during teardown.
    Cancelled,
}

impl Outcome {
    pub fn error(&self) -> Option<&io::Error> {
        match self {
            Outcome::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// Outcome of one relay. Errors are informational only.
#[derive(Debug)]
pub struct RelayReport {
    /// The direction whose completion ended the relay.
    pub finished_first: Direction,
    pub first: Outcome,
    /// The other direction. Never detached: it either finished within
    /// [`TEARDOWN_TIMEOUT`] or was dropped before `relay` returned.
    pub second: Outcome,
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Bound on each teardown step: a write-side shutdown, and the grace period
/// the remaining direction gets after the first one reached EOF.
pub const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Copies bytes between `a` and `b` in both directions until either
/// direction reaches EOF or fails.
///
/// Each direction owns a `buffer_size` buffer and shuts down its write side
/// when it ends, so the peer sees EOF as soon as its data is through. After a
/// clean EOF the other direction gets [`TEARDOWN_TIMEOUT`] to finish; after an
/// error it is dropped right away. Both streams are dropped on return, and
/// no step of the teardown waits on a peer longer than [`TEARDOWN_TIMEOUT`].
pub async fn relay<A, B>(a: A, b: B, buffer_size: usize) -> RelayReport
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let buffer_size = if buffer_size == 0 {
        DEFAULT_BUFFER_SIZE
    } else {
        buffer_size
    };

    let (mut a_rd, mut a_wr) = tokio::io::split(a);
    let (mut b_rd, mut b_wr) = tokio::io::split(b);

    let mut a_to_b = 0u64;
    let mut b_to_a = 0u64;

    let (finished_first, first, second) = {
        let up = copy_direction(&mut a_rd, &mut b_wr, buffer_size, &mut a_to_b);
        let down = copy_direction(&mut b_rd, &mut a_wr, buffer_size, &mut b_to_a);
        tokio::pin!(up, down);

        let (finished_first, res) = tokio::select! {
            res = &mut up => (Direction::AToB, res),
            res = &mut down => (Direction::BToA, res),
        };
        let first = match res {
            Ok(()) => Outcome::Eof,
            Err(err) => Outcome::Failed(err),
        };
        let second = match finished_first {
            Direction::AToB => finish_rest(down.as_mut(), &first).await,
            Direction::BToA => finish_rest(up.as_mut(), &first).await,
        };
        (finished_first, first, second)
    };

    for (direction, outcome) in [
        (finished_first, &first),
        (finished_first.other(), &second),
    ] {
        let Some(err) = outcome.error() else {
            continue;
        };
        if is_expected_close(err) {
            tracing::debug!(direction = %direction, err = %err, "relay: stream closed");
        } else {
            tracing::warn!(direction = %direction, err = %err, "relay: stream error");
        }
    }

    RelayReport {
        finished_first,
        first,
        second,
        a_to_b,
        b_to_a,
    }
}

async fn finish_rest<F>(rest: Pin<&mut F>, first: &Outcome) -> Outcome
where
    F: Future<Output = io::Result<()>>,
{
    if !matches!(first, Outcome::Eof) {
        return Outcome::Cancelled;
    }
    match tokio::time::timeout(TEARDOWN_TIMEOUT, rest).await {
        Ok(Ok(())) => Outcome::Eof,
        Ok(Err(err)) => Outcome::Failed(err),
        Err(_) => Outcome::Cancelled,
    }
}

async fn copy_direction<R, W>(
    rd: &mut R,
    wr: &mut W,
    buffer_size: usize,
    copied: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let res = copy_until_eof(rd, wr, buffer_size, copied).await;
    // A TLS peer that stopped reading can stall close_notify forever.
    if tokio::time::timeout(TEARDOWN_TIMEOUT, wr.shutdown())
        .await
        .is_err()
    {
        tracing::debug!("relay: write shutdown timed out");
    }
    res
}

async fn copy_until_eof<R, W>(
    rd: &mut R,
    wr: &mut W,
    buffer_size: usize,
    copied: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = rd.read(&mut buf).await?;
        if n == 0 {
            return wr.flush().await;
        }
        wr.write_all(&buf[..n]).await?;
        wr.flush().await?;
        *copied += n as u64;
    }
}

/// Errors that just mean the peer went away.
pub fn is_expected_close(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}
