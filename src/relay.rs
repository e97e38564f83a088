//! Bidirectional byte relay used for CONNECT tunnels.
//!
//! Both streams are polled for readability at the same time. Whatever arrives
//! is written in full to the opposite stream before waiting again, so each
//! direction keeps its byte order and a chunk is never interleaved with
//! another. The first orderly close or I/O error on either side ends the
//! whole session; half-closed tunnels are not kept alive.

use std::fmt;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{Instant, sleep, timeout};

/// Size of a single read on either side of the relay.
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Bound on a single stalled write when the idle timeout is disabled.
pub const MAX_WRITE_STALL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOptions {
    /// Upper bound on a single wait for readability.
    pub poll_interval: Duration,
    /// Session ends once neither side has moved a byte for this long.
    /// `None` keeps quiet tunnels open indefinitely.
    pub idle_timeout: Option<Duration>,
}

impl RelayOptions {
    /// How long one chunk may wait for the receiving side to accept it.
    pub fn write_timeout(&self) -> Duration {
        self.idle_timeout.unwrap_or(MAX_WRITE_STALL)
    }
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            idle_timeout: Some(Duration::from_secs(300)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Upstream,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Client => write!(f, "client"),
            Side::Upstream => write!(f, "upstream"),
        }
    }
}

#[derive(Debug)]
pub enum RelayOutcome {
    /// The named side closed its end in an orderly way.
    PeerClosed(Side),
    IdleTimeout,
    /// Reading from or writing to the named side failed.
    Failed { side: Side, error: io::Error },
}

impl fmt::Display for RelayOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayOutcome::PeerClosed(side) => write!(f, "{} closed the connection", side),
            RelayOutcome::IdleTimeout => write!(f, "idle timeout"),
            RelayOutcome::Failed { side, error } => write!(f, "{} I/O error: {}", side, error),
        }
    }
}

#[derive(Debug)]
pub struct RelayReport {
    pub outcome: RelayOutcome,
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// Shuttles bytes between `client` and `upstream` until the session ends.
///
/// On return the write half of both streams has been shut down, so each peer
/// observes end-of-stream even if the caller keeps the sockets around.
/// A side that stops reading fails the session with `TimedOut` once a
/// write to it has been pending for `options.write_timeout()`.
pub async fn relay<C, U>(client: &mut C, upstream: &mut U, options: RelayOptions) -> RelayReport
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let mut client_buf = vec![0u8; CHUNK_SIZE];
    let mut upstream_buf = vec![0u8; CHUNK_SIZE];
    let mut client_to_upstream = 0u64;
    let mut upstream_to_client = 0u64;
    let mut last_activity = Instant::now();
    let write_timeout = options.write_timeout();

    let outcome = loop {
        tokio::select! {
            read = client.read(&mut client_buf) => match read {
                Ok(0) => break RelayOutcome::PeerClosed(Side::Client),
                Ok(n) => {
                    if let Err(error) = write_chunk(upstream, &client_buf[..n], write_timeout).await {
                        break RelayOutcome::Failed { side: Side::Upstream, error };
                    }
                    client_to_upstream += n as u64;
                    last_activity = Instant::now();
                }
                Err(error) => break RelayOutcome::Failed { side: Side::Client, error },
            },
            read = upstream.read(&mut upstream_buf) => match read {
                Ok(0) => break RelayOutcome::PeerClosed(Side::Upstream),
                Ok(n) => {
                    if let Err(error) = write_chunk(client, &upstream_buf[..n], write_timeout).await {
                        break RelayOutcome::Failed { side: Side::Client, error };
                    }
                    upstream_to_client += n as u64;
                    last_activity = Instant::now();
                }
                Err(error) => break RelayOutcome::Failed { side: Side::Upstream, error },
            },
            _ = sleep(options.poll_interval) => {
                if let Some(idle) = options.idle_timeout {
                    if last_activity.elapsed() >= idle {
                        break RelayOutcome::IdleTimeout;
                    }
                }
            }
        }
    };

    // A peer that stopped reading must not keep the session alive.
    let _ = timeout(options.poll_interval, client.shutdown()).await;
    let _ = timeout(options.poll_interval, upstream.shutdown()).await;

    RelayReport {
        outcome,
        client_to_upstream,
        upstream_to_client,
    }
}

async fn write_chunk<W>(writer: &mut W, chunk: &[u8], limit: Duration) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let write = async {
        writer.write_all(chunk).await?;
        writer.flush().await
    };
    timeout(limit, write).await.map_err(|_| {
        io::Error::new(
            io::ErrorKind::TimedOut,
            format!("peer accepted no data for {:?}", limit),
        )
    })?
}
