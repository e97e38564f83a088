use crate::error::ProxyError;
use http::StatusCode;
use log::debug;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Duration, timeout};

/// Identity of one accepted client connection, carried into every log line
/// emitted on its behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnContext {
    pub id: u64,
    pub peer: SocketAddr,
}

impl ConnContext {
    pub fn new(id: u64, peer: SocketAddr) -> Self {
        Self { id, peer }
    }
}

impl fmt::Display for ConnContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[conn-{}] {}", self.id, self.peer)
    }
}

/// Common response builder utilities
pub struct ResponseBuilder;

impl ResponseBuilder {
    /// Minimal CONNECT acknowledgement: status line and empty header block.
    pub fn connection_established(minor_version: u8) -> Vec<u8> {
        format!("HTTP/1.{} 200 Connection Established\r\n\r\n", minor_version).into_bytes()
    }

    /// Plain text error response that also tells the client the connection
    /// is about to close.
    pub fn error(status: StatusCode, message: &str) -> Vec<u8> {
        let body = format!("{}\n", message);
        format!(
            "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("Error"),
            body.len(),
            body
        )
        .into_bytes()
    }

    pub fn from_error(err: &ProxyError) -> Vec<u8> {
        Self::error(err.status_code(), &err.to_string())
    }
}

/// Sends the error response for `err` if the client is still writable.
///
/// Write failures are swallowed: the connection is torn down either way.
pub async fn respond_with_error<W>(client: &mut W, err: &ProxyError, ctx: &ConnContext)
where
    W: AsyncWrite + Unpin,
{
    let response = ResponseBuilder::from_error(err);
    let sent = async {
        client.write_all(&response).await?;
        client.flush().await
    };
    if let Err(e) = sent.await {
        debug!("{} could not deliver error response: {}", ctx, e);
    }
}

/// Opens the outbound connection for a tunnel or forwarded request.
///
/// `label` names the destination in the resulting error. Refused, unresolvable
/// and timed-out destinations all surface as `UpstreamUnreachable`.
pub async fn connect_upstream(
    host: &str,
    port: u16,
    label: &str,
    limit: Duration,
) -> Result<TcpStream, ProxyError> {
    let stream = bounded_connect(label, limit, TcpStream::connect((host, port))).await?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

async fn bounded_connect<F, T>(label: &str, limit: Duration, connect: F) -> Result<T, ProxyError>
where
    F: Future<Output = io::Result<T>>,
{
    match timeout(limit, connect).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ProxyError::UpstreamUnreachable(format!("{}: {}", label, e))),
        Err(_) => Err(ProxyError::UpstreamUnreachable(format!(
            "{}: connect timed out after {:?}",
            label, limit
        ))),
    }
}
