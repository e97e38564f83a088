use crate::common::{ConnContext, connect_upstream, respond_with_error};
use crate::error::ProxyError;
use crate::message::{BodyFraming, ProxyRequest, ProxyResponse};
use crate::relay::CHUNK_SIZE;
use bytes::Bytes;
use http::Method;
use log::{debug, info};
use std::future::Future;
use std::io::{self, Cursor};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{Duration, timeout};
use url::Url;

// Hop-by-hop headers replaced by our own `Connection: close`.
const DROPPED_REQUEST_HEADERS: [&str; 3] = ["connection", "proxy-connection", "keep-alive"];

/// Where an absolute-form request is reissued to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    pub host: String,
    pub port: u16,
    /// Host header value derived from the URL.
    pub authority: String,
    /// Origin-form request target (`/path?query`).
    pub path: String,
}

impl ForwardTarget {
    pub fn from_absolute(raw: &str) -> Result<Self, ProxyError> {
        let url = Url::parse(raw)
            .map_err(|e| ProxyError::MalformedRequest(format!("{}: {}", raw, e)))?;
        if url.scheme() != "http" {
            return Err(ProxyError::MalformedRequest(format!(
                "unsupported scheme '{}' in {}",
                url.scheme(),
                raw
            )));
        }
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ProxyError::MalformedRequest(format!("missing host in {}", raw)))?;
        let port = url.port_or_known_default().unwrap_or(80);
        let authority = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        Ok(Self {
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port,
            authority,
            path: origin_form(raw),
        })
    }
}

/// Path and query of an absolute URL exactly as the client wrote them.
fn origin_form(raw: &str) -> String {
    let after_scheme = raw.split_once("://").map(|(_, rest)| rest).unwrap_or(raw);
    let rest = match after_scheme.find(['/', '?', '#']) {
        Some(idx) => &after_scheme[idx..],
        None => "",
    };
    let rest = rest.split('#').next().unwrap_or("");
    if rest.starts_with('/') {
        rest.to_string()
    } else {
        format!("/{}", rest)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardSummary {
    pub status: u16,
    pub body_bytes: u64,
}

/// Reissues plain `GET` requests to the origin and relays the reply verbatim.
#[derive(Debug, Clone, Copy)]
pub struct ForwardHandler {
    connect_timeout: Duration,
    read_timeout: Duration,
    max_header_size: usize,
}

impl ForwardHandler {
    pub fn new(connect_timeout: Duration, read_timeout: Duration, max_header_size: usize) -> Self {
        Self {
            connect_timeout,
            read_timeout,
            max_header_size,
        }
    }

    pub async fn handle<C>(
        &self,
        client: &mut C,
        request: &ProxyRequest,
        ctx: &ConnContext,
    ) -> Result<ForwardSummary, ProxyError>
    where
        C: AsyncWrite + Unpin,
    {
        let fetched = match self.open(request).await {
            Ok((target, mut upstream)) => self
                .read_final_head(&mut upstream, client, ctx)
                .await
                .map(|(response, early_body)| (target, upstream, response, early_body)),
            Err(e) => Err(e),
        };
        let (target, upstream, response, early_body) = match fetched {
            Ok(fetched) => fetched,
            Err(e) => {
                respond_with_error(client, &e, ctx).await;
                return Err(e);
            }
        };
        debug!(
            "{} {}:{} answered {} {}",
            ctx, target.host, target.port, response.status, response.reason
        );

        // From here on the client has seen a final status line; failures just close.
        self.timed(client.write_all(&response.head_bytes())).await?;

        let mut body = BufReader::new(Cursor::new(early_body).chain(upstream));
        let body_bytes = self
            .stream_body(&mut body, client, response.body_framing())
            .await?;
        self.timed(client.flush()).await?;

        info!(
            "{} Forwarded {} -> {} ({} body bytes)",
            ctx,
            request.target(),
            response.status,
            body_bytes
        );
        Ok(ForwardSummary {
            status: response.status,
            body_bytes,
        })
    }

    /// Connects to the origin and sends the rewritten request.
    async fn open(&self, request: &ProxyRequest) -> Result<(ForwardTarget, TcpStream), ProxyError> {
        if request.method() != Method::GET {
            return Err(ProxyError::UnsupportedMethod(request.method().to_string()));
        }
        let target = ForwardTarget::from_absolute(request.target())?;
        let outbound = reconstruct_request(request, &target);

        let label = format!("{}:{}", target.host, target.port);
        let mut upstream =
            connect_upstream(&target.host, target.port, &label, self.connect_timeout).await?;

        self.timed(upstream.write_all(&outbound)).await?;
        self.timed(upstream.flush()).await?;
        Ok((target, upstream))
    }

    /// Reads response heads until a final one arrives, passing interim 1xx
    /// heads through to the client. The returned bytes already belong to the
    /// final response's body.
    async fn read_final_head<U, C>(
        &self,
        upstream: &mut U,
        client: &mut C,
        ctx: &ConnContext,
    ) -> Result<(ProxyResponse, Bytes), ProxyError>
    where
        U: AsyncRead + Unpin,
        C: AsyncWrite + Unpin,
    {
        let mut pending = Bytes::new();
        loop {
            let (response, rest) = timeout(
                self.read_timeout,
                ProxyResponse::read_continuing(upstream, &pending, self.max_header_size),
            )
            .await
            .map_err(|_| {
                ProxyError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "timed out waiting for the upstream response",
                ))
            })??;
            if !response.is_interim() {
                return Ok((response, rest));
            }

            debug!("{} passing through interim {} {}", ctx, response.status, response.reason);
            self.timed(client.write_all(&response.head_bytes())).await?;
            self.timed(client.flush()).await?;
            pending = rest;
        }
    }

    async fn stream_body<R, W>(
        &self,
        reader: &mut R,
        client: &mut W,
        framing: BodyFraming,
    ) -> io::Result<u64>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        match framing {
            BodyFraming::Empty => Ok(0),
            BodyFraming::Length(len) => self.copy_exact(reader, client, len).await,
            BodyFraming::UntilClose => {
                let mut buf = vec![0u8; CHUNK_SIZE];
                let mut total = 0u64;
                loop {
                    let n = self.timed(reader.read(&mut buf)).await?;
                    if n == 0 {
                        return Ok(total);
                    }
                    self.timed(client.write_all(&buf[..n])).await?;
                    total += n as u64;
                }
            }
            BodyFraming::Chunked => self.copy_chunked(reader, client).await,
        }
    }

    /// Copies a chunked body as-is, chunk-size lines and trailers included.
    async fn copy_chunked<R, W>(&self, reader: &mut R, client: &mut W) -> io::Result<u64>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut total = 0u64;
        let mut line = Vec::new();
        loop {
            self.read_line(reader, &mut line).await?;
            let size = parse_chunk_size(&line)?;
            self.timed(client.write_all(&line)).await?;
            total += line.len() as u64;

            if size == 0 {
                break;
            }
            // chunk data plus its CRLF
            let framed = size
                .checked_add(2)
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "chunk size out of range"))?;
            total += self.copy_exact(reader, client, framed).await?;
        }

        loop {
            self.read_line(reader, &mut line).await?;
            self.timed(client.write_all(&line)).await?;
            total += line.len() as u64;
            if line == b"\r\n" || line == b"\n" {
                return Ok(total);
            }
        }
    }

    async fn copy_exact<R, W>(&self, reader: &mut R, client: &mut W, len: u64) -> io::Result<u64>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut remaining = len;
        while remaining > 0 {
            let want = remaining.min(CHUNK_SIZE as u64) as usize;
            let n = self.timed(reader.read(&mut buf[..want])).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("upstream closed with {} body bytes outstanding", remaining),
                ));
            }
            self.timed(client.write_all(&buf[..n])).await?;
            remaining -= n as u64;
        }
        Ok(len)
    }

    /// Reads one CRLF-terminated line of chunked framing, at most
    /// `max_header_size` bytes long.
    async fn read_line<R>(&self, reader: &mut R, line: &mut Vec<u8>) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        line.clear();
        let limit = self.max_header_size as u64;
        let mut limited = (&mut *reader).take(limit);
        let n = self.timed(limited.read_until(b'\n', line)).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "upstream closed inside a chunked body",
            ));
        }
        if !line.ends_with(b"\n") {
            if n as u64 >= limit {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("chunked framing line exceeds {} bytes", limit),
                ));
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "upstream closed inside a chunked body",
            ));
        }
        Ok(())
    }

    async fn timed<F, T>(&self, fut: F) -> io::Result<T>
    where
        F: Future<Output = io::Result<T>>,
    {
        timeout(self.read_timeout, fut).await.map_err(|_| {
            io::Error::new(io::ErrorKind::TimedOut, "peer stalled mid-response")
        })?
    }
}

fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
    let invalid = || io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size line");
    let text = std::str::from_utf8(line).map_err(|_| invalid())?;
    let size = text.split(';').next().unwrap_or("").trim();
    u64::from_str_radix(size, 16).map_err(|_| invalid())
}

/// Builds the origin-form request sent upstream.
///
/// Client headers keep their order; hop-by-hop connection headers are
/// replaced by `Connection: close` so the upstream socket is never reused.
fn reconstruct_request(request: &ProxyRequest, target: &ForwardTarget) -> Vec<u8> {
    let mut out = format!("GET {} HTTP/1.1\r\n", target.path).into_bytes();
    if !request.headers().contains("host") {
        out.extend_from_slice(format!("Host: {}\r\n", target.authority).as_bytes());
    }
    for (name, value) in request.headers().iter() {
        if DROPPED_REQUEST_HEADERS
            .iter()
            .any(|dropped| name.eq_ignore_ascii_case(dropped))
        {
            continue;
        }
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"Connection: close\r\n\r\n");
    out
}
