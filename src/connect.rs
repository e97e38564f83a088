use crate::common::{ConnContext, ResponseBuilder, connect_upstream, respond_with_error};
use crate::error::ProxyError;
use crate::message::ProxyRequest;
use crate::relay::{RelayOptions, RelayReport, relay};
use log::{debug, info};
use std::fmt;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Duration;

/// Destination of a CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
}

impl FromStr for ConnectTarget {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ProxyError::MalformedTarget(s.to_string());

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            // [v6-literal]:port
            let (host, port) = rest.split_once("]:").ok_or_else(malformed)?;
            if host.parse::<std::net::Ipv6Addr>().is_err() {
                return Err(malformed());
            }
            (host, port)
        } else {
            let (host, port) = s.split_once(':').ok_or_else(malformed)?;
            if host.is_empty() || port.contains(':') {
                return Err(malformed());
            }
            (host, port)
        };

        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }
        let port = port.parse::<u16>().map_err(|_| malformed())?;

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Result of a tunnel that was successfully established.
#[derive(Debug)]
pub struct TunnelSummary {
    pub target: ConnectTarget,
    pub report: RelayReport,
}

/// Handles `CONNECT host:port` by opening a raw TCP tunnel.
///
/// The tunnel payload is never inspected; in particular no TLS is terminated,
/// so the destination's certificate is the client's business alone.
#[derive(Debug, Clone, Copy)]
pub struct ConnectHandler {
    connect_timeout: Duration,
    relay_options: RelayOptions,
}

impl ConnectHandler {
    pub fn new(connect_timeout: Duration, relay_options: RelayOptions) -> Self {
        Self {
            connect_timeout,
            relay_options,
        }
    }

    /// Runs one tunnel to completion. Pre-tunnel failures are answered on
    /// `client` before being returned.
    pub async fn handle<C>(
        &self,
        client: &mut C,
        request: &ProxyRequest,
        ctx: &ConnContext,
    ) -> Result<TunnelSummary, ProxyError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let (target, mut upstream) = match self.open(request.target()).await {
            Ok(opened) => opened,
            Err(e) => {
                respond_with_error(client, &e, ctx).await;
                return Err(e);
            }
        };

        client
            .write_all(&ResponseBuilder::connection_established(request.minor_version()))
            .await?;
        client.flush().await?;
        info!("{} Established tunnel to {}", ctx, target);

        if !request.buffered().is_empty() {
            debug!(
                "{} forwarding {} early bytes to {}",
                ctx,
                request.buffered().len(),
                target
            );
            upstream.write_all(request.buffered()).await?;
        }

        let report = relay(client, &mut upstream, self.relay_options).await;
        Ok(TunnelSummary { target, report })
    }

    async fn open(&self, raw_target: &str) -> Result<(ConnectTarget, TcpStream), ProxyError> {
        let target: ConnectTarget = raw_target.parse()?;

        let stream = connect_upstream(
            &target.host,
            target.port,
            &target.to_string(),
            self.connect_timeout,
        )
        .await?;

        Ok((target, stream))
    }
}
