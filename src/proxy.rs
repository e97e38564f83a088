use crate::common::{ConnContext, respond_with_error};
use crate::config::Config;
use crate::connect::ConnectHandler;
use crate::error::ProxyError;
use crate::forward_proxy::ForwardHandler;
use crate::message::ProxyRequest;
use crate::relay::RelayOutcome;
use http::Method;
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::{Duration, sleep, timeout};
use tokio_util::sync::CancellationToken;

/// Accepts client connections and runs each one in its own task.
///
/// Nothing is shared between connection tasks except the handlers, which are
/// plain configuration, and the global logger.
pub struct ProxyServer {
    dispatcher: Arc<Dispatcher>,
    limiter: Arc<Semaphore>,
}

struct Dispatcher {
    connect: ConnectHandler,
    forward: ForwardHandler,
    header_timeout: Duration,
    max_header_size: usize,
}

impl ProxyServer {
    pub fn new(config: &Config) -> Self {
        debug!(
            "Proxy configuration - connect_timeout: {:?}, header_timeout: {:?}, relay: {:?}, max_connections: {:?}",
            config.connect_timeout(),
            config.header_timeout(),
            config.relay_options(),
            config.max_connections
        );

        let dispatcher = Dispatcher {
            connect: ConnectHandler::new(config.connect_timeout(), config.relay_options()),
            forward: ForwardHandler::new(
                config.connect_timeout(),
                config.header_timeout(),
                config.max_header_size(),
            ),
            header_timeout: config.header_timeout(),
            max_header_size: config.max_header_size(),
        };
        let permits = config
            .max_connections
            .filter(|max| *max > 0)
            .unwrap_or(Semaphore::MAX_PERMITS)
            .min(Semaphore::MAX_PERMITS);

        Self {
            dispatcher: Arc::new(dispatcher),
            limiter: Arc::new(Semaphore::new(permits)),
        }
    }

    /// Binds `addr` and serves until `shutdown` is cancelled.
    ///
    /// Failing to bind is the only error that ends the server.
    pub async fn run(self, addr: SocketAddr, shutdown: CancellationToken) -> Result<(), ProxyError> {
        info!("Binding TCP listener to: {}", addr);
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            error!("Failed to bind {}: {}", addr, e);
            ProxyError::Io(e)
        })?;
        self.serve(listener, shutdown).await
    }

    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<(), ProxyError> {
        let local_addr = listener.local_addr()?;
        info!("Forward proxy listening on: {}", local_addr);

        let mut next_id: u64 = 0;
        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = self.limiter.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        // Usually descriptor exhaustion; give in-flight sessions a moment.
                        warn!("Failed to accept connection: {}", e);
                        sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                },
            };

            next_id += 1;
            let ctx = ConnContext::new(next_id, peer);
            let dispatcher = self.dispatcher.clone();
            tokio::spawn(async move {
                let _permit = permit;
                dispatcher.handle_connection(stream, ctx).await;
                debug!("{} connection closed", ctx);
            });
        }

        drop(listener);
        info!("Stopped accepting connections on {}", local_addr);
        Ok(())
    }
}

impl Dispatcher {
    async fn handle_connection(&self, mut stream: TcpStream, ctx: ConnContext) {
        info!("{} accepted connection", ctx);

        let request = match timeout(
            self.header_timeout,
            ProxyRequest::read_from(&mut stream, self.max_header_size),
        )
        .await
        {
            Ok(Ok(Some(request))) => request,
            Ok(Ok(None)) => {
                debug!("{} closed without sending a request", ctx);
                return;
            }
            Ok(Err(ProxyError::Io(e))) => {
                warn!("{} failed reading request: {}", ctx, e);
                return;
            }
            Ok(Err(e)) => {
                warn!("{} rejected request: {}", ctx, e);
                respond_with_error(&mut stream, &e, &ctx).await;
                return;
            }
            Err(_) => {
                let e = ProxyError::HeaderTimeout;
                warn!("{} {}", ctx, e);
                respond_with_error(&mut stream, &e, &ctx).await;
                return;
            }
        };

        info!("{} {} {}", ctx, request.method(), request.target());

        let method = request.method();
        if method == Method::CONNECT {
            match self.connect.handle(&mut stream, &request, &ctx).await {
                Ok(summary) => {
                    let report = &summary.report;
                    match &report.outcome {
                        RelayOutcome::Failed { .. } => warn!(
                            "{} Tunnel to {} failed: {} (client->upstream {} bytes, upstream->client {} bytes)",
                            ctx, summary.target, report.outcome, report.client_to_upstream, report.upstream_to_client
                        ),
                        _ => info!(
                            "{} Tunnel to {} closed: {} (client->upstream {} bytes, upstream->client {} bytes)",
                            ctx, summary.target, report.outcome, report.client_to_upstream, report.upstream_to_client
                        ),
                    }
                }
                Err(e) => warn!("{} CONNECT error: {}", ctx, e),
            }
        } else if method == Method::GET {
            if let Err(e) = self.forward.handle(&mut stream, &request, &ctx).await {
                warn!("{} GET error: {}", ctx, e);
            }
        } else {
            let e = ProxyError::UnsupportedMethod(method.to_string());
            warn!("{} {}", ctx, e);
            respond_with_error(&mut stream, &e, &ctx).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limiter_uses_max_connections() {
        let mut config = Config::default();
        config.max_connections = Some(3);
        let server = ProxyServer::new(&config);
        assert_eq!(server.limiter.available_permits(), 3);
    }

    #[test]
    fn test_unset_limit_is_unbounded() {
        let mut config = Config::default();
        config.max_connections = None;
        let server = ProxyServer::new(&config);
        assert_eq!(server.limiter.available_permits(), Semaphore::MAX_PERMITS);
    }

    #[tokio::test]
    async fn test_serve_stops_on_cancel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(ProxyServer::new(&Config::default()).serve(listener, shutdown.clone()));

        shutdown.cancel();
        server.await.unwrap().unwrap();
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
