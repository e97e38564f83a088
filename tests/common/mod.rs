//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tunnelgate::{Config, ProxyServer};

pub const IO_LIMIT: Duration = Duration::from_secs(5);

pub fn test_config() -> Config {
    Config {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        connect_timeout_secs: Some(2),
        header_timeout_secs: Some(2),
        idle_timeout_secs: Some(30),
        poll_interval_ms: Some(50),
        ..Config::default()
    }
}

/// Starts a proxy on an ephemeral loopback port.
pub async fn start_proxy(config: Config) -> (SocketAddr, CancellationToken) {
    let listener = TcpListener::bind(config.listen_addr).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(ProxyServer::new(&config).serve(listener, shutdown.clone()));
    (addr, shutdown)
}

/// Reads a message head byte by byte so nothing after it is consumed.
pub async fn read_head<R: AsyncRead + Unpin>(reader: &mut R) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = timeout(IO_LIMIT, reader.read(&mut byte))
            .await
            .expect("timed out reading head")
            .unwrap();
        assert!(n > 0, "stream ended inside head: {:?}", String::from_utf8_lossy(&head));
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

pub async fn read_to_end<R: AsyncRead + Unpin>(reader: &mut R) -> Vec<u8> {
    let mut out = Vec::new();
    timeout(IO_LIMIT, reader.read_to_end(&mut out))
        .await
        .expect("timed out waiting for end of stream")
        .unwrap();
    out
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}
