//! End-to-end CONNECT tunnel tests against a live proxy listener.

mod common;

use common::{IO_LIMIT, closed_port, read_head, read_to_end, start_proxy, test_config};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Instant, timeout};

const ESTABLISHED: &str = "HTTP/1.1 200 Connection Established\r\n\r\n";

/// Destination that greets each client and then echoes everything back.
async fn greeting_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else { return };
            tokio::spawn(async move {
                stream.write_all(b"HELLO").await.unwrap();
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

async fn open_tunnel(proxy: SocketAddr, target: SocketAddr) -> TcpStream {
    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", target, target).as_bytes())
        .await
        .unwrap();
    assert_eq!(read_head(&mut client).await, ESTABLISHED);
    client
}

#[tokio::test]
async fn test_connect_success_line_precedes_tunneled_bytes() {
    let (proxy, _shutdown) = start_proxy(test_config()).await;
    let destination = greeting_echo_server().await;

    let mut client = open_tunnel(proxy, destination).await;
    let mut greeting = [0u8; 5];
    timeout(IO_LIMIT, client.read_exact(&mut greeting)).await.unwrap().unwrap();
    assert_eq!(&greeting, b"HELLO");
}

#[tokio::test]
async fn test_tunnel_round_trip_fidelity() {
    let (proxy, _shutdown) = start_proxy(test_config()).await;
    let destination = greeting_echo_server().await;

    let mut client = open_tunnel(proxy, destination).await;
    let mut greeting = [0u8; 5];
    client.read_exact(&mut greeting).await.unwrap();

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i * 7 % 256) as u8).collect();
    let (mut reader, mut writer) = client.into_split();
    let outgoing = payload.clone();
    let sender = tokio::spawn(async move {
        writer.write_all(&outgoing).await.unwrap();
        writer
    });

    let mut echoed = vec![0u8; payload.len()];
    timeout(IO_LIMIT, reader.read_exact(&mut echoed)).await.unwrap().unwrap();
    assert_eq!(echoed, payload);
    drop(sender.await.unwrap());
}

#[tokio::test]
async fn test_bytes_after_connect_head_are_forwarded_first() {
    let (proxy, _shutdown) = start_proxy(test_config()).await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let destination = listener.local_addr().unwrap();

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(format!("CONNECT {} HTTP/1.1\r\n\r\nEARLY", destination).as_bytes())
        .await
        .unwrap();

    let (mut upstream, _) = timeout(IO_LIMIT, listener.accept()).await.unwrap().unwrap();
    assert_eq!(read_head(&mut client).await, ESTABLISHED);
    client.write_all(b"-LATE").await.unwrap();

    let mut seen = [0u8; 10];
    timeout(IO_LIMIT, upstream.read_exact(&mut seen)).await.unwrap().unwrap();
    assert_eq!(&seen, b"EARLY-LATE");
}

#[tokio::test]
async fn test_destination_close_closes_client() {
    let (proxy, _shutdown) = start_proxy(test_config()).await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let destination = listener.local_addr().unwrap();

    let accept = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_all(b"bye").await.unwrap();
    });

    let mut client = open_tunnel(proxy, destination).await;
    accept.await.unwrap();
    assert_eq!(read_to_end(&mut client).await, b"bye");
}

#[tokio::test]
async fn test_client_close_closes_destination() {
    let (proxy, _shutdown) = start_proxy(test_config()).await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let destination = listener.local_addr().unwrap();

    let client = open_tunnel(proxy, destination).await;
    let (mut upstream, _) = timeout(IO_LIMIT, listener.accept()).await.unwrap().unwrap();
    drop(client);

    assert!(read_to_end(&mut upstream).await.is_empty());
}

#[tokio::test]
async fn test_idle_tunnel_is_closed() {
    let mut config = test_config();
    config.idle_timeout_secs = Some(1);
    let (proxy, _shutdown) = start_proxy(config).await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let destination = listener.local_addr().unwrap();

    let started = Instant::now();
    let mut client = open_tunnel(proxy, destination).await;
    let (_upstream, _) = timeout(IO_LIMIT, listener.accept()).await.unwrap().unwrap();

    assert!(read_to_end(&mut client).await.is_empty());
    assert!(started.elapsed() >= Duration::from_secs(1));
}

#[tokio::test]
async fn test_malformed_target_never_dials_out() {
    let (proxy, _shutdown) = start_proxy(test_config()).await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    for target in ["not-a-target".to_string(), format!("127.0.0.1:{}:1", port)] {
        let mut client = TcpStream::connect(proxy).await.unwrap();
        client
            .write_all(format!("CONNECT {} HTTP/1.1\r\n\r\n", target).as_bytes())
            .await
            .unwrap();
        let response = String::from_utf8(read_to_end(&mut client).await).unwrap();
        assert!(response.starts_with("HTTP/1.1 500 "), "{}", response);
        assert!(response.contains("Malformed CONNECT target"));
    }

    assert!(timeout(Duration::from_millis(300), listener.accept()).await.is_err());
}

#[tokio::test]
async fn test_unreachable_target_fails_within_connect_timeout() {
    let (proxy, _shutdown) = start_proxy(test_config()).await;
    let destination = closed_port().await;

    let started = Instant::now();
    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(format!("CONNECT {} HTTP/1.1\r\n\r\n", destination).as_bytes())
        .await
        .unwrap();
    let response = String::from_utf8(read_to_end(&mut client).await).unwrap();

    assert!(response.starts_with("HTTP/1.1 500 "), "{}", response);
    assert!(response.contains("Upstream unreachable"));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_stalled_tunnel_does_not_block_other_connections() {
    let (proxy, _shutdown) = start_proxy(test_config()).await;

    // Accepts and then never speaks nor closes.
    let stalled = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let stalled_addr = stalled.local_addr().unwrap();
    let hold = tokio::spawn(async move {
        let (stream, _) = stalled.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(stream);
    });

    let _stuck = open_tunnel(proxy, stalled_addr).await;

    let destination = greeting_echo_server().await;
    let mut second = open_tunnel(proxy, destination).await;
    let mut greeting = [0u8; 5];
    timeout(IO_LIMIT, second.read_exact(&mut greeting)).await.unwrap().unwrap();
    assert_eq!(&greeting, b"HELLO");

    hold.abort();
}

#[tokio::test]
async fn test_connect_echoes_http10_version() {
    let (proxy, _shutdown) = start_proxy(test_config()).await;
    let destination = greeting_echo_server().await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(format!("CONNECT {} HTTP/1.0\r\n\r\n", destination).as_bytes())
        .await
        .unwrap();
    assert_eq!(
        read_head(&mut client).await,
        "HTTP/1.0 200 Connection Established\r\n\r\n"
    );
}
