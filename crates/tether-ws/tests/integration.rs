//! End-to-end tests: a real server on a loopback port and real clients.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use tether_settings::{ClientSettings, PoolSettings, ReconnectSettings, ServerSettings};
use tether_ws::{Client, ClientState, Handler, HandlerError, Message, Server, ServerHandle, WsError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn server_settings() -> ServerSettings {
    ServerSettings {
        port: 0,
        shutdown_timeout_ms: 2_000,
        ..ServerSettings::default()
    }
}

fn client_settings(url: &str) -> ClientSettings {
    ClientSettings {
        dial_timeout_ms: 2_000,
        reconnect: ReconnectSettings {
            enable: false,
            ..ReconnectSettings::default()
        },
        ..ClientSettings::for_url(url)
    }
}

fn echo() -> Handler {
    Handler::new(|conn, message| async move {
        conn.send_async(message)?;
        Ok::<_, HandlerError>(())
    })
}

async fn start(settings: ServerSettings, handler: Handler) -> (Server, ServerHandle) {
    let server = Server::new(settings, handler).unwrap();
    let handle = server.start().await.unwrap();
    (server, handle)
}

async fn recv_text(client: &Client) -> String {
    let message = tokio::time::timeout(Duration::from_secs(2), client.recv())
        .await
        .expect("no message within 2s")
        .expect("inbox closed");
    message.as_text().unwrap().to_string()
}

/// Poll until `f` holds or two seconds pass.
async fn eventually(mut f: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if f() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    f()
}

#[tokio::test]
async fn echo_round_trip() {
    let (server, handle) = start(server_settings(), echo()).await;
    let client = Client::new(client_settings(&handle.ws_url())).unwrap();

    client.connect().await.unwrap();
    assert_eq!(client.state(), ClientState::Connected);

    client.send_async(Message::text("hello")).unwrap();
    assert_eq!(recv_text(&client).await, "hello");

    assert!(eventually(|| server.stats().active_connections == 1).await);

    client.close().await;
    assert_eq!(client.state(), ClientState::Closed);
    assert!(eventually(|| server.stats().active_connections == 0).await);

    assert!(server.shutdown().await);
}

#[tokio::test]
async fn pool_full_rejects_with_503() {
    let settings = ServerSettings {
        pool: PoolSettings {
            max_connections: 2,
            max_per_address: 10,
        },
        ..server_settings()
    };
    let (server, handle) = start(settings, echo()).await;
    let url = handle.ws_url();

    let a = Client::new(client_settings(&url)).unwrap();
    let b = Client::new(client_settings(&url)).unwrap();
    let c = Client::new(client_settings(&url)).unwrap();
    a.connect().await.unwrap();
    b.connect().await.unwrap();

    let err = c.connect().await.unwrap_err();
    assert_matches!(&err, WsError::Handshake(msg) if msg.contains("503"));
    assert_eq!(c.state(), ClientState::Disconnected);

    assert!(eventually(|| server.stats().active_connections == 2).await);
    assert_eq!(server.stats().total_rejected, 1);

    // Freeing a slot admits the next client.
    a.close().await;
    assert!(eventually(|| server.stats().active_connections == 1).await);
    c.connect().await.unwrap();

    b.close().await;
    c.close().await;
    assert!(server.shutdown().await);
}

#[tokio::test]
async fn per_address_limit_rejects_with_429() {
    let settings = ServerSettings {
        pool: PoolSettings {
            max_connections: 10,
            max_per_address: 1,
        },
        ..server_settings()
    };
    let (server, handle) = start(settings, echo()).await;
    let url = handle.ws_url();

    let a = Client::new(client_settings(&url)).unwrap();
    let b = Client::new(client_settings(&url)).unwrap();
    a.connect().await.unwrap();
    let err = b.connect().await.unwrap_err();
    assert_matches!(&err, WsError::Handshake(msg) if msg.contains("429"));

    a.close().await;
    assert!(server.shutdown().await);
}

#[tokio::test]
async fn disallowed_origin_rejects_with_403() {
    let settings = ServerSettings {
        allowed_origins: vec!["http://app.example".into()],
        ..server_settings()
    };
    let (server, handle) = start(settings, echo()).await;
    let url = handle.ws_url();

    let mut evil = client_settings(&url);
    let _ = evil
        .headers
        .insert("Origin".into(), "http://evil.example".into());
    let err = Client::new(evil).unwrap().connect().await.unwrap_err();
    assert_matches!(&err, WsError::Handshake(msg) if msg.contains("403"));

    let mut good = client_settings(&url);
    let _ = good
        .headers
        .insert("Origin".into(), "http://app.example".into());
    let client = Client::new(good).unwrap();
    client.connect().await.unwrap();

    client.close().await;
    assert!(server.shutdown().await);
}

/// Status line of a hand-written upgrade request carrying raw `origin` bytes.
async fn raw_upgrade_status(addr: SocketAddr, origin: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut request = format!(
        "GET /ws HTTP/1.1\r\nHost: {addr}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\nOrigin: "
    )
    .into_bytes();
    request.extend_from_slice(origin);
    request.extend_from_slice(b"\r\n\r\n");
    stream.write_all(&request).await.unwrap();

    let mut buf = vec![0u8; 512];
    let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("no response within 2s")
        .unwrap();
    String::from_utf8_lossy(&buf[..n])
        .lines()
        .next()
        .unwrap_or_default()
        .to_string()
}

#[tokio::test]
async fn non_ascii_origin_is_rejected() {
    let settings = ServerSettings {
        allowed_origins: vec!["http://app.example".into()],
        ..server_settings()
    };
    let (server, handle) = start(settings, echo()).await;

    let status = raw_upgrade_status(handle.local_addr(), b"http://evil.example").await;
    assert!(status.starts_with("HTTP/1.1 403"), "{status}");
    let status = raw_upgrade_status(handle.local_addr(), b"http://evil.example\xff").await;
    assert!(status.starts_with("HTTP/1.1 403"), "{status}");
    let status = raw_upgrade_status(handle.local_addr(), b"http://app.example").await;
    assert!(status.starts_with("HTTP/1.1 101"), "{status}");

    assert!(server.shutdown().await);
}

#[tokio::test]
async fn broadcast_reaches_every_client() {
    let (server, handle) = start(server_settings(), Handler::noop()).await;
    let url = handle.ws_url();

    let a = Client::new(client_settings(&url)).unwrap();
    let b = Client::new(client_settings(&url)).unwrap();
    a.connect().await.unwrap();
    b.connect().await.unwrap();
    assert!(eventually(|| server.stats().active_connections == 2).await);

    let report = server.broadcast(&Message::text("news"));
    assert_eq!(report.delivered, 2);
    assert_eq!(report.dropped, 0);
    assert_eq!(recv_text(&a).await, "news");
    assert_eq!(recv_text(&b).await, "news");

    a.close().await;
    b.close().await;
    assert!(server.shutdown().await);
}

#[tokio::test]
async fn shutdown_disconnects_clients_and_refuses_new_ones() {
    let (server, handle) = start(server_settings(), echo()).await;
    let url = handle.ws_url();

    let client = Client::new(client_settings(&url)).unwrap();
    client.connect().await.unwrap();
    assert!(eventually(|| server.stats().active_connections == 1).await);

    assert!(server.shutdown().await);
    assert!(server.is_shutting_down());
    assert!(server.stats().closed);
    assert!(eventually(|| client.state() == ClientState::Disconnected).await);

    let late = Client::new(client_settings(&url)).unwrap();
    assert!(late.connect().await.is_err());

    client.close().await;
    handle.join().await;
}

#[tokio::test]
async fn client_reconnects_after_server_restart_on_same_port() {
    let (server, handle) = start(server_settings(), echo()).await;
    let addr = handle.local_addr();

    let settings = ClientSettings {
        reconnect: ReconnectSettings {
            enable: true,
            max_retries: 50,
            initial_delay_ms: 20,
            max_delay_ms: 100,
            multiplier: 2.0,
            random_factor: 0.0,
        },
        ..client_settings(&handle.ws_url())
    };
    let reconnects = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&reconnects);
    let client = Client::builder(settings)
        .on_reconnect(move |_| {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();
    client.connect().await.unwrap();
    let first = client.connection().unwrap().id().clone();

    assert!(server.shutdown().await);
    handle.join().await;

    let restarted = ServerSettings {
        port: addr.port(),
        ..server_settings()
    };
    let (server, _handle) = start(restarted, echo()).await;

    // The old socket may still read as Connected until its close is seen.
    assert!(
        eventually(|| {
            reconnects.load(Ordering::SeqCst) >= 1
                && client.state() == ClientState::Connected
                && client.connection().is_some_and(|c| *c.id() != first)
        })
        .await
    );
    client.send_async(Message::text("again")).unwrap();
    assert_eq!(recv_text(&client).await, "again");

    client.close().await;
    assert!(server.shutdown().await);
}
