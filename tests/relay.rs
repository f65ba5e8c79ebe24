//! End-to-end tests for the relay over real sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::oneshot;
use tokio::task::LocalSet;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use sockrelay::filter::AllowList;
use sockrelay::protocol::ServerFrame;
use sockrelay::relay::{self, DnsResolver, RelayConfig};

type Channel = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn config(allow: AllowList) -> RelayConfig {
    RelayConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        path: relay::DEFAULT_PATH.to_string(),
        allow,
        resolver: DnsResolver::System,
        tls: relay::default_tls_config().unwrap(),
        stats_interval: Duration::ZERO,
    }
}

/// TCP server echoing every connection back to itself.
async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// TCP server that writes a greeting and hangs up.
async fn greeting_server(greeting: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let _ = stream.write_all(greeting).await;
            let _ = stream.shutdown().await;
        }
    });
    addr
}

async fn open(relay: SocketAddr, path: &str) -> Channel {
    let (ws, _) = connect_async(format!("ws://{relay}{path}")).await.unwrap();
    ws
}

async fn send_text(ws: &mut Channel, text: String) {
    ws.send(Message::Text(text)).await.unwrap();
}

async fn connect_frame(ws: &mut Channel, host: &str, port: u16) {
    send_text(ws, format!(r#"{{"t":"c","h":"{host}","p":{port}}}"#)).await;
}

async fn next_control(ws: &mut Channel) -> ServerFrame {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
            Some(Ok(Message::Binary(data))) => panic!("unexpected data: {data:?}"),
            Some(Ok(_)) => {}
            other => panic!("channel ended: {other:?}"),
        }
    }
}

async fn next_data(ws: &mut Channel) -> Vec<u8> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => return data,
            Some(Ok(Message::Text(text))) => panic!("unexpected control frame: {text}"),
            Some(Ok(_)) => {}
            other => panic!("channel ended: {other:?}"),
        }
    }
}

/// Whether the relay closes the channel without sending anything else.
async fn closes_quietly(ws: &mut Channel) -> bool {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), ws.next()).await {
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => return true,
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => {}
            Ok(Some(Ok(_))) | Err(_) => return false,
        }
    }
}

#[tokio::test(flavor = "current_thread")]
async fn acknowledges_then_relays_bytes() {
    LocalSet::new()
        .run_until(async {
            let target = echo_server().await;
            let relay = relay::start(config(AllowList::default())).await.unwrap();
            let mut ws = open(relay.local_addr, "/tcp-tunnel").await;

            connect_frame(&mut ws, "127.0.0.1", target.port()).await;
            assert_eq!(next_control(&mut ws).await, ServerFrame::Connected);

            ws.send(Message::Binary(b"ping".to_vec())).await.unwrap();
            assert_eq!(next_data(&mut ws).await, b"ping");

            let snapshot = relay.stats.snapshot_and_reset();
            assert_eq!(snapshot.sessions, 1);
            assert_eq!(snapshot.bytes_up, 4);
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn data_sent_before_ack_is_delivered_in_order() {
    LocalSet::new()
        .run_until(async {
            let target = echo_server().await;
            let relay = relay::start(config(AllowList::default())).await.unwrap();
            let mut ws = open(relay.local_addr, "/tcp-tunnel").await;

            connect_frame(&mut ws, "127.0.0.1", target.port()).await;
            ws.send(Message::Binary(b"early ".to_vec())).await.unwrap();
            ws.send(Message::Binary(b"bytes".to_vec())).await.unwrap();
            assert_eq!(next_control(&mut ws).await, ServerFrame::Connected);

            let mut echoed = Vec::new();
            while echoed.len() < 11 {
                echoed.extend(next_data(&mut ws).await);
            }
            assert_eq!(echoed, b"early bytes");
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn run_alias_path_is_accepted() {
    LocalSet::new()
        .run_until(async {
            let target = echo_server().await;
            let relay = relay::start(config(AllowList::default())).await.unwrap();
            let mut ws = open(relay.local_addr, "/run/tcp-tunnel").await;

            connect_frame(&mut ws, "127.0.0.1", target.port()).await;
            assert_eq!(next_control(&mut ws).await, ServerFrame::Connected);
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn other_paths_are_rejected() {
    LocalSet::new()
        .run_until(async {
            let relay = relay::start(config(AllowList::default())).await.unwrap();

            let result = connect_async(format!("ws://{}/elsewhere", relay.local_addr)).await;
            assert!(result.is_err());
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn host_outside_allow_list_is_forbidden() {
    LocalSet::new()
        .run_until(async {
            let target = echo_server().await;
            let allow = AllowList::parse("example.com", "");
            let relay = relay::start(config(allow)).await.unwrap();
            let mut ws = open(relay.local_addr, "/tcp-tunnel").await;

            connect_frame(&mut ws, "127.0.0.1", target.port()).await;
            match next_control(&mut ws).await {
                ServerFrame::Error { code, .. } => assert_eq!(code, 403),
                other => panic!("expected error, got {other:?}"),
            }
            assert!(closes_quietly(&mut ws).await);
            assert_eq!(relay.stats.snapshot_and_reset().rejected, 1);
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn port_outside_allow_list_is_forbidden() {
    LocalSet::new()
        .run_until(async {
            let target = echo_server().await;
            let allow = AllowList::parse("", "443");
            let relay = relay::start(config(allow)).await.unwrap();
            let mut ws = open(relay.local_addr, "/tcp-tunnel").await;

            connect_frame(&mut ws, "127.0.0.1", target.port()).await;
            match next_control(&mut ws).await {
                ServerFrame::Error { code, .. } => assert_eq!(code, 403),
                other => panic!("expected error, got {other:?}"),
            }
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn bad_port_is_a_bad_request() {
    LocalSet::new()
        .run_until(async {
            let relay = relay::start(config(AllowList::default())).await.unwrap();
            let mut ws = open(relay.local_addr, "/tcp-tunnel").await;

            send_text(&mut ws, r#"{"t":"c","h":"127.0.0.1","p":"eighty"}"#.to_string()).await;
            match next_control(&mut ws).await {
                ServerFrame::Error { code, .. } => assert_eq!(code, 400),
                other => panic!("expected error, got {other:?}"),
            }
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn malformed_first_frame_closes_channel() {
    LocalSet::new()
        .run_until(async {
            let relay = relay::start(config(AllowList::default())).await.unwrap();
            let mut ws = open(relay.local_addr, "/tcp-tunnel").await;

            send_text(&mut ws, "connect me please".to_string()).await;
            assert!(closes_quietly(&mut ws).await);
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn target_eof_is_reported() {
    LocalSet::new()
        .run_until(async {
            let target = greeting_server(b"hello").await;
            let relay = relay::start(config(AllowList::default())).await.unwrap();
            let mut ws = open(relay.local_addr, "/tcp-tunnel").await;

            connect_frame(&mut ws, "127.0.0.1", target.port()).await;
            assert_eq!(next_control(&mut ws).await, ServerFrame::Connected);
            assert_eq!(next_data(&mut ws).await, b"hello");
            assert_eq!(next_control(&mut ws).await, ServerFrame::RemoteClosed);
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn refused_target_is_a_target_error() {
    LocalSet::new()
        .run_until(async {
            let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = unused.local_addr().unwrap().port();
            drop(unused);

            let relay = relay::start(config(AllowList::default())).await.unwrap();
            let mut ws = open(relay.local_addr, "/tcp-tunnel").await;

            connect_frame(&mut ws, "127.0.0.1", port).await;
            match next_control(&mut ws).await {
                ServerFrame::Error { code, .. } => assert_eq!(code, 500),
                other => panic!("expected error, got {other:?}"),
            }
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn dns_request_before_connect() {
    LocalSet::new()
        .run_until(async {
            let target = echo_server().await;
            let relay = relay::start(config(AllowList::default())).await.unwrap();
            let mut ws = open(relay.local_addr, "/tcp-tunnel").await;

            send_text(&mut ws, r#"{"t":"dns","h":"localhost"}"#.to_string()).await;
            match next_control(&mut ws).await {
                ServerFrame::Dns {
                    result: Some(answer),
                    error: None,
                } => {
                    assert_eq!(answer.status, 0);
                    assert!(answer.answer.iter().any(|r| r.data == "127.0.0.1"));
                    assert!(answer.answer.iter().all(|r| r.ttl == Some(86400)));
                }
                other => panic!("expected dns answer, got {other:?}"),
            }

            // The channel stays usable for a connect afterwards.
            connect_frame(&mut ws, "127.0.0.1", target.port()).await;
            assert_eq!(next_control(&mut ws).await, ServerFrame::Connected);
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn tls_target() {
    LocalSet::new()
        .run_until(async {
            let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
            let cert_der = CertificateDer::from(cert.serialize_der().unwrap());
            let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
                cert.serialize_private_key_der(),
            ));

            let server_config = rustls::ServerConfig::builder_with_provider(Arc::new(
                rustls::crypto::ring::default_provider(),
            ))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der.clone()], key_der)
            .unwrap();
            let acceptor = TlsAcceptor::from(Arc::new(server_config));

            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let target = listener.local_addr().unwrap();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        if let Ok(tls) = acceptor.accept(stream).await {
                            let (mut reader, mut writer) = tokio::io::split(tls);
                            let _ = tokio::io::copy(&mut reader, &mut writer).await;
                        }
                    });
                }
            });

            let mut roots = RootCertStore::empty();
            roots.add(cert_der).unwrap();
            let mut config = config(AllowList::default());
            config.tls = relay::tls_config_with_roots(roots).unwrap();

            let relay = relay::start(config).await.unwrap();
            let mut ws = open(relay.local_addr, "/tcp-tunnel").await;

            send_text(
                &mut ws,
                format!(r#"{{"t":"c","h":"localhost","p":{},"tls":true}}"#, target.port()),
            )
            .await;
            assert_eq!(next_control(&mut ws).await, ServerFrame::Connected);

            ws.send(Message::Binary(b"secret".to_vec())).await.unwrap();
            assert_eq!(next_data(&mut ws).await, b"secret");
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn pending_lookup_does_not_hold_up_target_bytes() {
    LocalSet::new()
        .run_until(async {
            // Upstream that never answers, so every lookup runs into its timeout.
            let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let mut config = config(AllowList::default());
            config.resolver = DnsResolver::Upstream(silent.local_addr().unwrap());

            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let target = listener.local_addr().unwrap();
            tokio::spawn(async move {
                let (mut stream, _) = listener.accept().await.unwrap();
                tokio::time::sleep(Duration::from_millis(200)).await;
                let _ = stream.write_all(b"tick").await;
                let mut rest = Vec::new();
                let _ = stream.read_to_end(&mut rest).await;
            });

            let relay = relay::start(config).await.unwrap();
            let mut ws = open(relay.local_addr, "/tcp-tunnel").await;
            connect_frame(&mut ws, "127.0.0.1", target.port()).await;
            assert_eq!(next_control(&mut ws).await, ServerFrame::Connected);

            send_text(&mut ws, r#"{"t":"dns","h":"slow.test"}"#.to_string()).await;
            let data = tokio::time::timeout(Duration::from_secs(2), next_data(&mut ws))
                .await
                .expect("target bytes waited for the lookup");
            assert_eq!(data, b"tick");

            match next_control(&mut ws).await {
                ServerFrame::Dns {
                    result: None,
                    error: Some(code),
                } => assert_eq!(code, "ETIMEOUT"),
                other => panic!("expected dns error, got {other:?}"),
            }
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn stalled_connect_with_queued_data_times_out() {
    LocalSet::new()
        .run_until(async {
            // Accepts TCP but never answers the TLS handshake.
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let target = listener.local_addr().unwrap();
            tokio::spawn(async move {
                let mut held = Vec::new();
                while let Ok((stream, _)) = listener.accept().await {
                    held.push(stream);
                }
            });

            let relay = relay::start(config(AllowList::default())).await.unwrap();
            let mut ws = open(relay.local_addr, "/tcp-tunnel").await;

            send_text(
                &mut ws,
                format!(r#"{{"t":"c","h":"127.0.0.1","p":{},"tls":true}}"#, target.port()),
            )
            .await;
            let started = Instant::now();
            ws.send(Message::Binary(b"early".to_vec())).await.unwrap();

            let end = tokio::time::timeout(Duration::from_secs(9), ws.next())
                .await
                .expect("channel still open");
            assert!(
                matches!(end, Some(Ok(Message::Close(_))) | Some(Err(_)) | None),
                "{end:?}"
            );

            let waited = started.elapsed();
            assert!(waited >= relay::HANDSHAKE_TIMEOUT - Duration::from_millis(200), "{waited:?}");
            assert!(waited < relay::target::CONNECT_TIMEOUT, "{waited:?}");
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn channel_close_half_closes_target() {
    LocalSet::new()
        .run_until(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let target = listener.local_addr().unwrap();
            let (done_tx, done_rx) = oneshot::channel();
            tokio::spawn(async move {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut received = Vec::new();
                let _ = stream.read_to_end(&mut received).await;
                let eof = Instant::now();

                // Writes keep succeeding until the grace period ends.
                let closed = loop {
                    if stream.write_all(b"late").await.is_err() {
                        break Instant::now();
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                };
                let _ = done_tx.send((received, closed - eof));
            });

            let relay = relay::start(config(AllowList::default())).await.unwrap();
            let mut ws = open(relay.local_addr, "/tcp-tunnel").await;
            connect_frame(&mut ws, "127.0.0.1", target.port()).await;
            assert_eq!(next_control(&mut ws).await, ServerFrame::Connected);

            ws.send(Message::Binary(b"bye".to_vec())).await.unwrap();
            ws.close(None).await.unwrap();

            let (received, open_for) = tokio::time::timeout(Duration::from_secs(10), done_rx)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(received, b"bye");
            assert!(open_for >= relay::CLOSE_GRACE / 2, "{open_for:?}");
            assert!(open_for <= relay::CLOSE_GRACE + Duration::from_secs(2), "{open_for:?}");
        })
        .await;
}
