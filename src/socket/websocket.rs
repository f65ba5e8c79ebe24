//! Real WebSocket connection behind a guest that frames its own traffic.

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::debug;

use super::handle::{EventSink, Update};
use crate::error::Result;

/// WebSocket URL for an upgrade request aimed at `host:port`.
pub(crate) fn target_url(host: &str, port: u16, target: &str) -> String {
    if port == 443 {
        format!("wss://{host}{target}")
    } else {
        format!("ws://{host}:{port}{target}")
    }
}

/// Run the connection until either side closes it.
///
/// Messages from `outbound` are sent as they are; dropping its sender
/// closes the connection.
pub(crate) async fn drive(
    url: String,
    protocol: Option<String>,
    mut outbound: UnboundedReceiver<Message>,
    sink: EventSink,
) {
    let mut ws = match open(&url, protocol.as_deref()).await {
        Ok(ws) => ws,
        Err(e) => {
            sink.emit(Update::Failed(e.to_string()));
            return;
        }
    };
    sink.emit(Update::Opened);

    loop {
        tokio::select! {
            incoming = ws.next() => match incoming {
                Some(Ok(Message::Text(text))) => sink.emit(Update::Message {
                    payload: text.into_bytes(),
                    binary: false,
                }),
                Some(Ok(Message::Binary(payload))) => sink.emit(Update::Message {
                    payload,
                    binary: true,
                }),
                Some(Ok(Message::Close(_))) | None => {
                    debug!(%url, "websocket closed by peer");
                    sink.emit(Update::Complete);
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    sink.emit(Update::Failed(e.to_string()));
                    return;
                }
            },
            message = outbound.recv() => match message {
                Some(message) => {
                    if let Err(e) = ws.send(message).await {
                        sink.emit(Update::Failed(e.to_string()));
                        return;
                    }
                }
                None => break,
            },
        }
    }

    debug!(%url, "closing websocket");
    let _ = ws.close(None).await;
}

async fn open(
    url: &str,
    protocol: Option<&str>,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
    let mut request = url.into_client_request()?;
    if let Some(protocol) = protocol {
        if let Ok(value) = HeaderValue::from_str(protocol) {
            request.headers_mut().insert("Sec-WebSocket-Protocol", value);
        }
    }

    let (ws, _) = connect_async(request).await?;
    Ok(ws)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secure_port_uses_wss() {
        assert_eq!(target_url("echo.test", 443, "/chat"), "wss://echo.test/chat");
        assert_eq!(target_url("echo.test", 8080, "/chat"), "ws://echo.test:8080/chat");
    }
}
