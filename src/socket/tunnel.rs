//! Client end of a relay channel.

use std::rc::Rc;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

use super::Shared;
use super::handle::{EventSink, Update};
use crate::error::{Error, Result};
use crate::protocol::{ClientFrame, DnsAnswer, ServerFrame};

/// Reason recorded when no candidate accepts the channel handshake.
pub const HANDSHAKE_FAILED: &str = "WebSocket handshake failed for TCP tunnel";

/// What arrived on the channel.
#[derive(Debug)]
pub enum ChannelEvent {
    Control(ServerFrame),
    Data(Vec<u8>),
    Closed,
}

pub struct TunnelChannel {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    url: String,
}

impl TunnelChannel {
    /// Open a channel on the first candidate that completes the handshake.
    pub async fn open(candidates: &[String]) -> Result<Self> {
        let mut last_error = None;

        for url in candidates {
            match connect_async(url.as_str()).await {
                Ok((ws, _)) => {
                    debug!(%url, "tunnel channel open");
                    return Ok(Self {
                        ws,
                        url: url.clone(),
                    });
                }
                Err(e) => {
                    debug!(%url, error = %e, "tunnel candidate failed");
                    last_error = Some(e);
                }
            }
        }

        Err(Error::TunnelUnavailable(match last_error {
            Some(e) => format!("{HANDSHAKE_FAILED}: {e}"),
            None => HANDSHAKE_FAILED.to_string(),
        }))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn send_control(&mut self, frame: &ClientFrame) -> Result<()> {
        self.ws.send(Message::Text(frame.encode()?)).await?;
        Ok(())
    }

    pub async fn send_data(&mut self, data: Vec<u8>) -> Result<()> {
        self.ws.send(Message::Binary(data)).await?;
        Ok(())
    }

    /// Wait for the next control frame or payload chunk.
    ///
    /// Text that is not a control frame is dropped.
    pub async fn next_event(&mut self) -> ChannelEvent {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str(&text) {
                    Ok(frame) => return ChannelEvent::Control(frame),
                    Err(e) => warn!(url = %self.url, error = %e, "unparseable control frame"),
                },
                Some(Ok(Message::Binary(data))) => return ChannelEvent::Data(data),
                Some(Ok(Message::Close(_))) | None => return ChannelEvent::Closed,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(url = %self.url, error = %e, "tunnel channel failed");
                    return ChannelEvent::Closed;
                }
            }
        }
    }

    pub async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }

    /// Resolve `name` through a short-lived channel.
    ///
    /// `Ok(None)` means the relay answered with a lookup error.
    pub async fn lookup(candidates: &[String], name: &str) -> Result<Option<DnsAnswer>> {
        let mut channel = Self::open(candidates).await?;
        channel.send_control(&ClientFrame::dns(name)).await?;

        let result = loop {
            match channel.next_event().await {
                ChannelEvent::Control(ServerFrame::Dns { result, error }) => {
                    if let Some(code) = error {
                        debug!(name, code = %code, "tunnel lookup failed");
                    }
                    break result;
                }
                ChannelEvent::Control(_) | ChannelEvent::Data(_) => {}
                ChannelEvent::Closed => return Err(Error::Closed),
            }
        };

        channel.close().await;
        Ok(result)
    }
}

/// Carry a socket's raw bytes to `host:port` through the relay.
///
/// A handshake failure on every candidate disables the tunnel for the
/// plugin. An `err` before `ok` is reported as a refusal so the socket can
/// fall back to HTTP. Dropping the sender of `outbound` closes the channel.
pub(crate) async fn drive(
    shared: Rc<Shared>,
    host: String,
    port: u16,
    mut outbound: UnboundedReceiver<Vec<u8>>,
    sink: EventSink,
) {
    let mut channel = match TunnelChannel::open(&shared.config.tunnel_candidates()).await {
        Ok(channel) => channel,
        Err(e) => {
            if let Error::TunnelUnavailable(reason) = &e {
                shared.disable_tunnel(reason.clone());
            }
            sink.emit(Update::Failed(e.to_string()));
            return;
        }
    };

    if let Err(e) = channel.send_control(&ClientFrame::connect(&host, port, false)).await {
        sink.emit(Update::Failed(e.to_string()));
        return;
    }

    let mut opened = false;
    loop {
        tokio::select! {
            event = channel.next_event() => match event {
                ChannelEvent::Control(ServerFrame::Connected) => {
                    debug!(url = %channel.url(), %host, port, "tunnel connected");
                    opened = true;
                    sink.emit(Update::Opened);
                }
                ChannelEvent::Control(ServerFrame::Error { code, msg }) => {
                    let reason = Error::Relay { code, msg }.to_string();
                    sink.emit(if opened {
                        Update::Failed(reason)
                    } else {
                        Update::Refused(reason)
                    });
                    break;
                }
                ChannelEvent::Control(ServerFrame::RemoteClosed) | ChannelEvent::Closed => {
                    sink.emit(Update::Complete);
                    break;
                }
                ChannelEvent::Control(ServerFrame::Dns { .. }) => {}
                ChannelEvent::Data(data) => sink.emit(Update::Data(data)),
            },
            data = outbound.recv() => match data {
                Some(data) => {
                    if let Err(e) = channel.send_data(data).await {
                        sink.emit(Update::Failed(e.to_string()));
                        return;
                    }
                }
                None => break,
            },
        }
    }

    channel.close().await;
}
