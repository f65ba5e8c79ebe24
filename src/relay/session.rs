//! Per-channel tunnel session.
//!
//! A session moves through `AwaitingTarget → Connecting → Relaying → Closed`.
//! Before the target is connected, text messages are control frames; after,
//! every message except a DNS request is payload for the target. DNS
//! requests are answered as they resolve, without holding up the pump.

use std::collections::VecDeque;
use std::future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::rc::Rc;
use std::time::Duration;

use futures::future::LocalBoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{Sleep, sleep};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

use super::RelayContext;
use super::target::{self, TargetStream};
use crate::filter::filter_target;
use crate::protocol::{CODE_TARGET_ERROR, ClientFrame, ServerFrame};

/// Force-close a channel whose connect is still pending this long after the
/// first queued data frame.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Time the target gets to finish after the channel closed first.
pub const CLOSE_GRACE: Duration = Duration::from_secs(2);
pub const MAX_PENDING_FRAMES: usize = 64;
pub const MAX_PENDING_BYTES: usize = 1024 * 1024;
const READ_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingTarget,
    Connecting,
    Relaying,
    Closed,
}

/// One inbound channel message, classified for the current phase.
enum Inbound {
    Control(ClientFrame),
    Data(Vec<u8>),
    /// Not a control frame while one was required.
    Invalid,
    Ignore,
    Closed,
}

fn classify(msg: Option<Result<Message, tungstenite::Error>>, phase: Phase) -> Inbound {
    let msg = match msg {
        Some(Ok(msg)) => msg,
        Some(Err(e)) => {
            debug!(error = %e, "channel read failed");
            return Inbound::Closed;
        }
        None => return Inbound::Closed,
    };

    match msg {
        Message::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
            Ok(frame) if phase == Phase::AwaitingTarget => Inbound::Control(frame),
            Ok(frame @ ClientFrame::Dns { .. }) => Inbound::Control(frame),
            _ if phase == Phase::AwaitingTarget => Inbound::Invalid,
            _ => Inbound::Data(text.into_bytes()),
        },
        Message::Binary(_) if phase == Phase::AwaitingTarget => Inbound::Invalid,
        Message::Binary(data) => Inbound::Data(data),
        Message::Close(_) => Inbound::Closed,
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Inbound::Ignore,
    }
}

/// Frames received while the target connect is pending.
///
/// Bounded by frame count and total bytes; frames past either bound are
/// dropped.
#[derive(Debug, Default)]
pub struct PendingQueue {
    frames: VecDeque<Vec<u8>>,
    bytes: usize,
    dropped: usize,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a frame. Returns `false` when it was dropped.
    pub fn push(&mut self, frame: Vec<u8>) -> bool {
        if self.frames.len() >= MAX_PENDING_FRAMES || self.bytes + frame.len() > MAX_PENDING_BYTES
        {
            self.dropped += 1;
            return false;
        }
        self.bytes += frame.len();
        self.frames.push_back(frame);
        true
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Vec<u8>> + '_ {
        self.bytes = 0;
        self.frames.drain(..)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

struct Target {
    host: String,
    port: u16,
    tls: bool,
}

/// A tunnel session bound to one accepted channel.
pub struct TunnelSession<S> {
    ws: WebSocketStream<S>,
    peer: SocketAddr,
    ctx: Rc<RelayContext>,
    phase: Phase,
    pending: PendingQueue,
    /// DNS requests still resolving, answered in completion order.
    lookups: FuturesUnordered<LocalBoxFuture<'static, ServerFrame>>,
    bytes_up: usize,
    bytes_down: usize,
}

impl<S> TunnelSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(ws: WebSocketStream<S>, peer: SocketAddr, ctx: Rc<RelayContext>) -> Self {
        Self {
            ws,
            peer,
            ctx,
            phase: Phase::AwaitingTarget,
            pending: PendingQueue::new(),
            lookups: FuturesUnordered::new(),
            bytes_up: 0,
            bytes_down: 0,
        }
    }

    /// Drive the session until either side closes.
    pub async fn run(mut self) {
        self.ctx.stats.record_session();

        let Some(target) = self.await_target().await else {
            self.close().await;
            return;
        };

        let Some(stream) = self.connect(&target).await else {
            self.close().await;
            return;
        };

        self.relay(stream).await;
        self.close().await;

        info!(
            peer = %self.peer,
            host = %target.host,
            port = target.port,
            tls = target.tls,
            bytes_up = self.bytes_up,
            bytes_down = self.bytes_down,
            "session ended"
        );
    }

    /// Wait for a valid connect frame, answering DNS requests meanwhile.
    async fn await_target(&mut self) -> Option<Target> {
        loop {
            let msg = tokio::select! {
                Some(answer) = self.lookups.next(), if !self.lookups.is_empty() => {
                    self.send_frame(&answer).await;
                    continue;
                }
                msg = self.ws.next() => msg,
            };
            match classify(msg, self.phase) {
                Inbound::Control(ClientFrame::Dns { host }) => self.start_lookup(host),
                Inbound::Control(ClientFrame::Connect { host, port, tls }) => {
                    return match filter_target(&self.ctx.allow, &host, &port) {
                        Ok(port) => {
                            self.phase = Phase::Connecting;
                            Some(Target {
                                host,
                                port,
                                tls: tls.unwrap_or(false),
                            })
                        }
                        Err(rejection) => {
                            warn!(peer = %self.peer, %host, %port, code = rejection.code(), "connect rejected");
                            self.ctx.stats.record_rejected();
                            self.send_frame(&ServerFrame::error(rejection.code(), rejection.message()))
                                .await;
                            None
                        }
                    };
                }
                Inbound::Ignore => {}
                Inbound::Invalid => {
                    debug!(peer = %self.peer, "invalid first frame");
                    return None;
                }
                Inbound::Data(_) | Inbound::Closed => return None,
            }
        }
    }

    /// Open the target while queueing early payload frames.
    async fn connect(&mut self, target: &Target) -> Option<TargetStream> {
        debug!(peer = %self.peer, host = %target.host, port = target.port, tls = target.tls, "connecting");

        let tls = target.tls.then(|| self.ctx.tls.clone());
        let connect = target::connect(&target.host, target.port, tls);
        tokio::pin!(connect);
        let mut deadline: Option<Pin<Box<Sleep>>> = None;

        let stream = loop {
            tokio::select! {
                result = &mut connect => match result {
                    Ok(stream) => break stream,
                    Err(e) => {
                        warn!(peer = %self.peer, host = %target.host, port = target.port, error = %e, "target connect failed");
                        self.send_frame(&ServerFrame::error(CODE_TARGET_ERROR, e.to_string())).await;
                        return None;
                    }
                },
                msg = self.ws.next() => match classify(msg, self.phase) {
                    Inbound::Control(ClientFrame::Dns { host }) => self.start_lookup(host),
                    Inbound::Data(frame) => {
                        if deadline.is_none() {
                            deadline = Some(Box::pin(sleep(HANDSHAKE_TIMEOUT)));
                        }
                        if !self.pending.push(frame) {
                            debug!(peer = %self.peer, dropped = self.pending.dropped(), "pending queue full");
                        }
                    }
                    Inbound::Closed => return None,
                    Inbound::Control(_) | Inbound::Invalid | Inbound::Ignore => {}
                },
                Some(answer) = self.lookups.next(), if !self.lookups.is_empty() => {
                    self.send_frame(&answer).await;
                }
                _ = maybe_sleep(&mut deadline) => {
                    warn!(peer = %self.peer, host = %target.host, "handshake timed out");
                    return None;
                }
            }
        };

        self.send_frame(&ServerFrame::Connected).await;
        self.phase = Phase::Relaying;
        Some(stream)
    }

    async fn relay(&mut self, stream: TargetStream) {
        let (mut reader, mut writer) = tokio::io::split(stream);

        let pending: Vec<Vec<u8>> = self.pending.drain().collect();
        for frame in pending {
            if let Err(e) = writer.write_all(&frame).await {
                self.target_failed(&e).await;
                return;
            }
            self.count_up(frame.len());
        }

        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            tokio::select! {
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        debug!(peer = %self.peer, "target closed");
                        self.send_frame(&ServerFrame::RemoteClosed).await;
                        return;
                    }
                    Ok(n) => {
                        if self.ws.send(Message::Binary(buf[..n].to_vec())).await.is_err() {
                            return;
                        }
                        self.bytes_down += n;
                        self.ctx.stats.record_down(n);
                    }
                    Err(e) => {
                        self.target_failed(&e).await;
                        return;
                    }
                },
                msg = self.ws.next() => match classify(msg, self.phase) {
                    Inbound::Data(frame) => {
                        if let Err(e) = writer.write_all(&frame).await {
                            self.target_failed(&e).await;
                            return;
                        }
                        self.count_up(frame.len());
                    }
                    Inbound::Control(ClientFrame::Dns { host }) => self.start_lookup(host),
                    Inbound::Closed => {
                        debug!(peer = %self.peer, "channel closed, half-closing target");
                        let _ = tokio::time::timeout(CLOSE_GRACE, async {
                            writer.shutdown().await?;
                            let mut sink = tokio::io::sink();
                            tokio::io::copy(&mut reader, &mut sink).await
                        })
                        .await;
                        return;
                    }
                    Inbound::Control(_) | Inbound::Invalid | Inbound::Ignore => {}
                },
                Some(answer) = self.lookups.next(), if !self.lookups.is_empty() => {
                    self.send_frame(&answer).await;
                }
            }
        }
    }

    fn count_up(&mut self, n: usize) {
        self.bytes_up += n;
        self.ctx.stats.record_up(n);
    }

    async fn target_failed(&mut self, e: &std::io::Error) {
        warn!(peer = %self.peer, error = %e, "target error");
        self.send_frame(&ServerFrame::error(CODE_TARGET_ERROR, e.to_string()))
            .await;
    }

    fn start_lookup(&mut self, host: String) {
        self.ctx.stats.record_dns();
        let ctx = self.ctx.clone();
        let peer = self.peer;
        let lookup = async move {
            match ctx.resolver.resolve(&host).await {
                Ok(answer) => ServerFrame::dns_answer(answer),
                Err(failure) => {
                    debug!(%peer, %host, code = failure.code(), "dns lookup failed");
                    ServerFrame::dns_error(failure.code())
                }
            }
        };
        self.lookups.push(lookup.boxed_local());
    }

    async fn send_frame(&mut self, frame: &ServerFrame) {
        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "control frame encoding failed");
                return;
            }
        };
        if let Err(e) = self.ws.send(Message::Text(text)).await {
            debug!(peer = %self.peer, error = %e, "channel send failed");
        }
    }

    async fn close(&mut self) {
        if self.phase == Phase::Closed {
            return;
        }
        self.phase = Phase::Closed;
        let _ = self.ws.close(None).await;
    }
}

async fn maybe_sleep(sleep: &mut Option<Pin<Box<Sleep>>>) {
    match sleep {
        Some(sleep) => sleep.as_mut().await,
        None => future::pending().await,
    }
}
