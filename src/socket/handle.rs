//! Guest-visible socket handles.
//!
//! Each handle is a small state machine. Guest calls and transport tasks
//! both funnel through [`HandleInner::update`], which applies a change to
//! the handle state and fires semaphore signals only after the state is
//! released again.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::mem;
use std::net::Ipv4Addr;
use std::rc::{Rc, Weak};

use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::Shared;
use super::frame::{Opcode, decode_frame, encode_frame, handshake_response};
use super::http::HttpRequest;
use super::{fallback, tunnel, websocket};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketStatus {
    Invalid,
    Unconnected,
    WaitingForConnection,
    Connected,
    OtherEndClosed,
    ThisEndClosed,
}

impl SocketStatus {
    /// Status code reported to the guest.
    pub fn code(self) -> i32 {
        match self {
            SocketStatus::Invalid => -1,
            SocketStatus::Unconnected => 0,
            SocketStatus::WaitingForConnection => 1,
            SocketStatus::Connected => 2,
            SocketStatus::OtherEndClosed => 3,
            SocketStatus::ThisEndClosed => 4,
        }
    }
}

/// Progress reported by a transport task.
#[derive(Debug)]
pub(crate) enum Update {
    /// The transport can carry guest bytes.
    Opened,
    /// Bytes for the guest, queued as they are.
    Data(Vec<u8>),
    /// A message to be framed before the guest sees it.
    Message { payload: Vec<u8>, binary: bool },
    /// The source has nothing more to deliver.
    Complete,
    /// The relay turned the target down before connecting it.
    Refused(String),
    Failed(String),
}

/// Routes updates from one transport task back to its handle.
pub(crate) struct EventSink {
    handle: Weak<HandleInner>,
    binding: u64,
}

impl EventSink {
    pub(crate) fn emit(&self, update: Update) {
        if let Some(handle) = self.handle.upgrade() {
            handle.dispatch(self.binding, update);
        }
    }
}

enum Binding {
    None,
    Http {
        id: u64,
        task: JoinHandle<()>,
    },
    Tunnel {
        id: u64,
        tx: UnboundedSender<Vec<u8>>,
        task: JoinHandle<()>,
        open: bool,
    },
    WebSocket {
        id: u64,
        tx: UnboundedSender<Message>,
        task: JoinHandle<()>,
        key: String,
    },
}

impl Binding {
    fn id(&self) -> Option<u64> {
        match self {
            Binding::None => None,
            Binding::Http { id, .. } | Binding::Tunnel { id, .. } | Binding::WebSocket { id, .. } => {
                Some(*id)
            }
        }
    }

    /// Stop the transport.
    ///
    /// Channel transports see their sender dropped and close on their own
    /// unless `abort` is set.
    fn release(self, abort: bool) {
        match self {
            Binding::None => {}
            Binding::Http { task, .. } => task.abort(),
            Binding::Tunnel { task, .. } | Binding::WebSocket { task, .. } => {
                if abort {
                    task.abort();
                }
            }
        }
    }
}

#[derive(Default)]
struct Signals {
    conn: bool,
    read: bool,
    write: bool,
}

struct HandleState {
    status: SocketStatus,
    host: String,
    address: Option<Ipv4Addr>,
    port: u16,
    send_buffer: Vec<u8>,
    /// Bumped on every send; a debounce timer only flushes if it still
    /// matches.
    send_generation: u64,
    responses: VecDeque<Vec<u8>>,
    /// The HTTP source finished delivering.
    response_complete: bool,
    /// A complete response was read to the end.
    drained: bool,
    binding: Binding,
    next_binding: u64,
}

impl HandleState {
    fn take_binding(&mut self) -> Binding {
        mem::replace(&mut self.binding, Binding::None)
    }

    fn next_binding_id(&mut self) -> u64 {
        self.next_binding += 1;
        self.next_binding
    }

    fn push_response(&mut self, data: Vec<u8>, signals: &mut Signals) {
        if !data.is_empty() {
            self.responses.push_back(data);
            signals.read = true;
        }
    }
}

pub(crate) struct HandleInner {
    name: String,
    shared: Rc<Shared>,
    /// Connect, read and write semaphores.
    semaphores: [i32; 3],
    state: RefCell<HandleState>,
    weak_self: Weak<HandleInner>,
}

impl HandleInner {
    fn update<R>(&self, f: impl FnOnce(&mut HandleState, &mut Signals) -> R) -> R {
        let mut signals = Signals::default();
        let result = f(&mut self.state.borrow_mut(), &mut signals);

        let [conn, read, write] = self.semaphores;
        if signals.conn {
            self.shared.signal(conn);
        }
        if signals.read {
            self.shared.signal(read);
        }
        if signals.write {
            self.shared.signal(write);
        }
        result
    }

    fn sink(&self, binding: u64) -> EventSink {
        EventSink {
            handle: self.weak_self.clone(),
            binding,
        }
    }

    fn dispatch(&self, binding: u64, update: Update) {
        self.update(|state, signals| {
            if state.binding.id() != Some(binding) {
                debug!(name = %self.name, binding, "ignoring update from a released transport");
                return;
            }

            match update {
                Update::Opened => self.opened(state, signals),
                Update::Data(data) => state.push_response(data, signals),
                Update::Message { payload, binary } => {
                    state.push_response(encode_frame(&payload, binary), signals)
                }
                Update::Complete => match state.binding {
                    Binding::Http { .. } => {
                        debug!(name = %self.name, "response complete");
                        drop(state.take_binding());
                        state.response_complete = true;
                        state.drained = state.responses.is_empty();
                        signals.read = true;
                    }
                    _ => self.other_end_closed(state, signals),
                },
                Update::Refused(reason) => self.refused(state, signals, reason),
                Update::Failed(reason) => {
                    warn!(name = %self.name, host = %state.host, port = state.port, %reason, "transport failed");
                    self.other_end_closed(state, signals);
                }
            }
        });
    }

    /// Switch a refused tunnel socket to HTTP emulation.
    ///
    /// Buffered bytes are handled as an HTTP request, whose fallback ladder
    /// ends with another relay attempt.
    fn refused(&self, state: &mut HandleState, signals: &mut Signals, reason: String) {
        if !matches!(state.binding, Binding::Tunnel { open: false, .. }) {
            self.other_end_closed(state, signals);
            return;
        }

        info!(name = %self.name, host = %state.host, port = state.port, %reason, "relay refused target, using HTTP");
        drop(state.take_binding());
        state.status = SocketStatus::Connected;
        signals.conn = true;
        signals.write = true;

        if !state.send_buffer.is_empty() {
            self.perform_request(state, signals);
        }
    }

    fn opened(&self, state: &mut HandleState, signals: &mut Signals) {
        let handshake = match &mut state.binding {
            Binding::Tunnel { tx, open, .. } => {
                *open = true;
                if !state.send_buffer.is_empty() {
                    let _ = tx.send(mem::take(&mut state.send_buffer));
                }
                None
            }
            Binding::WebSocket { key, .. } => Some(handshake_response(key)),
            _ => return,
        };

        if state.status != SocketStatus::Connected {
            info!(name = %self.name, host = %state.host, port = state.port, "connected");
            state.status = SocketStatus::Connected;
            signals.conn = true;
            signals.write = true;
        }

        if let Some(handshake) = handshake {
            state.push_response(handshake.into_bytes(), signals);
            self.send_websocket_frames(state, signals);
        }
    }

    fn other_end_closed(&self, state: &mut HandleState, signals: &mut Signals) {
        debug!(name = %self.name, "other end closed");
        drop(state.take_binding());
        state.status = SocketStatus::OtherEndClosed;
        signals.conn = true;
    }

    fn flush_due(&self, generation: u64) {
        let due = self.state.borrow().send_generation == generation;
        if due {
            self.flush();
        }
    }

    fn flush(&self) {
        self.update(|state, signals| {
            if state.status != SocketStatus::Connected || state.send_buffer.is_empty() {
                return;
            }

            match &state.binding {
                Binding::None => self.perform_request(state, signals),
                Binding::Tunnel { tx, open: true, .. } => {
                    let _ = tx.send(mem::take(&mut state.send_buffer));
                }
                Binding::WebSocket { .. } => self.send_websocket_frames(state, signals),
                Binding::Http { .. } | Binding::Tunnel { .. } => {}
            }
        });
    }

    /// Act on the HTTP request at the head of the send buffer.
    fn perform_request(&self, state: &mut HandleState, signals: &mut Signals) {
        let Some((request, used)) = HttpRequest::parse(&state.send_buffer) else {
            debug!(name = %self.name, buffered = state.send_buffer.len(), "request incomplete");
            return;
        };
        state.send_buffer.drain(..used);

        if !request.is_supported_method() {
            warn!(name = %self.name, method = %request.method, "unsupported request method");
            self.other_end_closed(state, signals);
            return;
        }

        if let Some((host, port)) = request.host_header() {
            if host != state.host {
                info!(name = %self.name, from = %state.host, to = %host, "host taken from request");
                state.host = host;
            }
            if let Some(port) = port {
                if port != state.port {
                    info!(name = %self.name, from = state.port, to = port, "port taken from request");
                    state.port = port;
                }
            }
        }

        let id = state.next_binding_id();
        if request.is_websocket_upgrade() {
            let Some(key) = request.header("sec-websocket-key").map(str::to_string) else {
                warn!(name = %self.name, "upgrade request without Sec-WebSocket-Key");
                self.other_end_closed(state, signals);
                return;
            };
            let protocol = request.header("sec-websocket-protocol").map(str::to_string);
            let url = websocket::target_url(&state.host, state.port, &request.target);
            debug!(name = %self.name, %url, "opening websocket");

            let (tx, rx) = mpsc::unbounded_channel();
            let task = tokio::task::spawn_local(websocket::drive(url, protocol, rx, self.sink(id)));
            state.binding = Binding::WebSocket { id, tx, task, key };
        } else {
            debug!(name = %self.name, method = %request.method, path = %request.target, "performing request");
            let task = tokio::task::spawn_local(fallback::run(
                self.shared.clone(),
                request,
                state.host.clone(),
                state.port,
                self.sink(id),
            ));
            state.binding = Binding::Http { id, task };
        }
    }

    /// Decode buffered guest frames and forward their payloads.
    fn send_websocket_frames(&self, state: &mut HandleState, signals: &mut Signals) {
        let Binding::WebSocket { tx, .. } = &state.binding else {
            return;
        };

        let mut consumed = 0;
        let mut close = false;
        let mut rejected = None;
        loop {
            let frame = match decode_frame(&state.send_buffer[consumed..]) {
                Ok(Some((frame, used))) => {
                    consumed += used;
                    frame
                }
                Ok(None) => break,
                Err(e) => {
                    rejected = Some(e);
                    break;
                }
            };
            match frame.opcode {
                Opcode::Text => {
                    let text = String::from_utf8_lossy(&frame.payload).into_owned();
                    let _ = tx.send(Message::Text(text));
                }
                Opcode::Binary => {
                    let _ = tx.send(Message::Binary(frame.payload));
                }
                Opcode::Close => {
                    close = true;
                    break;
                }
                Opcode::Ping | Opcode::Pong => {}
                Opcode::Continuation => {
                    warn!(name = %self.name, "continuation frames are not supported")
                }
                Opcode::Reserved(bits) => {
                    warn!(name = %self.name, opcode = bits, "dropping frame with reserved opcode")
                }
            }
        }
        state.send_buffer.drain(..consumed);

        if let Some(e) = rejected {
            warn!(name = %self.name, error = %e, "dropping websocket");
            state.send_buffer.clear();
            self.other_end_closed(state, signals);
            return;
        }

        if close {
            debug!(name = %self.name, "guest closed websocket");
            drop(state.take_binding());
            state.send_buffer.clear();
            state.status = SocketStatus::ThisEndClosed;
            signals.conn = true;
        }
    }
}

/// A guest socket.
pub struct SocketHandle {
    inner: Rc<HandleInner>,
}

impl SocketHandle {
    pub(crate) fn new(name: String, shared: Rc<Shared>, semaphores: [i32; 3]) -> Self {
        let inner = Rc::new_cyclic(|weak_self| HandleInner {
            name,
            shared,
            semaphores,
            state: RefCell::new(HandleState {
                status: SocketStatus::Unconnected,
                host: String::new(),
                address: None,
                port: 0,
                send_buffer: Vec::new(),
                send_generation: 0,
                responses: VecDeque::new(),
                response_complete: false,
                drained: false,
                binding: Binding::None,
                next_binding: 0,
            }),
            weak_self: weak_self.clone(),
        });

        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn status(&self) -> SocketStatus {
        self.inner.state.borrow().status
    }

    /// Host name the socket talks to, after any `Host:` override.
    pub fn host(&self) -> String {
        self.inner.state.borrow().host.clone()
    }

    pub fn remote_address(&self) -> Option<Ipv4Addr> {
        self.inner.state.borrow().address
    }

    pub fn remote_port(&self) -> u16 {
        self.inner.state.borrow().port
    }

    /// Connect to `address:port`.
    ///
    /// With the tunnel enabled a relay channel is opened and the socket
    /// waits for the relay's acknowledgement. Otherwise, or when the relay
    /// refuses the target, the socket is connected at once and its traffic
    /// is interpreted as HTTP.
    pub fn connect(&self, address: Ipv4Addr, port: u16) {
        let inner = &self.inner;
        let host = inner.shared.lookup.borrow().reverse(address);
        let tunnel = inner.shared.tunnel_enabled();

        inner.update(|state, signals| {
            if state.status == SocketStatus::Invalid {
                return;
            }

            state.take_binding().release(true);
            state.host = host;
            state.address = Some(address);
            state.port = port;
            state.send_buffer.clear();
            state.send_generation += 1;
            state.responses.clear();
            state.response_complete = false;
            state.drained = false;

            if tunnel {
                info!(name = %inner.name, host = %state.host, port, "connecting through tunnel");
                let id = state.next_binding_id();
                let (tx, rx) = mpsc::unbounded_channel();
                let task = tokio::task::spawn_local(tunnel::drive(
                    inner.shared.clone(),
                    state.host.clone(),
                    port,
                    rx,
                    inner.sink(id),
                ));
                state.binding = Binding::Tunnel {
                    id,
                    tx,
                    task,
                    open: false,
                };
                state.status = SocketStatus::WaitingForConnection;
                signals.conn = true;
            } else {
                info!(name = %inner.name, host = %state.host, port, "connected");
                state.status = SocketStatus::Connected;
                signals.conn = true;
                signals.write = true;
            }
        });
    }

    /// Queue bytes for the remote end. Returns the number accepted.
    pub fn send(&self, data: &[u8]) -> usize {
        let inner = &self.inner;
        inner.update(|state, _| {
            if state.status == SocketStatus::Invalid {
                return 0;
            }

            if let Binding::Tunnel { tx, open: true, .. } = &state.binding {
                let _ = tx.send(data.to_vec());
                return data.len();
            }

            state.send_buffer.extend_from_slice(data);
            state.send_generation += 1;

            // Bytes for a pending tunnel go out when it opens.
            if !matches!(state.binding, Binding::Tunnel { .. }) {
                let generation = state.send_generation;
                let delay = inner.shared.config.send_debounce;
                let handle = inner.weak_self.clone();
                tokio::task::spawn_local(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(handle) = handle.upgrade() {
                        handle.flush_due(generation);
                    }
                });
            }
            data.len()
        })
    }

    /// Act on buffered bytes now instead of waiting for the debounce timer.
    pub fn flush(&self) {
        self.inner.flush();
    }

    /// Pop up to `count` bytes from the response queue.
    pub fn recv(&self, count: usize) -> Vec<u8> {
        self.inner.update(|state, _| {
            if state.status == SocketStatus::Invalid {
                return Vec::new();
            }

            let data = match state.responses.front_mut() {
                Some(front) if front.len() > count => {
                    let rest = front.split_off(count);
                    mem::replace(front, rest)
                }
                Some(_) => state.responses.pop_front().unwrap_or_default(),
                None => Vec::new(),
            };

            if state.response_complete && state.responses.is_empty() {
                state.drained = true;
            }
            data
        })
    }

    /// Whether `recv` would return data.
    ///
    /// Once a complete HTTP response has been read to the end the socket
    /// reports the other end closed.
    pub fn data_available(&self) -> bool {
        self.inner.update(|state, signals| match state.status {
            SocketStatus::Invalid
            | SocketStatus::Unconnected
            | SocketStatus::WaitingForConnection => false,
            _ if matches!(state.binding, Binding::WebSocket { .. }) => !state.responses.is_empty(),
            _ if !state.responses.is_empty() => {
                signals.read = true;
                true
            }
            SocketStatus::Connected if state.drained => {
                state.status = SocketStatus::OtherEndClosed;
                signals.conn = true;
                false
            }
            _ => false,
        })
    }

    /// Tear down the transport and return to `Unconnected`.
    ///
    /// Does nothing on a socket that is not connected.
    pub fn close(&self) {
        let inner = &self.inner;
        inner.update(|state, signals| {
            if matches!(
                state.status,
                SocketStatus::Invalid | SocketStatus::Unconnected
            ) {
                return;
            }

            debug!(name = %inner.name, "closing");
            state.take_binding().release(false);
            state.send_buffer.clear();
            state.send_generation += 1;
            state.status = SocketStatus::Unconnected;
            signals.conn = true;
        });
    }

    /// Invalidate the socket without notifying the guest.
    pub fn destroy(&self) {
        let mut state = self.inner.state.borrow_mut();
        state.take_binding().release(true);
        state.send_buffer.clear();
        state.send_generation += 1;
        state.responses.clear();
        state.status = SocketStatus::Invalid;
    }
}
