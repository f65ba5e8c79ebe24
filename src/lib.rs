//! sockrelay - TCP over WebSocket for sandboxed guests.
//!
//! The [`relay`] terminates real TCP connections on behalf of WebSocket
//! channel clients. The [`socket`] module is the client half: socket
//! handles for a guest that only has WebSockets and HTTP to work with.

pub mod dns;
pub mod error;
pub mod filter;
pub mod lookup;
pub mod protocol;
pub mod relay;
pub mod socket;
pub mod stats;
