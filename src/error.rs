use std::io;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Reason codes carried in `{"t":"dns","err":..}` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsFailure {
    NotFound,
    NoData,
    ServerFailure,
    Timeout,
    BadName,
}

impl DnsFailure {
    pub fn code(self) -> &'static str {
        match self {
            DnsFailure::NotFound => "ENOTFOUND",
            DnsFailure::NoData => "ENODATA",
            DnsFailure::ServerFailure => "ESERVFAIL",
            DnsFailure::Timeout => "ETIMEOUT",
            DnsFailure::BadName => "EBADNAME",
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("malformed control frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("invalid server name '{0}'")]
    ServerName(String),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("relay error {code}: {msg}")]
    Relay { code: u16, msg: String },
    #[error("tunnel unavailable: {0}")]
    TunnelUnavailable(String),
    #[error("dns lookup failed: {}", .0.code())]
    Dns(DnsFailure),
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("websocket frame of {0} bytes exceeds the limit")]
    FrameTooLarge(u64),
    #[error("channel closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the failure happened before any request bytes could reach
    /// the peer.
    pub fn is_connect(&self) -> bool {
        match self {
            Error::Http(e) => e.is_connect(),
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::NotFound
                    | io::ErrorKind::AddrNotAvailable
            ),
            // The relay answers `err` before it has a target connection.
            Error::Relay { .. } | Error::TunnelUnavailable(_) | Error::ServerName(_) => true,
            _ => false,
        }
    }
}
