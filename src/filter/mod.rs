//! Connect-frame validation.
//!
//! Decides whether a requested target may be opened, mapping failures to
//! the error codes sent back on the channel.

mod allowlist;

pub use allowlist::AllowList;

use serde_json::Value;

use crate::protocol::{CODE_BAD_REQUEST, CODE_FORBIDDEN, parse_port};

/// Why a connect frame was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Empty host or a port outside 1..=65535.
    BadRequest,
    /// Host or port not on the allow-list.
    Forbidden,
}

impl Rejection {
    pub fn code(self) -> u16 {
        match self {
            Rejection::BadRequest => CODE_BAD_REQUEST,
            Rejection::Forbidden => CODE_FORBIDDEN,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Rejection::BadRequest => "bad host/port",
            Rejection::Forbidden => "forbidden",
        }
    }
}

/// Validate a connect target against the allow-list.
///
/// Returns the parsed port when the target may be opened.
pub fn filter_target(allow: &AllowList, host: &str, port: &Value) -> Result<u16, Rejection> {
    let port = match parse_port(port) {
        Some(p) if !host.is_empty() => p,
        _ => return Err(Rejection::BadRequest),
    };

    if !allow.host_allowed(host) || !allow.port_allowed(port) {
        return Err(Rejection::Forbidden);
    }

    Ok(port)
}
