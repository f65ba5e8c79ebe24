//! Channel listener.
//!
//! Accepts TCP connections, performs the WebSocket upgrade on the configured
//! channel paths, and hands each channel to its own session task.

use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, error, warn};

use super::RelayContext;
use super::session::TunnelSession;

/// Channel listener for the relay.
///
/// Each accepted connection is upgraded and run in a separate task.
pub struct TunnelListener {
    listener: TcpListener,
    paths: Rc<[String]>,
    ctx: Rc<RelayContext>,
}

impl TunnelListener {
    /// Bind a TCP listener for the relay.
    pub async fn bind(
        addr: SocketAddr,
        paths: Vec<String>,
        ctx: Rc<RelayContext>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;

        Ok(Self {
            listener,
            paths: paths.into(),
            ctx,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Start accepting channels.
    ///
    /// Spawns an accept loop that handles each connection in a separate task.
    pub fn start(self) {
        tokio::task::spawn_local(run_accept_loop(self.listener, self.paths, self.ctx));
    }
}

/// Accept loop - spawns a handler task for each incoming connection.
async fn run_accept_loop(listener: TcpListener, paths: Rc<[String]>, ctx: Rc<RelayContext>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tokio::task::spawn_local(handle_connection(
                    stream,
                    peer,
                    paths.clone(),
                    ctx.clone(),
                ));
            }
            Err(e) => {
                error!(error = %e, "accept failed");
            }
        }
    }
}

/// Upgrade one connection and run its session.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    paths: Rc<[String]>,
    ctx: Rc<RelayContext>,
) {
    let _ = stream.set_nodelay(true);

    let check_path = |request: &Request, response: Response| {
        let path = request.uri().path();
        if paths.iter().any(|p| p == path) {
            Ok(response)
        } else {
            warn!(%peer, path, "upgrade on unknown path");
            Err(not_found())
        }
    };

    let ws = match accept_hdr_async(stream, check_path).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%peer, error = %e, "channel handshake failed");
            return;
        }
    };

    debug!(%peer, "channel open");
    TunnelSession::new(ws, peer, ctx).run().await;
}

fn not_found() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("not found".to_string()));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}
