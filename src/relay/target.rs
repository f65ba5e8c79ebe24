//! Outbound connections to relay targets.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::{Error, Result};

/// Give up on a target after this long, TLS handshake included.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Byte stream to a target, plain TCP or TLS over TCP.
pub trait TargetIo: AsyncRead + AsyncWrite + Unpin {}

impl<T: AsyncRead + AsyncWrite + Unpin> TargetIo for T {}

pub type TargetStream = Box<dyn TargetIo>;

/// Connect to `host:port`, optionally wrapping the stream in TLS.
pub async fn connect(
    host: &str,
    port: u16,
    tls: Option<Arc<rustls::ClientConfig>>,
) -> Result<TargetStream> {
    match tokio::time::timeout(CONNECT_TIMEOUT, open(host, port, tls)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout("target connect")),
    }
}

async fn open(
    host: &str,
    port: u16,
    tls: Option<Arc<rustls::ClientConfig>>,
) -> Result<TargetStream> {
    let stream = connect_tcp(host, port).await?;

    let Some(config) = tls else {
        return Ok(Box::new(stream));
    };

    let server_name =
        ServerName::try_from(host.to_string()).map_err(|_| Error::ServerName(host.into()))?;
    let stream = TlsConnector::from(config).connect(server_name, stream).await?;

    Ok(Box::new(stream))
}

/// Try every resolved address in order, returning the first that connects.
async fn connect_tcp(host: &str, port: u16) -> Result<TcpStream> {
    let mut last_error = None;

    for addr in tokio::net::lookup_host((host, port)).await? {
        match connect_addr(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(%addr, error = %e, "target address failed");
                last_error = Some(e);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses resolved"))
        .into())
}

async fn connect_addr(addr: SocketAddr) -> io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_keepalive(true)?;

    let stream = socket.connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}
