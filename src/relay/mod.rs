//! Relay server orchestration.
//!
//! Binds the channel listener and reports statistics.

mod listener;
pub mod resolver;
mod session;
pub mod target;

pub use listener::TunnelListener;
pub use resolver::DnsResolver;
pub use session::{
    CLOSE_GRACE, HANDSHAKE_TIMEOUT, MAX_PENDING_BYTES, MAX_PENDING_FRAMES, PendingQueue,
};

use std::future;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use rustls::RootCertStore;
use tracing::info;

use crate::error::Result;
use crate::filter::AllowList;
use crate::stats::RelayStats;

pub const DEFAULT_PATH: &str = "/tcp-tunnel";

/// Configuration for the relay.
pub struct RelayConfig {
    /// Local address to bind (e.g., 127.0.0.1:8081)
    pub bind_addr: SocketAddr,
    /// Channel endpoint path
    pub path: String,
    pub allow: AllowList,
    pub resolver: DnsResolver,
    /// TLS settings for `tls: true` targets
    pub tls: Arc<rustls::ClientConfig>,
    /// Stats report period, zero disables
    pub stats_interval: Duration,
}

/// State shared by every session of one relay.
pub struct RelayContext {
    pub allow: AllowList,
    pub resolver: DnsResolver,
    pub tls: Arc<rustls::ClientConfig>,
    pub stats: Arc<RelayStats>,
}

/// A started relay.
pub struct RelayHandle {
    pub local_addr: SocketAddr,
    pub stats: Arc<RelayStats>,
}

/// Bind the listener and spawn the accept loop and stats reporter.
///
/// Must be called from within a `LocalSet`.
pub async fn start(config: RelayConfig) -> Result<RelayHandle> {
    let stats = Arc::new(RelayStats::new());
    let paths = channel_paths(&config.path);
    let ctx = Rc::new(RelayContext {
        allow: config.allow,
        resolver: config.resolver,
        tls: config.tls,
        stats: stats.clone(),
    });

    let listener = TunnelListener::bind(config.bind_addr, paths.clone(), ctx.clone()).await?;
    let local_addr = listener.local_addr()?;

    info!(
        addr = %local_addr,
        paths = %paths.join(","),
        allow_hosts = ctx.allow.host_count(),
        allow_ports = ctx.allow.port_count(),
        resolver = ?ctx.resolver,
        "relay listening"
    );

    listener.start();

    if !config.stats_interval.is_zero() {
        tokio::task::spawn_local(report_stats(stats.clone(), config.stats_interval));
    }

    Ok(RelayHandle { local_addr, stats })
}

/// Run the relay with the given configuration. Runs indefinitely.
pub async fn run(config: RelayConfig) -> Result<()> {
    start(config).await?;

    // Keep running forever
    future::pending::<()>().await;

    Ok(())
}

async fn report_stats(stats: Arc<RelayStats>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await; // Skip first immediate tick
    loop {
        interval.tick().await;
        let snapshot = stats.snapshot_and_reset();
        info!(
            sessions = snapshot.sessions,
            rejected = snapshot.rejected,
            dns_queries = snapshot.dns_queries,
            bytes_up = snapshot.bytes_up,
            bytes_down = snapshot.bytes_down,
            "stats"
        );
    }
}

/// Normalize a configured path to start with `/`.
pub fn normalize_path(path: &str) -> String {
    let path = path.trim();
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

/// Paths the channel is accepted on: the configured path plus its `/run`
/// alias.
pub fn channel_paths(path: &str) -> Vec<String> {
    let path = normalize_path(path);
    if path.starts_with("/run/") {
        vec![path]
    } else {
        let alias = format!("/run{path}");
        vec![path, alias]
    }
}

/// TLS settings trusting the bundled web PKI roots.
pub fn default_tls_config() -> Result<Arc<rustls::ClientConfig>> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    tls_config_with_roots(roots)
}

/// TLS settings trusting exactly `roots`.
pub fn tls_config_with_roots(roots: RootCertStore) -> Result<Arc<rustls::ClientConfig>> {
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_root_certificates(roots)
    .with_no_client_auth();

    Ok(Arc::new(config))
}
