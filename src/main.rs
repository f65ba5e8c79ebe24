use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::error;
use tracing_subscriber::EnvFilter;

use sockrelay::error::Result;
use sockrelay::filter::AllowList;
use sockrelay::relay::{self, DnsResolver, RelayConfig};

#[derive(Parser)]
#[command(name = "sockrelay")]
#[command(about = "TCP-over-WebSocket relay for sandboxed guests", long_about = None)]
struct Args {
    /// Bind address
    #[arg(short, long, env = "TUNNEL_HOST", default_value = "127.0.0.1")]
    bind: String,

    /// Local port to listen on
    #[arg(short, long, env = "TUNNEL_PORT", default_value = "8081")]
    port: u16,

    /// Channel endpoint path
    #[arg(long, env = "TUNNEL_PATH", default_value = relay::DEFAULT_PATH)]
    path: String,

    /// Comma-separated target hosts, `*` for any (empty allows all)
    #[arg(long, env = "TUNNEL_ALLOW_HOSTS", default_value = "")]
    allow_hosts: String,

    /// Comma-separated target ports (empty allows all)
    #[arg(long, env = "TUNNEL_ALLOW_PORTS", default_value = "")]
    allow_ports: String,

    /// UDP DNS server (host:port) for name lookups; system resolver if unset
    #[arg(long, env = "TUNNEL_DNS_UPSTREAM")]
    dns_upstream: Option<SocketAddr>,

    /// Seconds between stats lines, 0 disables
    #[arg(long, default_value = "60")]
    stats_interval: u64,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    if let Err(e) = run(args) {
        error!(error = %e, "relay failed");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let bind_ip: IpAddr = args
        .bind
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let bind_addr = SocketAddr::new(bind_ip, args.port);

    let config = RelayConfig {
        bind_addr,
        path: args.path,
        allow: AllowList::parse(&args.allow_hosts, &args.allow_ports),
        resolver: args
            .dns_upstream
            .map_or(DnsResolver::System, DnsResolver::Upstream),
        tls: relay::default_tls_config()?,
        stats_interval: Duration::from_secs(args.stats_interval),
    };

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let local = tokio::task::LocalSet::new();
    local.block_on(&rt, relay::run(config))
}
