//! Name resolution for `{"t":"dns"}` requests.
//!
//! Answers are shaped like DNS-over-HTTPS JSON so the guest can feed them
//! straight into its lookup cache.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::debug;

use crate::dns::{self, DnsResponse, RecordData, TYPE_A};
use crate::error::DnsFailure;
use crate::protocol::{DnsAnswer, DnsQuestion, DnsRecord};

/// Maximum size of a DNS packet (with some headroom).
const MAX_DNS_PACKET_SIZE: usize = 4096;
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);
/// TTL reported for system resolver answers, which carry none.
const SYSTEM_TTL: u32 = 86400;
const MAX_NAME_LEN: usize = 253;

/// Where `dns` requests are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsResolver {
    /// The operating system resolver.
    System,
    /// A plain UDP DNS server.
    Upstream(SocketAddr),
}

impl DnsResolver {
    /// Resolve A records for `name`.
    pub async fn resolve(&self, name: &str) -> Result<DnsAnswer, DnsFailure> {
        let name = name.trim().trim_end_matches('.');
        if !valid_name(name) {
            return Err(DnsFailure::BadName);
        }

        match self {
            DnsResolver::System => resolve_system(name).await,
            DnsResolver::Upstream(server) => {
                match tokio::time::timeout(UPSTREAM_TIMEOUT, resolve_upstream(name, *server)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(DnsFailure::Timeout),
                }
            }
        }
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && !name
            .bytes()
            .any(|b| b.is_ascii_whitespace() || b.is_ascii_control() || b == b'/')
}

async fn resolve_system(name: &str) -> Result<DnsAnswer, DnsFailure> {
    let addrs = tokio::net::lookup_host((name, 0))
        .await
        .map_err(|e| {
            debug!(name, error = %e, "system lookup failed");
            DnsFailure::NotFound
        })?;

    let mut seen = Vec::new();
    for addr in addrs {
        if let IpAddr::V4(v4) = addr.ip() {
            if !seen.contains(&v4) {
                seen.push(v4);
            }
        }
    }
    if seen.is_empty() {
        return Err(DnsFailure::NoData);
    }

    Ok(DnsAnswer {
        status: 0,
        question: vec![DnsQuestion { name: name.into() }],
        answer: seen
            .into_iter()
            .map(|address| DnsRecord {
                name: name.into(),
                rtype: TYPE_A,
                ttl: Some(SYSTEM_TTL),
                data: address.to_string(),
            })
            .collect(),
    })
}

async fn resolve_upstream(name: &str, server: SocketAddr) -> Result<DnsAnswer, DnsFailure> {
    let id = rand::random::<u16>();
    let query = dns::build_query(id, name).ok_or(DnsFailure::BadName)?;

    let local: SocketAddr = if server.is_ipv4() {
        "0.0.0.0:0"
    } else {
        "[::]:0"
    }
    .parse()
    .map_err(|_| DnsFailure::ServerFailure)?;

    let socket = UdpSocket::bind(local).await.map_err(server_failure)?;
    socket.send_to(&query, server).await.map_err(server_failure)?;

    let mut buf = [0u8; MAX_DNS_PACKET_SIZE];
    let response = loop {
        let (len, from) = socket.recv_from(&mut buf).await.map_err(server_failure)?;
        if from.ip() != server.ip() {
            continue;
        }
        match DnsResponse::parse(&buf[..len]) {
            Some(response) if response.id == id => break response,
            _ => continue,
        }
    };

    answer_from_response(name, response)
}

fn server_failure(e: std::io::Error) -> DnsFailure {
    debug!(error = %e, "upstream dns exchange failed");
    DnsFailure::ServerFailure
}

fn answer_from_response(name: &str, response: DnsResponse) -> Result<DnsAnswer, DnsFailure> {
    match response.rcode {
        0 => {}
        3 => return Err(DnsFailure::NotFound),
        _ => return Err(DnsFailure::ServerFailure),
    }

    let answer: Vec<DnsRecord> = response
        .answers
        .into_iter()
        .filter_map(|record| {
            let data = match record.data {
                RecordData::Address(address) => address.to_string(),
                RecordData::Alias(target) => target,
                RecordData::Other => return None,
            };
            Some(DnsRecord {
                name: record.name,
                rtype: record.rtype,
                ttl: Some(record.ttl),
                data,
            })
        })
        .collect();

    if !answer.iter().any(|r| r.rtype == TYPE_A) {
        return Err(DnsFailure::NoData);
    }

    Ok(DnsAnswer {
        status: 0,
        question: vec![DnsQuestion { name: name.into() }],
        answer,
    })
}
