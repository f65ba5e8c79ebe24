//! Allow-list of relay targets.
//!
//! Built once from the relay configuration and consulted for every connect
//! frame.

use rustc_hash::FxHashSet;

const ANY_HOST: &str = "*";

/// Permitted target hosts and ports.
///
/// An empty host set or port set places no restriction on that dimension.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    hosts: FxHashSet<String>,
    ports: FxHashSet<u16>,
}

impl AllowList {
    pub fn new<H, P>(hosts: H, ports: P) -> Self
    where
        H: IntoIterator,
        H::Item: AsRef<str>,
        P: IntoIterator<Item = u16>,
    {
        Self {
            hosts: hosts
                .into_iter()
                .map(|h| h.as_ref().trim().to_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
            ports: ports.into_iter().filter(|p| *p > 0).collect(),
        }
    }

    /// Parse comma-separated host and port lists.
    ///
    /// Port entries that are not integers in 1..=65535 are skipped.
    pub fn parse(hosts: &str, ports: &str) -> Self {
        let ports = ports
            .split(',')
            .filter_map(|p| p.trim().parse::<u16>().ok());

        Self::new(hosts.split(','), ports)
    }

    /// Check whether `host` may be targeted.
    pub fn host_allowed(&self, host: &str) -> bool {
        if self.hosts.is_empty() || self.hosts.contains(ANY_HOST) {
            return true;
        }
        self.hosts.contains(&host.to_lowercase())
    }

    pub fn port_allowed(&self, port: u16) -> bool {
        self.ports.is_empty() || self.ports.contains(&port)
    }

    /// Returns the number of explicit host entries.
    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    pub fn port_count(&self) -> usize {
        self.ports.len()
    }
}
