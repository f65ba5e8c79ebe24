//! Name lookup cache with TTL-based expiration.

use rustc_hash::FxHashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use crate::dns::{TYPE_A, TYPE_CNAME};
use crate::protocol::DnsAnswer;

struct LookupEntry {
    address: Ipv4Addr,
    /// `None` never expires.
    valid_until: Option<Instant>,
    /// Insertion order; kept when an entry is refreshed.
    sequence: u64,
}

/// Name → IPv4 address cache fed by DNS answers.
///
/// `localhost` is seeded at construction and never expires.
pub struct LookupCache {
    entries: FxHashMap<String, LookupEntry>,
    default_ttl: Duration,
    next_sequence: u64,
}

impl LookupCache {
    pub fn new() -> Self {
        let mut entries = FxHashMap::default();
        entries.insert(
            "localhost".to_string(),
            LookupEntry {
                address: Ipv4Addr::LOCALHOST,
                valid_until: None,
                sequence: 0,
            },
        );

        Self {
            entries,
            default_ttl: Duration::from_secs(24 * 60 * 60),
            next_sequence: 1,
        }
    }

    /// Resolve `name` from a dotted-decimal literal or the cache.
    ///
    /// Expired entries are only returned when `allow_stale` is set.
    pub fn get(&self, name: &str, allow_stale: bool) -> Option<Ipv4Addr> {
        if let Some(address) = parse_dotted(name) {
            return Some(address);
        }

        let entry = self.entries.get(name)?;
        match entry.valid_until {
            Some(until) if !allow_stale && Instant::now() > until => None,
            _ => Some(entry.address),
        }
    }

    /// Cache `address` for `name`, replacing any previous entry.
    pub fn insert(&mut self, name: &str, address: Ipv4Addr, ttl: Duration) {
        let sequence = match self.entries.get(name) {
            Some(entry) => entry.sequence,
            None => {
                self.next_sequence += 1;
                self.next_sequence
            }
        };
        self.entries.insert(
            name.to_string(),
            LookupEntry {
                address,
                valid_until: Some(Instant::now() + ttl),
                sequence,
            },
        );
    }

    /// Store the address found in a DNS answer set.
    ///
    /// Follows the CNAME chain from the queried name to the first A record,
    /// keeping the shortest TTL seen on the way, and caches the address
    /// under the queried name.
    pub fn insert_answer(&mut self, answer: &DnsAnswer) -> Option<Ipv4Addr> {
        if answer.status != 0 {
            return None;
        }
        let question = strip_dot(&answer.question.first()?.name);

        let mut lookup = question.to_string();
        let mut ttl = self.default_ttl;
        let mut address = None;

        for record in &answer.answer {
            if !strip_dot(&record.name).eq_ignore_ascii_case(&lookup) {
                continue;
            }
            if let Some(record_ttl) = record.ttl.filter(|t| *t > 0) {
                ttl = ttl.min(Duration::from_secs(record_ttl.into()));
            }
            match record.rtype {
                TYPE_A => {
                    address = strip_dot(&record.data).parse::<Ipv4Addr>().ok();
                    break;
                }
                TYPE_CNAME => lookup = strip_dot(&record.data).to_string(),
                _ => {}
            }
        }

        let address = address?;
        self.insert(question, address, ttl);
        Some(address)
    }

    /// Find a cached name for `address`, falling back to dotted decimal.
    ///
    /// When several names share the address the earliest cached one wins.
    pub fn reverse(&self, address: Ipv4Addr) -> String {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.address == address)
            .min_by_key(|(_, entry)| entry.sequence)
            .map(|(name, _)| name.clone())
            .unwrap_or_else(|| address.to_string())
    }

    /// Expiry of the entry for `name`, if any. `None` for permanent entries.
    pub fn valid_until(&self, name: &str) -> Option<Instant> {
        self.entries.get(name)?.valid_until
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for LookupCache {
    fn default() -> Self {
        Self::new()
    }
}

fn strip_dot(name: &str) -> &str {
    name.strip_suffix('.').unwrap_or(name)
}

/// Parse `a.b.c.d` with every octet at most 255.
///
/// Leading zeros are accepted, unlike `Ipv4Addr::from_str`.
pub fn parse_dotted(name: &str) -> Option<Ipv4Addr> {
    let mut octets = [0u8; 4];
    let mut parts = name.split('.');
    for octet in &mut octets {
        let part = parts.next()?;
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        *octet = u8::try_from(part.parse::<u32>().ok()?).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(Ipv4Addr::from(octets))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DnsQuestion, DnsRecord};

    fn record(name: &str, rtype: u16, ttl: Option<u32>, data: &str) -> DnsRecord {
        DnsRecord {
            name: name.into(),
            rtype,
            ttl,
            data: data.into(),
        }
    }

    fn answer(question: &str, records: Vec<DnsRecord>) -> DnsAnswer {
        DnsAnswer {
            status: 0,
            question: vec![DnsQuestion {
                name: question.into(),
            }],
            answer: records,
        }
    }

    #[test]
    fn localhost_is_always_resolvable() {
        let cache = LookupCache::new();

        assert_eq!(cache.get("localhost", false), Some(Ipv4Addr::LOCALHOST));
        assert_eq!(cache.valid_until("localhost"), None);
    }

    #[test]
    fn dotted_decimal_short_circuits() {
        let cache = LookupCache::new();

        assert_eq!(cache.get("1.2.3.4", false), Some(Ipv4Addr::new(1, 2, 3, 4)));
        assert_eq!(cache.get("010.0.0.1", false), Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(cache.get("1.2.3.256", false), None);
        assert_eq!(cache.get("1.2.3", false), None);
        assert_eq!(cache.get("1.2.3.4.5", false), None);
    }

    #[test]
    fn follows_cname_chain_with_minimum_ttl() {
        let mut cache = LookupCache::new();
        let before = Instant::now();

        let address = cache.insert_answer(&answer(
            "www.example.com.",
            vec![
                record("www.example.com.", TYPE_CNAME, Some(600), "edge.example.net."),
                record("unrelated.test", TYPE_A, Some(5), "9.9.9.9"),
                record("edge.example.net.", TYPE_A, Some(60), "93.184.216.34"),
            ],
        ));

        assert_eq!(address, Some(Ipv4Addr::new(93, 184, 216, 34)));
        assert_eq!(
            cache.get("www.example.com", false),
            Some(Ipv4Addr::new(93, 184, 216, 34))
        );
        assert!(cache.get("edge.example.net", false).is_none());

        let until = cache.valid_until("www.example.com").unwrap();
        assert!(until >= before + Duration::from_secs(60));
        assert!(until <= Instant::now() + Duration::from_secs(60));
    }

    #[test]
    fn missing_ttl_defaults_to_one_day() {
        let mut cache = LookupCache::new();
        let before = Instant::now();

        cache.insert_answer(&answer("example.com", vec![record("example.com", TYPE_A, None, "1.1.1.1")]));

        let until = cache.valid_until("example.com").unwrap();
        assert!(until >= before + Duration::from_secs(86400));
    }

    #[test]
    fn answers_without_address_are_not_cached() {
        let mut cache = LookupCache::new();

        let dangling = answer(
            "a.test",
            vec![record("a.test", TYPE_CNAME, Some(30), "b.test")],
        );
        assert_eq!(cache.insert_answer(&dangling), None);

        let mut failed = answer("c.test", vec![record("c.test", TYPE_A, Some(30), "1.1.1.1")]);
        failed.status = 3;
        assert_eq!(cache.insert_answer(&failed), None);

        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn expired_entries_need_stale_read() {
        let mut cache = LookupCache::new();
        cache.insert("short.test", Ipv4Addr::new(5, 6, 7, 8), Duration::ZERO);
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(cache.get("short.test", false), None);
        assert_eq!(cache.get("short.test", true), Some(Ipv4Addr::new(5, 6, 7, 8)));
    }

    #[test]
    fn repeated_resolution_overwrites() {
        let mut cache = LookupCache::new();
        cache.insert("host.test", Ipv4Addr::new(1, 1, 1, 1), Duration::from_secs(10));
        cache.insert("host.test", Ipv4Addr::new(2, 2, 2, 2), Duration::from_secs(10));

        assert_eq!(cache.get("host.test", false), Some(Ipv4Addr::new(2, 2, 2, 2)));
    }

    #[test]
    fn reverse_lookup_prefers_cached_name() {
        let mut cache = LookupCache::new();
        cache.insert("squeak.org", Ipv4Addr::new(1, 2, 3, 4), Duration::from_secs(10));

        assert_eq!(cache.reverse(Ipv4Addr::new(1, 2, 3, 4)), "squeak.org");
        assert_eq!(cache.reverse(Ipv4Addr::LOCALHOST), "localhost");
        assert_eq!(cache.reverse(Ipv4Addr::new(8, 8, 4, 4)), "8.8.4.4");
    }

    #[test]
    fn reverse_lookup_returns_first_cached_name() {
        let mut cache = LookupCache::new();
        let shared = Ipv4Addr::new(93, 184, 216, 34);
        for name in ["zeta.test", "alpha.test", "mid.test", "beta.test"] {
            cache.insert(name, shared, Duration::from_secs(10));
        }
        // Refreshing an entry keeps its place.
        cache.insert("zeta.test", shared, Duration::from_secs(20));

        assert_eq!(cache.reverse(shared), "zeta.test");

        cache.insert("localhost.alias", Ipv4Addr::LOCALHOST, Duration::from_secs(10));
        assert_eq!(cache.reverse(Ipv4Addr::LOCALHOST), "localhost");
    }
}
