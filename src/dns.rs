//! DNS message construction and parsing for upstream resolution.

use std::net::Ipv4Addr;

const HEADER_LEN: usize = 12;
const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 253;
/// Bound on compression pointer hops while reading one name.
const MAX_POINTER_HOPS: usize = 16;

pub const TYPE_A: u16 = 1;
pub const TYPE_CNAME: u16 = 5;
const CLASS_IN: u16 = 1;

/// Build a recursive A query for `domain`.
///
/// Returns `None` when the name cannot be encoded.
pub fn build_query(id: u16, domain: &str) -> Option<Vec<u8>> {
    let domain = domain.trim_end_matches('.');
    if domain.is_empty() || domain.len() > MAX_NAME_LEN {
        return None;
    }

    let mut data = Vec::with_capacity(HEADER_LEN + domain.len() + 6);
    data.extend_from_slice(&id.to_be_bytes());
    data.extend_from_slice(&[0x01, 0x00]); // RD
    data.extend_from_slice(&[0x00, 0x01]); // QDCOUNT
    data.extend_from_slice(&[0x00, 0x00]); // ANCOUNT
    data.extend_from_slice(&[0x00, 0x00]); // NSCOUNT
    data.extend_from_slice(&[0x00, 0x00]); // ARCOUNT

    encode_domain(&mut data, domain)?;
    data.extend_from_slice(&TYPE_A.to_be_bytes());
    data.extend_from_slice(&CLASS_IN.to_be_bytes());

    Some(data)
}

fn encode_domain(buf: &mut Vec<u8>, domain: &str) -> Option<()> {
    for label in domain.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return None;
        }
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);
    Some(())
}

/// A parsed DNS response.
#[derive(Debug, Clone)]
pub struct DnsResponse {
    pub id: u16,
    pub rcode: u8,
    pub answers: Vec<ResourceRecord>,
}

/// An answer-section record.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceRecord {
    pub name: String,
    pub rtype: u16,
    pub ttl: u32,
    pub data: RecordData,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordData {
    Address(Ipv4Addr),
    Alias(String),
    Other,
}

impl DnsResponse {
    /// Parse the header and answer section of a response.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_LEN {
            return None;
        }

        let id = u16::from_be_bytes([data[0], data[1]]);
        let flags = u16::from_be_bytes([data[2], data[3]]);
        if flags & 0x8000 == 0 {
            return None;
        }
        let rcode = (flags & 0x000F) as u8;
        let qdcount = u16::from_be_bytes([data[4], data[5]]) as usize;
        let ancount = u16::from_be_bytes([data[6], data[7]]) as usize;

        let mut pos = HEADER_LEN;

        // Skip question section
        for _ in 0..qdcount {
            let (_, next) = read_name(data, pos)?;
            pos = next + 4; // QTYPE + QCLASS
        }

        let mut answers = Vec::with_capacity(ancount);
        for _ in 0..ancount {
            let (name, next) = read_name(data, pos)?;
            pos = next;
            if pos + 10 > data.len() {
                return None;
            }

            let rtype = u16::from_be_bytes([data[pos], data[pos + 1]]);
            let ttl = u32::from_be_bytes([
                data[pos + 4],
                data[pos + 5],
                data[pos + 6],
                data[pos + 7],
            ]);
            let rdlength = u16::from_be_bytes([data[pos + 8], data[pos + 9]]) as usize;
            pos += 10;
            if pos + rdlength > data.len() {
                return None;
            }

            let record_data = match rtype {
                TYPE_A if rdlength == 4 => RecordData::Address(Ipv4Addr::new(
                    data[pos],
                    data[pos + 1],
                    data[pos + 2],
                    data[pos + 3],
                )),
                TYPE_CNAME => RecordData::Alias(read_name(data, pos)?.0),
                _ => RecordData::Other,
            };
            pos += rdlength;

            answers.push(ResourceRecord {
                name,
                rtype,
                ttl,
                data: record_data,
            });
        }

        Some(Self { id, rcode, answers })
    }
}

/// Read a possibly compressed name starting at `pos`.
///
/// Returns the dotted name (no trailing dot) and the offset just past the
/// name in the original position.
fn read_name(data: &[u8], mut pos: usize) -> Option<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut end = None;
    let mut hops = 0;

    loop {
        let len = *data.get(pos)? as usize;
        if len == 0 {
            pos += 1;
            break;
        }
        if len & 0xC0 == 0xC0 {
            let low = *data.get(pos + 1)? as usize;
            if end.is_none() {
                end = Some(pos + 2);
            }
            hops += 1;
            if hops > MAX_POINTER_HOPS {
                return None;
            }
            pos = ((len & 0x3F) << 8) | low;
            continue;
        }
        let label = data.get(pos + 1..pos + 1 + len)?;
        labels.push(String::from_utf8_lossy(label).to_lowercase());
        pos += 1 + len;
    }

    Some((labels.join("."), end.unwrap_or(pos)))
}
