//! Control frames exchanged on a tunnel channel.
//!
//! Control frames are JSON text messages tagged by `t`. Payload bytes travel
//! as un-enveloped binary messages and never pass through this module.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Malformed host or port in a connect frame.
pub const CODE_BAD_REQUEST: u16 = 400;
/// Target rejected by the allow-list.
pub const CODE_FORBIDDEN: u16 = 403;
/// Target connection failed or errored.
pub const CODE_TARGET_ERROR: u16 = 500;

/// Frames sent by the guest to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum ClientFrame {
    #[serde(rename = "c")]
    Connect {
        #[serde(rename = "h", default)]
        host: String,
        /// Kept untyped so a bad port is answered with 400 instead of
        /// failing the whole frame.
        #[serde(rename = "p", default)]
        port: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tls: Option<bool>,
    },
    #[serde(rename = "dns")]
    Dns {
        #[serde(rename = "h")]
        host: String,
    },
}

impl ClientFrame {
    pub fn connect(host: impl Into<String>, port: u16, tls: bool) -> Self {
        ClientFrame::Connect {
            host: host.into(),
            port: Value::from(port),
            tls: tls.then_some(true),
        }
    }

    pub fn dns(host: impl Into<String>) -> Self {
        ClientFrame::Dns { host: host.into() }
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Interpret the `p` field of a connect frame.
///
/// Accepts JSON integers and decimal strings; anything outside 1..=65535 is
/// rejected.
pub fn parse_port(value: &Value) -> Option<u16> {
    let port = match value {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    if (1..=65535).contains(&port) {
        u16::try_from(port).ok()
    } else {
        None
    }
}

/// Frames sent by the relay to the guest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum ServerFrame {
    #[serde(rename = "ok")]
    Connected,
    #[serde(rename = "err")]
    Error { code: u16, msg: String },
    #[serde(rename = "rc")]
    RemoteClosed,
    #[serde(rename = "dns")]
    Dns {
        #[serde(rename = "r", default, skip_serializing_if = "Option::is_none")]
        result: Option<DnsAnswer>,
        #[serde(rename = "err", default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl ServerFrame {
    pub fn error(code: u16, msg: impl Into<String>) -> Self {
        ServerFrame::Error {
            code,
            msg: msg.into(),
        }
    }

    pub fn dns_answer(answer: DnsAnswer) -> Self {
        ServerFrame::Dns {
            result: Some(answer),
            error: None,
        }
    }

    pub fn dns_error(code: impl Into<String>) -> Self {
        ServerFrame::Dns {
            result: None,
            error: Some(code.into()),
        }
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// DNS-over-HTTPS style answer set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsAnswer {
    #[serde(rename = "Status")]
    pub status: u32,
    #[serde(rename = "Question", default)]
    pub question: Vec<DnsQuestion>,
    #[serde(rename = "Answer", default)]
    pub answer: Vec<DnsRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsQuestion {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub rtype: u16,
    #[serde(rename = "TTL", default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u32>,
    pub data: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn connect_frame_wire_shape() {
        let text = ClientFrame::connect("1.2.3.4", 80, false).encode().unwrap();

        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"t": "c", "h": "1.2.3.4", "p": 80}));
    }

    #[test]
    fn connect_frame_with_tls_flag() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"t":"c","h":"example.com","p":443,"tls":true}"#).unwrap();

        assert_eq!(frame, ClientFrame::connect("example.com", 443, true));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"t":"x"}"#).is_err());
        assert!(serde_json::from_str::<ClientFrame>("not json").is_err());
    }

    #[test]
    fn parse_port_bounds() {
        assert_eq!(parse_port(&json!(80)), Some(80));
        assert_eq!(parse_port(&json!("8080")), Some(8080));
        assert_eq!(parse_port(&json!(65535)), Some(65535));
        assert_eq!(parse_port(&json!(0)), None);
        assert_eq!(parse_port(&json!(65536)), None);
        assert_eq!(parse_port(&json!(-1)), None);
        assert_eq!(parse_port(&json!(80.5)), None);
        assert_eq!(parse_port(&Value::Null), None);
    }

    #[test]
    fn server_frames_encode_compactly() {
        assert_eq!(ServerFrame::Connected.encode().unwrap(), r#"{"t":"ok"}"#);
        assert_eq!(ServerFrame::RemoteClosed.encode().unwrap(), r#"{"t":"rc"}"#);
        assert_eq!(
            ServerFrame::error(403, "forbidden").encode().unwrap(),
            r#"{"t":"err","code":403,"msg":"forbidden"}"#
        );
        assert_eq!(
            ServerFrame::dns_error("ENOTFOUND").encode().unwrap(),
            r#"{"t":"dns","err":"ENOTFOUND"}"#
        );
    }

    #[test]
    fn dns_answer_uses_doh_field_names() {
        let frame = ServerFrame::dns_answer(DnsAnswer {
            status: 0,
            question: vec![DnsQuestion {
                name: "example.com".into(),
            }],
            answer: vec![DnsRecord {
                name: "example.com".into(),
                rtype: 1,
                ttl: Some(300),
                data: "93.184.216.34".into(),
            }],
        });

        let value: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "t": "dns",
                "r": {
                    "Status": 0,
                    "Question": [{"name": "example.com"}],
                    "Answer": [{"name": "example.com", "type": 1, "TTL": 300, "data": "93.184.216.34"}]
                }
            })
        );
    }
}
