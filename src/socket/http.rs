//! HTTP/1.x request reconstruction from a guest byte stream.

/// Methods emulated over HTTP transports.
const SUPPORTED_METHODS: [&str; 3] = ["GET", "PUT", "POST"];

/// A request parsed from the guest's send buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Parse one request from the start of `buf`.
    ///
    /// Returns the request and the bytes consumed, or `None` while the head
    /// or the `Content-Length` body is still incomplete.
    pub fn parse(buf: &[u8]) -> Option<(Self, usize)> {
        let head_end = buf.windows(4).position(|w| w == b"\r\n\r\n")?;
        let head = String::from_utf8_lossy(&buf[..head_end]);

        let mut lines = head.split('\n').map(|l| l.trim_end_matches('\r'));
        let mut request_line = lines.next()?.split(' ').filter(|s| !s.is_empty());
        let method = request_line.next()?.to_string();
        let target = request_line.next().unwrap_or("/").to_string();
        let version = request_line.next().unwrap_or("HTTP/1.0").to_string();

        let headers: Vec<(String, String)> = lines
            .filter_map(|line| {
                let (name, value) = line.split_once(':')?;
                Some((name.trim().to_string(), value.trim().to_string()))
            })
            .collect();

        let body_start = head_end + 4;
        let content_length = headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.parse::<usize>().ok())
            .unwrap_or(0);
        let body_end = body_start.checked_add(content_length)?;
        let body = buf.get(body_start..body_end)?.to_vec();

        Some((
            Self {
                method,
                target,
                version,
                headers,
                body,
            },
            body_end,
        ))
    }

    pub fn is_supported_method(&self) -> bool {
        SUPPORTED_METHODS.contains(&self.method.as_str())
    }

    /// Whether the request may be replayed after a failure that happened
    /// past connection setup.
    pub fn is_idempotent(&self) -> bool {
        self.method != "POST"
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// `Host` header split into name and optional port.
    pub fn host_header(&self) -> Option<(String, Option<u16>)> {
        let value = self.header("host")?;
        let (host, port) = if let Some(rest) = value.strip_prefix('[') {
            let (host, after) = rest.split_once(']')?;
            (host, after.strip_prefix(':').and_then(|p| p.parse::<u16>().ok()))
        } else {
            match value.split_once(':') {
                Some((host, port)) => (host, port.parse::<u16>().ok()),
                None => (value, None),
            }
        };
        if host.is_empty() {
            return None;
        }
        Some((host.to_string(), port))
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        self.method == "GET"
            && self
                .header("connection")
                .is_some_and(|v| v.to_ascii_lowercase().contains("upgrade"))
            && self
                .header("upgrade")
                .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
    }

    /// Re-serialize the request for sending over a raw byte stream.
    pub fn raw_bytes(&self) -> Vec<u8> {
        let mut head = format!("{} {} {}\r\n", self.method, self.target, self.version);
        for (name, value) in &self.headers {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");

        let mut raw = head.into_bytes();
        raw.extend_from_slice(&self.body);
        raw
    }
}

/// Build an HTTP/1.0 response head to prepend to a response body.
pub fn response_head<'a, I>(status: u16, reason: &str, headers: I) -> Vec<u8>
where
    I: IntoIterator<Item = (&'a str, String)>,
{
    let mut head = format!("HTTP/1.0 {status} {reason}\r\n");
    for (name, value) in headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(&value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    head.into_bytes()
}
