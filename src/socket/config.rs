//! Guest-side configuration.

use std::time::Duration;

use url::Url;

/// Last-resort channel path on the page's own host.
const FALLBACK_TUNNEL_PATH: &str = "/tcp-tunnel";
const DEFAULT_TUNNEL_NAME: &str = "tcp-tunnel";

#[derive(Debug, Clone)]
pub struct GuestConfig {
    /// URL of the page hosting the guest; tunnel paths resolve against it.
    pub origin: Url,
    /// Relative or absolute channel path, or a full `ws(s)://` URL.
    pub tunnel_path: Option<String>,
    pub enable_tunnel: bool,
    /// Prefix prepended to target URLs for proxied HTTP tiers.
    pub cors_proxy: String,
    /// Add `X-Requested-With: XMLHttpRequest` to emulated HTTP requests.
    pub ajax: bool,
    /// Quiet period after the last send before buffered bytes are acted on.
    pub send_debounce: Duration,
}

impl GuestConfig {
    pub fn new(origin: Url) -> Self {
        Self {
            origin,
            tunnel_path: None,
            enable_tunnel: true,
            cors_proxy: "https://corsproxy.io/?".to_string(),
            ajax: false,
            send_debounce: Duration::from_millis(50),
        }
    }

    /// Channel URLs to try in order.
    ///
    /// The configured location comes first; `/tcp-tunnel` on the page's
    /// host is always the last candidate.
    pub fn tunnel_candidates(&self) -> Vec<String> {
        let scheme = if self.origin.scheme() == "https" {
            "wss"
        } else {
            "ws"
        };
        let host = page_host(&self.origin);

        let primary = match self.tunnel_path.as_deref() {
            Some(path) if is_ws_url(path) => path.to_string(),
            path => {
                let rel = path.filter(|p| !p.is_empty()).unwrap_or(DEFAULT_TUNNEL_NAME);
                let full = if rel.starts_with('/') {
                    rel.to_string()
                } else {
                    format!("{}{}", directory_of(self.origin.path()), rel)
                };
                format!("{scheme}://{host}{full}")
            }
        };

        let fallback = format!("{scheme}://{host}{FALLBACK_TUNNEL_PATH}");
        if primary == fallback {
            vec![primary]
        } else {
            vec![primary, fallback]
        }
    }
}

fn is_ws_url(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    lower.starts_with("ws://") || lower.starts_with("wss://")
}

/// Host with an explicit port, as shown in the address bar.
fn page_host(url: &Url) -> String {
    let host = url.host_str().unwrap_or("localhost");
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

fn directory_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[..=i],
        None => "/",
    }
}
