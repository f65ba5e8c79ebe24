//! HTTP transports for sockets without a tunnel.
//!
//! A request is tried on each [`Tier`] of a ladder in turn until one of
//! them produces a response. Every tier hands the guest an HTTP/1.0
//! response head followed by the body.

use std::rc::Rc;

use reqwest::{Method, Response};
use tracing::{debug, info, warn};

use super::Shared;
use super::handle::{EventSink, Update};
use super::http::{HttpRequest, response_head};
use super::tunnel::{ChannelEvent, TunnelChannel};
use crate::error::Error;
use crate::protocol::{ClientFrame, ServerFrame};

/// Request headers the client library sets itself.
const HOP_BY_HOP: [&str; 9] = [
    "host",
    "connection",
    "content-length",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Streaming request with the guest's headers.
    Fetch,
    FetchViaProxy,
    /// Buffered request carrying only the content type.
    Xhr,
    XhrViaProxy,
    /// Raw request bytes over a relay channel.
    Tunnel,
}

impl Tier {
    fn via_proxy(self) -> bool {
        matches!(self, Tier::FetchViaProxy | Tier::XhrViaProxy)
    }
}

/// Tiers to try, in order.
///
/// Targets already known to need the proxy skip the direct tiers.
pub fn ladder(needs_proxy: bool, tunnel: bool) -> Vec<Tier> {
    let mut tiers = if needs_proxy {
        vec![Tier::FetchViaProxy, Tier::XhrViaProxy]
    } else {
        vec![Tier::Fetch, Tier::FetchViaProxy, Tier::Xhr, Tier::XhrViaProxy]
    };
    if tunnel {
        tiers.push(Tier::Tunnel);
    }
    tiers
}

/// Target URL for a request, optionally behind the CORS proxy prefix.
pub(crate) fn tier_url(proxy: Option<&str>, host: &str, port: u16, target: &str) -> String {
    let direct = if port == 443 {
        format!("https://{host}{target}")
    } else {
        format!("http://{host}:{port}{target}")
    };

    match proxy {
        Some(prefix) => format!("{prefix}{direct}"),
        None => direct,
    }
}

#[derive(Debug)]
enum TierFailure {
    /// Nothing reached the guest yet.
    Retryable(Error),
    /// Part of the response was already delivered.
    Interrupted(Error),
}

impl TierFailure {
    /// Whether the next tier may run after this failure.
    ///
    /// Non-idempotent requests only move on when the failed tier never
    /// got a connection, so the request cannot have been executed.
    fn allows_retry(&self, request: &HttpRequest) -> bool {
        match self {
            TierFailure::Retryable(e) => request.is_idempotent() || e.is_connect(),
            TierFailure::Interrupted(_) => false,
        }
    }

    fn error(&self) -> &Error {
        match self {
            TierFailure::Retryable(e) | TierFailure::Interrupted(e) => e,
        }
    }
}

/// Perform `request` against `host:port`, reporting to `sink`.
pub(crate) async fn run(
    shared: Rc<Shared>,
    request: HttpRequest,
    host: String,
    port: u16,
    sink: EventSink,
) {
    let key = format!("{host}:{port}");
    let tiers = ladder(shared.needs_proxy(&key), shared.tunnel_enabled());

    let mut last_failure: Option<TierFailure> = None;
    for tier in tiers {
        if let Some(failure) = &last_failure {
            if !failure.allows_retry(&request) {
                info!(method = %request.method, path = %request.target, "not retrying request");
                break;
            }
        }

        let proxy = tier.via_proxy().then_some(shared.config.cors_proxy.as_str());
        let url = tier_url(proxy, &host, port, &request.target);
        debug!(?tier, %url, "trying transport");

        let result = match tier {
            Tier::Fetch | Tier::FetchViaProxy => fetch(&shared, &request, &url, &sink).await,
            Tier::Xhr | Tier::XhrViaProxy => xhr(&shared, &request, &url, &sink).await,
            Tier::Tunnel => raw_over_tunnel(&shared, &request, &host, port, &sink).await,
        };

        match result {
            Ok(()) => {
                if tier.via_proxy() {
                    info!(host = %key, "remembering that target needs the proxy");
                    shared.mark_needs_proxy(key);
                }
                sink.emit(Update::Complete);
                return;
            }
            Err(failure) => {
                warn!(?tier, %url, error = %failure.error(), "transport failed");
                last_failure = Some(failure);
            }
        }
    }

    let reason = match last_failure {
        Some(failure) => failure.error().to_string(),
        None => "no transport available".to_string(),
    };
    sink.emit(Update::Failed(reason));
}

fn method(request: &HttpRequest) -> Method {
    match request.method.as_str() {
        "PUT" => Method::PUT,
        "POST" => Method::POST,
        _ => Method::GET,
    }
}

fn head_of(response: &Response) -> Vec<u8> {
    let status = response.status();
    response_head(
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        response.headers().iter().map(|(name, value)| {
            (
                name.as_str(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        }),
    )
}

async fn fetch(
    shared: &Shared,
    request: &HttpRequest,
    url: &str,
    sink: &EventSink,
) -> Result<(), TierFailure> {
    let mut builder = shared.http.request(method(request), url);
    for (name, value) in &request.headers {
        if !HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            builder = builder.header(name.as_str(), value.as_str());
        }
    }
    if shared.config.ajax {
        builder = builder.header("X-Requested-With", "XMLHttpRequest");
    }
    if !request.body.is_empty() {
        builder = builder.body(request.body.clone());
    }

    let mut response = builder
        .send()
        .await
        .map_err(|e| TierFailure::Retryable(e.into()))?;
    sink.emit(Update::Data(head_of(&response)));

    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| TierFailure::Interrupted(e.into()))?
    {
        sink.emit(Update::Data(chunk.to_vec()));
    }
    Ok(())
}

async fn xhr(
    shared: &Shared,
    request: &HttpRequest,
    url: &str,
    sink: &EventSink,
) -> Result<(), TierFailure> {
    let mut builder = shared.http.request(method(request), url);
    if let Some(content_type) = request.header("content-type") {
        builder = builder.header("Content-Type", content_type);
    }
    if shared.config.ajax {
        builder = builder.header("X-Requested-With", "XMLHttpRequest");
    }
    if !request.body.is_empty() {
        builder = builder.body(request.body.clone());
    }

    let response = builder
        .send()
        .await
        .map_err(|e| TierFailure::Retryable(e.into()))?;
    let mut message = head_of(&response);
    let body = response
        .bytes()
        .await
        .map_err(|e| TierFailure::Retryable(e.into()))?;
    message.extend_from_slice(&body);

    sink.emit(Update::Data(message));
    Ok(())
}

async fn raw_over_tunnel(
    shared: &Shared,
    request: &HttpRequest,
    host: &str,
    port: u16,
    sink: &EventSink,
) -> Result<(), TierFailure> {
    let mut channel = match TunnelChannel::open(&shared.config.tunnel_candidates()).await {
        Ok(channel) => channel,
        Err(e) => {
            if let Error::TunnelUnavailable(reason) = &e {
                shared.disable_tunnel(reason.clone());
            }
            return Err(TierFailure::Retryable(e));
        }
    };

    let result = exchange(&mut channel, request, host, port, sink).await;
    channel.close().await;
    result
}

async fn exchange(
    channel: &mut TunnelChannel,
    request: &HttpRequest,
    host: &str,
    port: u16,
    sink: &EventSink,
) -> Result<(), TierFailure> {
    let connect = ClientFrame::connect(host, port, port == 443);
    channel
        .send_control(&connect)
        .await
        .map_err(TierFailure::Retryable)?;

    loop {
        match channel.next_event().await {
            ChannelEvent::Control(ServerFrame::Connected) => break,
            ChannelEvent::Control(ServerFrame::Error { code, msg }) => {
                return Err(TierFailure::Retryable(Error::Relay { code, msg }));
            }
            ChannelEvent::Control(ServerFrame::RemoteClosed) | ChannelEvent::Closed => {
                return Err(TierFailure::Retryable(Error::Closed));
            }
            ChannelEvent::Control(ServerFrame::Dns { .. }) | ChannelEvent::Data(_) => {}
        }
    }

    channel
        .send_data(request.raw_bytes())
        .await
        .map_err(TierFailure::Retryable)?;

    let mut delivered = false;
    loop {
        match channel.next_event().await {
            ChannelEvent::Data(data) => {
                delivered = true;
                sink.emit(Update::Data(data));
            }
            ChannelEvent::Control(ServerFrame::RemoteClosed) | ChannelEvent::Closed => {
                return Ok(());
            }
            ChannelEvent::Control(ServerFrame::Error { code, msg }) => {
                let e = Error::Relay { code, msg };
                return Err(if delivered {
                    TierFailure::Interrupted(e)
                } else {
                    TierFailure::Retryable(e)
                });
            }
            ChannelEvent::Control(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_ladder_order() {
        assert_eq!(
            ladder(false, true),
            vec![
                Tier::Fetch,
                Tier::FetchViaProxy,
                Tier::Xhr,
                Tier::XhrViaProxy,
                Tier::Tunnel,
            ]
        );
    }

    #[test]
    fn known_proxy_targets_skip_direct_tiers() {
        assert_eq!(ladder(true, false), vec![Tier::FetchViaProxy, Tier::XhrViaProxy]);
    }

    #[test]
    fn urls_per_port() {
        assert_eq!(tier_url(None, "squeak.org", 80, "/a"), "http://squeak.org:80/a");
        assert_eq!(tier_url(None, "squeak.org", 443, "/a"), "https://squeak.org/a");
        assert_eq!(
            tier_url(Some("https://corsproxy.io/?"), "squeak.org", 8080, "/a?b=c"),
            "https://corsproxy.io/?http://squeak.org:8080/a?b=c"
        );
    }

    fn request(raw: &[u8]) -> HttpRequest {
        HttpRequest::parse(raw).unwrap().0
    }

    #[test]
    fn post_only_retries_after_connect_failures() {
        let post = request(b"POST /x HTTP/1.0\r\nContent-Length: 0\r\n\r\n");
        let get = request(b"GET /x HTTP/1.0\r\n\r\n");

        let reached = TierFailure::Retryable(Error::Closed);
        assert!(reached.allows_retry(&get));
        assert!(!reached.allows_retry(&post));

        let refused = TierFailure::Retryable(Error::TunnelUnavailable("down".into()));
        assert!(refused.allows_retry(&post));

        let interrupted = TierFailure::Interrupted(Error::Closed);
        assert!(!interrupted.allows_retry(&get));
    }
}
