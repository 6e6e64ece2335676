//! The HTTP(S) proxy: shared request-handling logic used by both the plain and TLS listeners.
//!
//! Connection setup differs (`http.rs` accepts plaintext, `https.rs` terminates TLS with a
//! CA-minted certificate first) but every accepted connection funnels into [`handle_request`]
//! here, which determines the request's host, asks the policy engine for a decision, and either
//! forwards to the real origin or synthesizes a block response.

pub mod connect;
pub mod http;
pub mod https;
pub mod response_mod;

use std::convert::Infallible;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::combinators::BoxBody;
use futures::StreamExt as _;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use tracing::warn;

use crate::arp::ArpCache;
use crate::error::UpstreamHttpError;
use crate::policy::facts::{ProxyAction, ProxyDecision};
use crate::policy::{PolicyEngine, ProxyRequest};
use response_mod::{ResponseModConfig, inject_timer_overlay};

/// The body type returned to hyper by every response this module produces: either a fully
/// buffered block/error page or a streamed upstream response, erased behind one type so the
/// listener code doesn't need to match on which path was taken.
pub type ResponseBody = BoxBody<Bytes, anyhow::Error>;

/// Largest request body this proxy will buffer before forwarding it upstream. Requests beyond
/// this are rejected with 413 rather than streamed, keeping the upstream connection setup (which
/// needs the full body to mirror method/headers in one shot) simple.
const MAX_REQUEST_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Shared, cheaply-cloned state handed to every accepted connection.
#[derive(Clone)]
pub struct ProxyState {
    pub policy: Arc<PolicyEngine>,
    pub arp: Option<Arc<ArpCache>>,
    pub use_mac_address: bool,
    pub response_mod: ResponseModConfig,
    pub http_client: reqwest::Client,
    pub policy_eval_timeout: Duration,
    pub upstream_timeout: Duration,
}

pub(crate) fn full_body(bytes: Bytes) -> ResponseBody {
    Full::new(bytes).map_err(|never: Infallible| match never {}).boxed()
}

pub(crate) fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(full_body(body.into()))
        .expect("static status and headers always build a valid response")
}

fn block_response(decision: &ProxyDecision) -> Response<ResponseBody> {
    let page = decision.block_page.as_deref().unwrap_or("blocked");
    let body = format!(
        "<html><body><h1>Blocked</h1><p>{}</p><p data-block-page=\"{page}\"></p></body></html>",
        html_escape(&decision.reason),
    );
    text_response(StatusCode::FORBIDDEN, body)
}

fn bad_gateway(reason: &str) -> Response<ResponseBody> {
    warn!(reason, "upstream request failed, returning 502");
    text_response(StatusCode::BAD_GATEWAY, format!("<html><body>Bad gateway: {}</body></html>", html_escape(reason)))
}

fn gateway_timeout() -> Response<ResponseBody> {
    text_response(StatusCode::GATEWAY_TIMEOUT, "<html><body>Gateway timeout</body></html>")
}

/// §7: "Upstream I/O errors surface as `BadGateway`; timeouts as `GatewayTimeout`." Classifies a
/// `reqwest` failure from the upstream leg into the typed taxonomy and responds accordingly.
fn classify_upstream_error(error: reqwest::Error) -> UpstreamHttpError {
    if error.is_timeout() {
        UpstreamHttpError::Timeout
    } else if error.is_connect() {
        UpstreamHttpError::Connect(error)
    } else {
        UpstreamHttpError::Io(error)
    }
}

fn respond_to_upstream_error(error: reqwest::Error) -> Response<ResponseBody> {
    match classify_upstream_error(error) {
        UpstreamHttpError::Timeout => gateway_timeout(),
        other @ (UpstreamHttpError::Connect(_) | UpstreamHttpError::Io(_)) => bad_gateway(&other.to_string()),
    }
}

fn html_escape(input: &str) -> String {
    input.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

pub(crate) fn strip_port(host: &str) -> &str {
    host.rsplit_once(':').map_or(host, |(host, _port)| host)
}

/// Determines the request host, runs the policy decision, and produces a response. `sni_host`
/// is `Some` only on the HTTPS listener, where it takes precedence over the `Host` header per
/// §4.8 step 1 (the header can lie; the SNI cannot be forged without also breaking the TLS
/// handshake against the CA-minted certificate).
pub async fn handle_request(
    state: Arc<ProxyState>,
    req: Request<Incoming>,
    client_ip: IpAddr,
    sni_host: Option<&str>,
) -> Result<Response<ResponseBody>, Infallible> {
    let scheme = if sni_host.is_some() { "https" } else { "http" };

    let host = match sni_host.map(str::to_owned).or_else(|| {
        req.headers()
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    }) {
        Some(host) => host,
        None => return Ok(text_response(StatusCode::BAD_REQUEST, "missing Host header")),
    };
    let host = strip_port(&host).to_owned();

    let client_mac = if state.use_mac_address {
        state.arp.as_ref().and_then(|arp| arp.lookup(client_ip))
    } else {
        None
    };

    let path = req.uri().path_and_query().map(|pq| pq.as_str().to_owned()).unwrap_or_else(|| "/".to_owned());
    let method = req.method().to_string();

    let request = ProxyRequest {
        client_ip,
        client_mac,
        host: host.clone(),
        path: path.clone(),
        method: method.clone(),
    };

    let decision = match tokio::time::timeout(state.policy_eval_timeout, state.policy.evaluate(request)).await {
        Ok(decision) => decision,
        Err(_) => ProxyDecision::block("policy unavailable", "policy_unavailable"),
    };

    match decision.action {
        ProxyAction::Allow => Ok(forward_and_respond(&state, req, scheme, &host, &path, decision).await),
        ProxyAction::Block => Ok(block_response(&decision)),
    }
}

async fn forward_and_respond(
    state: &ProxyState,
    req: Request<Incoming>,
    scheme: &str,
    host: &str,
    path: &str,
    decision: ProxyDecision,
) -> Response<ResponseBody> {
    let (parts, body) = req.into_parts();

    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(error) => return bad_gateway(&format!("failed to read request body: {error}")),
    };

    if body_bytes.len() > MAX_REQUEST_BODY_BYTES {
        return text_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
    }

    let uri = format!("{scheme}://{host}{path}");

    let mut upstream_req = state.http_client.request(parts.method.clone(), uri.as_str());
    for (name, value) in parts.headers.iter() {
        if name == http::header::HOST {
            continue;
        }
        upstream_req = upstream_req.header(name, value);
    }
    upstream_req = upstream_req.body(body_bytes);

    let response = match tokio::time::timeout(state.upstream_timeout, upstream_req.send()).await {
        Ok(Ok(response)) => response,
        Ok(Err(error)) => return respond_to_upstream_error(error),
        Err(_) => return gateway_timeout(),
    };

    let status = response.status();
    let headers = response.headers().clone();

    let is_html = decision.inject_timer
        && headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/html"));

    let mut builder = Response::builder().status(status);
    for (name, value) in headers.iter() {
        if name == http::header::TRANSFER_ENCODING {
            continue;
        }
        builder = builder.header(name, value);
    }

    if is_html {
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(error) => return respond_to_upstream_error(error),
        };

        let minutes = decision.time_remaining_minutes.unwrap_or(0);
        let buffered = builder
            .body(Full::new(bytes))
            .expect("upstream headers already validated by hyper/reqwest on the way in");
        let rewritten = inject_timer_overlay(buffered, host, minutes, &state.response_mod);
        let (parts, body) = rewritten.into_parts();
        Response::from_parts(parts, full_body(body.into_inner()))
    } else {
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map(Frame::data).map_err(anyhow::Error::from));
        builder
            .body(StreamBody::new(stream).boxed())
            .expect("upstream headers already validated by hyper/reqwest on the way in")
    }
}

pub use http::HttpListenerTask;
pub use https::HttpsListenerTask;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_port_from_host() {
        assert_eq!(strip_port("example.com:8443"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
    }

    #[test]
    fn escapes_html_metacharacters_in_block_reason() {
        assert_eq!(html_escape("<script>"), "&lt;script&gt;");
    }
}
