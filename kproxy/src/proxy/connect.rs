//! CONNECT-method tunnel handling for the plain HTTP listener.
//!
//! A CONNECT request asks this proxy to forward raw bytes to `host:port` without
//! interpretation. Per the state machine (§4.8), this is the only bypass path that survives
//! without a TLS handshake: the proxy never decrypts tunnel traffic, so policy must be decided
//! on the CONNECT target alone, before any bytes are relayed. Global bypass patterns short-
//! circuit straight to the tunnel; everything else still goes through a full policy evaluation
//! keyed on the target host, with an empty path and a synthetic `CONNECT` method.
use std::net::IpAddr;
use std::sync::Arc;

use http::{Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::policy::ProxyRequest;
use crate::policy::facts::ProxyAction;

use super::{ProxyState, ResponseBody, full_body, strip_port, text_response};

/// Handles one `CONNECT host:port` request. Returns the response to send for the CONNECT
/// request itself; on success, spawns the bidirectional tunnel once the connection upgrades.
pub async fn handle_connect(
    state: Arc<ProxyState>,
    req: Request<Incoming>,
    client_ip: IpAddr,
) -> Response<ResponseBody> {
    let Some(authority) = req.uri().authority().cloned() else {
        return text_response(StatusCode::BAD_REQUEST, "CONNECT request missing target authority");
    };

    let host = strip_port(authority.as_str()).to_owned();
    let port = authority.port_u16().unwrap_or(443);

    let bypass = state.policy.is_global_bypass(&host);

    if !bypass {
        let client_mac = if state.use_mac_address {
            state.arp.as_ref().and_then(|arp| arp.lookup(client_ip))
        } else {
            None
        };

        let decision = state
            .policy
            .evaluate(ProxyRequest {
                client_ip,
                client_mac,
                host: host.clone(),
                path: String::new(),
                method: "CONNECT".to_owned(),
            })
            .await;

        if decision.action != ProxyAction::Allow {
            return text_response(
                StatusCode::FORBIDDEN,
                format!("<html><body>Blocked: {}</body></html>", decision.reason),
            );
        }
    }

    let target = format!("{host}:{port}");

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                if let Err(error) = tunnel(upgraded, &target).await {
                    warn!(%error, target, "CONNECT tunnel failed");
                }
            }
            Err(error) => warn!(%error, "failed to upgrade CONNECT request"),
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .body(full_body(bytes::Bytes::new()))
        .expect("static status and empty body always build a valid response")
}

async fn tunnel(upgraded: hyper::upgrade::Upgraded, target: &str) -> anyhow::Result<()> {
    let mut server_stream = TcpStream::connect(target).await?;
    let mut client_io = TokioIo::new(upgraded);

    let (from_client, from_server) = copy_bidirectional(&mut client_io, &mut server_stream).await?;
    info!(target, from_client, from_server, "CONNECT tunnel closed");

    Ok(())
}
