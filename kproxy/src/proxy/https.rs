//! TLS-terminating proxy listener: the intercepted-HTTPS half of the proxy.
//!
//! Certificate selection is entirely delegated to the `ServerConfig`'s resolver (see `tls.rs`);
//! this module only needs the negotiated SNI hostname once the handshake completes, to feed it
//! into the same [`handle_request`] path the plain listener uses.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use kproxy_task::{ChildTask, ShutdownSignal, Task};
use rustls::ServerConfig;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{error, warn};

use super::{ProxyState, handle_request};

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

pub struct HttpsListenerTask {
    pub bind_address: SocketAddr,
    pub state: Arc<ProxyState>,
    pub server_config: Arc<ServerConfig>,
}

#[async_trait]
impl Task for HttpsListenerTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "https-proxy-listener";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        let listener = TcpListener::bind(self.bind_address).await?;
        let acceptor = TlsAcceptor::from(self.server_config);
        tracing::info!(address = %self.bind_address, "https proxy listener bound");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            let state = Arc::clone(&self.state);
                            let acceptor = acceptor.clone();
                            ChildTask::spawn(async move {
                                if let Err(error) = tokio::time::timeout(
                                    CONNECTION_TIMEOUT,
                                    serve_connection(stream, peer_addr.ip(), acceptor, state),
                                )
                                .await
                                {
                                    warn!(%error, %peer_addr, "https connection timed out");
                                }
                            })
                            .detach();
                        }
                        Err(error) => error!(%error, "failed to accept https connection"),
                    }
                }
                () = shutdown_signal.wait() => {
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    client_ip: std::net::IpAddr,
    acceptor: TlsAcceptor,
    state: Arc<ProxyState>,
) {
    let tls_stream = match acceptor.accept(stream).await {
        Ok(tls_stream) => tls_stream,
        Err(error) => {
            warn!(%error, "TLS handshake failed");
            return;
        }
    };

    let sni_host = tls_stream.get_ref().1.server_name().map(str::to_owned);

    let io = TokioIo::new(tls_stream);

    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        let sni_host = sni_host.clone();
        async move { handle_request(state, req, client_ip, sni_host.as_deref()).await }
    });

    if let Err(error) = http1::Builder::new().serve_connection(io, service).await {
        warn!(%error, "https connection closed with error");
    }
}
