//! Plain HTTP proxy listener: serves both ordinary forwarded requests and `CONNECT` tunnels.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hyper::Method;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use kproxy_task::{ChildTask, ShutdownSignal, Task};
use tokio::net::TcpListener;
use tracing::{error, warn};

use super::connect::handle_connect;
use super::{ProxyState, handle_request};

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

pub struct HttpListenerTask {
    pub bind_address: SocketAddr,
    pub state: Arc<ProxyState>,
}

#[async_trait]
impl Task for HttpListenerTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "http-proxy-listener";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        let listener = TcpListener::bind(self.bind_address).await?;
        tracing::info!(address = %self.bind_address, "http proxy listener bound");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            let state = Arc::clone(&self.state);
                            ChildTask::spawn(async move {
                                if let Err(error) = tokio::time::timeout(
                                    CONNECTION_TIMEOUT,
                                    serve_connection(stream, peer_addr.ip(), state),
                                )
                                .await
                                {
                                    warn!(%error, %peer_addr, "http connection timed out");
                                }
                            })
                            .detach();
                        }
                        Err(error) => error!(%error, "failed to accept http connection"),
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

async fn serve_connection(stream: tokio::net::TcpStream, client_ip: std::net::IpAddr, state: Arc<ProxyState>) {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move {
            if req.method() == Method::CONNECT {
                Ok::<_, std::convert::Infallible>(handle_connect(state, req, client_ip).await)
            } else {
                handle_request(state, req, client_ip, None).await
            }
        }
    });

    if let Err(error) = http1::Builder::new().serve_connection(io, service).with_upgrades().await {
        warn!(%error, "http connection closed with error");
    }
}
