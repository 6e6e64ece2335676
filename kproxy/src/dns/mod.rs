pub mod handler;
pub mod upstream;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_server::ServerFuture;
use kproxy_task::{ShutdownSignal, Task};
use tokio::net::{TcpListener, UdpSocket};
use tracing::info;

use crate::dns::handler::DnsHandler;

pub struct DnsServerTask {
    pub bind_address: SocketAddr,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub handler: DnsHandler,
}

#[async_trait]
impl Task for DnsServerTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "dns-server";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        let mut server = ServerFuture::new(self.handler);

        if self.enable_udp {
            let socket = UdpSocket::bind(self.bind_address).await?;
            server.register_socket(socket);
            info!(address = %self.bind_address, "dns udp listener bound");
        }

        if self.enable_tcp {
            let listener = TcpListener::bind(self.bind_address).await?;
            server.register_listener(listener, Duration::from_secs(5));
            info!(address = %self.bind_address, "dns tcp listener bound");
        }

        tokio::select! {
            result = server.block_until_done() => {
                result?;
            }
            () = shutdown_signal.wait() => {
                info!("dns server shutting down");
            }
        }

        Ok(())
    }
}

pub use handler::DnsConfig;
pub use upstream::UpstreamResolvers;
pub type SharedUpstream = Arc<UpstreamResolvers>;
