use std::net::{SocketAddr, ToSocketAddrs as _};

use anyhow::Context as _;
use tokio::io::{AsyncRead, AsyncWrite};
use url::Url;

/// Resolves the `host:port` encoded in a `tcp://`/`http://`/`https://` URL to a bindable address.
pub fn url_to_socket_addr(url: &Url) -> anyhow::Result<SocketAddr> {
    let host = url.host_str().context("bad url: host missing")?;
    let port = url.port_or_known_default().context("bad url: port missing")?;

    (host, port)
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve {host}:{port}"))?
        .next()
        .with_context(|| format!("no address found for {host}:{port}"))
}

pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}

impl<T> AsyncReadWrite for T where T: AsyncRead + AsyncWrite + Send + Sync + 'static {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_to_socket_addr_uses_explicit_port() {
        let url = Url::parse("tcp://127.0.0.1:5353").unwrap();
        let addr = url_to_socket_addr(&url).unwrap();
        assert_eq!(addr.port(), 5353);
    }

    #[test]
    fn url_to_socket_addr_falls_back_to_scheme_default() {
        let url = Url::parse("http://127.0.0.1").unwrap();
        let addr = url_to_socket_addr(&url).unwrap();
        assert_eq!(addr.port(), 80);
    }
}
