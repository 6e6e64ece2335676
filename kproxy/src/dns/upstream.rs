//! One `hickory_resolver::TokioResolver` per configured upstream, tried in order with a
//! per-call timeout, per §4.7's BYPASS path.

use std::net::IpAddr;
use std::time::Duration;

use hickory_proto::rr::{Name, Record, RecordType};
use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioResolver;

use crate::error::UpstreamDnsError;

pub struct UpstreamResolvers {
    resolvers: Vec<(IpAddr, TokioResolver)>,
    timeout: Duration,
}

impl UpstreamResolvers {
    pub fn new(servers: &[IpAddr], timeout: Duration) -> Self {
        let resolvers = servers
            .iter()
            .map(|&server| {
                let mut config = ResolverConfig::new();
                config.add_name_server(NameServerConfig::new(
                    std::net::SocketAddr::new(server, 53),
                    Protocol::Udp,
                ));
                let resolver = TokioResolver::tokio(config, ResolverOpts::default());
                (server, resolver)
            })
            .collect();

        Self { resolvers, timeout }
    }

    /// Tries each configured upstream in order; returns the first successful answer set.
    pub async fn resolve(&self, name: &Name, record_type: RecordType) -> Result<Vec<Record>, UpstreamDnsError> {
        let mut last_error = None;

        for (server, resolver) in &self.resolvers {
            let attempt = tokio::time::timeout(self.timeout, resolver.lookup(name.clone(), record_type)).await;

            match attempt {
                Ok(Ok(lookup)) => return Ok(lookup.records().to_vec()),
                Ok(Err(source)) => {
                    tracing::debug!(%server, %source, "upstream resolver returned an error");
                    last_error = Some(UpstreamDnsError::Failed {
                        server: *server,
                        source: std::io::Error::other(source.to_string()),
                    });
                }
                Err(_elapsed) => {
                    tracing::debug!(%server, "upstream resolver timed out");
                    last_error = Some(UpstreamDnsError::Timeout { server: *server });
                }
            }
        }

        Err(last_error.unwrap_or(UpstreamDnsError::AllFailed))
    }
}

/// Caps every record's TTL at `cap`, if set and the record's own TTL exceeds it.
pub fn cap_ttls(records: &mut [Record], cap: Option<u32>) {
    let Some(cap) = cap else { return };
    for record in records {
        if record.ttl() > cap {
            record.set_ttl(cap);
        }
    }
}
