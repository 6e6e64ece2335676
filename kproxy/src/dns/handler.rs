//! Per-message DNS request handler: classify, consult the policy engine, answer.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Header, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record, RecordType};
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use tracing::{debug, warn};

use crate::dns::upstream::{cap_ttls, UpstreamResolvers};
use crate::policy::facts::DnsDecision;
use crate::policy::PolicyEngine;

#[derive(Debug, Clone)]
pub struct DnsConfig {
    pub proxy_ip: Ipv4Addr,
    pub intercept_ttl: u32,
    pub block_ttl: u32,
    pub bypass_ttl_cap: Option<u32>,
    pub upstream_timeout: Duration,
}

pub struct DnsHandler {
    pub policy: Arc<PolicyEngine>,
    pub upstream: Arc<UpstreamResolvers>,
    pub config: DnsConfig,
}

impl DnsHandler {
    /// Builds the answer record set for a single question once the policy decision is known.
    /// Returns `None` to mean "no answer for this question" (still a `NOERROR`, empty answer
    /// section): AAAA under intercept and anything but A under block both resolve this way.
    async fn answer_for(&self, decision: DnsDecision, name: &hickory_proto::rr::Name, qtype: RecordType) -> Vec<Record> {
        match decision {
            DnsDecision::Intercept => self.intercept_answer(name, qtype),
            DnsDecision::Block => self.block_answer(name, qtype),
            DnsDecision::Bypass => self.bypass_answer(name, qtype).await,
        }
    }

    fn intercept_answer(&self, name: &hickory_proto::rr::Name, qtype: RecordType) -> Vec<Record> {
        match qtype {
            RecordType::A => {
                vec![Record::from_rdata(name.clone(), self.config.intercept_ttl, RData::A(A(self.config.proxy_ip)))]
            }
            // AAAA: deliberately empty, forcing IPv4-only clients to fall back to A.
            RecordType::AAAA => vec![],
            _ => vec![],
        }
    }

    fn block_answer(&self, name: &hickory_proto::rr::Name, qtype: RecordType) -> Vec<Record> {
        match qtype {
            RecordType::A => vec![Record::from_rdata(
                name.clone(),
                self.config.block_ttl,
                RData::A(A(Ipv4Addr::new(0, 0, 0, 0))),
            )],
            _ => vec![],
        }
    }

    async fn bypass_answer(&self, name: &hickory_proto::rr::Name, qtype: RecordType) -> Vec<Record> {
        match self.upstream.resolve(name, qtype).await {
            Ok(mut records) => {
                cap_ttls(&mut records, self.config.bypass_ttl_cap);
                records
            }
            Err(error) => {
                warn!(%error, domain = %name, "every upstream resolver failed, falling back to intercept");
                self.intercept_answer(name, qtype)
            }
        }
    }
}

#[async_trait::async_trait]
impl RequestHandler for DnsHandler {
    async fn handle_request<R: ResponseHandler>(&self, request: &Request, mut response_handle: R) -> ResponseInfo {
        let query = request.query();
        let name = query.name().into();
        let qtype = query.query_type();
        let client_ip = request.src().ip();

        let decision = match self.policy.get_dns_action(client_ip, None, &name.to_utf8()).await {
            Ok(decision) => decision,
            Err(error) => {
                warn!(%error, domain = %name, "policy engine returned an unrecognized action, treating as block");
                DnsDecision::Block
            }
        };

        debug!(domain = %name, ?qtype, ?decision, %client_ip, "dns query");

        let answers = self.answer_for(decision, &name, qtype).await;

        let mut header = Header::response_from_request(request.header());
        header.set_response_code(ResponseCode::NoError);

        let builder = MessageResponseBuilder::from_message_request(request);
        let response = builder.build(header, answers.iter(), &[], &[], &[]);

        match response_handle.send_response(response).await {
            Ok(info) => info,
            Err(error) => {
                warn!(%error, "failed to send dns response");
                let mut info_header = Header::response_from_request(request.header());
                info_header.set_response_code(ResponseCode::ServFail);
                info_header.into()
            }
        }
    }
}
