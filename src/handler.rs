//! DNS request handling for the `.consul.` zone.
//!
//! Query names follow the Consul conventions:
//!
//! - default form: `[TAG.]NAME.service[.DC].consul.`
//! - RFC 2782 form: `_NAME._TAG.service[.DC].consul.` (`_tcp` means "no tag")
//!
//! Prepared queries (`NAME.query.consul.`) are not implemented.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use hickory_proto::op::{Header, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, SRV};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::cache::{AddressFamily, Endpoint, ServiceCache, ServiceKey};
use crate::consul::ConsulClient;
use crate::dogstatsd::QueryStats;
use crate::error::Error;

/// Handles DNS queries for the `.consul.` zone by consulting the service
/// cache and translating the outcome into records and response codes.
pub struct ConsulHandler {
    cache: ServiceCache,
    client: ConsulClient,
    stats: Arc<QueryStats>,
    cancel: CancellationToken,
}

impl ConsulHandler {
    /// Create a handler over the given cache and agent client.
    pub fn new(
        cache: ServiceCache,
        client: ConsulClient,
        stats: Arc<QueryStats>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            cache,
            client,
            stats,
            cancel,
        }
    }

    async fn serve<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: &mut R,
    ) -> Result<ResponseInfo, Error> {
        let info = request.request_info()?;

        if info.header.message_type() != MessageType::Query
            || info.header.op_code() != OpCode::Query
        {
            return self
                .respond(request, response_handle, ResponseCode::NotImp, None, None)
                .await;
        }

        let qname = info.query.original().name().clone();
        let qtype = info.query.query_type();

        self.stats.observe_query(info.src.ip(), &qname.to_string());

        let (rcode, answer, extra) = self.resolve(&qname, qtype).await;
        self.respond(request, response_handle, rcode, answer, extra)
            .await
    }

    /// Resolve one query into a response code and up to one answer record
    /// with its additional record.
    async fn resolve(
        &self,
        qname: &Name,
        qtype: RecordType,
    ) -> (ResponseCode, Option<Record>, Option<Record>) {
        let lowered = qname.to_string().to_ascii_lowercase();
        let parsed = split_name(&lowered);

        if parsed.name.is_empty() {
            return (ResponseCode::NXDomain, None, None);
        }
        if parsed.domain != "consul" {
            return (ResponseCode::Refused, None, None);
        }
        if parsed.kind != "service" {
            return (ResponseCode::NotImp, None, None);
        }

        // SRV collapses to ANY before the cache key is built.
        let family = match qtype {
            RecordType::A => AddressFamily::V4,
            RecordType::AAAA => AddressFamily::V6,
            RecordType::ANY | RecordType::SRV => AddressFamily::Any,
            _ => return (ResponseCode::NotImp, None, None),
        };

        let dc = if parsed.dc.is_empty() {
            match self.client.default_datacenter().await {
                Ok(dc) => dc.to_string(),
                Err(err) => {
                    error!(name = %qname, error = %err, "agent datacenter discovery failed");
                    return (ResponseCode::ServFail, None, None);
                }
            }
        } else {
            parsed.dc.to_string()
        };

        let key = ServiceKey::new(parsed.name, parsed.tag, &dc, family);
        let resolution = match self
            .cache
            .lookup(&self.cancel, &key, Instant::now())
            .await
        {
            Ok(resolution) => resolution,
            Err(err) => {
                error!(name = %qname, error = %err, "lookup failed");
                return (ResponseCode::ServFail, None, None);
            }
        };

        let endpoint = match resolution.endpoint {
            Some(endpoint) => endpoint,
            None => return (ResponseCode::NXDomain, None, None),
        };

        let ttl = resolution.ttl.as_secs().max(1) as u32;
        match build_answer(qname, qtype, &endpoint, ttl) {
            Ok((answer, extra)) => (ResponseCode::NoError, Some(answer), extra),
            Err(err) => {
                error!(name = %qname, error = %err, "building answer failed");
                (ResponseCode::ServFail, None, None)
            }
        }
    }

    async fn respond<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: &mut R,
        rcode: ResponseCode,
        answer: Option<Record>,
        extra: Option<Record>,
    ) -> Result<ResponseInfo, Error> {
        let mut header = Header::response_from_request(request.header());
        header.set_authoritative(true);
        header.set_response_code(rcode);

        let answers: Vec<Record> = answer.into_iter().collect();
        let extras: Vec<Record> = extra.into_iter().collect();

        let builder = MessageResponseBuilder::from_message_request(request);
        let response = builder.build(
            header,
            answers.iter(),
            std::iter::empty(),
            std::iter::empty(),
            extras.iter(),
        );
        Ok(response_handle.send_response(response).await?)
    }
}

#[async_trait]
impl RequestHandler for ConsulHandler {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
    ) -> ResponseInfo {
        match self.serve(request, &mut response_handle).await {
            Ok(info) => info,
            Err(err) => {
                error!(error = %err, "request handling failed");
                let mut header = Header::new();
                header.set_response_code(ResponseCode::ServFail);
                header.into()
            }
        }
    }
}

/// One answer record for the endpoint, plus the SRV additional record.
fn build_answer(
    qname: &Name,
    qtype: RecordType,
    endpoint: &Endpoint,
    ttl: u32,
) -> Result<(Record, Option<Record>), Error> {
    match qtype {
        RecordType::SRV => {
            let target = Name::from_ascii(&endpoint.node)?;
            let srv = SRV::new(1, 1, endpoint.port, target.clone());
            let mut answer = Record::from_rdata(qname.clone(), ttl, RData::SRV(srv));
            answer.set_dns_class(DNSClass::IN);
            let extra = address_record(target, endpoint.addr, ttl);
            Ok((answer, Some(extra)))
        }
        _ => Ok((address_record(qname.clone(), endpoint.addr, ttl), None)),
    }
}

/// An A or AAAA record matching the address family of `addr`.
fn address_record(name: Name, addr: IpAddr, ttl: u32) -> Record {
    let rdata = match addr {
        IpAddr::V4(v4) => RData::A(A::from(v4)),
        IpAddr::V6(v6) => RData::AAAA(AAAA::from(v6)),
    };
    let mut record = Record::from_rdata(name, ttl, rdata);
    record.set_dns_class(DNSClass::IN);
    record
}

/// The parts of a parsed query name. Empty strings mark absent parts; an
/// empty `name` means the query is malformed.
#[derive(Debug, Default, PartialEq, Eq)]
struct ParsedName<'a> {
    name: &'a str,
    tag: &'a str,
    kind: &'a str,
    dc: &'a str,
    domain: &'a str,
}

fn split_name(s: &str) -> ParsedName<'_> {
    let s = s.strip_suffix('.').unwrap_or(s);
    if s.starts_with('_') {
        split_name_rfc2782(s)
    } else {
        split_name_default(s)
    }
}

fn split_name_default(s: &str) -> ParsedName<'_> {
    for sep in [".service.", ".query."] {
        if let Some(i) = s.find(sep) {
            let (name, tag) = split_last(&s[..i]);
            let (domain, dc) = split_last(&s[i + sep.len()..]);
            return ParsedName {
                name,
                tag,
                kind: sep.trim_matches('.'),
                dc,
                domain,
            };
        }
    }
    ParsedName::default()
}

fn split_name_rfc2782(s: &str) -> ParsedName<'_> {
    let (name, s) = split(s);
    let (tag, s) = split(s);

    let (mut domain, mut s) = split(s);
    let mut dc = "";
    if domain == "service" {
        let next = split(s);
        domain = next.0;
        s = next.1;
        if !s.is_empty() {
            dc = domain;
            let next = split(s);
            domain = next.0;
            s = next.1;
            if !s.is_empty() {
                return ParsedName::default();
            }
        }
    }

    let tag = if tag == "_tcp" {
        ""
    } else if let Some(tag) = tag.strip_prefix('_') {
        tag
    } else {
        return ParsedName::default();
    };

    ParsedName {
        name: name.strip_prefix('_').unwrap_or(name),
        tag,
        kind: "service",
        dc,
        domain,
    }
}

/// Split off the first dot-separated label.
fn split(s: &str) -> (&str, &str) {
    match s.find('.') {
        Some(i) => (&s[..i], &s[i + 1..]),
        None => (s, ""),
    }
}

/// Split off the last dot-separated label.
fn split_last(s: &str) -> (&str, &str) {
    match s.rfind('.') {
        Some(i) => (&s[i + 1..], &s[..i]),
        None => (s, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_name_default() {
        let parsed = split_name("service-1.service.consul.");
        assert_eq!(parsed.name, "service-1");
        assert_eq!(parsed.tag, "");
        assert_eq!(parsed.kind, "service");
        assert_eq!(parsed.dc, "");
        assert_eq!(parsed.domain, "consul");
    }

    #[test]
    fn test_split_name_with_tag_and_dc() {
        let parsed = split_name("zone-1.service-1.service.dc1.consul.");
        assert_eq!(parsed.name, "service-1");
        assert_eq!(parsed.tag, "zone-1");
        assert_eq!(parsed.kind, "service");
        assert_eq!(parsed.dc, "dc1");
        assert_eq!(parsed.domain, "consul");
    }

    #[test]
    fn test_split_name_empty_service_name() {
        let parsed = split_name(".service.consul.");
        assert_eq!(parsed.name, "");
    }

    #[test]
    fn test_split_name_query_type() {
        let parsed = split_name("service-1.query.consul.");
        assert_eq!(parsed.name, "service-1");
        assert_eq!(parsed.kind, "query");
        assert_eq!(parsed.domain, "consul");
    }

    #[test]
    fn test_split_name_foreign_domain() {
        let parsed = split_name("service-1.service.other.");
        assert_eq!(parsed.name, "service-1");
        assert_eq!(parsed.domain, "other");
    }

    #[test]
    fn test_split_name_rfc2782() {
        let parsed = split_name("_service-1._tcp.service.consul.");
        assert_eq!(parsed.name, "service-1");
        assert_eq!(parsed.tag, "");
        assert_eq!(parsed.kind, "service");
        assert_eq!(parsed.dc, "");
        assert_eq!(parsed.domain, "consul");
    }

    #[test]
    fn test_split_name_rfc2782_with_tag() {
        let parsed = split_name("_service-1._zone-1.service.consul.");
        assert_eq!(parsed.name, "service-1");
        assert_eq!(parsed.tag, "zone-1");
        assert_eq!(parsed.domain, "consul");
    }

    #[test]
    fn test_split_name_rfc2782_with_dc() {
        let parsed = split_name("_service-1._tcp.service.dc1.consul.");
        assert_eq!(parsed.name, "service-1");
        assert_eq!(parsed.tag, "");
        assert_eq!(parsed.dc, "dc1");
        assert_eq!(parsed.domain, "consul");
    }

    #[test]
    fn test_split_name_rfc2782_untagged_is_invalid() {
        let parsed = split_name("_service-1.tag.service.consul.");
        assert_eq!(parsed.name, "");
    }

    #[test]
    fn test_split_name_rfc2782_too_many_labels() {
        let parsed = split_name("_service-1._tcp.service.dc1.extra.consul.");
        assert_eq!(parsed.name, "");
    }

    #[test]
    fn test_build_answer_srv_with_extra() {
        let qname = Name::from_ascii("service-1.service.consul.").unwrap();
        let endpoint = Endpoint {
            addr: "192.168.0.1".parse().unwrap(),
            port: 10001,
            node: "host-1.local.domain.".to_string(),
        };

        let (answer, extra) = build_answer(&qname, RecordType::SRV, &endpoint, 30).unwrap();
        match answer.data() {
            RData::SRV(srv) => {
                assert_eq!(srv.priority(), 1);
                assert_eq!(srv.weight(), 1);
                assert_eq!(srv.port(), 10001);
                assert_eq!(srv.target().to_string(), "host-1.local.domain.");
            }
            other => panic!("expected SRV rdata, got {other:?}"),
        }

        let extra = extra.unwrap();
        assert_eq!(extra.name().to_string(), "host-1.local.domain.");
        assert!(matches!(extra.data(), RData::A(_)));
    }

    #[test]
    fn test_build_answer_any_picks_family() {
        let qname = Name::from_ascii("service-1.service.consul.").unwrap();

        let v4 = Endpoint {
            addr: "192.168.0.1".parse().unwrap(),
            port: 10001,
            node: "host-1.".to_string(),
        };
        let (answer, _) = build_answer(&qname, RecordType::ANY, &v4, 30).unwrap();
        assert!(matches!(answer.data(), RData::A(_)));

        let v6 = Endpoint {
            addr: "2001:db8:85a3::8a2e:370:7334".parse().unwrap(),
            port: 10021,
            node: "host-3.".to_string(),
        };
        let (answer, _) = build_answer(&qname, RecordType::ANY, &v6, 30).unwrap();
        assert!(matches!(answer.data(), RData::AAAA(_)));
    }
}
