//! Shared test infrastructure for consul-dns integration tests.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{DNSClass, Name, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinDecoder, BinEncoder};
use hickory_server::authority::{MessageRequest, MessageResponse};
use hickory_server::proto::rr::Record;
use hickory_server::proto::xfer::Protocol;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use httptest::{matchers::*, responders::*, Expectation, Server};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use consul_dns::{ConsulClient, ConsulConfig, ConsulHandler, ServiceCache};
use consul_dns::dogstatsd::QueryStats;

// --- TestResponseHandler ---

/// Captures the serialized DNS response for inspection in tests.
///
/// Implements `ResponseHandler` so it can be passed to
/// `ConsulHandler::handle_request()`. The response is serialized via
/// `MessageResponse::destructive_emit()` and stored as raw wire-format
/// bytes, which can then be parsed with `Message::from_vec()`.
#[derive(Clone)]
pub struct TestResponseHandler {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl TestResponseHandler {
    pub fn new() -> Self {
        Self {
            buf: Arc::new(Mutex::new(Vec::with_capacity(512))),
        }
    }

    /// Parse the captured wire bytes into a `Message` for assertions.
    pub fn into_message(self) -> Message {
        let buf = self.buf.lock().unwrap();
        assert!(!buf.is_empty(), "no response was captured");
        Message::from_vec(&buf).expect("failed to parse captured DNS response")
    }
}

#[async_trait]
impl ResponseHandler for TestResponseHandler {
    async fn send_response<'a>(
        &mut self,
        response: MessageResponse<
            '_,
            'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
        >,
    ) -> io::Result<ResponseInfo> {
        let mut buf = self.buf.lock().unwrap();
        buf.clear();
        let mut encoder = BinEncoder::new(&mut *buf);
        encoder.set_max_size(u16::MAX);
        let info = response
            .destructive_emit(&mut encoder)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(info)
    }
}

// --- Consul agent mock ---

/// One service registration on the mock agent.
#[derive(Debug, Clone)]
pub struct MockService {
    pub node: &'static str,
    pub addr: &'static str,
    pub port: u16,
}

/// Serialize registrations the way `/v1/health/service/<name>` does.
pub fn health_body(services: &[MockService]) -> serde_json::Value {
    json!(services
        .iter()
        .map(|service| json!({
            "Node": {"Node": service.node},
            "Service": {"Address": service.addr, "Port": service.port},
        }))
        .collect::<Vec<_>>())
}

/// Expect the default-datacenter discovery call.
pub fn expect_agent_self(server: &Server, dc: &str) {
    server.expect(
        Expectation::matching(request::method_path("GET", "/v1/agent/self"))
            .times(0..2)
            .respond_with(json_encoded(json!({"Config": {"Datacenter": dc}}))),
    );
}

/// Expect health lookups at `path` and return `services`.
pub fn expect_health(server: &Server, path: &'static str, services: &[MockService]) {
    server.expect(
        Expectation::matching(request::method_path("GET", path))
            .times(0..)
            .respond_with(json_encoded(health_body(services))),
    );
}

// --- Handler construction ---

/// Build a handler resolving against the mock agent.
pub fn build_handler(server: &Server) -> ConsulHandler {
    let config = ConsulConfig {
        address: format!("http://{}", server.addr()),
        ..ConsulConfig::default()
    };
    let client = ConsulClient::new(&config.address, Duration::from_secs(60))
        .expect("failed to create ConsulClient");
    let cache = ServiceCache::new(client.clone(), &config);
    ConsulHandler::new(
        cache,
        client,
        Arc::new(QueryStats::new()),
        CancellationToken::new(),
    )
}

// --- Query/Request construction ---

/// Build wire-format bytes for a DNS query.
pub fn build_query_bytes(name: &str, record_type: RecordType, id: u16) -> Vec<u8> {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    let mut query = Query::new();
    query.set_name(Name::from_ascii(name).unwrap());
    query.set_query_type(record_type);
    query.set_query_class(DNSClass::IN);
    msg.add_query(query);
    msg.to_vec().unwrap()
}

/// Parse wire bytes into a MessageRequest.
pub fn parse_message_request(bytes: &[u8]) -> MessageRequest {
    let mut decoder = BinDecoder::new(bytes);
    MessageRequest::read(&mut decoder).expect("failed to parse MessageRequest")
}

/// Build a full `Request` with the given source address.
pub fn build_request(name: &str, record_type: RecordType, src: SocketAddr, id: u16) -> Request {
    let bytes = build_query_bytes(name, record_type, id);
    let msg = parse_message_request(&bytes);
    Request::new(msg, src, Protocol::Udp)
}

/// Default query source.
pub fn test_src() -> SocketAddr {
    "10.0.0.1:12345".parse().unwrap()
}

// --- Response helpers ---

/// Execute a query through the handler and return the parsed response.
pub async fn execute_query(handler: &ConsulHandler, name: &str, record_type: RecordType) -> Message {
    let request = build_request(name, record_type, test_src(), 42);
    let capture = TestResponseHandler::new();
    handler.handle_request(&request, capture.clone()).await;
    capture.into_message()
}

/// Assert response code.
pub fn assert_response_code(msg: &Message, expected: ResponseCode) {
    assert_eq!(
        msg.response_code(),
        expected,
        "expected {:?}, got {:?}",
        expected,
        msg.response_code()
    );
}
