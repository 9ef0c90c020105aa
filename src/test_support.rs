//! Fixtures shared by unit tests: a recording transport and canned messages.

use crate::agent::{Agent, AgentConfig, RequestHandler};
use crate::error::TransportError;
use crate::transport::{Reliability, Transport, TransportProtocol, ViaAddress};
use crate::utils::{build_response_from_request, reason_phrase, HeaderBuilder};
use crate::{parse_sip_message, MessageHeaders, SipMessage, SipMethod, SipRequest, SipResponse, SipUri};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub(crate) const CLIENT_SENT_BY: &str = "client.atlanta.example.com:5060";

/// Transport that records every datagram instead of sending it.
pub(crate) struct MockTransport {
    protocol: TransportProtocol,
    sent: Mutex<Vec<Bytes>>,
    failing: AtomicBool,
}

impl MockTransport {
    pub(crate) fn udp() -> Arc<Self> {
        Self::with_protocol(TransportProtocol::Udp)
    }

    pub(crate) fn tcp() -> Arc<Self> {
        Self::with_protocol(TransportProtocol::Tcp)
    }

    fn with_protocol(protocol: TransportProtocol) -> Arc<Self> {
        Arc::new(Self {
            protocol,
            sent: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        })
    }

    pub(crate) fn fail_sends(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub(crate) fn messages(&self) -> Vec<SipMessage> {
        self.sent
            .lock()
            .iter()
            .map(|bytes| parse_sip_message(bytes).expect("agent sent an unparsable message"))
            .collect()
    }

    pub(crate) fn requests(&self) -> Vec<SipRequest> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                SipMessage::Request(r) => Some(r),
                SipMessage::Response(_) => None,
            })
            .collect()
    }

    pub(crate) fn responses(&self) -> Vec<SipResponse> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                SipMessage::Response(r) => Some(r),
                SipMessage::Request(_) => None,
            })
            .collect()
    }

    pub(crate) fn last_request(&self) -> Option<SipRequest> {
        self.requests().pop()
    }

    pub(crate) fn last_response(&self) -> Option<SipResponse> {
        self.responses().pop()
    }

    pub(crate) fn status_codes(&self) -> Vec<u16> {
        self.responses().iter().map(|r| r.status_code).collect()
    }
}

impl Transport for MockTransport {
    fn via(&self, destination: &SipUri) -> Result<ViaAddress, TransportError> {
        Ok(ViaAddress {
            protocol: self.protocol,
            sent_by: CLIENT_SENT_BY.to_string(),
            dns_name: destination.host.clone(),
        })
    }

    fn send(&self, bytes: &Bytes) -> Result<Reliability, TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::NoRoute("mock transport down".to_string()));
        }
        self.sent.lock().push(bytes.clone());
        Ok(self.protocol.reliability())
    }
}

/// Handler that keeps every default.
pub(crate) struct NullHandler;

impl RequestHandler for NullHandler {}

pub(crate) fn test_agent(handler: Arc<dyn RequestHandler>) -> Agent {
    agent_at("sip:alice@client.atlanta.example.com", handler)
}

pub(crate) fn agent_at(contact: &str, handler: Arc<dyn RequestHandler>) -> Agent {
    let config = AgentConfig {
        local_contact: Some(contact.to_string()),
        ..AgentConfig::default()
    };
    Agent::new(config, handler).expect("valid test config")
}

/// One direction of an in-memory UDP path between two agents. Every datagram
/// is parsed and fed straight into the peer agent.
pub(crate) struct Link {
    sent_by: String,
    peer: Mutex<Option<(Agent, Arc<dyn Transport>)>>,
}

impl Transport for Link {
    fn via(&self, destination: &SipUri) -> Result<ViaAddress, TransportError> {
        Ok(ViaAddress {
            protocol: TransportProtocol::Udp,
            sent_by: self.sent_by.clone(),
            dns_name: destination.host.clone(),
        })
    }

    fn send(&self, bytes: &Bytes) -> Result<Reliability, TransportError> {
        let message = parse_sip_message(bytes).map_err(|e| TransportError::NoRoute(e.to_string()))?;
        let peer = self.peer.lock().clone();
        let (agent, back) = peer.ok_or_else(|| TransportError::NoRoute("link not connected".to_string()))?;
        agent.input(message, back);
        Ok(Reliability::Unreliable)
    }
}

/// Connect `a` and `b`; returns the a→b and b→a directions.
pub(crate) fn link(a: &Agent, b: &Agent) -> (Arc<Link>, Arc<Link>) {
    let a_to_b = Arc::new(Link {
        sent_by: CLIENT_SENT_BY.to_string(),
        peer: Mutex::new(None),
    });
    let b_to_a = Arc::new(Link {
        sent_by: "server.biloxi.example.com:5060".to_string(),
        peer: Mutex::new(None),
    });
    *a_to_b.peer.lock() = Some((b.clone(), b_to_a.clone() as Arc<dyn Transport>));
    *b_to_a.peer.lock() = Some((a.clone(), a_to_b.clone() as Arc<dyn Transport>));
    (a_to_b, b_to_a)
}

fn uri(s: &str) -> SipUri {
    s.parse().expect("valid test uri")
}

/// Request as received from the network, with a UDP top Via.
fn inbound(method: SipMethod, call_id: &str, from_tag: &str, branch: &str) -> SipRequest {
    let mut request = SipRequest::new(method.clone(), uri("sip:bob@biloxi.example.com"));
    request.set_header(
        "via",
        format!("SIP/2.0/UDP {};branch={}", CLIENT_SENT_BY, branch),
    );
    request.set_header("from", format!("Alice <sip:alice@atlanta.example.com>;tag={}", from_tag));
    request.set_header("to", "Bob <sip:bob@biloxi.example.com>");
    request.set_header("call-id", call_id);
    request.set_header("cseq", format!("1 {}", method));
    request.set_header("contact", "<sip:alice@client.atlanta.example.com>");
    request.set_header("max-forwards", "70");
    request
}

pub(crate) fn invite_request(call_id: &str, from_tag: &str, branch: &str) -> SipRequest {
    inbound(SipMethod::Invite, call_id, from_tag, branch)
}

pub(crate) fn subscribe_request(call_id: &str, from_tag: &str, branch: &str, expires: u32) -> SipRequest {
    let mut request = inbound(SipMethod::Subscribe, call_id, from_tag, branch);
    request.set_header("event", "presence");
    request.set_header("expires", expires.to_string());
    request
}

pub(crate) fn register_request(call_id: &str, branch: &str) -> SipRequest {
    let mut request = inbound(SipMethod::Register, call_id, "reg", branch);
    request.uri = uri("sip:biloxi.example.com");
    request.set_header("to", "<sip:alice@atlanta.example.com>");
    request
}

/// In-dialog request from the same peer: To carries `to_tag`.
pub(crate) fn in_dialog(
    initial: &SipRequest,
    method: SipMethod,
    to_tag: &str,
    seq: u32,
    branch: &str,
) -> SipRequest {
    let mut request = initial.clone();
    request.method = method.clone();
    request.set_header(
        "via",
        format!("SIP/2.0/UDP {};branch={}", CLIENT_SENT_BY, branch),
    );
    if let Some(to) = initial.header("to") {
        request.set_header("to", format!("{};tag={}", to, to_tag));
    }
    request.set_header("cseq", format!("{} {}", seq, method));
    request
}

pub(crate) fn response_to(request: &SipRequest, status_code: u16, to_tag: Option<&str>) -> SipResponse {
    build_response_from_request(request, status_code, reason_phrase(status_code), to_tag)
}

/// Outbound request as a caller hands it to the agent (no Via).
fn outbound(method: SipMethod) -> SipRequest {
    let bob = uri("sip:bob@biloxi.example.com");
    HeaderBuilder::new()
        .header("from", "Alice <sip:alice@atlanta.example.com>")
        .to(&bob, None)
        .request(method, bob)
}

pub(crate) fn options_request() -> SipRequest {
    outbound(SipMethod::Options)
}

pub(crate) fn invite_out() -> SipRequest {
    outbound(SipMethod::Invite)
}

pub(crate) fn register_out(expires: u32) -> SipRequest {
    let alice = uri("sip:alice@atlanta.example.com");
    let mut request = HeaderBuilder::new()
        .from(&alice, None)
        .to(&alice, None)
        .request(SipMethod::Register, uri("sip:biloxi.example.com"));
    request.set_header("contact", "<sip:alice@client.atlanta.example.com>");
    request.set_header("expires", expires.to_string());
    request
}

pub(crate) fn subscribe_out(expires: u32) -> SipRequest {
    let mut request = outbound(SipMethod::Subscribe);
    request.set_header("event", "presence");
    request.set_header("expires", expires.to_string());
    request
}
