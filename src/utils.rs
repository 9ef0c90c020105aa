// utils.rs - Helper functions and utilities

use crate::{HeaderMap, MessageHeaders, SipMethod, SipRequest, SipResponse, SipUri};
use lazy_static::lazy_static;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use regex::Regex;
use std::collections::HashMap;

lazy_static! {
    static ref TAG_REGEX: Regex = Regex::new(r"(?i);\s*tag\s*=\s*([^;,>\s]+)").unwrap();
}

fn random_token(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Generate a unique branch parameter for Via header
pub fn generate_branch() -> String {
    format!("z9hG4bK{}", random_token(16))
}

/// Generate a unique tag
pub fn generate_tag() -> String {
    random_token(10)
}

/// Generate a unique Call-ID
pub fn generate_call_id(domain: &str) -> String {
    format!("{}@{}", random_token(16), domain)
}

/// Extract tag from From/To header. Only header parameters count: a `tag`
/// inside the angle-bracketed URI is ignored.
pub fn extract_tag(header: &str) -> Option<String> {
    let params = match header.rfind('>') {
        Some(end) => &header[end..],
        None => header,
    };
    TAG_REGEX
        .captures(params)
        .and_then(|cap| cap.get(1))
        .map(|m| m.as_str().to_string())
}

/// Default reason phrase for a status code.
pub fn reason_phrase(status_code: u16) -> &'static str {
    match status_code {
        100 => "Trying",
        180 => "Ringing",
        181 => "Call Is Being Forwarded",
        182 => "Queued",
        183 => "Session Progress",
        200 => "OK",
        202 => "Accepted",
        204 => "No Notification",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Moved Temporarily",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        415 => "Unsupported Media Type",
        420 => "Bad Extension",
        423 => "Interval Too Brief",
        480 => "Temporarily Unavailable",
        481 => "Call/Transaction Does Not Exist",
        482 => "Loop Detected",
        483 => "Too Many Hops",
        486 => "Busy Here",
        487 => "Request Terminated",
        488 => "Not Acceptable Here",
        489 => "Bad Event",
        491 => "Request Pending",
        500 => "Server Internal Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        504 => "Server Time-out",
        600 => "Busy Everywhere",
        603 => "Decline",
        604 => "Does Not Exist Anywhere",
        606 => "Not Acceptable",
        100..=199 => "Session Progress",
        200..=299 => "OK",
        300..=399 => "Redirection",
        400..=499 => "Client Error",
        500..=599 => "Server Error",
        _ => "Global Failure",
    }
}

/// Build a SIP response from a request (RFC 3261 §8.2.6.2). `to_tag` is
/// added to To when the request has none and the response is not a 100.
pub fn build_response_from_request(
    request: &SipRequest,
    status_code: u16,
    reason_phrase: &str,
    to_tag: Option<&str>,
) -> SipResponse {
    let mut headers: HeaderMap = HashMap::new();

    // Copy essential headers from request
    for name in ["via", "from", "call-id", "cseq"] {
        if let Some(values) = request.headers.get(name) {
            headers.insert(name.to_string(), values.clone());
        }
    }

    if let Some(to) = request.header("to") {
        let value = match to_tag {
            Some(tag) if status_code != 100 && extract_tag(to).is_none() => {
                format!("{};tag={}", to, tag)
            }
            _ => to.to_string(),
        };
        headers.insert("to".to_string(), vec![value]);
    }

    if status_code == 100 {
        if let Some(timestamp) = request.headers.get("timestamp") {
            headers.insert("timestamp".to_string(), timestamp.clone());
        }
    }

    SipResponse {
        version: request.version.clone(),
        status_code,
        reason_phrase: reason_phrase.to_string(),
        headers,
        body: None,
    }
}

/// Helper to create common SIP headers
#[derive(Default)]
pub struct HeaderBuilder {
    headers: HeaderMap,
}

impl HeaderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn via(mut self, value: &str) -> Self {
        self.headers
            .entry("via".to_string())
            .or_default()
            .push(value.to_string());
        self
    }

    /// From with the given tag, or a fresh one.
    pub fn from(mut self, uri: &SipUri, tag: Option<&str>) -> Self {
        let tag = tag.map(str::to_string).unwrap_or_else(generate_tag);
        self.headers
            .insert("from".to_string(), vec![format!("<{}>;tag={}", uri, tag)]);
        self
    }

    pub fn to(mut self, uri: &SipUri, tag: Option<&str>) -> Self {
        let value = match tag {
            Some(tag) => format!("<{}>;tag={}", uri, tag),
            None => format!("<{}>", uri),
        };
        self.headers.insert("to".to_string(), vec![value]);
        self
    }

    pub fn call_id(mut self, call_id: &str) -> Self {
        self.headers
            .insert("call-id".to_string(), vec![call_id.to_string()]);
        self
    }

    pub fn cseq(mut self, seq: u32, method: &SipMethod) -> Self {
        self.headers
            .insert("cseq".to_string(), vec![format!("{} {}", seq, method)]);
        self
    }

    pub fn max_forwards(mut self, max_forwards: u32) -> Self {
        self.headers
            .insert("max-forwards".to_string(), vec![max_forwards.to_string()]);
        self
    }

    pub fn contact(mut self, uri: &SipUri) -> Self {
        self.headers
            .insert("contact".to_string(), vec![format!("<{}>", uri)]);
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .entry(name.to_lowercase())
            .or_default()
            .push(value.to_string());
        self
    }

    /// Finish as a request. Without a Via the agent inserts one on send.
    pub fn request(self, method: SipMethod, uri: SipUri) -> SipRequest {
        let mut request = SipRequest::new(method, uri);
        request.headers = self.headers;
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_generation() {
        let branch1 = generate_branch();
        let branch2 = generate_branch();

        assert!(branch1.starts_with("z9hG4bK"));
        assert!(branch2.starts_with("z9hG4bK"));
        assert_ne!(branch1, branch2);
    }

    #[test]
    fn test_extract_tag() {
        let from = "Alice <sip:alice@atlanta.com>;tag=1928301774";
        assert_eq!(extract_tag(from), Some("1928301774".to_string()));

        let to = "Bob <sip:bob@biloxi.com>";
        assert_eq!(extract_tag(to), None);

        // URI parameter named tag is not the header tag
        let odd = "<sip:bob@biloxi.com;tag=uri>";
        assert_eq!(extract_tag(odd), None);

        let bare = "sip:carol@chicago.com;tag=abc";
        assert_eq!(extract_tag(bare), Some("abc".to_string()));
    }

    #[test]
    fn test_build_response_adds_to_tag() {
        let request = HeaderBuilder::new()
            .via("SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776asdhds")
            .via("SIP/2.0/UDP proxy.atlanta.com;branch=z9hG4bKproxy")
            .from(&"sip:alice@atlanta.com".parse().unwrap(), Some("1928301774"))
            .to(&"sip:bob@biloxi.com".parse().unwrap(), None)
            .call_id("a84b4c76e66710@pc33.atlanta.com")
            .cseq(314159, &SipMethod::Invite)
            .header("timestamp", "54")
            .request(SipMethod::Invite, "sip:bob@biloxi.com".parse().unwrap());

        let trying = build_response_from_request(&request, 100, "Trying", Some("xyz"));
        assert_eq!(trying.to_tag(), None);
        assert_eq!(trying.header("timestamp"), Some("54"));

        let ok = build_response_from_request(&request, 200, "OK", Some("xyz"));
        assert_eq!(ok.to_tag().as_deref(), Some("xyz"));
        assert_eq!(ok.header_values("via").len(), 2);
        assert_eq!(ok.header("cseq"), Some("314159 INVITE"));
        assert!(ok.header("timestamp").is_none());
    }

    #[test]
    fn test_header_builder() {
        let alice: SipUri = "sip:alice@atlanta.com".parse().unwrap();
        let request = HeaderBuilder::new()
            .via("SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776asdhds")
            .from(&alice, None)
            .to(&"sip:bob@biloxi.com".parse().unwrap(), None)
            .call_id("a84b4c76e66710@pc33.atlanta.com")
            .cseq(314159, &SipMethod::Invite)
            .max_forwards(70)
            .contact(&alice)
            .request(SipMethod::Invite, "sip:bob@biloxi.com".parse().unwrap());

        assert!(request.top_via().is_some());
        assert!(request.from_tag().is_some());
        assert_eq!(request.header("to"), Some("<sip:bob@biloxi.com>"));
        assert_eq!(request.header("cseq"), Some("314159 INVITE"));
        assert_eq!(request.max_forwards(), Some(70));
        assert_eq!(request.header("contact"), Some("<sip:alice@atlanta.com>"));
    }

    #[test]
    fn test_reason_phrases() {
        assert_eq!(reason_phrase(487), "Request Terminated");
        assert_eq!(reason_phrase(499), "Client Error");
        assert_eq!(reason_phrase(699), "Global Failure");
    }
}
