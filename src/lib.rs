// lib.rs - SIP user agent core: message model, transactions, dialogs and subscriptions

use bytes::{BufMut, Bytes, BytesMut};
use nom::{
    bytes::complete::{tag, take_till1, take_while, take_while1},
    character::complete::{char, digit1, space0, space1},
    combinator::{map_res, opt, recognize, rest},
    multi::many0,
    sequence::{pair, preceded, terminated, tuple},
    IResult,
};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub mod agent;
pub mod codec;
pub mod dialog;
pub mod error;
pub mod headers;
pub mod subscription;
pub mod timer;
pub mod transaction;
pub mod transport;
pub mod uac;
pub mod uas;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_support;

pub use agent::{Agent, AgentConfig, RequestHandler};
pub use dialog::{Dialog, DialogHandle, DialogId, DialogState, DialogStore, SessionSlot};
pub use error::{SipError, TransportError};
pub use headers::{CSeq, EventHeader, NameAddr, SubscriptionStateHeader, Via};
pub use subscription::{
    Subscription, SubscriptionHandle, SubscriptionId, SubscriptionState, SubscriptionStore,
};
pub use timer::TimerConfig;
pub use transaction::{
    ClientEvent, ClientTransaction, Reply, ServerTransaction, TransactionKey, TransactionState,
};
pub use transport::{Reliability, Transport, TransportProtocol, ViaAddress};

// Security limits based on RFC recommendations and common attack vectors
pub const MAX_HEADER_LENGTH: usize = 8192;
pub const MAX_HEADERS: usize = 256;
pub const MAX_URI_LENGTH: usize = 2048;
pub const MAX_BODY_LENGTH: usize = 65536;
pub const MAX_VIA_HEADERS: usize = 70; // RFC 3261 recommendation
pub const MAX_ROUTE_HEADERS: usize = 20;

pub const SIP_VERSION: &str = "SIP/2.0";

#[derive(Error, Debug)]
pub enum SipParseError {
    #[error("Header too long: {0} bytes (max: {1})")]
    HeaderTooLong(usize, usize),

    #[error("Too many headers: {0} (max: {1})")]
    TooManyHeaders(usize, usize),

    #[error("URI too long: {0} bytes (max: {1})")]
    UriTooLong(usize, usize),

    #[error("Body too long: {0} bytes (max: {1})")]
    BodyTooLong(usize, usize),

    #[error("Invalid SIP version: {0}")]
    InvalidVersion(String),

    #[error("Invalid method: {0}")]
    InvalidMethod(String),

    #[error("Invalid status code: {0}")]
    InvalidStatusCode(u16),

    #[error("Missing required header: {0}")]
    MissingRequiredHeader(String),

    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Security violation: {0}")]
    SecurityViolation(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Options,
    Info,
    Update,
    Prack,
    Subscribe,
    Notify,
    Refer,
    Message,
    Publish,
    Other(String),
}

impl SipMethod {
    /// Methods whose requests may carry a new remote target (RFC 3261 §12.2, RFC 6665).
    pub fn is_target_refresh(&self) -> bool {
        matches!(
            self,
            SipMethod::Invite
                | SipMethod::Update
                | SipMethod::Subscribe
                | SipMethod::Notify
                | SipMethod::Refer
        )
    }

    /// Methods that establish a dialog when sent outside of one.
    pub fn creates_dialog(&self) -> bool {
        matches!(self, SipMethod::Invite | SipMethod::Subscribe | SipMethod::Refer)
    }
}

impl FromStr for SipMethod {
    type Err = SipParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Validate method length to prevent DoS
        if s.is_empty() || s.len() > 32 {
            return Err(SipParseError::InvalidMethod(s.to_string()));
        }

        if !s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(SipParseError::InvalidMethod(s.to_string()));
        }

        // Method names are case-sensitive on the wire
        Ok(match s {
            "REGISTER" => SipMethod::Register,
            "INVITE" => SipMethod::Invite,
            "ACK" => SipMethod::Ack,
            "BYE" => SipMethod::Bye,
            "CANCEL" => SipMethod::Cancel,
            "OPTIONS" => SipMethod::Options,
            "INFO" => SipMethod::Info,
            "UPDATE" => SipMethod::Update,
            "PRACK" => SipMethod::Prack,
            "SUBSCRIBE" => SipMethod::Subscribe,
            "NOTIFY" => SipMethod::Notify,
            "REFER" => SipMethod::Refer,
            "MESSAGE" => SipMethod::Message,
            "PUBLISH" => SipMethod::Publish,
            method => SipMethod::Other(method.to_string()),
        })
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipMethod::Register => write!(f, "REGISTER"),
            SipMethod::Invite => write!(f, "INVITE"),
            SipMethod::Ack => write!(f, "ACK"),
            SipMethod::Bye => write!(f, "BYE"),
            SipMethod::Cancel => write!(f, "CANCEL"),
            SipMethod::Options => write!(f, "OPTIONS"),
            SipMethod::Info => write!(f, "INFO"),
            SipMethod::Update => write!(f, "UPDATE"),
            SipMethod::Prack => write!(f, "PRACK"),
            SipMethod::Subscribe => write!(f, "SUBSCRIBE"),
            SipMethod::Notify => write!(f, "NOTIFY"),
            SipMethod::Refer => write!(f, "REFER"),
            SipMethod::Message => write!(f, "MESSAGE"),
            SipMethod::Publish => write!(f, "PUBLISH"),
            SipMethod::Other(s) => write!(f, "{}", s),
        }
    }
}

/// Ordered `name[=value]` parameter list shared by URIs and header values.
pub type Params = Vec<(String, Option<String>)>;

pub(crate) fn find_param<'a>(params: &'a Params, name: &str) -> Option<&'a Option<String>> {
    params
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value)
}

pub(crate) fn write_params(f: &mut fmt::Formatter<'_>, params: &Params) -> fmt::Result {
    for (key, value) in params {
        write!(f, ";{}", key)?;
        if let Some(val) = value {
            write!(f, "={}", val)?;
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipUri {
    pub scheme: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub parameters: Params,
    pub headers: Vec<(String, String)>,
}

impl SipUri {
    pub fn new(scheme: &str, host: &str) -> Self {
        Self {
            scheme: scheme.to_string(),
            user: None,
            password: None,
            host: host.to_string(),
            port: None,
            parameters: Vec::new(),
            headers: Vec::new(),
        }
    }

    pub fn with_user(mut self, user: &str) -> Self {
        self.user = Some(user.to_string());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Value of a URI parameter; flag parameters yield an empty string.
    pub fn param(&self, name: &str) -> Option<&str> {
        find_param(&self.parameters, name).map(|v| v.as_deref().unwrap_or(""))
    }

    /// Loose-routing URIs carry the `lr` flag (RFC 3261 §16.12).
    pub fn is_loose_router(&self) -> bool {
        self.param("lr").is_some()
    }

    pub fn is_secure(&self) -> bool {
        self.scheme.eq_ignore_ascii_case("sips")
    }

    /// `host[:port]` as written in the URI.
    pub fn host_port(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), SipParseError> {
        // Validate URI length
        let uri_str = self.to_string();
        if uri_str.len() > MAX_URI_LENGTH {
            return Err(SipParseError::UriTooLong(uri_str.len(), MAX_URI_LENGTH));
        }

        // Validate scheme
        if !matches!(self.scheme.as_str(), "sip" | "sips" | "tel") {
            return Err(SipParseError::ParseError(format!(
                "Invalid URI scheme: {}",
                self.scheme
            )));
        }

        // Validate host (prevent various injection attacks)
        if self.host.is_empty() || self.host.len() > 255 {
            return Err(SipParseError::ParseError("Invalid host in URI".to_string()));
        }

        // Check for suspicious characters that might indicate injection attempts
        let suspicious_chars = ['<', '>', '"', '{', '}', '|', '\\', '^', '`'];
        if self.host.chars().any(|c| suspicious_chars.contains(&c)) {
            return Err(SipParseError::SecurityViolation(
                "Suspicious characters in URI host".to_string(),
            ));
        }

        Ok(())
    }
}

impl FromStr for SipUri {
    type Err = SipParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() > MAX_URI_LENGTH {
            return Err(SipParseError::UriTooLong(s.len(), MAX_URI_LENGTH));
        }
        match parse_uri(s) {
            Ok(("", uri)) => Ok(uri),
            Ok((remaining, _)) => Err(SipParseError::ParseError(format!(
                "Trailing characters in URI: {}",
                remaining
            ))),
            Err(_) => Err(SipParseError::ParseError(format!("Invalid URI: {}", s))),
        }
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;

        if let Some(user) = &self.user {
            write!(f, "{}", user)?;
            if let Some(password) = &self.password {
                write!(f, ":{}", password)?;
            }
            write!(f, "@")?;
        }

        write!(f, "{}", self.host)?;

        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }

        write_params(f, &self.parameters)?;

        if !self.headers.is_empty() {
            write!(f, "?")?;
            let headers: Vec<String> = self
                .headers
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            write!(f, "{}", headers.join("&"))?;
        }

        Ok(())
    }
}

/// Header map keyed by lower-cased long header name; values keep wire order.
pub type HeaderMap = HashMap<String, Vec<String>>;

/// Typed read access shared by requests, responses and the message enum.
pub trait MessageHeaders {
    fn header_map(&self) -> &HeaderMap;

    /// First value of a header.
    fn header(&self, name: &str) -> Option<&str> {
        self.header_map()
            .get(&name.to_ascii_lowercase())
            .and_then(|values| values.first())
            .map(|s| s.as_str())
    }

    fn header_values(&self, name: &str) -> &[String] {
        self.header_map()
            .get(&name.to_ascii_lowercase())
            .map(|values| values.as_slice())
            .unwrap_or(&[])
    }

    fn call_id(&self) -> Option<&str> {
        self.header("call-id")
    }

    fn top_via(&self) -> Option<headers::Via> {
        self.header("via").and_then(|v| v.parse().ok())
    }

    fn cseq(&self) -> Option<headers::CSeq> {
        self.header("cseq").and_then(|v| v.parse().ok())
    }

    fn from_tag(&self) -> Option<String> {
        self.header("from").and_then(utils::extract_tag)
    }

    fn to_tag(&self) -> Option<String> {
        self.header("to").and_then(utils::extract_tag)
    }

    fn from_addr(&self) -> Option<headers::NameAddr> {
        self.header("from").and_then(|v| v.parse().ok())
    }

    fn to_addr(&self) -> Option<headers::NameAddr> {
        self.header("to").and_then(|v| v.parse().ok())
    }

    /// URI of the first Contact, ignoring the `*` wildcard.
    fn contact_uri(&self) -> Option<SipUri> {
        self.header("contact")
            .filter(|v| v.trim() != "*")
            .and_then(|v| v.parse::<headers::NameAddr>().ok())
            .map(|addr| addr.uri)
    }

    fn record_route(&self) -> Vec<headers::NameAddr> {
        self.header_values("record-route")
            .iter()
            .filter_map(|v| v.parse().ok())
            .collect()
    }

    fn route(&self) -> Vec<headers::NameAddr> {
        self.header_values("route")
            .iter()
            .filter_map(|v| v.parse().ok())
            .collect()
    }

    fn expires(&self) -> Option<u32> {
        self.header("expires").and_then(|v| v.trim().parse().ok())
    }

    fn max_forwards(&self) -> Option<u32> {
        self.header("max-forwards").and_then(|v| v.trim().parse().ok())
    }

    fn event(&self) -> Option<headers::EventHeader> {
        self.header("event").and_then(|v| v.parse().ok())
    }

    fn subscription_state(&self) -> Option<headers::SubscriptionStateHeader> {
        self.header("subscription-state").and_then(|v| v.parse().ok())
    }

    fn rseq(&self) -> Option<u32> {
        self.header("rseq").and_then(|v| v.trim().parse().ok())
    }

    /// Whether an option tag appears in Require.
    fn requires(&self, option: &str) -> bool {
        self.header_values("require")
            .iter()
            .flat_map(|v| v.split(','))
            .any(|tag| tag.trim().eq_ignore_ascii_case(option))
    }
}

#[derive(Debug, Clone)]
pub struct SipRequest {
    pub method: SipMethod,
    pub uri: SipUri,
    pub version: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

#[derive(Debug, Clone)]
pub struct SipResponse {
    pub version: String,
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl MessageHeaders for SipRequest {
    fn header_map(&self) -> &HeaderMap {
        &self.headers
    }
}

impl MessageHeaders for SipResponse {
    fn header_map(&self) -> &HeaderMap {
        &self.headers
    }
}

impl MessageHeaders for SipMessage {
    fn header_map(&self) -> &HeaderMap {
        self.headers()
    }
}

impl SipRequest {
    pub fn new(method: SipMethod, uri: SipUri) -> Self {
        Self {
            method,
            uri,
            version: SIP_VERSION.to_string(),
            headers: HashMap::new(),
            body: None,
        }
    }

    /// Replace all values of a header.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers
            .insert(name.to_ascii_lowercase(), vec![value.into()]);
    }

    /// Insert a value in front of existing ones (used for Via).
    pub fn push_front_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers
            .entry(name.to_ascii_lowercase())
            .or_default()
            .insert(0, value.into());
    }

    pub fn add_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    pub fn remove_header(&mut self, name: &str) -> Option<Vec<String>> {
        self.headers.remove(&name.to_ascii_lowercase())
    }

    pub fn to_bytes(&self) -> Bytes {
        let start_line = format!("{} {} {}", self.method, self.uri, self.version);
        encode_message(&start_line, &self.headers, self.body.as_ref())
    }
}

impl SipResponse {
    pub fn new(status_code: u16, reason_phrase: &str) -> Self {
        Self {
            version: SIP_VERSION.to_string(),
            status_code,
            reason_phrase: reason_phrase.to_string(),
            headers: HashMap::new(),
            body: None,
        }
    }

    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status_code)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn is_final(&self) -> bool {
        self.status_code >= 200
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers
            .insert(name.to_ascii_lowercase(), vec![value.into()]);
    }

    pub fn add_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    pub fn to_bytes(&self) -> Bytes {
        let start_line = format!(
            "{} {} {}",
            self.version, self.status_code, self.reason_phrase
        );
        encode_message(&start_line, &self.headers, self.body.as_ref())
    }
}

impl SipMessage {
    pub fn headers(&self) -> &HeaderMap {
        match self {
            SipMessage::Request(req) => &req.headers,
            SipMessage::Response(resp) => &resp.headers,
        }
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        match self {
            SipMessage::Request(req) => &mut req.headers,
            SipMessage::Response(resp) => &mut resp.headers,
        }
    }

    pub fn body(&self) -> Option<&Bytes> {
        match self {
            SipMessage::Request(req) => req.body.as_ref(),
            SipMessage::Response(resp) => resp.body.as_ref(),
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            SipMessage::Request(req) => req.to_bytes(),
            SipMessage::Response(resp) => resp.to_bytes(),
        }
    }

    pub fn validate(&self) -> Result<(), SipParseError> {
        // Validate headers count
        if self.headers().len() > MAX_HEADERS {
            return Err(SipParseError::TooManyHeaders(
                self.headers().len(),
                MAX_HEADERS,
            ));
        }

        // Validate required headers
        let required_headers = ["via", "from", "to", "call-id", "cseq"];
        for header in &required_headers {
            if !self.headers().contains_key(*header) {
                return Err(SipParseError::MissingRequiredHeader(header.to_string()));
            }
        }

        // Validate Via headers count (loop detection)
        if let Some(via_headers) = self.headers().get("via") {
            if via_headers.len() > MAX_VIA_HEADERS {
                return Err(SipParseError::SecurityViolation(format!(
                    "Too many Via headers: {} (max: {})",
                    via_headers.len(),
                    MAX_VIA_HEADERS
                )));
            }
        }

        // Validate Route headers count
        if let Some(route_headers) = self.headers().get("route") {
            if route_headers.len() > MAX_ROUTE_HEADERS {
                return Err(SipParseError::SecurityViolation(format!(
                    "Too many Route headers: {} (max: {})",
                    route_headers.len(),
                    MAX_ROUTE_HEADERS
                )));
            }
        }

        let body_len = self.body().map(|b| b.len()).unwrap_or(0);
        if body_len > MAX_BODY_LENGTH {
            return Err(SipParseError::BodyTooLong(body_len, MAX_BODY_LENGTH));
        }

        if let SipMessage::Request(req) = self {
            req.uri.validate()?;
        }

        Ok(())
    }
}

/// Serialize a start line, headers and body. Well-known headers go first in
/// RFC 3261 §7.3.1 recommended order; the rest follow sorted by name.
fn encode_message(start_line: &str, headers: &HeaderMap, body: Option<&Bytes>) -> Bytes {
    const LEADING: [&str; 10] = [
        "via",
        "max-forwards",
        "route",
        "record-route",
        "from",
        "to",
        "call-id",
        "cseq",
        "contact",
        "expires",
    ];

    let body_len = body.map(|b| b.len()).unwrap_or(0);
    let estimated_size = start_line.len()
        + 4
        + headers
            .iter()
            .map(|(k, v)| k.len() + v.iter().map(|val| val.len() + 4).sum::<usize>())
            .sum::<usize>()
        + 32
        + body_len;
    let mut buf = BytesMut::with_capacity(estimated_size);

    buf.put(start_line.as_bytes());
    buf.put(&b"\r\n"[..]);

    let mut rest: Vec<&String> = headers
        .keys()
        .filter(|k| !LEADING.contains(&k.as_str()) && k.as_str() != "content-length")
        .collect();
    rest.sort();

    let ordered = LEADING
        .iter()
        .filter_map(|name| headers.get_key_value(*name).map(|(k, v)| (k.as_str(), v)))
        .chain(rest.into_iter().map(|k| (k.as_str(), &headers[k])));

    for (name, values) in ordered {
        let canonical = headers::canonical_name(name);
        for value in values {
            buf.put(canonical.as_bytes());
            buf.put(&b": "[..]);
            buf.put(value.as_bytes());
            buf.put(&b"\r\n"[..]);
        }
    }

    buf.put(format!("Content-Length: {}\r\n\r\n", body_len).as_bytes());
    if let Some(body) = body {
        buf.put(body.as_ref());
    }

    buf.freeze()
}

// Parser functions using nom
fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-.!%*_+`'~".contains(c)
}

fn is_host_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-._+~!*'()%".contains(c)
}

fn is_param_char(c: char) -> bool {
    !c.is_whitespace() && !";?&=<>,\"".contains(c)
}

fn parse_token(input: &str) -> IResult<&str, &str> {
    take_while1(is_token_char)(input)
}

fn parse_method(input: &str) -> IResult<&str, SipMethod> {
    map_res(parse_token, SipMethod::from_str)(input)
}

fn parse_sip_version(input: &str) -> IResult<&str, &str> {
    recognize(tuple((tag("SIP"), char('/'), digit1, char('.'), digit1)))(input)
}

fn parse_uri_scheme(input: &str) -> IResult<&str, &str> {
    terminated(
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.'),
        char(':'),
    )(input)
}

fn parse_host(input: &str) -> IResult<&str, &str> {
    nom::branch::alt((
        recognize(tuple((char('['), take_while1(|c: char| c != ']'), char(']')))),
        take_while1(is_host_char),
    ))(input)
}

fn parse_param(input: &str) -> IResult<&str, (&str, Option<&str>)> {
    preceded(
        pair(space0, char(';')),
        pair(
            preceded(space0, take_while1(is_param_char)),
            opt(preceded(
                tuple((space0, char('='), space0)),
                nom::branch::alt((
                    recognize(tuple((char('"'), take_while(|c: char| c != '"'), char('"')))),
                    take_while1(is_param_char),
                )),
            )),
        ),
    )(input)
}

/// Parameter list in `;name[=value]` form, shared with header parsing.
pub(crate) fn parse_params(input: &str) -> IResult<&str, Params> {
    let (input, params) = many0(parse_param)(input)?;
    Ok((
        input,
        params
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.map(|v| v.to_string())))
            .collect(),
    ))
}

fn parse_uri_headers(input: &str) -> IResult<&str, Vec<(String, String)>> {
    let (input, raw) = opt(preceded(char('?'), take_while1(|c: char| !c.is_whitespace() && c != '>')))(input)?;
    let headers = raw
        .map(|raw| {
            raw.split('&')
                .filter_map(|pair| {
                    let (k, v) = pair.split_once('=')?;
                    Some((k.to_string(), v.to_string()))
                })
                .collect()
        })
        .unwrap_or_default();
    Ok((input, headers))
}

pub(crate) fn parse_uri(input: &str) -> IResult<&str, SipUri> {
    let (input, scheme) = parse_uri_scheme(input)?;

    // userinfo is everything up to '@' when one appears before the header part
    let (input, user_info) = opt(terminated(
        take_till1(|c: char| c == '@' || c == '?' || c == '>' || c.is_whitespace()),
        char('@'),
    ))(input)?;

    let (input, host) = parse_host(input)?;
    let (input, port) = opt(preceded(char(':'), map_res(digit1, str::parse::<u16>)))(input)?;
    let (input, parameters) = many0(preceded(
        char(';'),
        pair(
            take_while1(is_param_char),
            opt(preceded(char('='), take_while1(is_param_char))),
        ),
    ))(input)?;
    let (input, headers) = parse_uri_headers(input)?;

    let mut uri = SipUri::new(&scheme.to_ascii_lowercase(), host);
    uri.port = port;
    uri.headers = headers;
    uri.parameters = parameters
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.map(|v| v.to_string())))
        .collect();

    if let Some(info) = user_info {
        match info.split_once(':') {
            Some((user, password)) => {
                uri.user = Some(user.to_string());
                uri.password = Some(password.to_string());
            }
            None => uri.user = Some(info.to_string()),
        }
    }

    Ok((input, uri))
}

fn parse_header_name(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')(input)
}

fn parse_header(input: &str) -> IResult<&str, (&str, &str)> {
    let (input, name) = parse_header_name(input)?;
    let (input, _) = tuple((space0, char(':'), space0))(input)?;
    let (input, value) = rest(input)?;
    Ok((input, (name, value.trim())))
}

fn parse_request_line(input: &str) -> IResult<&str, (SipMethod, SipUri, &str)> {
    let (input, method) = parse_method(input)?;
    let (input, _) = space1(input)?;
    let (input, uri) = parse_uri(input)?;
    let (input, _) = space1(input)?;
    let (input, version) = parse_sip_version(input)?;
    let (input, _) = space0(input)?;

    Ok((input, (method, uri, version)))
}

fn parse_status_line(input: &str) -> IResult<&str, (&str, u16, &str)> {
    let (input, version) = parse_sip_version(input)?;
    let (input, _) = space1(input)?;
    let (input, status_code) = map_res(
        recognize(tuple((
            nom::character::complete::satisfy(|c| c.is_ascii_digit()),
            nom::character::complete::satisfy(|c| c.is_ascii_digit()),
            nom::character::complete::satisfy(|c| c.is_ascii_digit()),
        ))),
        str::parse,
    )(input)?;
    let (input, _) = space0(input)?;
    let (input, reason) = rest(input)?;

    Ok((input, (version, status_code, reason.trim_end())))
}

/// Split raw bytes at the blank line ending the header section.
fn split_head(input: &[u8]) -> Result<(&[u8], &[u8]), SipParseError> {
    if let Some(pos) = input.windows(4).position(|w| w == b"\r\n\r\n") {
        return Ok((&input[..pos], &input[pos + 4..]));
    }
    if let Some(pos) = input.windows(2).position(|w| w == b"\n\n") {
        return Ok((&input[..pos], &input[pos + 2..]));
    }
    if input.len() > MAX_HEADER_LENGTH {
        return Err(SipParseError::HeaderTooLong(input.len(), MAX_HEADER_LENGTH));
    }
    Err(SipParseError::ParseError(
        "Missing end of header section".to_string(),
    ))
}

/// Join folded continuation lines (RFC 3261 §7.3.1) into logical lines.
fn unfold_lines(head: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for raw in head.split('\n') {
        let line = raw.trim_end_matches('\r');
        if line.starts_with([' ', '\t']) {
            if let Some(last) = lines.last_mut() {
                last.push(' ');
                last.push_str(line.trim());
                continue;
            }
        }
        lines.push(line.to_string());
    }
    lines
}

fn parse_headers(lines: &[String]) -> Result<HeaderMap, SipParseError> {
    if lines.len() > MAX_HEADERS {
        return Err(SipParseError::TooManyHeaders(lines.len(), MAX_HEADERS));
    }

    let mut headers: HeaderMap = HashMap::new();
    for line in lines.iter().filter(|l| !l.is_empty()) {
        let (_, (name, value)) = parse_header(line)
            .map_err(|_| SipParseError::MalformedHeader(line.clone()))?;
        let normalized_name = headers::expand_compact_name(&name.to_ascii_lowercase());
        let entry = headers.entry(normalized_name.clone()).or_default();
        if headers::is_list_header(&normalized_name) {
            entry.extend(
                headers::split_header_list(value)
                    .into_iter()
                    .map(|v| v.to_string()),
            );
        } else {
            entry.push(value.to_string());
        }
    }

    Ok(headers)
}

fn extract_body(headers: &HeaderMap, remaining: &[u8]) -> Result<Option<Bytes>, SipParseError> {
    let declared = match headers.get("content-length").and_then(|v| v.first()) {
        Some(value) => Some(value.trim().parse::<usize>().map_err(|_| {
            SipParseError::MalformedHeader("Invalid Content-Length".to_string())
        })?),
        None => None,
    };

    let body = match declared {
        Some(len) if len > MAX_BODY_LENGTH => {
            return Err(SipParseError::BodyTooLong(len, MAX_BODY_LENGTH));
        }
        Some(len) if len > remaining.len() => {
            return Err(SipParseError::SecurityViolation(format!(
                "Content-Length mismatch: header={}, actual={}",
                len,
                remaining.len()
            )));
        }
        // Datagram bytes past Content-Length are discarded (RFC 3261 §18.3)
        Some(len) => &remaining[..len],
        None => remaining,
    };

    Ok(if body.is_empty() {
        None
    } else {
        Some(Bytes::copy_from_slice(body))
    })
}

pub fn parse_sip_message(input: &[u8]) -> Result<SipMessage, SipParseError> {
    // Security check: validate input size
    if input.len() > MAX_HEADER_LENGTH + MAX_BODY_LENGTH {
        return Err(SipParseError::SecurityViolation(
            "Message too large".to_string(),
        ));
    }

    let (head, remaining) = split_head(input)?;
    if head.len() > MAX_HEADER_LENGTH {
        return Err(SipParseError::HeaderTooLong(head.len(), MAX_HEADER_LENGTH));
    }

    let head = std::str::from_utf8(head)
        .map_err(|_| SipParseError::ParseError("Invalid UTF-8".to_string()))?;
    let lines = unfold_lines(head.trim_start_matches(['\r', '\n']));
    let (start_line, header_lines) = lines
        .split_first()
        .ok_or_else(|| SipParseError::ParseError("Empty message".to_string()))?;

    let headers = parse_headers(header_lines)?;
    let body = extract_body(&headers, remaining)?;

    let message = if start_line.starts_with("SIP/") {
        let (_, (version, status_code, reason_phrase)) = parse_status_line(start_line)
            .map_err(|_| SipParseError::ParseError(format!("Invalid status line: {}", start_line)))?;
        if !(100..700).contains(&status_code) {
            return Err(SipParseError::InvalidStatusCode(status_code));
        }
        if version != SIP_VERSION {
            return Err(SipParseError::InvalidVersion(version.to_string()));
        }
        SipMessage::Response(SipResponse {
            version: version.to_string(),
            status_code,
            reason_phrase: reason_phrase.to_string(),
            headers,
            body,
        })
    } else {
        let (_, (method, uri, version)) = parse_request_line(start_line)
            .map_err(|_| SipParseError::ParseError(format!("Invalid request line: {}", start_line)))?;
        if version != SIP_VERSION {
            return Err(SipParseError::InvalidVersion(version.to_string()));
        }
        SipMessage::Request(SipRequest {
            method,
            uri,
            version: version.to_string(),
            headers,
            body,
        })
    };

    message.validate()?;
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_request() {
        let request = b"INVITE sip:bob@example.com SIP/2.0\r\n\
                       Via: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776asdhds\r\n\
                       From: Alice <sip:alice@atlanta.com>;tag=1928301774\r\n\
                       To: Bob <sip:bob@example.com>\r\n\
                       Call-ID: a84b4c76e66710@pc33.atlanta.com\r\n\
                       CSeq: 314159 INVITE\r\n\
                       Max-Forwards: 70\r\n\
                       Content-Length: 0\r\n\
                       \r\n";

        let result = parse_sip_message(request);
        assert!(result.is_ok());

        if let Ok(SipMessage::Request(req)) = result {
            assert_eq!(req.method, SipMethod::Invite);
            assert_eq!(req.uri.scheme, "sip");
            assert_eq!(req.uri.user.as_deref(), Some("bob"));
            assert_eq!(req.uri.host, "example.com");
            assert_eq!(req.version, "SIP/2.0");
            assert_eq!(req.call_id(), Some("a84b4c76e66710@pc33.atlanta.com"));
            assert_eq!(req.from_tag().as_deref(), Some("1928301774"));
            assert_eq!(req.to_tag(), None);
            assert_eq!(req.max_forwards(), Some(70));
            let via = req.top_via().unwrap();
            assert_eq!(via.branch(), Some("z9hG4bK776asdhds"));
            assert_eq!(via.sent_by(), "pc33.atlanta.com");
            let cseq = req.cseq().unwrap();
            assert_eq!(cseq.seq, 314159);
            assert_eq!(cseq.method, SipMethod::Invite);
        } else {
            panic!("Expected request");
        }
    }

    #[test]
    fn test_parse_response() {
        let response = b"SIP/2.0 200 OK\r\n\
                        Via: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776asdhds\r\n\
                        From: Alice <sip:alice@atlanta.com>;tag=1928301774\r\n\
                        To: Bob <sip:bob@example.com>;tag=a6c85cf\r\n\
                        Call-ID: a84b4c76e66710@pc33.atlanta.com\r\n\
                        CSeq: 314159 INVITE\r\n\
                        Content-Length: 0\r\n\
                        \r\n";

        let result = parse_sip_message(response);
        assert!(result.is_ok());

        if let Ok(SipMessage::Response(resp)) = result {
            assert_eq!(resp.status_code, 200);
            assert_eq!(resp.reason_phrase, "OK");
            assert_eq!(resp.version, "SIP/2.0");
            assert_eq!(resp.to_tag().as_deref(), Some("a6c85cf"));
            assert!(resp.is_success());
        } else {
            panic!("Expected response");
        }
    }

    #[test]
    fn test_security_header_too_long() {
        let mut request = b"INVITE sip:bob@example.com SIP/2.0\r\n".to_vec();
        request.extend_from_slice(b"X-Long-Header: ");
        request.extend(vec![b'A'; MAX_HEADER_LENGTH]);
        request.extend_from_slice(b"\r\n\r\n");

        let result = parse_sip_message(&request);
        assert!(result.is_err());
    }

    #[test]
    fn test_security_too_many_via_headers() {
        let mut request = b"INVITE sip:bob@example.com SIP/2.0\r\n".to_vec();

        // Add required headers
        request.extend_from_slice(b"From: <sip:alice@example.com>\r\n");
        request.extend_from_slice(b"To: <sip:bob@example.com>\r\n");
        request.extend_from_slice(b"Call-ID: test123\r\n");
        request.extend_from_slice(b"CSeq: 1 INVITE\r\n");

        // Add too many Via headers
        for i in 0..MAX_VIA_HEADERS + 1 {
            request.extend_from_slice(format!("Via: SIP/2.0/UDP host{}.com\r\n", i).as_bytes());
        }

        request.extend_from_slice(b"Content-Length: 0\r\n\r\n");

        let result = parse_sip_message(&request);
        assert!(matches!(result, Err(SipParseError::SecurityViolation(_))));
    }

    #[test]
    fn test_content_length_mismatch() {
        let request = b"INVITE sip:bob@example.com SIP/2.0\r\n\
                       Via: SIP/2.0/UDP pc33.atlanta.com\r\n\
                       From: <sip:alice@example.com>\r\n\
                       To: <sip:bob@example.com>\r\n\
                       Call-ID: test123\r\n\
                       CSeq: 1 INVITE\r\n\
                       Content-Length: 10\r\n\
                       \r\n\
                       Hello";

        let result = parse_sip_message(request);
        assert!(matches!(result, Err(SipParseError::SecurityViolation(_))));
    }

    #[test]
    fn test_datagram_body_truncated_to_content_length() {
        let request = b"MESSAGE sip:bob@example.com SIP/2.0\r\n\
                       Via: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bKm1\r\n\
                       From: <sip:alice@example.com>;tag=1\r\n\
                       To: <sip:bob@example.com>\r\n\
                       Call-ID: trunc\r\n\
                       CSeq: 1 MESSAGE\r\n\
                       Content-Length: 5\r\n\
                       \r\n\
                       Hello world";

        let message = parse_sip_message(request).unwrap();
        assert_eq!(message.body().unwrap().as_ref(), b"Hello");
    }

    #[test]
    fn test_compact_and_folded_headers() {
        let request = b"OPTIONS sip:carol@chicago.com SIP/2.0\r\n\
                       v: SIP/2.0/UDP a.example.com;branch=z9hG4bKa, SIP/2.0/UDP b.example.com;branch=z9hG4bKb\r\n\
                       f: <sip:alice@example.com>;tag=88\r\n\
                       t: <sip:carol@chicago.com>\r\n\
                       i: compact-1\r\n\
                       CSeq: 7 OPTIONS\r\n\
                       Subject: first line\r\n\
                       \x20  continued\r\n\
                       \tand again\r\n\
                       l: 0\r\n\
                       \r\n";

        let message = parse_sip_message(request).unwrap();
        assert_eq!(message.header_values("via").len(), 2);
        assert_eq!(message.call_id(), Some("compact-1"));
        assert_eq!(message.header("subject"), Some("first line continued and again"));
        assert_eq!(
            message.top_via().unwrap().branch(),
            Some("z9hG4bKa")
        );
    }

    #[test]
    fn test_record_route_list_keeps_order() {
        let response = b"SIP/2.0 180 Ringing\r\n\
                        Via: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK1\r\n\
                        Record-Route: <sip:p1.example.com;lr>, <sip:p2.example.com;lr>\r\n\
                        Record-Route: <sip:p3.example.com;lr>\r\n\
                        From: <sip:alice@atlanta.com>;tag=1\r\n\
                        To: <sip:bob@biloxi.com>;tag=2\r\n\
                        Call-ID: rr\r\n\
                        CSeq: 1 INVITE\r\n\
                        Contact: \"Bob\" <sip:bob@192.0.2.4:5070;transport=udp>\r\n\
                        \r\n";

        let message = parse_sip_message(response).unwrap();
        let hosts: Vec<String> = message
            .record_route()
            .into_iter()
            .map(|addr| addr.uri.host)
            .collect();
        assert_eq!(hosts, vec!["p1.example.com", "p2.example.com", "p3.example.com"]);

        let contact = message.contact_uri().unwrap();
        assert_eq!(contact.host, "192.0.2.4");
        assert_eq!(contact.port, Some(5070));
        assert_eq!(contact.param("transport"), Some("udp"));
    }

    #[test]
    fn test_serialize_then_parse_preserves_identity_fields() {
        let mut request = SipRequest::new(
            SipMethod::Register,
            "sip:registrar.example.com".parse().unwrap(),
        );
        request.set_header("via", "SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKreg");
        request.set_header("from", "<sip:alice@example.com>;tag=abc");
        request.set_header("to", "<sip:alice@example.com>");
        request.set_header("call-id", "reg-1");
        request.set_header("cseq", "1 REGISTER");
        request.set_header("expires", "7200");
        request.body = Some(Bytes::from_static(b"hi"));

        let bytes = request.to_bytes();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.starts_with("REGISTER sip:registrar.example.com SIP/2.0\r\nVia: "));
        assert!(text.contains("Call-ID: reg-1\r\n"));
        assert!(text.contains("CSeq: 1 REGISTER\r\n"));
        assert!(text.ends_with("Content-Length: 2\r\n\r\nhi"));

        let parsed = parse_sip_message(&bytes).unwrap();
        assert_eq!(parsed.expires(), Some(7200));
        assert_eq!(parsed.from_tag().as_deref(), Some("abc"));
    }

    #[test]
    fn test_uri_with_password_params_and_headers() {
        let uri: SipUri = "sips:alice:secret@[2001:db8::1]:5061;transport=tcp;lr?subject=hi"
            .parse()
            .unwrap();
        assert_eq!(uri.scheme, "sips");
        assert_eq!(uri.user.as_deref(), Some("alice"));
        assert_eq!(uri.password.as_deref(), Some("secret"));
        assert_eq!(uri.host, "[2001:db8::1]");
        assert_eq!(uri.port, Some(5061));
        assert!(uri.is_loose_router());
        assert!(uri.is_secure());
        assert_eq!(uri.headers, vec![("subject".to_string(), "hi".to_string())]);
        assert_eq!(
            uri.to_string(),
            "sips:alice:secret@[2001:db8::1]:5061;transport=tcp;lr?subject=hi"
        );
    }

    #[test]
    fn test_missing_required_header() {
        let request = b"OPTIONS sip:bob@example.com SIP/2.0\r\n\
                       Via: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK1\r\n\
                       To: <sip:bob@example.com>\r\n\
                       Call-ID: x\r\n\
                       CSeq: 1 OPTIONS\r\n\
                       \r\n";

        let result = parse_sip_message(request);
        assert!(matches!(result, Err(SipParseError::MissingRequiredHeader(h)) if h == "from"));
    }
}
