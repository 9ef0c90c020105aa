// headers.rs - Typed views over the header values the transaction layer reads

use crate::{find_param, parse_params, parse_uri, write_params, Params, SipMethod, SipParseError, SipUri};
use nom::{
    bytes::complete::{take_till, take_while1},
    character::complete::{char, digit1, space0, space1},
    combinator::{map_res, opt},
    sequence::{delimited, preceded, tuple},
    IResult,
};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

/// Expand RFC 3261 §7.3.3 compact header names (plus the common extension ones).
pub fn expand_compact_name(name: &str) -> String {
    match name {
        "v" => "via",
        "f" => "from",
        "t" => "to",
        "i" => "call-id",
        "m" => "contact",
        "l" => "content-length",
        "c" => "content-type",
        "e" => "content-encoding",
        "k" => "supported",
        "s" => "subject",
        "o" => "event",
        "u" => "allow-events",
        "r" => "refer-to",
        "b" => "referred-by",
        "x" => "session-expires",
        other => other,
    }
    .to_string()
}

/// Headers whose comma-separated values are stored as separate entries.
pub fn is_list_header(name: &str) -> bool {
    matches!(name, "via" | "contact" | "route" | "record-route")
}

/// Wire spelling for a lower-cased header name.
pub fn canonical_name(name: &str) -> Cow<'_, str> {
    let known = match name {
        "call-id" => "Call-ID",
        "cseq" => "CSeq",
        "www-authenticate" => "WWW-Authenticate",
        "rseq" => "RSeq",
        "rack" => "RAck",
        "mime-version" => "MIME-Version",
        "sip-etag" => "SIP-ETag",
        "sip-if-match" => "SIP-If-Match",
        _ => "",
    };
    if !known.is_empty() {
        return Cow::Borrowed(known);
    }

    let words: Vec<String> = name
        .split('-')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect();
    Cow::Owned(words.join("-"))
}

/// Split a header value on commas that sit outside quotes and angle brackets.
pub fn split_header_list(value: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut angle_depth = 0u32;
    let mut start = 0;

    for (i, c) in value.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => angle_depth += 1,
            '>' if !in_quotes => angle_depth = angle_depth.saturating_sub(1),
            ',' if !in_quotes && angle_depth == 0 => {
                parts.push(value[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(value[start..].trim());
    parts.into_iter().filter(|p| !p.is_empty()).collect()
}

fn complete<T>(input: &str, result: IResult<&str, T>, what: &str) -> Result<T, SipParseError> {
    match result {
        Ok((remaining, value)) if remaining.trim().is_empty() => Ok(value),
        _ => Err(SipParseError::MalformedHeader(format!("{}: {}", what, input))),
    }
}

/// A single Via entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Via {
    pub transport: String,
    pub host: String,
    pub port: Option<u16>,
    pub params: Params,
}

impl Via {
    pub fn new(transport: &str, sent_by: &str, branch: &str) -> Self {
        let (host, port) = split_host_port(sent_by);
        Self {
            transport: transport.to_ascii_uppercase(),
            host,
            port,
            params: vec![("branch".to_string(), Some(branch.to_string()))],
        }
    }

    pub fn branch(&self) -> Option<&str> {
        find_param(&self.params, "branch").and_then(|v| v.as_deref())
    }

    pub fn received(&self) -> Option<&str> {
        find_param(&self.params, "received").and_then(|v| v.as_deref())
    }

    /// `Some(None)` when `rport` is present without a value.
    pub fn rport(&self) -> Option<Option<u16>> {
        find_param(&self.params, "rport").map(|v| v.as_deref().and_then(|p| p.parse().ok()))
    }

    /// Branch carries the RFC 3261 magic cookie.
    pub fn is_rfc3261(&self) -> bool {
        self.branch().map(|b| b.starts_with("z9hG4bK")).unwrap_or(false)
    }

    pub fn sent_by(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }

    pub fn set_param(&mut self, name: &str, value: Option<String>) {
        match self.params.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
            Some(entry) => entry.1 = value,
            None => self.params.push((name.to_string(), value)),
        }
    }
}

fn split_host_port(sent_by: &str) -> (String, Option<u16>) {
    if let Some(end) = sent_by.rfind(']') {
        let port = sent_by[end + 1..].strip_prefix(':').and_then(|p| p.parse().ok());
        return (sent_by[..=end].to_string(), port);
    }
    match sent_by.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => {
            (host.to_string(), port.parse().ok())
        }
        _ => (sent_by.to_string(), None),
    }
}

fn parse_via(input: &str) -> IResult<&str, Via> {
    let (input, (_, _, _, _, _, _, transport)) = tuple((
        take_while1(|c: char| c.is_ascii_alphabetic()),
        space0,
        char('/'),
        space0,
        take_while1(|c: char| c.is_ascii_digit() || c == '.'),
        tuple((space0, char('/'), space0)),
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '-'),
    ))(input)?;
    let (input, _) = space1(input)?;
    let (input, host) = take_while1(|c: char| !c.is_whitespace() && c != ';' && c != ',')(input)?;
    let (input, params) = parse_params(input)?;

    let (host, port) = split_host_port(host);
    Ok((
        input,
        Via {
            transport: transport.to_ascii_uppercase(),
            host,
            port,
            params,
        },
    ))
}

impl FromStr for Via {
    type Err = SipParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        complete(s, parse_via(s), "Via")
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} {}", self.transport, self.sent_by())?;
        write_params(f, &self.params)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    pub seq: u32,
    pub method: SipMethod,
}

impl CSeq {
    pub fn new(seq: u32, method: SipMethod) -> Self {
        Self { seq, method }
    }
}

impl FromStr for CSeq {
    type Err = SipParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parsed = tuple((
            map_res(digit1, str::parse::<u32>),
            space1,
            map_res(take_while1(|c: char| !c.is_whitespace()), SipMethod::from_str),
        ))(s);
        complete(s, parsed, "CSeq").map(|(seq, _, method)| CSeq { seq, method })
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

/// `name-addr` / `addr-spec` form used by From, To, Contact, Route and Record-Route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display_name: Option<String>,
    pub uri: SipUri,
    pub params: Params,
}

impl NameAddr {
    pub fn new(uri: SipUri) -> Self {
        Self {
            display_name: None,
            uri,
            params: Vec::new(),
        }
    }

    pub fn tag(&self) -> Option<&str> {
        find_param(&self.params, "tag").and_then(|v| v.as_deref())
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.params.retain(|(k, _)| !k.eq_ignore_ascii_case("tag"));
        self.params.push(("tag".to_string(), Some(tag.to_string())));
        self
    }

    pub fn without_tag(mut self) -> Self {
        self.params.retain(|(k, _)| !k.eq_ignore_ascii_case("tag"));
        self
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        find_param(&self.params, name).map(|v| v.as_deref().unwrap_or(""))
    }
}

fn parse_display_name(input: &str) -> IResult<&str, Option<String>> {
    let quoted = delimited(char('"'), take_till(|c| c == '"'), char('"'));
    let (input, name) = opt(nom::branch::alt((
        quoted,
        take_while1(|c: char| c != '<' && c != '"'),
    )))(input)?;
    let name = name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty());
    Ok((input, name))
}

fn parse_name_addr(input: &str) -> IResult<&str, NameAddr> {
    let (after_name, display_name) = parse_display_name(input)?;
    let (after_name, _) = space0(after_name)?;

    let bracketed: IResult<&str, SipUri> =
        delimited(char('<'), preceded(space0, parse_uri), preceded(space0, char('>')))(after_name);

    let (input, display_name, uri) = match bracketed {
        Ok((rest, uri)) => (rest, display_name, uri),
        // addr-spec: parameters after the URI belong to the header, not the URI
        Err(_) => {
            let (rest, uri) = parse_bare_uri(input)?;
            (rest, None, uri)
        }
    };
    let (input, params) = parse_params(input)?;

    Ok((
        input,
        NameAddr {
            display_name,
            uri,
            params,
        },
    ))
}

fn parse_bare_uri(input: &str) -> IResult<&str, SipUri> {
    let end = input.find(|c: char| c == ';' || c.is_whitespace()).unwrap_or(input.len());
    let (uri_part, rest) = input.split_at(end);
    let (remaining, uri) = parse_uri(uri_part)?;
    if !remaining.is_empty() {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Verify,
        )));
    }
    Ok((rest, uri))
}

impl FromStr for NameAddr {
    type Err = SipParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        complete(s, parse_name_addr(s), "name-addr")
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.display_name {
            write!(f, "\"{}\" ", name)?;
        }
        write!(f, "<{}>", self.uri)?;
        write_params(f, &self.params)
    }
}

/// Event header: package name plus optional `id` (RFC 6665 §8.2.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHeader {
    pub event_type: String,
    pub id: Option<String>,
}

impl FromStr for EventHeader {
    type Err = SipParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parsed = tuple((
            take_while1(|c: char| c.is_ascii_alphanumeric() || "-.!%*_+`'~".contains(c)),
            parse_params,
        ))(s);
        let (event_type, params) = complete(s, parsed, "Event")?;
        Ok(EventHeader {
            event_type: event_type.to_ascii_lowercase(),
            id: find_param(&params, "id").and_then(|v| v.clone()),
        })
    }
}

impl fmt::Display for EventHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.event_type)?;
        if let Some(id) = &self.id {
            write!(f, ";id={}", id)?;
        }
        Ok(())
    }
}

/// Subscription-State header (RFC 6665 §8.2.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionStateHeader {
    pub state: String,
    pub expires: Option<u32>,
    pub reason: Option<String>,
}

impl SubscriptionStateHeader {
    pub fn is_active(&self) -> bool {
        self.state == "active"
    }

    pub fn is_pending(&self) -> bool {
        self.state == "pending"
    }

    pub fn is_terminated(&self) -> bool {
        self.state == "terminated"
    }
}

impl FromStr for SubscriptionStateHeader {
    type Err = SipParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parsed = tuple((take_while1(|c: char| c.is_ascii_alphanumeric() || c == '-'), parse_params))(s);
        let (state, params) = complete(s, parsed, "Subscription-State")?;
        Ok(SubscriptionStateHeader {
            state: state.to_ascii_lowercase(),
            expires: find_param(&params, "expires")
                .and_then(|v| v.as_deref())
                .and_then(|v| v.parse().ok()),
            reason: find_param(&params, "reason").and_then(|v| v.clone()),
        })
    }
}

impl fmt::Display for SubscriptionStateHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.state)?;
        if let Some(reason) = &self.reason {
            write!(f, ";reason={}", reason)?;
        }
        if let Some(expires) = self.expires {
            write!(f, ";expires={}", expires)?;
        }
        Ok(())
    }
}
