//! SIP text messages: one request or response per datagram.
//!
//! Only what call control needs is modelled: a start line, an ordered
//! header list with case-insensitive lookup, and an opaque body.
//! `Content-Length` is recomputed on render and never stored.

use std::fmt;

use crate::error::{Result, UaError};

pub const SIP_VERSION: &str = "SIP/2.0";
pub const BRANCH_MAGIC: &str = "z9hG4bK";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Method {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Other(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::Register => "REGISTER",
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Other(token) => token,
        }
    }

    pub fn from_token(token: &str) -> Self {
        match token {
            "REGISTER" => Method::Register,
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "BYE" => Method::Bye,
            "CANCEL" => Method::Cancel,
            other => Method::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusClass {
    Provisional,
    Success,
    Failure,
}

impl StatusClass {
    pub fn of(code: u16) -> Self {
        match code {
            100..=199 => StatusClass::Provisional,
            200..=299 => StatusClass::Success,
            _ => StatusClass::Failure,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StartLine {
    Request { method: Method, uri: String },
    Response { code: u16, reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SipMessage {
    start: StartLine,
    headers: Vec<(String, String)>,
    body: String,
}

impl SipMessage {
    pub fn request(method: Method, uri: impl Into<String>) -> Self {
        Self {
            start: StartLine::Request {
                method,
                uri: uri.into(),
            },
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn response(code: u16, reason: impl Into<String>) -> Self {
        Self {
            start: StartLine::Response {
                code,
                reason: reason.into(),
            },
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Builds a response to `request`, copying the headers that identify
    /// the transaction and dialog. `to_tag` is added to the To header
    /// unless it already carries one.
    pub fn response_to(request: &SipMessage, code: u16, reason: &str, to_tag: Option<&str>) -> Self {
        let mut response = SipMessage::response(code, reason);
        for (name, value) in &request.headers {
            if name.eq_ignore_ascii_case("Via") {
                response.headers.push((name.clone(), value.clone()));
            }
        }
        for name in ["From", "To", "Call-ID", "CSeq"] {
            let Some(value) = request.header(name) else {
                continue;
            };
            let value = match (name, to_tag) {
                ("To", Some(tag)) if tag_param(value).is_none() => format!("{};tag={}", value, tag),
                _ => value.to_string(),
            };
            response.headers.push((name.to_string(), value));
        }
        response
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.push_header(name, value);
        self
    }

    pub fn push_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    /// Replaces every header called `name` with a single value
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.headers.iter().position(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some(index) => {
                self.headers[index].1 = value;
                let mut seen = 0;
                self.headers.retain(|(n, _)| {
                    if n.eq_ignore_ascii_case(name) {
                        seen += 1;
                        seen == 1
                    } else {
                        true
                    }
                });
            }
            None => self.headers.push((name.to_string(), value)),
        }
    }

    pub fn with_body(mut self, content_type: &str, body: impl Into<String>) -> Self {
        self.set_header("Content-Type", content_type);
        self.body = body.into();
        self
    }

    pub fn start_line(&self) -> &StartLine {
        &self.start
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start, StartLine::Request { .. })
    }

    pub fn is_response(&self) -> bool {
        !self.is_request()
    }

    pub fn method(&self) -> Option<&Method> {
        match &self.start {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Response { .. } => None,
        }
    }

    pub fn request_uri(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { uri, .. } => Some(uri),
            StartLine::Response { .. } => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match &self.start {
            StartLine::Response { code, .. } => Some(*code),
            StartLine::Request { .. } => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match &self.start {
            StartLine::Response { reason, .. } => Some(reason),
            StartLine::Request { .. } => None,
        }
    }

    pub fn status_class(&self) -> Option<StatusClass> {
        self.status().map(StatusClass::of)
    }

    /// `"486 Busy Here"` for responses, the request line otherwise
    pub fn summary(&self) -> String {
        match &self.start {
            StartLine::Response { code, reason } => format!("{} {}", code, reason),
            StartLine::Request { method, uri } => format!("{} {}", method, uri),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn call_id(&self) -> Option<&str> {
        self.header("Call-ID")
    }

    pub fn cseq(&self) -> Option<(u32, Method)> {
        let value = self.header("CSeq")?;
        let mut parts = value.split_whitespace();
        let seq = parts.next()?.parse().ok()?;
        let method = Method::from_token(parts.next()?);
        Some((seq, method))
    }

    pub fn from_tag(&self) -> Option<String> {
        self.header("From").and_then(tag_param)
    }

    pub fn to_tag(&self) -> Option<String> {
        self.header("To").and_then(tag_param)
    }

    /// Branch parameter of the topmost Via
    pub fn branch(&self) -> Option<String> {
        self.header("Via").and_then(|via| param(via, "branch"))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let (head, body) = match text.find("\r\n\r\n") {
            Some(pos) => (&text[..pos], &text[pos + 4..]),
            None => match text.find("\n\n") {
                Some(pos) => (&text[..pos], &text[pos + 2..]),
                None => (text.trim_end(), ""),
            },
        };

        let mut lines = head.lines();
        let first = lines
            .by_ref()
            .find(|line| !line.trim().is_empty())
            .ok_or_else(|| UaError::parse("empty message"))?;
        let start = parse_start_line(first.trim())?;

        let mut headers: Vec<(String, String)> = Vec::new();
        for line in lines {
            if line.starts_with(' ') || line.starts_with('\t') {
                // folded continuation of the previous header
                let (_, value) = headers
                    .last_mut()
                    .ok_or_else(|| UaError::parse("continuation line before any header"))?;
                value.push(' ');
                value.push_str(line.trim());
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| UaError::parse(format!("malformed header line: {}", line)))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(UaError::parse("empty header name"));
            }
            headers.push((expand_compact(name).to_string(), value.trim().to_string()));
        }

        let mut message = Self {
            start,
            headers,
            body: String::new(),
        };

        let body = match message.header("Content-Length") {
            Some(length) => {
                let length: usize = length
                    .trim()
                    .parse()
                    .map_err(|_| UaError::parse(format!("bad Content-Length: {}", length)))?;
                let mut end = length.min(body.len());
                while !body.is_char_boundary(end) {
                    end -= 1;
                }
                &body[..end]
            }
            None => body,
        };
        message.body = body.to_string();
        message.headers.retain(|(n, _)| !n.eq_ignore_ascii_case("Content-Length"));

        Ok(message)
    }

    pub fn render(&self) -> String {
        let mut out = match &self.start {
            StartLine::Request { method, uri } => format!("{} {} {}\r\n", method, uri, SIP_VERSION),
            StartLine::Response { code, reason } => format!("{} {} {}\r\n", SIP_VERSION, code, reason),
        };
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("Content-Length") {
                continue;
            }
            out.push_str(&format!("{}: {}\r\n", name, value));
        }
        out.push_str(&format!("Content-Length: {}\r\n\r\n", self.body.len()));
        out.push_str(&self.body);
        out
    }
}

impl fmt::Display for SipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

fn parse_start_line(line: &str) -> Result<StartLine> {
    if let Some(rest) = line.strip_prefix(SIP_VERSION) {
        let rest = rest.trim_start();
        let (code, reason) = rest.split_once(' ').unwrap_or((rest, ""));
        let code: u16 = code
            .parse()
            .map_err(|_| UaError::parse(format!("bad status code in: {}", line)))?;
        if !(100..=699).contains(&code) {
            return Err(UaError::parse(format!("status code out of range: {}", code)));
        }
        return Ok(StartLine::Response {
            code,
            reason: reason.trim().to_string(),
        });
    }

    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts.as_slice() {
        [method, uri, version] if *version == SIP_VERSION => Ok(StartLine::Request {
            method: Method::from_token(method),
            uri: uri.to_string(),
        }),
        _ => Err(UaError::parse(format!("bad start line: {}", line))),
    }
}

fn expand_compact(name: &str) -> &str {
    match name {
        "i" | "I" => "Call-ID",
        "f" | "F" => "From",
        "t" | "T" => "To",
        "v" | "V" => "Via",
        "m" | "M" => "Contact",
        "l" | "L" => "Content-Length",
        "c" | "C" => "Content-Type",
        "e" | "E" => "Content-Encoding",
        "k" | "K" => "Supported",
        "s" | "S" => "Subject",
        other => other,
    }
}

/// Header parameters following the address part of a From/To/Contact/Via
/// value.
fn header_params(value: &str) -> &str {
    match value.rfind('>') {
        Some(pos) => &value[pos + 1..],
        None => value.split_once(';').map(|(_, rest)| rest).unwrap_or(""),
    }
}

/// Looks up `name` among the `;name=value` parameters of a header value
pub fn param(value: &str, name: &str) -> Option<String> {
    header_params(value)
        .split(';')
        .filter_map(|p| p.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case(name))
        .map(|(_, v)| v.trim().trim_matches('"').to_string())
}

pub fn tag_param(value: &str) -> Option<String> {
    param(value, "tag")
}

/// URI inside a name-addr, or the bare URI without parameters
pub fn uri_of(value: &str) -> &str {
    if let (Some(start), Some(end)) = (value.find('<'), value.find('>')) {
        if start < end {
            return value[start + 1..end].trim();
        }
    }
    value.split(';').next().unwrap_or(value).trim()
}

pub fn new_branch() -> String {
    format!("{}{}", BRANCH_MAGIC, uuid::Uuid::new_v4().simple())
}

pub fn new_tag() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub fn new_call_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVITE: &str = "INVITE sip:bob@example.com SIP/2.0\r\n\
         Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKabc\r\n\
         From: \"Alice\" <sip:alice@example.com>;tag=1928\r\n\
         To: <sip:bob@example.com>\r\n\
         Call-ID: a84b4c76e66710\r\n\
         CSeq: 314159 INVITE\r\n\
         Contact: <sip:alice@10.0.0.1:5060>\r\n\
         Content-Type: application/sdp\r\n\
         Content-Length: 4\r\n\
         \r\n\
         v=0\r\n";

    #[test]
    fn test_parse_request() {
        let msg = SipMessage::parse(INVITE).unwrap();
        assert_eq!(msg.method(), Some(&Method::Invite));
        assert_eq!(msg.request_uri(), Some("sip:bob@example.com"));
        assert_eq!(msg.call_id(), Some("a84b4c76e66710"));
        assert_eq!(msg.cseq(), Some((314159, Method::Invite)));
        assert_eq!(msg.from_tag().as_deref(), Some("1928"));
        assert_eq!(msg.to_tag(), None);
        assert_eq!(msg.branch().as_deref(), Some("z9hG4bKabc"));
        // Content-Length bounds the body
        assert_eq!(msg.body(), "v=0\r");
    }

    #[test]
    fn test_parse_response_with_compact_headers() {
        let text = "SIP/2.0 180 Ringing\r\n\
             v: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKabc\r\n\
             f: <sip:alice@example.com>;tag=1928\r\n\
             t: <sip:bob@example.com>;tag=xyz\r\n\
             i: call-1\r\n\
             CSeq: 1 INVITE\r\n\
             l: 0\r\n\r\n";
        let msg = SipMessage::parse(text).unwrap();
        assert_eq!(msg.status(), Some(180));
        assert_eq!(msg.reason(), Some("Ringing"));
        assert_eq!(msg.status_class(), Some(StatusClass::Provisional));
        assert_eq!(msg.call_id(), Some("call-1"));
        assert_eq!(msg.to_tag().as_deref(), Some("xyz"));
        assert_eq!(msg.summary(), "180 Ringing");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(SipMessage::parse("").is_err());
        assert!(SipMessage::parse("hello world\r\n\r\n").is_err());
        assert!(SipMessage::parse("SIP/2.0 abc OK\r\n\r\n").is_err());
        assert!(SipMessage::parse("SIP/2.0 999 Nope\r\n\r\n").is_err());
        assert!(SipMessage::parse("BYE sip:x SIP/2.0\r\nno colon here\r\n\r\n").is_err());
    }

    #[test]
    fn test_render_recomputes_content_length() {
        let msg = SipMessage::request(Method::Bye, "sip:bob@example.com")
            .with_header("Call-ID", "c1")
            .with_header("Content-Length", "999")
            .with_body("text/plain", "hello");
        let text = msg.render();
        assert!(text.starts_with("BYE sip:bob@example.com SIP/2.0\r\n"));
        assert!(text.contains("Content-Length: 5\r\n\r\nhello"));
        assert!(!text.contains("999"));

        let reparsed = SipMessage::parse(&text).unwrap();
        assert_eq!(reparsed.body(), "hello");
        assert_eq!(reparsed.header("content-type"), Some("text/plain"));
    }

    #[test]
    fn test_response_to_copies_dialog_headers() {
        let invite = SipMessage::parse(INVITE).unwrap();
        let ringing = SipMessage::response_to(&invite, 180, "Ringing", Some("local1"));
        assert_eq!(ringing.status(), Some(180));
        assert_eq!(ringing.call_id(), Some("a84b4c76e66710"));
        assert_eq!(ringing.to_tag().as_deref(), Some("local1"));
        assert_eq!(ringing.from_tag().as_deref(), Some("1928"));
        assert_eq!(ringing.branch().as_deref(), Some("z9hG4bKabc"));
        assert_eq!(ringing.cseq(), Some((314159, Method::Invite)));
    }

    #[test]
    fn test_set_header_replaces_all() {
        let mut msg = SipMessage::request(Method::Register, "sip:example.com")
            .with_header("Expires", "3600")
            .with_header("expires", "60");
        msg.set_header("Expires", "0");
        assert_eq!(msg.headers("Expires").collect::<Vec<_>>(), vec!["0"]);
    }

    #[test]
    fn test_uri_and_params() {
        assert_eq!(uri_of("\"Bob\" <sip:bob@example.com>;tag=1"), "sip:bob@example.com");
        assert_eq!(uri_of("sip:bob@example.com;transport=udp"), "sip:bob@example.com");
        assert_eq!(
            param("<sip:alice@10.0.0.1>;expires=120", "expires").as_deref(),
            Some("120")
        );
        assert!(new_branch().starts_with(BRANCH_MAGIC));
    }
}
