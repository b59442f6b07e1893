pub mod headers;
pub mod uri;
pub mod via;

use std::fmt;

use crate::Error;

pub use headers::Headers;

pub const VERSION: &str = "SIP/2.0";

/// Request methods the gateway understands.
///
/// Everything outside this set is carried as `Unknown` and answered
/// `501 Not Implemented` upstream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Invite,
    Ack,
    Bye,
    Cancel,
    Info,
    Options,
    Unknown(String),
}

impl From<&str> for Method {
    fn from(value: &str) -> Self {
        match value.to_ascii_uppercase().as_str() {
            "INVITE" => Self::Invite,
            "ACK" => Self::Ack,
            "BYE" => Self::Bye,
            "CANCEL" => Self::Cancel,
            "INFO" => Self::Info,
            "OPTIONS" => Self::Options,
            _ => Self::Unknown(value.to_string()),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invite => write!(f, "INVITE"),
            Self::Ack => write!(f, "ACK"),
            Self::Bye => write!(f, "BYE"),
            Self::Cancel => write!(f, "CANCEL"),
            Self::Info => write!(f, "INFO"),
            Self::Options => write!(f, "OPTIONS"),
            Self::Unknown(other) => write!(f, "{}", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub uri: String,
    pub headers: Headers,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    /// Parses one datagram worth of SIP text.
    ///
    /// # Test
    ///
    /// ```
    /// use sip_gateway_codec::{Message, Method};
    ///
    /// let raw = concat!(
    ///     "INVITE sip:alice@gateway SIP/2.0\r\n",
    ///     "Via: SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bKabc\r\n",
    ///     "Call-ID: deadbeef@10.0.0.2\r\n",
    ///     "CSeq: 1 INVITE\r\n",
    ///     "\r\n",
    /// );
    ///
    /// match Message::parse(raw).unwrap() {
    ///     Message::Request(request) => assert_eq!(request.method, Method::Invite),
    ///     _ => panic!("expected a request"),
    /// }
    /// ```
    pub fn parse(input: &str) -> Result<Self, Error> {
        if input.trim().is_empty() {
            return Err(Error::Empty);
        }

        let (head, body) = split_head_body(input);
        let mut lines = head.lines().map(|l| l.strip_suffix('\r').unwrap_or(l));

        let start = lines.next().ok_or(Error::Empty)?;
        let headers = parse_headers(lines)?;

        if let Some(rest) = start.strip_prefix(VERSION) {
            let rest = rest.trim_start();
            let (code, reason) = match rest.split_once(' ') {
                Some((code, reason)) => (code, reason.trim()),
                None => (rest, ""),
            };
            let status: u16 = code.parse().map_err(|_| Error::InvalidStatusCode)?;
            if !(100..700).contains(&status) {
                return Err(Error::InvalidStatusCode);
            }
            return Ok(Self::Response(Response {
                status,
                reason: reason.to_string(),
                headers,
                body: body.to_string(),
            }));
        }

        let mut parts = start.split_whitespace();
        let method = parts.next().ok_or(Error::InvalidStartLine)?;
        let uri = parts.next().ok_or(Error::InvalidStartLine)?;
        match parts.next() {
            Some(version) if version.eq_ignore_ascii_case(VERSION) => {}
            _ => return Err(Error::InvalidStartLine),
        }

        Ok(Self::Request(Request {
            method: Method::from(method),
            uri: uri.to_string(),
            headers,
            body: body.to_string(),
        }))
    }

    pub fn headers(&self) -> &Headers {
        match self {
            Self::Request(r) => &r.headers,
            Self::Response(r) => &r.headers,
        }
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        match self {
            Self::Request(r) => &mut r.headers,
            Self::Response(r) => &mut r.headers,
        }
    }

    pub fn body(&self) -> &str {
        match self {
            Self::Request(r) => &r.body,
            Self::Response(r) => &r.body,
        }
    }
}

fn split_head_body(input: &str) -> (&str, &str) {
    if let Some(pos) = input.find("\r\n\r\n") {
        (&input[..pos], &input[pos + 4..])
    } else if let Some(pos) = input.find("\n\n") {
        (&input[..pos], &input[pos + 2..])
    } else {
        (input, "")
    }
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Headers, Error> {
    let mut headers = Headers::new();
    // (canonical name, value) of the most recent line, kept out of the
    // section until its continuation lines have been folded in.
    let mut pending: Option<(String, String)> = None;

    for line in lines {
        if line.is_empty() {
            continue;
        }

        if line.starts_with(' ') || line.starts_with('\t') {
            match pending.as_mut() {
                Some((_, value)) => {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                None => return Err(Error::InvalidHeaderLine),
            }
            continue;
        }

        if let Some((name, value)) = pending.take() {
            push_header(&mut headers, &name, value);
        }

        let (name, value) = line.split_once(':').ok_or(Error::InvalidHeaderLine)?;
        let name = name.trim();
        if name.is_empty() || name.contains(' ') {
            return Err(Error::InvalidHeaderLine);
        }
        pending = Some((name.to_string(), value.trim().to_string()));
    }

    if let Some((name, value)) = pending {
        push_header(&mut headers, &name, value);
    }

    Ok(headers)
}

/// Via may carry several comma-separated entries on one line; they are
/// stored as separate values so the top entry stays addressable. Any
/// other header keeps its first occurrence only.
fn push_header(headers: &mut Headers, name: &str, value: String) {
    if headers::canonical_name(name) == "Via" {
        for entry in value.split(',') {
            let entry = entry.trim();
            if !entry.is_empty() {
                headers.push("Via", entry);
            }
        }
    } else if headers.get(name).is_none() {
        headers.push(name, value);
    }
}

fn write_message(
    f: &mut fmt::Formatter<'_>,
    headers: &Headers,
    body: &str,
) -> fmt::Result {
    write!(f, "{}", headers)?;
    if !headers.contains("Content-Length") {
        write!(f, "Content-Length: {}\r\n", body.len())?;
    }
    write!(f, "\r\n{}", body)
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}\r\n", self.method, self.uri, VERSION)?;
        write_message(f, &self.headers, &self.body)
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}\r\n", VERSION, self.status, self.reason)?;
        write_message(f, &self.headers, &self.body)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request(r) => write!(f, "{}", r),
            Self::Response(r) => write!(f, "{}", r),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folded_header_lines_extend_the_previous_value() {
        let raw = concat!(
            "INVITE sip:alice@gateway SIP/2.0\r\n",
            "Via: SIP/2.0/UDP 10.0.0.2;branch=z9hG4bKabc\r\n",
            "Subject: a very\r\n",
            " long subject\r\n",
            "Call-ID: x@y\r\n",
            "CSeq: 1 INVITE\r\n",
            "\r\n",
        );

        let message = Message::parse(raw).unwrap();
        assert_eq!(message.headers().get("Subject"), Some("a very long subject"));
    }

    #[test]
    fn repeated_non_via_headers_keep_the_first_occurrence() {
        let raw = concat!(
            "INVITE sip:alice@gateway SIP/2.0\r\n",
            "Via: SIP/2.0/UDP 10.0.0.2;branch=z9hG4bKabc\r\n",
            "Subject: first\r\n",
            "Subject: second\r\n",
            "Call-ID: x@y\r\n",
            "CSeq: 1 INVITE\r\n",
            "\r\n",
        );

        let message = Message::parse(raw).unwrap();
        assert_eq!(message.headers().get("Subject"), Some("first"));
        assert_eq!(message.headers().get_all("Subject").count(), 1);
        assert_eq!(message.to_string().matches("Subject:").count(), 1);
    }

    #[test]
    fn via_list_keeps_order_across_lines_and_commas() {
        let raw = concat!(
            "BYE sip:alice@gateway SIP/2.0\r\n",
            "Via: SIP/2.0/UDP a:5060;branch=z9hG4bK1, SIP/2.0/UDP b:5060;branch=z9hG4bK2\r\n",
            "Via: SIP/2.0/UDP c:5060;branch=z9hG4bK3\r\n",
            "Call-ID: x@y\r\n",
            "CSeq: 2 BYE\r\n",
            "\r\n",
        );

        let message = Message::parse(raw).unwrap();
        let vias: Vec<_> = message.headers().get_all("Via").collect();
        assert_eq!(vias.len(), 3);
        assert!(vias[0].contains("UDP a:5060"));
        assert!(vias[2].contains("UDP c:5060"));
    }

    #[test]
    fn malformed_input_yields_structured_errors() {
        assert_eq!(Message::parse(""), Err(Error::Empty));
        assert_eq!(Message::parse("   \r\n"), Err(Error::Empty));
        assert_eq!(
            Message::parse("INVITE\r\n\r\n"),
            Err(Error::InvalidStartLine)
        );
        assert_eq!(
            Message::parse("SIP/2.0 9999 Nope\r\n\r\n"),
            Err(Error::InvalidStatusCode)
        );
        assert_eq!(
            Message::parse("INVITE sip:a@b SIP/2.0\r\nno-colon-here\r\n\r\n"),
            Err(Error::InvalidHeaderLine)
        );
    }

    #[test]
    fn content_length_is_inserted_when_absent() {
        let request = Request {
            method: Method::Options,
            uri: "sip:gateway".to_string(),
            headers: Headers::new(),
            body: "abcd".to_string(),
        };

        let text = request.to_string();
        assert!(text.contains("Content-Length: 4\r\n"));
        assert!(text.ends_with("\r\nabcd"));
    }

    #[test]
    fn supplied_content_length_is_not_duplicated() {
        let mut headers = Headers::new();
        headers.push("Content-Length", "0");
        let request = Request {
            method: Method::Options,
            uri: "sip:gateway".to_string(),
            headers,
            body: String::new(),
        };

        assert_eq!(request.to_string().matches("Content-Length").count(), 1);
    }
}
