use std::fmt;

use crate::Error;

/// Canonical spellings for the header names the gateway touches.
///
/// Anything else is title-cased per dash-separated segment, which is
/// enough to keep serialization stable across a parse round trip.
const CANONICAL: &[&str] = &[
    "Via",
    "From",
    "To",
    "Call-ID",
    "CSeq",
    "Contact",
    "Content-Type",
    "Content-Length",
    "Max-Forwards",
    "Allow",
    "Supported",
    "Record-Route",
    "Route",
    "User-Agent",
    "Expires",
    "Subject",
];

/// Expands a compact header form to its long name, or returns the
/// input unchanged.
///
/// # Test
///
/// ```
/// use sip_gateway_codec::message::headers::expand_compact;
///
/// assert_eq!(expand_compact("v"), "Via");
/// assert_eq!(expand_compact("i"), "Call-ID");
/// assert_eq!(expand_compact("Via"), "Via");
/// ```
pub fn expand_compact(name: &str) -> &str {
    match name {
        "v" | "V" => "Via",
        "f" | "F" => "From",
        "t" | "T" => "To",
        "i" | "I" => "Call-ID",
        "m" | "M" => "Contact",
        "c" | "C" => "Content-Type",
        "l" | "L" => "Content-Length",
        "k" | "K" => "Supported",
        other => other,
    }
}

/// Returns the canonical capitalization of a header name.
///
/// # Test
///
/// ```
/// use sip_gateway_codec::message::headers::canonical_name;
///
/// assert_eq!(canonical_name("CALL-ID"), "Call-ID");
/// assert_eq!(canonical_name("cseq"), "CSeq");
/// assert_eq!(canonical_name("x-custom-thing"), "X-Custom-Thing");
/// ```
pub fn canonical_name(name: &str) -> String {
    let name = expand_compact(name);
    for known in CANONICAL {
        if known.eq_ignore_ascii_case(name) {
            return (*known).to_string();
        }
    }

    // Title-case each dash-separated segment of an unknown header.
    name.split('-')
        .map(|seg| {
            let mut chars = seg.chars();
            match chars.next() {
                Some(first) => {
                    first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// An ordered header section.
///
/// Names are stored canonicalized so lookups are cheap and
/// serialization is deterministic. Multi-valued headers (Via above
/// all) occupy one entry per value, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::with_capacity(12))
    }

    /// Appends a header, canonicalizing the name.
    pub fn push(&mut self, name: &str, value: impl Into<String>) {
        self.0.push((canonical_name(name), value.into()));
    }

    /// First value of a header, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        let name = canonical_name(name);
        self.0
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    /// All values of a header, in order.
    pub fn get_all<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> {
        let name = canonical_name(name);
        self.0
            .iter()
            .filter(move |(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Replaces the first occurrence of a header, or appends it.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let canonical = canonical_name(name);
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == canonical) {
            Some(entry) => entry.1 = value,
            None => self.0.push((canonical, value)),
        }
    }

    pub fn remove(&mut self, name: &str) {
        let canonical = canonical_name(name);
        self.0.retain(|(k, _)| *k != canonical);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// `Call-ID` value.
    pub fn call_id(&self) -> Result<&str, Error> {
        self.get("Call-ID").ok_or(Error::MissingHeader("Call-ID"))
    }

    /// `CSeq` split into sequence number and method.
    ///
    /// # Test
    ///
    /// ```
    /// use sip_gateway_codec::{Headers, Method};
    ///
    /// let mut headers = Headers::new();
    /// headers.push("CSeq", "42 INVITE");
    ///
    /// assert_eq!(headers.cseq().unwrap(), (42, Method::Invite));
    /// ```
    pub fn cseq(&self) -> Result<(u32, super::Method), Error> {
        let value = self.get("CSeq").ok_or(Error::MissingHeader("CSeq"))?;
        let mut parts = value.split_whitespace();
        let seq = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or(Error::InvalidCSeq)?;
        let method = parts.next().ok_or(Error::InvalidCSeq)?;
        Ok((seq, super::Method::from(method)))
    }

    pub fn from_header(&self) -> Result<&str, Error> {
        self.get("From").ok_or(Error::MissingHeader("From"))
    }

    pub fn to_header(&self) -> Result<&str, Error> {
        self.get("To").ok_or(Error::MissingHeader("To"))
    }

    /// The top (first) Via value.
    pub fn top_via(&self) -> Result<&str, Error> {
        self.get("Via").ok_or(Error::MissingHeader("Via"))
    }

    /// The branch token of the top Via.
    pub fn branch(&self) -> Result<String, Error> {
        let via = super::via::Via::parse(self.top_via()?)?;
        via.param_value("branch")
            .map(|b| b.to_string())
            .ok_or(Error::InvalidVia)
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.0 {
            write!(f, "{}: {}\r\n", name, value)?;
        }
        Ok(())
    }
}
