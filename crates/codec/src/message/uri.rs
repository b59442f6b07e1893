use std::fmt;

use crate::Error;

/// A SIP URI reduced to the parts the gateway routes on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipUri {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl SipUri {
    /// # Test
    ///
    /// ```
    /// use sip_gateway_codec::uri::SipUri;
    ///
    /// let uri = SipUri::parse("sip:bob@10.0.0.2:5080;transport=udp").unwrap();
    ///
    /// assert_eq!(uri.user.as_deref(), Some("bob"));
    /// assert_eq!(uri.host, "10.0.0.2");
    /// assert_eq!(uri.port, Some(5080));
    /// ```
    pub fn parse(value: &str) -> Result<Self, Error> {
        let value = value.trim();
        let rest = value
            .strip_prefix("sip:")
            .or_else(|| value.strip_prefix("sips:"))
            .ok_or(Error::InvalidUri)?;

        // URI parameters and headers do not matter for routing.
        let rest = rest.split([';', '?']).next().unwrap_or(rest);

        let (user, host_port) = match rest.split_once('@') {
            Some((user, host_port)) => (Some(user.to_string()), host_port),
            None => (None, rest),
        };

        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => (
                host,
                Some(port.parse().map_err(|_| Error::InvalidUri)?),
            ),
            _ => (host_port, None),
        };

        if host.is_empty() {
            return Err(Error::InvalidUri);
        }

        Ok(Self {
            user,
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sip:")?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}

/// Extracts the URI out of a name-addr header value.
///
/// `"Alice" <sip:alice@example.com>;tag=1928` yields
/// `sip:alice@example.com`; a bare URI is returned without its header
/// parameters.
///
/// # Test
///
/// ```
/// use sip_gateway_codec::uri::name_addr_uri;
///
/// assert_eq!(
///     name_addr_uri("\"Alice\" <sip:alice@example.com>;tag=1928"),
///     "sip:alice@example.com"
/// );
/// assert_eq!(name_addr_uri("sip:alice@example.com;tag=19"), "sip:alice@example.com");
/// ```
pub fn name_addr_uri(value: &str) -> &str {
    if let Some(start) = value.find('<') {
        if let Some(end) = value[start..].find('>') {
            return &value[start + 1..start + end];
        }
    }
    value.split(';').next().unwrap_or(value).trim()
}

/// Looks up a header parameter that follows the addr-spec, such as
/// `tag`.
///
/// # Test
///
/// ```
/// use sip_gateway_codec::uri::header_param;
///
/// let to = "<sip:bob@example.com>;tag=8a21f";
///
/// assert_eq!(header_param(to, "tag"), Some("8a21f"));
/// assert_eq!(header_param(to, "expires"), None);
/// ```
pub fn header_param<'a>(value: &'a str, name: &str) -> Option<&'a str> {
    // Parameters after the closing angle bracket belong to the header;
    // in the bare-URI form every `;segment` does.
    let params = match value.rfind('>') {
        Some(pos) => &value[pos + 1..],
        None => value,
    };

    for param in params.split(';').skip(if value.contains('>') { 0 } else { 1 }) {
        if let Some((k, v)) = param.trim().split_once('=') {
            if k.trim().eq_ignore_ascii_case(name) {
                return Some(v.trim());
            }
        }
    }
    None
}

/// Appends `;tag=` to a From/To value that does not carry one yet.
pub fn with_tag(value: &str, tag: &str) -> String {
    if header_param(value, "tag").is_some() {
        value.to_string()
    } else {
        format!("{};tag={}", value.trim_end().trim_end_matches(';'), tag)
    }
}
