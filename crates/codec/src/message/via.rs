use std::fmt;

use crate::Error;

/// A single Via entry.
///
/// Parameters keep their order; a parameter may be a bare flag
/// (`rport`) or carry a value (`branch=z9hG4bK…`). The distinction
/// matters for the NAT fixup, which turns the bare `rport` flag into a
/// valued parameter while leaving everything else in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Via {
    pub protocol: String,
    pub host: String,
    pub port: Option<u16>,
    pub params: Vec<(String, Option<String>)>,
}

impl Via {
    /// Parses one Via value, e.g.
    /// `SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bKabc;rport`.
    ///
    /// # Test
    ///
    /// ```
    /// use sip_gateway_codec::via::Via;
    ///
    /// let via = Via::parse("SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bKabc;rport").unwrap();
    ///
    /// assert_eq!(via.host, "10.0.0.2");
    /// assert_eq!(via.port, Some(5060));
    /// assert_eq!(via.param_value("branch"), Some("z9hG4bKabc"));
    /// assert!(via.has_param("rport"));
    /// ```
    pub fn parse(value: &str) -> Result<Self, Error> {
        let mut segments = value.split(';');
        let sent = segments.next().ok_or(Error::InvalidVia)?.trim();

        let mut parts = sent.split_whitespace();
        let protocol = parts.next().ok_or(Error::InvalidVia)?;
        if !protocol.to_ascii_uppercase().starts_with("SIP/") {
            return Err(Error::InvalidVia);
        }
        let sent_by = parts.next().ok_or(Error::InvalidVia)?;

        let (host, port) = match sent_by.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => {
                (host, Some(port.parse().map_err(|_| Error::InvalidVia)?))
            }
            _ => (sent_by, None),
        };

        let mut params = Vec::new();
        for param in segments {
            let param = param.trim();
            if param.is_empty() {
                continue;
            }
            match param.split_once('=') {
                Some((name, value)) => params.push((name.to_string(), Some(value.to_string()))),
                None => params.push((param.to_string(), None)),
            }
        }

        Ok(Self {
            protocol: protocol.to_string(),
            host: host.to_string(),
            port,
            params,
        })
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.params.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    pub fn param_value(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.as_deref())
    }

    /// Sets a parameter in place, preserving its position if already
    /// present, appending it otherwise.
    pub fn set_param(&mut self, name: &str, value: Option<String>) {
        match self
            .params
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            Some(entry) => entry.1 = value,
            None => self.params.push((name.to_string(), value)),
        }
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.protocol, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        for (name, value) in &self.params {
            match value {
                Some(value) => write!(f, ";{}={}", name, value)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}
