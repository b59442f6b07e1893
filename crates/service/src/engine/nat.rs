use std::net::SocketAddr;

use codec::{Request, via::Via};

/// Rewrites the top Via of an inbound request when the peer asked for
/// symmetric response routing.
///
/// With `rport` present, the parameter is filled with the actual
/// source port, and `received` is appended when the advertised sent-by
/// differs from the datagram source. The rewritten Via is echoed
/// verbatim in responses, so a peer behind NAT can still match its
/// transactions. Applying the fixup twice with the same source is a
/// no-op.
pub fn fixup(request: &mut Request, source: SocketAddr) {
    let Ok(top) = request.headers.top_via() else {
        return;
    };
    let Ok(mut via) = Via::parse(top) else {
        return;
    };
    if !via.has_param("rport") {
        return;
    }

    via.set_param("rport", Some(source.port().to_string()));

    let source_ip = source.ip().to_string();
    if via.host != source_ip || via.port.unwrap_or(5060) != source.port() {
        via.set_param("received", Some(source_ip));
    }

    request.headers.set("Via", via.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::{Headers, Method};

    fn request_with_via(via: &str) -> Request {
        let mut headers = Headers::new();
        headers.push("Via", via);
        headers.push("Call-ID", "x@y");
        headers.push("CSeq", "1 INVITE");
        Request {
            method: Method::Invite,
            uri: "sip:alice@gateway".to_string(),
            headers,
            body: String::new(),
        }
    }

    #[test]
    fn rport_is_filled_and_received_appended_behind_nat() {
        let mut request = request_with_via("SIP/2.0/UDP 192.168.1.127:5060;branch=z9hG4bK1;rport");
        fixup(&mut request, "203.0.113.9:31337".parse().unwrap());

        let via = Via::parse(request.headers.top_via().unwrap()).unwrap();
        assert_eq!(via.param_value("rport"), Some("31337"));
        assert_eq!(via.param_value("received"), Some("203.0.113.9"));
        assert_eq!(via.param_value("branch"), Some("z9hG4bK1"));
    }

    #[test]
    fn fixup_is_idempotent() {
        let mut request = request_with_via("SIP/2.0/UDP 192.168.1.127:5060;branch=z9hG4bK1;rport");
        let source = "203.0.113.9:31337".parse().unwrap();

        fixup(&mut request, source);
        let once = request.headers.top_via().unwrap().to_string();

        fixup(&mut request, source);
        assert_eq!(request.headers.top_via().unwrap(), once);
    }

    #[test]
    fn via_without_rport_is_left_alone() {
        let original = "SIP/2.0/UDP 192.168.1.127:5060;branch=z9hG4bK1";
        let mut request = request_with_via(original);

        fixup(&mut request, "203.0.113.9:31337".parse().unwrap());
        assert_eq!(request.headers.top_via().unwrap(), original);
    }

    #[test]
    fn matching_source_gets_no_received_param() {
        let mut request = request_with_via("SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bK1;rport");
        fixup(&mut request, "10.0.0.2:5060".parse().unwrap());

        let via = Via::parse(request.headers.top_via().unwrap()).unwrap();
        assert_eq!(via.param_value("rport"), Some("5060"));
        assert!(!via.has_param("received"));
    }

    #[test]
    fn only_the_top_via_is_rewritten() {
        let mut request = request_with_via("SIP/2.0/UDP 192.168.1.127:5060;branch=z9hG4bK1;rport");
        request
            .headers
            .push("Via", "SIP/2.0/UDP 172.16.0.1:5060;branch=z9hG4bK0");

        fixup(&mut request, "203.0.113.9:31337".parse().unwrap());

        let vias: Vec<_> = request.headers.get_all("Via").collect();
        assert!(vias[0].contains("received=203.0.113.9"));
        assert_eq!(vias[1], "SIP/2.0/UDP 172.16.0.1:5060;branch=z9hG4bK0");
    }
}
