use anyhow::Result;
use sip_gateway_codec::{Headers, Message, Method, Request, Response, via::Via};

fn invite() -> Request {
    let mut headers = Headers::new();
    headers.push("Via", "SIP/2.0/UDP 192.168.1.5:5060;branch=z9hG4bKdeadbeef;rport");
    headers.push("Max-Forwards", "70");
    headers.push("From", "\"Gateway\" <sip:gateway@192.168.1.5>;tag=0123456789abcdef");
    headers.push("To", "<sip:bob@10.0.0.2>");
    headers.push("Call-ID", "00112233445566778899aabbccddeeff@192.168.1.5");
    headers.push("CSeq", "1 INVITE");
    headers.push("Contact", "\"Gateway\" <sip:gateway@192.168.1.5:5060>");
    headers.push("Content-Type", "application/sdp");
    headers.push("Content-Length", "32");

    Request {
        method: Method::Invite,
        uri: "sip:bob@10.0.0.2".to_string(),
        headers,
        body: "v=0\r\nm=audio 30000 RTP/AVP 0 8\r\n".to_string(),
    }
}

#[test]
fn request_round_trip_is_identity() -> Result<()> {
    let original = Message::Request(invite());
    let reparsed = Message::parse(&original.to_string())?;

    assert_eq!(reparsed, original);
    Ok(())
}

#[test]
fn response_round_trip_is_identity() -> Result<()> {
    let mut headers = Headers::new();
    headers.push("Via", "SIP/2.0/UDP 192.168.1.5:5060;branch=z9hG4bKdeadbeef");
    headers.push("From", "<sip:gateway@192.168.1.5>;tag=0123456789abcdef");
    headers.push("To", "<sip:bob@10.0.0.2>;tag=fedcba9876543210");
    headers.push("Call-ID", "00112233445566778899aabbccddeeff@192.168.1.5");
    headers.push("CSeq", "1 INVITE");
    headers.push("Content-Length", "0");

    let original = Message::Response(Response {
        status: 180,
        reason: "Ringing".to_string(),
        headers,
        body: String::new(),
    });
    let reparsed = Message::parse(&original.to_string())?;

    assert_eq!(reparsed, original);
    Ok(())
}

#[test]
fn compact_forms_parse_to_the_same_header_names() -> Result<()> {
    let long = concat!(
        "INVITE sip:bob@10.0.0.2 SIP/2.0\r\n",
        "Via: SIP/2.0/UDP a:5060;branch=z9hG4bK1\r\n",
        "From: <sip:alice@a>;tag=1\r\n",
        "To: <sip:bob@b>\r\n",
        "Call-ID: x@a\r\n",
        "CSeq: 1 INVITE\r\n",
        "Contact: <sip:alice@a>\r\n",
        "Content-Type: application/sdp\r\n",
        "Supported: replaces\r\n",
        "Content-Length: 0\r\n",
        "\r\n",
    );
    let compact = concat!(
        "INVITE sip:bob@10.0.0.2 SIP/2.0\r\n",
        "v: SIP/2.0/UDP a:5060;branch=z9hG4bK1\r\n",
        "f: <sip:alice@a>;tag=1\r\n",
        "t: <sip:bob@b>\r\n",
        "i: x@a\r\n",
        "CSeq: 1 INVITE\r\n",
        "m: <sip:alice@a>\r\n",
        "c: application/sdp\r\n",
        "k: replaces\r\n",
        "l: 0\r\n",
        "\r\n",
    );

    assert_eq!(Message::parse(long)?, Message::parse(compact)?);
    Ok(())
}

#[test]
fn header_lookup_is_case_insensitive() -> Result<()> {
    let raw = concat!(
        "OPTIONS sip:gateway SIP/2.0\r\n",
        "VIA: SIP/2.0/UDP a:5060;branch=z9hG4bK1\r\n",
        "CALL-id: x@a\r\n",
        "cseq: 7 OPTIONS\r\n",
        "\r\n",
    );

    let message = Message::parse(raw)?;
    assert_eq!(message.headers().call_id()?, "x@a");
    assert_eq!(message.headers().cseq()?, (7, Method::Options));
    assert!(message.headers().top_via()?.contains("z9hG4bK1"));
    Ok(())
}

#[test]
fn serialization_emits_one_via_per_line() {
    let mut headers = Headers::new();
    headers.push("Via", "SIP/2.0/UDP a:5060;branch=z9hG4bK1");
    headers.push("Via", "SIP/2.0/UDP b:5060;branch=z9hG4bK2");
    headers.push("Call-ID", "x@a");
    headers.push("CSeq", "1 ACK");
    headers.push("Content-Length", "0");

    let request = Request {
        method: Method::Ack,
        uri: "sip:bob@b".to_string(),
        headers,
        body: String::new(),
    };

    let text = request.to_string();
    assert_eq!(text.matches("Via:").count(), 2);
    assert!(text.contains("Via: SIP/2.0/UDP a:5060;branch=z9hG4bK1\r\n"));
    assert!(text.contains("Via: SIP/2.0/UDP b:5060;branch=z9hG4bK2\r\n"));
}

#[test]
fn via_param_rewrite_is_stable() -> Result<()> {
    let mut via = Via::parse("SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bKabc;rport")?;

    via.set_param("rport", Some("31337".to_string()));
    via.set_param("received", Some("203.0.113.9".to_string()));
    let once = via.to_string();

    via.set_param("rport", Some("31337".to_string()));
    via.set_param("received", Some("203.0.113.9".to_string()));
    assert_eq!(via.to_string(), once);

    let reparsed = Via::parse(&once)?;
    assert_eq!(reparsed.param_value("rport"), Some("31337"));
    assert_eq!(reparsed.param_value("received"), Some("203.0.113.9"));
    assert_eq!(reparsed.param_value("branch"), Some("z9hG4bKabc"));
    Ok(())
}

#[test]
fn body_bytes_survive_round_trip() -> Result<()> {
    let raw = concat!(
        "INVITE sip:bob@10.0.0.2 SIP/2.0\r\n",
        "Via: SIP/2.0/UDP a:5060;branch=z9hG4bK1\r\n",
        "Call-ID: x@a\r\n",
        "CSeq: 1 INVITE\r\n",
        "Content-Length: 36\r\n",
        "\r\n",
        "v=0\r\nm=audio 30000 RTP/AVP 0 8 101\r\n",
    );

    let message = Message::parse(raw)?;
    assert_eq!(message.body(), "v=0\r\nm=audio 30000 RTP/AVP 0 8 101\r\n");
    assert_eq!(message.to_string(), raw);
    Ok(())
}
