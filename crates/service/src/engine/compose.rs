use std::net::SocketAddr;

use codec::{Headers, Method, Request, Response, uri};

use super::EngineOptions;
use crate::dialog::{Dialog, Direction};

pub const ALLOW: &str = "INVITE, ACK, BYE, CANCEL, INFO, OPTIONS";
pub const SUPPORTED: &str = "replaces, timer";

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Trying",
        180 => "Ringing",
        200 => "OK",
        408 => "Request Timeout",
        480 => "Temporarily Unavailable",
        487 => "Request Terminated",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        603 => "Decline",
        _ => "",
    }
}

fn local_identity(options: &EngineOptions) -> String {
    format!(
        "\"{}\" <sip:gateway@{}>",
        options.display_name, options.domain
    )
}

pub fn contact(options: &EngineOptions) -> String {
    format!(
        "\"{}\" <sip:gateway@{}:{}>",
        options.display_name, options.advertised, options.local_port
    )
}

fn record_route(options: &EngineOptions) -> String {
    format!(
        "<sip:gateway@{}:{};lr>",
        options.advertised, options.local_port
    )
}

fn via_value(options: &EngineOptions, branch: &str) -> String {
    format!(
        "SIP/2.0/UDP {}:{};branch={};rport",
        options.advertised, options.local_port, branch
    )
}

/// Response skeleton echoing the request's Via set, From, To, Call-ID
/// and CSeq. The rewritten top Via goes back verbatim so a NATed peer
/// can still match the transaction.
pub fn response_for(request: &Request, status: u16) -> Response {
    let mut headers = Headers::new();
    for via in request.headers.get_all("Via") {
        headers.push("Via", via);
    }
    if let Some(from) = request.headers.get("From") {
        headers.push("From", from);
    }
    if let Some(to) = request.headers.get("To") {
        headers.push("To", to);
    }
    if let Some(call_id) = request.headers.get("Call-ID") {
        headers.push("Call-ID", call_id);
    }
    if let Some(cseq) = request.headers.get("CSeq") {
        headers.push("CSeq", cseq);
    }

    Response {
        status,
        reason: reason_phrase(status).to_string(),
        headers,
        body: String::new(),
    }
}

/// Augments the To header with the dialog's local tag unless the peer
/// already tagged it.
pub fn tag_to(response: &mut Response, tag: &str) {
    if let Some(to) = response.headers.get("To").map(str::to_string) {
        response.headers.set("To", uri::with_tag(&to, tag));
    }
}

/// Dialog-establishing headers on 180/200: a Contact naming the
/// gateway, the method surface, and a Record-Route pinning the gateway
/// into the route set.
pub fn add_gateway_headers(response: &mut Response, options: &EngineOptions) {
    response.headers.set("Contact", contact(options));
    response.headers.set("Allow", ALLOW);
    response.headers.set("Supported", SUPPORTED);
    response.headers.set("Record-Route", record_route(options));
}

pub fn invite(
    options: &EngineOptions,
    call_id: &str,
    local_tag: &str,
    branch: &str,
    target: &str,
    sdp: String,
) -> Request {
    let mut headers = Headers::new();
    headers.push("Via", via_value(options, branch));
    headers.push("Max-Forwards", "70");
    headers.push(
        "From",
        format!("{};tag={}", local_identity(options), local_tag),
    );
    headers.push("To", format!("<{}>", target));
    headers.push("Call-ID", call_id);
    headers.push("CSeq", "1 INVITE");
    headers.push("Contact", contact(options));
    headers.push("Allow", ALLOW);
    headers.push("Supported", SUPPORTED);
    headers.push("Content-Type", "application/sdp");

    Request {
        method: Method::Invite,
        uri: target.to_string(),
        headers,
        body: sdp,
    }
}

/// ACK for a 2xx. Transaction-less per RFC 3261, hence the fresh
/// branch; the To is echoed from the response so the remote tag rides
/// along.
pub fn ack(
    options: &EngineOptions,
    call_id: &str,
    cseq: u32,
    local_tag: &str,
    to: &str,
    uri: String,
    branch: &str,
) -> Request {
    let mut headers = Headers::new();
    headers.push("Via", via_value(options, branch));
    headers.push("Max-Forwards", "70");
    headers.push(
        "From",
        format!("{};tag={}", local_identity(options), local_tag),
    );
    headers.push("To", to);
    headers.push("Call-ID", call_id);
    headers.push("CSeq", format!("{} ACK", cseq));

    Request {
        method: Method::Ack,
        uri,
        headers,
        body: String::new(),
    }
}

/// BYE for either dialog orientation.
///
/// For incoming dialogs the From echoes the original To (with the
/// local tag appended) and the To echoes the original From; the
/// destination is the origin transport address, which NAT rewriting
/// makes more trustworthy than the From URI. For outgoing dialogs the
/// From is the gateway identity and the To is the target with the
/// learned remote tag; the destination is the upstream server.
pub fn bye(options: &EngineOptions, dialog: &Dialog, branch: &str) -> (Request, SocketAddr) {
    let (from, to, uri, addr) = match dialog.direction {
        Direction::Incoming => {
            let origin = dialog.origin_request.as_ref();
            let orig_to = origin.and_then(|r| r.headers.get("To")).unwrap_or_default();
            let orig_from = origin.and_then(|r| r.headers.get("From")).unwrap_or_default();
            (
                uri::with_tag(orig_to, &dialog.local_tag),
                orig_from.to_string(),
                uri::name_addr_uri(orig_from).to_string(),
                dialog.origin_addr.unwrap_or(options.upstream),
            )
        }
        Direction::Outgoing => {
            let target = dialog.target.clone().unwrap_or_default();
            let mut to = format!("<{}>", target);
            if let Some(tag) = &dialog.remote_tag {
                to = format!("{};tag={}", to, tag);
            }
            (
                format!("{};tag={}", local_identity(options), dialog.local_tag),
                to,
                target,
                options.upstream,
            )
        }
    };

    let mut headers = Headers::new();
    headers.push("Via", via_value(options, branch));
    headers.push("Max-Forwards", "70");
    headers.push("From", from);
    headers.push("To", to);
    headers.push("Call-ID", dialog.call_id.clone());
    headers.push("CSeq", format!("{} BYE", dialog.cseq));

    (
        Request {
            method: Method::Bye,
            uri,
            headers,
            body: String::new(),
        },
        addr,
    )
}

/// CANCEL for an unanswered outgoing INVITE; reuses the INVITE's
/// branch and sequence number as the matching rules require.
pub fn cancel(options: &EngineOptions, dialog: &Dialog, branch: &str) -> Request {
    let target = dialog.target.clone().unwrap_or_default();

    let mut headers = Headers::new();
    headers.push("Via", via_value(options, branch));
    headers.push("Max-Forwards", "70");
    headers.push(
        "From",
        format!("{};tag={}", local_identity(options), dialog.local_tag),
    );
    headers.push("To", format!("<{}>", target));
    headers.push("Call-ID", dialog.call_id.clone());
    headers.push("CSeq", format!("{} CANCEL", dialog.cseq));

    Request {
        method: Method::Cancel,
        uri: target,
        headers,
        body: String::new(),
    }
}
