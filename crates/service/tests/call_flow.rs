use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result, bail};
use codec::{Message, Method};
use serde_json::{Value, json};
use sip_gateway_service::{
    Engine, EngineOptions, Event,
    dialog::DialogState,
    events::EventReceiver,
    relay::RelayClient,
    stats::Stats,
    transport::Transport,
};
use tokio::{net::UdpSocket, time::timeout};

const TRANSLATED_SDP: &str = "v=0\r\no=- 9 9 IN IP4 198.51.100.7\r\nm=audio 40000 RTP/AVP 0 8\r\n";
const OFFER_SDP: &str = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\nm=audio 30000 RTP/AVP 0 8\r\n";
const BROWSER_SDP: &str = concat!(
    "v=0\r\n",
    "o=- 2 2 IN IP4 127.0.0.1\r\n",
    "m=audio 50000 UDP/TLS/RTP/SAVPF 111\r\n",
    "a=sendrecv\r\n",
    "m=video 50002 UDP/TLS/RTP/SAVPF 96\r\n",
);

/// Stub media daemon: answers every command with a canned result and
/// counts deletes.
async fn start_relay_stub() -> Result<(SocketAddr, Arc<AtomicUsize>)> {
    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    let addr = socket.local_addr()?;
    let deletes = Arc::new(AtomicUsize::new(0));

    let counter = deletes.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];
        while let Ok((size, peer)) = socket.recv_from(&mut buf).await {
            let text = String::from_utf8_lossy(&buf[..size]).to_string();
            let Some((cookie, payload)) = text.split_once(' ') else {
                continue;
            };
            let Ok(request) = serde_json::from_str::<Value>(payload) else {
                continue;
            };

            let reply = match request["command"].as_str().unwrap_or("") {
                "ping" => json!({ "result": "pong" }),
                // An `a=relay-reject` attribute makes the stub fail
                // the leg, for exercising daemon-error paths.
                "offer" | "answer" => {
                    let rejected = request["sdp"]
                        .as_str()
                        .map(|sdp| sdp.contains("a=relay-reject"))
                        .unwrap_or(false);
                    if rejected {
                        json!({ "result": "error", "error-reason": "unknown call-id" })
                    } else {
                        json!({ "result": "ok", "sdp": TRANSLATED_SDP })
                    }
                }
                "delete" => {
                    counter.fetch_add(1, Ordering::SeqCst);
                    json!({ "result": "ok" })
                }
                _ => json!({ "result": "error", "error-reason": "unknown command" }),
            };

            let datagram = format!("{} {}", cookie, reply);
            let _ = socket.send_to(datagram.as_bytes(), peer).await;
        }
    });

    Ok((addr, deletes))
}

async fn start_engine(
    relay_addr: SocketAddr,
    max_sessions: usize,
    upstream: Option<SocketAddr>,
) -> Result<(Engine, EventReceiver, SocketAddr)> {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
    let sip_addr = socket.local_addr()?;

    let stats = Arc::new(Stats::default());
    let relay = RelayClient::new(relay_addr, stats.clone()).await?;
    relay.ping().await?;

    let (engine, events) = Engine::new(
        EngineOptions {
            domain: "gw.test".to_string(),
            advertised: "127.0.0.1".to_string(),
            local_port: sip_addr.port(),
            upstream: upstream.unwrap_or("127.0.0.1:5060".parse()?),
            max_sessions,
            display_name: "WebRTC Gateway".to_string(),
        },
        Transport::new(socket.clone()),
        relay,
        stats,
    );

    let receiver = engine.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];
        while let Ok((size, addr)) = socket.recv_from(&mut buf).await {
            receiver.process(&buf[..size], addr).await;
        }
    });

    Ok((engine, events, sip_addr))
}

/// Scripted telephony-side endpoint.
struct Peer {
    socket: UdpSocket,
    gateway: SocketAddr,
}

impl Peer {
    async fn new(gateway: SocketAddr) -> Result<Self> {
        Ok(Self {
            socket: UdpSocket::bind("127.0.0.1:0").await?,
            gateway,
        })
    }

    fn from_socket(socket: UdpSocket, gateway: SocketAddr) -> Self {
        Self { socket, gateway }
    }

    fn port(&self) -> u16 {
        self.socket.local_addr().unwrap().port()
    }

    async fn send(&self, text: &str) -> Result<()> {
        self.socket.send_to(text.as_bytes(), self.gateway).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Message> {
        let mut buf = vec![0u8; 65536];
        let (size, _) = timeout(Duration::from_secs(2), self.socket.recv_from(&mut buf))
            .await
            .context("no datagram from gateway")??;
        Ok(Message::parse(std::str::from_utf8(&buf[..size])?)?)
    }

    async fn recv_status(&self) -> Result<u16> {
        match self.recv().await? {
            Message::Response(response) => Ok(response.status),
            Message::Request(request) => bail!("expected response, got {}", request.method),
        }
    }

    fn invite(&self, call_id: &str, branch: &str, body: &str) -> String {
        format!(
            concat!(
                "INVITE sip:alice@gw.test SIP/2.0\r\n",
                "Via: SIP/2.0/UDP 127.0.0.1:{port};branch={branch};rport\r\n",
                "Max-Forwards: 70\r\n",
                "From: \"Bob\" <sip:bob@pbx.test>;tag=remotetag1\r\n",
                "To: <sip:alice@gw.test>\r\n",
                "Call-ID: {call_id}\r\n",
                "CSeq: 1 INVITE\r\n",
                "Contact: <sip:bob@127.0.0.1:{port}>\r\n",
                "Content-Type: application/sdp\r\n",
                "Content-Length: {len}\r\n",
                "\r\n",
                "{body}",
            ),
            port = self.port(),
            branch = branch,
            call_id = call_id,
            len = body.len(),
            body = body,
        )
    }

    fn request(&self, method: &str, call_id: &str, branch: &str, cseq: &str, to_tag: &str) -> String {
        format!(
            concat!(
                "{method} sip:alice@gw.test SIP/2.0\r\n",
                "Via: SIP/2.0/UDP 127.0.0.1:{port};branch={branch}\r\n",
                "Max-Forwards: 70\r\n",
                "From: \"Bob\" <sip:bob@pbx.test>;tag=remotetag1\r\n",
                "To: <sip:alice@gw.test>{to_tag}\r\n",
                "Call-ID: {call_id}\r\n",
                "CSeq: {cseq}\r\n",
                "Content-Length: 0\r\n",
                "\r\n",
            ),
            method = method,
            port = self.port(),
            branch = branch,
            call_id = call_id,
            cseq = cseq,
            to_tag = to_tag,
        )
    }
}

async fn next_event(events: &mut EventReceiver) -> Result<Event> {
    timeout(Duration::from_secs(2), events.recv())
        .await
        .context("no event from engine")?
        .context("event channel closed")
}

async fn wait_until(mut probe: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if probe() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn inbound_call_full_lifecycle() -> Result<()> {
    let (relay_addr, deletes) = start_relay_stub().await?;
    let (engine, mut events, gateway) = start_engine(relay_addr, 8, None).await?;
    let peer = Peer::new(gateway).await?;

    peer.send(&peer.invite("call1@pbx.test", "z9hG4bKin1", OFFER_SDP))
        .await?;

    assert_eq!(peer.recv_status().await?, 100);
    assert_eq!(peer.recv_status().await?, 180);

    let Event::Incoming { call_id, from, to, sdp } = next_event(&mut events).await? else {
        bail!("expected incoming event");
    };
    assert_eq!(call_id, "call1@pbx.test");
    assert_eq!(from, "bob");
    assert_eq!(to, "alice");
    assert_eq!(sdp, TRANSLATED_SDP);

    engine.answer(&call_id, "alice", BROWSER_SDP).await?;

    let Message::Response(ok) = peer.recv().await? else {
        bail!("expected the 200");
    };
    assert_eq!(ok.status, 200);
    assert_eq!(ok.body, TRANSLATED_SDP);
    assert!(ok.headers.get("Contact").is_some());
    assert!(ok.headers.get("Record-Route").is_some());
    assert_eq!(ok.headers.get("Supported"), Some("replaces, timer"));
    let to_tag = codec::uri::header_param(ok.headers.get("To").unwrap(), "tag")
        .context("200 must tag the To")?
        .to_string();

    let to_tag_param = format!(";tag={}", to_tag);
    peer.send(&peer.request("ACK", &call_id, "z9hG4bKack1", "1 ACK", &to_tag_param))
        .await?;

    assert!(wait_until(|| engine.call_state(&call_id) == Some(DialogState::Established)).await);

    peer.send(&peer.request("BYE", &call_id, "z9hG4bKbye1", "2 BYE", &to_tag_param))
        .await?;
    assert_eq!(peer.recv_status().await?, 200);

    let Event::Ended { reason, .. } = next_event(&mut events).await? else {
        bail!("expected ended event");
    };
    assert_eq!(reason, "bye");

    assert!(wait_until(|| engine.active_calls() == 0).await);
    assert!(wait_until(|| deletes.load(Ordering::SeqCst) == 1).await);
    Ok(())
}

#[tokio::test]
async fn retransmitted_invite_is_replayed_not_redialed() -> Result<()> {
    let (relay_addr, _) = start_relay_stub().await?;
    let (engine, mut events, gateway) = start_engine(relay_addr, 8, None).await?;
    let peer = Peer::new(gateway).await?;

    let invite = peer.invite("dup@pbx.test", "z9hG4bKdup", OFFER_SDP);
    peer.send(&invite).await?;
    assert_eq!(peer.recv_status().await?, 100);
    assert_eq!(peer.recv_status().await?, 180);
    let _ = next_event(&mut events).await?;

    for _ in 0..2 {
        peer.send(&invite).await?;
        assert_eq!(peer.recv_status().await?, 180);
    }

    assert_eq!(engine.active_calls(), 1);
    assert_eq!(engine.stats().retried_invites.get(), 2);
    assert_eq!(engine.stats().calls_received.get(), 1);
    Ok(())
}

#[tokio::test]
async fn invite_without_valid_sdp_gets_500_and_no_dialog() -> Result<()> {
    let (relay_addr, _) = start_relay_stub().await?;
    let (engine, _events, gateway) = start_engine(relay_addr, 8, None).await?;
    let peer = Peer::new(gateway).await?;

    peer.send(&peer.invite("bad@pbx.test", "z9hG4bKbad", "no sdp here"))
        .await?;

    assert_eq!(peer.recv_status().await?, 500);
    assert_eq!(engine.active_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn invites_above_the_session_cap_get_503() -> Result<()> {
    let (relay_addr, _) = start_relay_stub().await?;
    let (engine, mut events, gateway) = start_engine(relay_addr, 1, None).await?;
    let peer = Peer::new(gateway).await?;

    peer.send(&peer.invite("one@pbx.test", "z9hG4bKone", OFFER_SDP))
        .await?;
    assert_eq!(peer.recv_status().await?, 100);
    assert_eq!(peer.recv_status().await?, 180);
    let _ = next_event(&mut events).await?;
    assert_eq!(engine.active_calls(), 1);

    peer.send(&peer.invite("two@pbx.test", "z9hG4bKtwo", OFFER_SDP))
        .await?;
    assert_eq!(peer.recv_status().await?, 503);
    assert_eq!(engine.active_calls(), 1);
    // Only the admitted call still holds its server transaction.
    assert!(wait_until(|| engine.server_transactions() == 1).await);
    Ok(())
}

#[tokio::test]
async fn rejected_invites_leave_no_server_transaction_behind() -> Result<()> {
    let (relay_addr, _) = start_relay_stub().await?;
    let (engine, mut events, gateway) = start_engine(relay_addr, 8, None).await?;
    let peer = Peer::new(gateway).await?;

    peer.send(&peer.invite("bad@pbx.test", "z9hG4bKs1", "no sdp here"))
        .await?;
    assert_eq!(peer.recv_status().await?, 500);
    assert!(wait_until(|| engine.server_transactions() == 0).await);

    let relay_reject =
        "v=0\r\no=- 3 3 IN IP4 127.0.0.1\r\nm=audio 30000 RTP/AVP 0 8\r\na=relay-reject\r\n";
    peer.send(&peer.invite("norelay@pbx.test", "z9hG4bKs2", relay_reject))
        .await?;
    assert_eq!(peer.recv_status().await?, 500);
    assert!(wait_until(|| engine.server_transactions() == 0).await);

    // An accepted call is the only thing that holds one, until its
    // ACK.
    peer.send(&peer.invite("good@pbx.test", "z9hG4bKs3", OFFER_SDP))
        .await?;
    assert_eq!(peer.recv_status().await?, 100);
    assert_eq!(peer.recv_status().await?, 180);
    let _ = next_event(&mut events).await?;
    assert_eq!(engine.server_transactions(), 1);
    Ok(())
}

#[tokio::test]
async fn unsupported_methods_get_501() -> Result<()> {
    let (relay_addr, _) = start_relay_stub().await?;
    let (_engine, _events, gateway) = start_engine(relay_addr, 8, None).await?;
    let peer = Peer::new(gateway).await?;

    peer.send(&peer.request("MESSAGE", "m@pbx.test", "z9hG4bKmsg", "1 MESSAGE", ""))
        .await?;
    assert_eq!(peer.recv_status().await?, 501);

    peer.send(&peer.request("OPTIONS", "o@pbx.test", "z9hG4bKopt", "1 OPTIONS", ""))
        .await?;
    let Message::Response(options) = peer.recv().await? else {
        bail!("expected response");
    };
    assert_eq!(options.status, 200);
    assert!(options.headers.get("Allow").unwrap().contains("INVITE"));
    Ok(())
}

#[tokio::test]
async fn cancel_terminates_a_ringing_call_with_487() -> Result<()> {
    let (relay_addr, deletes) = start_relay_stub().await?;
    let (engine, mut events, gateway) = start_engine(relay_addr, 8, None).await?;
    let peer = Peer::new(gateway).await?;

    peer.send(&peer.invite("cxl@pbx.test", "z9hG4bKcxl", OFFER_SDP))
        .await?;
    assert_eq!(peer.recv_status().await?, 100);
    assert_eq!(peer.recv_status().await?, 180);
    let _ = next_event(&mut events).await?;

    peer.send(&peer.request("CANCEL", "cxl@pbx.test", "z9hG4bKcxl", "1 CANCEL", ""))
        .await?;

    let mut statuses = vec![peer.recv_status().await?, peer.recv_status().await?];
    statuses.sort_unstable();
    assert_eq!(statuses, vec![200, 487]);

    let Event::Ended { reason, .. } = next_event(&mut events).await? else {
        bail!("expected ended event");
    };
    assert_eq!(reason, "cancelled");

    assert!(wait_until(|| engine.active_calls() == 0).await);
    assert!(wait_until(|| deletes.load(Ordering::SeqCst) == 1).await);
    Ok(())
}

#[tokio::test]
async fn dtmf_info_is_surfaced_and_acknowledged() -> Result<()> {
    let (relay_addr, _) = start_relay_stub().await?;
    let (engine, mut events, gateway) = start_engine(relay_addr, 8, None).await?;
    let peer = Peer::new(gateway).await?;

    peer.send(&peer.invite("dtmf@pbx.test", "z9hG4bKdt", OFFER_SDP))
        .await?;
    assert_eq!(peer.recv_status().await?, 100);
    assert_eq!(peer.recv_status().await?, 180);
    let Event::Incoming { call_id, .. } = next_event(&mut events).await? else {
        bail!("expected incoming event");
    };

    engine.answer(&call_id, "alice", BROWSER_SDP).await?;
    assert_eq!(peer.recv_status().await?, 200);
    peer.send(&peer.request("ACK", &call_id, "z9hG4bKdta", "1 ACK", ""))
        .await?;

    let body = "Signal=5\r\nDuration=200\r\n";
    let info = format!(
        concat!(
            "INFO sip:alice@gw.test SIP/2.0\r\n",
            "Via: SIP/2.0/UDP 127.0.0.1:{port};branch=z9hG4bKdti\r\n",
            "From: \"Bob\" <sip:bob@pbx.test>;tag=remotetag1\r\n",
            "To: <sip:alice@gw.test>\r\n",
            "Call-ID: {call_id}\r\n",
            "CSeq: 2 INFO\r\n",
            "Content-Type: application/dtmf-relay\r\n",
            "Content-Length: {len}\r\n",
            "\r\n",
            "{body}",
        ),
        port = peer.port(),
        call_id = call_id,
        len = body.len(),
        body = body,
    );
    peer.send(&info).await?;
    assert_eq!(peer.recv_status().await?, 200);

    let Event::Dtmf { digit, duration, .. } = next_event(&mut events).await? else {
        bail!("expected dtmf event");
    };
    assert_eq!(digit, '5');
    assert_eq!(duration, 200);
    assert_eq!(engine.stats().dtmf_digits_received.get(), 1);
    Ok(())
}

#[tokio::test]
async fn outbound_call_rings_answers_and_hangs_up() -> Result<()> {
    let (relay_addr, deletes) = start_relay_stub().await?;

    // The scripted peer doubles as the upstream server so the BYE
    // lands where the test can see it.
    let peer_socket = UdpSocket::bind("127.0.0.1:0").await?;
    let peer_addr = peer_socket.local_addr()?;
    let (engine, mut events, gateway) = start_engine(relay_addr, 8, Some(peer_addr)).await?;
    let peer = Peer::from_socket(peer_socket, gateway);

    let target = format!("sip:bob@127.0.0.1:{}", peer.port());
    let call_id = engine.place("alice", &target, OFFER_SDP).await?;

    let Message::Request(invite) = peer.recv().await? else {
        bail!("expected the INVITE");
    };
    assert_eq!(invite.method, Method::Invite);
    assert_eq!(invite.body, TRANSLATED_SDP);
    assert_eq!(invite.headers.call_id()?, call_id);
    let via = invite.headers.top_via()?.to_string();
    let from = invite.headers.get("From").unwrap().to_string();
    let to = invite.headers.get("To").unwrap().to_string();

    let ringing = format!(
        "SIP/2.0 180 Ringing\r\nVia: {via}\r\nFrom: {from}\r\nTo: {to}\r\nCall-ID: {call_id}\r\nCSeq: 1 INVITE\r\nContent-Length: 0\r\n\r\n",
    );
    peer.send(&ringing).await?;

    let Event::Ringing { .. } = next_event(&mut events).await? else {
        bail!("expected ringing event");
    };

    let answer_body = OFFER_SDP;
    let ok = format!(
        concat!(
            "SIP/2.0 200 OK\r\n",
            "Via: {via}\r\n",
            "From: {from}\r\n",
            "To: {to};tag=bobtag1\r\n",
            "Call-ID: {call_id}\r\n",
            "CSeq: 1 INVITE\r\n",
            "Contact: <sip:bob@127.0.0.1:{port}>\r\n",
            "Content-Type: application/sdp\r\n",
            "Content-Length: {len}\r\n",
            "\r\n",
            "{body}",
        ),
        via = via,
        from = from,
        to = to,
        call_id = call_id,
        port = peer.port(),
        len = answer_body.len(),
        body = answer_body,
    );
    peer.send(&ok).await?;

    // The ACK must hit the wire before the answered event surfaces.
    let Message::Request(ack) = peer.recv().await? else {
        bail!("expected the ACK");
    };
    assert_eq!(ack.method, Method::Ack);
    assert!(ack.headers.get("To").unwrap().contains("tag=bobtag1"));

    let Event::Answered { sdp, .. } = next_event(&mut events).await? else {
        bail!("expected answered event");
    };
    assert_eq!(sdp, TRANSLATED_SDP);

    engine.hangup(&call_id).await?;
    let Message::Request(bye) = peer.recv().await? else {
        bail!("expected the BYE");
    };
    assert_eq!(bye.method, Method::Bye);
    assert_eq!(bye.headers.cseq()?, (2, Method::Bye));
    assert!(bye.headers.get("To").unwrap().contains("tag=bobtag1"));

    assert!(wait_until(|| engine.active_calls() == 0).await);
    assert!(wait_until(|| deletes.load(Ordering::SeqCst) == 1).await);
    Ok(())
}

#[tokio::test]
async fn upstream_decline_fails_the_call() -> Result<()> {
    let (relay_addr, deletes) = start_relay_stub().await?;
    let (engine, mut events, gateway) = start_engine(relay_addr, 8, None).await?;
    let peer = Peer::new(gateway).await?;

    let target = format!("sip:bob@127.0.0.1:{}", peer.port());
    let call_id = engine.place("alice", &target, OFFER_SDP).await?;

    let Message::Request(invite) = peer.recv().await? else {
        bail!("expected the INVITE");
    };
    let busy = format!(
        "SIP/2.0 486 Busy Here\r\nVia: {}\r\nFrom: {}\r\nTo: {};tag=b\r\nCall-ID: {}\r\nCSeq: 1 INVITE\r\nContent-Length: 0\r\n\r\n",
        invite.headers.top_via()?,
        invite.headers.get("From").unwrap(),
        invite.headers.get("To").unwrap(),
        call_id,
    );
    peer.send(&busy).await?;

    let Event::Failed { reason, .. } = next_event(&mut events).await? else {
        bail!("expected failed event");
    };
    assert!(reason.starts_with("486"));

    assert!(wait_until(|| engine.active_calls() == 0).await);
    assert!(wait_until(|| deletes.load(Ordering::SeqCst) == 1).await);
    Ok(())
}

#[tokio::test]
async fn reinvite_renegotiates_with_existing_tags() -> Result<()> {
    let (relay_addr, _) = start_relay_stub().await?;
    let (engine, mut events, gateway) = start_engine(relay_addr, 8, None).await?;
    let peer = Peer::new(gateway).await?;

    peer.send(&peer.invite("hold@pbx.test", "z9hG4bKh1", OFFER_SDP))
        .await?;
    assert_eq!(peer.recv_status().await?, 100);
    assert_eq!(peer.recv_status().await?, 180);
    let Event::Incoming { call_id, .. } = next_event(&mut events).await? else {
        bail!("expected incoming event");
    };

    engine.answer(&call_id, "alice", BROWSER_SDP).await?;
    assert_eq!(peer.recv_status().await?, 200);
    peer.send(&peer.request("ACK", &call_id, "z9hG4bKh2", "1 ACK", ""))
        .await?;
    assert!(wait_until(|| engine.call_state(&call_id) == Some(DialogState::Established)).await);

    let hold_body = "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\nm=audio 30000 RTP/AVP 0 8\r\na=sendonly\r\n";
    let reinvite = format!(
        concat!(
            "INVITE sip:alice@gw.test SIP/2.0\r\n",
            "Via: SIP/2.0/UDP 127.0.0.1:{port};branch=z9hG4bKh3\r\n",
            "From: \"Bob\" <sip:bob@pbx.test>;tag=remotetag1\r\n",
            "To: <sip:alice@gw.test>\r\n",
            "Call-ID: {call_id}\r\n",
            "CSeq: 2 INVITE\r\n",
            "Content-Type: application/sdp\r\n",
            "Content-Length: {len}\r\n",
            "\r\n",
            "{body}",
        ),
        port = peer.port(),
        call_id = call_id,
        len = hold_body.len(),
        body = hold_body,
    );
    peer.send(&reinvite).await?;

    let Message::Response(ok) = peer.recv().await? else {
        bail!("expected the renegotiation 200");
    };
    assert_eq!(ok.status, 200);
    assert_eq!(ok.body, TRANSLATED_SDP);

    let Event::Renegotiation { sdp, .. } = next_event(&mut events).await? else {
        bail!("expected renegotiation event");
    };
    assert_eq!(sdp, TRANSLATED_SDP);
    assert_eq!(engine.stats().re_invites.get(), 1);
    assert_eq!(engine.active_calls(), 1);
    Ok(())
}

#[tokio::test]
async fn reject_sends_the_final_status_and_cleans_up() -> Result<()> {
    let (relay_addr, deletes) = start_relay_stub().await?;
    let (engine, mut events, gateway) = start_engine(relay_addr, 8, None).await?;
    let peer = Peer::new(gateway).await?;

    peer.send(&peer.invite("rej@pbx.test", "z9hG4bKrej", OFFER_SDP))
        .await?;
    assert_eq!(peer.recv_status().await?, 100);
    assert_eq!(peer.recv_status().await?, 180);
    let Event::Incoming { call_id, .. } = next_event(&mut events).await? else {
        bail!("expected incoming event");
    };

    engine.reject(&call_id, 603).await?;
    assert_eq!(peer.recv_status().await?, 603);

    assert!(wait_until(|| engine.active_calls() == 0).await);
    assert!(wait_until(|| deletes.load(Ordering::SeqCst) == 1).await);
    Ok(())
}
