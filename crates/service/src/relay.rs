use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use ahash::{HashMap, HashMapExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::{net::UdpSocket, sync::oneshot, time::timeout};

use crate::{Error, Result, dialog::Direction, stats::Stats, token};

/// Per-operation timeout toward the daemon.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Attempts per operation; backoff between attempt `i` and `i+1` is
/// `i` seconds.
const ATTEMPTS: u32 = 3;

/// Media identifiers the engine hands the daemon for one leg.
pub struct CallLeg<'a> {
    pub call_id: &'a str,
    pub from_tag: &'a str,
    pub to_tag: Option<&'a str>,
}

/// Translation profile for the SDP leaving the daemon.
///
/// The gateway bridges plain RTP with DTLS-SRTP, so the profile
/// differs per direction and per phase: the telephony side always
/// receives `RTP/AVP` with ICE stripped, the browser side always
/// receives `UDP/TLS/RTP/SAVPF` with ICE forced and passive DTLS.
pub fn outbound_offer_profile() -> Value {
    json!({
        "transport-protocol": "RTP/AVP",
        "ICE": "remove",
        "rtcp-mux": ["demux"],
        "codec": { "strip": ["opus"], "offer": ["PCMU", "PCMA"] },
    })
}

pub fn outbound_answer_profile() -> Value {
    json!({
        "transport-protocol": "UDP/TLS/RTP/SAVPF",
        "ICE": "force",
        "DTLS": "passive",
        "rtcp-mux": ["offer"],
        "codec": { "strip": ["telephone-event"], "offer": ["opus", "PCMU", "PCMA"] },
    })
}

pub fn inbound_offer_profile() -> Value {
    json!({
        "transport-protocol": "UDP/TLS/RTP/SAVPF",
        "ICE": "force",
        "DTLS": "passive",
        "rtcp-mux": ["require"],
    })
}

/// Re-INVITE offers mirror the transport of the dialog's original
/// direction and additionally ask the daemon to emit mid attributes.
pub fn reinvite_profile(direction: Direction) -> Value {
    let mut profile = match direction {
        Direction::Outgoing => outbound_offer_profile(),
        Direction::Incoming => inbound_offer_profile(),
    };
    profile["flags"] = json!(["generate-mid"]);
    profile
}

/// Request/response client for the media-relay control channel.
///
/// Each request datagram is `<cookie> <json>`; the daemon echoes the
/// cookie in front of its reply, which is how concurrent requests are
/// matched back to their callers.
#[derive(Clone)]
pub struct RelayClient {
    socket: Arc<UdpSocket>,
    server: SocketAddr,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<Value>>>>,
    running: Arc<AtomicBool>,
    stats: Arc<Stats>,
}

impl RelayClient {
    pub async fn new(server: SocketAddr, stats: Arc<Stats>) -> std::io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);

        let client = Self {
            socket,
            server,
            pending: Arc::new(Mutex::new(HashMap::with_capacity(32))),
            running: Arc::new(AtomicBool::new(true)),
            stats,
        };

        let reader = client.clone();
        tokio::spawn(async move { reader.read_loop().await });

        Ok(client)
    }

    async fn read_loop(self) {
        let mut buf = vec![0u8; 65536];
        while self.running.load(Ordering::Relaxed) {
            let (size, addr) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    log::error!("relay socket receive failed: err={}", e);
                    break;
                }
            };

            if addr != self.server {
                continue;
            }

            let Ok(text) = std::str::from_utf8(&buf[..size]) else {
                continue;
            };
            let Some((cookie, payload)) = text.split_once(' ') else {
                continue;
            };
            let Ok(value) = serde_json::from_str::<Value>(payload) else {
                log::warn!("relay reply is not json: cookie={}", cookie);
                continue;
            };

            if let Some(waiter) = self.pending.lock().remove(cookie) {
                let _ = waiter.send(value);
            }
        }
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.pending.lock().clear();
    }

    /// Liveness probe; used at startup to fail fast when the daemon is
    /// unreachable.
    pub async fn ping(&self) -> Result<()> {
        self.request("ping", json!({})).await.map(|_| ())
    }

    /// Submits an offer-side SDP; returns the translated SDP.
    pub async fn offer(&self, leg: CallLeg<'_>, sdp: &str, profile: Value) -> Result<String> {
        let payload = self.leg_payload(leg, Some(sdp), Some(profile));
        self.sdp_of(self.request("offer", payload).await?)
    }

    /// Submits an answer-side SDP; returns the translated SDP.
    ///
    /// The answer payload is minimal when `profile` is `None`: the
    /// daemon reuses the parameters of the offer phase.
    pub async fn answer(
        &self,
        leg: CallLeg<'_>,
        sdp: &str,
        profile: Option<Value>,
    ) -> Result<String> {
        let payload = self.leg_payload(leg, Some(sdp), profile);
        self.sdp_of(self.request("answer", payload).await?)
    }

    /// Releases the daemon-side state for a call. Errors are reported
    /// but the call teardown proceeds regardless.
    pub async fn delete(&self, call_id: &str, from_tag: &str) -> Result<()> {
        let payload = json!({ "call-id": call_id, "from-tag": from_tag });
        self.request("delete", payload).await.map(|_| ())
    }

    fn leg_payload(&self, leg: CallLeg<'_>, sdp: Option<&str>, profile: Option<Value>) -> Value {
        let mut payload = profile.unwrap_or_else(|| json!({}));
        payload["call-id"] = json!(leg.call_id);
        payload["from-tag"] = json!(leg.from_tag);
        if let Some(to_tag) = leg.to_tag {
            payload["to-tag"] = json!(to_tag);
        }
        if let Some(sdp) = sdp {
            payload["sdp"] = json!(sdp);
        }
        payload
    }

    fn sdp_of(&self, reply: Value) -> Result<String> {
        reply
            .get("sdp")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(Error::Relay("reply carries no sdp".to_string()))
    }

    async fn request(&self, command: &str, mut payload: Value) -> Result<Value> {
        if !self.running.load(Ordering::Relaxed) {
            return Err(Error::ShuttingDown);
        }

        payload["command"] = json!(command);
        let body = payload.to_string();

        for attempt in 1..=ATTEMPTS {
            self.stats.relay_requests.add(1);

            let cookie = token::hex(16);
            let (tx, rx) = oneshot::channel();
            self.pending.lock().insert(cookie.clone(), tx);

            let datagram = format!("{} {}", cookie, body);
            if let Err(e) = self.socket.send_to(datagram.as_bytes(), self.server).await {
                log::error!("relay send failed: command={}, err={}", command, e);
            }

            match timeout(REQUEST_TIMEOUT, rx).await {
                Ok(Ok(reply)) => {
                    let result = reply.get("result").and_then(Value::as_str).unwrap_or("");
                    if result == "ok" || result == "pong" {
                        return Ok(reply);
                    }

                    // A definitive error is fatal for the leg; only
                    // silence is retried.
                    self.stats.relay_errors.add(1);
                    let reason = reply
                        .get("error-reason")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown relay error")
                        .to_string();
                    return Err(Error::Relay(reason));
                }
                _ => {
                    self.pending.lock().remove(&cookie);
                    log::warn!(
                        "relay request timed out: command={}, attempt={}/{}",
                        command,
                        attempt,
                        ATTEMPTS
                    );

                    if attempt < ATTEMPTS {
                        tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                    }
                }
            }
        }

        self.stats.relay_errors.add(1);
        Err(Error::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_match_the_bridging_direction() {
        let outbound = outbound_offer_profile();
        assert_eq!(outbound["transport-protocol"], "RTP/AVP");
        assert_eq!(outbound["ICE"], "remove");
        assert_eq!(outbound["codec"]["offer"], json!(["PCMU", "PCMA"]));

        let answer = outbound_answer_profile();
        assert_eq!(answer["transport-protocol"], "UDP/TLS/RTP/SAVPF");
        assert_eq!(answer["DTLS"], "passive");

        let inbound = inbound_offer_profile();
        assert_eq!(inbound["rtcp-mux"], json!(["require"]));
    }

    #[test]
    fn reinvite_profile_adds_the_mid_flag_per_direction() {
        let incoming = reinvite_profile(Direction::Incoming);
        assert_eq!(incoming["flags"], json!(["generate-mid"]));
        assert_eq!(incoming["transport-protocol"], "UDP/TLS/RTP/SAVPF");

        let outgoing = reinvite_profile(Direction::Outgoing);
        assert_eq!(outgoing["flags"], json!(["generate-mid"]));
        assert_eq!(outgoing["transport-protocol"], "RTP/AVP");
    }
}
