pub mod protocol;

use std::{sync::Arc, time::Duration};

use ahash::{HashMap, HashMapExt};
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use service::{Engine, Event, events::EventReceiver, sdp};
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};

use self::protocol::{ClientFrame, MAX_FRAME_BYTES, ServerFrame, valid_username};

const HEARTBEAT: Duration = Duration::from_secs(30);

struct Peer {
    tx: UnboundedSender<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum CallOrigin {
    Telephony,
    Browser,
}

/// One engine-managed call as the hub tracks it: who owns it on the
/// browser side and which way it was set up, so a peer disconnect can
/// tear down exactly its telephony-linked calls.
struct ActiveCall {
    owner: String,
    origin: CallOrigin,
}

/// Registry of named browser peers and router between them and the
/// signaling engine.
pub struct Hub {
    peers: RwLock<HashMap<String, Peer>>,
    calls: RwLock<HashMap<String, ActiveCall>>,
    engine: Option<Engine>,
}

impl Hub {
    pub fn new(engine: Option<Engine>) -> Self {
        Self {
            peers: RwLock::new(HashMap::with_capacity(64)),
            calls: RwLock::new(HashMap::with_capacity(64)),
            engine,
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    pub fn call_count(&self) -> usize {
        self.calls.read().len()
    }

    /// Drives one websocket connection until it closes or fails two
    /// consecutive heartbeats.
    pub async fn serve(self: Arc<Self>, socket: WebSocket) {
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = unbounded_channel::<String>();
        let mut username: Option<String> = None;
        let mut missed = 0u8;

        send(&tx, &ServerFrame::Connected);

        let mut heartbeat = tokio::time::interval(HEARTBEAT);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        self.on_frame(&tx, &mut username, text.as_str()).await;
                    }
                    Some(Ok(WsMessage::Pong(_))) => missed = 0,
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::debug!("websocket receive failed: peer={:?}, err={}", username, e);
                        break;
                    }
                },
                outbound = rx.recv() => match outbound {
                    Some(text) => {
                        if sink.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = heartbeat.tick() => {
                    if missed >= 2 {
                        log::info!("peer failed heartbeats: peer={:?}", username);
                        break;
                    }
                    missed += 1;
                    if sink.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }

        self.disconnect(username).await;
    }

    async fn on_frame(
        &self,
        tx: &UnboundedSender<String>,
        username: &mut Option<String>,
        text: &str,
    ) {
        // The size gate runs before any parsing.
        if text.len() > MAX_FRAME_BYTES {
            send(tx, &ServerFrame::Error {
                message: "Message too large".to_string(),
            });
            return;
        }

        let Ok(raw) = serde_json::from_str::<Value>(text) else {
            send(tx, &ServerFrame::Error {
                message: "Invalid message".to_string(),
            });
            return;
        };
        let frame = match serde_json::from_value::<ClientFrame>(raw.clone()) {
            Ok(frame) => frame,
            Err(e) => {
                log::debug!("unparseable frame: peer={:?}, err={}", username, e);
                send(tx, &ServerFrame::Error {
                    message: "Invalid message".to_string(),
                });
                return;
            }
        };

        if let ClientFrame::Register { username: name } = &frame {
            self.register(tx, username, name.clone());
            return;
        }

        // Everything else requires an identity.
        let Some(me) = username.clone() else {
            send(tx, &ServerFrame::Error {
                message: "Not registered".to_string(),
            });
            return;
        };

        match frame {
            ClientFrame::Register { .. } => {}
            ClientFrame::CallRequest { to, sdp: offer, data } => {
                if to.starts_with("sip:") || to.starts_with("sips:") {
                    self.place_call(tx, &me, &to, offer.or(data)).await;
                } else {
                    self.forward(tx, &me, &to, raw);
                }
            }
            ClientFrame::CallResponse { to, accepted, call_id } => {
                if !accepted {
                    if let Some(call_id) = call_id.or_else(|| self.incoming_call_of(&me)) {
                        if self.owns_telephony_call(&me, &call_id) {
                            if let Some(engine) = &self.engine {
                                let _ = engine.reject(&call_id, 603).await;
                            }
                            self.calls.write().remove(&call_id);
                            return;
                        }
                    }
                }
                if let Some(to) = to {
                    self.forward(tx, &me, &to, raw);
                }
            }
            ClientFrame::Offer { to, .. } => self.forward(tx, &me, &to, raw),
            ClientFrame::Answer { to, data } => {
                match to {
                    Some(to) if !to.is_empty() => self.forward(tx, &me, &to, raw),
                    // An answer with no target is the browser-side
                    // answer for this peer's pending incoming call.
                    _ => self.answer_call(tx, &me, data).await,
                }
            }
            ClientFrame::IceCandidate { to, .. } => self.forward(tx, &me, &to, raw),
            ClientFrame::HangUp { call_id, to } => {
                if let Some(call_id) = call_id {
                    if self.owns_call(&me, &call_id) {
                        if let Some(engine) = &self.engine {
                            let _ = engine.hangup(&call_id).await;
                        }
                        self.calls.write().remove(&call_id);
                    }
                }
                if let Some(to) = to {
                    self.forward(tx, &me, &to, raw);
                }
            }
            ClientFrame::Reject { call_id, to } => {
                if let Some(call_id) = call_id {
                    if self.owns_telephony_call(&me, &call_id) {
                        if let Some(engine) = &self.engine {
                            let _ = engine.reject(&call_id, 603).await;
                        }
                        self.calls.write().remove(&call_id);
                    }
                }
                if let Some(to) = to {
                    self.send_to(&to, &ServerFrame::CallRejected { from: me });
                }
            }
        }
    }

    fn register(
        &self,
        tx: &UnboundedSender<String>,
        username: &mut Option<String>,
        name: String,
    ) {
        if username.is_some() {
            send(tx, &ServerFrame::Error {
                message: "Already registered".to_string(),
            });
            return;
        }
        if !valid_username(&name) {
            send(tx, &ServerFrame::Error {
                message: "Invalid username".to_string(),
            });
            return;
        }

        let users = {
            let mut peers = self.peers.write();
            if peers.contains_key(&name) {
                drop(peers);
                send(tx, &ServerFrame::Error {
                    message: "Username already taken".to_string(),
                });
                return;
            }
            peers.insert(name.clone(), Peer { tx: tx.clone() });
            peers.keys().cloned().collect::<Vec<_>>()
        };

        log::info!("peer registered: username={}, online={}", name, users.len());
        *username = Some(name.clone());
        send(tx, &ServerFrame::Registered {
            username: name.clone(),
        });
        send(tx, &ServerFrame::UserList { users });
        self.broadcast(&ServerFrame::UserJoined { username: name.clone() }, Some(&name));
    }

    async fn place_call(
        &self,
        tx: &UnboundedSender<String>,
        me: &str,
        target: &str,
        offer: Option<Value>,
    ) {
        let Some(engine) = &self.engine else {
            send(tx, &ServerFrame::Error {
                message: "Telephony gateway disabled".to_string(),
            });
            return;
        };
        let Some(offer) = offer.as_ref().and_then(sdp::flatten) else {
            send(tx, &ServerFrame::Error {
                message: "Call request carries no usable SDP".to_string(),
            });
            return;
        };

        match engine.place(me, target, &offer).await {
            Ok(call_id) => {
                self.calls.write().insert(call_id, ActiveCall {
                    owner: me.to_string(),
                    origin: CallOrigin::Browser,
                });
            }
            Err(e) => {
                log::warn!("placing call failed: peer={}, target={}, err={}", me, target, e);
                send(tx, &ServerFrame::Error {
                    message: "Call setup failed".to_string(),
                });
            }
        }
    }

    async fn answer_call(&self, tx: &UnboundedSender<String>, me: &str, data: Value) {
        let Some(engine) = &self.engine else {
            return;
        };
        let Some(call_id) = self.incoming_call_of(me) else {
            log::debug!("answer without a pending call: peer={}", me);
            return;
        };
        let Some(answer) = sdp::flatten(&data) else {
            send(tx, &ServerFrame::Error {
                message: "Answer carries no usable SDP".to_string(),
            });
            return;
        };

        if let Err(e) = engine.answer(&call_id, me, &answer).await {
            log::warn!("answering call failed: call={}, err={}", call_id, e);
            send(tx, &ServerFrame::Error {
                message: "Call setup failed".to_string(),
            });
        }
    }

    /// Forwards a browser-to-browser primitive verbatim, stamped with
    /// the sender.
    fn forward(&self, tx: &UnboundedSender<String>, me: &str, to: &str, mut raw: Value) {
        if let Some(object) = raw.as_object_mut() {
            object.insert("from".to_string(), Value::String(me.to_string()));
        }
        let delivered = self
            .peers
            .read()
            .get(to)
            .map(|peer| peer.tx.send(raw.to_string()).is_ok())
            .unwrap_or(false);

        if !delivered {
            send(tx, &ServerFrame::Error {
                message: "User not found".to_string(),
            });
        }
    }

    /// Routes engine events to the owning browser peer.
    pub async fn on_engine_event(&self, event: Event) {
        match event {
            Event::Incoming { call_id, from, to, sdp } => {
                let reachable = self.peers.read().contains_key(&to);
                if !reachable {
                    log::info!("callee unreachable: call={}, to={}", call_id, to);
                    if let Some(engine) = &self.engine {
                        let _ = engine.reject(&call_id, 480).await;
                    }
                    return;
                }

                self.calls.write().insert(call_id.clone(), ActiveCall {
                    owner: to.clone(),
                    origin: CallOrigin::Telephony,
                });
                self.send_to(&to, &ServerFrame::IncomingCall { from, call_id, sdp });
            }
            Event::Ringing { call_id } => {
                self.to_owner(&call_id, ServerFrame::CallRinging { call_id: call_id.clone() });
            }
            Event::Answered { call_id, sdp } => {
                self.to_owner(&call_id, ServerFrame::CallAnswered {
                    call_id: call_id.clone(),
                    sdp,
                });
            }
            Event::Failed { call_id, reason } => {
                self.to_owner(&call_id, ServerFrame::CallFailed {
                    call_id: call_id.clone(),
                    reason,
                });
                self.calls.write().remove(&call_id);
            }
            Event::Ended { call_id, reason } => {
                self.to_owner(&call_id, ServerFrame::CallEnded {
                    call_id: call_id.clone(),
                    reason,
                });
                self.calls.write().remove(&call_id);
            }
            Event::Dtmf { call_id, digit, duration } => {
                self.to_owner(&call_id, ServerFrame::Dtmf {
                    call_id: call_id.clone(),
                    digit,
                    duration,
                });
            }
            Event::Renegotiation { call_id, sdp } => {
                self.to_owner(&call_id, ServerFrame::MediaRenegotiation {
                    call_id: call_id.clone(),
                    sdp,
                });
            }
        }
    }

    /// Tears down everything a departing peer owned.
    async fn disconnect(&self, username: Option<String>) {
        let Some(name) = username else {
            return;
        };
        if self.peers.write().remove(&name).is_none() {
            return;
        }
        log::info!("peer disconnected: username={}", name);
        self.broadcast(&ServerFrame::UserLeft { username: name.clone() }, None);

        let owned: Vec<String> = {
            let calls = self.calls.read();
            calls
                .iter()
                .filter(|(_, call)| call.owner == name)
                .map(|(id, _)| id.clone())
                .collect()
        };

        for call_id in owned {
            if let Some(engine) = &self.engine {
                if let Err(e) = engine.hangup(&call_id).await {
                    log::debug!("disconnect hangup skipped: call={}, err={}", call_id, e);
                }
            }
            self.calls.write().remove(&call_id);
        }
    }

    fn incoming_call_of(&self, me: &str) -> Option<String> {
        self.calls
            .read()
            .iter()
            .find(|(_, call)| call.owner == me && call.origin == CallOrigin::Telephony)
            .map(|(id, _)| id.clone())
    }

    fn owns_call(&self, me: &str, call_id: &str) -> bool {
        self.calls
            .read()
            .get(call_id)
            .map(|call| call.owner == me)
            .unwrap_or(false)
    }

    fn owns_telephony_call(&self, me: &str, call_id: &str) -> bool {
        self.calls
            .read()
            .get(call_id)
            .map(|call| call.owner == me && call.origin == CallOrigin::Telephony)
            .unwrap_or(false)
    }

    fn to_owner(&self, call_id: &str, frame: ServerFrame) {
        let owner = self.calls.read().get(call_id).map(|c| c.owner.clone());
        match owner {
            Some(owner) => {
                self.send_to(&owner, &frame);
            }
            None => log::debug!("event for untracked call dropped: call={}", call_id),
        }
    }

    fn send_to(&self, username: &str, frame: &ServerFrame) -> bool {
        let peers = self.peers.read();
        match peers.get(username) {
            Some(peer) => match serde_json::to_string(frame) {
                Ok(text) => peer.tx.send(text).is_ok(),
                Err(_) => false,
            },
            None => false,
        }
    }

    fn broadcast(&self, frame: &ServerFrame, except: Option<&str>) {
        let Ok(text) = serde_json::to_string(frame) else {
            return;
        };
        for (name, peer) in self.peers.read().iter() {
            if Some(name.as_str()) != except {
                let _ = peer.tx.send(text.clone());
            }
        }
    }
}

fn send(tx: &UnboundedSender<String>, frame: &ServerFrame) {
    if let Ok(text) = serde_json::to_string(frame) {
        let _ = tx.send(text);
    }
}

/// Pumps engine events into the hub for as long as the engine lives.
pub async fn forward_events(hub: Arc<Hub>, mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        hub.on_engine_event(event).await;
    }
}
