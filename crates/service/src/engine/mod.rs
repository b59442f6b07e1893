mod compose;
mod nat;

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use codec::{Message, Method, Request, Response, uri::SipUri};
use parking_lot::Mutex;
use tokio::sync::mpsc::unbounded_channel;

use crate::{
    Error, Result,
    dialog::{Dialog, DialogState, DialogStore, Direction},
    events::{Event, EventReceiver, EventSender},
    relay::{self, CallLeg, RelayClient},
    sdp,
    stats::Stats,
    token,
    transaction::{OK_RETRANSMIT_SCHEDULE, TIMER_B, TransactionKey, TransactionStore},
    transport::Transport,
};

pub struct EngineOptions {
    /// SIP domain written into the gateway's From identity.
    pub domain: String,
    /// Address advertised in Via, Contact, Record-Route and Call-ID.
    pub advertised: String,
    /// Local SIP port, part of the advertised contact.
    pub local_port: u16,
    /// Upstream telephony server; default destination for requests
    /// whose target gives no routable address.
    pub upstream: SocketAddr,
    pub max_sessions: usize,
    pub display_name: String,
}

/// The signaling engine: owns the dialog and transaction stores, the
/// media-relay client and the event stream toward the hub.
///
/// Cheap to clone; timer tasks hold a clone and find their dialog by
/// call identifier, so a destroyed dialog invalidates its timers
/// naturally.
#[derive(Clone)]
pub struct Engine {
    options: Arc<EngineOptions>,
    transport: Transport,
    relay: RelayClient,
    dialogs: Arc<DialogStore>,
    transactions: Arc<TransactionStore>,
    events: EventSender,
    stats: Arc<Stats>,
    running: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(
        options: EngineOptions,
        transport: Transport,
        relay: RelayClient,
        stats: Arc<Stats>,
    ) -> (Self, EventReceiver) {
        let (events, receiver) = unbounded_channel();
        let dialogs = Arc::new(DialogStore::new(options.max_sessions));

        (
            Self {
                options: Arc::new(options),
                transport,
                relay,
                dialogs,
                transactions: Arc::new(TransactionStore::new()),
                events,
                stats,
                running: Arc::new(AtomicBool::new(true)),
            },
            receiver,
        )
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn active_calls(&self) -> usize {
        self.dialogs.len()
    }

    pub fn call_state(&self, call_id: &str) -> Option<DialogState> {
        self.dialogs.get(call_id).map(|entry| entry.lock().state)
    }

    /// Server transactions currently held; rejected INVITEs must not
    /// accumulate here.
    pub fn server_transactions(&self) -> usize {
        self.transactions.server_count()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Entry point for every inbound SIP datagram.
    pub async fn process(&self, datagram: &[u8], source: SocketAddr) {
        let Ok(text) = std::str::from_utf8(datagram) else {
            self.stats.parse_errors.add(1);
            return;
        };
        // Bare CRLF keep-alives are expected noise.
        if text.trim().is_empty() {
            return;
        }

        match Message::parse(text) {
            Ok(Message::Request(mut request)) => {
                nat::fixup(&mut request, source);
                self.handle_request(request, source).await;
            }
            Ok(Message::Response(response)) => self.handle_response(response).await,
            Err(e) => {
                self.stats.parse_errors.add(1);
                log::warn!("dropping malformed datagram: addr={:?}, err={}", source, e);
            }
        }
    }

    async fn handle_request(&self, request: Request, source: SocketAddr) {
        log::debug!("sip request: method={}, addr={:?}", request.method, source);

        match request.method.clone() {
            Method::Invite => self.handle_invite(request, source).await,
            Method::Ack => self.handle_ack(request).await,
            Method::Bye => self.handle_bye(request, source).await,
            Method::Cancel => self.handle_cancel(request, source).await,
            Method::Info => self.handle_info(request, source).await,
            Method::Options => self.reply(None, &request, source, 200, None, None).await,
            Method::Unknown(name) => {
                log::warn!("unsupported method: method={}, addr={:?}", name, source);
                self.reply(None, &request, source, 501, None, None).await;
            }
        }
    }

    // === outgoing calls ===================================================

    /// Places a browser-originated call toward a telephony URI.
    /// Returns the allocated call identifier; progress arrives as
    /// events.
    pub async fn place(&self, peer: &str, target: &str, offer: &str) -> Result<String> {
        if !self.is_running() {
            return Err(Error::ShuttingDown);
        }
        sdp::validate(offer)?;

        let call_id = token::call_id(&self.options.advertised);
        let local_tag = token::tag();

        let entry = self.dialogs.insert(Dialog::outgoing(
            call_id.clone(),
            peer.to_string(),
            local_tag.clone(),
            target.to_string(),
        ))?;
        self.stats.calls_placed.add(1);
        log::info!(
            "placing call: call={}, peer={}, target={}",
            call_id,
            peer,
            target
        );

        let leg = CallLeg {
            call_id: &call_id,
            from_tag: &local_tag,
            to_tag: None,
        };
        let translated = match self
            .relay
            .offer(leg, offer, relay::outbound_offer_profile())
            .await
        {
            Ok(translated) => translated,
            Err(e) => {
                log::error!("relay offer failed: call={}, err={}", call_id, e);
                self.cleanup(&call_id).await;
                return Err(e);
            }
        };
        if let Err(e) = sdp::validate(&translated) {
            self.cleanup(&call_id).await;
            return Err(e);
        }

        let branch = token::branch();
        {
            let mut dialog = entry.lock();
            // Torn down while the relay call was in flight.
            if dialog.state != DialogState::Calling {
                return Err(Error::NotFound);
            }
            dialog.invite_branch = Some(branch.clone());
        }

        let invite = compose::invite(
            &self.options,
            &call_id,
            &local_tag,
            &branch,
            target,
            translated,
        );
        self.arm_client_transaction(TransactionKey {
            branch,
            call_id: call_id.clone(),
            cseq: 1,
            method: Method::Invite,
        });
        let addr = self.route_for_uri(target);
        self.transport.send(&Message::Request(invite), addr).await;

        Ok(call_id)
    }

    async fn handle_response(&self, response: Response) {
        let key = match TransactionKey::of_response(&response) {
            Ok(key) => key,
            Err(e) => {
                log::debug!("unmatchable response: err={}", e);
                return;
            }
        };

        let Some((method, call_id)) = self.transactions.match_response(&key, response.status)
        else {
            log::trace!(
                "stray response absorbed: status={}, call={}",
                response.status,
                key.call_id
            );
            return;
        };

        match method {
            Method::Invite => self.on_invite_response(&call_id, response).await,
            Method::Bye | Method::Cancel => {
                log::debug!(
                    "final response absorbed: method={}, status={}",
                    method,
                    response.status
                );
            }
            _ => {}
        }
    }

    async fn on_invite_response(&self, call_id: &str, response: Response) {
        // A late response after cleanup is a no-op.
        let Some(entry) = self.dialogs.get(call_id) else {
            return;
        };
        let status = response.status;

        if status < 200 {
            if status == 180 {
                let ringing = {
                    let mut dialog = entry.lock();
                    if dialog.state == DialogState::Calling {
                        dialog.state = DialogState::Ringing;
                        true
                    } else {
                        false
                    }
                };
                if ringing {
                    self.emit(Event::Ringing {
                        call_id: call_id.to_string(),
                    });
                }
            }
            return;
        }

        if (200..300).contains(&status) {
            let remote_tag = response
                .headers
                .to_header()
                .ok()
                .and_then(|to| codec::uri::header_param(to, "tag"))
                .map(str::to_string);

            let established = {
                let mut dialog = entry.lock();
                if matches!(
                    dialog.state,
                    DialogState::Terminating | DialogState::Terminated
                ) {
                    None
                } else {
                    dialog.remote_tag = remote_tag.clone();
                    dialog.state = DialogState::Established;
                    Some((dialog.local_tag.clone(), dialog.target.clone()))
                }
            };
            let Some((local_tag, target)) = established else {
                return;
            };

            let leg = CallLeg {
                call_id,
                from_tag: &local_tag,
                to_tag: remote_tag.as_deref(),
            };
            let translated = match self
                .relay
                .answer(leg, &response.body, Some(relay::outbound_answer_profile()))
                .await
            {
                Ok(translated) => translated,
                Err(e) => {
                    log::error!("relay answer failed: call={}, err={}", call_id, e);
                    self.fail(call_id, "relay-error").await;
                    return;
                }
            };

            // The ACK goes out before the answered event is surfaced.
            let cseq = response.headers.cseq().map(|(seq, _)| seq).unwrap_or(1);
            let to = response.headers.get("To").unwrap_or_default().to_string();
            let ack_uri = response
                .headers
                .get("Contact")
                .map(|c| codec::uri::name_addr_uri(c).to_string())
                .or(target)
                .unwrap_or_default();
            let addr = self.route_for_uri(&ack_uri);
            let ack = compose::ack(
                &self.options,
                call_id,
                cseq,
                &local_tag,
                &to,
                ack_uri,
                &token::branch(),
            );
            self.transport.send(&Message::Request(ack), addr).await;

            self.emit(Event::Answered {
                call_id: call_id.to_string(),
                sdp: translated,
            });
            return;
        }

        let reason = format!("{} {}", status, response.reason)
            .trim_end()
            .to_string();
        log::info!("call rejected upstream: call={}, reason={}", call_id, reason);
        self.fail(call_id, &reason).await;
    }

    // === incoming calls ===================================================

    async fn handle_invite(&self, request: Request, source: SocketAddr) {
        let key = match TransactionKey::of_request(&request) {
            Ok(key) => key,
            Err(e) => {
                self.stats.parse_errors.add(1);
                log::warn!("invite without transaction identity: err={}", e);
                return;
            }
        };

        // A retransmission is answered by replay, never by a second
        // dialog.
        if let Some(replay) = self.transactions.replay_response(&key) {
            self.stats.retried_invites.add(1);
            log::debug!(
                "replaying response for retransmitted invite: call={}, status={}",
                key.call_id,
                replay.status
            );
            self.transport.send(&Message::Response(replay), source).await;
            return;
        }

        let call_id = key.call_id.clone();
        if let Some(entry) = self.dialogs.get(&call_id) {
            self.handle_reinvite(entry, request, source, key).await;
            return;
        }

        // Seen but unanswered key: the first copy is still being
        // processed (relay translation in flight).
        if !self.transactions.begin_server(key.clone()) {
            return;
        }

        // The reject paths below never grow a dialog, so the server
        // transaction has no cleanup to ride on and is evicted here.
        if self.dialogs.at_capacity() {
            log::warn!(
                "session cap reached, refusing invite: call={}, cap={}",
                call_id,
                self.dialogs.limit()
            );
            self.reply(Some(&key), &request, source, 503, None, None).await;
            self.transactions.evict_server(&key);
            return;
        }

        if let Err(e) = sdp::validate(&request.body) {
            log::warn!("invite body rejected: call={}, err={}", call_id, e);
            self.reply(Some(&key), &request, source, 500, None, None).await;
            self.transactions.evict_server(&key);
            return;
        }

        let from = request.headers.get("From").unwrap_or_default().to_string();
        let from_tag = codec::uri::header_param(&from, "tag").unwrap_or_default();

        let leg = CallLeg {
            call_id: &call_id,
            from_tag,
            to_tag: None,
        };
        let translated = match self
            .relay
            .offer(leg, &request.body, relay::inbound_offer_profile())
            .await
        {
            Ok(translated) => translated,
            Err(e) => {
                log::error!("relay offer failed: call={}, err={}", call_id, e);
                self.reply(Some(&key), &request, source, 500, None, None).await;
                self.transactions.evict_server(&key);
                return;
            }
        };

        let local_tag = token::tag();
        self.reply(Some(&key), &request, source, 100, None, None).await;
        self.reply(Some(&key), &request, source, 180, Some(&local_tag), None)
            .await;

        let from_user = display_user(&from);
        let to_user = display_user(request.headers.get("To").unwrap_or_default());

        let dialog = Dialog::incoming(
            call_id.clone(),
            to_user.clone(),
            local_tag,
            request.clone(),
            source,
            key.clone(),
        );
        if let Err(e) = self.dialogs.insert(dialog) {
            log::error!("dialog insert failed: call={}, err={}", call_id, e);
            self.reply(Some(&key), &request, source, 503, None, None).await;
            let _ = self.relay.delete(&call_id, from_tag).await;
            self.transactions.evict_server(&key);
            return;
        }

        self.stats.calls_received.add(1);
        log::info!(
            "incoming call: call={}, from={}, to={}",
            call_id,
            from_user,
            to_user
        );
        self.emit(Event::Incoming {
            call_id,
            from: from_user,
            to: to_user,
            sdp: translated,
        });
    }

    /// Browser-side answer for a ringing incoming dialog.
    pub async fn answer(&self, call_id: &str, peer: &str, sdp: &str) -> Result<()> {
        let entry = self.dialogs.get(call_id).ok_or(Error::NotFound)?;

        let (origin, origin_addr, key, local_tag, remote_tag) = {
            let dialog = entry.lock();
            if dialog.direction != Direction::Incoming {
                return Err(Error::Protocol("answer on an outgoing dialog"));
            }
            if dialog.state != DialogState::Ringing {
                return Err(Error::Protocol("dialog is not awaiting an answer"));
            }
            if dialog.peer != peer {
                return Err(Error::Protocol("dialog owned by another peer"));
            }
            (
                dialog
                    .origin_request
                    .clone()
                    .ok_or(Error::Protocol("origin request missing"))?,
                dialog
                    .origin_addr
                    .ok_or(Error::Protocol("origin address missing"))?,
                dialog
                    .transaction_key
                    .clone()
                    .ok_or(Error::Protocol("transaction key missing"))?,
                dialog.local_tag.clone(),
                dialog.remote_tag.clone().unwrap_or_default(),
            )
        };

        // The telephony leg is audio-only; a stray video m-line from
        // the browser confuses downstream devices.
        let sdp = sdp::strip_video(sdp);
        sdp::validate(&sdp)?;

        let leg = CallLeg {
            call_id,
            from_tag: &remote_tag,
            to_tag: Some(&local_tag),
        };
        let translated = match self.relay.answer(leg, &sdp, None).await {
            Ok(translated) => translated,
            Err(e) => {
                log::error!("relay answer failed: call={}, err={}", call_id, e);
                self.reply(Some(&key), &origin, origin_addr, 500, None, None)
                    .await;
                self.fail(call_id, "relay-error").await;
                return Err(e);
            }
        };

        let mut ok = compose::response_for(&origin, 200);
        compose::tag_to(&mut ok, &local_tag);
        compose::add_gateway_headers(&mut ok, &self.options);
        ok.headers.set("Content-Type", "application/sdp");
        ok.body = translated;

        self.transactions.remember_response(&key, &ok);
        self.transport
            .send(&Message::Response(ok.clone()), origin_addr)
            .await;

        {
            let mut dialog = entry.lock();
            // Raced with a CANCEL or a disconnect while the relay call
            // was in flight.
            if dialog.state != DialogState::Ringing {
                return Ok(());
            }
            dialog.state = DialogState::Answered;
            dialog.pending_ok = Some(ok);
            dialog.retransmits = 0;

            let engine = self.clone();
            let id = call_id.to_string();
            dialog.retransmit_timer = Some(tokio::spawn(async move {
                engine.retransmit_ok(id).await;
            }));

            let engine = self.clone();
            let id = call_id.to_string();
            dialog.ack_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(TIMER_B).await;
                engine.on_ack_timeout(&id).await;
            }));
        }

        log::info!("call answered locally: call={}", call_id);
        Ok(())
    }

    /// Resends the pending 200 on the backed-off schedule until the
    /// ACK arrives; Timer H reaps the dialog if it never does.
    async fn retransmit_ok(&self, call_id: String) {
        for interval in OK_RETRANSMIT_SCHEDULE {
            tokio::time::sleep(interval).await;

            let Some(entry) = self.dialogs.get(&call_id) else {
                return;
            };
            let pending = {
                let mut dialog = entry.lock();
                if dialog.state != DialogState::Answered || dialog.ack_received {
                    return;
                }
                dialog.retransmits += 1;
                log::debug!(
                    "retransmitting 200: call={}, attempt={}",
                    call_id,
                    dialog.retransmits
                );
                dialog
                    .pending_ok
                    .clone()
                    .zip(dialog.origin_addr)
            };

            if let Some((ok, addr)) = pending {
                self.transport.send(&Message::Response(ok), addr).await;
            }
        }
    }

    async fn on_ack_timeout(&self, call_id: &str) {
        let Some(entry) = self.dialogs.get(call_id) else {
            return;
        };
        {
            let dialog = entry.lock();
            if dialog.state != DialogState::Answered || dialog.ack_received {
                return;
            }
        }

        log::warn!("no ack for 200, terminating: call={}", call_id);
        self.fail(call_id, "ack-timeout").await;
    }

    async fn handle_ack(&self, request: Request) {
        let Ok(call_id) = request.headers.call_id().map(str::to_string) else {
            return;
        };
        let Some(entry) = self.dialogs.get(&call_id) else {
            log::warn!("ack without session: call={}", call_id);
            return;
        };

        let key = {
            let mut dialog = entry.lock();
            match dialog.state {
                DialogState::Answered => {
                    dialog.ack_received = true;
                    dialog.cancel_timers();
                    dialog.pending_ok = None;
                    dialog.state = DialogState::Established;
                    dialog.transaction_key.take()
                }
                // Retransmitted ACK, or the ACK of a re-INVITE 200.
                DialogState::Established => None,
                _ => {
                    log::warn!(
                        "ack in unexpected state: call={}, state={:?}",
                        call_id,
                        dialog.state
                    );
                    None
                }
            }
        };

        // The dialog is the authoritative record from here on.
        if let Some(key) = key {
            self.transactions.evict_server(&key);
            log::info!("call established: call={}", call_id);
        }
    }

    async fn handle_bye(&self, request: Request, source: SocketAddr) {
        let Ok(call_id) = request.headers.call_id().map(str::to_string) else {
            return;
        };
        let Some(_) = self.dialogs.get(&call_id) else {
            log::debug!("bye for unknown call ignored: call={}", call_id);
            return;
        };

        self.reply(None, &request, source, 200, None, None).await;
        self.stats.calls_completed.add(1);
        log::info!("remote hangup: call={}", call_id);
        self.emit(Event::Ended {
            call_id: call_id.clone(),
            reason: "bye".to_string(),
        });
        self.cleanup(&call_id).await;
    }

    async fn handle_cancel(&self, request: Request, source: SocketAddr) {
        let Ok(call_id) = request.headers.call_id().map(str::to_string) else {
            return;
        };
        let Some(entry) = self.dialogs.get(&call_id) else {
            log::debug!("cancel for unknown call ignored: call={}", call_id);
            return;
        };

        let ringing = {
            let dialog = entry.lock();
            if dialog.state == DialogState::Ringing && dialog.direction == Direction::Incoming {
                Some((
                    dialog.origin_request.clone(),
                    dialog.origin_addr,
                    dialog.transaction_key.clone(),
                    dialog.local_tag.clone(),
                ))
            } else {
                None
            }
        };

        self.reply(None, &request, source, 200, None, None).await;

        let Some((Some(origin), Some(origin_addr), Some(key), local_tag)) = ringing else {
            return;
        };

        // The original INVITE ends with 487, using the remembered
        // request so the transaction matches.
        self.reply(Some(&key), &origin, origin_addr, 487, Some(&local_tag), None)
            .await;
        log::info!("call cancelled by remote: call={}", call_id);
        self.emit(Event::Ended {
            call_id: call_id.clone(),
            reason: "cancelled".to_string(),
        });
        self.cleanup(&call_id).await;
    }

    async fn handle_info(&self, request: Request, source: SocketAddr) {
        let Ok(call_id) = request.headers.call_id().map(str::to_string) else {
            return;
        };
        if self.dialogs.get(&call_id).is_none() {
            log::debug!("info for unknown call ignored: call={}", call_id);
            return;
        }

        let is_dtmf = request
            .headers
            .get("Content-Type")
            .map(|ct| ct.contains("application/dtmf-relay"))
            .unwrap_or(false);

        if is_dtmf {
            if let Some((digit, duration)) = parse_dtmf(&request.body) {
                self.stats.dtmf_digits_received.add(1);
                log::debug!("dtmf: call={}, digit={}, duration={}", call_id, digit, duration);
                self.emit(Event::Dtmf {
                    call_id: call_id.clone(),
                    digit,
                    duration,
                });
            }
        }

        self.reply(None, &request, source, 200, None, None).await;
    }

    // === renegotiation ====================================================

    async fn handle_reinvite(
        &self,
        entry: Arc<Mutex<Dialog>>,
        request: Request,
        source: SocketAddr,
        key: TransactionKey,
    ) {
        enum Disposition {
            Renegotiate(Direction, String, String, String),
            Drop,
            Unexpected,
        }

        let disposition = {
            let dialog = entry.lock();
            match dialog.state {
                DialogState::Established => Disposition::Renegotiate(
                    dialog.direction,
                    dialog.call_id.clone(),
                    dialog.local_tag.clone(),
                    dialog.remote_tag.clone().unwrap_or_default(),
                ),
                // The initial INVITE's first provisional has not been
                // sent yet; the retransmission is dropped, not failed.
                DialogState::Ringing if dialog.transaction_key.as_ref() == Some(&key) => {
                    Disposition::Drop
                }
                _ => Disposition::Unexpected,
            }
        };

        let (direction, call_id, local_tag, remote_tag) = match disposition {
            Disposition::Renegotiate(direction, call_id, local_tag, remote_tag) => {
                (direction, call_id, local_tag, remote_tag)
            }
            Disposition::Drop => return,
            Disposition::Unexpected => {
                log::warn!(
                    "invite in unexpected dialog state: call={}",
                    request.headers.call_id().unwrap_or("?")
                );
                self.reply(None, &request, source, 500, None, None).await;
                return;
            }
        };

        if sdp::validate(&request.body).is_err() {
            self.reply(None, &request, source, 500, None, None).await;
            return;
        }

        self.transactions.begin_server(key.clone());
        self.stats.re_invites.add(1);

        let (from_tag, to_tag) = match direction {
            Direction::Incoming => (remote_tag, local_tag.clone()),
            Direction::Outgoing => (local_tag.clone(), remote_tag),
        };
        let leg = CallLeg {
            call_id: &call_id,
            from_tag: &from_tag,
            to_tag: Some(&to_tag),
        };
        let translated = match self
            .relay
            .offer(leg, &request.body, relay::reinvite_profile(direction))
            .await
        {
            Ok(translated) => translated,
            Err(e) => {
                log::error!("relay renegotiation failed: call={}, err={}", call_id, e);
                self.reply(Some(&key), &request, source, 500, None, None).await;
                self.fail(&call_id, "relay-error").await;
                return;
            }
        };

        log::info!("renegotiated media: call={}", call_id);
        self.reply(
            Some(&key),
            &request,
            source,
            200,
            Some(&local_tag),
            Some(translated.clone()),
        )
        .await;
        self.emit(Event::Renegotiation {
            call_id,
            sdp: translated,
        });
    }

    // === teardown =========================================================

    /// Gateway-initiated hangup: BYE for live dialogs, CANCEL for an
    /// unanswered outgoing INVITE, a decline for an unanswered
    /// incoming one.
    pub async fn hangup(&self, call_id: &str) -> Result<()> {
        let Some(entry) = self.dialogs.get(call_id) else {
            return Err(Error::NotFound);
        };

        enum Action {
            Bye(Request, SocketAddr, TransactionKey),
            Cancel(Request, SocketAddr, TransactionKey),
            Reject,
            Cleanup,
            Nothing,
        }

        let action = {
            let mut dialog = entry.lock();
            match (dialog.state, dialog.direction) {
                (DialogState::Answered | DialogState::Established, _) => {
                    dialog.cseq += 1;
                    let branch = token::branch();
                    let (bye, addr) = compose::bye(&self.options, &dialog, &branch);
                    let key = TransactionKey {
                        branch,
                        call_id: dialog.call_id.clone(),
                        cseq: dialog.cseq,
                        method: Method::Bye,
                    };
                    Action::Bye(bye, addr, key)
                }
                (DialogState::Calling, Direction::Outgoing) => {
                    let branch = dialog.invite_branch.clone().unwrap_or_else(token::branch);
                    let cancel = compose::cancel(&self.options, &dialog, &branch);
                    let addr = dialog
                        .target
                        .as_deref()
                        .map(|t| self.route_for_uri(t))
                        .unwrap_or(self.options.upstream);
                    let key = TransactionKey {
                        branch,
                        call_id: dialog.call_id.clone(),
                        cseq: dialog.cseq,
                        method: Method::Cancel,
                    };
                    Action::Cancel(cancel, addr, key)
                }
                (DialogState::Ringing, Direction::Incoming) => Action::Reject,
                (DialogState::Terminating | DialogState::Terminated, _) => Action::Nothing,
                _ => Action::Cleanup,
            }
        };

        match action {
            Action::Bye(bye, addr, key) => {
                log::info!("hangup: call={}", call_id);
                self.arm_client_transaction(key);
                // Fire and forget: cleanup does not wait for the 200.
                self.transport.send(&Message::Request(bye), addr).await;
                self.cleanup(call_id).await;
            }
            Action::Cancel(cancel, addr, key) => {
                log::info!("cancelling unanswered call: call={}", call_id);
                self.arm_client_transaction(key);
                // Cleanup rides on the 487 the CANCEL provokes.
                self.transport.send(&Message::Request(cancel), addr).await;
            }
            Action::Reject => {
                return self.reject(call_id, 603).await;
            }
            Action::Cleanup => {
                self.cleanup(call_id).await;
            }
            Action::Nothing => {}
        }

        Ok(())
    }

    /// Declines a ringing incoming dialog with a final status
    /// (603 on user decline or disconnect, 480 when the callee is
    /// unreachable).
    pub async fn reject(&self, call_id: &str, status: u16) -> Result<()> {
        let Some(entry) = self.dialogs.get(call_id) else {
            return Err(Error::NotFound);
        };

        let (origin, origin_addr, key, local_tag) = {
            let dialog = entry.lock();
            if dialog.direction != Direction::Incoming {
                return Err(Error::Protocol("reject on an outgoing dialog"));
            }
            if !matches!(dialog.state, DialogState::Ringing | DialogState::Answered) {
                return Err(Error::Protocol("dialog is not rejectable"));
            }
            (
                dialog
                    .origin_request
                    .clone()
                    .ok_or(Error::Protocol("origin request missing"))?,
                dialog
                    .origin_addr
                    .ok_or(Error::Protocol("origin address missing"))?,
                dialog
                    .transaction_key
                    .clone()
                    .ok_or(Error::Protocol("transaction key missing"))?,
                dialog.local_tag.clone(),
            )
        };

        log::info!("rejecting call: call={}, status={}", call_id, status);
        self.reply(Some(&key), &origin, origin_addr, status, Some(&local_tag), None)
            .await;
        self.cleanup(call_id).await;
        Ok(())
    }

    /// Emits the failure event and tears the dialog down.
    async fn fail(&self, call_id: &str, reason: &str) {
        self.stats.calls_failed.add(1);
        self.emit(Event::Failed {
            call_id: call_id.to_string(),
            reason: reason.to_string(),
        });
        self.cleanup(call_id).await;
    }

    /// The single destruction path. Idempotent: entering state
    /// `Terminating` bars re-entry, so racing BYE and disconnect
    /// cleanups produce one relay delete and one store removal.
    pub async fn cleanup(&self, call_id: &str) {
        let Some(entry) = self.dialogs.get(call_id) else {
            return;
        };

        let from_tag = {
            let mut dialog = entry.lock();
            if matches!(
                dialog.state,
                DialogState::Terminating | DialogState::Terminated
            ) {
                return;
            }
            dialog.state = DialogState::Terminating;
            dialog.cancel_timers();
            dialog.relay_from_tag()
        };

        self.transactions.remove_for_call(call_id);

        if let Err(e) = self.relay.delete(call_id, &from_tag).await {
            log::warn!("relay delete failed: call={}, err={}", call_id, e);
        }

        {
            let mut dialog = entry.lock();
            dialog.state = DialogState::Terminated;
        }
        self.dialogs.remove(call_id);
        log::info!(
            "dialog removed: call={}, active={}",
            call_id,
            self.dialogs.len()
        );
    }

    /// Graceful shutdown: refuse new work, hang up every dialog, then
    /// stop the relay client and outstanding timers.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);

        for call_id in self.dialogs.ids() {
            if let Err(e) = self.hangup(&call_id).await {
                log::debug!("shutdown hangup skipped: call={}, err={}", call_id, e);
            }
        }
        // A CANCELed outgoing dialog waits for its 487; shutdown does
        // not.
        for call_id in self.dialogs.ids() {
            self.cleanup(&call_id).await;
        }

        self.transactions.shutdown();
        self.relay.shutdown();
        log::info!("signaling engine stopped");
    }

    // === plumbing =========================================================

    fn emit(&self, event: Event) {
        if self.events.send(event).is_err() {
            log::warn!("event receiver dropped");
        }
    }

    fn arm_client_transaction(&self, key: TransactionKey) {
        let engine = self.clone();
        let timer_key = key.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(TIMER_B).await;
            engine.on_transaction_timeout(timer_key).await;
        });
        self.transactions.register_client(key, timer);
    }

    async fn on_transaction_timeout(&self, key: TransactionKey) {
        let Some((method, call_id)) = self.transactions.take_expired(&key) else {
            return;
        };
        log::warn!(
            "transaction timeout: method={}, call={}",
            method,
            call_id
        );

        if method != Method::Invite {
            return;
        }
        if self.dialogs.get(&call_id).is_none() {
            return;
        }
        self.fail(&call_id, "request-timeout").await;
    }

    async fn reply(
        &self,
        key: Option<&TransactionKey>,
        request: &Request,
        addr: SocketAddr,
        status: u16,
        to_tag: Option<&str>,
        body: Option<String>,
    ) {
        let mut response = compose::response_for(request, status);
        if let Some(tag) = to_tag {
            compose::tag_to(&mut response, tag);
        }
        if matches!(status, 180 | 200) {
            compose::add_gateway_headers(&mut response, &self.options);
        }
        if let Some(body) = body {
            response.headers.set("Content-Type", "application/sdp");
            response.body = body;
        }
        if let Some(key) = key {
            self.transactions.remember_response(key, &response);
        }
        self.transport.send(&Message::Response(response), addr).await;
    }

    /// Routes a request to the URI's host when it names a literal
    /// address, to the upstream server otherwise.
    fn route_for_uri(&self, target: &str) -> SocketAddr {
        SipUri::parse(target)
            .ok()
            .and_then(|uri| {
                format!("{}:{}", uri.host, uri.port.unwrap_or(5060))
                    .parse()
                    .ok()
            })
            .unwrap_or(self.options.upstream)
    }
}

/// The routable username of a From/To header: the URI user part, or
/// the whole host when there is none.
fn display_user(header: &str) -> String {
    let uri = codec::uri::name_addr_uri(header);
    match SipUri::parse(uri) {
        Ok(parsed) => parsed.user.unwrap_or(parsed.host),
        Err(_) => uri.to_string(),
    }
}

/// Extracts `Signal`/`Duration` out of a dtmf-relay INFO body. The
/// duration defaults to 160 ms; accepted signals are 0-9, A-D, `*`
/// and `#`.
fn parse_dtmf(body: &str) -> Option<(char, u32)> {
    let mut digit = None;
    let mut duration = 160;

    for line in body.lines() {
        let Some((name, value)) = line.split_once('=') else {
            continue;
        };
        match name.trim().to_ascii_lowercase().as_str() {
            "signal" => digit = value.trim().chars().next(),
            "duration" => duration = value.trim().parse().unwrap_or(160),
            _ => {}
        }
    }

    let digit = digit?.to_ascii_uppercase();
    matches!(digit, '0'..='9' | 'A'..='D' | '*' | '#').then_some((digit, duration))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtmf_body_parses_with_default_duration() {
        assert_eq!(parse_dtmf("Signal=5\r\nDuration=200\r\n"), Some(('5', 200)));
        assert_eq!(parse_dtmf("Signal=#\r\n"), Some(('#', 160)));
        assert_eq!(parse_dtmf("Signal=d\r\n"), Some(('D', 160)));
        assert_eq!(parse_dtmf("Signal=x\r\n"), None);
        assert_eq!(parse_dtmf(""), None);
    }

    #[test]
    fn display_user_prefers_the_uri_user_part() {
        assert_eq!(display_user("\"Bob\" <sip:bob@pbx.local>;tag=1"), "bob");
        assert_eq!(display_user("<sip:10.0.0.2>"), "10.0.0.2");
        assert_eq!(display_user("garbage"), "garbage");
    }
}
