use std::{net::SocketAddr, sync::Arc, time::Instant};

use ahash::{HashMap, HashMapExt};
use codec::{Request, Response};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::{Error, Result, transaction::TransactionKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Dialog lifecycle.
///
/// Transitions are totally ordered per dialog. `Terminating` is the
/// idempotency guard of the cleanup path: once entered, a second
/// cleanup is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    Calling,
    Ringing,
    Answered,
    Established,
    Terminating,
    Terminated,
}

/// One call leg pair, keyed by Call-ID.
pub struct Dialog {
    pub call_id: String,
    pub direction: Direction,
    /// Browser-side logical username owning this call.
    pub peer: String,
    pub local_tag: String,
    pub remote_tag: Option<String>,
    /// Sequence number for the next request this side originates.
    pub cseq: u32,
    pub state: DialogState,
    /// Telephony destination URI (outgoing only).
    pub target: Option<String>,
    /// Branch of the initial INVITE (outgoing only); a CANCEL must
    /// reuse it.
    pub invite_branch: Option<String>,
    /// The initial inbound INVITE, retained for building responses
    /// (incoming only).
    pub origin_request: Option<Request>,
    /// Where the initial INVITE physically came from (incoming only).
    /// Authoritative for hop-by-hop requests such as BYE, since NAT
    /// rewriting may have masked the From URI.
    pub origin_addr: Option<SocketAddr>,
    /// Key of the originating server transaction (incoming only).
    pub transaction_key: Option<TransactionKey>,
    /// The 200 being retransmitted until the ACK arrives.
    pub pending_ok: Option<Response>,
    pub retransmits: u32,
    pub ack_received: bool,
    pub created_at: Instant,
    pub retransmit_timer: Option<JoinHandle<()>>,
    pub ack_timer: Option<JoinHandle<()>>,
}

impl Dialog {
    pub fn outgoing(call_id: String, peer: String, local_tag: String, target: String) -> Self {
        Self {
            call_id,
            direction: Direction::Outgoing,
            peer,
            local_tag,
            remote_tag: None,
            cseq: 1,
            state: DialogState::Calling,
            target: Some(target),
            invite_branch: None,
            origin_request: None,
            origin_addr: None,
            transaction_key: None,
            pending_ok: None,
            retransmits: 0,
            ack_received: false,
            created_at: Instant::now(),
            retransmit_timer: None,
            ack_timer: None,
        }
    }

    pub fn incoming(
        call_id: String,
        peer: String,
        local_tag: String,
        origin_request: Request,
        origin_addr: SocketAddr,
        transaction_key: TransactionKey,
    ) -> Self {
        let remote_tag = codec::uri::header_param(
            origin_request.headers.get("From").unwrap_or_default(),
            "tag",
        )
        .map(str::to_string);

        Self {
            call_id,
            direction: Direction::Incoming,
            peer,
            local_tag,
            remote_tag,
            cseq: 1,
            state: DialogState::Ringing,
            target: None,
            invite_branch: None,
            origin_request: Some(origin_request),
            origin_addr: Some(origin_addr),
            transaction_key: Some(transaction_key),
            pending_ok: None,
            retransmits: 0,
            ack_received: false,
            created_at: Instant::now(),
            retransmit_timer: None,
            ack_timer: None,
        }
    }

    /// Aborts whatever timers are armed. Every path that removes the
    /// dialog goes through here first.
    pub fn cancel_timers(&mut self) {
        if let Some(timer) = self.retransmit_timer.take() {
            timer.abort();
        }
        if let Some(timer) = self.ack_timer.take() {
            timer.abort();
        }
    }

    /// The tag identifying the offering side toward the media relay.
    pub fn relay_from_tag(&self) -> String {
        match self.direction {
            Direction::Outgoing => self.local_tag.clone(),
            Direction::Incoming => self.remote_tag.clone().unwrap_or_default(),
        }
    }
}

/// Concurrent dialog map with the session cap.
///
/// Dialogs are shared as `Arc<Mutex<_>>`; the per-dialog mutex is the
/// serialization point for all state transitions, whichever task
/// (UDP receive, relay completion, timer, hub handler) drives them.
pub struct DialogStore {
    map: RwLock<HashMap<String, Arc<Mutex<Dialog>>>>,
    limit: usize,
}

impl DialogStore {
    pub fn new(limit: usize) -> Self {
        Self {
            map: RwLock::new(HashMap::with_capacity(limit.min(1024))),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn at_capacity(&self) -> bool {
        self.map.read().len() >= self.limit
    }

    pub fn insert(&self, dialog: Dialog) -> Result<Arc<Mutex<Dialog>>> {
        let mut map = self.map.write();
        if map.len() >= self.limit {
            return Err(Error::Capacity);
        }
        if map.contains_key(&dialog.call_id) {
            return Err(Error::Protocol("dialog already exists"));
        }

        let call_id = dialog.call_id.clone();
        let entry = Arc::new(Mutex::new(dialog));
        map.insert(call_id, entry.clone());
        Ok(entry)
    }

    pub fn get(&self, call_id: &str) -> Option<Arc<Mutex<Dialog>>> {
        self.map.read().get(call_id).cloned()
    }

    pub fn remove(&self, call_id: &str) -> Option<Arc<Mutex<Dialog>>> {
        self.map.write().remove(call_id)
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.map.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dialog(call_id: &str) -> Dialog {
        Dialog::outgoing(
            call_id.to_string(),
            "alice".to_string(),
            "0123456789abcdef".to_string(),
            "sip:bob@10.0.0.2".to_string(),
        )
    }

    #[test]
    fn store_enforces_the_session_cap() {
        let store = DialogStore::new(2);

        store.insert(dialog("a@x")).unwrap();
        store.insert(dialog("b@x")).unwrap();
        assert!(matches!(store.insert(dialog("c@x")), Err(Error::Capacity)));
        assert_eq!(store.len(), 2);

        store.remove("a@x");
        assert!(store.insert(dialog("c@x")).is_ok());
    }

    #[test]
    fn duplicate_call_ids_are_rejected() {
        let store = DialogStore::new(8);

        store.insert(dialog("a@x")).unwrap();
        assert!(matches!(
            store.insert(dialog("a@x")),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn incoming_dialog_learns_the_remote_tag_from_the_invite() {
        let mut headers = codec::Headers::new();
        headers.push("Via", "SIP/2.0/UDP a:5060;branch=z9hG4bK1");
        headers.push("From", "<sip:bob@pbx>;tag=remote1");
        headers.push("To", "<sip:alice@gateway>");
        headers.push("Call-ID", "a@x");
        headers.push("CSeq", "1 INVITE");

        let request = Request {
            method: codec::Method::Invite,
            uri: "sip:alice@gateway".to_string(),
            headers,
            body: String::new(),
        };
        let key = TransactionKey::of_request(&request).unwrap();

        let dialog = Dialog::incoming(
            "a@x".to_string(),
            "alice".to_string(),
            "local1".to_string(),
            request,
            "10.0.0.2:5060".parse().unwrap(),
            key,
        );

        assert_eq!(dialog.remote_tag.as_deref(), Some("remote1"));
        assert_eq!(dialog.relay_from_tag(), "remote1");
        assert_eq!(dialog.state, DialogState::Ringing);
    }
}
