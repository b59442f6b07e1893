use std::time::{Duration, Instant};

use ahash::{HashMap, HashMapExt};
use codec::{Method, Request, Response};
use parking_lot::RwLock;
use tokio::task::JoinHandle;

use crate::Result;

/// RTT estimate for an unreliable transport (RFC 3261 default).
pub const T1: Duration = Duration::from_millis(500);
/// Ceiling for retransmission intervals.
pub const T2: Duration = Duration::from_secs(4);
/// Timer B (INVITE), Timer F (non-INVITE) and Timer H all sit at
/// 64·T1.
pub const TIMER_B: Duration = Duration::from_secs(32);

/// Retransmission schedule for a 2xx awaiting its ACK: T1 doubled up
/// to the T2 ceiling, capped at seven resends. Timer H reaps whatever
/// is left.
pub const OK_RETRANSMIT_SCHEDULE: [Duration; 7] = [
    Duration::from_millis(500),
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(4),
    Duration::from_secs(4),
    Duration::from_secs(4),
];

/// Transaction identity: top-Via branch, Call-ID and the full CSeq.
///
/// The CSeq method is part of the key so that a CANCEL, which reuses
/// its INVITE's branch and sequence number, matches its own 200 and
/// not the INVITE's.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub branch: String,
    pub call_id: String,
    pub cseq: u32,
    pub method: Method,
}

impl TransactionKey {
    pub fn of_request(request: &Request) -> Result<Self> {
        let (cseq, method) = request.headers.cseq()?;
        Ok(Self {
            branch: request.headers.branch()?,
            call_id: request.headers.call_id()?.to_string(),
            cseq,
            method,
        })
    }

    pub fn of_response(response: &Response) -> Result<Self> {
        let (cseq, method) = response.headers.cseq()?;
        Ok(Self {
            branch: response.headers.branch()?,
            call_id: response.headers.call_id()?.to_string(),
            cseq,
            method,
        })
    }
}

/// An outbound request awaiting responses.
///
/// The record deliberately holds no callback: response dispatch looks
/// the dialog up by call identifier, so destroying a dialog implicitly
/// invalidates its transactions.
pub struct ClientTransaction {
    pub method: Method,
    pub call_id: String,
    pub created_at: Instant,
    timer: JoinHandle<()>,
}

/// Server-side INVITE record that remembers the last response ≥ 180 so
/// retransmitted INVITEs are answered by replay instead of a second
/// dialog.
pub struct ServerTransaction {
    pub last_response: Option<Response>,
    pub created_at: Instant,
}

#[derive(Default)]
pub struct TransactionStore {
    clients: RwLock<HashMap<TransactionKey, ClientTransaction>>,
    servers: RwLock<HashMap<TransactionKey, ServerTransaction>>,
}

impl TransactionStore {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::with_capacity(64)),
            servers: RwLock::new(HashMap::with_capacity(64)),
        }
    }

    /// Registers a client transaction together with its armed Timer
    /// B/F task.
    pub fn register_client(&self, key: TransactionKey, timer: JoinHandle<()>) {
        let method = key.method.clone();
        let call_id = key.call_id.clone();
        self.clients.write().insert(
            key,
            ClientTransaction {
                method,
                call_id,
                created_at: Instant::now(),
                timer,
            },
        );
    }

    /// Matches a response against a client transaction.
    ///
    /// Provisional responses keep an INVITE transaction alive; a final
    /// response (or any response to a non-INVITE) consumes it and
    /// disarms its timer. Returns the owning call identifier and the
    /// request method, or `None` for a stray response.
    pub fn match_response(&self, key: &TransactionKey, status: u16) -> Option<(Method, String)> {
        let mut clients = self.clients.write();
        let txn = clients.get(key)?;
        let found = (txn.method.clone(), txn.call_id.clone());

        if status >= 200 || found.0 != Method::Invite {
            if let Some(txn) = clients.remove(key) {
                txn.timer.abort();
            }
        }

        Some(found)
    }

    /// Consumes a client transaction whose timer fired.
    pub fn take_expired(&self, key: &TransactionKey) -> Option<(Method, String)> {
        self.clients
            .write()
            .remove(key)
            .map(|txn| (txn.method, txn.call_id))
    }

    /// Creates the server transaction for an INVITE if this key has
    /// not been seen; returns false when it already existed.
    pub fn begin_server(&self, key: TransactionKey) -> bool {
        let mut servers = self.servers.write();
        if servers.contains_key(&key) {
            return false;
        }
        servers.insert(
            key,
            ServerTransaction {
                last_response: None,
                created_at: Instant::now(),
            },
        );
        true
    }

    /// The response to replay for a retransmitted INVITE, if one was
    /// already sent.
    pub fn replay_response(&self, key: &TransactionKey) -> Option<Response> {
        self.servers
            .read()
            .get(key)
            .and_then(|txn| txn.last_response.clone())
    }

    pub fn is_known_server(&self, key: &TransactionKey) -> bool {
        self.servers.read().contains_key(key)
    }

    /// Remembers the last final-ish response (≥ 180) sent for a server
    /// transaction.
    pub fn remember_response(&self, key: &TransactionKey, response: &Response) {
        if response.status < 180 {
            return;
        }
        if let Some(txn) = self.servers.write().get_mut(key) {
            txn.last_response = Some(response.clone());
        }
    }

    /// Drops a server transaction; called once the ACK promotes the
    /// dialog to the authoritative record.
    pub fn evict_server(&self, key: &TransactionKey) {
        self.servers.write().remove(key);
    }

    /// Invalidates every transaction belonging to a dialog.
    pub fn remove_for_call(&self, call_id: &str) {
        let mut clients = self.clients.write();
        clients.retain(|_, txn| {
            if txn.call_id == call_id {
                txn.timer.abort();
                false
            } else {
                true
            }
        });
        drop(clients);

        self.servers.write().retain(|key, _| key.call_id != call_id);
    }

    pub fn shutdown(&self) {
        let mut clients = self.clients.write();
        for (_, txn) in clients.drain() {
            txn.timer.abort();
        }
        self.servers.write().clear();
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    pub fn server_count(&self) -> usize {
        self.servers.read().len()
    }
}
