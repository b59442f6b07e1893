use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

/// Everything the engine tells the hub.
///
/// Each variant carries the call identifier so the hub can resolve the
/// owning browser peer through its active-call index; `Incoming`
/// additionally names the callee, which is how a dialog first becomes
/// owned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A provisional 180 arrived for an outgoing call.
    Ringing { call_id: String },
    /// An outgoing call was answered; `sdp` is the browser-facing
    /// translated answer.
    Answered { call_id: String, sdp: String },
    /// The call failed before or after establishment. The reason is
    /// one of the canonical strings (`request-timeout`, `ack-timeout`,
    /// `relay-error`) or `<status> <reason-phrase>` from the peer.
    Failed { call_id: String, reason: String },
    /// The telephony peer ended an established call.
    Ended { call_id: String, reason: String },
    /// A new telephony-originated call awaits an answer from the
    /// browser peer named `to`.
    Incoming {
        call_id: String,
        from: String,
        to: String,
        sdp: String,
    },
    /// An out-of-band DTMF digit arrived on an established call.
    Dtmf {
        call_id: String,
        digit: char,
        duration: u32,
    },
    /// A mid-dialog re-INVITE was accepted; the browser peer must
    /// apply `sdp` as its new remote description.
    Renegotiation { call_id: String, sdp: String },
}

pub type EventSender = UnboundedSender<Event>;
pub type EventReceiver = UnboundedReceiver<Event>;
