use std::{net::SocketAddr, sync::Arc};

use codec::Message;
use tokio::net::UdpSocket;

/// Outbound half of the SIP UDP socket.
///
/// Sends are best-effort: retransmission is the transaction layer's
/// job (or the peer's), so a failed send is logged and dropped. Any
/// task may send; callers that need ordering serialize at the dialog.
#[derive(Clone)]
pub struct Transport {
    socket: Arc<UdpSocket>,
}

impl Transport {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn send(&self, message: &Message, addr: SocketAddr) {
        let text = message.to_string();
        match self.socket.send_to(text.as_bytes(), addr).await {
            Ok(size) => {
                log::trace!("sip send: size={}, addr={:?}", size, addr);
            }
            Err(e) => {
                log::error!("sip send failed: addr={:?}, err={}", addr, e);
            }
        }
    }
}
