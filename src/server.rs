use std::{io::ErrorKind, sync::Arc};

use service::Engine;
use tokio::net::UdpSocket;

/// SIP socket receive loop.
///
/// Reads datagrams off the UDP socket and hands them to the signaling
/// engine; replies and retransmissions go out through the engine's own
/// transport handle on the same socket.
pub async fn run(socket: Arc<UdpSocket>, engine: Engine) -> anyhow::Result<()> {
    let local_addr = socket.local_addr()?;
    log::info!("sip listening={:?}", local_addr);

    let mut buf = vec![0u8; 65536];
    loop {
        let (size, addr) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            // A peer shutting down surfaces as ConnectionReset on some
            // platforms; the socket itself is fine.
            Err(e) if e.kind() == ErrorKind::ConnectionReset => continue,
            Err(e) => return Err(e.into()),
        };

        log::trace!(
            "sip receive: size={}, addr={:?}, interface={:?}",
            size,
            addr,
            local_addr
        );
        engine.process(&buf[..size], addr).await;
    }
}
