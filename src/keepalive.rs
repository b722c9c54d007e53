//! Keeps the NAT binding of an established channel open.

use crate::stop::StopSignal;
use crate::wire::WireMessage;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::{net::UdpSocket, task::JoinHandle};

/// Send a keepalive to `remote` now and then every `period` until stopped.
///
/// Send errors are logged and the loop carries on, the binding may come back.
pub fn spawn(
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    period: Duration,
    stop: StopSignal,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let keepalive = WireMessage::Keepalive.encode();

        loop {
            if stop.is_stopped() {
                break;
            }

            match socket.send_to(&keepalive, remote).await {
                Ok(_) => log::trace!("keepalive -> {}", remote),
                Err(e) => log::warn!("keepalive to {} failed: {}", remote, e),
            }

            if !stop.sleep(period).await {
                break;
            }
        }

        log::debug!("keepalive to {} stopped", remote);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_periodic_keepalive() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let stop = StopSignal::new();

        let h = spawn(
            socket.clone(),
            peer.local_addr().unwrap(),
            Duration::from_millis(20),
            stop.clone(),
        );

        let mut buf = [0u8; 16];
        for _ in 0..3 {
            let (n, from) = timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(WireMessage::decode(&buf[..n]).unwrap(), WireMessage::Keepalive);
            assert_eq!(from, socket.local_addr().unwrap());
        }

        stop.stop();
        timeout(Duration::from_secs(1), h).await.unwrap().unwrap();
    }
}
