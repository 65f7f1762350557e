use std::net::SocketAddr;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::error;

/// Outgoing side of the server's UDP socket. Send failures are logged and otherwise ignored:
///  lost datagrams are recovered by KCP retransmission or the client's handshake retry.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]);

    fn local_addr(&self) -> anyhow::Result<SocketAddr>;
}

#[async_trait]
impl SendSocket for UdpSocket {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        if let Err(e) = self.send_to(packet_buf, to).await {
            error!("error sending UDP packet to {:?}: {}", to, e);
        }
    }

    fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(UdpSocket::local_addr(self)?)
    }
}
