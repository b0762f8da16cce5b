//! UDP sockets, the packet mux on top of them, and the pool sharing them.

pub mod packet;
pub mod packet_mux;
pub mod pool;
pub mod udp_connection;

use std::{net::SocketAddr, sync::Arc};

use tokio::sync::mpsc;
use webrtc::rtcp;

use crate::error::{Error, TransportErrorKind};
use pool::ConnectionPool;

pub type RtcpPacket = Box<dyn rtcp::packet::Packet + Send + Sync>;
/// One batch of RTCP packets written as a compound packet.
pub type RtcpPackets = Vec<RtcpPacket>;
pub type RtcpSender = mpsc::UnboundedSender<RtcpPackets>;
pub type RtcpReceiver = mpsc::UnboundedReceiver<RtcpPackets>;

/// Sends a peer's RTCP through whichever pooled socket reaches its address.
#[derive(Debug, Clone)]
pub struct PeerTransport {
    pool: Arc<ConnectionPool>,
    remote_addr: SocketAddr,
}

impl PeerTransport {
    pub fn new(pool: Arc<ConnectionPool>, remote_addr: SocketAddr) -> Self {
        Self { pool, remote_addr }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Marshals `packets` as one compound packet and sends it to the peer.
    pub async fn write_rtcp(&self, packets: &[RtcpPacket]) -> Result<usize, Error> {
        let data = rtcp::packet::marshal(packets).map_err(|err| {
            Error::new_transport(err.to_string(), TransportErrorKind::RtcpMarshalError)
        })?;
        let conn = self.pool.resolve_outbound(self.remote_addr).await?;
        conn.send_to(&data, self.remote_addr).await
    }
}
