use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use tokio::sync::{mpsc, Mutex, RwLock};

use super::packet::TransportPacket;
use crate::{
    error::{Error, MuxErrorKind},
    mux::matcher,
};

/// Queue depth of a [`PacketStream`].
pub const MAX_TRANSPORT_PACKETS: usize = 1024;

/// Classes of datagrams sharing a media port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketClass {
    Rtcp,
    Rtp,
    Other,
}

impl PacketClass {
    /// RTCP is tested before RTP. RTP payload types 72..=95 with the marker bit set would
    /// look like RTCP, so the order matters.
    pub fn of(data: &[u8]) -> PacketClass {
        if !matcher::is_rtp_or_rtcp(data) {
            PacketClass::Other
        } else if matcher::is_rtcp(data) {
            PacketClass::Rtcp
        } else {
            PacketClass::Rtp
        }
    }
}

pub type PacketMatchFn = Arc<dyn Fn(&TransportPacket) -> bool + Send + Sync>;

pub fn match_rtcp() -> PacketMatchFn {
    Arc::new(|packet: &TransportPacket| PacketClass::of(&packet.data) == PacketClass::Rtcp)
}

pub fn match_rtp() -> PacketMatchFn {
    Arc::new(|packet: &TransportPacket| PacketClass::of(&packet.data) == PacketClass::Rtp)
}

struct StreamEntry {
    id: u64,
    matcher: PacketMatchFn,
    sender: mpsc::Sender<TransportPacket>,
}

/// Packet oriented mux: parsed datagrams are handed off, not copied, to bounded queues.
#[derive(derivative::Derivative)]
#[derivative(Debug)]
pub struct PacketMux {
    #[derivative(Debug = "ignore")]
    streams: Arc<RwLock<Vec<StreamEntry>>>,
    next_id: AtomicU64,
}

impl Default for PacketMux {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketMux {
    pub fn new() -> Self {
        Self {
            streams: Arc::new(RwLock::new(Vec::new())),
            next_id: AtomicU64::new(0),
        }
    }

    pub async fn new_stream(&self, matcher: PacketMatchFn) -> PacketStream {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(MAX_TRANSPORT_PACKETS);
        {
            let mut streams = self.streams.write().await;
            streams.push(StreamEntry {
                id,
                matcher,
                sender,
            });
        }
        PacketStream {
            id,
            receiver: Mutex::new(receiver),
        }
    }

    /// Dropping the queue's sender ends the stream once its backlog is read.
    pub async fn remove_stream(&self, id: u64) {
        let mut streams = self.streams.write().await;
        streams.retain(|entry| entry.id != id);
    }

    pub async fn stream_count(&self) -> usize {
        self.streams.read().await.len()
    }

    /// Delivers the packet to the first matching stream. A full queue is an error for this
    /// packet only; a miss is logged and dropped.
    pub async fn dispatch(&self, packet: TransportPacket) -> Result<(), Error> {
        let streams = self.streams.read().await;
        let entry = streams.iter().find(|entry| (entry.matcher)(&packet));

        match entry {
            Some(entry) => entry.sender.try_send(packet).map_err(|err| match err {
                mpsc::error::TrySendError::Full(packet) => Error::new_mux(
                    format!("packet stream id={} is full, drop {}", entry.id, packet),
                    MuxErrorKind::QueueFullError,
                ),
                mpsc::error::TrySendError::Closed(_) => Error::new_mux(
                    format!("packet stream id={} is closed", entry.id),
                    MuxErrorKind::StreamClosedError,
                ),
            }),
            None => {
                match packet.data.first() {
                    Some(first) => {
                        tracing::warn!("packetMux: no endpoint for packet starting with {}", first)
                    }
                    None => tracing::warn!("packetMux: no endpoint for zero length packet"),
                }
                Ok(())
            }
        }
    }

    pub async fn close(&self) {
        let mut streams = self.streams.write().await;
        streams.clear();
    }
}

/// Read side of a [`PacketMux`] registration.
#[derive(Debug)]
pub struct PacketStream {
    id: u64,
    receiver: Mutex<mpsc::Receiver<TransportPacket>>,
}

impl PacketStream {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// `None` once the stream has been removed from its mux and drained.
    pub async fn read_packet(&self) -> Option<TransportPacket> {
        self.receiver.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use bytes::Bytes;

    use super::*;

    fn packet(data: &'static [u8]) -> TransportPacket {
        let addr = SocketAddr::from(([127, 0, 0, 1], 5000));
        TransportPacket::new(Bytes::from_static(data), addr, addr)
    }

    #[test]
    fn classify() {
        assert_eq!(PacketClass::of(&[0x80, 200]), PacketClass::Rtcp);
        assert_eq!(PacketClass::of(&[0x80, 223]), PacketClass::Rtcp);
        assert_eq!(PacketClass::of(&[0x80, 96]), PacketClass::Rtp);
        assert_eq!(PacketClass::of(&[0x80, 224]), PacketClass::Rtp);
        assert_eq!(PacketClass::of(&[0x16, 0xfe]), PacketClass::Other);
        assert_eq!(PacketClass::of(&[]), PacketClass::Other);
    }

    #[tokio::test]
    async fn each_packet_reaches_one_stream() {
        let mux = PacketMux::new();
        let rtcp = mux.new_stream(match_rtcp()).await;
        let rtp = mux.new_stream(match_rtp()).await;

        mux.dispatch(packet(&[0x80, 96, 0, 1])).await.unwrap();
        mux.dispatch(packet(&[0x80, 200, 0, 1])).await.unwrap();
        mux.dispatch(packet(&[0x16, 0xfe])).await.unwrap();

        assert_eq!(rtp.read_packet().await.unwrap().data[1], 96);
        assert_eq!(rtcp.read_packet().await.unwrap().data[1], 200);

        mux.close().await;
        assert!(rtp.read_packet().await.is_none());
        assert!(rtcp.read_packet().await.is_none());
    }

    #[tokio::test]
    async fn full_queue_is_an_error_and_isolated() {
        let mux = PacketMux::new();
        let _stalled = mux.new_stream(match_rtcp()).await;
        let active = mux.new_stream(match_rtp()).await;

        for _ in 0..MAX_TRANSPORT_PACKETS {
            mux.dispatch(packet(&[0x80, 200, 0, 1])).await.unwrap();
        }
        let err = mux.dispatch(packet(&[0x80, 200, 0, 1])).await.unwrap_err();
        assert!(err.is_queue_full());

        for _ in 0..10 {
            mux.dispatch(packet(&[0x80, 96, 0, 1])).await.unwrap();
            assert!(active.read_packet().await.is_some());
        }
    }

    #[tokio::test]
    async fn order_is_preserved() {
        static DATA: [[u8; 4]; 5] = [
            [0x80, 96, 0, 0],
            [0x80, 96, 0, 1],
            [0x80, 96, 0, 2],
            [0x80, 96, 0, 3],
            [0x80, 96, 0, 4],
        ];
        let mux = PacketMux::new();
        let rtp = mux.new_stream(match_rtp()).await;
        for data in DATA.iter() {
            mux.dispatch(packet(data)).await.unwrap();
        }
        for seq in 0..5u8 {
            assert_eq!(rtp.read_packet().await.unwrap().data[3], seq);
        }
    }

    #[tokio::test]
    async fn removed_stream_drains_then_ends() {
        let mux = PacketMux::new();
        let rtp = mux.new_stream(match_rtp()).await;
        mux.dispatch(packet(&[0x80, 96, 0, 1])).await.unwrap();
        mux.remove_stream(rtp.id()).await;
        mux.remove_stream(rtp.id()).await;
        assert_eq!(mux.stream_count().await, 0);

        assert!(rtp.read_packet().await.is_some());
        assert!(rtp.read_packet().await.is_none());
        mux.dispatch(packet(&[0x80, 96, 0, 2])).await.unwrap();
    }
}
