use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering},
        Arc, Mutex as StdMutex, Weak,
    },
};

use enclose::enc;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;
use webrtc::{
    rtcp::{
        payload_feedbacks::picture_loss_indication::PictureLossIndication,
        transport_feedbacks::transport_layer_nack::TransportLayerNack,
    },
    rtp,
    rtp_transceiver::rtp_codec::RTCRtpCodecParameters,
    track::track_local::{track_local_static_rtp::TrackLocalStaticRTP, TrackLocalWriter},
};

use crate::{
    error::{DownTrackErrorKind, Error},
    receiver::Receiver,
    transport::RtcpPackets,
};

const DOWN_TRACK_QUEUE_SIZE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownTrackType {
    Simple,
    Simulcast,
}

/// Per subscriber sink of a [`Receiver`]'s packets.
///
/// Methods are synchronous: the receiver calls them from its fan-out loop while holding the
/// forwarder set lock, so they must not block.
pub trait Forwarder: Send + Sync + fmt::Debug {
    /// Id of the forwarded track.
    fn id(&self) -> &str;
    /// Id of the subscriber owning this forwarder.
    fn peer_id(&self) -> &str;
    /// Returns an end-of-stream error once the subscriber is gone.
    fn write_rtp(&self, packet: &rtp::packet::Packet) -> Result<(), Error>;
    fn close(&self);
    fn is_closed(&self) -> bool;
    fn current_spatial_layer(&self) -> usize;
    fn set_current_spatial_layer(&self, layer: usize);
    fn target_spatial_layer(&self) -> usize;
    fn set_target_spatial_layer(&self, layer: usize);
    fn track_type(&self) -> DownTrackType;
    fn set_track_type(&self, track_type: DownTrackType);
}

/// Everything needed to build a forwarder for one subscriber and one receiver.
#[derive(Debug, Clone)]
pub struct DownTrackParams {
    pub track_id: String,
    pub stream_id: String,
    pub peer_id: String,
    pub codec: RTCRtpCodecParameters,
    pub receiver: Weak<Receiver>,
}

/// Keeps the outgoing sequence numbers and timestamps continuous across layer switches.
#[derive(Debug, Default)]
pub(crate) struct PacketRewriter {
    started: bool,
    source_ssrc: u32,
    sn_offset: u16,
    ts_offset: u32,
    last_sn: u16,
    last_ts: u32,
}

impl PacketRewriter {
    pub(crate) fn rewrite(&mut self, packet: &mut rtp::packet::Packet) {
        let sn = packet.header.sequence_number;
        let ts = packet.header.timestamp;
        if !self.started {
            self.started = true;
            self.source_ssrc = packet.header.ssrc;
            self.sn_offset = 0;
            self.ts_offset = 0;
            self.last_sn = sn.wrapping_sub(1);
            self.last_ts = ts;
        } else if packet.header.ssrc != self.source_ssrc {
            // Another layer: continue right after the last forwarded packet.
            self.source_ssrc = packet.header.ssrc;
            self.sn_offset = sn.wrapping_sub(self.last_sn.wrapping_add(1));
            self.ts_offset = ts.wrapping_sub(self.last_ts.wrapping_add(1));
        }

        let out_sn = sn.wrapping_sub(self.sn_offset);
        let out_ts = ts.wrapping_sub(self.ts_offset);
        let diff = out_sn.wrapping_sub(self.last_sn);
        if diff != 0 && diff < 0x8000 {
            self.last_sn = out_sn;
            self.last_ts = out_ts;
        }
        packet.header.sequence_number = out_sn;
        packet.header.timestamp = out_ts;
    }

    pub(crate) fn sn_offset(&self) -> u16 {
        self.sn_offset
    }
}

/// [`Forwarder`] writing into a `TrackLocalStaticRTP` of the subscriber's connection.
#[derive(derivative::Derivative)]
#[derivative(Debug)]
pub struct DownTrack {
    id: String,
    peer_id: String,
    stream_id: String,
    ssrc: u32,
    track_local: Arc<TrackLocalStaticRTP>,
    receiver: Weak<Receiver>,
    packet_sender: mpsc::Sender<rtp::packet::Packet>,
    sn_offset: Arc<AtomicU16>,
    current_spatial_layer: AtomicUsize,
    target_spatial_layer: AtomicUsize,
    simulcast: AtomicBool,
    closed: AtomicBool,
    closed_sender: broadcast::Sender<bool>,
    #[derivative(Debug = "ignore")]
    on_close: StdMutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl DownTrack {
    pub fn new(params: DownTrackParams) -> Arc<Self> {
        let ssrc = Uuid::new_v4().as_u128() as u32;
        let track_local = Arc::new(TrackLocalStaticRTP::new(
            params.codec.capability.clone(),
            params.track_id.clone(),
            params.stream_id.clone(),
        ));
        let (packet_sender, packet_receiver) = mpsc::channel(DOWN_TRACK_QUEUE_SIZE);
        let (closed_sender, _) = broadcast::channel(1);
        let sn_offset = Arc::new(AtomicU16::new(0));

        {
            let id = params.track_id.clone();
            let peer_id = params.peer_id.clone();
            let closed_receiver = closed_sender.subscribe();
            tokio::spawn(enc!((track_local, sn_offset) async move {
                Self::rtp_event_loop(id, peer_id, ssrc, track_local, packet_receiver, closed_receiver, sn_offset).await;
            }));
        }

        tracing::debug!(
            "DownTrack id={} peer_id={} ssrc={} is created",
            params.track_id,
            params.peer_id,
            ssrc
        );

        Arc::new(Self {
            id: params.track_id,
            peer_id: params.peer_id,
            stream_id: params.stream_id,
            ssrc,
            track_local,
            receiver: params.receiver,
            packet_sender,
            sn_offset,
            current_spatial_layer: AtomicUsize::new(0),
            target_spatial_layer: AtomicUsize::new(0),
            simulcast: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            closed_sender,
            on_close: StdMutex::new(None),
        })
    }

    async fn rtp_event_loop(
        id: String,
        peer_id: String,
        ssrc: u32,
        track_local: Arc<TrackLocalStaticRTP>,
        mut packet_receiver: mpsc::Receiver<rtp::packet::Packet>,
        mut closed_receiver: broadcast::Receiver<bool>,
        sn_offset: Arc<AtomicU16>,
    ) {
        tracing::debug!("DownTrack id={} peer_id={} RTP event loop has started", id, peer_id);
        let mut rewriter = PacketRewriter::default();
        loop {
            tokio::select! {
                _ = closed_receiver.recv() => {
                    break;
                }
                res = packet_receiver.recv() => {
                    match res {
                        Some(mut packet) => {
                            rewriter.rewrite(&mut packet);
                            sn_offset.store(rewriter.sn_offset(), Ordering::Relaxed);
                            packet.header.ssrc = ssrc;
                            tracing::trace!(
                                "DownTrack id={} peer_id={} write RTP seq={} timestamp={}",
                                id,
                                peer_id,
                                packet.header.sequence_number,
                                packet.header.timestamp
                            );
                            match track_local.write_rtp(&packet).await {
                                Ok(_) => {}
                                Err(webrtc::Error::ErrClosedPipe) => break,
                                Err(err) => {
                                    tracing::error!("DownTrack id={} peer_id={} failed to write rtp: {}", id, peer_id, err);
                                }
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        tracing::debug!("DownTrack id={} peer_id={} RTP event loop has finished", id, peer_id);
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn track_local(&self) -> Arc<TrackLocalStaticRTP> {
        self.track_local.clone()
    }

    pub fn on_close(&self, f: Box<dyn FnOnce() + Send>) {
        if let Ok(mut on_close) = self.on_close.lock() {
            *on_close = Some(f);
        }
    }

    /// Handles RTCP sent by the subscriber for this track: PLI goes upstream through the
    /// receiver, NACK is answered from the receiver's buffer.
    pub async fn handle_rtcp(self: &Arc<Self>, packets: RtcpPackets) {
        let Some(receiver) = self.receiver.upgrade() else {
            return;
        };
        let layer = self.current_spatial_layer();
        for packet in packets.iter() {
            if packet
                .as_any()
                .downcast_ref::<PictureLossIndication>()
                .is_some()
            {
                let media_ssrc = receiver.ssrc(layer).await;
                let pli: RtcpPackets = vec![Box::new(PictureLossIndication {
                    sender_ssrc: 0,
                    media_ssrc,
                })];
                receiver.send_rtcp(pli).await;
            } else if let Some(nack) = packet.as_any().downcast_ref::<TransportLayerNack>() {
                let sequence_numbers: Vec<u16> = nack
                    .nacks
                    .iter()
                    .flat_map(|pair| pair.packet_list())
                    .collect();
                let forwarder: Arc<dyn Forwarder> = self.clone();
                receiver.retransmit_packets(
                    forwarder,
                    sequence_numbers,
                    self.sn_offset.load(Ordering::Relaxed),
                );
            }
        }
    }

    fn end_of_stream(&self) -> Error {
        Error::new_down_track(
            format!("down track id={} peer_id={} is closed", self.id, self.peer_id),
            DownTrackErrorKind::EndOfStreamError,
        )
    }
}

impl Forwarder for DownTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn write_rtp(&self, packet: &rtp::packet::Packet) -> Result<(), Error> {
        if self.is_closed() {
            return Err(self.end_of_stream());
        }
        match self.packet_sender.try_send(packet.clone()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    "DownTrack id={} peer_id={} queue is full, drop seq={}",
                    self.id,
                    self.peer_id,
                    packet.header.sequence_number
                );
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(self.end_of_stream()),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.closed_sender.send(true);
        let on_close = match self.on_close.lock() {
            Ok(mut on_close) => on_close.take(),
            Err(_) => None,
        };
        if let Some(f) = on_close {
            f();
        }
        tracing::debug!("DownTrack id={} peer_id={} is closed", self.id, self.peer_id);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn current_spatial_layer(&self) -> usize {
        self.current_spatial_layer.load(Ordering::Relaxed)
    }

    fn set_current_spatial_layer(&self, layer: usize) {
        self.current_spatial_layer.store(layer, Ordering::Relaxed);
    }

    fn target_spatial_layer(&self) -> usize {
        self.target_spatial_layer.load(Ordering::Relaxed)
    }

    fn set_target_spatial_layer(&self, layer: usize) {
        self.target_spatial_layer.store(layer, Ordering::Relaxed);
    }

    fn track_type(&self) -> DownTrackType {
        if self.simulcast.load(Ordering::Relaxed) {
            DownTrackType::Simulcast
        } else {
            DownTrackType::Simple
        }
    }

    fn set_track_type(&self, track_type: DownTrackType) {
        self.simulcast
            .store(track_type == DownTrackType::Simulcast, Ordering::Relaxed);
    }
}

impl Drop for DownTrack {
    fn drop(&mut self) {
        tracing::debug!("DownTrack id={} peer_id={} is dropped", self.id, self.peer_id);
    }
}
