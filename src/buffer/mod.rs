//! Per SSRC packet storage sitting between the sockets and the receivers.

mod factory;
mod rtcp_reader;

pub use factory::BufferFactory;
pub use rtcp_reader::{OnPacketFn, RtcpReader};

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use tokio::{
    sync::{mpsc, Mutex},
    time::Instant,
};
use webrtc::{
    rtcp::transport_feedbacks::transport_layer_nack::{
        nack_pairs_from_sequence_numbers, TransportLayerNack,
    },
    rtp::{self, extension::transport_cc_extension::TransportCcExtension},
    rtp_transceiver::rtp_codec::RTCRtpParameters,
};
use webrtc_util::Unmarshal;

use crate::{
    config::RECEIVE_MTU,
    error::{BufferErrorKind, Error},
    transport::RtcpPackets,
};

pub const TRANSPORT_CC_URI: &str =
    "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01";

/// Packets kept while the buffer has not been bound yet.
const MAX_PENDING_PACKETS: usize = 128;
const MIN_HISTORY_PACKETS: usize = 128;
const MAX_HISTORY_PACKETS: usize = 4096;
/// Gaps wider than this are treated as a stream reset, not loss.
const MAX_NACK_GAP: u16 = 100;
const PACKET_CHANNEL_SIZE: usize = 1024;

pub type OnFeedbackFn = Box<dyn Fn(RtcpPackets) + Send + Sync>;
/// Called with the transport wide sequence number, arrival time in ns and marker bit.
pub type OnTransportWideCcFn = Box<dyn Fn(u16, i64, bool) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct BufferOptions {
    /// Milliseconds of media kept for retransmission.
    pub buffer_time: u32,
    /// Bits per second.
    pub max_bitrate: u64,
}

impl BufferOptions {
    fn history_size(&self) -> usize {
        let bytes = self.max_bitrate / 8 * self.buffer_time as u64 / 1000;
        let packets = (bytes / RECEIVE_MTU as u64) as usize;
        packets.clamp(MIN_HISTORY_PACKETS, MAX_HISTORY_PACKETS)
    }
}

#[derive(Debug, Default)]
struct BufferState {
    bound: bool,
    pending: Vec<(Bytes, i64)>,
    history: HashMap<u16, Bytes>,
    order: VecDeque<u16>,
    history_size: usize,
    highest_sequence: Option<u16>,
    nack: bool,
    twcc_ext_id: Option<u8>,
    clock_rate: u32,
    mime_type: String,
}

/// Stores the RTP packets of one SSRC, hands them to the receiver and raises NACK and
/// transport wide cc feedback.
#[derive(derivative::Derivative)]
#[derivative(Debug)]
pub struct Buffer {
    ssrc: u32,
    state: Mutex<BufferState>,
    packet_sender: Mutex<Option<mpsc::Sender<rtp::packet::Packet>>>,
    packet_receiver: Mutex<Option<mpsc::Receiver<rtp::packet::Packet>>>,
    closed: AtomicBool,
    #[derivative(Debug = "ignore")]
    on_feedback: Mutex<Option<OnFeedbackFn>>,
    #[derivative(Debug = "ignore")]
    on_transport_wide_cc: Mutex<Option<OnTransportWideCcFn>>,
    last_sr_rtp_time: AtomicU32,
    last_sr_ntp_time: AtomicU64,
    last_sr_recv: AtomicI64,
    last_write: Mutex<Instant>,
}

impl Buffer {
    pub fn new(ssrc: u32) -> Self {
        let (sender, receiver) = mpsc::channel(PACKET_CHANNEL_SIZE);
        tracing::debug!("Buffer ssrc={} is created", ssrc);
        Self {
            ssrc,
            state: Mutex::new(BufferState::default()),
            packet_sender: Mutex::new(Some(sender)),
            packet_receiver: Mutex::new(Some(receiver)),
            closed: AtomicBool::new(false),
            on_feedback: Mutex::new(None),
            on_transport_wide_cc: Mutex::new(None),
            last_sr_rtp_time: AtomicU32::new(0),
            last_sr_ntp_time: AtomicU64::new(0),
            last_sr_recv: AtomicI64::new(0),
            last_write: Mutex::new(Instant::now()),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn is_bound(&self) -> bool {
        self.state.lock().await.bound
    }

    /// Never bound and nothing written for `ttl`.
    pub async fn is_idle_unbound(&self, ttl: Duration) -> bool {
        !self.is_bound().await && self.last_write.lock().await.elapsed() >= ttl
    }

    /// Marks the buffer as active without writing to it.
    pub async fn touch(&self) {
        *self.last_write.lock().await = Instant::now();
    }

    /// Applies the negotiated parameters and flushes packets received before binding.
    pub async fn bind(&self, params: &RTCRtpParameters, options: BufferOptions) {
        let pending = {
            let mut state = self.state.lock().await;
            if state.bound {
                return;
            }
            if let Some(codec) = params.codecs.first() {
                state.clock_rate = codec.capability.clock_rate;
                state.mime_type = codec.capability.mime_type.clone();
                state.nack = codec
                    .capability
                    .rtcp_feedback
                    .iter()
                    .any(|fb| fb.typ == "nack" && fb.parameter.is_empty());
            }
            state.twcc_ext_id = params
                .header_extensions
                .iter()
                .find(|ext| ext.uri == TRANSPORT_CC_URI)
                .map(|ext| ext.id as u8);
            state.history_size = options.history_size();
            state.bound = true;
            std::mem::take(&mut state.pending)
        };

        tracing::debug!(
            "Buffer ssrc={} is bound, flushing {} pending packets",
            self.ssrc,
            pending.len()
        );
        for (data, arrival) in pending {
            if let Err(err) = self.calc(data, arrival).await {
                tracing::warn!("Buffer ssrc={} dropped pending packet: {}", self.ssrc, err);
            }
        }
    }

    /// Stores one RTP datagram. Returns the number of bytes accepted, which is always the
    /// full length on success.
    pub async fn write(&self, data: &[u8]) -> Result<usize, Error> {
        if self.is_closed() {
            return Err(Error::new_buffer(
                format!("buffer ssrc={} is closed", self.ssrc),
                BufferErrorKind::BufferClosedError,
            ));
        }
        self.touch().await;
        let arrival = now_nanos();
        let data = Bytes::copy_from_slice(data);
        {
            let mut state = self.state.lock().await;
            if !state.bound {
                if state.pending.len() >= MAX_PENDING_PACKETS {
                    state.pending.remove(0);
                }
                state.pending.push((data.clone(), arrival));
                return Ok(data.len());
            }
        }
        self.calc(data, arrival).await
    }

    async fn calc(&self, data: Bytes, arrival: i64) -> Result<usize, Error> {
        let len = data.len();
        let mut buf = data.clone();
        let packet = rtp::packet::Packet::unmarshal(&mut buf).map_err(|err| {
            Error::new_buffer(
                format!("buffer ssrc={}: {}", self.ssrc, err),
                BufferErrorKind::RtpParseError,
            )
        })?;
        let sequence_number = packet.header.sequence_number;

        let (missing, twcc) = {
            let mut state = self.state.lock().await;

            if !state.history.contains_key(&sequence_number) {
                if state.order.len() >= state.history_size {
                    if let Some(oldest) = state.order.pop_front() {
                        state.history.remove(&oldest);
                    }
                }
                state.order.push_back(sequence_number);
                state.history.insert(sequence_number, data);
            }

            let mut missing = Vec::new();
            match state.highest_sequence {
                None => state.highest_sequence = Some(sequence_number),
                Some(highest) => {
                    let diff = sequence_number.wrapping_sub(highest);
                    if diff > 0 && diff < 0x8000 {
                        if state.nack && diff > 1 && diff <= MAX_NACK_GAP {
                            let mut sn = highest.wrapping_add(1);
                            while sn != sequence_number {
                                if !state.history.contains_key(&sn) {
                                    missing.push(sn);
                                }
                                sn = sn.wrapping_add(1);
                            }
                        }
                        state.highest_sequence = Some(sequence_number);
                    }
                }
            }

            let twcc = state.twcc_ext_id.and_then(|id| {
                let mut ext = packet.header.get_extension(id)?;
                TransportCcExtension::unmarshal(&mut ext)
                    .ok()
                    .map(|tcc| tcc.transport_sequence)
            });
            (missing, twcc)
        };

        if !missing.is_empty() {
            tracing::trace!("Buffer ssrc={} missing packets {:?}", self.ssrc, missing);
            let nack = TransportLayerNack {
                sender_ssrc: 0,
                media_ssrc: self.ssrc,
                nacks: nack_pairs_from_sequence_numbers(&missing),
            };
            if let Some(on_feedback) = self.on_feedback.lock().await.as_ref() {
                on_feedback(vec![Box::new(nack)]);
            }
        }

        if let Some(transport_sequence) = twcc {
            if let Some(on_twcc) = self.on_transport_wide_cc.lock().await.as_ref() {
                on_twcc(transport_sequence, arrival, packet.header.marker);
            }
        }

        let sender = self.packet_sender.lock().await;
        if let Some(sender) = sender.as_ref() {
            if let Err(err) = sender.try_send(packet) {
                tracing::warn!(
                    "Buffer ssrc={} dropped packet seq={}: {}",
                    self.ssrc,
                    sequence_number,
                    err
                );
            }
        }

        Ok(len)
    }

    /// Returns the stored datagram for `sequence_number`. A closed buffer reports
    /// [`BufferErrorKind::BufferClosedError`], which callers treat as the end of the buffer.
    pub async fn get_packet(&self, sequence_number: u16) -> Result<Bytes, Error> {
        if self.is_closed() {
            return Err(Error::new_buffer(
                format!("buffer ssrc={} is closed", self.ssrc),
                BufferErrorKind::BufferClosedError,
            ));
        }
        let state = self.state.lock().await;
        match state.history.get(&sequence_number) {
            Some(data) => Ok(data.clone()),
            None => Err(Error::new_buffer(
                format!("ssrc={} seq={} is not buffered", self.ssrc, sequence_number),
                BufferErrorKind::PacketNotFoundError,
            )),
        }
    }

    /// Parsed packets in arrival order. Can be taken only once.
    pub async fn packet_stream(&self) -> Option<mpsc::Receiver<rtp::packet::Packet>> {
        self.packet_receiver.lock().await.take()
    }

    pub async fn on_feedback(&self, f: OnFeedbackFn) {
        let mut on_feedback = self.on_feedback.lock().await;
        *on_feedback = Some(f);
    }

    pub async fn on_transport_wide_cc(&self, f: OnTransportWideCcFn) {
        let mut on_twcc = self.on_transport_wide_cc.lock().await;
        *on_twcc = Some(f);
    }

    pub fn set_sender_report_data(&self, rtp_time: u32, ntp_time: u64) {
        self.last_sr_rtp_time.store(rtp_time, Ordering::Relaxed);
        self.last_sr_ntp_time.store(ntp_time, Ordering::Relaxed);
        self.last_sr_recv.store(now_nanos(), Ordering::Relaxed);
    }

    /// RTP time, NTP time and local receive time (ns) of the last sender report.
    pub fn sender_report_data(&self) -> (u32, u64, i64) {
        (
            self.last_sr_rtp_time.load(Ordering::Relaxed),
            self.last_sr_ntp_time.load(Ordering::Relaxed),
            self.last_sr_recv.load(Ordering::Relaxed),
        )
    }

    pub async fn clock_rate(&self) -> u32 {
        self.state.lock().await.clock_rate
    }

    /// Ends the packet stream. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.packet_sender.lock().await.take();
        tracing::debug!("Buffer ssrc={} is closed", self.ssrc);
    }
}

pub(crate) fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex as StdMutex;

    use webrtc::{
        api::media_engine::MIME_TYPE_VP8,
        rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack,
        rtp_transceiver::{
            rtp_codec::{
                RTCRtpCodecCapability, RTCRtpCodecParameters, RTCRtpHeaderExtensionParameters,
            },
            RTCPFeedback,
        },
    };
    use webrtc_util::Marshal;

    use super::*;

    pub(crate) fn vp8_params(twcc_ext_id: Option<isize>) -> RTCRtpParameters {
        RTCRtpParameters {
            header_extensions: twcc_ext_id
                .map(|id| {
                    vec![RTCRtpHeaderExtensionParameters {
                        uri: TRANSPORT_CC_URI.to_string(),
                        id,
                    }]
                })
                .unwrap_or_default(),
            codecs: vec![RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_string(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: "".to_string(),
                    rtcp_feedback: vec![
                        RTCPFeedback {
                            typ: "nack".to_string(),
                            parameter: "".to_string(),
                        },
                        RTCPFeedback {
                            typ: "nack".to_string(),
                            parameter: "pli".to_string(),
                        },
                    ],
                },
                payload_type: 96,
                ..Default::default()
            }],
        }
    }

    pub(crate) fn options() -> BufferOptions {
        BufferOptions {
            buffer_time: 1000,
            max_bitrate: 1_500_000,
        }
    }

    pub(crate) fn rtp_packet(ssrc: u32, sequence_number: u16) -> rtp::packet::Packet {
        rtp::packet::Packet {
            header: rtp::header::Header {
                version: 2,
                payload_type: 96,
                sequence_number,
                timestamp: sequence_number as u32 * 3000,
                ssrc,
                ..Default::default()
            },
            payload: Bytes::from_static(&[0x10, 0x20, 0x30]),
        }
    }

    pub(crate) fn rtp_bytes(ssrc: u32, sequence_number: u16) -> Bytes {
        rtp_packet(ssrc, sequence_number).marshal().unwrap()
    }

    #[tokio::test]
    async fn pending_packets_flush_on_bind() {
        let buffer = Buffer::new(1000);
        let mut stream = buffer.packet_stream().await.unwrap();
        assert!(buffer.packet_stream().await.is_none());

        let data = rtp_bytes(1000, 1);
        assert_eq!(buffer.write(&data).await.unwrap(), data.len());
        assert!(stream.try_recv().is_err());

        buffer.bind(&vp8_params(None), options()).await;
        assert!(buffer.is_bound().await);
        assert_eq!(buffer.clock_rate().await, 90000);
        assert_eq!(stream.recv().await.unwrap().header.sequence_number, 1);

        buffer.write(&rtp_bytes(1000, 2)).await.unwrap();
        assert_eq!(stream.recv().await.unwrap().header.sequence_number, 2);
        assert_eq!(buffer.get_packet(2).await.unwrap(), rtp_bytes(1000, 2));
    }

    #[tokio::test]
    async fn missing_packet_lookup() {
        let buffer = Buffer::new(1000);
        buffer.bind(&vp8_params(None), options()).await;
        buffer.write(&rtp_bytes(1000, 10)).await.unwrap();

        let err = buffer.get_packet(11).await.unwrap_err();
        assert!(!err.is_buffer_closed());

        buffer.close().await;
        buffer.close().await;
        assert!(buffer.get_packet(10).await.unwrap_err().is_buffer_closed());
        assert!(buffer.write(&rtp_bytes(1000, 11)).await.is_err());
    }

    #[tokio::test]
    async fn invalid_rtp_is_rejected() {
        let buffer = Buffer::new(1000);
        buffer.bind(&vp8_params(None), options()).await;
        let err = buffer.write(&[0x80, 0x60, 0x00]).await.unwrap_err();
        assert!(matches!(
            err,
            Error::BufferError {
                kind: BufferErrorKind::RtpParseError,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn gap_raises_nack() {
        let buffer = Buffer::new(1000);
        let nacked: Arc<StdMutex<Vec<u16>>> = Arc::new(StdMutex::new(Vec::new()));
        {
            let nacked = nacked.clone();
            buffer
                .on_feedback(Box::new(move |packets: RtcpPackets| {
                    for packet in packets {
                        if let Some(nack) = packet.as_any().downcast_ref::<TransportLayerNack>() {
                            let mut nacked = nacked.lock().unwrap();
                            for pair in nack.nacks.iter() {
                                nacked.extend(pair.packet_list());
                            }
                        }
                    }
                }))
                .await;
        }
        buffer.bind(&vp8_params(None), options()).await;

        buffer.write(&rtp_bytes(1000, 1)).await.unwrap();
        buffer.write(&rtp_bytes(1000, 2)).await.unwrap();
        buffer.write(&rtp_bytes(1000, 5)).await.unwrap();
        // Late arrival of a missing packet does not move the highest sequence back.
        buffer.write(&rtp_bytes(1000, 3)).await.unwrap();

        assert_eq!(*nacked.lock().unwrap(), vec![3, 4]);
    }

    #[tokio::test]
    async fn transport_wide_cc_samples() {
        let buffer = Buffer::new(1000);
        let samples: Arc<StdMutex<Vec<(u16, bool)>>> = Arc::new(StdMutex::new(Vec::new()));
        {
            let samples = samples.clone();
            buffer
                .on_transport_wide_cc(Box::new(move |sn, _time, marker| {
                    samples.lock().unwrap().push((sn, marker));
                }))
                .await;
        }
        buffer.bind(&vp8_params(Some(3)), options()).await;

        let mut packet = rtp_packet(1000, 1);
        packet.header.marker = true;
        let ext = TransportCcExtension {
            transport_sequence: 77,
        }
        .marshal()
        .unwrap();
        packet.header.set_extension(3, ext).unwrap();
        buffer.write(&packet.marshal().unwrap()).await.unwrap();

        assert_eq!(*samples.lock().unwrap(), vec![(77, true)]);
    }

    #[test]
    fn history_is_bounded() {
        let options = BufferOptions {
            buffer_time: 1000,
            max_bitrate: 1_000_000_000,
        };
        assert_eq!(options.history_size(), MAX_HISTORY_PACKETS);
        assert_eq!(super::tests::options().history_size(), MIN_HISTORY_PACKETS);
    }
}
