use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use webrtc::rtcp::transport_feedbacks::transport_layer_cc::{
    PacketStatusChunk, RecvDelta, RunLengthChunk, StatusChunkTypeTcc, SymbolTypeTcc,
    TransportLayerCc,
};

use crate::{buffer::OnFeedbackFn, transport::RtcpPackets};

const FEEDBACK_INTERVAL: Duration = Duration::from_millis(100);
const MAX_SAMPLES_PER_FEEDBACK: usize = 100;
/// Reference time unit of a feedback packet, in microseconds.
const REFERENCE_TIME_UNIT: i64 = 64_000;
/// Receive delta unit, in microseconds.
const DELTA_UNIT: i64 = 250;
const MAX_RUN_LENGTH: u16 = 0x1fff;

#[derive(Debug, Clone, Copy)]
struct Sample {
    sequence_number: u16,
    time_ns: i64,
    marker: bool,
}

/// Arrival times collected between two feedback packets.
#[derive(Debug, Default)]
pub(crate) struct ArrivalRecorder {
    samples: Vec<(u32, i64)>,
    last_sequence_number: Option<u16>,
    cycles: u32,
    feedback_count: u8,
}

impl ArrivalRecorder {
    pub(crate) fn record(&mut self, sequence_number: u16, time_ns: i64) {
        if let Some(last) = self.last_sequence_number {
            if sequence_number < last && last - sequence_number > 0x8000 {
                self.cycles = self.cycles.wrapping_add(1 << 16);
            }
        }
        self.last_sequence_number = Some(sequence_number);
        let extended = self.cycles | sequence_number as u32;
        self.samples.push((extended, time_ns / 1000));
    }

    pub(crate) fn len(&self) -> usize {
        self.samples.len()
    }

    /// Drains the samples into one feedback packet.
    pub(crate) fn build(&mut self, media_ssrc: u32) -> Option<TransportLayerCc> {
        let mut samples = std::mem::take(&mut self.samples);
        samples.sort_by_key(|(sn, _)| *sn);
        samples.dedup_by_key(|(sn, _)| *sn);
        let (first_sn, first_us) = *samples.first()?;
        let (last_sn, _) = *samples.last()?;
        if last_sn - first_sn >= u16::MAX as u32 {
            return None;
        }

        let reference = first_us.div_euclid(REFERENCE_TIME_UNIT);
        let mut previous_us = reference * REFERENCE_TIME_UNIT;

        let mut symbols = Vec::new();
        let mut recv_deltas = Vec::new();
        let mut received = samples.iter().peekable();
        for sn in first_sn..=last_sn {
            match received.peek() {
                Some((received_sn, arrival_us)) if *received_sn == sn => {
                    let units = ((arrival_us - previous_us) / DELTA_UNIT)
                        .clamp(i16::MIN as i64, i16::MAX as i64);
                    let symbol = if (0..=255).contains(&units) {
                        SymbolTypeTcc::PacketReceivedSmallDelta
                    } else {
                        SymbolTypeTcc::PacketReceivedLargeDelta
                    };
                    previous_us += units * DELTA_UNIT;
                    recv_deltas.push(RecvDelta {
                        type_tcc_packet: symbol,
                        delta: units * DELTA_UNIT,
                    });
                    symbols.push(symbol);
                    received.next();
                }
                _ => symbols.push(SymbolTypeTcc::PacketNotReceived),
            }
        }

        let mut packet_chunks: Vec<PacketStatusChunk> = Vec::new();
        for symbol in symbols.iter() {
            match packet_chunks.last_mut() {
                Some(PacketStatusChunk::RunLengthChunk(chunk))
                    if chunk.packet_status_symbol == *symbol
                        && chunk.run_length < MAX_RUN_LENGTH =>
                {
                    chunk.run_length += 1;
                }
                _ => packet_chunks.push(PacketStatusChunk::RunLengthChunk(RunLengthChunk {
                    type_tcc: StatusChunkTypeTcc::RunLengthChunk,
                    packet_status_symbol: *symbol,
                    run_length: 1,
                })),
            }
        }

        let feedback = TransportLayerCc {
            sender_ssrc: 1,
            media_ssrc,
            base_sequence_number: first_sn as u16,
            packet_status_count: symbols.len() as u16,
            reference_time: (reference as u32) & 0x00ff_ffff,
            fb_pkt_count: self.feedback_count,
            packet_chunks,
            recv_deltas,
        };
        self.feedback_count = self.feedback_count.wrapping_add(1);
        Some(feedback)
    }
}

/// Transport wide congestion control feedback for one publisher connection.
///
/// Arrival samples are pushed from the packet path and turned into `TransportLayerCc`
/// packets every 100ms, on a marker bit, or when too many samples are pending.
#[derive(derivative::Derivative)]
#[derivative(Debug)]
pub struct TransportWideCc {
    media_ssrc: Arc<AtomicU32>,
    sample_sender: mpsc::UnboundedSender<Sample>,
    #[derivative(Debug = "ignore")]
    on_feedback: Arc<Mutex<Option<OnFeedbackFn>>>,
    closed_sender: broadcast::Sender<bool>,
    feedback_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Default for TransportWideCc {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportWideCc {
    pub fn new() -> Self {
        let (sample_sender, sample_receiver) = mpsc::unbounded_channel();
        let (closed_sender, _) = broadcast::channel(1);
        let media_ssrc = Arc::new(AtomicU32::new(0));
        let on_feedback: Arc<Mutex<Option<OnFeedbackFn>>> = Arc::new(Mutex::new(None));

        let handle = {
            let media_ssrc = media_ssrc.clone();
            let on_feedback = on_feedback.clone();
            let closed_receiver = closed_sender.subscribe();
            tokio::spawn(async move {
                Self::feedback_loop(media_ssrc, on_feedback, sample_receiver, closed_receiver)
                    .await;
            })
        };

        Self {
            media_ssrc,
            sample_sender,
            on_feedback,
            closed_sender,
            feedback_loop: Mutex::new(Some(handle)),
        }
    }

    pub fn push(&self, sequence_number: u16, time_ns: i64, marker: bool) {
        let _ = self.sample_sender.send(Sample {
            sequence_number,
            time_ns,
            marker,
        });
    }

    /// Latches the media SSRC reported in feedback. Only the first call wins.
    pub fn set_media_ssrc(&self, ssrc: u32) -> bool {
        self.media_ssrc
            .compare_exchange(0, ssrc, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn media_ssrc(&self) -> u32 {
        self.media_ssrc.load(Ordering::SeqCst)
    }

    pub async fn on_feedback(&self, f: OnFeedbackFn) {
        let mut on_feedback = self.on_feedback.lock().await;
        *on_feedback = Some(f);
    }

    async fn feedback_loop(
        media_ssrc: Arc<AtomicU32>,
        on_feedback: Arc<Mutex<Option<OnFeedbackFn>>>,
        mut sample_receiver: mpsc::UnboundedReceiver<Sample>,
        mut closed_receiver: broadcast::Receiver<bool>,
    ) {
        let mut recorder = ArrivalRecorder::default();
        let mut interval = tokio::time::interval(FEEDBACK_INTERVAL);
        interval.tick().await;
        loop {
            let flush = tokio::select! {
                _ = closed_receiver.recv() => {
                    break;
                }
                _ = interval.tick() => {
                    recorder.len() > 0
                }
                sample = sample_receiver.recv() => {
                    match sample {
                        Some(sample) => {
                            recorder.record(sample.sequence_number, sample.time_ns);
                            sample.marker || recorder.len() >= MAX_SAMPLES_PER_FEEDBACK
                        }
                        None => break,
                    }
                }
            };
            if !flush {
                continue;
            }

            let ssrc = media_ssrc.load(Ordering::SeqCst);
            if ssrc == 0 {
                recorder.build(0);
                continue;
            }
            if let Some(feedback) = recorder.build(ssrc) {
                tracing::trace!(
                    "TWCC feedback media_ssrc={} base={} count={}",
                    ssrc,
                    feedback.base_sequence_number,
                    feedback.packet_status_count
                );
                if let Some(f) = on_feedback.lock().await.as_ref() {
                    let packets: RtcpPackets = vec![Box::new(feedback)];
                    f(packets);
                }
                interval.reset();
            }
        }
        tracing::debug!("TWCC feedback loop has finished");
    }

    pub async fn close(&self) {
        let _ = self.closed_sender.send(true);
        let handle = self.feedback_loop.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
