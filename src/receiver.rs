use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use enclose::enc;
use tokio::{
    sync::{mpsc, Mutex, RwLock},
    task::JoinHandle,
    time::Instant,
};
use webrtc::{
    rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication,
    rtp,
    rtp_transceiver::rtp_codec::{RTCRtpCodecParameters, RTPCodecType},
};
use webrtc_util::Unmarshal;

use crate::{
    buffer::Buffer,
    down_track::{DownTrackType, Forwarder},
    error::{Error, ReceiverErrorKind},
    rtp::layer::{spatial_layer, MAX_SIMULCAST_LAYERS},
    track::UpTrack,
    transport::{RtcpPackets, RtcpSender},
};

/// At most one PLI is sent upstream per window.
pub const PLI_INTERVAL: Duration = Duration::from_millis(500);

pub type OnCloseFn = Box<dyn FnOnce() + Send + Sync>;

struct NackRequest {
    forwarder: Arc<dyn Forwarder>,
    sequence_numbers: Vec<u16>,
    sn_offset: u16,
}

enum NackEvent {
    Retransmit(NackRequest),
    /// Sent after the last request; everything queued before it is still served.
    Stop,
}

#[derive(Debug, Default)]
struct Layers {
    up_tracks: [Option<UpTrack>; MAX_SIMULCAST_LAYERS],
    buffers: [Option<Arc<Buffer>>; MAX_SIMULCAST_LAYERS],
    down_tracks: [Option<Vec<Arc<dyn Forwarder>>>; MAX_SIMULCAST_LAYERS],
}

/// One published track: up to three simulcast layers, each fanned out to the forwarders of
/// its subscribers.
#[derive(derivative::Derivative)]
#[derivative(Debug)]
pub struct Receiver {
    peer_id: String,
    track_id: String,
    stream_id: String,
    kind: RTPCodecType,
    codec: RTCRtpCodecParameters,
    is_simulcast: bool,
    layers: Arc<RwLock<Layers>>,
    last_pli: Mutex<Option<Instant>>,
    rtcp_sender: Mutex<Option<RtcpSender>>,
    #[derivative(Debug = "ignore")]
    nack_sender: mpsc::UnboundedSender<NackEvent>,
    nack_stopped: AtomicBool,
    nack_worker: Mutex<Option<JoinHandle<()>>>,
    #[derivative(Debug = "ignore")]
    on_close: Mutex<Option<OnCloseFn>>,
    closed: AtomicBool,
}

impl Receiver {
    pub fn new(track: &UpTrack, peer_id: String) -> Arc<Self> {
        let layers = Arc::new(RwLock::new(Layers::default()));
        let (nack_sender, nack_receiver) = mpsc::unbounded_channel();

        let handle = {
            let track_id = track.id.clone();
            tokio::spawn(enc!((layers) async move {
                Self::nack_worker(track_id, layers, nack_receiver).await;
            }))
        };

        tracing::debug!(
            "Receiver track_id={} peer_id={} ssrc={} kind={} is created",
            track.id,
            peer_id,
            track.ssrc,
            track.kind
        );

        Arc::new(Self {
            peer_id,
            track_id: track.id.clone(),
            stream_id: track.stream_id.clone(),
            kind: track.kind,
            codec: track.codec.clone(),
            is_simulcast: !track.rid.is_empty(),
            layers,
            last_pli: Mutex::new(None),
            rtcp_sender: Mutex::new(None),
            nack_sender,
            nack_stopped: AtomicBool::new(false),
            nack_worker: Mutex::new(Some(handle)),
            on_close: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn kind(&self) -> RTPCodecType {
        self.kind
    }

    pub fn codec(&self) -> RTCRtpCodecParameters {
        self.codec.clone()
    }

    pub fn is_simulcast(&self) -> bool {
        self.is_simulcast
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// SSRC of the up track on `layer`, or 0 when the layer is not active.
    pub async fn ssrc(&self, layer: usize) -> u32 {
        let layers = self.layers.read().await;
        layers
            .up_tracks
            .get(layer)
            .and_then(|t| t.as_ref())
            .map(|t| t.ssrc)
            .unwrap_or_default()
    }

    pub async fn active_layers(&self) -> Vec<usize> {
        let layers = self.layers.read().await;
        (0..MAX_SIMULCAST_LAYERS)
            .filter(|l| layers.up_tracks[*l].is_some())
            .collect()
    }

    pub async fn down_track_count(&self, layer: usize) -> usize {
        let layers = self.layers.read().await;
        layers
            .down_tracks
            .get(layer)
            .and_then(|d| d.as_ref())
            .map(|d| d.len())
            .unwrap_or_default()
    }

    pub async fn set_rtcp_sender(&self, sender: RtcpSender) {
        let mut rtcp_sender = self.rtcp_sender.lock().await;
        *rtcp_sender = Some(sender);
    }

    /// Registers the callback fired once, when the first layer's stream ends.
    pub async fn on_close_handler(&self, f: OnCloseFn) {
        let mut on_close = self.on_close.lock().await;
        *on_close = Some(f);
    }

    /// Binds `track` to the layer slot of its RID and starts forwarding `buffer`'s packets.
    pub async fn add_up_track(self: &Arc<Self>, track: UpTrack, buffer: Arc<Buffer>) -> Result<(), Error> {
        let layer = spatial_layer(&track.rid);
        let Some(packet_stream) = buffer.packet_stream().await else {
            return Err(Error::new_receiver(
                format!(
                    "packet stream of ssrc={} is already consumed",
                    buffer.ssrc()
                ),
                ReceiverErrorKind::ReceiverClosedError,
            ));
        };

        {
            let mut layers = self.layers.write().await;
            tracing::debug!(
                "Receiver track_id={} add up track ssrc={} rid={} layer={}",
                self.track_id,
                track.ssrc,
                track.rid,
                layer
            );
            layers.up_tracks[layer] = Some(track);
            layers.buffers[layer] = Some(buffer);
            if layers.down_tracks[layer].is_none() {
                layers.down_tracks[layer] = Some(Vec::new());
            }
        }

        let receiver = self.clone();
        tokio::spawn(async move {
            receiver.forward_loop(layer, packet_stream).await;
        });
        Ok(())
    }

    async fn forward_loop(
        self: Arc<Self>,
        layer: usize,
        mut packet_stream: mpsc::Receiver<rtp::packet::Packet>,
    ) {
        tracing::debug!(
            "Receiver track_id={} layer={} forward loop has started",
            self.track_id,
            layer
        );
        while let Some(packet) = packet_stream.recv().await {
            tracing::trace!(
                "Receiver track_id={} layer={} forward ssrc={} seq={}",
                self.track_id,
                layer,
                packet.header.ssrc,
                packet.header.sequence_number
            );
            let mut gone = Vec::new();
            {
                let layers = self.layers.read().await;
                if let Some(down_tracks) = layers.down_tracks[layer].as_ref() {
                    for down_track in down_tracks.iter() {
                        match down_track.write_rtp(&packet) {
                            Ok(()) => {}
                            Err(err) if err.is_end_of_stream() => {
                                gone.push(down_track.peer_id().to_string());
                            }
                            Err(err) => {
                                tracing::warn!(
                                    "Receiver track_id={} failed to write to peer_id={}: {}",
                                    self.track_id,
                                    down_track.peer_id(),
                                    err
                                );
                            }
                        }
                    }
                }
            }
            for peer_id in gone {
                let receiver = self.clone();
                tokio::spawn(async move {
                    receiver.delete_down_track(layer, &peer_id).await;
                });
            }
        }

        self.close_tracks(layer).await;
        self.stop_nack_worker();
        self.closed.store(true, Ordering::SeqCst);
        let on_close = self.on_close.lock().await.take();
        if let Some(f) = on_close {
            f();
        }
        tracing::debug!(
            "Receiver track_id={} layer={} forward loop has finished",
            self.track_id,
            layer
        );
    }

    /// Attaches a forwarder to the lowest active layer, or the highest one when
    /// `best_quality_first`. Returns the chosen layer.
    pub async fn add_down_track(&self, forwarder: Arc<dyn Forwarder>, best_quality_first: bool) -> usize {
        let mut layers = self.layers.write().await;
        let mut layer = 0;
        if self.is_simulcast {
            for (i, up_track) in layers.up_tracks.iter().enumerate() {
                if up_track.is_some() {
                    layer = i;
                    if !best_quality_first {
                        break;
                    }
                }
            }
            forwarder.set_current_spatial_layer(layer);
            forwarder.set_target_spatial_layer(layer);
            forwarder.set_track_type(DownTrackType::Simulcast);
        } else {
            forwarder.set_track_type(DownTrackType::Simple);
        }
        tracing::debug!(
            "Receiver track_id={} add down track peer_id={} layer={}",
            self.track_id,
            forwarder.peer_id(),
            layer
        );
        layers.down_tracks[layer]
            .get_or_insert_with(Vec::new)
            .push(forwarder);
        layer
    }

    /// Attaches a forwarder to a layer that already has an up track.
    pub async fn sub_down_track(&self, forwarder: Arc<dyn Forwarder>, layer: usize) -> Result<(), Error> {
        let mut layers = self.layers.write().await;
        if !layers_active(&layers.up_tracks, layer) {
            return Err(no_such_layer(&self.track_id, layer));
        }
        layers.down_tracks[layer]
            .get_or_insert_with(Vec::new)
            .push(forwarder);
        Ok(())
    }

    /// Moves a forwarder between layers under one lock.
    pub async fn switch_down_track(
        &self,
        forwarder: Arc<dyn Forwarder>,
        from: usize,
        to: usize,
    ) -> Result<(), Error> {
        let mut layers = self.layers.write().await;
        if !layers_active(&layers.up_tracks, to) {
            return Err(no_such_layer(&self.track_id, to));
        }
        if let Some(Some(down_tracks)) = layers.down_tracks.get_mut(from) {
            swap_remove_peer(down_tracks, forwarder.peer_id());
        }
        forwarder.set_current_spatial_layer(to);
        forwarder.set_target_spatial_layer(to);
        layers.down_tracks[to]
            .get_or_insert_with(Vec::new)
            .push(forwarder);
        Ok(())
    }

    pub async fn delete_down_track(&self, layer: usize, peer_id: &str) {
        let mut layers = self.layers.write().await;
        if let Some(Some(down_tracks)) = layers.down_tracks.get_mut(layer) {
            if swap_remove_peer(down_tracks, peer_id) {
                tracing::debug!(
                    "Receiver track_id={} deleted down track peer_id={} layer={}",
                    self.track_id,
                    peer_id,
                    layer
                );
            }
        }
    }

    /// Forwards RTCP upstream. PLIs are throttled to one per [`PLI_INTERVAL`]; returns
    /// whether the packets were forwarded.
    pub async fn send_rtcp(&self, packets: RtcpPackets) -> bool {
        let Some(first) = packets.first() else {
            return false;
        };
        if first
            .as_any()
            .downcast_ref::<PictureLossIndication>()
            .is_some()
        {
            let mut last_pli = self.last_pli.lock().await;
            let now = Instant::now();
            if let Some(last) = *last_pli {
                if now.duration_since(last) < PLI_INTERVAL {
                    return false;
                }
            }
            *last_pli = Some(now);
        }

        let rtcp_sender = self.rtcp_sender.lock().await;
        match rtcp_sender.as_ref() {
            Some(sender) => match sender.send(packets) {
                Ok(()) => true,
                Err(err) => {
                    tracing::error!(
                        "Receiver track_id={} failed to send rtcp: {}",
                        self.track_id,
                        err
                    );
                    false
                }
            },
            None => false,
        }
    }

    /// Queues a NACK request on the retransmission worker. `sn_offset` maps the forwarder's
    /// sequence numbers back to the buffered ones.
    pub fn retransmit_packets(
        &self,
        forwarder: Arc<dyn Forwarder>,
        sequence_numbers: Vec<u16>,
        sn_offset: u16,
    ) {
        if self.nack_stopped.load(Ordering::SeqCst) {
            tracing::debug!("Receiver track_id={} nack worker is stopped", self.track_id);
            return;
        }
        let request = NackEvent::Retransmit(NackRequest {
            forwarder,
            sequence_numbers,
            sn_offset,
        });
        if self.nack_sender.send(request).is_err() {
            tracing::debug!("Receiver track_id={} nack worker is stopped", self.track_id);
        }
    }

    async fn nack_worker(
        track_id: String,
        layers: Arc<RwLock<Layers>>,
        mut nack_receiver: mpsc::UnboundedReceiver<NackEvent>,
    ) {
        tracing::debug!("Receiver track_id={} nack worker has started", track_id);
        while let Some(event) = nack_receiver.recv().await {
            let request = match event {
                NackEvent::Retransmit(request) => request,
                NackEvent::Stop => break,
            };
            let layer = request.forwarder.current_spatial_layer();
            let buffer = {
                let layers = layers.read().await;
                layers.buffers.get(layer).cloned().flatten()
            };
            let Some(buffer) = buffer else {
                continue;
            };
            for sn in request.sequence_numbers {
                let data = match buffer.get_packet(sn.wrapping_add(request.sn_offset)).await {
                    Ok(data) => data,
                    Err(err) if err.is_buffer_closed() => break,
                    Err(_) => continue,
                };
                let mut data = data;
                let packet = match rtp::packet::Packet::unmarshal(&mut data) {
                    Ok(packet) => packet,
                    Err(_) => continue,
                };
                if let Err(err) = request.forwarder.write_rtp(&packet) {
                    if err.is_end_of_stream() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Receiver track_id={} nack worker has finished", track_id);
    }

    /// Already queued requests still drain.
    fn stop_nack_worker(&self) {
        if !self.nack_stopped.swap(true, Ordering::SeqCst) {
            let _ = self.nack_sender.send(NackEvent::Stop);
        }
    }

    async fn close_tracks(&self, layer: usize) {
        let (down_tracks, buffer) = {
            let mut layers = self.layers.write().await;
            layers.up_tracks[layer] = None;
            (layers.down_tracks[layer].take(), layers.buffers[layer].take())
        };
        if let Some(buffer) = buffer {
            tracing::debug!(
                "Receiver track_id={} layer={} buffer ssrc={} ended",
                self.track_id,
                layer,
                buffer.ssrc()
            );
        }
        for down_track in down_tracks.unwrap_or_default() {
            down_track.close();
        }
    }

    /// Waits for the retransmission worker after the forward loops stopped it.
    pub async fn wait_closed(&self) {
        let handle = self.nack_worker.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

fn layers_active(up_tracks: &[Option<UpTrack>; MAX_SIMULCAST_LAYERS], layer: usize) -> bool {
    matches!(up_tracks.get(layer), Some(Some(_)))
}

fn no_such_layer(track_id: &str, layer: usize) -> Error {
    Error::new_receiver(
        format!("track_id={} has no active layer {}", track_id, layer),
        ReceiverErrorKind::NoSuchLayerError,
    )
}

fn swap_remove_peer(down_tracks: &mut Vec<Arc<dyn Forwarder>>, peer_id: &str) -> bool {
    match down_tracks.iter().position(|d| d.peer_id() == peer_id) {
        Some(idx) => {
            down_tracks.swap_remove(idx);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use webrtc::rtcp::receiver_report::ReceiverReport;

    use super::*;
    use crate::{
        buffer::tests::{options, rtp_bytes, vp8_params},
        down_track::tests::MockForwarder,
        track::tests::video_track,
    };

    async fn bound_buffer(ssrc: u32) -> Arc<Buffer> {
        let buffer = Arc::new(Buffer::new(ssrc));
        buffer.bind(&vp8_params(None), options()).await;
        buffer
    }

    macro_rules! eventually {
        ($cond:expr) => {{
            let mut met = false;
            for _ in 0..200 {
                if $cond {
                    met = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            assert!(met, "condition was not met");
        }};
    }

    fn pli() -> RtcpPackets {
        vec![Box::new(PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc: 1,
        })]
    }

    #[tokio::test]
    async fn fan_out_and_remove_dead_forwarder() {
        let track = video_track("video", "", 1000);
        let receiver = Receiver::new(&track, "pub".to_string());
        let buffer = bound_buffer(1000).await;
        receiver.add_up_track(track, buffer.clone()).await.unwrap();

        let alive = MockForwarder::new("video", "a");
        let dead = MockForwarder::new("video", "b");
        receiver.add_down_track(alive.clone(), false).await;
        receiver.add_down_track(dead.clone(), false).await;
        assert_eq!(receiver.down_track_count(0).await, 2);

        buffer.write(&rtp_bytes(1000, 1)).await.unwrap();
        eventually!(alive.written() == vec![1] && dead.written() == vec![1]);

        dead.close();
        buffer.write(&rtp_bytes(1000, 2)).await.unwrap();
        eventually!(receiver.down_track_count(0).await == 1);
        assert_eq!(alive.written(), vec![1, 2]);
        assert_eq!(dead.written(), vec![1]);
    }

    #[tokio::test]
    async fn simulcast_layer_selection() {
        let low = video_track("video", "q", 1);
        let receiver = Receiver::new(&low, "pub".to_string());
        assert!(receiver.is_simulcast());
        receiver.add_up_track(low, bound_buffer(1).await).await.unwrap();
        receiver
            .add_up_track(video_track("video", "f", 3), bound_buffer(3).await)
            .await
            .unwrap();
        assert_eq!(receiver.active_layers().await, vec![0, 2]);
        assert_eq!(receiver.ssrc(2).await, 3);
        assert_eq!(receiver.ssrc(1).await, 0);

        let lowest = MockForwarder::new("video", "a");
        assert_eq!(receiver.add_down_track(lowest.clone(), false).await, 0);
        assert_eq!(lowest.current_spatial_layer(), 0);
        assert_eq!(lowest.track_type(), DownTrackType::Simulcast);

        let best = MockForwarder::new("video", "b");
        assert_eq!(receiver.add_down_track(best.clone(), true).await, 2);
        assert_eq!(best.target_spatial_layer(), 2);

        let err = receiver
            .sub_down_track(MockForwarder::new("video", "c"), 1)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ReceiverError {
                kind: ReceiverErrorKind::NoSuchLayerError,
                ..
            }
        ));
        receiver
            .sub_down_track(MockForwarder::new("video", "c"), 2)
            .await
            .unwrap();
        assert_eq!(receiver.down_track_count(2).await, 2);

        receiver.switch_down_track(lowest.clone(), 0, 2).await.unwrap();
        assert_eq!(receiver.down_track_count(0).await, 0);
        assert_eq!(receiver.down_track_count(2).await, 3);
        assert_eq!(lowest.current_spatial_layer(), 2);
        assert!(receiver.switch_down_track(lowest.clone(), 2, 1).await.is_err());
        assert_eq!(receiver.down_track_count(2).await, 3);

        receiver.delete_down_track(2, "b").await;
        receiver.delete_down_track(2, "missing").await;
        assert_eq!(receiver.down_track_count(2).await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn pli_is_throttled() {
        let track = video_track("video", "", 1);
        let receiver = Receiver::new(&track, "pub".to_string());
        let (tx, mut rx) = mpsc::unbounded_channel();
        receiver.set_rtcp_sender(tx).await;

        let mut forwarded = 0;
        for _ in 0..5 {
            if receiver.send_rtcp(pli()).await {
                forwarded += 1;
            }
        }
        assert_eq!(forwarded, 1);

        // Other feedback is not throttled.
        let report: RtcpPackets = vec![Box::new(ReceiverReport::default())];
        assert!(receiver.send_rtcp(report).await);

        tokio::time::advance(PLI_INTERVAL).await;
        assert!(receiver.send_rtcp(pli()).await);

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 3);
    }

    #[tokio::test]
    async fn retransmit_from_buffer() {
        let track = video_track("video", "", 1000);
        let receiver = Receiver::new(&track, "pub".to_string());
        let buffer = bound_buffer(1000).await;
        receiver.add_up_track(track, buffer.clone()).await.unwrap();
        for sn in 10..13 {
            buffer.write(&rtp_bytes(1000, sn)).await.unwrap();
        }

        let forwarder = MockForwarder::new("video", "a");
        receiver.retransmit_packets(forwarder.clone(), vec![100, 101], 0);
        receiver.retransmit_packets(forwarder.clone(), vec![1, 2], 10);
        eventually!(forwarder.written() == vec![11, 12]);
    }

    #[tokio::test]
    async fn stream_end_closes_forwarders_once() {
        let track = video_track("video", "q", 1);
        let receiver = Receiver::new(&track, "pub".to_string());
        let low = bound_buffer(1).await;
        let high = bound_buffer(3).await;
        receiver.add_up_track(track, low.clone()).await.unwrap();
        receiver
            .add_up_track(video_track("video", "f", 3), high.clone())
            .await
            .unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = fired.clone();
            receiver
                .on_close_handler(Box::new(move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                }))
                .await;
        }
        let forwarder = MockForwarder::new("video", "a");
        receiver.add_down_track(forwarder.clone(), false).await;

        low.close().await;
        eventually!(receiver.is_closed());
        assert!(forwarder.is_closed());
        assert_eq!(receiver.active_layers().await, vec![2]);

        high.close().await;
        eventually!(receiver.active_layers().await.is_empty());
        receiver.wait_closed().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // The worker is gone, requests are ignored.
        receiver.retransmit_packets(forwarder.clone(), vec![1], 0);
    }
}
