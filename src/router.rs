use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Weak,
    },
};

use strum_macros::Display;
use tokio::{
    sync::{broadcast, mpsc, Mutex, RwLock},
    task::JoinHandle,
};
use webrtc::{
    rtcp::{self, sender_report::SenderReport},
    rtp_transceiver::rtp_codec::RTCRtpParameters,
};

use crate::{
    buffer::{Buffer, BufferFactory, BufferOptions, OnFeedbackFn, RtcpReader},
    config::RouterConfig,
    error::{Error, RouterErrorKind},
    receiver::{OnCloseFn, Receiver},
    subscriber::Subscriber,
    track::UpTrack,
    transport::{PeerTransport, RtcpPackets, RtcpReceiver, RtcpSender},
    twcc::TransportWideCc,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[repr(u8)]
pub enum RouterState {
    Created = 0,
    Active = 1,
    Stopped = 2,
}

impl From<u8> for RouterState {
    fn from(v: u8) -> Self {
        match v {
            0 => RouterState::Created,
            1 => RouterState::Active,
            _ => RouterState::Stopped,
        }
    }
}

/// Router owns every [`Receiver`] of one publisher and sends the RTCP those receivers
/// produce back to the publisher.
#[derive(Debug)]
pub struct Router {
    pub id: String,
    config: RouterConfig,
    transport: PeerTransport,
    twcc: Arc<TransportWideCc>,
    rtcp_sender: RtcpSender,
    receivers: Arc<RwLock<HashMap<String, Arc<Receiver>>>>,
    buffer_factory: Arc<BufferFactory>,
    state: AtomicU8,
    closed_sender: broadcast::Sender<bool>,
    send_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Router {
    pub fn new(
        id: String,
        config: RouterConfig,
        transport: PeerTransport,
        buffer_factory: Arc<BufferFactory>,
    ) -> Arc<Self> {
        let (rtcp_sender, rtcp_receiver) = mpsc::unbounded_channel();
        let (closed_sender, _) = broadcast::channel(1);

        let handle = {
            let id = id.clone();
            let transport = transport.clone();
            let closed_receiver = closed_sender.subscribe();
            tokio::spawn(async move {
                Self::rtcp_send_loop(id, transport, rtcp_receiver, closed_receiver).await;
            })
        };

        tracing::debug!(
            "Router id={} remote_addr={} is created",
            id,
            transport.remote_addr()
        );

        Arc::new(Self {
            id,
            config,
            transport,
            twcc: Arc::new(TransportWideCc::new()),
            rtcp_sender,
            receivers: Arc::new(RwLock::new(HashMap::new())),
            buffer_factory,
            state: AtomicU8::new(RouterState::Created as u8),
            closed_sender,
            send_loop: Mutex::new(Some(handle)),
        })
    }

    pub fn state(&self) -> RouterState {
        RouterState::from(self.state.load(Ordering::SeqCst))
    }

    pub fn transport(&self) -> &PeerTransport {
        &self.transport
    }

    /// Currently published receivers.
    pub async fn receivers(&self) -> Vec<Arc<Receiver>> {
        let receivers = self.receivers.read().await;
        receivers.values().cloned().collect()
    }

    pub async fn get_receiver(&self, track_id: &str) -> Option<Arc<Receiver>> {
        let receivers = self.receivers.read().await;
        receivers.get(track_id).cloned()
    }

    async fn rtcp_send_loop(
        id: String,
        transport: PeerTransport,
        mut rtcp_receiver: RtcpReceiver,
        mut closed_receiver: broadcast::Receiver<bool>,
    ) {
        tracing::debug!("Router id={} RTCP send loop has started", id);
        loop {
            tokio::select! {
                _ = closed_receiver.recv() => {
                    while let Ok(packets) = rtcp_receiver.try_recv() {
                        Self::write_rtcp(&id, &transport, packets).await;
                    }
                    break;
                }
                res = rtcp_receiver.recv() => {
                    match res {
                        Some(packets) => Self::write_rtcp(&id, &transport, packets).await,
                        None => break,
                    }
                }
            }
        }
        tracing::debug!("Router id={} RTCP send loop has finished", id);
    }

    async fn write_rtcp(id: &str, transport: &PeerTransport, packets: RtcpPackets) {
        if let Err(err) = transport.write_rtcp(&packets).await {
            tracing::error!(
                "Router id={} failed to write rtcp to {}: {}",
                id,
                transport.remote_addr(),
                err
            );
        }
    }

    /// Registers an up track of the publisher. Returns the receiver of its track and whether
    /// that receiver was created by this call.
    pub async fn add_receiver(
        &self,
        params: &RTCRtpParameters,
        track: UpTrack,
    ) -> Result<(Arc<Receiver>, bool), Error> {
        if self.state() == RouterState::Stopped {
            return Err(Error::new_router(
                format!("router id={} is stopped", self.id),
                RouterErrorKind::RouterStoppedError,
            ));
        }

        let (buffer, rtcp_reader) = self.buffer_factory.get_buffer_pair(track.ssrc).await;
        self.wire_buffer(&buffer, &rtcp_reader).await;

        let (receiver, is_new) = {
            let mut receivers = self.receivers.write().await;
            match receivers.get(&track.id) {
                Some(receiver) => (receiver.clone(), false),
                None => {
                    let receiver = Receiver::new(&track, self.id.clone());
                    receiver.set_rtcp_sender(self.rtcp_sender.clone()).await;
                    receiver
                        .on_close_handler(self.remove_on_close(&receiver, track.id.clone()))
                        .await;
                    receivers.insert(track.id.clone(), receiver.clone());
                    (receiver, true)
                }
            }
        };

        let ssrc = track.ssrc;
        receiver.add_up_track(track, buffer.clone()).await?;
        if self.twcc.set_media_ssrc(ssrc) {
            self.twcc.on_feedback(self.rtcp_feedback_fn()).await;
        }
        buffer
            .bind(
                params,
                BufferOptions {
                    buffer_time: self.config.max_buffer_time,
                    max_bitrate: self.config.max_bandwidth,
                },
            )
            .await;

        let _ = self.state.compare_exchange(
            RouterState::Created as u8,
            RouterState::Active as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        tracing::debug!(
            "Router id={} added receiver track_id={} ssrc={} is_new={}",
            self.id,
            receiver.track_id(),
            ssrc,
            is_new
        );
        Ok((receiver, is_new))
    }

    fn rtcp_feedback_fn(&self) -> OnFeedbackFn {
        let sender = self.rtcp_sender.clone();
        let id = self.id.clone();
        Box::new(move |packets: RtcpPackets| {
            if let Err(err) = sender.send(packets) {
                tracing::error!("Router id={} failed to queue rtcp: {}", id, err);
            }
        })
    }

    async fn wire_buffer(&self, buffer: &Arc<Buffer>, rtcp_reader: &Arc<RtcpReader>) {
        buffer.on_feedback(self.rtcp_feedback_fn()).await;

        let twcc = self.twcc.clone();
        buffer
            .on_transport_wide_cc(Box::new(move |sequence_number, time_ns, marker| {
                twcc.push(sequence_number, time_ns, marker);
            }))
            .await;

        let buffer = Arc::downgrade(buffer);
        rtcp_reader
            .on_packet(Box::new(move |mut data| {
                let Some(buffer) = buffer.upgrade() else {
                    return;
                };
                let packets = match rtcp::packet::unmarshal(&mut data) {
                    Ok(packets) => packets,
                    Err(err) => {
                        tracing::debug!(
                            "Buffer ssrc={} received malformed rtcp: {}",
                            buffer.ssrc(),
                            err
                        );
                        return;
                    }
                };
                for packet in packets {
                    if let Some(sr) = packet.as_any().downcast_ref::<SenderReport>() {
                        buffer.set_sender_report_data(sr.rtp_time, sr.ntp_time);
                    }
                }
            }))
            .await;
    }

    fn remove_on_close(&self, receiver: &Arc<Receiver>, track_id: String) -> OnCloseFn {
        let receivers = Arc::downgrade(&self.receivers);
        let closed: Weak<Receiver> = Arc::downgrade(receiver);
        let router_id = self.id.clone();
        Box::new(move || {
            tokio::spawn(async move {
                let Some(receivers) = receivers.upgrade() else {
                    return;
                };
                let mut receivers = receivers.write().await;
                if receivers
                    .get(&track_id)
                    .is_some_and(|r| Arc::as_ptr(r) == closed.as_ptr())
                {
                    receivers.remove(&track_id);
                    tracing::debug!(
                        "Router id={} removed receiver track_id={}",
                        router_id,
                        track_id
                    );
                }
            });
        })
    }

    /// Attaches forwarders of `subscriber` to `receiver`, or to every receiver of this router
    /// when `receiver` is `None`, then asks the subscriber to renegotiate.
    pub async fn add_down_tracks(
        &self,
        subscriber: &Arc<Subscriber>,
        receiver: Option<Arc<Receiver>>,
    ) -> Result<(), Error> {
        if self.state() == RouterState::Stopped {
            return Err(Error::new_router(
                format!("router id={} is stopped", self.id),
                RouterErrorKind::RouterStoppedError,
            ));
        }
        let receivers = match receiver {
            Some(receiver) => vec![receiver],
            None => self.receivers().await,
        };

        let mut attached = 0;
        for receiver in receivers {
            if let Some(forwarder) = subscriber.attach(&receiver).await? {
                receiver
                    .add_down_track(forwarder, self.config.simulcast.best_quality_first)
                    .await;
                attached += 1;
            }
        }
        if attached > 0 {
            tracing::debug!(
                "Router id={} attached {} down tracks to subscriber id={}",
                self.id,
                attached,
                subscriber.id
            );
            subscriber.negotiate().await;
        }
        Ok(())
    }

    /// Stops the RTCP send loop and closes every buffer of this router. Idempotent.
    pub async fn stop(&self) {
        let previous = self.state.swap(RouterState::Stopped as u8, Ordering::SeqCst);
        if RouterState::from(previous) == RouterState::Stopped {
            return;
        }
        let _ = self.closed_sender.send(true);
        let handle = self.send_loop.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.twcc.close().await;

        let receivers: Vec<Arc<Receiver>> =
            self.receivers.write().await.drain().map(|(_, r)| r).collect();
        let mut ssrcs = Vec::new();
        for receiver in receivers {
            for layer in receiver.active_layers().await {
                ssrcs.push(receiver.ssrc(layer).await);
            }
        }
        for ssrc in ssrcs {
            self.buffer_factory.remove(ssrc).await;
        }
        tracing::debug!("Router id={} is stopped", self.id);
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        tracing::debug!("Router id={} is dropped", self.id);
    }
}
