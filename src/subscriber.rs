use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tokio::sync::{Mutex, RwLock};

use crate::{
    down_track::{DownTrack, DownTrackParams, Forwarder},
    error::{Error, RouterErrorKind},
    receiver::Receiver,
};

pub type ForwarderFactory =
    Box<dyn Fn(DownTrackParams) -> Result<Arc<dyn Forwarder>, Error> + Send + Sync>;
pub type OnNegotiateFn = Box<dyn Fn() + Send + Sync>;

/// Subscribing side of a peer. Holds the forwarders of every track it receives, grouped by
/// stream id.
#[derive(derivative::Derivative)]
#[derivative(Debug)]
pub struct Subscriber {
    pub id: String,
    down_tracks: RwLock<HashMap<String, Vec<Arc<dyn Forwarder>>>>,
    #[derivative(Debug = "ignore")]
    factory: ForwarderFactory,
    #[derivative(Debug = "ignore")]
    on_negotiate: Mutex<Option<OnNegotiateFn>>,
    closed: AtomicBool,
}

impl Subscriber {
    pub fn new(id: String) -> Arc<Self> {
        Self::with_factory(
            id,
            Box::new(|params| {
                let down_track: Arc<dyn Forwarder> = DownTrack::new(params);
                Ok(down_track)
            }),
        )
    }

    pub fn with_factory(id: String, factory: ForwarderFactory) -> Arc<Self> {
        tracing::debug!("Subscriber id={} is created", id);
        Arc::new(Self {
            id,
            down_tracks: RwLock::new(HashMap::new()),
            factory,
            on_negotiate: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn get_down_tracks(&self, stream_id: &str) -> Vec<Arc<dyn Forwarder>> {
        let down_tracks = self.down_tracks.read().await;
        down_tracks.get(stream_id).cloned().unwrap_or_default()
    }

    pub async fn down_track_count(&self) -> usize {
        let down_tracks = self.down_tracks.read().await;
        down_tracks.values().map(|d| d.len()).sum()
    }

    /// Builds a forwarder for `receiver` unless a live one already exists for its track.
    /// Returns `None` when nothing was created.
    pub async fn attach(&self, receiver: &Arc<Receiver>) -> Result<Option<Arc<dyn Forwarder>>, Error> {
        if self.is_closed() {
            return Err(Error::new_router(
                format!("subscriber id={} is closed", self.id),
                RouterErrorKind::SubscriberClosedError,
            ));
        }
        let mut down_tracks = self.down_tracks.write().await;
        let stream = down_tracks
            .entry(receiver.stream_id().to_string())
            .or_default();
        stream.retain(|d| !d.is_closed());
        if stream.iter().any(|d| d.id() == receiver.track_id()) {
            return Ok(None);
        }

        let forwarder = (self.factory)(DownTrackParams {
            track_id: receiver.track_id().to_string(),
            stream_id: receiver.stream_id().to_string(),
            peer_id: self.id.clone(),
            codec: receiver.codec(),
            receiver: Arc::downgrade(receiver),
        })?;
        tracing::debug!(
            "Subscriber id={} attached track_id={} of peer_id={}",
            self.id,
            receiver.track_id(),
            receiver.peer_id()
        );
        stream.push(forwarder.clone());
        Ok(Some(forwarder))
    }

    pub async fn remove_down_track(&self, stream_id: &str, track_id: &str) {
        let mut down_tracks = self.down_tracks.write().await;
        if let Some(stream) = down_tracks.get_mut(stream_id) {
            stream.retain(|d| d.id() != track_id);
            if stream.is_empty() {
                down_tracks.remove(stream_id);
            }
        }
    }

    pub async fn on_negotiate(&self, f: OnNegotiateFn) {
        let mut on_negotiate = self.on_negotiate.lock().await;
        *on_negotiate = Some(f);
    }

    /// Asks the signaling side to renegotiate the session description.
    pub async fn negotiate(&self) {
        if self.is_closed() {
            return;
        }
        if let Some(f) = self.on_negotiate.lock().await.as_ref() {
            f();
        }
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let down_tracks: Vec<Arc<dyn Forwarder>> = self
            .down_tracks
            .write()
            .await
            .drain()
            .flat_map(|(_, d)| d)
            .collect();
        for down_track in down_tracks {
            down_track.close();
        }
        tracing::debug!("Subscriber id={} is closed", self.id);
    }
}
