use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tokio::sync::{Mutex, RwLock};

use crate::{peer::Peer, receiver::Receiver, router::Router};

pub type OnSessionCloseFn = Box<dyn FnOnce() + Send + Sync>;

/// A group of peers that receive each other's tracks. Sessions hold the only strong
/// references to their peers.
#[derive(derivative::Derivative)]
#[derivative(Debug)]
pub struct Session {
    pub id: String,
    peers: RwLock<HashMap<String, Arc<Peer>>>,
    #[derivative(Debug = "ignore")]
    on_close: Mutex<Option<OnSessionCloseFn>>,
    closed: AtomicBool,
}

impl Session {
    pub fn new(id: String) -> Arc<Self> {
        tracing::debug!("Session id={} is created", id);
        Arc::new(Self {
            id,
            peers: RwLock::new(HashMap::new()),
            on_close: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Fired once, when the last peer leaves.
    pub async fn on_close(&self, f: OnSessionCloseFn) {
        let mut on_close = self.on_close.lock().await;
        *on_close = Some(f);
    }

    pub async fn add_peer(&self, peer: Arc<Peer>) {
        let mut peers = self.peers.write().await;
        tracing::debug!("Session id={} add peer id={}", self.id, peer.id);
        peers.insert(peer.id.clone(), peer);
    }

    pub async fn remove_peer(&self, peer_id: &str) {
        let empty = {
            let mut peers = self.peers.write().await;
            if peers.remove(peer_id).is_none() {
                return;
            }
            tracing::debug!("Session id={} removed peer id={}", self.id, peer_id);
            peers.is_empty()
        };
        if empty && !self.closed.swap(true, Ordering::SeqCst) {
            let on_close = self.on_close.lock().await.take();
            if let Some(f) = on_close {
                f();
            }
            tracing::debug!("Session id={} is closed", self.id);
        }
    }

    pub async fn peers(&self) -> Vec<Arc<Peer>> {
        let peers = self.peers.read().await;
        peers.values().cloned().collect()
    }

    /// Attaches every other peer's subscriber to `receiver`. A failing peer is skipped.
    pub async fn publish(&self, router: &Arc<Router>, receiver: &Arc<Receiver>) {
        for peer in self.peers().await {
            if peer.id == receiver.peer_id() {
                continue;
            }
            if let Err(err) = router
                .add_down_tracks(&peer.subscriber(), Some(receiver.clone()))
                .await
            {
                tracing::error!(
                    "Session id={} failed to publish track_id={} to peer id={}: {}",
                    self.id,
                    receiver.track_id(),
                    peer.id,
                    err
                );
            }
        }
    }

    /// Attaches `peer`'s subscriber to everything the other peers publish.
    pub async fn subscribe(&self, peer: &Arc<Peer>) {
        let subscriber = peer.subscriber();
        for other in self.peers().await {
            if other.id == peer.id {
                continue;
            }
            let Some(publisher) = other.publisher().await else {
                continue;
            };
            if let Err(err) = publisher.router().add_down_tracks(&subscriber, None).await {
                tracing::error!(
                    "Session id={} failed to subscribe peer id={} to peer id={}: {}",
                    self.id,
                    peer.id,
                    other.id,
                    err
                );
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        tracing::debug!("Session id={} is dropped", self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, sync::atomic::AtomicUsize};

    use super::*;
    use crate::{
        buffer::tests::vp8_params,
        config::WorkerConfig,
        down_track::{tests::MockForwarder, Forwarder},
        subscriber::ForwarderFactory,
        track::tests::video_track,
        worker::Worker,
    };

    fn mock_factory() -> ForwarderFactory {
        Box::new(|params| {
            let forwarder: Arc<dyn Forwarder> =
                MockForwarder::new(&params.track_id, &params.peer_id);
            Ok(forwarder)
        })
    }

    #[tokio::test]
    async fn publish_and_subscribe() {
        let worker = Worker::new(WorkerConfig::default());
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let alice = worker.new_peer_with_factory("alice".to_string(), mock_factory());
        let bob = worker.new_peer_with_factory("bob".to_string(), mock_factory());

        let session = alice.join("room", addr).await.unwrap();
        let closed = Arc::new(AtomicUsize::new(0));
        {
            let closed = closed.clone();
            session
                .on_close(Box::new(move || {
                    closed.fetch_add(1, Ordering::SeqCst);
                }))
                .await;
        }
        bob.join("room", addr).await.unwrap();

        // Published after bob joined: broadcast to bob only.
        let receiver = alice
            .publish_track(&vp8_params(None), video_track("video", "", 100))
            .await
            .unwrap();
        assert_eq!(bob.subscriber().down_track_count().await, 1);
        assert_eq!(alice.subscriber().down_track_count().await, 0);
        assert_eq!(receiver.down_track_count(0).await, 1);

        // Another layer of the same track is not broadcast again.
        alice
            .publish_track(&vp8_params(None), video_track("video", "f", 101))
            .await
            .unwrap();
        assert_eq!(bob.subscriber().down_track_count().await, 1);

        // A late joiner gets what is already published.
        let carol = worker.new_peer_with_factory("carol".to_string(), mock_factory());
        carol.join("room", addr).await.unwrap();
        assert_eq!(carol.subscriber().down_track_count().await, 1);

        alice.close().await;
        bob.close().await;
        assert_eq!(closed.load(Ordering::SeqCst), 0);
        carol.close().await;
        carol.close().await;
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        worker.close().await;
    }

    #[tokio::test]
    async fn publish_requires_join() {
        let worker = Worker::new(WorkerConfig::default());
        let peer = worker.new_peer("lonely".to_string());
        assert!(peer
            .publish_track(&vp8_params(None), video_track("video", "", 1))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn failing_peer_is_skipped() {
        let worker = Worker::new(WorkerConfig::default());
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let alice = worker.new_peer_with_factory("alice".to_string(), mock_factory());
        let bob = worker.new_peer_with_factory("bob".to_string(), mock_factory());
        let carol = worker.new_peer_with_factory("carol".to_string(), mock_factory());
        for peer in [&alice, &bob, &carol] {
            peer.join("room", addr).await.unwrap();
        }

        // Bob can no longer take forwarders, carol still gets one.
        bob.subscriber().close().await;
        let receiver = alice
            .publish_track(&vp8_params(None), video_track("video", "", 100))
            .await
            .unwrap();
        assert_eq!(bob.subscriber().down_track_count().await, 0);
        assert_eq!(carol.subscriber().down_track_count().await, 1);
        assert_eq!(receiver.down_track_count(0).await, 1);

        // A late joiner skips bob's stopped router and gets the rest.
        carol
            .publish_track(&vp8_params(None), video_track("screen", "", 200))
            .await
            .unwrap();
        bob.publisher().await.unwrap().router().stop().await;
        let dave = worker.new_peer_with_factory("dave".to_string(), mock_factory());
        dave.join("room", addr).await.unwrap();
        assert_eq!(dave.subscriber().down_track_count().await, 2);

        for peer in [&alice, &bob, &carol, &dave] {
            peer.close().await;
        }
        worker.close().await;
    }
}
