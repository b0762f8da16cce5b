use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use tokio::sync::Mutex;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpParameters;

use crate::{
    error::{Error, SessionErrorKind},
    publisher::Publisher,
    receiver::Receiver,
    session::Session,
    subscriber::Subscriber,
    track::UpTrack,
    transport::PeerTransport,
    worker::Worker,
};

/// One participant of a session, publishing through its [`Publisher`] and receiving through
/// its [`Subscriber`].
#[derive(Debug)]
pub struct Peer {
    pub id: String,
    worker: Weak<Worker>,
    session: Mutex<Option<Weak<Session>>>,
    publisher: Mutex<Option<Arc<Publisher>>>,
    subscriber: Arc<Subscriber>,
    closed: AtomicBool,
}

impl Peer {
    pub(crate) fn new(id: String, worker: Weak<Worker>, subscriber: Arc<Subscriber>) -> Arc<Self> {
        tracing::debug!("Peer id={} is created", id);
        Arc::new(Self {
            id,
            worker,
            session: Mutex::new(None),
            publisher: Mutex::new(None),
            subscriber,
            closed: AtomicBool::new(false),
        })
    }

    pub fn subscriber(&self) -> Arc<Subscriber> {
        self.subscriber.clone()
    }

    pub async fn publisher(&self) -> Option<Arc<Publisher>> {
        self.publisher.lock().await.clone()
    }

    pub async fn session(&self) -> Option<Arc<Session>> {
        self.session.lock().await.as_ref().and_then(|s| s.upgrade())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Joins `session_id`, sending RTCP for published tracks to `remote_addr`, and subscribes
    /// to everything already published there.
    pub async fn join(self: &Arc<Self>, session_id: &str, remote_addr: SocketAddr) -> Result<Arc<Session>, Error> {
        if self.is_closed() {
            return Err(Error::new_session(
                format!("peer id={} is closed", self.id),
                SessionErrorKind::PeerClosedError,
            ));
        }
        let Some(worker) = self.worker.upgrade() else {
            return Err(Error::new_session(
                format!("worker of peer id={} is gone", self.id),
                SessionErrorKind::WorkerClosedError,
            ));
        };
        let session = worker.get_session(session_id).await;

        {
            let mut publisher = self.publisher.lock().await;
            if publisher.is_none() {
                let transport = PeerTransport::new(worker.pool(), remote_addr);
                *publisher = Some(Publisher::new(
                    self.id.clone(),
                    worker.config().router.clone(),
                    transport,
                    worker.buffer_factory(),
                ));
            }
        }
        {
            let mut current = self.session.lock().await;
            *current = Some(Arc::downgrade(&session));
        }

        session.add_peer(self.clone()).await;
        session.subscribe(self).await;
        tracing::debug!("Peer id={} joined session id={}", self.id, session.id);
        Ok(session)
    }

    /// Adds an up track. The first layer of a new track is offered to the other peers.
    pub async fn publish_track(
        &self,
        params: &RTCRtpParameters,
        track: UpTrack,
    ) -> Result<Arc<Receiver>, Error> {
        let (Some(publisher), Some(session)) = (self.publisher().await, self.session().await)
        else {
            return Err(Error::new_session(
                format!("peer id={} has not joined a session", self.id),
                SessionErrorKind::NotJoinedError,
            ));
        };
        let router = publisher.router();
        let (receiver, is_new) = router.add_receiver(params, track).await?;
        if is_new {
            session.publish(&router, &receiver).await;
        }
        Ok(receiver)
    }

    /// Leaves the session and stops publishing. Runs once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let session = self.session.lock().await.take();
        if let Some(session) = session.and_then(|s| s.upgrade()) {
            session.remove_peer(&self.id).await;
        }
        self.subscriber.close().await;
        let publisher = self.publisher.lock().await.take();
        if let Some(publisher) = publisher {
            publisher.close().await;
        }
        tracing::debug!("Peer id={} is closed", self.id);
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        tracing::debug!("Peer id={} is dropped", self.id);
    }
}
