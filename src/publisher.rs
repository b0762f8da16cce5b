use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::{
    buffer::BufferFactory, config::RouterConfig, router::Router, transport::PeerTransport,
};

/// Publishing side of a peer. Owns the [`Router`] of the peer's tracks.
#[derive(Debug)]
pub struct Publisher {
    pub id: String,
    router: Arc<Router>,
    closed: AtomicBool,
}

impl Publisher {
    pub fn new(
        id: String,
        config: RouterConfig,
        transport: PeerTransport,
        buffer_factory: Arc<BufferFactory>,
    ) -> Arc<Self> {
        let router = Router::new(id.clone(), config, transport, buffer_factory);
        tracing::debug!("Publisher id={} is created", id);
        Arc::new(Self {
            id,
            router,
            closed: AtomicBool::new(false),
        })
    }

    pub fn router(&self) -> Arc<Router> {
        self.router.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.router.stop().await;
        tracing::debug!("Publisher id={} is closed", self.id);
    }
}
