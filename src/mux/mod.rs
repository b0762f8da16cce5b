//! Multiplexes packets arriving on a single socket into several endpoints (RFC 7983).

mod buffer;
mod endpoint;
pub mod matcher;

pub use buffer::{PacketBuffer, MAX_BUFFER_SIZE};
pub use endpoint::Endpoint;
pub use matcher::MatchFn;

use std::{
    future::Future,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use tokio::{
    net::UdpSocket,
    sync::{broadcast, Mutex, RwLock},
    task::JoinHandle,
};

use crate::{
    config::RECEIVE_MTU,
    error::{Error, MuxErrorKind},
};

/// Connected datagram socket the [`Mux`] reads from.
pub trait Conn: Send + Sync + 'static {
    fn recv(&self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;
    fn send(&self, buf: &[u8]) -> impl Future<Output = io::Result<usize>> + Send;
    fn send_to(
        &self,
        buf: &[u8],
        target: SocketAddr,
    ) -> impl Future<Output = io::Result<usize>> + Send;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Conn for UdpSocket {
    fn recv(&self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send {
        UdpSocket::recv(self, buf)
    }

    fn send(&self, buf: &[u8]) -> impl Future<Output = io::Result<usize>> + Send {
        UdpSocket::send(self, buf)
    }

    fn send_to(
        &self,
        buf: &[u8],
        target: SocketAddr,
    ) -> impl Future<Output = io::Result<usize>> + Send {
        UdpSocket::send_to(self, buf, target)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

pub(crate) struct EndpointEntry {
    pub(crate) id: u64,
    matcher: MatchFn,
    pub(crate) buffer: Arc<PacketBuffer>,
}

pub(crate) type EndpointTable = Arc<RwLock<Vec<EndpointEntry>>>;

/// Connection shared by a mux and its endpoints. Emptied when the mux closes.
pub(crate) type SharedConn<C> = Arc<RwLock<Option<Arc<C>>>>;

pub(crate) async fn live_conn<C: Conn>(conn: &SharedConn<C>) -> Result<Arc<C>, Error> {
    conn.read()
        .await
        .clone()
        .ok_or_else(|| Error::new_mux("mux is closed".to_string(), MuxErrorKind::MuxClosedError))
}

/// Owns the read loop of one connection and hands every datagram to the first endpoint
/// whose matcher accepts it. Matchers are evaluated in registration order.
#[derive(derivative::Derivative)]
#[derivative(Debug(bound = ""))]
pub struct Mux<C: Conn> {
    #[derivative(Debug = "ignore")]
    conn: SharedConn<C>,
    #[derivative(Debug = "ignore")]
    endpoints: EndpointTable,
    next_id: AtomicU64,
    buffer_limit: usize,
    closed: AtomicBool,
    closed_sender: broadcast::Sender<bool>,
    read_loop: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Conn> Mux<C> {
    pub fn new(conn: C) -> Arc<Self> {
        Self::with_buffer_limit(conn, MAX_BUFFER_SIZE)
    }

    /// Like [`Mux::new`] with a custom per-endpoint byte limit.
    pub fn with_buffer_limit(conn: C, buffer_limit: usize) -> Arc<Self> {
        let conn = Arc::new(conn);
        let endpoints: EndpointTable = Arc::new(RwLock::new(Vec::new()));
        let (closed_sender, _) = broadcast::channel(1);

        let handle = {
            let conn = conn.clone();
            let endpoints = endpoints.clone();
            let closed_receiver = closed_sender.subscribe();
            tokio::spawn(async move {
                Self::read_loop(conn, endpoints, closed_receiver).await;
            })
        };

        Arc::new(Self {
            conn: Arc::new(RwLock::new(Some(conn))),
            endpoints,
            next_id: AtomicU64::new(0),
            buffer_limit,
            closed: AtomicBool::new(false),
            closed_sender,
            read_loop: Mutex::new(Some(handle)),
        })
    }

    /// Registers a new endpoint that receives every datagram `matcher` accepts.
    pub async fn new_endpoint(&self, matcher: MatchFn) -> Endpoint<C> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let buffer = Arc::new(PacketBuffer::new(self.buffer_limit));
        {
            let mut endpoints = self.endpoints.write().await;
            endpoints.push(EndpointEntry {
                id,
                matcher,
                buffer: buffer.clone(),
            });
        }
        tracing::debug!("Mux endpoint id={} is registered", id);
        Endpoint::new(id, buffer, self.conn.clone(), self.endpoints.clone())
    }

    /// Idempotent.
    pub async fn remove_endpoint(&self, endpoint: &Endpoint<C>) {
        remove_endpoint(&self.endpoints, endpoint.id()).await;
    }

    pub async fn endpoint_count(&self) -> usize {
        self.endpoints.read().await.len()
    }

    /// Closes every endpoint, stops the read loop and releases the connection. Returns once
    /// the loop has finished. Endpoint writes fail with `MuxClosedError` afterwards.
    pub async fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut endpoints = self.endpoints.write().await;
            for entry in endpoints.drain(..) {
                entry.buffer.close().await;
            }
        }
        let _ = self.closed_sender.send(true);

        let handle = self.read_loop.lock().await.take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::error!("Mux read loop panicked: {}", err);
            }
        }
        self.conn.write().await.take();
        tracing::debug!("Mux is closed");
        Ok(())
    }

    async fn read_loop(
        conn: Arc<C>,
        endpoints: EndpointTable,
        mut closed_receiver: broadcast::Receiver<bool>,
    ) {
        tracing::debug!("Mux read loop has started");
        let mut buf = vec![0u8; RECEIVE_MTU];
        loop {
            tokio::select! {
                _ = closed_receiver.recv() => {
                    break;
                }
                res = conn.recv(&mut buf) => {
                    match res {
                        Ok(n) => {
                            if let Err(err) = Self::dispatch(&endpoints, &buf[..n]).await {
                                tracing::warn!("mux: dispatch failed: {}", err);
                            }
                        }
                        Err(err) => {
                            tracing::warn!("mux: read failed: {}", err);
                            break;
                        }
                    }
                }
            }
        }
        tracing::debug!("Mux read loop has finished");
    }

    pub(crate) async fn dispatch(endpoints: &EndpointTable, buf: &[u8]) -> Result<(), Error> {
        let buffer = {
            let endpoints = endpoints.read().await;
            endpoints
                .iter()
                .find(|entry| (entry.matcher)(buf))
                .map(|entry| entry.buffer.clone())
        };

        match buffer {
            Some(buffer) => {
                buffer.write(buf).await?;
                Ok(())
            }
            None => {
                match buf.first() {
                    Some(first) => {
                        tracing::warn!("mux: no endpoint for packet starting with {}", first)
                    }
                    None => tracing::warn!("mux: no endpoint for zero length packet"),
                }
                Ok(())
            }
        }
    }
}

pub(crate) async fn remove_endpoint(endpoints: &EndpointTable, id: u64) {
    let mut endpoints = endpoints.write().await;
    endpoints.retain(|entry| entry.id != id);
}
