use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use enclose::enc;
use tokio::{
    sync::{broadcast, Mutex, RwLock},
    task::JoinHandle,
};

use crate::{
    buffer::BufferFactory,
    config::WorkerConfig,
    error::{BufferErrorKind, Error},
    peer::Peer,
    session::Session,
    subscriber::{ForwarderFactory, Subscriber},
    transport::{
        packet::{SsrcLookup, TransportPacket},
        packet_mux::PacketStream,
        pool::ConnectionPool,
    },
};

/// Worker is responsible for the listening sockets, the buffers of every SSRC seen on them
/// and the sessions built on top.
#[derive(Debug)]
pub struct Worker {
    config: WorkerConfig,
    pool: Arc<ConnectionPool>,
    buffer_factory: Arc<BufferFactory>,
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    handlers: Mutex<HashMap<SocketAddr, Vec<JoinHandle<()>>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    stop_sender: broadcast::Sender<bool>,
    closed: AtomicBool,
}

impl Worker {
    pub fn new(config: WorkerConfig) -> Arc<Self> {
        let (stop_sender, _) = broadcast::channel(1);
        Arc::new(Self {
            config,
            pool: Arc::new(ConnectionPool::new()),
            buffer_factory: Arc::new(BufferFactory::new()),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            handlers: Mutex::new(HashMap::new()),
            sweeper: Mutex::new(None),
            stop_sender,
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn pool(&self) -> Arc<ConnectionPool> {
        self.pool.clone()
    }

    pub fn buffer_factory(&self) -> Arc<BufferFactory> {
        self.buffer_factory.clone()
    }

    /// Listens on every port of the configured range with the configured socket buffers.
    pub async fn listen_range(&self) -> Result<Vec<SocketAddr>, Error> {
        let listen = &self.config.listen;
        let mut addrs = Vec::new();
        for port in listen.port_start..=listen.port_end {
            let addr = self
                .add_listen(
                    SocketAddr::new(listen.ip, port),
                    listen.recv_buffer_size,
                    listen.send_buffer_size,
                )
                .await?;
            addrs.push(addr);
        }
        Ok(addrs)
    }

    /// Acquires a listener for `addr` and starts routing its packets into the buffers.
    /// Returns the bound address. Adding the same address again is a no-op.
    pub async fn add_listen(
        &self,
        addr: SocketAddr,
        recv_buffer_size: usize,
        send_buffer_size: usize,
    ) -> Result<SocketAddr, Error> {
        let conn = self
            .pool
            .acquire_listener(addr, recv_buffer_size, send_buffer_size)
            .await?;
        let local_addr = conn.local_addr();

        let mut handlers = self.handlers.lock().await;
        if handlers.contains_key(&local_addr) {
            return Ok(local_addr);
        }
        self.start_sweeper().await;

        let buffer_factory = self.buffer_factory.clone();
        let rtp_stream = conn.rtp_stream();
        let rtcp_stream = conn.rtcp_stream();
        let rtp_handler = {
            let closed_receiver = self.stop_sender.subscribe();
            tokio::spawn(enc!((buffer_factory) async move {
                Self::rtp_handler(local_addr, rtp_stream, buffer_factory, closed_receiver).await;
            }))
        };
        let rtcp_handler = {
            let closed_receiver = self.stop_sender.subscribe();
            tokio::spawn(enc!((buffer_factory) async move {
                Self::rtcp_handler(local_addr, rtcp_stream, buffer_factory, closed_receiver).await;
            }))
        };
        handlers.insert(local_addr, vec![rtp_handler, rtcp_handler]);

        tracing::info!("Worker listening on {}", local_addr);
        Ok(local_addr)
    }

    /// Any SSRC reaching a listener gets a buffer, drop the ones nobody publishes.
    async fn start_sweeper(&self) {
        let mut sweeper = self.sweeper.lock().await;
        if sweeper.is_some() {
            return;
        }
        let ttl = Duration::from_millis(self.config.unbound_buffer_ttl);
        let closed_receiver = self.stop_sender.subscribe();
        *sweeper = Some(tokio::spawn(
            self.buffer_factory.clone().sweep_loop(ttl, closed_receiver),
        ));
    }

    async fn rtp_handler(
        local_addr: SocketAddr,
        stream: Arc<PacketStream>,
        buffer_factory: Arc<BufferFactory>,
        mut closed_receiver: broadcast::Receiver<bool>,
    ) {
        tracing::debug!("Worker RTP handler on {} has started", local_addr);
        loop {
            tokio::select! {
                _ = closed_receiver.recv() => {
                    break;
                }
                res = stream.read_packet() => {
                    match res {
                        Some(packet) => {
                            let buffer = buffer_factory.get_or_new_buffer(packet.ssrc().0).await;
                            let res = buffer.write(&packet.data).await;
                            if let Err(err) = check_write(&packet, res) {
                                tracing::debug!("Worker failed to buffer RTP {}: {}", packet, err);
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        tracing::debug!("Worker RTP handler on {} has finished", local_addr);
    }

    async fn rtcp_handler(
        local_addr: SocketAddr,
        stream: Arc<PacketStream>,
        buffer_factory: Arc<BufferFactory>,
        mut closed_receiver: broadcast::Receiver<bool>,
    ) {
        tracing::debug!("Worker RTCP handler on {} has started", local_addr);
        loop {
            tokio::select! {
                _ = closed_receiver.recv() => {
                    break;
                }
                res = stream.read_packet() => {
                    match res {
                        Some(packet) => {
                            let lookup = packet.rtcp_ssrc();
                            if lookup == SsrcLookup::Fallback {
                                tracing::debug!("Worker received truncated RTCP from {}", packet.remote_addr);
                            }
                            let reader = buffer_factory.get_or_new_rtcp_reader(lookup.ssrc().0).await;
                            let res = reader.write(&packet.data).await;
                            if let Err(err) = check_write(&packet, res) {
                                tracing::debug!("Worker failed to deliver RTCP from {}: {}", packet.remote_addr, err);
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        tracing::debug!("Worker RTCP handler on {} has finished", local_addr);
    }

    /// Returns the session `id`, creating it on first use. A session removes itself from the
    /// worker when its last peer leaves.
    pub async fn get_session(&self, id: &str) -> Arc<Session> {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(id) {
                if !session.is_closed() {
                    return session.clone();
                }
            }
        }
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(id) {
            if !session.is_closed() {
                return session.clone();
            }
        }

        let session = Session::new(id.to_string());
        {
            let sessions = Arc::downgrade(&self.sessions);
            let closed = Arc::downgrade(&session);
            let id = id.to_string();
            session
                .on_close(Box::new(move || {
                    tokio::spawn(async move {
                        let Some(sessions) = sessions.upgrade() else {
                            return;
                        };
                        let mut sessions = sessions.write().await;
                        if sessions
                            .get(&id)
                            .is_some_and(|s| Arc::as_ptr(s) == closed.as_ptr())
                        {
                            sessions.remove(&id);
                        }
                    });
                }))
                .await;
        }
        sessions.insert(id.to_string(), session.clone());
        session
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub fn new_peer(self: &Arc<Self>, id: String) -> Arc<Peer> {
        let subscriber = Subscriber::new(id.clone());
        Peer::new(id, Arc::downgrade(self), subscriber)
    }

    /// Like [`Worker::new_peer`], with forwarders built by `factory`.
    pub fn new_peer_with_factory(self: &Arc<Self>, id: String, factory: ForwarderFactory) -> Arc<Peer> {
        let subscriber = Subscriber::with_factory(id.clone(), factory);
        Peer::new(id, Arc::downgrade(self), subscriber)
    }

    /// Stops the handlers and closes every socket and buffer. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.stop_sender.send(true);
        let handlers: Vec<JoinHandle<()>> = self
            .handlers
            .lock()
            .await
            .drain()
            .flat_map(|(_, h)| h)
            .collect();
        for handler in handlers {
            let _ = handler.await;
        }
        let sweeper = self.sweeper.lock().await.take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }
        self.pool.close().await;
        self.buffer_factory.close().await;
        tracing::info!("Worker is closed");
    }
}

fn check_write(packet: &TransportPacket, res: Result<usize, Error>) -> Result<(), Error> {
    let n = res?;
    if n != packet.len() {
        return Err(Error::new_buffer(
            format!("short write {} of {} bytes", n, packet.len()),
            BufferErrorKind::ShortWriteError,
        ));
    }
    Ok(())
}

impl Drop for Worker {
    fn drop(&mut self) {
        let _ = self.stop_sender.send(true);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::UdpSocket;

    use super::*;
    use crate::{
        buffer::tests::{rtp_bytes, vp8_params},
        config::ListenConfig,
        track::tests::video_track,
    };

    fn local_config() -> WorkerConfig {
        WorkerConfig {
            listen: ListenConfig {
                ip: "127.0.0.1".parse().unwrap(),
                port_start: 0,
                port_end: 0,
                recv_buffer_size: 1 << 20,
                send_buffer_size: 1 << 20,
            },
            ..Default::default()
        }
    }

    async fn wait_for_buffer_count(factory: &BufferFactory, count: usize) -> usize {
        for _ in 0..400 {
            if factory.buffer_count().await == count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        factory.buffer_count().await
    }

    #[tokio::test]
    async fn routes_rtp_to_buffer_by_ssrc() {
        let worker = Worker::new(local_config());
        let addrs = worker.listen_range().await.unwrap();
        assert_eq!(addrs.len(), 1);
        assert_eq!(
            worker
                .add_listen(addrs[0], 1 << 20, 1 << 20)
                .await
                .unwrap(),
            addrs[0]
        );

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&rtp_bytes(4242, 7), addrs[0]).await.unwrap();

        let factory = worker.buffer_factory();
        let mut buffer = None;
        for _ in 0..200 {
            buffer = factory.get_buffer(4242).await;
            if buffer.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let buffer = buffer.unwrap();

        // Bound later, the packet is still delivered from the pending queue.
        let peer = worker.new_peer("pub".to_string());
        peer.join("room", client.local_addr().unwrap()).await.unwrap();
        let receiver = peer
            .publish_track(&vp8_params(None), video_track("video", "", 4242))
            .await
            .unwrap();
        assert!(buffer.is_bound().await);
        assert_eq!(buffer.get_packet(7).await.unwrap(), rtp_bytes(4242, 7));
        assert_eq!(receiver.ssrc(0).await, 4242);

        peer.close().await;
        worker.close().await;
        worker.close().await;
    }

    #[tokio::test]
    async fn sessions_remove_themselves() {
        let worker = Worker::new(local_config());
        let a = worker.new_peer("a".to_string());
        let b = worker.new_peer("b".to_string());
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let session = a.join("room", addr).await.unwrap();
        b.join("room", addr).await.unwrap();
        assert!(Arc::ptr_eq(&session, &worker.get_session("room").await));
        assert_eq!(session.peers().await.len(), 2);

        a.close().await;
        assert_eq!(worker.session_count().await, 1);
        b.close().await;
        assert!(session.is_closed());
        for _ in 0..200 {
            if worker.session_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(worker.session_count().await, 0);
        worker.close().await;
    }

    #[tokio::test]
    async fn unpublished_ssrcs_are_evicted() {
        let worker = Worker::new(WorkerConfig {
            unbound_buffer_ttl: 100,
            ..local_config()
        });
        let addrs = worker.listen_range().await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for ssrc in 1000..1050u32 {
            client.send_to(&rtp_bytes(ssrc, 1), addrs[0]).await.unwrap();
        }

        let factory = worker.buffer_factory();
        assert!(wait_for_buffer_count(&factory, 50).await > 0);
        assert_eq!(wait_for_buffer_count(&factory, 0).await, 0);

        // Published SSRCs survive the sweep.
        let peer = worker.new_peer("pub".to_string());
        peer.join("room", client.local_addr().unwrap()).await.unwrap();
        peer.publish_track(&vp8_params(None), video_track("video", "", 4242))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(factory.get_buffer(4242).await.is_some());

        peer.close().await;
        worker.close().await;
    }
}
