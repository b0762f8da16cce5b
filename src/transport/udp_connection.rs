use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use bytes::{Bytes, BytesMut};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{
    net::UdpSocket,
    sync::{broadcast, Mutex, RwLock},
    task::JoinHandle,
};
use webrtc::rtp;
use webrtc_util::Marshal;

use super::{
    packet::TransportPacket,
    packet_mux::{match_rtcp, match_rtp, PacketMux, PacketStream},
};
use crate::{
    config::RECEIVE_MTU,
    error::{Error, TransportErrorKind},
};

/// A listening UDP socket and the packet mux fed by its read loop. Closing releases the
/// port even while handles to the connection are still held.
#[derive(Debug)]
pub struct UdpConnection {
    socket: RwLock<Option<Arc<UdpSocket>>>,
    local_addr: SocketAddr,
    mux: Arc<PacketMux>,
    rtp_stream: Arc<PacketStream>,
    rtcp_stream: Arc<PacketStream>,
    closed: AtomicBool,
    closed_sender: broadcast::Sender<bool>,
    read_loop: Mutex<Option<JoinHandle<()>>>,
}

impl UdpConnection {
    /// Binds `addr` with the given socket buffer sizes and starts reading.
    pub async fn bind(
        addr: SocketAddr,
        recv_buffer_size: usize,
        send_buffer_size: usize,
    ) -> Result<Arc<Self>, Error> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        if let Err(err) = socket.set_recv_buffer_size(recv_buffer_size) {
            tracing::warn!("Failed to set recv buffer size={} addr={}: {}", recv_buffer_size, addr, err);
        }
        if let Err(err) = socket.set_send_buffer_size(send_buffer_size) {
            tracing::warn!("Failed to set send buffer size={} addr={}: {}", send_buffer_size, addr, err);
        }
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        let socket = UdpSocket::from_std(socket.into())?;
        Self::new(socket).await
    }

    /// Wraps an already bound socket.
    pub async fn new(socket: UdpSocket) -> Result<Arc<Self>, Error> {
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);
        let mux = Arc::new(PacketMux::new());
        // RTCP first, see `PacketClass::of`.
        let rtcp_stream = Arc::new(mux.new_stream(match_rtcp()).await);
        let rtp_stream = Arc::new(mux.new_stream(match_rtp()).await);

        let (closed_sender, _) = broadcast::channel(1);
        let handle = {
            let socket = socket.clone();
            let mux = mux.clone();
            let closed_receiver = closed_sender.subscribe();
            tokio::spawn(async move {
                Self::read_loop(local_addr, socket, mux, closed_receiver).await;
            })
        };

        tracing::debug!("UdpConnection local_addr={} is created", local_addr);

        Ok(Arc::new(Self {
            socket: RwLock::new(Some(socket)),
            local_addr,
            mux,
            rtp_stream,
            rtcp_stream,
            closed: AtomicBool::new(false),
            closed_sender,
            read_loop: Mutex::new(Some(handle)),
        }))
    }

    async fn read_loop(
        local_addr: SocketAddr,
        socket: Arc<UdpSocket>,
        mux: Arc<PacketMux>,
        mut closed_receiver: broadcast::Receiver<bool>,
    ) {
        tracing::debug!("UdpConnection local_addr={} read loop has started", local_addr);
        loop {
            let mut buf = BytesMut::zeroed(RECEIVE_MTU);
            tokio::select! {
                _ = closed_receiver.recv() => {
                    break;
                }
                res = socket.recv_from(&mut buf) => {
                    match res {
                        Ok((n, remote_addr)) => {
                            buf.truncate(n);
                            let packet = TransportPacket::new(buf.freeze(), local_addr, remote_addr);
                            tracing::trace!("UdpConnection received {} len={}", packet, n);
                            if let Err(err) = mux.dispatch(packet).await {
                                tracing::warn!("UdpConnection local_addr={} failed to dispatch: {}", local_addr, err);
                            }
                        }
                        Err(err) => {
                            tracing::warn!("UdpConnection local_addr={} read error: {}", local_addr, err);
                            break;
                        }
                    }
                }
            }
        }
        // Readers of the standing streams see the end once the backlog is drained.
        mux.close().await;
        tracing::debug!("UdpConnection local_addr={} read loop has finished", local_addr);
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn rtp_stream(&self) -> Arc<PacketStream> {
        self.rtp_stream.clone()
    }

    pub fn rtcp_stream(&self) -> Arc<PacketStream> {
        self.rtcp_stream.clone()
    }

    pub fn mux(&self) -> Arc<PacketMux> {
        self.mux.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize, Error> {
        let socket = match self.socket.read().await.clone() {
            Some(socket) if !self.is_closed() => socket,
            _ => {
                return Err(Error::new_transport(
                    format!("UdpConnection {} is closed", self.local_addr),
                    TransportErrorKind::ConnectionClosedError,
                ))
            }
        };
        let n = socket.send_to(buf, addr).await?;
        if n != buf.len() {
            return Err(Error::new_transport(
                format!("wrote {} of {} bytes to {}", n, buf.len(), addr),
                TransportErrorKind::ShortWriteError,
            ));
        }
        Ok(n)
    }

    pub async fn write_rtp(
        &self,
        header: &rtp::header::Header,
        payload: &[u8],
        addr: SocketAddr,
    ) -> Result<usize, Error> {
        let packet = rtp::packet::Packet {
            header: header.clone(),
            payload: Bytes::copy_from_slice(payload),
        };
        let data = packet.marshal().map_err(|err| {
            Error::new_transport(err.to_string(), TransportErrorKind::RtpMarshalError)
        })?;
        self.send_to(&data, addr).await
    }

    /// Stops the read loop, ends both standing streams and drops the socket. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.closed_sender.send(true);
        let handle = self.read_loop.lock().await.take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::error!("UdpConnection {} read loop failed: {}", self.local_addr, err);
            }
        }
        self.socket.write().await.take();
        tracing::debug!("UdpConnection local_addr={} is closed", self.local_addr);
    }
}
