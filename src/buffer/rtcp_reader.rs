use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use bytes::Bytes;
use tokio::{sync::Mutex, time::Instant};

use crate::error::{BufferErrorKind, Error};

pub type OnPacketFn = Box<dyn Fn(Bytes) + Send + Sync>;

/// Hands the RTCP datagrams of one SSRC to whoever registered for them.
#[derive(derivative::Derivative)]
#[derivative(Debug)]
pub struct RtcpReader {
    ssrc: u32,
    closed: AtomicBool,
    #[derivative(Debug = "ignore")]
    on_packet: Mutex<Option<OnPacketFn>>,
    last_write: Mutex<Instant>,
}

impl RtcpReader {
    pub fn new(ssrc: u32) -> Self {
        Self {
            ssrc,
            closed: AtomicBool::new(false),
            on_packet: Mutex::new(None),
            last_write: Mutex::new(Instant::now()),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Datagrams written before a callback is registered are dropped.
    pub async fn write(&self, data: &[u8]) -> Result<usize, Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::new_buffer(
                format!("rtcp reader ssrc={} is closed", self.ssrc),
                BufferErrorKind::BufferClosedError,
            ));
        }
        *self.last_write.lock().await = Instant::now();
        if let Some(on_packet) = self.on_packet.lock().await.as_ref() {
            on_packet(Bytes::copy_from_slice(data));
        }
        Ok(data.len())
    }

    pub async fn on_packet(&self, f: OnPacketFn) {
        let mut on_packet = self.on_packet.lock().await;
        *on_packet = Some(f);
    }

    /// No callback registered and nothing written for `ttl`.
    pub async fn is_idle_unbound(&self, ttl: Duration) -> bool {
        self.on_packet.lock().await.is_none() && self.last_write.lock().await.elapsed() >= ttl
    }

    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.on_packet.lock().await.take();
    }
}
