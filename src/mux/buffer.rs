use std::collections::VecDeque;

use bytes::Bytes;
use tokio::sync::{Mutex, Notify};

use crate::error::{Error, MuxErrorKind};

/// The maximum amount of unread data an endpoint keeps before writes fail.
pub const MAX_BUFFER_SIZE: usize = 1000 * 1000;

/// Bounded FIFO of whole datagrams.
///
/// A write either stores the full datagram or fails; datagrams are never split.
#[derive(Debug)]
pub struct PacketBuffer {
    state: Mutex<BufferState>,
    notify: Notify,
    limit: usize,
}

#[derive(Debug, Default)]
struct BufferState {
    packets: VecDeque<Bytes>,
    size: usize,
    closed: bool,
}

impl PacketBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            state: Mutex::new(BufferState::default()),
            notify: Notify::new(),
            limit,
        }
    }

    pub async fn write(&self, data: &[u8]) -> Result<usize, Error> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(Error::new_mux(
                "buffer is closed".to_string(),
                MuxErrorKind::BufferClosedError,
            ));
        }
        if state.size + data.len() > self.limit {
            return Err(Error::new_mux(
                format!(
                    "buffer is full: size={} incoming={} limit={}",
                    state.size,
                    data.len(),
                    self.limit
                ),
                MuxErrorKind::BufferFullError,
            ));
        }
        state.size += data.len();
        state.packets.push_back(Bytes::copy_from_slice(data));
        drop(state);

        self.notify.notify_one();
        Ok(data.len())
    }

    /// Waits for the next datagram. A datagram larger than `buf` is discarded and reported
    /// as a short buffer.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                if let Some(packet) = state.packets.pop_front() {
                    state.size -= packet.len();
                    if packet.len() > buf.len() {
                        return Err(Error::new_mux(
                            format!("datagram of {} bytes does not fit", packet.len()),
                            MuxErrorKind::ShortBufferError,
                        ));
                    }
                    buf[..packet.len()].copy_from_slice(&packet);
                    return Ok(packet.len());
                }
                if state.closed {
                    return Err(Error::new_mux(
                        "buffer is closed".to_string(),
                        MuxErrorKind::BufferClosedError,
                    ));
                }
            }
            notified.await;
        }
    }

    /// Pending data can still be read after close.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        drop(state);
        self.notify.notify_waiters();
    }

    pub async fn size(&self) -> usize {
        self.state.lock().await.size
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn write_then_read_keeps_order() {
        let buffer = PacketBuffer::new(MAX_BUFFER_SIZE);
        buffer.write(&[1, 2, 3]).await.unwrap();
        buffer.write(&[4]).await.unwrap();

        let mut buf = [0u8; 16];
        let n = buffer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);
        let n = buffer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[4]);
        assert_eq!(buffer.size().await, 0);
    }

    #[tokio::test]
    async fn full_buffer_rejects_whole_datagram() {
        let buffer = PacketBuffer::new(4);
        buffer.write(&[1, 2, 3]).await.unwrap();
        let err = buffer.write(&[4, 5]).await.unwrap_err();
        assert!(matches!(
            err,
            Error::MuxError {
                kind: MuxErrorKind::BufferFullError,
                ..
            }
        ));
        assert_eq!(buffer.size().await, 3);
    }

    #[tokio::test]
    async fn close_wakes_reader() {
        let buffer = Arc::new(PacketBuffer::new(MAX_BUFFER_SIZE));
        let reader = {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                buffer.read(&mut buf).await
            })
        };
        tokio::task::yield_now().await;
        buffer.close().await;
        let res = reader.await.unwrap();
        assert!(matches!(
            res,
            Err(Error::MuxError {
                kind: MuxErrorKind::BufferClosedError,
                ..
            })
        ));
        assert!(buffer.write(&[1]).await.is_err());
    }

    #[tokio::test]
    async fn short_read_buffer() {
        let buffer = PacketBuffer::new(MAX_BUFFER_SIZE);
        buffer.write(&[1, 2, 3, 4]).await.unwrap();
        let mut buf = [0u8; 2];
        assert!(buffer.read(&mut buf).await.is_err());
        assert_eq!(buffer.size().await, 0);
    }
}
