use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::{broadcast, RwLock};

use super::{Buffer, RtcpReader};

/// Creates and tracks the [`Buffer`] and [`RtcpReader`] of every SSRC seen by a worker.
/// Entries nobody binds are dropped by [`BufferFactory::evict_unbound`].
#[derive(Debug, Default)]
pub struct BufferFactory {
    buffers: RwLock<HashMap<u32, Arc<Buffer>>>,
    rtcp_readers: RwLock<HashMap<u32, Arc<RtcpReader>>>,
}

impl BufferFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_new_buffer(&self, ssrc: u32) -> Arc<Buffer> {
        {
            let buffers = self.buffers.read().await;
            if let Some(buffer) = buffers.get(&ssrc) {
                return buffer.clone();
            }
        }
        let mut buffers = self.buffers.write().await;
        buffers
            .entry(ssrc)
            .or_insert_with(|| Arc::new(Buffer::new(ssrc)))
            .clone()
    }

    pub async fn get_or_new_rtcp_reader(&self, ssrc: u32) -> Arc<RtcpReader> {
        {
            let readers = self.rtcp_readers.read().await;
            if let Some(reader) = readers.get(&ssrc) {
                return reader.clone();
            }
        }
        let mut readers = self.rtcp_readers.write().await;
        readers
            .entry(ssrc)
            .or_insert_with(|| Arc::new(RtcpReader::new(ssrc)))
            .clone()
    }

    /// Pair for a publisher about to bind `ssrc`.
    pub async fn get_buffer_pair(&self, ssrc: u32) -> (Arc<Buffer>, Arc<RtcpReader>) {
        let buffer = self.get_or_new_buffer(ssrc).await;
        buffer.touch().await;
        let reader = self.get_or_new_rtcp_reader(ssrc).await;
        (buffer, reader)
    }

    pub async fn get_buffer(&self, ssrc: u32) -> Option<Arc<Buffer>> {
        self.buffers.read().await.get(&ssrc).cloned()
    }

    pub async fn buffer_count(&self) -> usize {
        self.buffers.read().await.len()
    }

    pub async fn rtcp_reader_count(&self) -> usize {
        self.rtcp_readers.read().await.len()
    }

    /// Closes and forgets buffers never bound and readers never registered for, once they
    /// have been idle for `ttl`. Returns how many entries were dropped.
    pub async fn evict_unbound(&self, ttl: Duration) -> usize {
        let mut evicted = 0;

        let candidates: Vec<Arc<Buffer>> = self.buffers.read().await.values().cloned().collect();
        for buffer in candidates {
            if !buffer.is_idle_unbound(ttl).await {
                continue;
            }
            let removed = {
                let mut buffers = self.buffers.write().await;
                let same = buffers
                    .get(&buffer.ssrc())
                    .is_some_and(|b| Arc::ptr_eq(b, &buffer));
                same && buffer.is_idle_unbound(ttl).await && buffers.remove(&buffer.ssrc()).is_some()
            };
            if removed {
                buffer.close().await;
                evicted += 1;
            }
        }

        let candidates: Vec<Arc<RtcpReader>> =
            self.rtcp_readers.read().await.values().cloned().collect();
        for reader in candidates {
            if !reader.is_idle_unbound(ttl).await {
                continue;
            }
            let removed = {
                let mut readers = self.rtcp_readers.write().await;
                let same = readers
                    .get(&reader.ssrc())
                    .is_some_and(|r| Arc::ptr_eq(r, &reader));
                same && reader.is_idle_unbound(ttl).await && readers.remove(&reader.ssrc()).is_some()
            };
            if removed {
                reader.close().await;
                evicted += 1;
            }
        }

        if evicted > 0 {
            tracing::debug!("BufferFactory evicted {} unbound entries", evicted);
        }
        evicted
    }

    /// Runs [`BufferFactory::evict_unbound`] every `ttl / 2` until `closed_receiver` fires.
    pub async fn sweep_loop(
        self: Arc<Self>,
        ttl: Duration,
        mut closed_receiver: broadcast::Receiver<bool>,
    ) {
        let period = (ttl / 2).max(Duration::from_millis(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = closed_receiver.recv() => {
                    break;
                }
                _ = interval.tick() => {
                    self.evict_unbound(ttl).await;
                }
            }
        }
        tracing::debug!("BufferFactory sweep loop has finished");
    }

    /// Closes and forgets both collaborators of `ssrc`.
    pub async fn remove(&self, ssrc: u32) {
        let buffer = self.buffers.write().await.remove(&ssrc);
        if let Some(buffer) = buffer {
            buffer.close().await;
        }
        let reader = self.rtcp_readers.write().await.remove(&ssrc);
        if let Some(reader) = reader {
            reader.close().await;
        }
    }

    pub async fn close(&self) {
        let buffers: Vec<Arc<Buffer>> = self.buffers.write().await.drain().map(|(_, b)| b).collect();
        for buffer in buffers {
            buffer.close().await;
        }
        let readers: Vec<Arc<RtcpReader>> = self
            .rtcp_readers
            .write()
            .await
            .drain()
            .map(|(_, r)| r)
            .collect();
        for reader in readers {
            reader.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::buffer::tests::{options, rtp_bytes, vp8_params};

    #[tokio::test]
    async fn same_ssrc_same_buffer() {
        let factory = BufferFactory::new();
        let (buffer, reader) = factory.get_buffer_pair(42).await;
        assert!(Arc::ptr_eq(&buffer, &factory.get_or_new_buffer(42).await));
        assert!(Arc::ptr_eq(&reader, &factory.get_or_new_rtcp_reader(42).await));
        assert!(factory.get_buffer(43).await.is_none());

        factory.remove(42).await;
        assert!(buffer.is_closed());
        assert!(factory.get_buffer(42).await.is_none());
        let fresh = factory.get_or_new_buffer(42).await;
        assert!(!Arc::ptr_eq(&buffer, &fresh));
    }

    #[tokio::test(start_paused = true)]
    async fn evicts_only_idle_unbound_entries() {
        let factory = BufferFactory::new();
        let ttl = Duration::from_secs(2);

        let stray = factory.get_or_new_buffer(1).await;
        stray.write(&rtp_bytes(1, 1)).await.unwrap();
        let (published, published_reader) = factory.get_buffer_pair(2).await;
        published.bind(&vp8_params(None), options()).await;
        published_reader.on_packet(Box::new(|_: Bytes| {})).await;
        let stray_reader = factory.get_or_new_rtcp_reader(3).await;
        assert_eq!(factory.buffer_count().await, 2);
        assert_eq!(factory.rtcp_reader_count().await, 2);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(factory.evict_unbound(ttl).await, 0);

        // Still written to, so not idle.
        let busy = factory.get_or_new_buffer(4).await;
        tokio::time::advance(Duration::from_millis(1500)).await;
        busy.write(&rtp_bytes(4, 1)).await.unwrap();

        assert_eq!(factory.evict_unbound(ttl).await, 2);
        assert!(stray.is_closed());
        assert!(stray.write(&rtp_bytes(1, 2)).await.unwrap_err().is_buffer_closed());
        assert!(stray_reader.write(&[0x80, 200]).await.unwrap_err().is_buffer_closed());
        assert!(factory.get_buffer(1).await.is_none());
        assert!(!published.is_closed());
        assert!(factory.get_buffer(2).await.is_some());
        assert!(factory.get_buffer(4).await.is_some());
        assert_eq!(factory.rtcp_reader_count().await, 1);

        // A new packet for an evicted SSRC starts over with a fresh buffer.
        let fresh = factory.get_or_new_buffer(1).await;
        assert!(!Arc::ptr_eq(&stray, &fresh));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_loop_stops_on_close() {
        let factory = Arc::new(BufferFactory::new());
        factory.get_or_new_buffer(7).await;
        let (closed_sender, closed_receiver) = broadcast::channel(1);
        let handle = tokio::spawn(factory.clone().sweep_loop(Duration::from_millis(100), closed_receiver));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(factory.buffer_count().await, 0);

        closed_sender.send(true).unwrap();
        handle.await.unwrap();
    }
}
