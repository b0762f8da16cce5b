use std::{net::SocketAddr, sync::Arc};

use derivative::Derivative;

use super::{live_conn, remove_endpoint, Conn, EndpointTable, PacketBuffer, SharedConn};
use crate::error::Error;

/// Read side of one demultiplexed stream. Writes go straight to the shared connection
/// until the mux is closed.
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct Endpoint<C: Conn> {
    id: u64,
    buffer: Arc<PacketBuffer>,
    #[derivative(Debug = "ignore")]
    conn: SharedConn<C>,
    #[derivative(Debug = "ignore")]
    endpoints: EndpointTable,
}

impl<C: Conn> Endpoint<C> {
    pub(crate) fn new(
        id: u64,
        buffer: Arc<PacketBuffer>,
        conn: SharedConn<C>,
        endpoints: EndpointTable,
    ) -> Self {
        Self {
            id,
            buffer,
            conn,
            endpoints,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Reads one datagram accepted by this endpoint's matcher.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        self.buffer.read(buf).await
    }

    pub async fn write(&self, buf: &[u8]) -> Result<usize, Error> {
        let conn = live_conn(&self.conn).await?;
        let n = conn.send(buf).await?;
        Ok(n)
    }

    pub async fn write_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize, Error> {
        let conn = live_conn(&self.conn).await?;
        let n = conn.send_to(buf, target).await?;
        Ok(n)
    }

    pub async fn local_addr(&self) -> Result<SocketAddr, Error> {
        let conn = live_conn(&self.conn).await?;
        Ok(conn.local_addr()?)
    }

    /// Closes the buffer and unregisters the endpoint from its mux.
    pub async fn close(&self) {
        self.buffer.close().await;
        remove_endpoint(&self.endpoints, self.id).await;
        tracing::debug!("Mux endpoint id={} is closed", self.id);
    }
}
