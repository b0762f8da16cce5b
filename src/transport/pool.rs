use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use tokio::sync::RwLock;

use super::udp_connection::UdpConnection;
use crate::error::{Error, TransportErrorKind};

/// Shares one [`UdpConnection`] per listen address and picks the socket used to reach a
/// remote address.
#[derive(Debug, Default)]
pub struct ConnectionPool {
    inbound: RwLock<HashMap<SocketAddr, Arc<UdpConnection>>>,
    outbound: RwLock<HashMap<SocketAddr, Arc<UdpConnection>>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the connection listening on `addr`, binding it on first use.
    pub async fn acquire_listener(
        &self,
        addr: SocketAddr,
        recv_buffer_size: usize,
        send_buffer_size: usize,
    ) -> Result<Arc<UdpConnection>, Error> {
        {
            let inbound = self.inbound.read().await;
            if let Some(conn) = inbound.get(&addr) {
                return Ok(conn.clone());
            }
        }

        let mut inbound = self.inbound.write().await;
        if let Some(conn) = inbound.get(&addr) {
            return Ok(conn.clone());
        }
        let conn = UdpConnection::bind(addr, recv_buffer_size, send_buffer_size).await?;
        // Port 0 resolves to the bound port, both keys refer to the same socket.
        inbound.insert(addr, conn.clone());
        if conn.local_addr() != addr {
            inbound.insert(conn.local_addr(), conn.clone());
        }
        tracing::debug!("Listener {} is acquired", conn.local_addr());
        Ok(conn)
    }

    /// Connection used to send to `addr`.
    ///
    /// When nothing is cached yet an arbitrary listening socket is reused and remembered.
    /// With several listen addresses this may pick a socket the remote has never seen;
    /// dialing a dedicated socket is not supported.
    pub async fn resolve_outbound(&self, addr: SocketAddr) -> Result<Arc<UdpConnection>, Error> {
        {
            let outbound = self.outbound.read().await;
            if let Some(conn) = outbound.get(&addr) {
                if !conn.is_closed() {
                    return Ok(conn.clone());
                }
            }
        }

        let mut outbound = self.outbound.write().await;
        if let Some(conn) = outbound.get(&addr) {
            if !conn.is_closed() {
                return Ok(conn.clone());
            }
        }
        match self.random_connection().await {
            Some(conn) => {
                tracing::debug!(
                    "Outbound {} resolved to listener {}",
                    addr,
                    conn.local_addr()
                );
                outbound.insert(addr, conn.clone());
                Ok(conn)
            }
            None => Err(Error::new_transport(
                format!("no connection to reach {}", addr),
                TransportErrorKind::NoConnectionError,
            )),
        }
    }

    /// Any open listening connection.
    pub async fn random_connection(&self) -> Option<Arc<UdpConnection>> {
        let inbound = self.inbound.read().await;
        inbound.values().find(|conn| !conn.is_closed()).cloned()
    }

    /// Closes the listener on `addr` and forgets it, so it can be acquired again.
    pub async fn remove_listener(&self, addr: SocketAddr) {
        let removed = {
            let mut inbound = self.inbound.write().await;
            match inbound.remove(&addr) {
                Some(conn) => {
                    let local_addr = conn.local_addr();
                    inbound.retain(|_, c| !Arc::ptr_eq(c, &conn));
                    tracing::debug!("Listener {} is removed", local_addr);
                    Some(conn)
                }
                None => None,
            }
        };
        if let Some(conn) = removed {
            {
                let mut outbound = self.outbound.write().await;
                outbound.retain(|_, c| !Arc::ptr_eq(c, &conn));
            }
            conn.close().await;
        }
    }

    pub async fn listener_addrs(&self) -> Vec<SocketAddr> {
        let inbound = self.inbound.read().await;
        let mut addrs: Vec<SocketAddr> = inbound.values().map(|conn| conn.local_addr()).collect();
        addrs.sort();
        addrs.dedup();
        addrs
    }

    pub async fn close(&self) {
        let conns: Vec<Arc<UdpConnection>> = {
            let mut inbound = self.inbound.write().await;
            inbound.drain().map(|(_, conn)| conn).collect()
        };
        self.outbound.write().await.clear();
        for conn in conns {
            conn.close().await;
        }
    }
}
