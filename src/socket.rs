use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::trace;

use crate::packet::{RawPacket, MAX_PACKET_SIZE};

/// A datagram socket with a receive timeout that is part of the socket's (mutable) state rather
///  than a per-call parameter: whoever sets a timeout is responsible for resetting it to
///  `None` (i.e. unbounded) afterwards.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync {
    fn local_addr(&self) -> anyhow::Result<SocketAddr>;

    fn recv_timeout(&self) -> Option<Duration>;

    /// A zero timeout is rejected
    fn set_recv_timeout(&mut self, timeout: Option<Duration>) -> anyhow::Result<()>;

    /// Returns `Ok(None)` if the receive timeout elapsed without a datagram arriving. Datagrams
    ///  exceeding [MAX_PACKET_SIZE] are truncated.
    async fn recv_from(&self) -> anyhow::Result<Option<RawPacket>>;

    async fn send_to(&self, payload: &[u8], to: SocketAddr) -> anyhow::Result<()>;
}


pub struct UdpDatagramSocket {
    inner: UdpSocket,
    recv_timeout: Option<Duration>,
}
impl Debug for UdpDatagramSocket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "UdpDatagramSocket{{{:?}}}", self.inner.local_addr().ok())
    }
}

impl UdpDatagramSocket {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<UdpDatagramSocket> {
        let inner = UdpSocket::bind(addr).await
            .map_err(|e| anyhow!("cannot bind UDP socket to {}: {}", addr, e))?;
        trace!(local_addr = ?inner.local_addr()?, "bound UDP socket");
        Ok(UdpDatagramSocket {
            inner,
            recv_timeout: None,
        })
    }
}

#[async_trait]
impl DatagramSocket for UdpDatagramSocket {
    fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    fn recv_timeout(&self) -> Option<Duration> {
        self.recv_timeout
    }

    fn set_recv_timeout(&mut self, timeout: Option<Duration>) -> anyhow::Result<()> {
        if timeout == Some(Duration::ZERO) {
            return Err(anyhow!("zero receive timeout"));
        }
        self.recv_timeout = timeout;
        Ok(())
    }

    async fn recv_from(&self) -> anyhow::Result<Option<RawPacket>> {
        let mut buf = [0u8; MAX_PACKET_SIZE];

        let received = match self.recv_timeout {
            None => self.inner.recv_from(&mut buf).await,
            Some(timeout) => match tokio::time::timeout(timeout, self.inner.recv_from(&mut buf)).await {
                Ok(r) => r,
                Err(_) => {
                    trace!(?timeout, "receive timed out");
                    return Ok(None);
                }
            }
        };

        let (len, from) = received?;
        Ok(Some(RawPacket::new(from, Bytes::copy_from_slice(&buf[..len]))))
    }

    async fn send_to(&self, payload: &[u8], to: SocketAddr) -> anyhow::Result<()> {
        self.inner.send_to(payload, to).await?;
        Ok(())
    }
}
