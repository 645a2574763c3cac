use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use anyhow::anyhow;

/// the well-known port clients send their initial request to
pub const CLIENT_RECEIVE_PORT: u16 = 23;
/// the server's well-known port
pub const SERVER_RECEIVE_PORT: u16 = 69;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// the client-facing socket: it is used for the very first request of a session only
    pub client_listen_addr: SocketAddr,
    /// where the first request is forwarded to. The server answers from a different port, which
    ///  is learned from its first reply
    pub server_addr: SocketAddr,
    /// the general purpose socket that talks to both client and server after the first request
    pub general_bind_addr: SocketAddr,

    /// A delayed packet is held back by waiting on the socket in polls of (at most) this
    ///  duration, forwarding other traffic that arrives in the meantime
    pub poll_interval: Duration,
    /// after sending a duplicate: how long to wait for the receiver's reaction to it
    pub duplicate_response_timeout: Duration,

    /// the relay gives up after this many receive errors in a row
    pub max_consecutive_recv_errors: u32,

    /// log every packet's contents at INFO level
    pub verbose: bool,
}

impl RelayConfig {
    pub fn new(server_addr: SocketAddr) -> RelayConfig {
        RelayConfig {
            client_listen_addr: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, CLIENT_RECEIVE_PORT).into(),
            server_addr,
            general_bind_addr: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into(),
            poll_interval: Duration::from_secs(5),
            duplicate_response_timeout: Duration::from_millis(50),
            max_consecutive_recv_errors: 10,
            verbose: false,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poll_interval.is_zero() {
            return Err(anyhow!("poll interval must be positive"));
        }
        if self.duplicate_response_timeout.is_zero() {
            return Err(anyhow!("duplicate response timeout must be positive"));
        }
        if self.max_consecutive_recv_errors == 0 {
            return Err(anyhow!("max consecutive receive errors must be at least 1"));
        }
        Ok(())
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig::new(SocketAddrV4::new(Ipv4Addr::LOCALHOST, SERVER_RECEIVE_PORT).into())
    }
}
