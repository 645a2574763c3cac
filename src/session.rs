use std::net::SocketAddr;

use tracing::{debug, info};

use crate::fault_rules::TransferKind;
use crate::packet::RawPacket;

/// The state of the single transfer a relay handles: the two learned transport endpoints (TIDs)
///  and the most recently forwarded packet.
///
/// The client endpoint is known from the first request. The server replies from a fresh port
///  rather than its well-known one, so its endpoint is learned from the first packet that
///  arrives from the server's address. Once learned, neither endpoint changes.
#[derive(Debug)]
pub struct Session {
    server_well_known: SocketAddr,
    client: SocketAddr,
    server: Option<SocketAddr>,
    transfer_kind: Option<TransferKind>,
    last_forwarded: Option<RawPacket>,
}

impl Session {
    pub fn new(client: SocketAddr, server_well_known: SocketAddr, transfer_kind: Option<TransferKind>) -> Session {
        info!(?client, ?transfer_kind, "starting session");
        Session {
            server_well_known,
            client,
            server: None,
            transfer_kind,
            last_forwarded: None,
        }
    }

    pub fn client(&self) -> SocketAddr {
        self.client
    }

    pub fn server(&self) -> Option<SocketAddr> {
        self.server
    }

    pub fn transfer_kind(&self) -> Option<TransferKind> {
        self.transfer_kind
    }

    /// where packets from the client go: the server's well-known port until its transfer
    ///  endpoint is known
    pub fn server_bound_destination(&self) -> SocketAddr {
        self.server.unwrap_or(self.server_well_known)
    }

    /// Determines where a packet from `source` must be forwarded to, learning the server's
    ///  endpoint if this is the first packet from the server's address. Returns `None` for
    ///  packets from unrelated endpoints.
    pub fn route(&mut self, source: SocketAddr) -> Option<SocketAddr> {
        if source == self.client {
            return Some(self.server_bound_destination());
        }

        match self.server {
            Some(server) if server == source => Some(self.client),
            Some(_) => None,
            None if self.is_server_address(source) => {
                info!(server = ?source, "learned server endpoint");
                self.server = Some(source);
                Some(self.client)
            }
            None => None,
        }
    }

    fn is_server_address(&self, source: SocketAddr) -> bool {
        let server_ip = self.server_well_known.ip();
        server_ip.is_unspecified() || server_ip == source.ip()
    }

    pub fn record_forwarded(&mut self, packet: RawPacket) {
        debug!(?packet, "forwarded");
        self.last_forwarded = Some(packet);
    }

    pub fn last_forwarded(&self) -> Option<&RawPacket> {
        self.last_forwarded.as_ref()
    }
}
