use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use tracing::{debug, error, info, trace, warn};

use crate::fault_injection::{set_recv_timeout, FaultInjector, InjectionOutcome};
use crate::fault_rules::{FaultRuleQueue, TransferKind};
use crate::packet::RawPacket;
use crate::relay_config::RelayConfig;
use crate::session::Session;
use crate::socket::DatagramSocket;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RelayState {
    /// waiting for the next packet from either client or server
    AwaitPacket,
    /// a packet is in hand, to be forwarded (or faulted) next
    ForwardOrFault {
        packet: RawPacket,
        destination: SocketAddr,
    },
}

/// Relays a single transfer between a client and a server, passing every packet through the
///  [FaultInjector].
///
/// The client's first request arrives on the client-facing socket and is forwarded to the
///  server's well-known port. Everything after that - in both directions - goes through the
///  general purpose socket, with the client's and the server's transport endpoints learned
///  along the way.
///
/// There is no terminal state: once started, the relay handles its session until the process is
///  stopped. It handles exactly one session.
pub struct RelaySession {
    config: Arc<RelayConfig>,
    client_socket: Box<dyn DatagramSocket>,
    general_socket: Box<dyn DatagramSocket>,
    injector: FaultInjector,
    consecutive_recv_errors: u32,
}
impl Debug for RelaySession {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RelaySession{{client_socket:{:?}, general_socket:{:?}}}", self.client_socket.local_addr().ok(), self.general_socket.local_addr().ok())
    }
}

impl RelaySession {
    pub fn new(config: Arc<RelayConfig>, client_socket: Box<dyn DatagramSocket>, general_socket: Box<dyn DatagramSocket>, fault_rules: FaultRuleQueue) -> RelaySession {
        RelaySession {
            config: config.clone(),
            client_socket,
            general_socket,
            injector: FaultInjector::new(config, fault_rules),
            consecutive_recv_errors: 0,
        }
    }

    pub fn client_socket_addr(&self) -> anyhow::Result<SocketAddr> {
        self.client_socket.local_addr()
    }

    pub fn general_socket_addr(&self) -> anyhow::Result<SocketAddr> {
        self.general_socket.local_addr()
    }

    pub fn fault_rules(&self) -> &FaultRuleQueue {
        self.injector.fault_rules()
    }

    /// Runs the session: wait for the client's request, then relay indefinitely. This returns
    ///  only if the sockets fail persistently.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let (mut session, mut state) = self.accept_request().await?;
        loop {
            state = self.step(&mut session, state).await?;
        }
    }

    /// Receives the session's first request on the client-facing socket, orders the fault rules
    ///  for the request's transfer kind, and learns the client's endpoint. The request itself is
    ///  returned for forwarding to the server's well-known port.
    pub async fn accept_request(&mut self) -> anyhow::Result<(Session, RelayState)> {
        info!(addr = ?self.client_socket.local_addr().ok(), "waiting for a request");
        set_recv_timeout(self.client_socket.as_mut(), None);

        let request = loop {
            match self.client_socket.recv_from().await {
                Ok(Some(request)) => break request,
                Ok(None) => trace!("timeout waiting for request - retrying"),
                Err(e) => self.on_recv_error(e)?,
            }
        };
        self.consecutive_recv_errors = 0;
        info!("first packet received");
        self.log_received(&request);

        let msg = request.parse();
        let transfer_kind = TransferKind::of_request(&msg);
        match transfer_kind {
            Some(transfer_kind) => self.injector.fault_rules_mut().sort_for(transfer_kind),
            None => warn!(%msg, "first packet is not a read or write request - fault rules stay in the order they were entered"),
        }

        let session = Session::new(request.source, self.config.server_addr, transfer_kind);
        let destination = session.server_bound_destination();
        Ok((session, RelayState::ForwardOrFault { packet: request, destination }))
    }

    /// a single state transition
    pub async fn step(&mut self, session: &mut Session, state: RelayState) -> anyhow::Result<RelayState> {
        match state {
            RelayState::AwaitPacket => self.await_packet(session).await,
            RelayState::ForwardOrFault { packet, destination } => {
                let outcome = self.injector.process(session, self.general_socket.as_mut(), packet, destination).await;
                Ok(match outcome {
                    InjectionOutcome::Done => RelayState::AwaitPacket,
                    InjectionOutcome::Pending { packet, destination } => RelayState::ForwardOrFault { packet, destination },
                })
            }
        }
    }

    async fn await_packet(&mut self, session: &mut Session) -> anyhow::Result<RelayState> {
        let packet = match self.general_socket.recv_from().await {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                trace!("receive timed out - retrying");
                return Ok(RelayState::AwaitPacket);
            }
            Err(e) => {
                self.on_recv_error(e)?;
                return Ok(RelayState::AwaitPacket);
            }
        };
        self.consecutive_recv_errors = 0;
        self.log_received(&packet);

        match session.route(packet.source) {
            Some(destination) => Ok(RelayState::ForwardOrFault { packet, destination }),
            None => {
                warn!(?packet, "ignoring packet from unknown endpoint");
                set_recv_timeout(self.general_socket.as_mut(), None);
                Ok(RelayState::AwaitPacket)
            }
        }
    }

    fn on_recv_error(&mut self, e: anyhow::Error) -> anyhow::Result<()> {
        self.consecutive_recv_errors += 1;
        error!(consecutive_errors = self.consecutive_recv_errors, "error receiving packet: {}", e);

        if self.consecutive_recv_errors >= self.config.max_consecutive_recv_errors {
            return Err(anyhow!("giving up after {} consecutive receive errors: {}", self.consecutive_recv_errors, e));
        }
        Ok(())
    }

    fn log_received(&self, packet: &RawPacket) {
        if self.config.verbose {
            info!("received packet\n{}", packet.dump());
        }
        else {
            debug!(?packet, "received packet");
        }
    }
}
