use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::fault_rules::{FaultKind, FaultRule, FaultRuleQueue};
use crate::packet::RawPacket;
use crate::relay_config::RelayConfig;
use crate::session::Session;
use crate::socket::DatagramSocket;

/// What is left for the relay loop to do after a packet was processed
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum InjectionOutcome {
    /// the packet was dealt with, the relay can wait for the next one
    Done,
    /// a packet was received while carrying out a fault, and it still needs to be processed
    Pending {
        packet: RawPacket,
        destination: SocketAddr,
    },
}

/// Decides for every packet the relay would forward whether it is the target of the current
///  fault rule, and either forwards it unchanged or delays, duplicates or drops it.
///
/// Only the head of the rule queue is ever considered, and a rule is removed when it fires, so
///  every rule applies to at most one packet.
pub struct FaultInjector {
    config: Arc<RelayConfig>,
    fault_rules: FaultRuleQueue,
}

impl FaultInjector {
    pub fn new(config: Arc<RelayConfig>, fault_rules: FaultRuleQueue) -> FaultInjector {
        FaultInjector {
            config,
            fault_rules,
        }
    }

    pub fn fault_rules(&self) -> &FaultRuleQueue {
        &self.fault_rules
    }

    pub fn fault_rules_mut(&mut self) -> &mut FaultRuleQueue {
        &mut self.fault_rules
    }

    pub async fn process(&mut self, session: &mut Session, socket: &mut dyn DatagramSocket, packet: RawPacket, destination: SocketAddr) -> InjectionOutcome {
        let msg = packet.parse();

        let rule = match self.fault_rules.peek_current() {
            Some(rule) if rule.matches(&msg) => *rule,
            Some(rule) => {
                trace!(%msg, %rule, "not the targeted packet - sending normally");
                self.forward(session, socket, packet, destination).await;
                return InjectionOutcome::Done;
            }
            None => {
                self.forward(session, socket, packet, destination).await;
                return InjectionOutcome::Done;
            }
        };

        self.fault_rules.remove_current();
        info!(%msg, %rule, "packet matches fault rule");

        match rule.kind {
            FaultKind::Delay(magnitude) => self.delay(session, socket, packet, destination, magnitude).await,
            FaultKind::Duplicate => self.duplicate(session, socket, packet, destination, rule).await,
            FaultKind::Lose => self.lose(packet),
        }
    }

    /// Sends a copy of the packet's payload to `destination`. Send failures are logged and the
    ///  packet is abandoned, returning `false`.
    pub async fn forward(&self, session: &mut Session, socket: &dyn DatagramSocket, packet: RawPacket, destination: SocketAddr) -> bool {
        if self.config.verbose {
            info!("sending packet to {:?}\n{}", destination, packet.dump());
        }
        else {
            debug!(?packet, ?destination, "sending packet");
        }

        match socket.send_to(&packet.payload, destination).await {
            Ok(()) => {
                session.record_forwarded(packet);
                true
            }
            Err(e) => {
                error!(?packet, ?destination, "error sending packet - abandoning it: {}", e);
                false
            }
        }
    }

    /// Holds the packet back for `magnitude`, waiting on the socket in polls of at most the
    ///  configured poll interval. A packet arriving during a poll is forwarded right away, so the
    ///  rest of the transfer keeps moving, and it ends that poll: the poll's full length counts
    ///  as waited. The delayed packet is forwarded after the last poll; it is never dropped.
    async fn delay(&self, session: &mut Session, socket: &mut dyn DatagramSocket, packet: RawPacket, destination: SocketAddr, magnitude: Duration) -> InjectionOutcome {
        info!(?magnitude, "delaying packet");

        let mut remaining = magnitude;
        while !remaining.is_zero() {
            let poll = remaining.min(self.config.poll_interval);
            set_recv_timeout(socket, Some(poll));

            let poll_start = Instant::now();
            match socket.recv_from().await {
                Ok(Some(other)) => {
                    debug!(?remaining, "received a packet while delaying");
                    if !self.forward_routed(session, socket, other).await {
                        // strays do not end the poll
                        remaining = remaining.saturating_sub(poll_start.elapsed());
                        continue;
                    }
                }
                Ok(None) => {
                    trace!(?poll, "nothing received during poll");
                }
                Err(e) => {
                    error!("error receiving while delaying a packet: {}", e);
                    // a failing socket may fail right away: wait out the poll anyway
                    sleep_until(poll_start + poll).await;
                }
            }
            remaining = remaining.saturating_sub(poll);
        }
        set_recv_timeout(socket, None);

        info!("delay elapsed, sending delayed packet");
        self.forward(session, socket, packet, destination).await;
        InjectionOutcome::Done
    }

    /// Forwards the packet, waits for the receiver's response, and then sends the receiver a
    ///  second copy of the packet.
    ///
    /// If the receiver reacts to the duplicate within the configured timeout, that reaction is
    ///  forwarded instead of the first response (they are answers to the same packet). If it
    ///  does not react, the duplicate attempt is undone: the first response is handed back to
    ///  the relay loop as if it had just been received. Either way, exactly one response is
    ///  forwarded.
    async fn duplicate(&self, session: &mut Session, socket: &mut dyn DatagramSocket, packet: RawPacket, destination: SocketAddr, rule: FaultRule) -> InjectionOutcome {
        if !self.forward(session, socket, packet, destination).await {
            warn!(%rule, "the packet to be duplicated could not be sent - skipping the duplicate");
            return InjectionOutcome::Done;
        }
        let Some(duplicate) = session.last_forwarded().cloned() else {
            return InjectionOutcome::Done;
        };

        let Some((response, response_destination)) = self.await_response(session, socket).await else {
            return InjectionOutcome::Done;
        };
        debug!(?response, "received response to the packet to be duplicated");

        // the first packet's destination rather than the response's source: a duplicated
        //  request goes to the server's well-known port again
        info!(?destination, "sending duplicate");
        self.forward(session, socket, duplicate, destination).await;

        set_recv_timeout(socket, Some(self.config.duplicate_response_timeout));
        let further = socket.recv_from().await;
        set_recv_timeout(socket, None);

        let further = match further {
            Ok(Some(further)) => further,
            Ok(None) => {
                info!("no reaction to the duplicate - rolling back to the first response");
                return InjectionOutcome::Pending { packet: response, destination: response_destination };
            }
            Err(e) => {
                error!("error receiving reaction to duplicate - rolling back to the first response: {}", e);
                return InjectionOutcome::Pending { packet: response, destination: response_destination };
            }
        };

        let Some(further_destination) = session.route(further.source) else {
            warn!(?further, "ignoring packet from unknown endpoint - rolling back to the first response");
            return InjectionOutcome::Pending { packet: response, destination: response_destination };
        };

        if further.source == response.source {
            debug!(?further, "receiver reacted to the duplicate - sending its reaction");
            self.forward(session, socket, further, further_destination).await;
            InjectionOutcome::Done
        }
        else {
            // the other side spoke first: keep arrival order
            self.forward(session, socket, response, response_destination).await;
            InjectionOutcome::Pending { packet: further, destination: further_destination }
        }
    }

    /// unbounded wait for the next packet from a known endpoint
    async fn await_response(&self, session: &mut Session, socket: &dyn DatagramSocket) -> Option<(RawPacket, SocketAddr)> {
        loop {
            match socket.recv_from().await {
                Ok(Some(response)) => match session.route(response.source) {
                    Some(destination) => return Some((response, destination)),
                    None => warn!(?response, "ignoring packet from unknown endpoint"),
                }
                Ok(None) => {}
                Err(e) => {
                    error!("error waiting for response - abandoning the duplicate: {}", e);
                    return None;
                }
            }
        }
    }

    fn lose(&self, packet: RawPacket) -> InjectionOutcome {
        info!(?packet, "losing packet");
        InjectionOutcome::Done
    }

    /// `false` if the packet is from an unknown endpoint and was ignored
    async fn forward_routed(&self, session: &mut Session, socket: &dyn DatagramSocket, packet: RawPacket) -> bool {
        match session.route(packet.source) {
            Some(destination) => {
                self.forward(session, socket, packet, destination).await;
                true
            }
            None => {
                warn!(?packet, "ignoring packet from unknown endpoint");
                false
            }
        }
    }
}

/// failure to set a timeout is logged, and the relay continues with whatever timeout the socket has
pub fn set_recv_timeout(socket: &mut dyn DatagramSocket, timeout: Option<Duration>) {
    if let Err(e) = socket.set_recv_timeout(timeout) {
        warn!(?timeout, "cannot set socket timeout: {}", e);
    }
}


#[cfg(test)]
mod test {
    use std::net::SocketAddr;
    use std::time::Duration;

    use rstest::rstest;

    use super::*;
    use crate::fault_rules::TransferKind;
    use crate::socket::MockDatagramSocket;
    use crate::test_util::packets::{ack, data, read_request};
    use crate::test_util::scripted_socket::ScriptedSocket;

    const DATA: u16 = 3;
    const ACK: u16 = 4;

    fn client() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }
    fn server_well_known() -> SocketAddr {
        "127.0.0.1:69".parse().unwrap()
    }
    fn server() -> SocketAddr {
        "127.0.0.1:7000".parse().unwrap()
    }
    fn relay() -> SocketAddr {
        "127.0.0.1:6000".parse().unwrap()
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    /// a read session where the server's endpoint is already known
    fn session() -> Session {
        let mut session = Session::new(client(), server_well_known(), Some(TransferKind::Read));
        session.route(server());
        session
    }

    fn injector(rules: Vec<FaultRule>) -> FaultInjector {
        let mut queue = FaultRuleQueue::new();
        for rule in rules {
            queue.push(rule);
        }
        queue.sort_for(TransferKind::Read);
        FaultInjector::new(Arc::new(RelayConfig::default()), queue)
    }

    fn data_from_server(block: u16) -> RawPacket {
        RawPacket::new(server(), data(block, b"payload"))
    }

    #[rstest]
    #[case::no_rules(vec![])]
    #[case::other_block(vec![FaultRule::new(FaultKind::Lose, DATA, 2)])]
    #[case::other_opcode(vec![FaultRule::new(FaultKind::Lose, ACK, 1)])]
    #[tokio::test(start_paused = true)]
    async fn test_plain_forward(#[case] rules: Vec<FaultRule>) {
        let num_rules = rules.len();
        let mut injector = injector(rules);
        let mut session = session();
        let mut socket = ScriptedSocket::new(relay());
        let sent = socket.sent_log();

        let outcome = injector.process(&mut session, &mut socket, data_from_server(1), client()).await;

        assert_eq!(outcome, InjectionOutcome::Done);
        assert_eq!(sent.snapshot().len(), 1);
        assert_eq!(sent.snapshot()[0].to, client());
        assert_eq!(sent.snapshot()[0].payload, data(1, b"payload"));
        assert_eq!(session.last_forwarded(), Some(&data_from_server(1)));
        assert_eq!(injector.fault_rules().len(), num_rules);
    }

    #[tokio::test]
    async fn test_lose_does_not_touch_the_socket() {
        let mut injector = injector(vec![FaultRule::new(FaultKind::Lose, DATA, 1)]);
        let mut session = session();
        // no expectations: any socket operation fails the test
        let mut socket = MockDatagramSocket::new();

        let outcome = injector.process(&mut session, &mut socket, data_from_server(1), client()).await;

        assert_eq!(outcome, InjectionOutcome::Done);
        assert!(injector.fault_rules().is_empty());
        assert!(session.last_forwarded().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rule_fires_only_once() {
        let mut injector = injector(vec![FaultRule::new(FaultKind::Lose, DATA, 1)]);
        let mut session = session();
        let mut socket = ScriptedSocket::new(relay());
        let sent = socket.sent_log();

        injector.process(&mut session, &mut socket, data_from_server(1), client()).await;
        assert!(sent.snapshot().is_empty());

        injector.process(&mut session, &mut socket, data_from_server(1), client()).await;
        assert_eq!(sent.sent_to(client()).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_send_is_abandoned() {
        let mut injector = injector(vec![]);
        let mut session = session();
        let mut socket = ScriptedSocket::new(relay())
            .failing_sends_to(client());

        let outcome = injector.process(&mut session, &mut socket, data_from_server(1), client()).await;
        assert_eq!(outcome, InjectionOutcome::Done);
        assert!(session.last_forwarded().is_none());
    }

    #[rstest]
    #[case::less_than_a_poll(3)]
    #[case::one_poll(5)]
    #[case::several_polls(12)]
    #[case::long(125)]
    #[tokio::test(start_paused = true)]
    async fn test_delay_without_other_traffic(#[case] delay_secs: u64) {
        let mut injector = injector(vec![FaultRule::new(FaultKind::Delay(secs(delay_secs)), DATA, 1)]);
        let mut session = session();
        let mut socket = ScriptedSocket::new(relay());
        let sent = socket.sent_log();

        let outcome = injector.process(&mut session, &mut socket, data_from_server(1), client()).await;

        assert_eq!(outcome, InjectionOutcome::Done);
        let sent = sent.snapshot();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, client());
        assert_eq!(sent[0].payload, data(1, b"payload"));
        assert!(sent[0].at >= secs(delay_secs));
        assert!(sent[0].at <= secs(delay_secs) + RelayConfig::default().poll_interval);
        assert_eq!(socket.recv_timeout(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_forwards_other_traffic_first() {
        let mut injector = injector(vec![FaultRule::new(FaultKind::Delay(secs(10)), DATA, 2)]);
        let mut session = session();
        let mut socket = ScriptedSocket::new(relay())
            .deliver(secs(3), client(), ack(1));
        let sent = socket.sent_log();

        injector.process(&mut session, &mut socket, data_from_server(2), client()).await;

        let sent = sent.snapshot();
        assert_eq!(sent.len(), 2);

        assert_eq!(sent[0].to, server());
        assert_eq!(sent[0].payload, ack(1));
        assert_eq!(sent[0].at, secs(3));

        // the ACK ended the first poll, so only one more poll is left
        assert_eq!(sent[1].to, client());
        assert_eq!(sent[1].payload, data(2, b"payload"));
        assert_eq!(sent[1].at, secs(8));
        assert_eq!(socket.recv_timeout(), None);
        assert_eq!(socket.remaining_inbound(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_waits_out_polls_when_receiving_fails() {
        let mut injector = injector(vec![FaultRule::new(FaultKind::Delay(secs(12)), DATA, 1)]);
        let mut session = session();
        let mut socket = ScriptedSocket::new(relay())
            .failing_receives();
        let sent = socket.sent_log();

        let outcome = injector.process(&mut session, &mut socket, data_from_server(1), client()).await;

        assert_eq!(outcome, InjectionOutcome::Done);
        let sent = sent.snapshot();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].at, secs(12));
        assert_eq!(socket.recv_timeout(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_ignores_unknown_endpoints() {
        let stranger: SocketAddr = "10.1.1.1:999".parse().unwrap();
        let mut injector = injector(vec![FaultRule::new(FaultKind::Delay(secs(4)), DATA, 1)]);
        let mut session = session();
        let mut socket = ScriptedSocket::new(relay())
            .deliver(secs(1), stranger, ack(1));
        let sent = socket.sent_log();

        injector.process(&mut session, &mut socket, data_from_server(1), client()).await;

        let sent = sent.snapshot();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, client());
        assert_eq!(sent[0].at, secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_with_reaction() {
        let mut injector = injector(vec![FaultRule::new(FaultKind::Duplicate, DATA, 1)]);
        let mut session = session();
        let mut socket = ScriptedSocket::new(relay())
            .deliver(secs(1), client(), ack(1))
            .deliver(secs(1) + Duration::from_millis(10), client(), ack(1));
        let sent = socket.sent_log();

        let outcome = injector.process(&mut session, &mut socket, data_from_server(1), client()).await;

        assert_eq!(outcome, InjectionOutcome::Done);
        let sent = sent.snapshot();
        assert_eq!(sent.len(), 3);
        assert_eq!((sent[0].to, sent[0].payload.clone(), sent[0].at), (client(), data(1, b"payload"), secs(0)));
        assert_eq!((sent[1].to, sent[1].payload.clone(), sent[1].at), (client(), data(1, b"payload"), secs(1)));
        assert_eq!((sent[2].to, sent[2].payload.clone()), (server(), ack(1)));
        assert_eq!(socket.recv_timeout(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_without_reaction_rolls_back() {
        let mut injector = injector(vec![FaultRule::new(FaultKind::Duplicate, DATA, 1)]);
        let mut session = session();
        let mut socket = ScriptedSocket::new(relay())
            .deliver(secs(1), client(), ack(1));
        let sent = socket.sent_log();

        let outcome = injector.process(&mut session, &mut socket, data_from_server(1), client()).await;

        assert_eq!(outcome, InjectionOutcome::Pending {
            packet: RawPacket::new(client(), ack(1)),
            destination: server(),
        });
        let sent = sent.snapshot();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|d| d.to == client() && d.payload == data(1, b"payload")));
        assert_eq!(socket.recv_timeout(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_keeps_arrival_order_when_other_side_speaks() {
        let mut injector = injector(vec![FaultRule::new(FaultKind::Duplicate, DATA, 1)]);
        let mut session = session();
        let mut socket = ScriptedSocket::new(relay())
            .deliver(secs(1), client(), ack(1))
            .deliver(secs(1) + Duration::from_millis(20), server(), data(2, b"more"));
        let sent = socket.sent_log();

        let outcome = injector.process(&mut session, &mut socket, data_from_server(1), client()).await;

        assert_eq!(outcome, InjectionOutcome::Pending {
            packet: RawPacket::new(server(), data(2, b"more")),
            destination: client(),
        });
        let sent = sent.snapshot();
        assert_eq!(sent.len(), 3);
        assert_eq!((sent[2].to, sent[2].payload.clone()), (server(), ack(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_request_learns_server() {
        let mut injector = injector(vec![FaultRule::new(FaultKind::Duplicate, 1, 0)]);
        let mut session = Session::new(client(), server_well_known(), Some(TransferKind::Read));
        let mut socket = ScriptedSocket::new(relay())
            .deliver(secs(1), server(), data(1, b"first"));
        let sent = socket.sent_log();

        let outcome = injector.process(&mut session, &mut socket, RawPacket::new(client(), read_request("f", "octet")), server_well_known()).await;

        assert_eq!(session.server(), Some(server()));
        assert_eq!(sent.sent_to(server_well_known()).len(), 2);
        assert_eq!(outcome, InjectionOutcome::Pending {
            packet: RawPacket::new(server(), data(1, b"first")),
            destination: client(),
        });
    }
}
