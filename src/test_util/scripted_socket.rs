use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::{sleep_until, Instant};

use crate::packet::RawPacket;
use crate::socket::DatagramSocket;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SentDatagram {
    /// time since the socket was created
    pub at: Duration,
    pub to: SocketAddr,
    pub payload: Bytes,
}

/// Shared view of everything a [ScriptedSocket] sent, usable after the socket itself was moved
///  into the code under test
#[derive(Debug, Clone, Default)]
pub struct SentLog(Arc<Mutex<Vec<SentDatagram>>>);
impl SentLog {
    pub fn snapshot(&self) -> Vec<SentDatagram> {
        match self.0.lock() {
            Ok(sent) => sent.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn sent_to(&self, to: SocketAddr) -> Vec<SentDatagram> {
        self.snapshot().into_iter()
            .filter(|d| d.to == to)
            .collect()
    }

    fn push(&self, datagram: SentDatagram) {
        match self.0.lock() {
            Ok(mut sent) => sent.push(datagram),
            Err(poisoned) => poisoned.into_inner().push(datagram),
        }
    }
}

/// A [DatagramSocket] that delivers a fixed script of datagrams, each no earlier than its
///  scheduled time (measured from the socket's creation), and records everything that is sent.
///
/// It is meant to be used with tokio's paused clock (`#[tokio::test(start_paused = true)]`),
///  which makes timing assertions exact. Scripted datagrams are not reactive: a datagram is
///  delivered at its scheduled time or, if nobody was receiving then, on the next receive.
pub struct ScriptedSocket {
    local_addr: SocketAddr,
    start: Instant,
    inbound: Mutex<VecDeque<(Duration, RawPacket)>>,
    recv_timeout: Option<Duration>,
    sent: SentLog,
    fail_sends_to: Option<SocketAddr>,
    fail_receives: bool,
}

impl ScriptedSocket {
    pub fn new(local_addr: SocketAddr) -> ScriptedSocket {
        ScriptedSocket {
            local_addr,
            start: Instant::now(),
            inbound: Default::default(),
            recv_timeout: None,
            sent: Default::default(),
            fail_sends_to: None,
            fail_receives: false,
        }
    }

    /// schedule a datagram from `source`; datagrams must be scheduled in chronological order
    pub fn deliver(self, at: Duration, source: SocketAddr, payload: impl Into<Bytes>) -> ScriptedSocket {
        self.lock_inbound().push_back((at, RawPacket::new(source, payload)));
        self
    }

    /// all sends to `to` fail with an I/O error
    pub fn failing_sends_to(mut self, to: SocketAddr) -> ScriptedSocket {
        self.fail_sends_to = Some(to);
        self
    }

    /// every receive fails immediately with an I/O error
    pub fn failing_receives(mut self) -> ScriptedSocket {
        self.fail_receives = true;
        self
    }

    pub fn sent_log(&self) -> SentLog {
        self.sent.clone()
    }

    pub fn remaining_inbound(&self) -> usize {
        self.lock_inbound().len()
    }

    fn lock_inbound(&self) -> MutexGuard<'_, VecDeque<(Duration, RawPacket)>> {
        match self.inbound.lock() {
            Ok(inbound) => inbound,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl DatagramSocket for ScriptedSocket {
    fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.local_addr)
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
        if self.fail_receives {
            return Err(anyhow!("simulated receive failure"));
        }

        let deadline = self.recv_timeout.map(|t| Instant::now() + t);

        let next_at = self.lock_inbound().front().map(|(at, _)| *at);
        let due = match next_at {
            Some(at) => self.start + at,
            None => match deadline {
                Some(deadline) => {
                    sleep_until(deadline).await;
                    return Ok(None);
                }
                None => std::future::pending().await,
            }
        };

        if let Some(deadline) = deadline {
            if due > deadline {
                sleep_until(deadline).await;
                return Ok(None);
            }
        }
        sleep_until(due).await;

        Ok(self.lock_inbound().pop_front().map(|(_, packet)| packet))
    }

    async fn send_to(&self, payload: &[u8], to: SocketAddr) -> anyhow::Result<()> {
        if self.fail_sends_to == Some(to) {
            return Err(anyhow!("simulated send failure to {:?}", to));
        }
        self.sent.push(SentDatagram {
            at: self.start.elapsed(),
            to,
            payload: Bytes::copy_from_slice(payload),
        });
        Ok(())
    }
}
