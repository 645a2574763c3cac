use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::time::Duration;

use tracing::debug;

use crate::packet::{Opcode, ParsedMessage};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FaultKind {
    /// hold the packet back for the given time while other traffic keeps flowing
    Delay(Duration),
    /// forward the packet, and send it a second time after the receiver responded
    Duplicate,
    /// silently discard the packet
    Lose,
}

impl Display for FaultKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FaultKind::Delay(d) => write!(f, "delay by {}s", d.as_secs_f64()),
            FaultKind::Duplicate => write!(f, "duplicate"),
            FaultKind::Lose => write!(f, "lose"),
        }
    }
}

/// An operator's instruction to mess with one specific packet. A rule is identified by the
///  packet's raw opcode and its sequence (i.e. block) number; it fires at most once.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FaultRule {
    pub kind: FaultKind,
    pub target_opcode: u16,
    pub target_sequence_number: u16,
}

impl FaultRule {
    pub fn new(kind: FaultKind, target_opcode: u16, target_sequence_number: u16) -> FaultRule {
        FaultRule {
            kind,
            target_opcode,
            target_sequence_number,
        }
    }

    /// Opcodes must be equal. The sequence number is compared only for messages that have one
    ///  (DATA, ACK) - requests and errors match on their opcode alone.
    pub fn matches(&self, msg: &ParsedMessage) -> bool {
        msg.opcode() == Some(self.target_opcode)
            && msg.sequence_number().map_or(true, |n| n == self.target_sequence_number)
    }

    /// DATA n precedes ACK n in both kinds of transfer. The only difference between them is
    ///  ACK #0, which a write transfer has right after the request; its block number already
    ///  sorts it first.
    fn position_in_transfer(&self) -> (u8, u16, u8) {
        match Opcode::try_from(self.target_opcode) {
            Ok(Opcode::ReadRequest) | Ok(Opcode::WriteRequest) => (0, 0, 0),
            Ok(Opcode::Data) => (1, self.target_sequence_number, 0),
            Ok(Opcode::Ack) => (1, self.target_sequence_number, 1),
            _ => (2, self.target_sequence_number, 0),
        }
    }
}

impl Display for FaultRule {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match Opcode::try_from(self.target_opcode) {
            Ok(opcode) => write!(f, "{} {} #{}", self.kind, opcode.short_name(), self.target_sequence_number),
            Err(_) => write!(f, "{} opcode {} #{}", self.kind, self.target_opcode, self.target_sequence_number),
        }
    }
}


/// Read and write transfers alternate DATA and ACK in opposite directions, and they start
///  differently: a read transfer's first response is DATA #1, a write transfer's is ACK #0.
///  The block after that is always DATA n followed by ACK n.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransferKind {
    Read,
    Write,
}
impl TransferKind {
    pub fn of_request(msg: &ParsedMessage) -> Option<TransferKind> {
        match msg {
            ParsedMessage::ReadRequest => Some(TransferKind::Read),
            ParsedMessage::WriteRequest => Some(TransferKind::Write),
            _ => None,
        }
    }
}


/// The ordered collection of pending fault rules. Only the head rule is ever considered for a
///  packet, so the order must be the order in which the targeted packets show up during the
///  transfer. [FaultRuleQueue::sort_for] must be called once the first request was seen.
#[derive(Debug, Clone, Default)]
pub struct FaultRuleQueue {
    rules: VecDeque<FaultRule>,
    transfer_kind: Option<TransferKind>,
}

impl FaultRuleQueue {
    pub fn new() -> FaultRuleQueue {
        Default::default()
    }

    pub fn push(&mut self, rule: FaultRule) {
        debug!(%rule, "queueing fault rule");
        self.rules.push_back(rule);
    }

    /// Stable: rules targeting the same packet keep the order in which they were entered.
    ///
    /// Ordering is by raw block number, so it only holds for transfers of up to 65535 blocks.
    ///  After the block counter wraps around to 0, rules for late blocks sort before the rules
    ///  for early ones.
    pub fn sort_for(&mut self, transfer_kind: TransferKind) {
        self.transfer_kind = Some(transfer_kind);
        self.rules.make_contiguous()
            .sort_by_key(|r| r.position_in_transfer());
    }

    pub fn transfer_kind(&self) -> Option<TransferKind> {
        self.transfer_kind
    }

    pub fn peek_current(&self) -> Option<&FaultRule> {
        self.rules.front()
    }

    pub fn remove_current(&mut self) -> Option<FaultRule> {
        self.rules.pop_front()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FaultRule> {
        self.rules.iter()
    }
}

impl Display for FaultRuleQueue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.rules.is_empty() {
            return write!(f, "no errors queued");
        }
        for (i, rule) in self.rules.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}: {}", i+1, rule)?;
        }
        Ok(())
    }
}
