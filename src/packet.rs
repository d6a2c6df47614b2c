//! Cells, packets, and pending 6top transactions (§3).

use crate::engine::{Asn, MoteId};
use std::collections::VecDeque;

/// Maximum TX-outcome history retained per cell (§3 invariant).
pub const NUM_MAX_HISTORY: usize = 32;
/// Minimum cumulative TX count before a cell's PDR is considered defined (§3).
pub const NUM_SUFFICIENT_TX: u32 = 10;
/// Initial DATA packet retry budget (§3).
pub const TSCH_MAXTXRETRIES: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellDirection {
    Tx,
    Rx,
    Shared,
}

impl CellDirection {
    /// The direction the *other* party installs for the same (slot, channel):
    /// a TX cell here is an RX cell there, and vice versa. SHARED has no inverse
    /// counterpart since it is never negotiated.
    pub fn inverse(self) -> CellDirection {
        match self {
            CellDirection::Tx => CellDirection::Rx,
            CellDirection::Rx => CellDirection::Tx,
            CellDirection::Shared => CellDirection::Shared,
        }
    }
}

/// One scheduled (slot-offset, channel) assignment (§3 Cell record).
#[derive(Debug, Clone)]
pub struct Cell {
    pub channel: u8,
    pub dir: CellDirection,
    pub neighbor: Option<MoteId>,
    pub num_tx: u32,
    pub num_tx_ack: u32,
    pub num_rx: u32,
    /// Most recent outcome at the back; bounded to `NUM_MAX_HISTORY`.
    pub history: VecDeque<bool>,
    pub rx_detected_collision: bool,
    pub creation_asn: Asn,
}

impl Cell {
    pub fn new(channel: u8, dir: CellDirection, neighbor: Option<MoteId>, creation_asn: Asn) -> Self {
        Cell {
            channel,
            dir,
            neighbor,
            num_tx: 0,
            num_tx_ack: 0,
            num_rx: 0,
            history: VecDeque::with_capacity(NUM_MAX_HISTORY),
            rx_detected_collision: false,
            creation_asn,
        }
    }

    /// Record a TX outcome (true = ACKed), truncating history to the last
    /// `NUM_MAX_HISTORY` samples (§3, §8 boundary behavior).
    pub fn record_tx_outcome(&mut self, acked: bool) {
        self.num_tx += 1;
        if acked {
            self.num_tx_ack += 1;
        }
        if self.history.len() == NUM_MAX_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(acked);
    }

    /// PDR over the last `NUM_MAX_HISTORY` outcomes; undefined (`None`) below
    /// `NUM_SUFFICIENT_TX` cumulative transmissions (§3, §8).
    pub fn pdr(&self) -> Option<f64> {
        if self.num_tx < NUM_SUFFICIENT_TX {
            return None;
        }
        let acked = self.history.iter().filter(|&&ok| ok).count();
        Some(acked as f64 / self.history.len() as f64)
    }
}

/// The 6top operation carried by a CONTROL packet (§3, §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOp {
    Req,
    Answer,
    Confirmation,
    Otf,
}

/// CONTROL-packet-only fields (§3).
#[derive(Debug, Clone)]
pub struct ControlPayload {
    pub op: ControlOp,
    /// Direction requested by the initiator, from the initiator's perspective.
    pub dir: CellDirection,
    pub requested_cells: u8,
    /// Slots already used by the initiator, passed so the responder avoids them.
    pub already_used_slots: Vec<u16>,
    /// Allocated (slot, channel) pairs, used by `answer` and `confirmation`.
    pub cells: Vec<(u16, u8)>,
    pub seq: u32,
    /// Present only for `op == Otf`: `true` = START, `false` = STOP.
    pub otf_signal: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Data,
    Control,
}

/// A queued frame (§3 Packet).
#[derive(Debug, Clone)]
pub struct Packet {
    pub enqueue_asn: Asn,
    pub kind: PacketKind,
    /// Original application-level source (constant across relays).
    pub origin: MoteId,
    pub origin_asn: Asn,
    pub hop_count: u8,
    pub retries_left: u8,
    /// Sender of this hop (the mote that will transmit it next).
    pub sender: MoteId,
    /// Immediate next-hop destination.
    pub next_hop: MoteId,
    pub control: Option<ControlPayload>,
}

impl Packet {
    pub fn new_data(enqueue_asn: Asn, origin: MoteId, origin_asn: Asn, hop_count: u8, sender: MoteId, next_hop: MoteId) -> Self {
        Packet {
            enqueue_asn,
            kind: PacketKind::Data,
            origin,
            origin_asn,
            hop_count,
            retries_left: TSCH_MAXTXRETRIES,
            sender,
            next_hop,
            control: None,
        }
    }

    pub fn new_control(enqueue_asn: Asn, sender: MoteId, next_hop: MoteId, control: ControlPayload) -> Self {
        Packet {
            enqueue_asn,
            kind: PacketKind::Control,
            origin: sender,
            origin_asn: enqueue_asn,
            hop_count: 0,
            retries_left: TSCH_MAXTXRETRIES,
            sender,
            next_hop,
            control: Some(control),
        }
    }

    pub fn is_control_op(&self, op: ControlOp) -> bool {
        matches!(&self.control, Some(c) if c.op == op)
    }
}

/// A 6top exchange this mote initiated or is servicing, not yet confirmed (§3).
#[derive(Debug, Clone)]
pub struct PendingTransaction {
    pub kind: PendingKind,
    pub peer: MoteId,
    /// Cells allocated speculatively during this transaction, kept for rollback.
    pub allocated_cells: Vec<u16>,
    pub seq: u32,
    /// Housekeeping ticks elapsed since this transaction was opened
    /// (initiator-side timeout counter, §4.9).
    pub retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    /// This mote is the initiator awaiting `answer`/`confirmation`.
    MoteRequest,
    /// This mote is the responder that installed cells awaiting `confirmation`.
    ParentAdds,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_pdr_undefined_below_sufficient_tx() {
        let mut cell = Cell::new(1, CellDirection::Tx, Some(2), 0);
        for _ in 0..9 {
            cell.record_tx_outcome(true);
        }
        assert_eq!(cell.pdr(), None);
        cell.record_tx_outcome(false);
        assert_eq!(cell.num_tx, 10);
        assert_eq!(cell.pdr(), Some(0.9));
    }

    #[test]
    fn cell_history_truncates_to_last_32() {
        let mut cell = Cell::new(1, CellDirection::Tx, Some(2), 0);
        for _ in 0..40 {
            cell.record_tx_outcome(true);
        }
        assert_eq!(cell.history.len(), NUM_MAX_HISTORY);
        assert_eq!(cell.num_tx, 40);
    }

    #[test]
    fn direction_inverse_round_trips() {
        assert_eq!(CellDirection::Tx.inverse(), CellDirection::Rx);
        assert_eq!(CellDirection::Rx.inverse(), CellDirection::Tx);
        assert_eq!(CellDirection::Shared.inverse(), CellDirection::Shared);
    }
}
