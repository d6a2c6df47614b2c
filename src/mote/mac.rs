//! TSCH active-cell handling, TX/RX completion (§4.4, §4.5, §4.6).
//!
//! Lives as `impl Simulation` rather than `impl Mote` because a slot
//! activation needs the engine (to reschedule itself), the shared
//! propagation intent lists, and — for CONTROL dispatch and relaying — other
//! motes. The reference keeps the same shape: `node_task.rs`'s per-node loop
//! reaches into `network_task`'s shared channel state rather than owning it.

use super::{WaitingFor, MAC_MAX_BE, MAC_MAX_CSMA_BACKOFFS};
use crate::engine::{priority, EventTag, MoteId};
use crate::packet::{Cell, CellDirection, ControlOp, Packet};
use crate::propagation::{TxIntent, TxOutcome};
use crate::simulation::Simulation;
use rand::Rng;

/// SHARED cells always use this fixed channel (§4.4).
pub const SHARED_CHANNEL: u8 = 0;

impl Simulation {
    /// Re-arm `ActiveCell(id)` at the earliest future slot offset present in
    /// the mote's schedule (§4.4 Scheduling).
    pub fn tsch_schedule_active_cell(&mut self, id: MoteId) {
        let slotframe_length = self.settings.slotframe_length as u64;
        let asn = self.engine.asn();
        let cur_ts = asn % slotframe_length;
        let mote = &self.motes[id as usize];
        let mut best_delta: Option<u64> = None;
        for &ts in mote.schedule.keys() {
            let ts = ts as u64;
            let delta = if ts > cur_ts {
                ts - cur_ts
            } else {
                slotframe_length - cur_ts + ts
            };
            let delta = if delta == 0 { slotframe_length } else { delta };
            best_delta = Some(best_delta.map_or(delta, |b| b.min(delta)));
        }
        if let Some(delta) = best_delta {
            self.engine.schedule_in(delta, EventTag::ActiveCell(id), priority::ACTIVE_CELL);
        }
    }

    /// §4.4: dispatch on the active cell's direction.
    pub fn activate_cell(&mut self, id: MoteId) {
        let asn = self.engine.asn();
        let ts = (asn % self.settings.slotframe_length as u64) as u16;
        debug_assert!(
            self.motes[id as usize].waiting_for != WaitingFor::Rx,
            "entry into active-cell handler must not find a stale RX wait"
        );

        if let Some(cell) = self.motes[id as usize].schedule.get(&ts).cloned() {
            match cell.dir {
                CellDirection::Shared => self.activate_shared(id, ts),
                CellDirection::Rx => self.activate_rx(id, &cell),
                CellDirection::Tx => self.activate_tx(id, &cell, ts),
            }
        }
        self.tsch_schedule_active_cell(id);
    }

    fn activate_rx(&mut self, id: MoteId, cell: &Cell) {
        self.propagation.start_rx(id, cell.channel);
        self.motes[id as usize].waiting_for = WaitingFor::Rx;
    }

    fn activate_tx(&mut self, id: MoteId, cell: &Cell, ts: u16) {
        let neighbor = match cell.neighbor {
            Some(n) => n,
            None => return,
        };
        let packet = if self.settings.opportunist && self.motes[id as usize].pkt_to_send_alloc.is_some() {
            self.motes[id as usize].pkt_to_send_alloc.take()
        } else {
            self.motes[id as usize].data_queue.front().cloned()
        };

        let Some(packet) = packet else {
            if self.is_shared_slot_offset(ts) {
                self.propagation.start_rx(id, SHARED_CHANNEL);
                self.motes[id as usize].waiting_for = WaitingFor::Shared;
            }
            return;
        };

        self.motes[id as usize].schedule.get_mut(&ts).unwrap().num_tx += 1;
        self.start_transmission(id, neighbor, cell.channel, packet, false);
    }

    fn is_shared_slot_offset(&self, ts: u16) -> bool {
        self.settings.shared_slot_offsets().contains(&ts)
    }

    fn activate_shared(&mut self, id: MoteId, ts: u16) {
        let mote = &mut self.motes[id as usize];
        if mote.send_control_delay > 0 {
            mote.send_control_delay -= 1;
            mote.waiting_for = WaitingFor::Shared;
            self.propagation.start_rx(id, SHARED_CHANNEL);
            return;
        }

        match self.pick_control_candidate(id) {
            Some((from_high, packet)) => {
                if self.should_transmit_now_on_shared(id, &packet) {
                    self.remove_control_packet(id, from_high, &packet);
                    let dmac = packet.next_hop;
                    self.start_transmission(id, dmac, SHARED_CHANNEL, packet, true);
                } else {
                    self.motes[id as usize].pkt_to_send_alloc = Some(packet);
                    self.motes[id as usize].waiting_for = WaitingFor::Shared;
                    self.propagation.start_rx(id, SHARED_CHANNEL);
                }
            }
            None => {
                let _ = ts;
                self.motes[id as usize].waiting_for = WaitingFor::Shared;
                self.propagation.start_rx(id, SHARED_CHANNEL);
            }
        }
    }

    /// Peek (never removes) the control packet this mote would send next.
    fn pick_control_candidate(&self, id: MoteId) -> Option<(bool, Packet)> {
        let mote = &self.motes[id as usize];
        match self.settings.queuing {
            crate::settings::QueuingModel::Dual => {
                if let Some(p) = mote.control_queue_high.front() {
                    return Some((true, p.clone()));
                }
                mote.control_queue_normal.front().map(|p| (false, p.clone()))
            }
            crate::settings::QueuingModel::Single | crate::settings::QueuingModel::Synchronous => {
                if let Some(answer) = mote.control_queue_normal.iter().find(|p| p.is_control_op(ControlOp::Answer)) {
                    return Some((false, answer.clone()));
                }
                mote.control_queue_normal.front().map(|p| (false, p.clone()))
            }
        }
    }

    fn remove_control_packet(&mut self, id: MoteId, from_high: bool, packet: &Packet) {
        let seq = packet.control.as_ref().map(|c| c.seq);
        let mote = &mut self.motes[id as usize];
        let q = if from_high { &mut mote.control_queue_high } else { &mut mote.control_queue_normal };
        q.remove_first(|p| p.control.as_ref().map(|c| c.seq) == seq && p.sender == packet.sender && p.next_hop == packet.next_hop);
    }

    /// §4.4 TX-cell branch condition: transmit now rather than hold for
    /// opportunistic piggyback.
    fn should_transmit_now_on_shared(&self, id: MoteId, packet: &Packet) -> bool {
        if !self.settings.opportunist {
            return true;
        }
        if packet.is_control_op(ControlOp::Answer) {
            return true;
        }
        let mote = &self.motes[id as usize];
        if mote.num_cells_to(packet.next_hop) == 0 {
            return true;
        }
        let otf_start = *mote.otf_status.get(&packet.next_hop).unwrap_or(&true);
        !otf_start
    }

    fn start_transmission(&mut self, smac: MoteId, dmac: MoteId, channel: u8, packet: Packet, on_shared: bool) {
        let asn = self.engine.asn();
        let arrival_time_us = self.motes[smac as usize].calc_time(asn, self.settings.slot_duration_s);
        let _ = on_shared;
        self.propagation.start_tx(TxIntent {
            channel,
            smac,
            dmac,
            arrival_time_us,
            packet,
        });
    }

    /// §4.5.
    pub fn mote_tx_done(&mut self, smac: MoteId, asn_at_tx: crate::engine::Asn, ts: u16, outcome: TxOutcome, packet: &Packet) {
        if let Some(cell) = self.motes[smac as usize].schedule.get_mut(&ts) {
            if cell.dir != CellDirection::Rx {
                // A NACK still counts as a received frame for cell-PDR purposes
                // (§4.5); only a plain link failure should pull the PDR down.
                cell.record_tx_outcome(outcome.acked || outcome.nacked);
            }
        }

        let is_control = packet.kind == crate::packet::PacketKind::Control;

        if outcome.acked {
            if Some(packet.next_hop) == self.motes[smac as usize].preferred_parent {
                self.motes[smac as usize].time_corrected_slot = asn_at_tx;
            }
            self.dequeue_sent_packet(smac, packet);
            if is_control {
                self.motes[smac as usize].send_control_delay = 0;
                self.motes[smac as usize].mac_backoff_nb = 0;
                self.motes[smac as usize].backoff_exponent = 0;
                self.motes[smac as usize].request_triggered.remove(&packet.next_hop);
            }
            return;
        }

        // NACK or plain failure share the same retry/backoff/abort flow (§4.5).
        if is_control {
            self.control_tx_failed(smac, packet);
        } else {
            let mote = &mut self.motes[smac as usize];
            let exhausted = match mote.data_queue.front_mut() {
                Some(head) if Self::same_packet(head, packet) => {
                    if head.retries_left > 0 {
                        head.retries_left -= 1;
                    }
                    head.retries_left == 0
                }
                _ => false,
            };
            if exhausted {
                mote.data_queue.pop_front();
                mote.dropped_mac_retries += 1;
                log::debug!("mote {smac}: data packet to {} dropped, retries exhausted", packet.next_hop);
            }
        }
    }

    fn control_tx_failed(&mut self, smac: MoteId, packet: &Packet) {
        let mote = &mut self.motes[smac as usize];
        mote.mac_backoff_nb += 1;
        mote.backoff_exponent = (mote.backoff_exponent + 1).min(MAC_MAX_BE);
        let max_delay = 1u32 << mote.backoff_exponent;
        mote.send_control_delay = self.rng.gen_range(1..=max_delay);

        let exhausted = mote.mac_backoff_nb >= MAC_MAX_CSMA_BACKOFFS;
        if exhausted {
            mote.mac_backoff_nb = 0;
            mote.backoff_exponent = 0;
            log::debug!("mote {smac}: control frame to {} exhausted CSMA backoffs, aborting transaction", packet.next_hop);
            self.abort_own_transaction(smac);
            if !packet.is_control_op(ControlOp::Req) {
                self.abort_peer_transaction(packet.next_hop, smac);
            }
        }
    }

    fn same_packet(a: &Packet, b: &Packet) -> bool {
        a.origin == b.origin && a.origin_asn == b.origin_asn && a.sender == b.sender
    }

    fn dequeue_sent_packet(&mut self, smac: MoteId, packet: &Packet) {
        let mote = &mut self.motes[smac as usize];
        match packet.kind {
            crate::packet::PacketKind::Data => {
                if matches!(mote.data_queue.front(), Some(head) if Self::same_packet(head, packet)) {
                    mote.data_queue.pop_front();
                }
            }
            crate::packet::PacketKind::Control => {
                let seq = packet.control.as_ref().map(|c| c.seq);
                mote.control_queue_high
                    .remove_first(|p| p.control.as_ref().map(|c| c.seq) == seq && p.next_hop == packet.next_hop);
                mote.control_queue_normal
                    .remove_first(|p| p.control.as_ref().map(|c| c.seq) == seq && p.next_hop == packet.next_hop);
            }
        }
    }

    /// §4.6: a successful decode at `receiver`. Returns whether the frame was
    /// accepted (feeds `isACKed`/`isNACKed` back at the caller).
    pub fn mote_rx_done(&mut self, receiver: MoteId, sender: MoteId, asn: crate::engine::Asn, packet: Packet) -> bool {
        self.motes[receiver as usize].waiting_for = WaitingFor::None;

        match packet.kind {
            crate::packet::PacketKind::Data => {
                if self.motes[receiver as usize].is_root {
                    let latency = asn.saturating_sub(packet.origin_asn);
                    let m = &mut self.motes[receiver as usize];
                    m.app_reaches_dagroot += 1;
                    m.latency_sum_slots += latency;
                    m.latency_count += 1;
                    true
                } else {
                    // Accumulated here, folded into the EMA and reset by OTF housekeeping (§4.8 step 1).
                    *self.motes[receiver as usize].moving_avg_incoming_traffic.entry(sender).or_insert(0.0) += 1.0;
                    let mut relayed = packet.clone();
                    relayed.hop_count += 1;
                    relayed.sender = receiver;
                    let next_hop = self.motes[receiver as usize].preferred_parent;
                    match next_hop {
                        Some(next_hop) => {
                            relayed.next_hop = next_hop;
                            let accepted = self.motes[receiver as usize].data_queue.push_back(relayed);
                            if !accepted {
                                self.motes[receiver as usize].dropped_queue_full += 1;
                                log::debug!("mote {receiver}: dropping relayed packet from {sender}, data queue full");
                            }
                            accepted
                        }
                        None => {
                            self.motes[receiver as usize].dropped_no_route += 1;
                            log::debug!("mote {receiver}: dropping relayed packet from {sender}, no route to root");
                            false
                        }
                    }
                }
            }
            crate::packet::PacketKind::Control => self.dispatch_control(receiver, sender, asn, packet),
        }
    }

    pub(crate) fn dispatch_control(&mut self, receiver: MoteId, sender: MoteId, asn: crate::engine::Asn, packet: Packet) -> bool {
        let Some(control) = packet.control.clone() else { return false };
        let expected = self.motes[receiver as usize].expected_seq_from_neighbor.entry(sender).or_insert(0);
        let in_order = control.seq == *expected + 1;
        *expected = control.seq; // resync on mismatch too (§4.10, §9)
        if !in_order {
            return false;
        }

        let _ = asn;
        match control.op {
            ControlOp::Req => self.sixtop_handle_req(receiver, sender, &control),
            ControlOp::Answer => self.sixtop_handle_answer(receiver, sender, &control),
            ControlOp::Confirmation => self.sixtop_handle_confirmation(receiver, sender, &control),
            ControlOp::Otf => {
                self.motes[receiver as usize]
                    .otf_status
                    .insert(sender, control.otf_signal.unwrap_or(true));
                true
            }
        }
    }

    /// §4.6 idle-listen: no frame decoded this slot for `mote`, optionally with
    /// a capture collision detected purely for bookkeeping.
    pub fn mote_rx_idle(&mut self, mote: MoteId, ts: u16, detected_collision: bool) {
        self.motes[mote as usize].waiting_for = WaitingFor::None;
        self.motes[mote as usize].battery_charge += 1.0;
        if detected_collision {
            if let Some(cell) = self.motes[mote as usize].schedule.get_mut(&ts) {
                cell.rx_detected_collision = true;
            }
        }
    }

    /// §4.9 abort flow, initiator side.
    pub fn abort_own_transaction(&mut self, id: MoteId) {
        let mote = &mut self.motes[id as usize];
        if let Some(pending) = mote.pending_transaction.take() {
            for slot in pending.allocated_cells {
                mote.remove_cell(slot);
            }
            mote.request_triggered.remove(&pending.peer);
            mote.transaction_aborted += 1;
        }
    }

    /// §4.9 abort flow, responder side (symmetric rollback, no stat increment
    /// since the stat is counted once by the transaction's initiator).
    pub fn abort_peer_transaction(&mut self, id: MoteId, peer: MoteId) {
        let mote = &mut self.motes[id as usize];
        if matches!(&mote.pending_transaction, Some(p) if p.peer == peer) {
            if let Some(pending) = mote.pending_transaction.take() {
                for slot in pending.allocated_cells {
                    mote.remove_cell(slot);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{CellDirection, ControlOp, ControlPayload};
    use crate::settings::QueuingModel;
    use crate::test_support::test_simulation;

    #[test]
    fn shared_slot_backoff_counter_decrements_before_any_candidate_is_considered() {
        let mut sim = test_simulation(2, QueuingModel::Single);
        sim.motes[0].send_control_delay = 3;
        sim.activate_cell(0);
        assert_eq!(sim.motes[0].send_control_delay, 2);
        assert_eq!(sim.motes[0].waiting_for, WaitingFor::Shared);
    }

    #[test]
    fn answer_preempts_non_answer_head_in_single_queue() {
        let mut sim = test_simulation(2, QueuingModel::Single);
        let req = Packet::new_control(
            0,
            0,
            1,
            ControlPayload {
                op: ControlOp::Req,
                dir: CellDirection::Tx,
                requested_cells: 1,
                already_used_slots: vec![],
                cells: vec![],
                seq: 1,
                otf_signal: None,
            },
        );
        let answer = Packet::new_control(
            0,
            0,
            1,
            ControlPayload {
                op: ControlOp::Answer,
                dir: CellDirection::Tx,
                requested_cells: 0,
                already_used_slots: vec![],
                cells: vec![(10, 0)],
                seq: 2,
                otf_signal: None,
            },
        );
        sim.motes[0].control_queue_normal.push_back(req);
        sim.motes[0].control_queue_normal.push_back(answer);

        let (_, picked) = sim.pick_control_candidate(0).unwrap();
        assert!(picked.is_control_op(ControlOp::Answer));
    }

    #[test]
    fn tx_done_ack_clears_backoff_state() {
        let mut sim = test_simulation(2, QueuingModel::Single);
        sim.motes[0].mac_backoff_nb = 2;
        sim.motes[0].backoff_exponent = 3;
        let packet = Packet::new_control(
            0,
            0,
            1,
            ControlPayload {
                op: ControlOp::Req,
                dir: CellDirection::Tx,
                requested_cells: 1,
                already_used_slots: vec![],
                cells: vec![],
                seq: 1,
                otf_signal: None,
            },
        );
        sim.motes[0].control_queue_normal.push_back(packet.clone());
        sim.mote_tx_done(0, 0, 0, TxOutcome { acked: true, nacked: false }, &packet);
        assert_eq!(sim.motes[0].mac_backoff_nb, 0);
        assert_eq!(sim.motes[0].backoff_exponent, 0);
    }
}
