//! 6top two-phase cell negotiation, retry/abort, and worst-cell/RX relocation
//! (§4.9, §4.10).

use crate::packet::PendingKind;
use crate::engine::{priority, EventTag, MoteId};
use crate::packet::{Cell, CellDirection, ControlOp, ControlPayload, PendingTransaction};
use crate::simulation::{Simulation, TRANSACTION_TIMEOUT};
use rand::seq::SliceRandom;

impl Simulation {
    /// Kick off an initiator-side add if this mote has no transaction already
    /// in flight with `peer` (§3 invariant: at most one pending transaction).
    pub fn sixtop_initiate_add(&mut self, initiator: MoteId, peer: MoteId, dir: CellDirection, count: u8) -> bool {
        if self.motes[initiator as usize].pending_transaction.is_some() {
            return false;
        }
        if *self.motes[initiator as usize].request_triggered.get(&peer).unwrap_or(&false) {
            return false;
        }
        self.motes[initiator as usize].request_triggered.insert(peer, true);
        let seq = self.motes[initiator as usize].next_outgoing_seq(peer);
        self.motes[initiator as usize].pending_transaction = Some(PendingTransaction {
            kind: PendingKind::MoteRequest,
            peer,
            allocated_cells: vec![],
            seq,
            retries: 0,
        });
        let already_used: Vec<u16> = self.motes[initiator as usize].schedule.keys().copied().collect();
        let payload = ControlPayload {
            op: ControlOp::Req,
            dir,
            requested_cells: count,
            already_used_slots: already_used,
            cells: vec![],
            seq,
            otf_signal: None,
        };
        self.send_control(initiator, peer, ControlOp::Req, payload);
        log::trace!("mote {initiator}: sixtop req to {peer} ({dir:?}, count={count}, seq={seq})");
        true
    }

    /// Used by OTF: attempt to add `count` cells now, returning how many were
    /// actually requested (optimistic — the negotiation itself may still be
    /// pending when this returns, since it travels through the normal control
    /// path; a shortfall here only means "could not even start", e.g. because
    /// a transaction with this peer is already in flight).
    pub fn sixtop_try_add(&mut self, initiator: MoteId, peer: MoteId, dir: CellDirection, count: u8) -> i64 {
        if self.sixtop_initiate_add(initiator, peer, dir, count) {
            count as i64
        } else {
            0
        }
    }

    /// Unilateral cell removal: the owning mote picks `count` of its own TX
    /// cells to `peer` and instructs the peer to drop the mirrored RX cell.
    /// Unlike adds, 6top removal needs no negotiation — the remover already
    /// owns full local knowledge of which cells to give up.
    pub fn sixtop_remove_cells(&mut self, owner: MoteId, peer: MoteId, dir: CellDirection, count: u8) {
        let mut candidates: Vec<u16> = self.motes[owner as usize]
            .schedule
            .iter()
            .filter(|(_, c)| c.dir == dir && c.neighbor == Some(peer))
            .map(|(&s, _)| s)
            .collect();
        candidates.sort_by_key(|&s| {
            self.motes[owner as usize]
                .schedule
                .get(&s)
                .and_then(|c| c.pdr())
                .map(|p| (p * 1e6) as i64)
                .unwrap_or(i64::MAX)
        });
        for slot in candidates.into_iter().take(count as usize) {
            self.sixtop_delete_cell_pair(owner, peer, slot);
        }
    }

    fn sixtop_delete_cell_pair(&mut self, owner: MoteId, peer: MoteId, slot: u16) {
        self.motes[owner as usize].remove_cell(slot);
        self.motes[peer as usize].remove_cell(slot);
    }

    fn choose_channel(&self, a: MoteId, b: MoteId, slot: u16) -> Option<u8> {
        (0..self.settings.num_channels).find(|&ch| !self.motes[a as usize].reserve[slot as usize][ch as usize] && !self.motes[b as usize].reserve[slot as usize][ch as usize])
    }

    /// Responder side of `req` (§4.9).
    pub fn sixtop_handle_req(&mut self, responder: MoteId, initiator: MoteId, control: &ControlPayload) -> bool {
        if self.motes[responder as usize].pending_transaction.is_some() {
            log::debug!("mote {responder}: rejecting req from {initiator}, transaction already pending");
            return false;
        }

        let mut candidate_slots: Vec<u16> = (0..self.settings.slotframe_length)
            .filter(|s| !control.already_used_slots.contains(s) && !self.motes[responder as usize].schedule.contains_key(s))
            .collect();
        candidate_slots.shuffle(&mut self.rng);

        let mut allocated: Vec<(u16, u8)> = Vec::new();
        for &slot in &candidate_slots {
            if allocated.len() as u8 >= control.requested_cells {
                break;
            }
            if let Some(ch) = self.choose_channel(responder, initiator, slot) {
                allocated.push((slot, ch));
            }
        }

        let installed_dir = control.dir.inverse();
        let asn = self.engine.asn();
        for &(slot, ch) in &allocated {
            self.motes[responder as usize].install_cell(slot, Cell::new(ch, installed_dir, Some(initiator), asn));
        }

        let seq = self.motes[responder as usize].next_outgoing_seq(initiator);
        self.motes[responder as usize].pending_transaction = Some(PendingTransaction {
            kind: PendingKind::ParentAdds,
            peer: initiator,
            allocated_cells: allocated.iter().map(|c| c.0).collect(),
            seq,
            retries: 0,
        });

        let allocated_count = allocated.len();
        let payload = ControlPayload {
            op: ControlOp::Answer,
            dir: installed_dir,
            requested_cells: 0,
            already_used_slots: vec![],
            cells: allocated,
            seq,
            otf_signal: None,
        };
        self.send_control(responder, initiator, ControlOp::Answer, payload);
        log::trace!("mote {responder}: answered {initiator} with {} cells", allocated_count);
        true
    }

    /// Initiator side of `answer` (§4.9).
    pub fn sixtop_handle_answer(&mut self, initiator: MoteId, responder: MoteId, control: &ControlPayload) -> bool {
        let install_dir = control.dir.inverse();
        let asn = self.engine.asn();
        let mut installed = Vec::new();
        for &(slot, ch) in &control.cells {
            if self.motes[initiator as usize].schedule.contains_key(&slot) {
                continue;
            }
            self.motes[initiator as usize].install_cell(slot, Cell::new(ch, install_dir, Some(responder), asn));
            installed.push(slot);
        }
        if let Some(p) = &mut self.motes[initiator as usize].pending_transaction {
            p.allocated_cells = installed.clone();
        }

        let seq = self.motes[initiator as usize].next_outgoing_seq(responder);
        let payload = ControlPayload {
            op: ControlOp::Confirmation,
            dir: install_dir,
            requested_cells: 0,
            already_used_slots: vec![],
            cells: installed.iter().map(|&s| (s, 0)).collect(),
            seq,
            otf_signal: None,
        };
        self.send_control(initiator, responder, ControlOp::Confirmation, payload);

        self.motes[initiator as usize].pending_transaction = None;
        self.motes[initiator as usize].request_triggered.remove(&responder);
        log::trace!("mote {initiator}: confirmed {} cells with {responder}", installed.len());
        true
    }

    /// Responder side of `confirmation` (§4.9): reconcile any cell the
    /// responder installed speculatively but the initiator did not confirm.
    pub fn sixtop_handle_confirmation(&mut self, responder: MoteId, initiator: MoteId, control: &ControlPayload) -> bool {
        let confirmed: std::collections::HashSet<u16> = control.cells.iter().map(|&(s, _)| s).collect();
        if let Some(pending) = self.motes[responder as usize].pending_transaction.take() {
            if pending.peer == initiator {
                for slot in pending.allocated_cells {
                    if !confirmed.contains(&slot) {
                        self.motes[responder as usize].remove_cell(slot);
                    }
                }
            } else {
                self.motes[responder as usize].pending_transaction = Some(pending);
            }
        }
        true
    }

    /// §4.9 periodic housekeeping: initiator-side transaction timeout, then
    /// (unless disabled) worst-cell and RX relocation.
    pub fn top_housekeeping(&mut self, id: MoteId) {
        let mut timed_out = false;
        if let Some(pending) = &mut self.motes[id as usize].pending_transaction {
            if pending.kind == PendingKind::MoteRequest {
                pending.retries += 1;
                timed_out = pending.retries >= TRANSACTION_TIMEOUT;
            }
        }
        if timed_out {
            log::warn!("mote {id}: 6top transaction timed out after {TRANSACTION_TIMEOUT} ticks, aborting");
            self.abort_own_transaction(id);
        }

        if !self.settings.no_top_housekeeping {
            self.worst_cell_relocation(id);
            self.rx_relocation(id);
        }

        let delay = self.jittered_slots(self.settings.top_housekeeping_period_s, 0.9, 1.1);
        self.engine.schedule_in(delay, EventTag::TopHousekeeping(id), priority::TOP_HOUSEKEEPING);
    }

    /// §4.9 "Worst-cell relocation".
    fn worst_cell_relocation(&mut self, id: MoteId) {
        if self.motes[id as usize].pending_transaction.is_some() {
            return;
        }
        let mut by_neighbor: std::collections::HashMap<MoteId, Vec<u16>> = std::collections::HashMap::new();
        for (&slot, cell) in self.motes[id as usize].schedule.iter() {
            if cell.dir == CellDirection::Tx {
                if let Some(n) = cell.neighbor {
                    by_neighbor.entry(n).or_default().push(slot);
                }
            }
        }

        for (neighbor, slots) in by_neighbor {
            let pdrs: Vec<(u16, f64)> = slots
                .iter()
                .filter_map(|&s| self.motes[id as usize].schedule.get(&s).and_then(|c| c.pdr().map(|p| (s, p))))
                .collect();
            if pdrs.len() < 2 {
                continue;
            }
            let (worst_slot, worst_pdr) = pdrs.iter().cloned().fold((pdrs[0].0, f64::MAX), |acc, x| if x.1 < acc.1 { x } else { acc });
            let rest_sum: f64 = pdrs.iter().filter(|(s, _)| *s != worst_slot).map(|(_, p)| p).sum();
            let rest_count = (pdrs.len() - 1) as f64;
            let bundle_avg_excl_worst = if rest_count > 0.0 { rest_sum / rest_count } else { worst_pdr };

            if !self.settings.no_remove_worst_cell && worst_pdr < bundle_avg_excl_worst / self.settings.top_pdr_threshold {
                log::debug!("mote {id}: relocating outlier cell {worst_slot} to {neighbor} (pdr={worst_pdr:.2}, bundle avg={bundle_avg_excl_worst:.2})");
                self.relocate_cell(id, neighbor, worst_slot);
                self.motes[id as usize].top_tx_relocated_cells += 1;
                continue;
            }

            let theoretical = self.topology.pdr(neighbor as usize, id as usize);
            let bundle_avg: f64 = pdrs.iter().map(|(_, p)| p).sum::<f64>() / pdrs.len() as f64;
            if bundle_avg < theoretical / self.settings.top_pdr_threshold {
                log::debug!("mote {id}: relocating whole bundle to {neighbor} (bundle avg={bundle_avg:.2}, theoretical={theoretical:.2})");
                let relocated = pdrs.len() as u64;
                for (slot, _) in pdrs {
                    self.relocate_cell(id, neighbor, slot);
                }
                self.motes[id as usize].top_tx_relocated_cells += relocated;
            }
        }
    }

    fn relocate_cell(&mut self, id: MoteId, neighbor: MoteId, worst_slot: u16) {
        self.sixtop_initiate_add(id, neighbor, CellDirection::Tx, 1);
        self.motes[id as usize].remove_cell(worst_slot);
    }

    /// §4.9 "RX relocation": add-before-remove, authoritative per the design
    /// decision on the add-before-remove race (§9 Open Questions).
    fn rx_relocation(&mut self, id: MoteId) {
        let collided: Vec<(u16, MoteId)> = self.motes[id as usize]
            .schedule
            .iter()
            .filter(|(_, c)| c.dir == CellDirection::Rx && c.rx_detected_collision)
            .filter_map(|(&s, c)| c.neighbor.map(|n| (s, n)))
            .collect();

        for (slot, neighbor) in collided {
            let before = self.motes[id as usize].num_cells_from(neighbor);
            self.sixtop_initiate_add(id, neighbor, CellDirection::Rx, 1);
            let after = self.motes[id as usize].num_cells_from(neighbor);
            if after > before {
                self.motes[id as usize].remove_cell(slot);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::QueuingModel;
    use crate::test_support::test_simulation;

    #[test]
    fn req_allocates_inverse_direction_cells_and_sends_answer() {
        let mut sim = test_simulation(2, QueuingModel::Synchronous);
        let control = ControlPayload {
            op: ControlOp::Req,
            dir: CellDirection::Tx,
            requested_cells: 2,
            already_used_slots: vec![],
            cells: vec![],
            seq: 1,
            otf_signal: None,
        };
        sim.sixtop_handle_req(1, 0, &control);
        let rx_cells: Vec<_> = sim.motes[1].schedule.values().filter(|c| c.dir == CellDirection::Rx).collect();
        assert_eq!(rx_cells.len(), 2);
        assert!(sim.motes[1].pending_transaction.is_some());
    }

    #[test]
    fn full_two_phase_negotiation_leaves_symmetric_schedules() {
        let mut sim = test_simulation(2, QueuingModel::Synchronous);
        sim.sixtop_initiate_add(0, 1, CellDirection::Tx, 2);
        // Synchronous queuing dispatches req/answer/confirmation immediately via send_control.
        assert!(sim.motes[0].pending_transaction.is_none(), "initiator clears after sending confirmation");
        assert!(sim.motes[1].pending_transaction.is_none(), "responder clears on confirmation");
        assert_eq!(sim.motes[0].num_cells_to(1), sim.motes[1].num_cells_from(0));
        assert_eq!(sim.motes[0].num_cells_to(1), 2);
    }

    #[test]
    fn transaction_timeout_aborts_and_rolls_back_allocated_cells() {
        let mut sim = test_simulation(2, QueuingModel::Single);
        sim.sixtop_initiate_add(0, 1, CellDirection::Tx, 1);
        sim.motes[0].pending_transaction.as_mut().unwrap().allocated_cells = vec![5];
        sim.motes[0].install_cell(5, Cell::new(0, CellDirection::Tx, Some(1), 0));

        for _ in 0..TRANSACTION_TIMEOUT {
            sim.top_housekeeping(0);
        }
        assert!(sim.motes[0].pending_transaction.is_none());
        assert_eq!(sim.motes[0].transaction_aborted, 1);
        assert!(!sim.motes[0].schedule.contains_key(&5));
    }

    #[test]
    fn worst_cell_relocation_triggers_on_outlier_pdr() {
        let mut sim = test_simulation(2, QueuingModel::Single);
        sim.settings.no_top_housekeeping = false;
        let slots = [(0u16, 1.0), (1, 1.0), (2, 1.0), (3, 0.2)];
        for &(slot, pdr) in &slots {
            let mut cell = Cell::new(0, CellDirection::Tx, Some(1), 0);
            let acked = (pdr * 10.0) as u32;
            for _ in 0..acked {
                cell.record_tx_outcome(true);
            }
            for _ in acked..10 {
                cell.record_tx_outcome(false);
            }
            sim.motes[0].schedule.insert(slot, cell);
        }
        sim.top_housekeeping(0);
        assert_eq!(sim.motes[0].top_tx_relocated_cells, 1);
        assert!(!sim.motes[0].schedule.contains_key(&3));
    }
}
