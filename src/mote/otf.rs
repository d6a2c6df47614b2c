//! On-the-fly bandwidth adaptation (§4.8).

use super::rpl::RPL_MAX_ETX;
use crate::engine::{priority, EventTag, MoteId};
use crate::packet::{CellDirection, ControlOp, ControlPayload};
use crate::simulation::Simulation;

/// EMA smoothing factor for per-neighbor incoming traffic (§4.8 step 1).
const TRAFFIC_EMA_ALPHA: f64 = 0.5;

impl Simulation {
    pub fn otf_housekeeping(&mut self, id: MoteId) {
        self.otf_update_moving_averages(id);
        let generated = self.otf_generated_traffic(id);

        let mut parents: Vec<(MoteId, f64)> = self.motes[id as usize].traffic_portion.iter().map(|(&n, &p)| (n, p)).collect();
        parents.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut carry = 0.0;
        for (parent, portion) in parents {
            let portion = portion + carry;
            carry = 0.0;
            let pdr = self.topology.pdr(id as usize, parent as usize);
            let etx = super::rpl::etx(pdr).min(RPL_MAX_ETX as f64);
            let req = (portion * generated * etx).ceil() as i64;
            let threshold = (portion * self.settings.otf_threshold as f64).ceil() as i64;
            let now = self.motes[id as usize].num_cells_to(parent) as i64;

            if req > now {
                let add_count = req - now + (threshold + 1) / 2;
                let satisfied = self.sixtop_try_add(id, parent, CellDirection::Tx, add_count.max(1) as u8);
                log::trace!("mote {id}: otf requesting {add_count} cells to {parent} (req={req}, now={now}), satisfied={satisfied}");
                if satisfied < add_count {
                    carry += (add_count - satisfied) as f64 / generated.max(1.0) / etx.max(1.0);
                }
            } else if now - req > threshold {
                let remove_count = (now - req - (threshold + 1) / 2).max(0);
                if remove_count > 0 {
                    log::trace!("mote {id}: otf surplus of {remove_count} cells to {parent} (req={req}, now={now})");
                    self.sixtop_remove_cells(id, parent, CellDirection::Tx, remove_count as u8);
                }
            }
        }

        self.otf_signal_children(id);

        let delay = self.jittered_slots(self.settings.otf_housekeeping_period_s, 0.9, 1.1);
        self.engine.schedule_in(delay, EventTag::OtfHousekeeping(id), priority::OTF_HOUSEKEEPING);
    }

    fn otf_update_moving_averages(&mut self, id: MoteId) {
        let rx_sources: std::collections::HashSet<MoteId> = self.motes[id as usize]
            .schedule
            .values()
            .filter(|c| c.dir == CellDirection::Rx)
            .filter_map(|c| c.neighbor)
            .collect();

        let mote = &mut self.motes[id as usize];
        mote.moving_avg_incoming_traffic.retain(|n, _| rx_sources.contains(n));
        for n in &rx_sources {
            let cur = mote.moving_avg_incoming_traffic.get(n).copied().unwrap_or(0.0);
            let avg = mote.moving_avg_incoming_traffic.entry(*n).or_insert(0.0);
            *avg = TRAFFIC_EMA_ALPHA * cur + (1.0 - TRAFFIC_EMA_ALPHA) * *avg;
        }
    }

    /// §4.8 step 2, expressed in pkts/cycle.
    fn otf_generated_traffic(&self, id: MoteId) -> f64 {
        let pk_period_slots = self.settings.pk_period_s / self.settings.slot_duration_s;
        let housekeeping_slots = self.settings.otf_housekeeping_period_s / self.settings.slot_duration_s;
        let relayed_rate: f64 = self.motes[id as usize].moving_avg_incoming_traffic.values().sum::<f64>() / housekeeping_slots;
        let own_rate = if self.motes[id as usize].is_root { 0.0 } else { 1.0 / pk_period_slots };
        (own_rate + relayed_rate) * self.settings.slotframe_length as f64
    }

    /// §4.8 step 5: advertise START/STOP to RX-source children for the
    /// opportunist logic they run on their own TX cells to us.
    fn otf_signal_children(&mut self, id: MoteId) {
        let children: Vec<MoteId> = self.motes[id as usize]
            .schedule
            .values()
            .filter(|c| c.dir == CellDirection::Rx)
            .filter_map(|c| c.neighbor)
            .collect();
        let queue_len = self.motes[id as usize].data_queue.len();
        let start = queue_len < 8; // room to accept opportunistic piggybacks
        for child in children {
            let payload = ControlPayload {
                op: ControlOp::Otf,
                dir: CellDirection::Rx,
                requested_cells: 0,
                already_used_slots: vec![],
                cells: vec![],
                seq: 0,
                otf_signal: Some(start),
            };
            self.send_control(id, child, ControlOp::Otf, payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::QueuingModel;
    use crate::test_support::test_simulation;

    #[test]
    fn moving_average_prunes_neighbors_no_longer_rx_sources() {
        let mut sim = test_simulation(2, QueuingModel::Single);
        sim.motes[0].moving_avg_incoming_traffic.insert(5, 3.0);
        sim.otf_update_moving_averages(0);
        assert!(!sim.motes[0].moving_avg_incoming_traffic.contains_key(&5));
    }

    #[test]
    fn generated_traffic_is_positive_for_non_root_with_no_relayed_traffic() {
        let sim = test_simulation(2, QueuingModel::Single);
        let r#gen = sim.otf_generated_traffic(1);
        assert!(r#gen > 0.0);
    }

    #[test]
    fn root_has_no_self_generated_traffic_component() {
        let sim = test_simulation(2, QueuingModel::Single);
        let gen_root = sim.otf_generated_traffic(0);
        assert_eq!(gen_root, 0.0);
    }
}
