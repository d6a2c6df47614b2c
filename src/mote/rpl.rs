//! RPL: DIO emission, rank computation, parent-set hysteresis (§4.7).

use crate::engine::{priority, EventTag, MoteId};
use crate::simulation::Simulation;

/// RFC 6550 default (§4.7 step 1).
pub const RPL_MIN_HOP_RANK_INCREASE: u32 = 256;
/// Per-hop rank-increase cap. The distilled spec leaves this a free
/// parameter (§9 does not flag it as an open question, but a finite cap is
/// needed for `min(RPL_MAX_RANK_INCREASE, ...)` to ever bind); four hops'
/// worth of minimum increase is a generous, stability-preserving choice —
/// recorded in the design notes.
pub const RPL_MAX_RANK_INCREASE: u32 = 4 * RPL_MIN_HOP_RANK_INCREASE;
/// Large but finite total-rank ceiling (§4.7 step 1).
pub const RPL_MAX_TOTAL_RANK: u32 = 256 * RPL_MIN_HOP_RANK_INCREASE;
/// Preferred-parent/parent-set stickiness threshold, ~1.5 hops (§4.7 step 3, §8 scenario 5).
pub const PARENT_SWITCH_THRESHOLD: u32 = 768;
/// ETX cap used both here (numerical stability) and by OTF (§4.8 step 3).
pub const RPL_MAX_ETX: u32 = 4;

/// `1/PDR` estimator, capped at `RPL_MAX_ETX` and guarded against `pdr == 0`.
pub fn etx(pdr: f64) -> f64 {
    if pdr <= 0.0 {
        return RPL_MAX_ETX as f64;
    }
    (1.0 / pdr).min(RPL_MAX_ETX as f64)
}

impl Simulation {
    /// §4.7: "sending" a DIO is a direct in-memory update to every neighbor
    /// that can hear `id`.
    pub fn rpl_dio(&mut self, id: MoteId) {
        let asn = self.engine.asn();
        if let Some(rank) = self.motes[id as usize].rank {
            let dag_rank = self.motes[id as usize].dag_rank.unwrap_or(0);
            let heard: Vec<MoteId> = (0..self.motes.len() as MoteId)
                .filter(|&n| n != id)
                .filter(|&n| self.topology.rssi(id as usize, n as usize) > self.motes[n as usize].min_rssi_dbm)
                .collect();

            for n in heard {
                let should_housekeep = self.motes[n as usize].rank.is_none() || rank < self.motes[n as usize].rank.unwrap();
                self.motes[n as usize].neighbor_rank.insert(id, rank);
                self.motes[n as usize].neighbor_dag_rank.insert(id, dag_rank);
                *self.motes[n as usize].dio_hear_count.entry(id).or_insert(0) += 1;
                if self.motes[n as usize].preferred_parent == Some(id) {
                    self.motes[n as usize].time_corrected_slot = asn;
                }
                if should_housekeep && !self.motes[n as usize].is_root {
                    self.rpl_housekeeping(n);
                }
            }
        }

        let delay = self.jittered_slots(self.settings.dio_period_s, 0.9, 1.1);
        self.engine.schedule_in(delay, EventTag::RplDio(id), priority::RPL_DIO);
    }

    /// §4.7 steps 1-6.
    pub fn rpl_housekeeping(&mut self, id: MoteId) {
        let old_set = self.motes[id as usize].parent_set.clone();
        let old_pref = self.motes[id as usize].preferred_parent;

        let neighbor_entries: Vec<(MoteId, u32)> = self.motes[id as usize].neighbor_rank.iter().map(|(&n, &r)| (n, r)).collect();

        // `candidates`: (neighbor id, neighbor's own advertised rank, our
        // potential rank through it, rank increase).
        let mut candidates: Vec<(MoteId, u32, u32, u32)> = Vec::new();
        for (n, neighbor_rank) in neighbor_entries {
            let pdr = self.topology.pdr(n as usize, id as usize);
            let rank_increase = (2.0 * RPL_MIN_HOP_RANK_INCREASE as f64 * etx(pdr)).round() as u32;
            let cap = RPL_MAX_RANK_INCREASE.min(RPL_MAX_TOTAL_RANK.saturating_sub(neighbor_rank));
            if rank_increase > cap {
                continue;
            }
            candidates.push((n, neighbor_rank, neighbor_rank + rank_increase, rank_increase));
        }
        if candidates.is_empty() {
            return;
        }
        candidates.sort_by_key(|c| c.2);

        // Steps 2-3: pick the preferred parent first. Hysteresis: a candidate
        // already holding the preferred-parent slot keeps it unless some other
        // candidate clears the full `PARENT_SWITCH_THRESHOLD`.
        let best = candidates[0];
        let new_pref = match old_pref.and_then(|p| candidates.iter().find(|c| c.0 == p)) {
            Some(cur) => {
                if best.0 != cur.0 && best.2 + PARENT_SWITCH_THRESHOLD <= cur.2 {
                    best.0
                } else {
                    cur.0
                }
            }
            None => best.0,
        };

        if old_pref != Some(new_pref) {
            self.motes[id as usize].rpl_churn_pref_parent += 1;
            log::debug!("mote {id}: preferred parent changed from {old_pref:?} to {new_pref}");
        }

        let new_pref_rank = candidates.iter().find(|c| c.0 == new_pref).map(|c| c.2).unwrap_or(best.2);

        // Step 4: new parent set = first 3 candidates whose own advertised
        // rank is strictly below our new rank (loop prevention), ordered with
        // the same in-set hysteresis bonus as the preferred-parent choice.
        let mut ordered: Vec<(MoteId, u32, u32, u32)> = candidates.iter().copied().filter(|c| c.1 < new_pref_rank).collect();
        ordered.sort_by_key(|c| if old_set.contains(&c.0) { (c.2 as i64 - PARENT_SWITCH_THRESHOLD as i64) } else { c.2 as i64 });
        let new_parent_set: Vec<MoteId> = ordered.into_iter().take(3).map(|c| c.0).collect();

        self.motes[id as usize].preferred_parent = Some(new_pref);
        self.motes[id as usize].parent_set = new_parent_set.clone();
        self.motes[id as usize].rank = Some(new_pref_rank);
        self.motes[id as usize].dag_rank = Some(new_pref_rank / RPL_MIN_HOP_RANK_INCREASE);

        // §4.7 step 5: traffic portion, inverse-rank-normalized.
        let mut etx_sum = 0.0;
        let mut per_parent = Vec::new();
        for &p in &new_parent_set {
            if let Some(c) = candidates.iter().find(|c| c.0 == p) {
                let e = 1.0 / (c.2 as f64).max(1.0);
                per_parent.push((p, e));
                etx_sum += e;
            }
        }
        self.motes[id as usize].traffic_portion.clear();
        if etx_sum > 0.0 {
            for (p, e) in per_parent {
                self.motes[id as usize].traffic_portion.insert(p, e / etx_sum);
            }
        }

        // §4.7 step 6.
        let dropped: Vec<MoteId> = old_set.into_iter().filter(|n| !new_parent_set.contains(n)).collect();
        for n in dropped {
            let busy = matches!(&self.motes[id as usize].pending_transaction, Some(p) if p.peer == n);
            if busy {
                continue;
            }
            let cells = self.motes[id as usize].tx_cells_to(n);
            for slot in cells {
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

    fn setup(threshold_gap: u32) -> Simulation {
        let mut sim = test_simulation(3, QueuingModel::Single);
        sim.motes[1].rank = Some(RPL_MIN_HOP_RANK_INCREASE);
        sim.motes[1].dag_rank = Some(1);
        sim.motes[1].preferred_parent = Some(0);
        sim.motes[1].parent_set = vec![0];
        sim.motes[1].neighbor_rank.insert(0, 1000);
        // A second candidate whose potential rank is `threshold_gap` better than the current parent.
        sim.motes[1].neighbor_rank.insert(2, 1000 - threshold_gap);
        sim
    }

    #[test]
    fn small_rank_improvement_does_not_switch_preferred_parent() {
        let mut sim = setup(500);
        sim.rpl_housekeeping(1);
        assert_eq!(sim.motes[1].preferred_parent, Some(0));
        assert_eq!(sim.motes[1].rpl_churn_pref_parent, 0);
    }

    #[test]
    fn rank_improvement_past_threshold_switches_preferred_parent() {
        let mut sim = setup(PARENT_SWITCH_THRESHOLD);
        sim.rpl_housekeeping(1);
        assert_eq!(sim.motes[1].preferred_parent, Some(2));
        assert_eq!(sim.motes[1].rpl_churn_pref_parent, 1);
    }

    #[test]
    fn etx_is_capped_and_guards_zero_pdr() {
        assert_eq!(etx(0.0), RPL_MAX_ETX as f64);
        assert!((etx(1.0) - 1.0).abs() < 1e-9);
        assert_eq!(etx(0.1), RPL_MAX_ETX as f64);
    }
}
