//! Topology initializer: mote placement and RSSI/PDR derivation.
//!
//! Full topology *placement* (scene authoring, obstacle layout, CLI-driven scene
//! files) is an external collaborator; what belongs in the
//! core is the narrow contract it leans on: every mote ends up with a neighbor
//! RSSI map and a neighbor PDR map before `boot()`. The log-distance path-loss
//! model and the RSSI→PDR staircase mirror the reference's own
//! `signal_calculations.rs` (`calculate_path_loss`, `calculate_rssi`) and
//! `geometry.rs` (squared-distance helper), adapted from a LoRa link budget to a
//! plain monotone mapping.

use rand::Rng;

/// A 2-D position in meters, used only to derive distances for the default
/// placement; nothing downstream depends on positions directly.
#[derive(Debug, Clone, Copy)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

fn distance(a: Position, b: Position) -> f64 {
    let dx = a.x - b.x;
    let dy = a.y - b.y;
    (dx * dx + dy * dy).sqrt()
}

/// Log-distance path-loss parameters, same shape as the reference's
/// `PathLossParameters`.
#[derive(Debug, Clone)]
pub struct PathLossParameters {
    pub path_loss_exponent: f64,
    pub path_loss_at_reference_distance_db: f64,
    pub tx_power_dbm: f64,
}

impl Default for PathLossParameters {
    fn default() -> Self {
        PathLossParameters {
            path_loss_exponent: 2.7,
            path_loss_at_reference_distance_db: 40.0,
            tx_power_dbm: 0.0,
        }
    }
}

fn path_loss_db(distance_m: f64, params: &PathLossParameters) -> f64 {
    if distance_m < 1.0 {
        return params.path_loss_at_reference_distance_db;
    }
    params.path_loss_at_reference_distance_db + 10.0 * params.path_loss_exponent * distance_m.log10()
}

/// Monotone non-decreasing RSSI→PDR staircase (§4.3): 0 near -97 dBm, 1 above
/// about -85 dBm, ramping in between. Externally provided per the specification;
/// this is a standalone, swappable default.
pub fn rssi_to_pdr(rssi_dbm: f32) -> f64 {
    const STEPS: &[(f32, f64)] = &[
        (-97.0, 0.0),
        (-96.0, 0.1),
        (-95.0, 0.2),
        (-94.0, 0.3),
        (-93.0, 0.4),
        (-91.0, 0.55),
        (-89.0, 0.7),
        (-87.0, 0.85),
        (-85.0, 1.0),
    ];
    if rssi_dbm <= STEPS[0].0 {
        return 0.0;
    }
    if rssi_dbm >= STEPS[STEPS.len() - 1].0 {
        return 1.0;
    }
    for window in STEPS.windows(2) {
        let (lo_rssi, lo_pdr) = window[0];
        let (hi_rssi, hi_pdr) = window[1];
        if rssi_dbm >= lo_rssi && rssi_dbm <= hi_rssi {
            let frac = (rssi_dbm - lo_rssi) / (hi_rssi - lo_rssi);
            return lo_pdr + frac as f64 * (hi_pdr - lo_pdr);
        }
    }
    1.0
}

/// Per-mote neighbor tables plus the end-of-run topology record (§6).
pub struct Topology {
    pub num_motes: usize,
    pub positions: Vec<Position>,
    /// `rssi[i][j]` is the RSSI (dBm) with which mote `i` hears mote `j`.
    pub rssi: Vec<Vec<f32>>,
    /// `pdr[i][j]` is the PDR at which mote `i` hears mote `j`.
    pub pdr: Vec<Vec<f64>>,
    /// Populated by the simulation driver at run end (§6 Topology record).
    pub average_charge_per_cycle: Vec<f64>,
}

impl Topology {
    /// Deterministic default placement (motes scattered in a square, seeded by
    /// the caller's RNG) plus derived RSSI/PDR tables. Real topology authoring
    /// (scene files, obstacles) lives outside this crate.
    pub fn generate(num_motes: usize, world_side_m: f64, params: &PathLossParameters, rng: &mut impl Rng) -> Self {
        let positions: Vec<Position> = (0..num_motes)
            .map(|_| Position {
                x: rng.gen_range(0.0..world_side_m),
                y: rng.gen_range(0.0..world_side_m),
            })
            .collect();

        let mut rssi = vec![vec![f32::NEG_INFINITY; num_motes]; num_motes];
        let mut pdr = vec![vec![0.0; num_motes]; num_motes];
        for i in 0..num_motes {
            for j in 0..num_motes {
                if i == j {
                    continue;
                }
                let d = distance(positions[i], positions[j]);
                let r = (params.tx_power_dbm - path_loss_db(d, params)) as f32;
                rssi[i][j] = r;
                pdr[i][j] = rssi_to_pdr(r);
            }
        }

        log::info!("generated topology: {num_motes} motes in a {world_side_m}m square");
        Topology {
            num_motes,
            positions,
            rssi,
            pdr,
            average_charge_per_cycle: vec![0.0; num_motes],
        }
    }

    /// Build a topology directly from caller-supplied RSSI/PDR tables (e.g. a
    /// hand-authored two/three-mote scenario), bypassing placement entirely.
    pub fn from_tables(positions: Vec<Position>, rssi: Vec<Vec<f32>>, pdr: Vec<Vec<f64>>) -> Self {
        let num_motes = positions.len();
        Topology {
            num_motes,
            positions,
            rssi,
            pdr,
            average_charge_per_cycle: vec![0.0; num_motes],
        }
    }

    pub fn rssi(&self, from: usize, to: usize) -> f32 {
        self.rssi[from][to]
    }

    pub fn pdr(&self, from: usize, to: usize) -> f64 {
        self.pdr[from][to]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn rssi_to_pdr_is_monotone_and_bounded() {
        let samples: Vec<f32> = (-100..=-80).map(|v| v as f32).collect();
        let mut last = 0.0;
        for &rssi in &samples {
            let pdr = rssi_to_pdr(rssi);
            assert!((0.0..=1.0).contains(&pdr));
            assert!(pdr >= last - 1e-9, "pdr should be non-decreasing");
            last = pdr;
        }
        assert_eq!(rssi_to_pdr(-97.0), 0.0);
        assert_eq!(rssi_to_pdr(-85.0), 1.0);
        assert_eq!(rssi_to_pdr(-50.0), 1.0);
        assert_eq!(rssi_to_pdr(-150.0), 0.0);
    }

    #[test]
    fn generated_topology_has_symmetric_shape_and_no_self_links() {
        let mut rng = StdRng::seed_from_u64(7);
        let topo = Topology::generate(5, 200.0, &PathLossParameters::default(), &mut rng);
        assert_eq!(topo.num_motes, 5);
        for i in 0..5 {
            assert_eq!(topo.rssi[i][i], f32::NEG_INFINITY);
            for j in 0..5 {
                if i != j {
                    assert!(topo.pdr[i][j] >= 0.0 && topo.pdr[i][j] <= 1.0);
                }
            }
        }
    }

    #[test]
    fn from_tables_round_trips_caller_supplied_values() {
        let positions = vec![Position { x: 0.0, y: 0.0 }, Position { x: 50.0, y: 0.0 }];
        let rssi = vec![vec![f32::NEG_INFINITY, -70.0], vec![-70.0, f32::NEG_INFINITY]];
        let pdr = vec![vec![0.0, 1.0], vec![1.0, 0.0]];
        let topo = Topology::from_tables(positions, rssi, pdr);
        assert_eq!(topo.rssi(0, 1), -70.0);
        assert_eq!(topo.pdr(1, 0), 1.0);
    }
}
