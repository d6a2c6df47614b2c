//! Shared scaffolding for unit tests spread across `mote::*` and `simulation`.

use crate::settings::{QueuingModel, Settings};
use crate::simulation::Simulation;
use crate::stats::NullStatsSink;
use crate::topology::{Position, Topology};

pub fn test_settings(queuing: QueuingModel) -> Settings {
    Settings {
        slotframe_length: 11,
        slot_duration_s: 0.01,
        num_channels: 4,
        pk_period_s: 1.0,
        pk_period_var: 0.1,
        dio_period_s: 60.0,
        otf_housekeeping_period_s: 5.0,
        top_housekeeping_period_s: 60.0,
        otf_threshold: 0,
        top_pdr_threshold: 0.5,
        num_shared_slots: 1,
        min_rssi_dbm: -97.0,
        num_cycles_per_run: 1,
        num_packets_burst: None,
        burst_time_s: None,
        queuing,
        opportunist: false,
        bootstrap: false,
        no_interference: true,
        no_remove_worst_cell: false,
        no_top_housekeeping: true,
        ideal_allocation: false,
        process_id: 0,
        rng_seed: 7,
    }
}

pub fn test_topology(num_motes: usize) -> Topology {
    let positions = vec![Position { x: 0.0, y: 0.0 }; num_motes];
    let rssi = vec![vec![-70.0f32; num_motes]; num_motes];
    let pdr = vec![vec![1.0f64; num_motes]; num_motes];
    Topology::from_tables(positions, rssi, pdr)
}

pub fn test_simulation(num_motes: usize, queuing: QueuingModel) -> Simulation {
    let mut sim = Simulation::new(test_settings(queuing), test_topology(num_motes), Box::new(NullStatsSink), 0);
    sim.boot();
    sim
}
