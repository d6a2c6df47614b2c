//! Runnable entry point: builds a small default scenario in-process and runs
//! it to completion. Command-line argument parsing, configuration-file
//! loading, and statistics-file formatting are external collaborators and
//! have no counterpart here (see design notes on ambient scope) — this binary
//! exists so the crate has something real to execute end to end.

use env_logger::Builder;
use log::{info, LevelFilter};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tsch_mesh_simulator::settings::{QueuingModel, Settings};
use tsch_mesh_simulator::stats::RecordingStatsSink;
use tsch_mesh_simulator::topology::{PathLossParameters, Topology};
use tsch_mesh_simulator::Simulation;

fn default_settings() -> Settings {
    Settings {
        slotframe_length: 101,
        slot_duration_s: 0.01,
        num_channels: 16,
        pk_period_s: 1.0,
        pk_period_var: 0.1,
        dio_period_s: 60.0,
        otf_housekeeping_period_s: 1.0,
        top_housekeeping_period_s: 60.0,
        otf_threshold: 0,
        top_pdr_threshold: 0.5,
        num_shared_slots: 1,
        min_rssi_dbm: -97.0,
        num_cycles_per_run: 20,
        num_packets_burst: None,
        burst_time_s: None,
        queuing: QueuingModel::Single,
        opportunist: true,
        bootstrap: false,
        no_interference: false,
        no_remove_worst_cell: false,
        no_top_housekeeping: false,
        ideal_allocation: false,
        process_id: 0,
        rng_seed: 42,
    }
}

fn main() {
    let mut builder = Builder::new();
    builder
        .filter_level(LevelFilter::Info)
        .filter(Some("tsch_mesh_simulator"), LevelFilter::Debug);
    builder.init();

    let settings = default_settings();
    let mut placement_rng = StdRng::seed_from_u64(settings.rng_seed ^ 0xC0FFEE);
    let topology = Topology::generate(10, 200.0, &PathLossParameters::default(), &mut placement_rng);

    info!("booting {} motes, {} cycles per run", topology.num_motes, settings.num_cycles_per_run);

    let mut sim = Simulation::new(settings, topology, Box::new(RecordingStatsSink::default()), 0);
    sim.run();

    info!("run complete at asn={}", sim.engine.asn());
    let reached: u64 = sim.motes.iter().map(|m| m.app_reaches_dagroot).sum();
    let retries_exhausted: u64 = sim.motes.iter().map(|m| m.dropped_mac_retries).sum();
    info!("appReachesDagroot={reached} droppedMacRetries={retries_exhausted}");
}
