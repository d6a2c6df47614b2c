//! A discrete-event simulator of a multi-hop TSCH/RPL/OTF/6top mesh network.

pub mod engine;
pub mod mote;
pub mod packet;
pub mod propagation;
pub mod settings;
pub mod simulation;
pub mod stats;
pub mod topology;

#[cfg(test)]
pub(crate) mod test_support;

pub use engine::{Asn, EventTag, MoteId};
pub use settings::{Settings, SettingsError};
pub use simulation::Simulation;
pub use stats::{CycleStats, NullStatsSink, RecordingStatsSink, StatsSink};
pub use topology::Topology;
