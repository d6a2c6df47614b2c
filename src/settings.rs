//! Simulation settings.
//!
//! `Settings` is an immutable configuration record read by every other module.
//! Loading it from a file, overlaying it with command-line flags, and formatting
//! run output are external collaborators and stay out of this crate; what's here
//! is the record itself plus the same kind of typed validation the reference
//! codebase applies to its own `Scene` configuration.

use serde::Deserialize;

/// Shared-slot queuing discipline (see §4.4, §4.9 of the design).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuingModel {
    /// No control channel: 6top exchanges are performed synchronously, in-memory.
    Synchronous = 0,
    /// Single control queue; an `answer` may pre-empt a non-answer head-of-line packet.
    Single = 1,
    /// Two control queues (high/normal priority).
    Dual = 2,
}

/// Error returned when a `Settings` record fails validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    ParseError(String),
    ValidationError(String),
}

impl std::fmt::Display for SettingsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettingsError::ParseError(msg) => write!(f, "failed to parse settings: {msg}"),
            SettingsError::ValidationError(msg) => write!(f, "invalid settings: {msg}"),
        }
    }
}

impl std::error::Error for SettingsError {}

/// Immutable run configuration (§6 External Interfaces).
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub slotframe_length: u16,
    pub slot_duration_s: f64,
    pub num_channels: u8,
    pub pk_period_s: f64,
    pub pk_period_var: f64,
    pub dio_period_s: f64,
    pub otf_housekeeping_period_s: f64,
    pub top_housekeeping_period_s: f64,
    pub otf_threshold: u32,
    pub top_pdr_threshold: f64,
    pub num_shared_slots: u16,
    pub min_rssi_dbm: f32,
    pub num_cycles_per_run: u32,
    #[serde(default)]
    pub num_packets_burst: Option<u32>,
    #[serde(default)]
    pub burst_time_s: Option<f64>,
    pub queuing: QueuingModel,
    pub opportunist: bool,
    pub bootstrap: bool,
    pub no_interference: bool,
    pub no_remove_worst_cell: bool,
    pub no_top_housekeeping: bool,
    pub ideal_allocation: bool,
    pub process_id: u32,
    /// Seed for the simulation's single `StdRng` (see design notes §10.5 on
    /// replacing the reference's implicit `thread_rng()` with an explicit,
    /// reproducible stream).
    pub rng_seed: u64,
}

impl Settings {
    /// Parse settings from a JSON document. Mirrors the reference's thin
    /// `serde_json::from_str::<Scene>` convenience loader; full configuration-file
    /// handling (profiles, CLI overlays) is an external collaborator.
    pub fn from_json_str(data: &str) -> Result<Self, SettingsError> {
        let settings: Settings = serde_json::from_str(data).map_err(|err| {
            log::warn!("failed to parse settings: {err}");
            SettingsError::ParseError(err.to_string())
        })?;
        settings.validate()?;
        log::info!("loaded settings: slotframe_length={}, {} shared slots, {} channels, seed={}", settings.slotframe_length, settings.num_shared_slots, settings.num_channels, settings.rng_seed);
        Ok(settings)
    }

    /// Range/consistency checks, the way `common/scene.rs` validates a loaded `Scene`.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.slotframe_length == 0 {
            return Err(SettingsError::ValidationError("slotframe_length must be > 0".into()));
        }
        if self.num_channels == 0 {
            return Err(SettingsError::ValidationError("num_channels must be > 0".into()));
        }
        if self.num_shared_slots == 0 || self.num_shared_slots as u32 > self.slotframe_length as u32 {
            return Err(SettingsError::ValidationError(
                "num_shared_slots must be in 1..=slotframe_length".into(),
            ));
        }
        if self.slot_duration_s <= 0.0 {
            return Err(SettingsError::ValidationError("slot_duration_s must be > 0".into()));
        }
        if self.pk_period_s <= 0.0 {
            return Err(SettingsError::ValidationError("pk_period_s must be > 0".into()));
        }
        if self.top_pdr_threshold <= 0.0 {
            return Err(SettingsError::ValidationError("top_pdr_threshold must be > 0".into()));
        }
        if self.num_cycles_per_run == 0 {
            return Err(SettingsError::ValidationError("num_cycles_per_run must be > 0".into()));
        }
        Ok(())
    }

    /// Length of one slotframe cycle, in seconds.
    pub fn cycle_duration_s(&self) -> f64 {
        self.slotframe_length as f64 * self.slot_duration_s
    }

    /// Offsets, within a slotframe, at which SHARED cells are installed at boot
    /// (§3 invariant: `i * floor(slotframeLength / numSharedSlots)`).
    pub fn shared_slot_offsets(&self) -> Vec<u16> {
        let step = self.slotframe_length / self.num_shared_slots;
        (0..self.num_shared_slots).map(|i| i * step).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "slotframe_length": 101,
            "slot_duration_s": 0.01,
            "num_channels": 16,
            "pk_period_s": 1.0,
            "pk_period_var": 0.1,
            "dio_period_s": 60.0,
            "otf_housekeeping_period_s": 1.0,
            "top_housekeeping_period_s": 60.0,
            "otf_threshold": 0,
            "top_pdr_threshold": 0.5,
            "num_shared_slots": 1,
            "min_rssi_dbm": -97.0,
            "num_cycles_per_run": 20,
            "queuing": "single",
            "opportunist": false,
            "bootstrap": false,
            "no_interference": false,
            "no_remove_worst_cell": false,
            "no_top_housekeeping": false,
            "ideal_allocation": false,
            "process_id": 0,
            "rng_seed": 42
        }"#
    }

    #[test]
    fn parses_valid_settings() {
        let settings = Settings::from_json_str(sample_json()).unwrap();
        assert_eq!(settings.slotframe_length, 101);
        assert_eq!(settings.queuing, QueuingModel::Single);
        assert_eq!(settings.shared_slot_offsets(), vec![0]);
    }

    #[test]
    fn rejects_zero_shared_slots() {
        let bad = sample_json().replace("\"num_shared_slots\": 1", "\"num_shared_slots\": 0");
        let err = Settings::from_json_str(&bad).unwrap_err();
        assert!(matches!(err, SettingsError::ValidationError(_)));
    }

    #[test]
    fn shared_slot_offsets_are_evenly_spaced() {
        let mut settings = Settings::from_json_str(sample_json()).unwrap();
        settings.slotframe_length = 100;
        settings.num_shared_slots = 4;
        assert_eq!(settings.shared_slot_offsets(), vec![0, 25, 50, 75]);
    }
}
