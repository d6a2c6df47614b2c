//! Per-slot propagation bookkeeping and channel math (§4.2, §4.3).
//!
//! This module owns the *shape* of one slot's airtime — the transmit/receive
//! intent lists and the SINR/capture math applied to them — the same
//! separation the reference draws between `network_task.rs`'s
//! `process_all_packet_receptions` and `signal_calculations.rs`'s pure dBm/mW
//! helpers. Resolving a slot also needs the mote arena, the topology's
//! RSSI tables, and the shared RNG, so the actual per-ASN loop lives on
//! `Simulation`; what's here is reusable without any of that context.

use crate::engine::{Asn, MoteId};
use crate::packet::Packet;

/// `dBmToMw(x) = 10^(x/10)` (§4.3).
pub fn dbm_to_mw(dbm: f32) -> f64 {
    10f64.powf(dbm as f64 / 10.0)
}

/// `mWToDbm(x) = 10*log10(x)` (§4.3).
pub fn mw_to_dbm(mw: f64) -> f32 {
    (10.0 * mw.log10()) as f32
}

/// One mote's transmit intent for the current ASN.
#[derive(Debug, Clone)]
pub struct TxIntent {
    pub channel: u8,
    pub smac: MoteId,
    pub dmac: MoteId,
    /// `smac`'s `calcTime()` at the moment the intent was registered; used
    /// only to break capture ties deterministically (§4.2 step 2).
    pub arrival_time_us: f64,
    pub packet: Packet,
}

/// One mote's receive intent for the current ASN.
#[derive(Debug, Clone, Copy)]
pub struct RxIntent {
    pub mote: MoteId,
    pub channel: u8,
}

/// Outcome of a transmission, fed into the transmitter's `txDone` (§4.5).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxOutcome {
    pub acked: bool,
    pub nacked: bool,
}

/// Outcome of a receive intent, fed into the receiver's `rxDone` (§4.6).
#[derive(Debug, Clone)]
pub enum RxOutcome {
    /// Frame was decoded and handed to the receiving mote.
    Delivered(Packet),
    /// A frame was present on the channel but not decodable by this receiver
    /// (wrong lock-on, or a losing SINR draw); sets `rxDetectedCollision`
    /// when a capture collision — as opposed to plain silence — was the cause.
    Collision { detected: bool },
    /// Nothing usable happened on this receiver's channel this slot.
    Idle,
}

/// Bookkeeping valid only within the current ASN (§4.2): two lists accumulated
/// by mote active-cell handlers and drained once per slot by the resolver.
#[derive(Debug, Default)]
pub struct PropagationState {
    transmissions: Vec<TxIntent>,
    receivers: Vec<RxIntent>,
    pub last_resolved_asn: Option<Asn>,
}

impl PropagationState {
    pub fn new() -> Self {
        PropagationState::default()
    }

    pub fn start_tx(&mut self, intent: TxIntent) {
        self.transmissions.push(intent);
    }

    pub fn start_rx(&mut self, mote: MoteId, channel: u8) {
        self.receivers.push(RxIntent { mote, channel });
    }

    pub fn transmissions(&self) -> &[TxIntent] {
        &self.transmissions
    }

    pub fn receivers(&self) -> &[RxIntent] {
        &self.receivers
    }

    pub fn clear(&mut self) {
        self.transmissions.clear();
        self.receivers.clear();
    }
}

/// SINR (in dB) of a signal at `signal_rssi_dbm` against the sum of the given
/// interferer RSSIs and a noise floor (§4.3 steps: S, I_i, SINR_dB).
pub fn sinr_db(signal_rssi_dbm: f32, interferer_rssi_dbm: &[f32], noise_dbm: f32) -> f32 {
    let noise_mw = dbm_to_mw(noise_dbm);
    let signal_mw = dbm_to_mw(signal_rssi_dbm) - noise_mw;
    if signal_mw < 0.0 {
        return -10.0;
    }
    let interference_mw: f64 = interferer_rssi_dbm
        .iter()
        .map(|&i| (dbm_to_mw(i) - noise_mw).max(0.0))
        .sum();
    mw_to_dbm(signal_mw / (interference_mw + noise_mw))
}

/// Effective RSSI fed into `Topology::rssi_to_pdr` (§4.3 last step): folds the
/// SINR back into an RSSI-like quantity against the same noise floor.
pub fn effective_rssi_for_pdr(sinr_db: f32, noise_dbm: f32) -> f32 {
    let noise_mw = dbm_to_mw(noise_dbm);
    mw_to_dbm(dbm_to_mw(sinr_db + noise_dbm) + noise_mw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dbm_mw_round_trip() {
        for dbm in [-100.0_f32, -70.0, -20.0, 0.0, 10.0] {
            let mw = dbm_to_mw(dbm);
            assert!((mw_to_dbm(mw) - dbm).abs() < 1e-3);
        }
    }

    #[test]
    fn sinr_with_no_interferers_reduces_to_signal_over_noise() {
        let sinr = sinr_db(-70.0, &[], -100.0);
        let expected = mw_to_dbm((dbm_to_mw(-70.0) - dbm_to_mw(-100.0)) / dbm_to_mw(-100.0));
        assert!((sinr - expected).abs() < 1e-3);
    }

    #[test]
    fn sinr_degrades_as_interferers_are_added() {
        let solo = sinr_db(-70.0, &[], -100.0);
        let with_one = sinr_db(-70.0, &[-75.0], -100.0);
        let with_two = sinr_db(-70.0, &[-75.0, -72.0], -100.0);
        assert!(with_one < solo);
        assert!(with_two < with_one);
    }

    #[test]
    fn signal_below_noise_floors_at_minus_ten_db() {
        assert_eq!(sinr_db(-120.0, &[], -100.0), -10.0);
    }

    #[test]
    fn transmissions_are_kept_in_registration_order() {
        let mut state = PropagationState::new();
        let make = |smac| TxIntent {
            channel: 0,
            smac,
            dmac: 99,
            arrival_time_us: 0.0,
            packet: Packet::new_data(0, smac, 0, 0, smac, 99),
        };
        state.start_tx(make(1));
        state.start_tx(make(2));
        state.start_tx(make(3));

        let smacs: Vec<MoteId> = state.transmissions().iter().map(|t| t.smac).collect();
        assert_eq!(smacs, vec![1, 2, 3]);
    }
}
