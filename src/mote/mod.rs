//! Mote state (§3).
//!
//! Motes live in a flat arena (`Simulation::motes: Vec<Mote>`) indexed by
//! `MoteId`, per the Design Notes instruction against ownership cycles for
//! mote-to-neighbor references — the same pattern the reference uses for its
//! `HashMap<u8, NodeState>` node registry, just with a dense `Vec` since ids
//! here are always `0..num_motes`.

pub mod mac;
pub mod otf;
pub mod rpl;
pub mod sixtop;

use crate::engine::{Asn, MoteId};
use crate::packet::{Cell, CellDirection, Packet, PendingTransaction};
use std::collections::{HashMap, VecDeque};

/// MAC max CSMA backoff exponent (§4.5).
pub const MAC_MAX_BE: u32 = 7;
/// MAC max CSMA backoff attempts before drop (§4.5).
pub const MAC_MAX_CSMA_BACKOFFS: u32 = 4;

/// What a mote is doing between registering intent with propagation and that
/// intent being resolved. Modeled as an explicit enum rather than a
/// reentrancy guard (§9: "never truly interleaves... implement as an explicit
/// enum").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitingFor {
    None,
    Rx,
    /// Idle-listening on a SHARED cell (§4.4).
    Shared,
}

/// Bounded FIFO wrapper; `push_back` returns `false` (and the caller counts a
/// `droppedQueueFull`) once `capacity` is reached.
#[derive(Debug, Clone)]
pub struct BoundedQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        BoundedQueue { items: VecDeque::new(), capacity }
    }

    pub fn push_back(&mut self, item: T) -> bool {
        if self.items.len() >= self.capacity {
            return false;
        }
        self.items.push_back(item);
        true
    }

    pub fn pop_front(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn front(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn front_mut(&mut self) -> Option<&mut T> {
        self.items.front_mut()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// Remove and return the first element matching `pred`, preserving the
    /// order of everything else (used for answer pre-emption, §4.4).
    pub fn remove_first<F: Fn(&T) -> bool>(&mut self, pred: F) -> Option<T> {
        let pos = self.items.iter().position(pred)?;
        self.items.remove(pos)
    }
}

const DATA_QUEUE_CAPACITY: usize = 10;
const CONTROL_QUEUE_CAPACITY: usize = 10;

/// A network node (§3). Fields are grouped roughly the way the distilled data
/// model lists them.
pub struct Mote {
    pub id: MoteId,
    pub is_root: bool,

    // --- RPL ---
    pub rank: Option<u32>,
    pub dag_rank: Option<u32>,
    pub parent_set: Vec<MoteId>,
    pub preferred_parent: Option<MoteId>,
    pub neighbor_rank: HashMap<MoteId, u32>,
    pub neighbor_dag_rank: HashMap<MoteId, u32>,
    pub dio_hear_count: HashMap<MoteId, u32>,
    pub traffic_portion: HashMap<MoteId, f64>,
    pub time_corrected_slot: Asn,

    // --- schedule ---
    pub schedule: HashMap<u16, Cell>,
    /// `reserve[slot][channel]`; best-effort local collision hint (§5).
    pub reserve: Vec<Vec<bool>>,
    pub cells_to: HashMap<MoteId, u32>,
    pub cells_from: HashMap<MoteId, u32>,

    // --- queues ---
    pub data_queue: BoundedQueue<Packet>,
    pub control_queue_high: BoundedQueue<Packet>,
    pub control_queue_normal: BoundedQueue<Packet>,

    // --- 6top ---
    pub seq_with_neighbor: HashMap<MoteId, u32>,
    pub expected_seq_from_neighbor: HashMap<MoteId, u32>,
    pub pending_transaction: Option<PendingTransaction>,
    pub request_triggered: HashMap<MoteId, bool>,
    pub otf_status: HashMap<MoteId, bool>,

    // --- MAC / radio ---
    pub waiting_for: WaitingFor,
    pub drift_ppm: f32,
    pub noise_dbm: f32,
    pub min_rssi_dbm: f32,
    pub send_control_delay: u32,
    pub mac_backoff_nb: u32,
    pub backoff_exponent: u32,
    pub pkt_to_send_alloc: Option<Packet>,

    // --- OTF ---
    pub moving_avg_incoming_traffic: HashMap<MoteId, f64>,

    // --- bookkeeping ---
    pub battery_charge: f64,
    pub app_reaches_dagroot: u64,
    pub dropped_queue_full: u64,
    pub dropped_no_route: u64,
    pub dropped_no_tx_cells: u64,
    pub dropped_mac_retries: u64,
    pub dropped_app_failed_enqueue_control: u64,
    pub transaction_aborted: u64,
    pub rpl_churn_pref_parent: u64,
    pub top_tx_relocated_cells: u64,
    pub latency_sum_slots: u64,
    pub latency_count: u64,
}

impl Mote {
    pub fn new(id: MoteId, is_root: bool, drift_ppm: f32, noise_dbm: f32, min_rssi_dbm: f32, slotframe_length: u16, num_channels: u8) -> Self {
        Mote {
            id,
            is_root,
            rank: if is_root { Some(0) } else { None },
            dag_rank: if is_root { Some(0) } else { None },
            parent_set: Vec::new(),
            preferred_parent: None,
            neighbor_rank: HashMap::new(),
            neighbor_dag_rank: HashMap::new(),
            dio_hear_count: HashMap::new(),
            traffic_portion: HashMap::new(),
            time_corrected_slot: 0,
            schedule: HashMap::new(),
            reserve: vec![vec![false; num_channels as usize]; slotframe_length as usize],
            cells_to: HashMap::new(),
            cells_from: HashMap::new(),
            data_queue: BoundedQueue::new(DATA_QUEUE_CAPACITY),
            control_queue_high: BoundedQueue::new(CONTROL_QUEUE_CAPACITY),
            control_queue_normal: BoundedQueue::new(CONTROL_QUEUE_CAPACITY),
            seq_with_neighbor: HashMap::new(),
            expected_seq_from_neighbor: HashMap::new(),
            pending_transaction: None,
            request_triggered: HashMap::new(),
            otf_status: HashMap::new(),
            waiting_for: WaitingFor::None,
            drift_ppm,
            noise_dbm,
            min_rssi_dbm,
            send_control_delay: 0,
            mac_backoff_nb: 0,
            backoff_exponent: 0,
            pkt_to_send_alloc: None,
            moving_avg_incoming_traffic: HashMap::new(),
            battery_charge: 0.0,
            app_reaches_dagroot: 0,
            dropped_queue_full: 0,
            dropped_no_route: 0,
            dropped_no_tx_cells: 0,
            dropped_mac_retries: 0,
            dropped_app_failed_enqueue_control: 0,
            transaction_aborted: 0,
            rpl_churn_pref_parent: 0,
            top_tx_relocated_cells: 0,
            latency_sum_slots: 0,
            latency_count: 0,
        }
    }

    /// Accumulated clock drift vs the DAG root, in microseconds, used only as
    /// a deterministic capture tiebreaker (§4.2 step 2).
    pub fn calc_time(&self, asn: Asn, slot_duration_s: f64) -> f64 {
        let elapsed_slots = asn.saturating_sub(self.time_corrected_slot) as f64;
        let elapsed_us = elapsed_slots * slot_duration_s * 1e6;
        elapsed_us * (self.drift_ppm as f64 / 1_000_000.0)
    }

    pub fn num_cells_to(&self, neighbor: MoteId) -> u32 {
        *self.cells_to.get(&neighbor).unwrap_or(&0)
    }

    pub fn num_cells_from(&self, neighbor: MoteId) -> u32 {
        *self.cells_from.get(&neighbor).unwrap_or(&0)
    }

    /// Install a cell, keeping `cellsTo`/`cellsFrom` and the reserve table
    /// consistent with the schedule (§3 invariant).
    pub fn install_cell(&mut self, slot: u16, cell: Cell) {
        if let Some(ch) = self.reserve.get_mut(slot as usize) {
            if let Some(slot_ch) = ch.get_mut(cell.channel as usize) {
                *slot_ch = true;
            }
        }
        match (cell.dir, cell.neighbor) {
            (CellDirection::Tx, Some(n)) => {
                *self.cells_to.entry(n).or_insert(0) += 1;
            }
            (CellDirection::Rx, Some(n)) => {
                *self.cells_from.entry(n).or_insert(0) += 1;
            }
            _ => {}
        }
        self.schedule.insert(slot, cell);
    }

    /// Remove a cell, if present, keeping counters and the reserve table
    /// consistent.
    pub fn remove_cell(&mut self, slot: u16) -> Option<Cell> {
        let cell = self.schedule.remove(&slot)?;
        if let Some(ch) = self.reserve.get_mut(slot as usize) {
            if let Some(slot_ch) = ch.get_mut(cell.channel as usize) {
                *slot_ch = false;
            }
        }
        match (cell.dir, cell.neighbor) {
            (CellDirection::Tx, Some(n)) => {
                if let Some(count) = self.cells_to.get_mut(&n) {
                    *count = count.saturating_sub(1);
                }
            }
            (CellDirection::Rx, Some(n)) => {
                if let Some(count) = self.cells_from.get_mut(&n) {
                    *count = count.saturating_sub(1);
                }
            }
            _ => {}
        }
        Some(cell)
    }

    pub fn tx_cells_to(&self, neighbor: MoteId) -> Vec<u16> {
        self.schedule
            .iter()
            .filter(|(_, c)| c.dir == CellDirection::Tx && c.neighbor == Some(neighbor))
            .map(|(&slot, _)| slot)
            .collect()
    }

    pub fn rx_cells_from(&self, neighbor: MoteId) -> Vec<u16> {
        self.schedule
            .iter()
            .filter(|(_, c)| c.dir == CellDirection::Rx && c.neighbor == Some(neighbor))
            .map(|(&slot, _)| slot)
            .collect()
    }

    pub fn next_outgoing_seq(&mut self, neighbor: MoteId) -> u32 {
        let seq = self.seq_with_neighbor.entry(neighbor).or_insert(0);
        *seq += 1;
        *seq
    }

    /// Push to the control queue appropriate for `high_priority`, counting
    /// `droppedAppFailedEnqueueControl` on overflow.
    pub fn enqueue_control(&mut self, packet: Packet, high_priority: bool) -> bool {
        let ok = if high_priority {
            self.control_queue_high.push_back(packet)
        } else {
            self.control_queue_normal.push_back(packet)
        };
        if !ok {
            self.dropped_app_failed_enqueue_control += 1;
            log::debug!("mote {}: control queue full, dropping outgoing control packet", self.id);
        }
        ok
    }
}
