//! Statistics sink (§6, §10.4).
//!
//! Statistics-file formatting is an external collaborator; what belongs to
//! the core is the boundary it polls at cycle
//! end. That boundary is a trait, matching the reference's own cycle-boundary
//! push (`ui_refresh_tx.send(UIRefreshState::RadioMessagesCountUpdated(...))`)
//! but de-async'd into a plain synchronous call, since this simulator has no
//! channel or executor underneath it.

/// Per-cycle aggregate counters (§6, §7, §8).
#[derive(Debug, Clone, Default)]
pub struct CycleStats {
    pub run_num: u32,
    pub cycle: u32,

    pub app_reaches_dagroot: u64,
    pub dropped_queue_full: u64,
    pub dropped_no_route: u64,
    pub dropped_no_tx_cells: u64,
    pub dropped_mac_retries: u64,
    pub dropped_app_failed_enqueue_control: u64,
    pub transaction_aborted: u64,
    pub rpl_churn_pref_parent: u64,
    pub top_tx_relocated_cells: u64,

    pub schedule_collisions: u64,
    pub collided_txs: u64,
    pub effective_collided_txs: u64,
    pub collided_controls: u64,
    pub effective_collided_controls: u64,
    pub collided_answers: u64,
    pub collided_requests: u64,

    /// Sum of per-packet latencies (in slots) for DATA packets that reached the
    /// root this cycle; divide by `latency_count` for the mean.
    pub latency_sum_slots: u64,
    pub latency_count: u64,
}

impl CycleStats {
    pub fn mean_latency_slots(&self) -> Option<f64> {
        if self.latency_count == 0 {
            None
        } else {
            Some(self.latency_sum_slots as f64 / self.latency_count as f64)
        }
    }
}

/// Polled once per cycle boundary by the simulation driver.
pub trait StatsSink {
    fn record_cycle(&mut self, stats: &CycleStats);
}

/// Discards everything; the default for runs that don't care about output.
#[derive(Debug, Default)]
pub struct NullStatsSink;

impl StatsSink for NullStatsSink {
    fn record_cycle(&mut self, _stats: &CycleStats) {}
}

/// In-memory recorder used by tests and by callers who want to inspect a run
/// without wiring their own file/columnar output.
#[derive(Debug, Default)]
pub struct RecordingStatsSink {
    pub cycles: Vec<CycleStats>,
}

impl StatsSink for RecordingStatsSink {
    fn record_cycle(&mut self, stats: &CycleStats) {
        self.cycles.push(stats.clone());
    }
}
