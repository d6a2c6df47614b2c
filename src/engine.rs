//! Slotted discrete-event engine (§4.1, §5).
//!
//! Single-threaded and cooperative: callbacks never suspend, and the queue is a
//! plain min-heap keyed by `(asn, priority, insertion order)`. The reference
//! codebase owns its virtual clock behind a singleton (`time_driver.rs`); here
//! that ownership is an explicit struct per the Design Notes instruction against
//! hidden globals, and since callbacks in this crate never need to suspend mid-slot
//! there is no `async` executor underneath — just a classic DES priority queue,
//! using the lazy-deletion pattern `BinaryHeap` itself doesn't support natively.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

pub type Asn = u64;
pub type MoteId = u32;

/// Identifies one schedulable callback slot. Re-scheduling the same tag replaces
/// any still-pending instance (§4.1: "if uniqueTag already scheduled, replace it").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventTag {
    ActiveCell(MoteId),
    Propagation,
    AppSendData(MoteId),
    RplDio(MoteId),
    OtfHousekeeping(MoteId),
    TopHousekeeping(MoteId),
    /// Synchronous control delivery used only under `QueuingModel::Synchronous`
    /// (§4.9: "performs the exchange synchronously by calling B directly").
    ControlDelivery(MoteId),
}

/// Priority conventions from §4.1: smaller fires earlier within the same ASN.
pub mod priority {
    pub const ACTIVE_CELL: u8 = 0;
    pub const PROPAGATION: u8 = 1;
    pub const APP_SEND_DATA: u8 = 2;
    pub const RPL_DIO: u8 = 3;
    pub const OTF_HOUSEKEEPING: u8 = 4;
    pub const TOP_HOUSEKEEPING: u8 = 5;
    pub const CONTROL_SEND_REQUEST: u8 = 10;
    pub const CONTROL_SEND_ANSWER: u8 = 11;
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct HeapKey {
    asn: Asn,
    priority: u8,
    seq: u64,
}

impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse the natural (asn, priority, seq)
        // ordering so the smallest tuple (earliest, highest-priority, oldest) pops first.
        (other.asn, other.priority, other.seq).cmp(&(self.asn, self.priority, self.seq))
    }
}

impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct HeapEntry {
    key: HeapKey,
    tag: EventTag,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}
impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// ASN-indexed, priority-ordered event queue.
pub struct Engine {
    asn: Asn,
    heap: BinaryHeap<HeapEntry>,
    /// Maps a still-valid tag to the sequence number of its current heap entry,
    /// so popped entries made stale by `remove_event` or a replacing schedule
    /// call are silently skipped (lazy deletion — `BinaryHeap` has no
    /// `remove`/`decrease-key` of its own).
    live: HashMap<EventTag, u64>,
    next_seq: u64,
}

impl Engine {
    pub fn new() -> Self {
        Engine {
            asn: 0,
            heap: BinaryHeap::new(),
            live: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn asn(&self) -> Asn {
        self.asn
    }

    /// Install a one-shot event at an absolute ASN, replacing any pending
    /// instance with the same tag.
    pub fn schedule_at_asn(&mut self, asn: Asn, tag: EventTag, priority: u8) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.live.insert(tag, seq);
        self.heap.push(HeapEntry {
            key: HeapKey { asn, priority, seq },
            tag,
        });
    }

    /// `scheduleAtAsn(currentAsn + ceil(delay/slotDuration), ...)`.
    pub fn schedule_in(&mut self, delay_slots: u64, tag: EventTag, priority: u8) {
        self.schedule_at_asn(self.asn + delay_slots.max(1), tag, priority);
    }

    /// Cancel a pending event by tag, if any.
    pub fn remove_event(&mut self, tag: EventTag) {
        self.live.remove(&tag);
    }

    /// Whether `tag` currently has a pending, non-cancelled instance.
    pub fn is_scheduled(&self, tag: EventTag) -> bool {
        self.live.contains_key(&tag)
    }

    /// Pop the globally earliest, highest-priority, oldest-inserted still-valid
    /// event and advance the ASN clock to it. Re-entrant scheduling during
    /// dispatch is safe: a handler calling `schedule_at_asn` for the current
    /// (or an earlier, impossible) ASN is folded into the same heap and will be
    /// popped in its correct priority order before the engine moves on.
    pub fn step(&mut self) -> Option<(Asn, EventTag)> {
        loop {
            let entry = self.heap.pop()?;
            match self.live.get(&entry.tag) {
                Some(&seq) if seq == entry.key.seq => {
                    self.live.remove(&entry.tag);
                    self.asn = entry.key.asn;
                    log::trace!("asn={}: firing {:?}", entry.key.asn, entry.tag);
                    return Some((entry.key.asn, entry.tag));
                }
                _ => continue, // stale: replaced or removed since insertion
            }
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_ascending_asn_then_priority_order() {
        let mut engine = Engine::new();
        engine.schedule_at_asn(5, EventTag::Propagation, priority::PROPAGATION);
        engine.schedule_at_asn(5, EventTag::ActiveCell(1), priority::ACTIVE_CELL);
        engine.schedule_at_asn(3, EventTag::RplDio(2), priority::RPL_DIO);

        let (asn1, tag1) = engine.step().unwrap();
        assert_eq!(asn1, 3);
        assert_eq!(tag1, EventTag::RplDio(2));

        let (asn2, tag2) = engine.step().unwrap();
        assert_eq!(asn2, 5);
        assert_eq!(tag2, EventTag::ActiveCell(1));

        let (asn3, tag3) = engine.step().unwrap();
        assert_eq!(asn3, 5);
        assert_eq!(tag3, EventTag::Propagation);

        assert!(engine.step().is_none());
    }

    #[test]
    fn ties_broken_by_insertion_order() {
        let mut engine = Engine::new();
        engine.schedule_at_asn(1, EventTag::ActiveCell(1), priority::ACTIVE_CELL);
        engine.schedule_at_asn(1, EventTag::ActiveCell(2), priority::ACTIVE_CELL);
        engine.schedule_at_asn(1, EventTag::ActiveCell(3), priority::ACTIVE_CELL);

        let mut order = Vec::new();
        while let Some((_, tag)) = engine.step() {
            order.push(tag);
        }
        assert_eq!(
            order,
            vec![EventTag::ActiveCell(1), EventTag::ActiveCell(2), EventTag::ActiveCell(3)]
        );
    }

    #[test]
    fn rescheduling_same_tag_replaces_pending_instance() {
        let mut engine = Engine::new();
        engine.schedule_at_asn(10, EventTag::OtfHousekeeping(1), priority::OTF_HOUSEKEEPING);
        engine.schedule_at_asn(2, EventTag::OtfHousekeeping(1), priority::OTF_HOUSEKEEPING);

        let (asn, tag) = engine.step().unwrap();
        assert_eq!(asn, 2);
        assert_eq!(tag, EventTag::OtfHousekeeping(1));
        assert!(engine.step().is_none(), "stale instance at asn=10 must not fire");
    }

    #[test]
    fn remove_event_cancels_pending_instance() {
        let mut engine = Engine::new();
        engine.schedule_at_asn(10, EventTag::TopHousekeeping(1), priority::TOP_HOUSEKEEPING);
        engine.remove_event(EventTag::TopHousekeeping(1));
        assert!(engine.step().is_none());
    }

    #[test]
    fn reentrant_scheduling_during_dispatch_is_ordered_correctly() {
        let mut engine = Engine::new();
        engine.schedule_at_asn(1, EventTag::ActiveCell(1), priority::ACTIVE_CELL);

        let (asn, tag) = engine.step().unwrap();
        assert_eq!((asn, tag), (1, EventTag::ActiveCell(1)));
        // Handler re-enters scheduling at the same ASN with an earlier priority.
        engine.schedule_at_asn(1, EventTag::Propagation, priority::PROPAGATION);
        engine.schedule_at_asn(1, EventTag::ActiveCell(2), priority::ACTIVE_CELL);

        let (_, tag2) = engine.step().unwrap();
        assert_eq!(tag2, EventTag::Propagation);
        let (_, tag3) = engine.step().unwrap();
        assert_eq!(tag3, EventTag::ActiveCell(2));
    }

    #[test]
    fn asn_starts_at_zero() {
        let engine = Engine::new();
        assert_eq!(engine.asn(), 0);
    }
}
