//! Deferred-queue admission and adjacent-sector merge decision logic.
//!
//! Kept separate from [`super::Device`] so the merge/queue-depth policy
//! is testable without a real (or in-memory) [`super::aio::BlockIo`]
//! backend — this module only decides *what* should be submitted next,
//! never performs the I/O itself.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use smallvec::SmallVec;

use crate::acl::MacAddr;

/// One AoE ATA read/write accepted by the device but not yet submitted
/// to the async I/O backend, either because the in-flight set is full
/// or because it is still waiting out its merge window.
#[derive(Debug, Clone)]
pub struct DeferredOp {
    pub tag: u32,
    pub netif_id: usize,
    pub mac: MacAddr,
    pub write: bool,
    pub lba: u64,
    pub sector_count: u32,
    /// Only populated for writes: the bytes to persist.
    pub payload: Vec<u8>,
    pub queued_at: Instant,
}

/// A submitted, not-yet-completed I/O operation. Two [`DeferredOp`]s
/// share one [`InFlightOp`] exactly when they were merged.
#[derive(Debug)]
pub struct InFlightOp {
    pub requests: SmallVec<[DeferredOp; 2]>,
    pub write: bool,
}

/// Either a lone op ready to submit, or two adjacent ops merged into
/// one vectored-equivalent submission.
pub enum Promoted {
    Single(DeferredOp),
    Merged(DeferredOp, DeferredOp),
}

/// Per-device admission state: the deferred FIFO, the in-flight set
/// keyed by I/O cookie, and the merge/queue-depth policy.
pub struct DeviceQueue {
    queue_depth: u32,
    merge_delay: Duration,
    mtu_payload_cap: usize,
    deferred: VecDeque<DeferredOp>,
    in_flight: HashMap<u64, InFlightOp>,
    next_cookie: u64,
}

impl DeviceQueue {
    pub fn new(queue_depth: u32, merge_delay: Duration, mtu_payload_cap: usize) -> Self {
        Self {
            queue_depth,
            merge_delay,
            mtu_payload_cap,
            deferred: VecDeque::new(),
            in_flight: HashMap::new(),
            next_cookie: 0,
        }
    }

    pub fn push_deferred(&mut self, op: DeferredOp) {
        self.deferred.push_back(op);
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_full(&self) -> bool {
        self.in_flight.len() >= self.queue_depth as usize
    }

    /// Decides the next promotion, if any. Merges the two front entries
    /// when they're adjacent same-direction ops from the same initiator
    /// within the MTU payload cap; otherwise submits the front entry
    /// alone once it has waited out `merge_delay`. Returns `None` when
    /// the in-flight set is full or the front entry is still within its
    /// merge window with no mergeable neighbour.
    pub fn promote_ready(&mut self, now: Instant) -> Option<Promoted> {
        if self.is_full() || self.deferred.is_empty() {
            return None;
        }

        if self.deferred.len() >= 2 {
            let mergeable = {
                let a = &self.deferred[0];
                let b = &self.deferred[1];
                Self::mergeable(a, b, self.mtu_payload_cap)
            };
            if mergeable {
                let a = self.deferred.pop_front().unwrap();
                let b = self.deferred.pop_front().unwrap();
                return Some(Promoted::Merged(a, b));
            }
        }

        let front = self.deferred.front().unwrap();
        let waited = now.saturating_duration_since(front.queued_at);
        if self.merge_delay.is_zero() || waited >= self.merge_delay {
            return Some(Promoted::Single(self.deferred.pop_front().unwrap()));
        }
        None
    }

    fn mergeable(a: &DeferredOp, b: &DeferredOp, mtu_payload_cap: usize) -> bool {
        a.mac == b.mac
            && a.write == b.write
            && a.lba.checked_add(u64::from(a.sector_count)) == Some(b.lba)
            && (a.sector_count as usize + b.sector_count as usize) * 512 <= mtu_payload_cap
    }

    /// The instant the front deferred entry's merge window expires, if
    /// any entry is waiting — used by the event loop to size its next
    /// timeout.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deferred.front().map(|op| op.queued_at + self.merge_delay)
    }

    pub fn alloc_cookie(&mut self) -> u64 {
        self.next_cookie += 1;
        self.next_cookie
    }

    pub fn record_in_flight(&mut self, cookie: u64, op: InFlightOp) {
        self.in_flight.insert(cookie, op);
    }

    pub fn take_in_flight(&mut self, cookie: u64) -> Option<InFlightOp> {
        self.in_flight.remove(&cookie)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(mac: u8, write: bool, lba: u64, sectors: u32, at: Instant) -> DeferredOp {
        DeferredOp {
            tag: u32::from(mac),
            netif_id: 0,
            mac: MacAddr([0, 0, 0, 0, 0, mac]),
            write,
            lba,
            sector_count: sectors,
            payload: Vec::new(),
            queued_at: at,
        }
    }

    #[test]
    fn queue_depth_one_serializes_no_merge_while_full() {
        let mut q = DeviceQueue::new(1, Duration::from_millis(10), 1500);
        let now = Instant::now();
        q.push_deferred(op(1, false, 0, 1, now));
        q.push_deferred(op(1, false, 1, 1, now));
        match q.promote_ready(now).unwrap() {
            Promoted::Single(o) => assert_eq!(o.lba, 0),
            Promoted::Merged(..) => panic!("must not merge before in-flight slot exists"),
        }
        q.record_in_flight(q.alloc_cookie(), InFlightOp { requests: SmallVec::new(), write: false });
        assert!(q.promote_ready(now).is_none());
    }

    #[test]
    fn adjacent_reads_from_same_initiator_merge() {
        let mut q = DeviceQueue::new(4, Duration::from_millis(10), 1500);
        let now = Instant::now();
        q.push_deferred(op(1, false, 0, 2, now));
        q.push_deferred(op(1, false, 2, 2, now));
        match q.promote_ready(now).unwrap() {
            Promoted::Merged(a, b) => {
                assert_eq!(a.lba, 0);
                assert_eq!(b.lba, 2);
            }
            Promoted::Single(_) => panic!("expected a merge"),
        }
        assert_eq!(q.deferred_len(), 0);
    }

    #[test]
    fn non_adjacent_ops_never_merge() {
        let mut q = DeviceQueue::new(4, Duration::from_millis(10), 1500);
        let now = Instant::now();
        q.push_deferred(op(1, false, 0, 2, now));
        q.push_deferred(op(1, false, 5, 2, now));
        assert!(q.promote_ready(now).is_none());
        let later = now + Duration::from_millis(11);
        match q.promote_ready(later).unwrap() {
            Promoted::Single(o) => assert_eq!(o.lba, 0),
            Promoted::Merged(..) => panic!("non-adjacent ops must not merge"),
        }
    }

    #[test]
    fn different_initiators_never_merge() {
        let mut q = DeviceQueue::new(4, Duration::from_millis(10), 1500);
        let now = Instant::now();
        q.push_deferred(op(1, false, 0, 2, now));
        q.push_deferred(op(2, false, 2, 2, now));
        let later = now + Duration::from_millis(11);
        match q.promote_ready(later).unwrap() {
            Promoted::Single(o) => assert_eq!(o.mac, MacAddr([0, 0, 0, 0, 0, 1])),
            Promoted::Merged(..) => panic!("different initiators must not merge"),
        }
    }

    #[test]
    fn merge_bounded_by_mtu_payload_cap() {
        let mut q = DeviceQueue::new(4, Duration::from_millis(10), 600);
        let now = Instant::now();
        q.push_deferred(op(1, false, 0, 2, now));
        q.push_deferred(op(1, false, 2, 2, now));
        // 4 sectors * 512 = 2048 > 600, so no merge even though adjacent.
        let later = now + Duration::from_millis(11);
        match q.promote_ready(later).unwrap() {
            Promoted::Single(o) => assert_eq!(o.lba, 0),
            Promoted::Merged(..) => panic!("merge must respect the MTU payload cap"),
        }
    }

    #[test]
    fn lone_op_submitted_alone_once_merge_delay_elapses() {
        let mut q = DeviceQueue::new(4, Duration::from_millis(5), 1500);
        let now = Instant::now();
        q.push_deferred(op(1, false, 0, 1, now));
        assert!(q.promote_ready(now).is_none());
        let later = now + Duration::from_millis(6);
        assert!(matches!(q.promote_ready(later), Some(Promoted::Single(_))));
    }

    #[test]
    fn zero_merge_delay_submits_immediately() {
        let mut q = DeviceQueue::new(4, Duration::ZERO, 1500);
        let now = Instant::now();
        q.push_deferred(op(1, false, 0, 1, now));
        assert!(matches!(q.promote_ready(now), Some(Promoted::Single(_))));
    }
}
