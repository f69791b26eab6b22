//! The 64-bucket priority run-queue
//!
//! Each bucket is a FIFO of threads linked intrusively through their
//! descriptors; a 64 bit presence bitmap finds the lowest non-empty bucket
//! with a single `trailing_zeros`. Buckets cover 4 priorities each.
//!
//! Every method must be called with the owning CPU queue's lock held; the
//! `&mut self` receivers are only reachable through that lock's guard.

use super::prio::{RQ_NQS, RQ_PPQ};
use super::thread::{ThreadId, ThreadTable};

pub struct RunQueue {
    status: u64,
    heads: [Option<ThreadId>; RQ_NQS],
    tails: [Option<ThreadId>; RQ_NQS],
}

impl RunQueue {
    pub const fn new() -> Self {
        Self {
            status: 0,
            heads: [None; RQ_NQS],
            tails: [None; RQ_NQS],
        }
    }

    pub fn bucket_for(priority: u8) -> u8 {
        priority / RQ_PPQ
    }

    pub fn is_empty(&self) -> bool {
        self.status == 0
    }

    pub fn bucket_empty(&self, bucket: u8) -> bool {
        self.status & (1 << bucket) == 0
    }

    /// Insert `tid` into `bucket`, at the head when the thread was
    /// preempted so it reclaims the CPU it lost
    pub(crate) fn add(&mut self, table: &ThreadTable, tid: ThreadId, bucket: u8, head: bool) {
        assert!((bucket as usize) < RQ_NQS);

        // Safety: the caller holds the queue lock owning `tid` and every
        // thread linked on this run-queue
        let thread = unsafe { table.thread_mut(tid) };

        thread.rq_bucket = bucket;
        thread.rq_prev = None;
        thread.rq_next = None;

        let slot_head = self.heads.get_mut(bucket as usize).expect("Bucket out of range");

        match *slot_head {
            None => {
                *slot_head = Some(tid);
                *self.tails.get_mut(bucket as usize).expect("Bucket out of range") = Some(tid);
            }
            Some(old_head) if head => {
                thread.rq_next = Some(old_head);
                *slot_head = Some(tid);

                // Safety: same lock ownership as above
                unsafe {
                    table.thread_mut(old_head).rq_prev = Some(tid);
                }
            }
            Some(_) => {
                let slot_tail = self.tails.get_mut(bucket as usize).expect("Bucket out of range");
                let old_tail = slot_tail.expect("Non-empty bucket without a tail");

                thread.rq_prev = Some(old_tail);
                *slot_tail = Some(tid);

                // Safety: same lock ownership as above
                unsafe {
                    table.thread_mut(old_tail).rq_next = Some(tid);
                }
            }
        }

        self.status |= 1 << bucket;
    }

    /// Unlink `tid` from its recorded bucket
    ///
    /// When the bucket empties its presence bit is cleared, and a cursor
    /// parked on that bucket is advanced to the next one so a draining
    /// rotation keeps moving.
    pub(crate) fn remove(&mut self, table: &ThreadTable, tid: ThreadId, cursor: Option<&mut u8>) {
        // Safety: the caller holds the queue lock owning `tid` and every
        // thread linked on this run-queue
        let thread = unsafe { table.thread_mut(tid) };

        let bucket = thread.rq_bucket;
        let prev = thread.rq_prev.take();
        let next = thread.rq_next.take();

        assert!(!self.bucket_empty(bucket));

        match prev {
            // Safety: same lock ownership as above
            Some(prev) => unsafe { table.thread_mut(prev).rq_next = next },
            None => *self.heads.get_mut(bucket as usize).expect("Bucket out of range") = next,
        }

        match next {
            // Safety: same lock ownership as above
            Some(next) => unsafe { table.thread_mut(next).rq_prev = prev },
            None => *self.tails.get_mut(bucket as usize).expect("Bucket out of range") = prev,
        }

        if self.heads.get(bucket as usize).expect("Bucket out of range").is_none() {
            self.status &= !(1 << bucket);

            if let Some(cursor) = cursor {
                if *cursor == bucket {
                    #[allow(clippy::cast_possible_truncation, reason = "RQ_NQS is 64")]
                    {
                        *cursor = (bucket as usize + 1).rem_euclid(RQ_NQS) as u8;
                    }
                }
            }
        }
    }

    /// Head of the lowest non-empty bucket
    pub(crate) fn choose(&self) -> Option<ThreadId> {
        if self.status == 0 {
            return None;
        }

        let bucket = self.status.trailing_zeros() as usize;
        *self.heads.get(bucket).expect("Bucket out of range")
    }

    /// Circular scan starting at `start`, for the timeshare rotation
    pub(crate) fn choose_from(&self, start: u8) -> Option<ThreadId> {
        if self.status == 0 {
            return None;
        }

        let rotated = self.status.rotate_right(u32::from(start));
        let bucket = (usize::from(start) + rotated.trailing_zeros() as usize) % RQ_NQS;

        *self.heads.get(bucket).expect("Bucket out of range")
    }

    /// Number of threads linked in `bucket`, for consistency checks
    #[cfg(test)]
    pub(crate) fn bucket_len(&self, table: &ThreadTable, bucket: u8) -> usize {
        let mut len = 0;
        let mut cursor = *self.heads.get(bucket as usize).expect("Bucket out of range");

        while let Some(tid) = cursor {
            len += 1;

            // Safety: tests are single threaded
            cursor = unsafe { table.thread(tid).rq_next };
        }

        len
    }
}

#[cfg(all(test, not(loom)))]
#[allow(clippy::unwrap_used, reason = "No need to be so rigid in tests")]
mod tests {
    use super::*;
    use crate::sched::thread::Thread;

    use nanorand::{Rng, WyRand};

    fn make_threads(table: &ThreadTable, count: usize) -> Vec<ThreadId> {
        (0..count).map(|_| table.alloc(Thread::empty()).unwrap()).collect()
    }

    #[test]
    fn test_fifo_within_bucket() {
        let table = ThreadTable::new();
        let tids = make_threads(&table, 3);
        let mut rq = RunQueue::new();

        for &tid in &tids {
            rq.add(&table, tid, 5, false);
        }

        assert_eq!(rq.choose(), Some(tids[0]));
        rq.remove(&table, tids[0], None);
        assert_eq!(rq.choose(), Some(tids[1]));
        rq.remove(&table, tids[1], None);
        assert_eq!(rq.choose(), Some(tids[2]));
        rq.remove(&table, tids[2], None);
        assert_eq!(rq.choose(), None);
    }

    #[test]
    fn test_preempted_goes_to_head() {
        let table = ThreadTable::new();
        let tids = make_threads(&table, 3);
        let mut rq = RunQueue::new();

        rq.add(&table, tids[0], 5, false);
        rq.add(&table, tids[1], 5, false);
        rq.add(&table, tids[2], 5, true);

        assert_eq!(rq.choose(), Some(tids[2]));
    }

    #[test]
    fn test_choose_lowest_bucket() {
        let table = ThreadTable::new();
        let tids = make_threads(&table, 3);
        let mut rq = RunQueue::new();

        rq.add(&table, tids[0], 40, false);
        rq.add(&table, tids[1], 3, false);
        rq.add(&table, tids[2], 25, false);

        assert_eq!(rq.choose(), Some(tids[1]));
        rq.remove(&table, tids[1], None);
        assert_eq!(rq.choose(), Some(tids[2]));
        rq.remove(&table, tids[2], None);
        assert_eq!(rq.choose(), Some(tids[0]));
    }

    #[test]
    fn test_choose_from_wraps() {
        let table = ThreadTable::new();
        let tids = make_threads(&table, 2);
        let mut rq = RunQueue::new();

        rq.add(&table, tids[0], 10, false);
        rq.add(&table, tids[1], 50, false);

        // Starting past bucket 50 wraps around to bucket 10
        assert_eq!(rq.choose_from(51), Some(tids[0]));
        assert_eq!(rq.choose_from(30), Some(tids[1]));
        assert_eq!(rq.choose_from(10), Some(tids[0]));
    }

    #[test]
    fn test_cursor_advances_on_drain() {
        let table = ThreadTable::new();
        let tids = make_threads(&table, 2);
        let mut rq = RunQueue::new();

        rq.add(&table, tids[0], 7, false);
        rq.add(&table, tids[1], 7, false);

        // Cursor parked on the bucket only advances once it drains
        let mut cursor = 7;
        rq.remove(&table, tids[0], Some(&mut cursor));
        assert_eq!(cursor, 7);
        rq.remove(&table, tids[1], Some(&mut cursor));
        assert_eq!(cursor, 8);

        // A cursor parked elsewhere is untouched
        rq.add(&table, tids[0], 63, false);
        let mut cursor = 5;
        rq.remove(&table, tids[0], Some(&mut cursor));
        assert_eq!(cursor, 5);
    }

    #[test]
    fn test_cursor_wraps_at_last_bucket() {
        let table = ThreadTable::new();
        let tids = make_threads(&table, 1);
        let mut rq = RunQueue::new();

        rq.add(&table, tids[0], 63, false);

        let mut cursor = 63;
        rq.remove(&table, tids[0], Some(&mut cursor));
        assert_eq!(cursor, 0);
    }

    #[test]
    fn test_bitmap_coherence_randomized() {
        // Bit b set iff bucket b non-empty, across a random add/remove mix
        let table = ThreadTable::new();
        let tids = make_threads(&table, 64);
        let mut rq = RunQueue::new();
        let mut rng = WyRand::new_seed(0x5EED);

        let mut on_queue: Vec<Option<u8>> = vec![None; tids.len()];

        for _ in 0..10_000 {
            let pick = rng.generate_range(0..tids.len());
            let tid = tids[pick];

            match on_queue[pick] {
                None => {
                    let bucket = rng.generate_range(0..RQ_NQS as u8);
                    rq.add(&table, tid, bucket, rng.generate::<bool>());
                    on_queue[pick] = Some(bucket);
                }
                Some(_) => {
                    rq.remove(&table, tid, None);
                    on_queue[pick] = None;
                }
            }

            for bucket in 0..RQ_NQS as u8 {
                let expected = on_queue.iter().filter(|b| **b == Some(bucket)).count();

                assert_eq!(rq.bucket_len(&table, bucket), expected);
                assert_eq!(rq.bucket_empty(bucket), expected == 0);
            }
        }
    }

    #[test]
    fn test_add_remove_round_trip() {
        let table = ThreadTable::new();
        let tids = make_threads(&table, 4);
        let mut rq = RunQueue::new();

        rq.add(&table, tids[0], 12, false);
        let before = rq.status;

        rq.add(&table, tids[1], 12, false);
        rq.add(&table, tids[2], 13, true);
        rq.add(&table, tids[3], 60, false);

        rq.remove(&table, tids[3], None);
        rq.remove(&table, tids[2], None);
        rq.remove(&table, tids[1], None);

        assert_eq!(rq.status, before);
        assert_eq!(rq.bucket_len(&table, 12), 1);
        assert_eq!(rq.choose(), Some(tids[0]));
    }
}
