//! The per-CPU thread queue
//!
//! Three run-queues (realtime, timeshare, idle) behind one spinlock, plus
//! the counters other CPUs read without it: the cached minimum priority,
//! the pending-preemption flag and the load totals. The timeshare queue is
//! drained as a rotation: `idx` is where new batch threads are inserted
//! relative to, `ridx` is where the drain currently stands, and while they
//! differ no insertion may land on `ridx`.

use core::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU8, Ordering};

use spinning_top::Spinlock;
use spinning_top::guard::SpinlockGuard;

use super::prio::{self, PRI_MAX_BATCH, PRI_MAX_IDLE, PRI_MIN_BATCH, PRI_BATCH_RANGE, RQ_NQS};
use super::runq::RunQueue;
use super::thread::{flags, RunqKind, ThreadId, ThreadTable};

/// Flags for placing a thread on a run-queue
pub mod srq {
    pub const BORING: u32 = 0;
    /// The thread gave up the CPU voluntarily
    pub const YIELDING: u32 = 1 << 0;
    /// Placement decided by the running thread for itself
    pub const OURSELF: u32 = 1 << 1;
    /// Wakeup from interrupt context
    pub const INTR: u32 = 1 << 2;
    /// The thread was preempted, it goes to the bucket head
    pub const PREEMPTED: u32 = 1 << 3;
    /// The thread runs on a lent priority
    pub const BORROWING: u32 = 1 << 4;
}

pub struct CpuQueueData {
    pub(crate) realtime: RunQueue,
    pub(crate) timeshare: RunQueue,
    pub(crate) idle: RunQueue,
    /// Rotating insertion index of the timeshare queue
    pub(crate) idx: u8,
    /// Drain index of the timeshare queue
    pub(crate) ridx: u8,
    pub(crate) current: Option<ThreadId>,
    /// This CPU's idle thread, dispatched when nothing else is runnable
    pub(crate) idle_thread: Option<ThreadId>,
}

pub struct CpuQueue {
    data: Spinlock<CpuQueueData>,
    lowpri: AtomicU8,
    owe_preempt: AtomicBool,
    load: AtomicU32,
    sysload: AtomicU32,
    transferable: AtomicU32,
    switchcnt: AtomicU32,
    oldswitchcnt: AtomicU32,
    /// Local tick counter, written by the owning CPU only
    tickcount: AtomicU32,
}

impl CpuQueue {
    pub const fn new() -> Self {
        Self {
            data: Spinlock::new(CpuQueueData {
                realtime: RunQueue::new(),
                timeshare: RunQueue::new(),
                idle: RunQueue::new(),
                idx: 0,
                ridx: 0,
                current: None,
                idle_thread: None,
            }),
            lowpri: AtomicU8::new(PRI_MAX_IDLE),
            owe_preempt: AtomicBool::new(false),
            load: AtomicU32::new(0),
            sysload: AtomicU32::new(0),
            transferable: AtomicU32::new(0),
            switchcnt: AtomicU32::new(0),
            oldswitchcnt: AtomicU32::new(0),
            tickcount: AtomicU32::new(0),
        }
    }

    pub fn lock(&self) -> SpinlockGuard<'_, CpuQueueData> {
        self.data.lock()
    }

    pub fn lowpri(&self) -> u8 {
        self.lowpri.load(Ordering::Acquire)
    }

    pub fn owe_preempt(&self) -> bool {
        self.owe_preempt.load(Ordering::Acquire)
    }

    pub fn set_owe_preempt(&self, owe: bool) {
        self.owe_preempt.store(owe, Ordering::Release);
    }

    pub fn load(&self) -> u32 {
        self.load.load(Ordering::Acquire)
    }

    pub fn sysload(&self) -> u32 {
        self.sysload.load(Ordering::Acquire)
    }

    pub fn transferable(&self) -> u32 {
        self.transferable.load(Ordering::Acquire)
    }

    pub fn bump_switchcnt(&self) {
        self.switchcnt.fetch_add(1, Ordering::Relaxed);
    }

    pub fn switchcnt(&self) -> u32 {
        self.switchcnt.load(Ordering::Relaxed)
    }

    /// Roll the switch counter into the previous-period counter, done by
    /// the idle loop to detect a queue going quiet
    pub fn roll_switchcnt(&self) -> u32 {
        let count = self.switchcnt.load(Ordering::Relaxed);
        self.oldswitchcnt.store(count, Ordering::Relaxed);
        count
    }

    pub fn oldswitchcnt(&self) -> u32 {
        self.oldswitchcnt.load(Ordering::Relaxed)
    }

    pub fn advance_tickcount(&self, n: u32) -> u32 {
        let t = self.tickcount.load(Ordering::Relaxed).wrapping_add(n);
        self.tickcount.store(t, Ordering::Relaxed);
        t
    }

    pub fn tickcount(&self) -> u32 {
        self.tickcount.load(Ordering::Relaxed)
    }

    /// Slice length for a thread added to this queue now
    pub fn slice(&self) -> i32 {
        prio::slice_for_load(self.sysload())
    }

    /// Account a thread entering the runnable set
    pub fn load_add(&self, table: &ThreadTable, tid: ThreadId) {
        // Safety: the caller holds this queue's lock, which owns `tid`
        let thread = unsafe { table.thread(tid) };

        self.load.fetch_add(1, Ordering::AcqRel);

        if !thread.flag(flags::NOLOAD) {
            self.sysload.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Account a thread leaving the runnable set
    pub fn load_rem(&self, table: &ThreadTable, tid: ThreadId) {
        // Safety: the caller holds this queue's lock, which owns `tid`
        let thread = unsafe { table.thread(tid) };

        self.load.fetch_sub(1, Ordering::AcqRel);

        if !thread.flag(flags::NOLOAD) {
            self.sysload.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Place a runnable thread on the right run-queue for its priority
    pub fn runq_add(&self, data: &mut CpuQueueData, table: &ThreadTable, tid: ThreadId, srq_flags: u32) {
        let head = srq_flags & srq::PREEMPTED != 0;

        // Decide the target queue and account transferability; the borrow
        // is dropped before the run-queue links the thread
        let (pri, kind) = {
            // Safety: the caller holds this queue's lock, which owns `tid`
            let thread = unsafe { table.thread_mut(tid) };
            let pri = thread.priority;

            let kind = if pri < PRI_MIN_BATCH {
                RunqKind::Realtime
            } else if pri <= PRI_MAX_BATCH {
                RunqKind::Timeshare
            } else {
                RunqKind::Idle
            };

            thread.runq = Some(kind);

            if !thread.flag(flags::BOUND) {
                thread.flags |= flags::XFERABLE;
                self.transferable.fetch_add(1, Ordering::AcqRel);
            }

            (pri, kind)
        };

        match kind {
            RunqKind::Realtime => data.realtime.add(table, tid, RunQueue::bucket_for(pri), head),
            RunqKind::Timeshare => {
                let bucket = if srq_flags & (srq::BORROWING | srq::PREEMPTED) != 0 {
                    // Borrowed and preempted threads run next, not a
                    // rotation from now
                    usize::from(data.ridx)
                } else {
                    let scaled = RQ_NQS * usize::from(pri - PRI_MIN_BATCH) / usize::from(PRI_BATCH_RANGE);
                    let mut bucket = (scaled + usize::from(data.idx)) % RQ_NQS;

                    // Keep one bucket of distance so the rotation still
                    // drains
                    if data.ridx != data.idx && bucket == usize::from(data.ridx) {
                        bucket = (bucket + RQ_NQS - 1) % RQ_NQS;
                    }

                    bucket
                };

                #[allow(clippy::cast_possible_truncation, reason = "RQ_NQS is 64")]
                data.timeshare.add(table, tid, bucket as u8, head);
            }
            RunqKind::Idle => data.idle.add(table, tid, RunQueue::bucket_for(pri), head),
        }
    }

    /// Take a thread back off its run-queue
    pub fn runq_rem(&self, data: &mut CpuQueueData, table: &ThreadTable, tid: ThreadId) {
        let kind = {
            // Safety: the caller holds this queue's lock, which owns `tid`
            let thread = unsafe { table.thread_mut(tid) };

            if thread.flag(flags::XFERABLE) {
                thread.flags &= !flags::XFERABLE;
                self.transferable.fetch_sub(1, Ordering::AcqRel);
            }

            thread.runq.take()
        };

        match kind {
            Some(RunqKind::Realtime) => data.realtime.remove(table, tid, None),
            Some(RunqKind::Timeshare) => {
                if data.idx != data.ridx {
                    let mut ridx = data.ridx;
                    data.timeshare.remove(table, tid, Some(&mut ridx));
                    data.ridx = ridx;
                } else {
                    data.timeshare.remove(table, tid, None);
                }
            }
            Some(RunqKind::Idle) => data.idle.remove(table, tid, None),
            None => {}
        }
    }

    /// Highest-priority runnable thread: realtime first, then the
    /// timeshare rotation from `ridx`, then idle
    pub fn choose(&self, data: &CpuQueueData) -> Option<ThreadId> {
        data.realtime
            .choose()
            .or_else(|| data.timeshare.choose_from(data.ridx))
            .or_else(|| data.idle.choose())
    }

    /// Recompute the cached minimum priority from the current thread and
    /// the run-queues
    ///
    /// `current_pri` overrides the current thread's recorded priority when
    /// the caller is about to change it.
    pub fn set_lowpri(&self, data: &CpuQueueData, table: &ThreadTable, current_pri: Option<u8>) {
        let cur = current_pri.or_else(|| {
            // Safety: the caller holds this queue's lock, which owns its
            // current thread
            data.current.map(|tid| unsafe { table.thread(tid).priority })
        });

        let cur = cur.unwrap_or(PRI_MAX_IDLE);

        let lowest = match self.choose(data) {
            // Safety: same lock ownership as above
            Some(tid) => cur.min(unsafe { table.thread(tid).priority }),
            None => cur,
        };

        self.lowpri.store(lowest, Ordering::Release);
    }

    /// Ask this queue's CPU to preempt for a thread that was just queued
    ///
    /// `replaced_lowpri` is the value `lowpri` had before the insertion.
    /// The fence orders the queue insertion before the flag store so the
    /// remote CPU that sees the flag also sees the thread.
    pub fn notify(&self, replaced_lowpri: u8) -> bool {
        if self.owe_preempt() {
            return false;
        }

        if !prio::should_preempt(self.lowpri(), replaced_lowpri, true) {
            return false;
        }

        fence(Ordering::SeqCst);
        self.owe_preempt.store(true, Ordering::Release);
        true
    }
}
