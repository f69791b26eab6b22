//! Thread descriptors and the fixed thread arena
//!
//! Threads and queues reference each other cyclically, so threads live in
//! a fixed-capacity arena and are referenced by [`ThreadId`] handles. A
//! thread's fields are owned by whichever queue lock its [`TdLock`] tag
//! names; the arena hands out references through unsafe accessors whose
//! callers must hold that lock.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

use super::prio::CpuTicks;
use super::tdlock::TdLock;

pub const MAX_THREADS: usize = 256;

/// Placement marker for a thread not currently on any CPU
pub const NOCPU: u8 = u8::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadId(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedClass {
    Interrupt,
    Realtime,
    Timeshare,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Inactive,
    Inhibited,
    CanRun,
    OnRunq,
    Running,
}

/// Which of a CPU queue's three run-queues a thread sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunqKind {
    Realtime,
    Timeshare,
    Idle,
}

/// Thread flags
pub mod flags {
    /// Pinned to its CPU, never migrated
    pub const BOUND: u16 = 1 << 0;
    /// Counted in the queue's transferable total while on a run-queue
    pub const XFERABLE: u16 = 1 << 1;
    /// Excluded from the system load average
    pub const NOLOAD: u16 = 1 << 2;
    /// Running on a priority lent by another thread
    pub const BORROWING: u16 = 1 << 3;
    /// One of the per-CPU idle threads
    pub const IDLETD: u16 = 1 << 4;
    /// Re-run CPU selection at the next switch
    pub const PICKCPU: u16 = 1 << 5;
    /// The slice ran out, the next switch is not a preemption
    pub const SLICEEND: u16 = 1 << 6;
    /// Deferred reschedule request, honored at the next safe boundary
    pub const ASTPENDING: u16 = 1 << 7;
}

/// Inhibitor bits for [`ThreadState::Inhibited`]
pub mod inhibit {
    pub const SLEEPING: u8 = 1 << 0;
    pub const SUSPENDED: u8 = 1 << 1;
    pub const SWAPPED: u8 = 1 << 2;
    pub const LOCK_BLOCKED: u8 = 1 << 3;
    pub const INTR_WAIT: u8 = 1 << 4;
}

pub struct Thread {
    pub name: &'static str,

    // Lock discipline counters, owned by the thread itself while running
    pub critnest: u32,
    pub spinlock_count: u32,
    pub saved_intr: bool,

    pub class: SchedClass,
    pub flags: u16,

    // Priorities: `priority` is the effective one, `base_pri` what it
    // returns to when lending ends
    pub base_pri: u8,
    pub priority: u8,
    pub base_user_pri: u8,
    pub user_pri: u8,
    pub lend_user_pri: u8,
    pub base_ithread_pri: u8,

    // Accounting
    pub pctcpu: CpuTicks,
    pub runtime: u64,
    pub slptime: u64,
    pub slice: i32,
    pub slptick: u32,
    pub rltick: u32,
    pub incruntime: u64,
    pub swvoltick: u32,
    pub swinvoltick: u32,

    // Placement
    pub cpu: u8,
    pub oncpu: u8,
    pub state: ThreadState,
    pub inhibitors: u8,

    // Run-queue membership, owned by the queue named in the lock tag
    pub(crate) runq: Option<RunqKind>,
    pub(crate) rq_bucket: u8,
    pub(crate) rq_prev: Option<ThreadId>,
    pub(crate) rq_next: Option<ThreadId>,
}

impl Thread {
    pub const fn empty() -> Self {
        Self {
            name: "",
            critnest: 0,
            spinlock_count: 0,
            saved_intr: false,
            class: SchedClass::Timeshare,
            flags: 0,
            base_pri: 0,
            priority: 0,
            base_user_pri: 0,
            user_pri: 0,
            lend_user_pri: 0,
            base_ithread_pri: 0,
            pctcpu: CpuTicks::new(),
            runtime: 0,
            slptime: 0,
            slice: 0,
            slptick: 0,
            rltick: 0,
            incruntime: 0,
            swvoltick: 0,
            swinvoltick: 0,
            cpu: 0,
            oncpu: NOCPU,
            state: ThreadState::Inactive,
            inhibitors: 0,
            runq: None,
            rq_bucket: 0,
            rq_prev: None,
            rq_next: None,
        }
    }

    pub fn flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }

    pub fn interrupt_class(&self) -> bool {
        self.class == SchedClass::Interrupt
    }

    pub fn idle_thread(&self) -> bool {
        self.flag(flags::IDLETD)
    }
}

struct ThreadSlot {
    used: AtomicBool,
    lock: TdLock,
    thread: UnsafeCell<Thread>,
}

impl ThreadSlot {
    #[cfg(not(loom))]
    const fn new() -> Self {
        Self {
            used: AtomicBool::new(false),
            lock: TdLock::new(),
            thread: UnsafeCell::new(Thread::empty()),
        }
    }

    #[cfg(loom)]
    fn new() -> Self {
        Self {
            used: AtomicBool::new(false),
            lock: TdLock::new(),
            thread: UnsafeCell::new(Thread::empty()),
        }
    }
}

pub struct ThreadTable {
    slots: [ThreadSlot; MAX_THREADS],
}

// Safety: slot claiming is atomic, and thread cells are only reached while
// holding the owner lock named by the slot's `TdLock` tag
unsafe impl Sync for ThreadTable {}

impl ThreadTable {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        const SLOT: ThreadSlot = ThreadSlot::new();

        Self {
            slots: [SLOT; MAX_THREADS],
        }
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| ThreadSlot::new()),
        }
    }

    /// Claim a free slot and initialize it with `thread`
    ///
    /// Returns `None` when the arena is full.
    pub fn alloc(&self, thread: Thread) -> Option<ThreadId> {
        for (index, slot) in self.slots.iter().enumerate() {
            if slot
                .used
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                // Safety: the compare-exchange above made us the sole owner
                // of this slot
                unsafe {
                    *slot.thread.get() = thread;
                }

                #[allow(clippy::cast_possible_truncation, reason = "MAX_THREADS fits in u16")]
                return Some(ThreadId(index as u16));
            }
        }

        None
    }

    fn slot(&self, id: ThreadId) -> &ThreadSlot {
        self.slots.get(id.0 as usize).expect("Thread id out of range")
    }

    /// Shared access to a thread's descriptor
    ///
    /// # Safety
    /// The caller must hold the lock named by the thread's lock tag, or
    /// otherwise guarantee no writer is active.
    pub unsafe fn thread(&self, id: ThreadId) -> &Thread {
        // Safety: per this function's contract
        unsafe { &*self.slot(id).thread.get() }
    }

    /// Exclusive access to a thread's descriptor
    ///
    /// # Safety
    /// The caller must hold the lock named by the thread's lock tag.
    #[allow(clippy::mut_from_ref, reason = "Ownership is enforced by the lock tag protocol")]
    pub unsafe fn thread_mut(&self, id: ThreadId) -> &mut Thread {
        // Safety: per this function's contract
        unsafe { &mut *self.slot(id).thread.get() }
    }

    /// The thread's lock owner tag
    pub fn lock(&self, id: ThreadId) -> &TdLock {
        &self.slot(id).lock
    }
}

#[cfg(all(test, not(loom)))]
#[allow(clippy::unwrap_used, reason = "No need to be so rigid in tests")]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_assigns_distinct_ids() {
        let table = ThreadTable::new();

        let a = table.alloc(Thread::empty()).unwrap();
        let b = table.alloc(Thread::empty()).unwrap();

        assert_ne!(a, b);

        // Safety: no concurrent access in this test
        unsafe {
            table.thread_mut(a).priority = 10;
            table.thread_mut(b).priority = 20;

            assert_eq!(table.thread(a).priority, 10);
            assert_eq!(table.thread(b).priority, 20);
        }
    }

    #[test]
    fn test_arena_exhaustion() {
        let table = ThreadTable::new();

        for _ in 0..MAX_THREADS {
            assert!(table.alloc(Thread::empty()).is_some());
        }

        assert!(table.alloc(Thread::empty()).is_none());
    }
}
