//! The per-CPU scheduler core
//!
//! One [`CpuQueue`] per CPU, threads in a fixed arena, priorities decayed
//! by the interactivity heuristics in [`prio`]. The hardware-facing half
//! (trap frames, the timer, interrupt masking) lives in the kernel crate;
//! everything here is ordinary state manipulation under per-queue
//! spinlocks and is exercised by the host test suite.

pub mod cpu_queue;
pub mod prio;
pub mod runq;
pub mod tdlock;
pub mod thread;

use core::sync::atomic::{AtomicU32, Ordering};

use cpu_queue::{srq, CpuQueue, CpuQueueData};
use prio::{
    interact_update, should_preempt, timeshare_priority, AFFINITY, MAX_CACHE_LEVELS, PRI_MAX_IDLE,
    PRI_MAX_ITHD, PRI_MAX_TIMESHARE, PRI_MIN_BATCH, PRI_MIN_IDLE, PRI_MIN_TIMESHARE, RQ_NQS,
    RQ_PPQ, TICK_INCR,
};
use tdlock::LockOwner;
use thread::{
    flags, inhibit, SchedClass, Thread, ThreadId, ThreadState, ThreadTable, NOCPU,
};

pub const MAX_CPUS: usize = 32;

/// Context switch flags
pub mod sw {
    /// The thread gave up the CPU itself
    pub const VOL: u32 = 1 << 0;
    /// The switch was forced on the thread
    pub const INVOL: u32 = 1 << 1;
    /// The switch preempts a still-runnable thread
    pub const PREEMPT: u32 = 1 << 2;
}

/// What the machine layer needs to finish a switch decided by
/// [`Scheduler::switch`]
///
/// The previous thread stays behind the blocked sentinel until its context
/// is saved; the machine layer then publishes `prev_owner` and may only
/// touch `next`'s context once its lock tag has left the sentinel.
#[derive(Debug, Clone, Copy)]
pub struct SwitchOutcome {
    pub prev: ThreadId,
    pub next: ThreadId,
    pub prev_owner: LockOwner,
}

pub struct Scheduler {
    threads: ThreadTable,
    queues: [CpuQueue; MAX_CPUS],
    ncpus: AtomicU32,
    /// Global tick counter, folded forward from the per-CPU counters
    ticks: AtomicU32,
}

impl Scheduler {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        const QUEUE: CpuQueue = CpuQueue::new();

        Self {
            threads: ThreadTable::new(),
            queues: [QUEUE; MAX_CPUS],
            ncpus: AtomicU32::new(1),
            ticks: AtomicU32::new(0),
        }
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        const QUEUE: CpuQueue = CpuQueue::new();

        Self {
            threads: ThreadTable::new(),
            queues: [QUEUE; MAX_CPUS],
            ncpus: AtomicU32::new(1),
            ticks: AtomicU32::new(0),
        }
    }

    pub fn init(&self, ncpus: usize) {
        assert!(ncpus >= 1 && ncpus <= MAX_CPUS, "Unsupported CPU count");

        #[allow(clippy::cast_possible_truncation, reason = "Checked against MAX_CPUS")]
        self.ncpus.store(ncpus as u32, Ordering::Release);
    }

    pub fn ncpus(&self) -> usize {
        self.ncpus.load(Ordering::Acquire) as usize
    }

    pub fn ticks(&self) -> u32 {
        self.ticks.load(Ordering::Acquire)
    }

    pub fn queue(&self, cpu: u8) -> &CpuQueue {
        self.queues.get(usize::from(cpu)).expect("CPU index out of range")
    }

    pub fn threads(&self) -> &ThreadTable {
        &self.threads
    }

    pub fn current(&self, cpu: u8) -> Option<ThreadId> {
        self.queue(cpu).lock().current
    }

    /// Allocate a thread descriptor; the thread is not runnable until it
    /// is handed to [`Scheduler::add`]
    pub fn thread_create(&self, name: &'static str, class: SchedClass, base_pri: u8) -> Option<ThreadId> {
        let mut thread = Thread::empty();

        thread.name = name;
        thread.class = class;
        thread.base_pri = base_pri;
        thread.priority = base_pri;
        thread.base_user_pri = base_pri;
        thread.user_pri = base_pri;
        thread.lend_user_pri = PRI_MAX_IDLE;
        thread.state = ThreadState::CanRun;

        if class == SchedClass::Interrupt {
            thread.base_ithread_pri = base_pri;
        }

        self.threads.alloc(thread)
    }

    /// Register `tid` as `cpu`'s idle thread
    pub fn set_idle(&self, cpu: u8, tid: ThreadId) {
        let queue = self.queue(cpu);
        let mut data = queue.lock();

        {
            // Safety: the thread is not yet reachable by any other CPU
            let thread = unsafe { self.threads.thread_mut(tid) };

            thread.class = SchedClass::Idle;
            thread.flags |= flags::IDLETD | flags::NOLOAD | flags::BOUND;
            thread.base_pri = PRI_MAX_IDLE;
            thread.priority = PRI_MAX_IDLE;
            thread.cpu = cpu;
        }

        data.idle_thread = Some(tid);
    }

    /// Install `tid` as the thread currently running on `cpu`
    ///
    /// Used at boot to adopt the CPU's startup context as a thread.
    pub fn set_current(&self, cpu: u8, tid: ThreadId) {
        let queue = self.queue(cpu);
        let data = queue.lock();

        {
            // Safety: we hold the queue lock that is about to own the thread
            let thread = unsafe { self.threads.thread_mut(tid) };

            thread.state = ThreadState::Running;
            thread.cpu = cpu;
            thread.oncpu = cpu;
        }

        let mut data = data;
        data.current = Some(tid);
        self.threads.lock(tid).set(LockOwner::CpuQueue(cpu));
        queue.set_lowpri(&data, &self.threads, None);
    }

    /// Choose the CPU a newly runnable thread should run on
    pub fn pick_cpu(&self, curcpu: u8, tid: ThreadId, srq_flags: u32) -> u8 {
        // Safety: the caller owns the thread through its lock tag
        let thread = unsafe { self.threads.thread(tid) };
        let ncpus = self.ncpus();

        if ncpus == 1 || srq_flags & srq::OURSELF != 0 || thread.flag(flags::BOUND) {
            return thread.cpu;
        }

        // Interrupt threads chase the interrupt: they stay where the
        // handler ran unless that CPU is busy with real work
        if thread.priority <= PRI_MAX_ITHD && thread.interrupt_class() {
            if self.queue(curcpu).lowpri() >= PRI_MIN_IDLE {
                return curcpu;
            }

            return thread.cpu;
        }

        let ticks = self.ticks();

        // Recent affinity to an idle last CPU wins
        let last = thread.cpu;

        if self.queue(last).lowpri() >= PRI_MIN_IDLE
            && thread.rltick > ticks.saturating_sub(2 * AFFINITY)
        {
            return last;
        }

        // Otherwise take the least loaded CPU
        let mut best = 0_u8;
        let mut best_load = u32::MAX;

        for cpu in 0..ncpus {
            #[allow(clippy::cast_possible_truncation, reason = "Bounded by MAX_CPUS")]
            let cpu = cpu as u8;
            let load = self.queue(cpu).load();

            if load < best_load {
                best = cpu;
                best_load = load;
            }
        }

        // If even the best pick is busy, prefer staying local when we
        // would run immediately here at no load disadvantage
        if self.queue(best).lowpri() < PRI_MIN_IDLE
            && self.queue(curcpu).lowpri() > thread.priority
            && self.queue(curcpu).load() <= best_load
        {
            return curcpu;
        }

        best
    }

    /// Make a thread runnable and place it on the best CPU's queue
    ///
    /// Returns the chosen CPU. When the thread lands on a remote queue the
    /// remote CPU is asked to preempt through its `owe_preempt` flag.
    pub fn add(&self, curcpu: u8, tid: ThreadId, srq_flags: u32) -> u8 {
        let cpu = self.pick_cpu(curcpu, tid, srq_flags);
        let queue = self.queue(cpu);
        let mut data = queue.lock();

        let replaced_lowpri = queue.lowpri();

        {
            // Safety: we hold the destination queue lock; the thread is not
            // reachable from any run-queue yet
            let thread = unsafe { self.threads.thread_mut(tid) };

            assert!(
                thread.state == ThreadState::CanRun || thread.state == ThreadState::Running,
                "adding a thread that cannot run"
            );

            thread.cpu = cpu;
            thread.state = ThreadState::OnRunq;
        }

        queue.runq_add(&mut data, &self.threads, tid, srq_flags);
        queue.load_add(&self.threads, tid);
        queue.set_lowpri(&data, &self.threads, None);
        self.threads.lock(tid).set(LockOwner::CpuQueue(cpu));

        let added_pri = {
            // Safety: still under the destination queue lock
            unsafe { self.threads.thread(tid).priority }
        };

        let current_pri = data.current.map(|cur| {
            // Safety: the queue lock owns its current thread
            unsafe { self.threads.thread(cur).priority }
        });

        drop(data);

        if cpu == curcpu {
            // A local wakeup that beats the running thread is honored at
            // the next safe boundary
            if let Some(current_pri) = current_pri {
                if should_preempt(added_pri, current_pri, false) {
                    queue.set_owe_preempt(true);
                }
            }
        } else {
            queue.notify(replaced_lowpri);
        }

        cpu
    }

    /// Bookkeeping for a thread about to sleep
    ///
    /// The caller marks the thread inhibited here and then drives the
    /// actual deschedule through a voluntary switch.
    pub fn sleep(&self, cpu: u8, tid: ThreadId) {
        let queue = self.queue(cpu);
        let data = queue.lock();

        assert_eq!(data.current, Some(tid), "only the running thread can sleep");

        let demoted = {
            // Safety: the queue lock owns its current thread
            let thread = unsafe { self.threads.thread_mut(tid) };

            thread.slptick = self.ticks();
            thread.state = ThreadState::Inhibited;
            thread.inhibitors |= inhibit::SLEEPING;

            // Threads going to sleep deep in the batch band come back at
            // the top of it so they stay responsive in the kernel
            if thread.class == SchedClass::Timeshare && thread.priority > PRI_MIN_BATCH {
                thread.priority = PRI_MIN_BATCH;
                true
            } else {
                false
            }
        };

        if demoted {
            queue.set_lowpri(&data, &self.threads, None);
        }
    }

    /// Wake an inhibited thread and queue it
    pub fn wakeup(&self, curcpu: u8, tid: ThreadId, srq_flags: u32) -> u8 {
        let ticks = self.ticks();

        {
            // Safety: the caller owns the thread through the sleep queue
            let thread = unsafe { self.threads.thread_mut(tid) };

            assert_eq!(thread.state, ThreadState::Inhibited);

            thread.inhibitors &= !inhibit::SLEEPING;

            if thread.inhibitors == 0 {
                thread.state = ThreadState::CanRun;
            }

            let slept = ticks.wrapping_sub(thread.slptick);

            if thread.slptick != 0 && slept >= 1 {
                thread.slptime += u64::from(slept) << prio::SCHED_TICK_SHIFT;

                let (mut runtime, mut slptime) = (thread.runtime, thread.slptime);
                interact_update(&mut runtime, &mut slptime);
                thread.runtime = runtime;
                thread.slptime = slptime;

                thread.pctcpu.update(ticks, false);
            }

            thread.slptick = 0;
            thread.slice = 0;

            if thread.interrupt_class() {
                // Interrupt threads come back at their handler priority no
                // matter what they decayed to
                thread.priority = thread.base_ithread_pri;
            } else if thread.class == SchedClass::Timeshare {
                let pri = timeshare_priority(thread.runtime, thread.slptime, &thread.pctcpu);
                thread.user_pri = pri.min(thread.lend_user_pri);

                if !thread.flag(flags::BORROWING) {
                    thread.priority = pri;
                }
            }
        }

        self.add(curcpu, tid, srq::BORING | srq_flags)
    }

    /// Set a thread's effective priority, keeping queue placement and the
    /// cached queue minimum in line with it
    pub fn set_priority(&self, tid: ThreadId, pri: u8) {
        // Safety: the caller owns the thread through its lock tag; the
        // placement fields read here are stable until we take the queue
        // lock below
        let (state, cpu, old_pri, old_bucket) = {
            let thread = unsafe { self.threads.thread(tid) };
            (thread.state, thread.cpu, thread.priority, thread.rq_bucket)
        };

        if old_pri == pri {
            return;
        }

        match state {
            ThreadState::OnRunq => {
                let queue = self.queue(cpu);
                let mut data = queue.lock();

                if runq::RunQueue::bucket_for(pri) == old_bucket {
                    // Same bucket, no requeue needed
                    // Safety: we hold the queue lock owning the thread
                    unsafe {
                        self.threads.thread_mut(tid).priority = pri;
                    }
                } else {
                    queue.runq_rem(&mut data, &self.threads, tid);

                    // Safety: we hold the queue lock owning the thread
                    unsafe {
                        self.threads.thread_mut(tid).priority = pri;
                    }

                    queue.runq_add(&mut data, &self.threads, tid, srq::BORROWING);
                }

                queue.set_lowpri(&data, &self.threads, None);
            }
            ThreadState::Running => {
                let queue = self.queue(cpu);
                let data = queue.lock();

                // Safety: we hold the queue lock owning the running thread
                unsafe {
                    self.threads.thread_mut(tid).priority = pri;
                }

                if pri < queue.lowpri() {
                    queue.set_lowpri(&data, &self.threads, Some(pri));
                } else if queue.lowpri() == old_pri {
                    queue.set_lowpri(&data, &self.threads, None);
                }
            }
            _ => {
                // Safety: per the caller's ownership
                unsafe {
                    self.threads.thread_mut(tid).priority = pri;
                }
            }
        }
    }

    /// Lend `pri` to a thread, marking it as borrowing
    pub fn lend_priority(&self, tid: ThreadId, pri: u8) {
        {
            // Safety: the caller owns the thread through its lock tag
            let thread = unsafe { self.threads.thread_mut(tid) };
            thread.flags |= flags::BORROWING;
        }

        self.set_priority(tid, pri);
    }

    /// Return a lent priority
    ///
    /// `pri` is the borrow being released. The base priority comes back
    /// unless a still-lower value remains requested, in which case the
    /// thread keeps borrowing at that value.
    pub fn unlend_priority(&self, tid: ThreadId, pri: u8) {
        let (base, effective) = {
            // Safety: the caller owns the thread through its lock tag
            let thread = unsafe { self.threads.thread(tid) };

            let base = if (PRI_MIN_TIMESHARE..=PRI_MAX_TIMESHARE).contains(&thread.base_pri) {
                thread.user_pri
            } else {
                thread.base_pri
            };

            (base, thread.priority)
        };

        if pri >= base || pri == effective {
            {
                // Safety: as above
                let thread = unsafe { self.threads.thread_mut(tid) };
                thread.flags &= !flags::BORROWING;
            }

            self.set_priority(tid, base);
        } else {
            self.lend_priority(tid, pri);
        }
    }

    /// Lend a user priority; demotes the effective priority when it is
    /// better than the lent value, otherwise defers to the next boundary
    pub fn lend_user_priority(&self, tid: ThreadId, pri: u8) {
        let (user_pri, effective) = {
            // Safety: the caller owns the thread through its lock tag
            let thread = unsafe { self.threads.thread_mut(tid) };

            thread.lend_user_pri = pri;
            thread.user_pri = pri.min(thread.base_user_pri);

            (thread.user_pri, thread.priority)
        };

        if effective > user_pri {
            self.set_priority(tid, user_pri);
        } else if effective != user_pri {
            // Safety: as above
            let thread = unsafe { self.threads.thread_mut(tid) };
            thread.flags |= flags::ASTPENDING;
        }
    }

    /// Advance the per-CPU tick counter by `n` and fold the global counter
    /// forward, never backward
    ///
    /// The fold is a bounded compare-exchange; losing every attempt just
    /// leaves the local counter ahead until the next tick.
    pub fn hardclock(&self, cpu: u8, n: u32) -> u32 {
        let t = self.queue(cpu).advance_tickcount(n);

        for _ in 0..4 {
            let global = self.ticks.load(Ordering::Relaxed);

            #[allow(clippy::cast_possible_wrap, reason = "Tick distance fits in i32")]
            let ahead = t.wrapping_sub(global) as i32;

            if ahead <= 0 {
                break;
            }

            if self
                .ticks
                .compare_exchange_weak(global, t, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }

        t
    }

    /// Per-tick scheduling work for `cpu`'s running thread
    ///
    /// Returns true when the CPU should reschedule at the next boundary.
    pub fn clock(&self, cpu: u8, n: u32) -> bool {
        let queue = self.queue(cpu);
        let mut data = queue.lock();

        // Advance the timeshare rotation: the insert index moves one
        // bucket per tick once the drain has caught up with it
        if data.idx == data.ridx {
            #[allow(clippy::cast_possible_truncation, reason = "RQ_NQS is 64")]
            {
                data.idx = ((usize::from(data.idx) + 1) % RQ_NQS) as u8;
            }

            if data.timeshare.bucket_empty(data.ridx) {
                data.ridx = data.idx;
            }
        }

        let Some(tid) = data.current else {
            return false;
        };

        let ticks = self.ticks();

        let (resched, lowpri_stale) = {
            // Safety: we hold the queue lock owning the running thread
            let thread = unsafe { self.threads.thread_mut(tid) };

            thread.pctcpu.update(ticks, true);

            if thread.idle_thread() {
                return false;
            }

            let mut lowpri_stale = false;

            if thread.class == SchedClass::Timeshare {
                thread.runtime += TICK_INCR * u64::from(n);

                let (mut runtime, mut slptime) = (thread.runtime, thread.slptime);
                interact_update(&mut runtime, &mut slptime);
                thread.runtime = runtime;
                thread.slptime = slptime;

                let pri = timeshare_priority(thread.runtime, thread.slptime, &thread.pctcpu);
                thread.user_pri = pri.min(thread.lend_user_pri);

                if !thread.flag(flags::BORROWING) && thread.priority != pri {
                    thread.priority = pri;
                    lowpri_stale = true;
                }
            }

            #[allow(clippy::cast_possible_wrap, reason = "Tick batches are small")]
            {
                thread.slice -= n as i32;
            }

            let resched = if thread.slice <= 0 {
                if thread.interrupt_class() {
                    // A spent interrupt thread drops one bucket and keeps
                    // going rather than bouncing through the queue
                    thread.priority = (thread.priority + RQ_PPQ).min(PRI_MAX_ITHD);
                    thread.slice = queue.slice();
                    lowpri_stale = true;
                    false
                } else {
                    thread.slice = 0;
                    thread.flags |= flags::SLICEEND | flags::ASTPENDING;
                    true
                }
            } else {
                false
            };

            (resched, lowpri_stale)
        };

        if lowpri_stale {
            queue.set_lowpri(&data, &self.threads, None);
        }

        resched
    }

    /// Whether `cpu` owes a reschedule at the next safe boundary
    pub fn needs_resched(&self, cpu: u8) -> bool {
        let queue = self.queue(cpu);

        if queue.owe_preempt() {
            return true;
        }

        let data = queue.lock();

        data.current.is_some_and(|tid| {
            // Safety: the queue lock owns its current thread
            unsafe { self.threads.thread(tid).flag(flags::ASTPENDING) }
        })
    }

    /// Decide a context switch on `cpu`: dispose of the running thread,
    /// choose its successor and hand both back to the machine layer
    ///
    /// The previous thread is left behind the blocked sentinel; the
    /// machine layer publishes `prev_owner` once its context is saved.
    pub fn switch(&self, cpu: u8, sw_flags: u32) -> SwitchOutcome {
        let queue = self.queue(cpu);
        let ticks = self.ticks();
        let mut data = queue.lock();

        let prev = data.current.expect("switch on a CPU with no current thread");

        let (preempted, pickcpu, prev_state, prev_idle) = {
            // Safety: we hold the queue lock owning the running thread
            let thread = unsafe { self.threads.thread_mut(prev) };

            thread.pctcpu.update(ticks, true);

            // The affinity stamp; a thread that asked for a fresh CPU pick
            // forfeits its affinity window
            thread.rltick = if thread.flag(flags::PICKCPU) {
                ticks.wrapping_sub(AFFINITY * MAX_CACHE_LEVELS)
            } else {
                ticks
            };

            let preempted = !thread.flag(flags::SLICEEND) && sw_flags & sw::PREEMPT != 0;
            let pickcpu = thread.flag(flags::PICKCPU);

            thread.flags &= !(flags::PICKCPU | flags::SLICEEND | flags::ASTPENDING);
            thread.oncpu = NOCPU;

            (preempted, pickcpu, thread.state, thread.idle_thread())
        };

        queue.set_owe_preempt(false);

        if !prev_idle {
            queue.bump_switchcnt();
        }

        // From here until the machine layer saves its context the thread
        // is behind the blocked sentinel
        let blocked_from = self.threads.lock(prev).block();
        assert_eq!(blocked_from, LockOwner::CpuQueue(cpu));

        let prev_owner = if prev_idle {
            // Safety: we hold the queue lock owning the thread
            unsafe {
                self.threads.thread_mut(prev).state = ThreadState::CanRun;
            }

            LockOwner::CpuQueue(cpu)
        } else if prev_state == ThreadState::Running {
            // Still runnable: back onto a queue, possibly not ours
            let dest = if pickcpu {
                self.pick_cpu(cpu, prev, srq::BORING)
            } else {
                cpu
            };

            let add_flags = if preempted { srq::PREEMPTED } else { srq::BORING };

            {
                // Safety: we hold the queue lock owning the thread
                let thread = unsafe { self.threads.thread_mut(prev) };
                thread.state = ThreadState::OnRunq;
                thread.cpu = dest;
            }

            if dest == cpu {
                queue.runq_add(&mut data, &self.threads, prev, add_flags);
                LockOwner::CpuQueue(cpu)
            } else {
                data = self.migrate(cpu, data, prev, dest, add_flags);
                LockOwner::CpuQueue(dest)
            }
        } else {
            // Sleeping or otherwise inhibited: it only leaves the load
            queue.load_rem(&self.threads, prev);
            LockOwner::SleepQueue
        };

        // Choose the successor
        let next = match queue.choose(&data) {
            Some(tid) => {
                queue.runq_rem(&mut data, &self.threads, tid);
                tid
            }
            None => data.idle_thread.expect("CPU has no idle thread"),
        };

        {
            // Safety: we hold the queue lock owning the chosen thread
            let thread = unsafe { self.threads.thread_mut(next) };

            thread.state = ThreadState::Running;
            thread.oncpu = cpu;
            thread.cpu = cpu;

            if thread.slice <= 0 {
                thread.slice = queue.slice();
            }

            thread.pctcpu.update(ticks, false);
        }

        data.current = Some(next);
        queue.set_lowpri(&data, &self.threads, None);
        drop(data);

        // If the successor was just migrated here its previous owner may
        // still be saving its context; wait with no locks held until the
        // hand-off tag leaves the sentinel, then take ownership
        if next != prev {
            self.threads.lock(next).spin_until_unblocked();
            self.threads.lock(next).set(LockOwner::CpuQueue(cpu));
        }

        SwitchOutcome {
            prev,
            next,
            prev_owner,
        }
    }

    /// Publish the previous thread's owner once the machine layer has
    /// saved its context, completing the hand-off
    pub fn finish_switch(&self, outcome: &SwitchOutcome) {
        self.threads.lock(outcome.prev).set(outcome.prev_owner);
    }

    /// Move a still-runnable thread to `dest`'s queue
    ///
    /// Lock order is preserved by fully dropping the source lock first:
    /// drop source, take destination, insert, notify, drop destination,
    /// re-take source. The caller's guard is consumed and a fresh source
    /// guard returned.
    fn migrate<'a>(
        &'a self,
        cpu: u8,
        data: spinning_top::guard::SpinlockGuard<'a, CpuQueueData>,
        tid: ThreadId,
        dest: u8,
        add_flags: u32,
    ) -> spinning_top::guard::SpinlockGuard<'a, CpuQueueData> {
        {
            // Safety: the thread is behind the blocked sentinel, we still
            // own it
            let thread = unsafe { self.threads.thread(tid) };
            assert!(!thread.flag(flags::BOUND), "cannot migrate a bound thread");
        }

        let queue = self.queue(cpu);
        queue.load_rem(&self.threads, tid);

        drop(data);

        let dest_queue = self.queue(dest);

        {
            let mut dest_data = dest_queue.lock();
            let replaced_lowpri = dest_queue.lowpri();

            dest_queue.runq_add(&mut dest_data, &self.threads, tid, add_flags);
            dest_queue.load_add(&self.threads, tid);
            dest_queue.set_lowpri(&dest_data, &self.threads, None);

            drop(dest_data);
            dest_queue.notify(replaced_lowpri);
        }

        queue.lock()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(loom)))]
#[allow(clippy::unwrap_used, reason = "No need to be so rigid in tests")]
mod tests {
    use super::*;
    use nanorand::{Rng, WyRand};
    use prio::{PRI_MAX_BATCH, SCHED_SLICE};

    fn fresh(ncpus: usize) -> Box<Scheduler> {
        let sched = Box::new(Scheduler::new());
        sched.init(ncpus);

        for cpu in 0..ncpus {
            #[allow(clippy::cast_possible_truncation, reason = "Small test CPU counts")]
            let cpu = cpu as u8;

            let idle = sched
                .thread_create("idle", SchedClass::Idle, PRI_MAX_IDLE)
                .unwrap();

            sched.set_idle(cpu, idle);
            sched.set_current(cpu, idle);
        }

        sched
    }

    fn run_state(sched: &Scheduler, tid: ThreadId) -> ThreadState {
        // Safety: tests are single threaded
        unsafe { sched.threads().thread(tid).state }
    }

    fn priority_of(sched: &Scheduler, tid: ThreadId) -> u8 {
        // Safety: tests are single threaded
        unsafe { sched.threads().thread(tid).priority }
    }

    /// Drive a full switch the way the machine layer would
    fn switch_now(sched: &Scheduler, cpu: u8, sw_flags: u32) -> SwitchOutcome {
        let outcome = sched.switch(cpu, sw_flags);
        sched.finish_switch(&outcome);
        outcome
    }

    #[test]
    fn test_choose_order_across_bands() {
        // Threads with base priorities 100, 140 and 180 and no history are
        // dispatched strictly in priority order
        let sched = fresh(1);

        let t100 = sched.thread_create("a", SchedClass::Timeshare, 100).unwrap();
        let t140 = sched.thread_create("b", SchedClass::Timeshare, 140).unwrap();
        let t180 = sched.thread_create("c", SchedClass::Timeshare, 180).unwrap();

        // Interactivity history is empty, the score is 0 for each
        assert_eq!(prio::interact_score(0, 0), 0);

        // Enqueue out of order on CPU 0
        sched.add(0, t180, srq::BORING);
        sched.add(0, t100, srq::BORING);
        sched.add(0, t140, srq::BORING);

        let first = switch_now(&sched, 0, sw::INVOL | sw::PREEMPT);
        assert_eq!(first.next, t100);

        // Park the running thread so the next switch moves on
        sched.sleep(0, t100);
        let second = switch_now(&sched, 0, sw::VOL);
        assert_eq!(second.next, t140);

        sched.sleep(0, t140);
        let third = switch_now(&sched, 0, sw::VOL);
        assert_eq!(third.next, t180);
    }

    #[test]
    fn test_timeshare_rotation_visits_every_bucket_once() {
        // One batch thread per bucket: a full drain visits all 64 buckets
        // before any bucket repeats
        let sched = fresh(1);
        let queue = sched.queue(0);

        let mut tids = vec![];

        for bucket in 0..RQ_NQS {
            // The smallest batch priority that scales to this bucket
            let pri = PRI_MIN_BATCH
                + u8::try_from((u32::from(prio::PRI_BATCH_RANGE) * bucket as u32).div_ceil(RQ_NQS as u32))
                    .unwrap();

            assert!(pri <= PRI_MAX_BATCH);

            let tid = sched.thread_create("batch", SchedClass::Timeshare, pri).unwrap();

            {
                let mut data = queue.lock();

                // Safety: single threaded test
                unsafe {
                    sched.threads().thread_mut(tid).state = ThreadState::OnRunq;
                }

                queue.runq_add(&mut data, sched.threads(), tid, srq::BORING);
            }

            tids.push(tid);
        }

        let mut visited = vec![];
        let mut data = queue.lock();

        while let Some(tid) = queue.choose(&data) {
            // Safety: single threaded test
            let bucket = unsafe { sched.threads().thread(tid).rq_bucket };
            visited.push(bucket);
            queue.runq_rem(&mut data, sched.threads(), tid);
        }

        assert_eq!(visited.len(), RQ_NQS);

        let mut sorted = visited.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), RQ_NQS, "a bucket was visited twice before the drain finished");
    }

    #[test]
    fn test_remote_wakeup_prefers_idle_cpu() {
        // CPU 0 runs a priority-50 thread, CPU 1 is idle. Waking a
        // priority-80 thread picks CPU 1 and asks it to preempt.
        let sched = fresh(2);

        // Run the waker on CPU 0 once so it has a sleep to wake from
        let waker = sched.thread_create("waker", SchedClass::Timeshare, 80).unwrap();
        sched.add(0, waker, srq::BORING);
        let outcome = switch_now(&sched, 0, sw::INVOL | sw::PREEMPT);
        assert_eq!(outcome.next, waker);
        sched.sleep(0, waker);
        switch_now(&sched, 0, sw::VOL);

        // Now occupy CPU 0 with a priority-50 thread
        let busy = sched.thread_create("busy", SchedClass::Realtime, 50).unwrap();
        sched.add(0, busy, srq::BORING);
        let outcome = switch_now(&sched, 0, sw::INVOL | sw::PREEMPT);
        assert_eq!(outcome.next, busy);
        assert_eq!(sched.queue(0).lowpri(), 50);
        assert_eq!(sched.queue(1).lowpri(), PRI_MAX_IDLE);

        let cpu = sched.wakeup(0, waker, srq::BORING);

        assert_eq!(cpu, 1);
        assert!(sched.queue(1).owe_preempt());
        assert!(prio::should_preempt(80, PRI_MAX_IDLE, true));
    }

    #[test]
    fn test_priority_lending_round_trip() {
        let sched = fresh(1);

        let tid = sched.thread_create("t", SchedClass::Timeshare, 140).unwrap();
        sched.add(0, tid, srq::BORING);

        sched.lend_priority(tid, 60);

        // Safety: single threaded test
        unsafe {
            assert_eq!(sched.threads().thread(tid).priority, 60);
            assert!(sched.threads().thread(tid).flag(flags::BORROWING));
        }

        sched.unlend_priority(tid, 60);

        // Safety: single threaded test
        unsafe {
            assert_eq!(sched.threads().thread(tid).priority, 140);
            assert!(!sched.threads().thread(tid).flag(flags::BORROWING));
        }
    }

    #[test]
    fn test_unlend_keeps_lower_request() {
        let sched = fresh(1);

        let tid = sched.thread_create("t", SchedClass::Timeshare, 140).unwrap();
        sched.add(0, tid, srq::BORING);

        sched.lend_priority(tid, 60);

        // Releasing a weaker borrow than the one outstanding re-lends
        sched.unlend_priority(tid, 100);
        assert_eq!(priority_of(&sched, tid), 100);

        // Safety: single threaded test
        unsafe {
            assert!(sched.threads().thread(tid).flag(flags::BORROWING));
        }

        // Releasing at the outstanding value restores the base
        sched.unlend_priority(tid, 100);
        assert_eq!(priority_of(&sched, tid), 140);
    }

    #[test]
    fn test_lend_user_priority() {
        let sched = fresh(1);

        let tid = sched.thread_create("t", SchedClass::Timeshare, 160).unwrap();
        sched.add(0, tid, srq::BORING);

        // Lending a better user priority demotes the effective one to it
        sched.lend_user_priority(tid, 120);
        assert_eq!(priority_of(&sched, tid), 120);

        // Safety: single threaded test
        unsafe {
            assert_eq!(sched.threads().thread(tid).user_pri, 120);
        }
    }

    #[test]
    fn test_slice_end_forces_resched() {
        let sched = fresh(1);

        let tid = sched.thread_create("t", SchedClass::Timeshare, 150).unwrap();
        sched.add(0, tid, srq::BORING);
        switch_now(&sched, 0, sw::INVOL | sw::PREEMPT);

        // The dispatched thread got a fresh slice
        // Safety: single threaded test
        let slice = unsafe { sched.threads().thread(tid).slice };
        assert_eq!(slice, SCHED_SLICE);

        // Burn it down tick by tick
        let mut resched = false;

        for _ in 0..SCHED_SLICE {
            sched.hardclock(0, 1);
            resched = sched.clock(0, 1);

            if resched {
                break;
            }
        }

        assert!(resched);
        assert!(sched.needs_resched(0));

        // Safety: single threaded test
        unsafe {
            assert!(sched.threads().thread(tid).flag(flags::SLICEEND));
        }

        // The forced switch is not recorded as a preemption: the thread
        // goes to the tail, not the head
        let outcome = switch_now(&sched, 0, sw::INVOL | sw::PREEMPT);
        assert_eq!(outcome.prev, tid);
        assert_eq!(outcome.next, tid);
        assert_eq!(run_state(&sched, tid), ThreadState::Running);
    }

    #[test]
    fn test_sleep_and_wakeup_round_trip() {
        let sched = fresh(1);

        let tid = sched.thread_create("t", SchedClass::Timeshare, 150).unwrap();
        sched.add(0, tid, srq::BORING);
        switch_now(&sched, 0, sw::INVOL | sw::PREEMPT);

        assert_eq!(sched.queue(0).load(), 1);

        // Let a few ticks pass so the sleep stamp is non-zero
        for _ in 0..5 {
            sched.hardclock(0, 1);
            sched.clock(0, 1);
        }

        sched.sleep(0, tid);
        let outcome = switch_now(&sched, 0, sw::VOL);

        // The idle thread takes over and the sleeper leaves the load
        assert_eq!(outcome.prev, tid);
        assert_eq!(run_state(&sched, tid), ThreadState::Inhibited);
        assert_eq!(sched.queue(0).load(), 0);
        assert_eq!(
            sched.threads().lock(tid).owner(),
            tdlock::LockOwner::SleepQueue
        );

        // Let some ticks pass so the sleep is visible in the history
        for _ in 0..10 {
            sched.hardclock(0, 1);
            sched.clock(0, 1);
        }

        sched.wakeup(0, tid, srq::BORING);

        assert_eq!(run_state(&sched, tid), ThreadState::OnRunq);
        assert_eq!(sched.queue(0).load(), 1);

        // Safety: single threaded test
        unsafe {
            assert!(sched.threads().thread(tid).slptime > 0);
        }
    }

    #[test]
    fn test_sleep_demotes_deep_batch_priority() {
        let sched = fresh(1);

        let tid = sched.thread_create("t", SchedClass::Timeshare, 200).unwrap();
        sched.add(0, tid, srq::BORING);
        switch_now(&sched, 0, sw::INVOL | sw::PREEMPT);

        sched.sleep(0, tid);
        assert_eq!(priority_of(&sched, tid), PRI_MIN_BATCH);
    }

    #[test]
    fn test_clock_rotates_insert_index() {
        let sched = fresh(1);
        let queue = sched.queue(0);

        let (idx0, ridx0) = {
            let data = queue.lock();
            (data.idx, data.ridx)
        };

        assert_eq!((idx0, ridx0), (0, 0));

        sched.clock(0, 1);

        let (idx1, ridx1) = {
            let data = queue.lock();
            (data.idx, data.ridx)
        };

        // With an empty timeshare queue both cursors advance together
        assert_eq!((idx1, ridx1), (1, 1));
    }

    #[test]
    fn test_hardclock_folds_global_forward() {
        let sched = fresh(2);
        let start = sched.ticks();

        sched.hardclock(0, 5);
        assert_eq!(sched.ticks(), start.wrapping_add(5));

        // A CPU that lags does not pull the global counter backward
        sched.hardclock(1, 2);
        assert_eq!(sched.ticks(), start.wrapping_add(5));

        sched.hardclock(1, 10);
        assert_eq!(sched.ticks(), start.wrapping_add(12));
    }

    #[test]
    fn test_migration_on_pickcpu() {
        let sched = fresh(2);

        // CPU 0 runs a timeshare thread and holds a queued realtime
        // thread bound to it, so CPU 0's load tips the balance
        let runner = sched.thread_create("runner", SchedClass::Timeshare, 150).unwrap();
        let other = sched.thread_create("other", SchedClass::Realtime, 40).unwrap();

        sched.add(0, runner, srq::BORING);
        switch_now(&sched, 0, sw::INVOL | sw::PREEMPT);

        {
            // Safety: single threaded test
            let thread = unsafe { sched.threads().thread_mut(other) };
            thread.flags |= flags::BOUND;
            thread.cpu = 0;
        }

        sched.add(0, other, srq::BORING);

        // Ask the running thread to re-pick its CPU at the next switch
        {
            // Safety: single threaded test
            let thread = unsafe { sched.threads().thread_mut(runner) };
            thread.flags |= flags::PICKCPU;
        }

        let outcome = switch_now(&sched, 0, sw::INVOL | sw::PREEMPT);

        // The preempting realtime thread takes CPU 0, the runner lands on
        // the idle CPU 1
        assert_eq!(outcome.next, other);

        // Safety: single threaded test
        let moved_to = unsafe { sched.threads().thread(runner).cpu };
        assert_eq!(moved_to, 1);
        assert_eq!(run_state(&sched, runner), ThreadState::OnRunq);
        assert_eq!(sched.queue(1).load(), 1);
        assert_eq!(
            sched.threads().lock(runner).owner(),
            tdlock::LockOwner::CpuQueue(1)
        );
    }

    #[test]
    fn test_invariants_under_random_workload() {
        // Random add/sleep/wakeup/tick/switch storm on two CPUs; at every
        // quiescent point the bookkeeping invariants must hold
        let sched = fresh(2);
        let mut rng = WyRand::new_seed(0xDECAF);

        let mut tids = vec![];

        for i in 0..24 {
            let class = if i % 4 == 0 {
                SchedClass::Realtime
            } else {
                SchedClass::Timeshare
            };

            let pri = match class {
                SchedClass::Realtime => 16 + (i as u8 % 32),
                _ => 100 + (i as u8 * 5 % 120),
            };

            let tid = sched.thread_create("w", class, pri).unwrap();
            sched.add(0, tid, srq::BORING);
            tids.push(tid);
        }

        for _ in 0..5_000 {
            let cpu = rng.generate_range(0..2_u8);

            match rng.generate_range(0..4_u8) {
                0 => {
                    sched.hardclock(cpu, 1);
                    sched.clock(cpu, 1);
                }
                1 => {
                    switch_now(&sched, cpu, sw::INVOL | sw::PREEMPT);
                }
                2 => {
                    let current = sched.current(cpu);

                    if let Some(tid) = current {
                        if run_state(&sched, tid) == ThreadState::Running
                            && !unsafe {
                                // Safety: single threaded test
                                sched.threads().thread(tid).idle_thread()
                            }
                        {
                            sched.sleep(cpu, tid);
                            switch_now(&sched, cpu, sw::VOL);
                        }
                    }
                }
                _ => {
                    let pick = rng.generate_range(0..tids.len());
                    let tid = tids[pick];

                    if run_state(&sched, tid) == ThreadState::Inhibited {
                        sched.wakeup(cpu, tid, srq::BORING);
                    }
                }
            }

            check_invariants(&sched, &tids);
        }
    }

    fn check_invariants(sched: &Scheduler, tids: &[ThreadId]) {
        for cpu in 0..2_u8 {
            let queue = sched.queue(cpu);
            let data = queue.lock();

            let mut runnable = 0_u32;
            let mut load = 0_u32;
            let mut min_pri = PRI_MAX_IDLE;

            for &tid in tids {
                // Safety: single threaded test
                let thread = unsafe { sched.threads().thread(tid) };

                if thread.cpu != cpu {
                    continue;
                }

                match thread.state {
                    ThreadState::OnRunq => {
                        runnable += 1;
                        load += 1;
                        min_pri = min_pri.min(thread.priority);

                        // Lock tag names the owning queue
                        assert_eq!(
                            sched.threads().lock(tid).owner(),
                            tdlock::LockOwner::CpuQueue(cpu)
                        );
                    }
                    ThreadState::Running => {
                        assert_eq!(data.current, Some(tid));
                        load += 1;
                    }
                    _ => {}
                }
            }

            // Each runnable thread is linked exactly once across the three
            // run-queues
            let mut linked = 0;

            for bucket in 0..RQ_NQS {
                #[allow(clippy::cast_possible_truncation, reason = "RQ_NQS is 64")]
                let bucket = bucket as u8;

                linked += data.realtime.bucket_len(sched.threads(), bucket);
                linked += data.timeshare.bucket_len(sched.threads(), bucket);
                linked += data.idle.bucket_len(sched.threads(), bucket);
            }

            assert_eq!(linked as u32, runnable, "cpu {cpu} queue membership mismatch");
            assert_eq!(queue.load(), load, "cpu {cpu} load mismatch");

            // The cached minimum is refreshed on every add, removal,
            // switch and priority change; only the timeshare rotation may
            // move underneath it. That bounds it between the true minimum
            // over current + runnables and the current thread's priority.
            let current_pri = data
                .current
                // Safety: single threaded test
                .map(|tid| unsafe { sched.threads().thread(tid).priority })
                .unwrap_or(PRI_MAX_IDLE);

            let true_min = min_pri.min(current_pri);
            let cached = queue.lowpri();

            assert!(
                cached >= true_min && cached <= current_pri,
                "cpu {cpu} lowpri {cached} outside [{true_min}, {current_pri}]"
            );

            drop(data);
        }
    }
}
