//! Per-CPU glue around the scheduler core: critical-section discipline,
//! the timer trap entry point, the context hand-off and thread creation
//!
//! The switch mechanism is pure preemption: the trap stub materializes the
//! interrupted thread's registers as a [`TrapFrame`] on the stack, the
//! scheduler picks a successor, and this module swaps the frame contents
//! in place. Returning from the trap resumes whichever thread the frame
//! now describes.

use core::cell::UnsafeCell;
use core::sync::atomic::{compiler_fence, AtomicU16, AtomicU32, Ordering};

use kernel_algo::sched::{
    cpu_queue::srq,
    prio,
    sw,
    thread::{SchedClass, ThreadId, MAX_THREADS},
    Scheduler, MAX_CPUS,
};
use x86_64::instructions::hlt;

use crate::{
    cpu, gdt, mem, timer,
    trap::TrapFrame,
    debug_println,
    debug_print::HEADING_PREFIX,
};

static SCHED: Scheduler = Scheduler::new();

const KSTACK_PAGES: usize = 4;

// Saved contexts, indexed by thread id. A context is only touched by the
// CPU that owns the thread under the lock-tag hand-off protocol: the
// previous owner writes it before publishing the tag, the next owner reads
// it after the tag leaves the blocked sentinel.
struct ContextTable([UnsafeCell<TrapFrame>; MAX_THREADS]);

// Safety: see above
unsafe impl Sync for ContextTable {}

const FRAME_INIT: UnsafeCell<TrapFrame> = UnsafeCell::new(TrapFrame::zeroed());
static CONTEXTS: ContextTable = ContextTable([FRAME_INIT; MAX_THREADS]);

struct Pcpu {
    curthread: AtomicU16,
    /// Tick stamp of the last context switch, for runtime charging
    switchticks: AtomicU32,
}

const PCPU_INIT: Pcpu = Pcpu {
    curthread: AtomicU16::new(0),
    switchticks: AtomicU32::new(0),
};

static PCPU: [Pcpu; MAX_CPUS] = [PCPU_INIT; MAX_CPUS];

pub fn scheduler() -> &'static Scheduler {
    &SCHED
}

pub fn init(ncpus: usize) {
    debug_println!(HEADING_PREFIX; "Setting up scheduler for {ncpus} CPU(s)");
    SCHED.init(ncpus);
}

fn curthread(cpu: u8) -> ThreadId {
    ThreadId(PCPU[usize::from(cpu)].curthread.load(Ordering::Acquire))
}

/// Enter a region where preemption is suppressed
pub fn critical_enter() {
    let tid = curthread(cpu::core_id());

    // Safety: the nesting counters are only ever touched by their own
    // thread
    let thread = unsafe { SCHED.threads().thread_mut(tid) };

    thread.critnest += 1;
    compiler_fence(Ordering::SeqCst);
}

/// Leave a critical region; a preemption owed meanwhile is honored at the
/// outermost exit
pub fn critical_exit() {
    let cpu_id = cpu::core_id();
    let tid = curthread(cpu_id);

    // Safety: as in critical_enter
    let thread = unsafe { SCHED.threads().thread_mut(tid) };

    assert!(thread.critnest > 0, "critical_exit without critical_enter");
    compiler_fence(Ordering::SeqCst);
    thread.critnest -= 1;

    // The switch itself must come through a trap, so pull the tick in
    if thread.critnest == 0 && SCHED.queue(cpu_id).owe_preempt() {
        timer::kick();
    }
}

/// First entry of a spinlock: save the interrupt state, mask interrupts
/// and enter a critical section
pub fn spinlock_enter() {
    let enabled = cpu::intr_enabled();
    cpu::set_intr_mode(false);

    let tid = curthread(cpu::core_id());

    // Safety: as in critical_enter
    let thread = unsafe { SCHED.threads().thread_mut(tid) };

    if thread.spinlock_count == 0 {
        thread.saved_intr = enabled;
        thread.critnest += 1;
    }

    thread.spinlock_count += 1;
    compiler_fence(Ordering::SeqCst);
}

/// Last exit restores the saved interrupt state and leaves the critical
/// section
pub fn spinlock_exit() {
    let cpu_id = cpu::core_id();
    let tid = curthread(cpu_id);

    // Safety: as in critical_enter
    let thread = unsafe { SCHED.threads().thread_mut(tid) };

    assert!(thread.spinlock_count > 0, "spinlock_exit without spinlock_enter");
    compiler_fence(Ordering::SeqCst);
    thread.spinlock_count -= 1;

    if thread.spinlock_count == 0 {
        thread.critnest -= 1;
        let restore = thread.saved_intr;

        if thread.critnest == 0 && SCHED.queue(cpu_id).owe_preempt() {
            timer::kick();
        }

        if restore {
            cpu::set_intr_mode(true);
        }
    }
}

/// Timer vector entry point: advance the clocks and drive a switch when
/// one is owed
pub fn reschedule(frame: &mut TrapFrame) {
    crate::intr::submit_eoi();

    let cpu_id = cpu::core_id();

    critical_enter();

    SCHED.hardclock(cpu_id, 1);
    SCHED.clock(cpu_id, 1);

    if SCHED.needs_resched(cpu_id) {
        // A thread inside a critical section cannot be preempted; leave
        // the request pending, critical_exit honors it
        let in_critical = {
            let tid = curthread(cpu_id);

            // Safety: the nesting counter belongs to the interrupted
            // thread, which is not running until we return
            unsafe { SCHED.threads().thread(tid).critnest > 1 }
        };

        if in_critical {
            SCHED.queue(cpu_id).set_owe_preempt(true);
        } else {
            mi_switch(sw::INVOL | sw::PREEMPT, frame);
        }
    }

    // Leave the trap's critical section by hand: if a switch happened the
    // counter now belongs to the thread the frame resumes, which parked
    // at 1 when it was switched out
    {
        let tid = curthread(cpu_id);

        // Safety: as in critical_enter
        let thread = unsafe { SCHED.threads().thread_mut(tid) };

        assert!(thread.critnest > 0);
        thread.critnest -= 1;
    }

    timer::arm_tick();
}

/// Switch the CPU to whatever the scheduler picks next
///
/// `flags` must name exactly one of voluntary/involuntary. Runtime since
/// the last switch is charged to the outgoing thread.
pub fn mi_switch(sw_flags: u32, frame: &mut TrapFrame) {
    let vol = sw_flags & sw::VOL != 0;
    let invol = sw_flags & sw::INVOL != 0;
    assert!(vol != invol, "exactly one of voluntary/involuntary");

    let cpu_id = cpu::core_id();
    let tid = curthread(cpu_id);
    let ticks = SCHED.ticks();
    let pcpu = &PCPU[usize::from(cpu_id)];

    {
        // Safety: we are the running thread and hold no queue lock yet
        let thread = unsafe { SCHED.threads().thread_mut(tid) };

        assert_eq!(thread.critnest, 1, "mi_switch inside a nested critical section");

        if vol {
            thread.swvoltick = ticks;
        } else {
            thread.swinvoltick = ticks;
        }

        let since = ticks.wrapping_sub(pcpu.switchticks.load(Ordering::Relaxed));
        thread.incruntime += u64::from(since);
    }

    pcpu.switchticks.store(ticks, Ordering::Relaxed);

    let outcome = SCHED.switch(cpu_id, sw_flags);

    if outcome.next == outcome.prev {
        SCHED.finish_switch(&outcome);
        return;
    }

    // Save the interrupted context, publish the hand-off, then adopt the
    // successor's context. The successor's tag already left the blocked
    // sentinel, so its context is fully written.
    unsafe {
        // Safety: `prev` is behind the blocked sentinel, no other CPU
        // touches its context until `finish_switch` publishes it
        *CONTEXTS.0[outcome.prev.0 as usize].get() = *frame;
    }

    SCHED.finish_switch(&outcome);

    unsafe {
        // Safety: `next` is this CPU's current thread now, nobody else
        // reads or writes its context
        *frame = *CONTEXTS.0[outcome.next.0 as usize].get();
    }

    pcpu.curthread.store(outcome.next.0, Ordering::Release);
}

/// Create a kernel thread entering `entry` on its own stack
pub fn kthread_spawn(name: &'static str, class: SchedClass, pri: u8, entry: fn() -> !) -> ThreadId {
    let tid = SCHED
        .thread_create(name, class, pri)
        .expect("Out of thread slots");

    let stack = mem::alloc_pages(KSTACK_PAGES).expect("Out of memory allocating a thread stack");
    let stack_top = mem::to_higher_half(stack) + KSTACK_PAGES * mem::PAGE_SIZE;

    {
        // Safety: the thread is not reachable by any CPU yet
        let thread = unsafe { SCHED.threads().thread_mut(tid) };

        // Born as if switched out: the trap epilogue that first resumes it
        // drops the nesting to zero
        thread.critnest = 1;
    }

    let gdt_info = gdt::info();

    // Safety: as above, the thread and its context slot are still private
    let frame = unsafe { &mut *CONTEXTS.0[tid.0 as usize].get() };

    *frame = TrapFrame::zeroed();
    frame.rip = entry as usize as u64;
    frame.rsp = ((stack_top as u64) & !0xF) - 8; // As if entered by a call
    frame.cs = u64::from(gdt_info.kernel_code_seg.0);
    frame.ss = u64::from(gdt_info.kernel_data_seg.0);
    frame.rflags = 0x202; // IF set

    SCHED.add(cpu::core_id(), tid, srq::BORING);

    debug_println!(HEADING_PREFIX; "Spawned kernel thread '{name}' ({tid:?})");

    tid
}

/// Turn the calling CPU's boot context into its idle thread and start
/// taking ticks
pub fn start() -> ! {
    let cpu_id = cpu::core_id();

    let idle = SCHED
        .thread_create("idle", SchedClass::Idle, prio::PRI_MAX_IDLE)
        .expect("Out of thread slots");

    SCHED.set_idle(cpu_id, idle);
    SCHED.set_current(cpu_id, idle);

    let pcpu = &PCPU[usize::from(cpu_id)];
    pcpu.curthread.store(idle.0, Ordering::Release);
    pcpu.switchticks.store(SCHED.ticks(), Ordering::Relaxed);

    debug_println!(HEADING_PREFIX; "CPU {cpu_id} entering the scheduler");

    timer::arm_tick();
    cpu::set_intr_mode(true);

    idle_loop(cpu_id)
}

fn idle_loop(cpu_id: u8) -> ! {
    const IDLE_SPINS: u32 = 1000;

    let queue = SCHED.queue(cpu_id);

    loop {
        // A queue that switched since the last pass is likely to get work
        // again soon, spin briefly before paying for a halt
        let busy_recently = queue.switchcnt() != queue.oldswitchcnt();
        queue.roll_switchcnt();

        if busy_recently {
            let mut spins = 0;

            while queue.load() == 0 && spins < IDLE_SPINS {
                core::hint::spin_loop();
                spins += 1;
            }
        }

        if queue.load() > 0 {
            // Work appeared without a preemption request, pull the tick in
            timer::kick();
        }

        hlt();
    }
}
