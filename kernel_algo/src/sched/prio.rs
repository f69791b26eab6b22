//! Priority bands and the interactivity heuristics
//!
//! The 0-255 priority space is partitioned into interrupt, realtime,
//! timeshare and idle bands. The timeshare band is further split into an
//! interactive half and a batch half after reserving nice slots; a thread's
//! position inside the band is derived from its interactivity score and its
//! recent CPU usage.

/// Scheduler tick rate, ticks per second
pub const HZ: u32 = 1000;

pub const PRI_MIN_ITHD: u8 = 0;
pub const PRI_MAX_ITHD: u8 = 15;
pub const PRI_MIN_REALTIME: u8 = 16;
pub const PRI_MAX_REALTIME: u8 = 47;
pub const PRI_MIN_KERN: u8 = 48;
pub const PRI_MIN_TIMESHARE: u8 = 88;
pub const PRI_MIN_IDLE: u8 = 224;
pub const PRI_MAX_IDLE: u8 = 255;
pub const PRI_MAX_TIMESHARE: u8 = PRI_MIN_IDLE - 1;

/// Slots reserved in the timeshare band for the nice range
pub const SCHED_PRI_NRESV: u8 = 40;
const SCHED_PRI_NHALF: u8 = SCHED_PRI_NRESV / 2;

const PRI_TIMESHARE_RANGE: u8 = PRI_MAX_TIMESHARE - PRI_MIN_TIMESHARE + 1;
pub const PRI_INTERACT_RANGE: u8 = (PRI_TIMESHARE_RANGE - SCHED_PRI_NRESV) / 2;
pub const PRI_BATCH_RANGE: u8 = PRI_TIMESHARE_RANGE - PRI_INTERACT_RANGE;

pub const PRI_MIN_INTERACT: u8 = PRI_MIN_TIMESHARE;
pub const PRI_MAX_INTERACT: u8 = PRI_MIN_TIMESHARE + PRI_INTERACT_RANGE - 1;
pub const PRI_MIN_BATCH: u8 = PRI_MIN_TIMESHARE + PRI_INTERACT_RANGE;
pub const PRI_MAX_BATCH: u8 = PRI_MAX_TIMESHARE;

pub const SCHED_PRI_MIN: u8 = PRI_MIN_BATCH + SCHED_PRI_NHALF;
pub const SCHED_PRI_MAX: u8 = PRI_MAX_BATCH - SCHED_PRI_NHALF;
pub const SCHED_PRI_RANGE: u32 = (SCHED_PRI_MAX - SCHED_PRI_MIN) as u32 + 1;

pub const SCHED_INTERACT_MAX: u32 = 100;
pub const SCHED_INTERACT_HALF: u32 = SCHED_INTERACT_MAX / 2;
pub const SCHED_INTERACT_THRESH: u32 = 30;

/// Runtime/sleeptime accumulators carry this many fractional bits per tick
pub const SCHED_TICK_SHIFT: u32 = 10;
pub const TICK_INCR: u64 = 1 << SCHED_TICK_SHIFT;

/// The pct-cpu sampling window and its overflow bound, in ticks
pub const SCHED_TICK_TARG: u32 = HZ * 10;
pub const SCHED_TICK_MAX: u32 = SCHED_TICK_TARG + HZ;

/// Cap on `runtime + slptime` before the decay kicks in
pub const SCHED_SLP_RUN_MAX: u64 = (5 * HZ as u64) << SCHED_TICK_SHIFT;

pub const SCHED_SLICE: i32 = (HZ / 10) as i32;
pub const SCHED_SLICE_MIN_DIVISOR: u32 = 6;
pub const SCHED_SLICE_MIN: i32 = SCHED_SLICE / SCHED_SLICE_MIN_DIVISOR as i32;

/// A newly runnable thread at or below this priority always preempts
pub const PREEMPT_THRESH: u8 = PRI_MIN_KERN;

/// Affinity window unit, in ticks
pub const AFFINITY: u32 = 1;
pub const MAX_CACHE_LEVELS: u32 = 2;

/// Run-queues have 64 buckets of 4 priorities each
pub const RQ_NQS: usize = 64;
pub const RQ_PPQ: u8 = 4;

/// Whether a thread becoming runnable at `new_pri` should preempt the
/// thread currently running at `cur_pri`
///
/// `remote` is set when the decision is made for another CPU, where waking
/// an interactive thread over a batch one is worth the disturbance.
pub fn should_preempt(new_pri: u8, cur_pri: u8, remote: bool) -> bool {
    if new_pri >= cur_pri {
        return false;
    }

    if cur_pri >= PRI_MIN_IDLE {
        return true;
    }

    if PREEMPT_THRESH == 0 {
        return false;
    }

    if new_pri <= PREEMPT_THRESH {
        return true;
    }

    if remote && new_pri <= PRI_MAX_INTERACT && cur_pri > PRI_MAX_INTERACT {
        return true;
    }

    false
}

/// Interactivity score in `[0, SCHED_INTERACT_MAX]`
///
/// Threads that sleep more than they run score low (interactive), threads
/// that run more than they sleep score at or above the half-max. The
/// half-max short-circuit skips the division for threads that already run
/// more than they sleep; a thread with no history at all scores 0 so it
/// starts in the interactive band.
pub fn interact_score(runtime: u64, slptime: u64) -> u32 {
    if runtime == 0 && slptime == 0 {
        return 0;
    }

    if SCHED_INTERACT_THRESH <= SCHED_INTERACT_HALF && runtime >= slptime {
        return SCHED_INTERACT_HALF;
    }

    if runtime > slptime {
        let div = (runtime / u64::from(SCHED_INTERACT_HALF)).max(1);

        #[allow(clippy::cast_possible_truncation, reason = "slptime / div < SCHED_INTERACT_HALF here")]
        return SCHED_INTERACT_HALF + (SCHED_INTERACT_HALF - (slptime / div) as u32);
    }

    if slptime > runtime {
        let div = (slptime / u64::from(SCHED_INTERACT_HALF)).max(1);

        #[allow(clippy::cast_possible_truncation, reason = "runtime / div < SCHED_INTERACT_HALF here")]
        return (runtime / div) as u32;
    }

    // Equal and non-zero
    SCHED_INTERACT_HALF
}

/// Decay `runtime` and `slptime` once their sum exceeds the cap, so the
/// score tracks recent behaviour rather than the thread's whole life
pub fn interact_update(runtime: &mut u64, slptime: &mut u64) {
    let sum = *runtime + *slptime;

    if sum < SCHED_SLP_RUN_MAX {
        return;
    }

    if sum > 2 * SCHED_SLP_RUN_MAX {
        if *runtime > *slptime {
            *runtime = SCHED_SLP_RUN_MAX;
            *slptime = 1;
        } else {
            *slptime = SCHED_SLP_RUN_MAX;
            *runtime = 1;
        }
        return;
    }

    if sum > (SCHED_SLP_RUN_MAX / 5) * 6 {
        *runtime /= 2;
        *slptime /= 2;
        return;
    }

    *runtime = (*runtime / 5) * 4;
    *slptime = (*slptime / 5) * 4;
}

/// The pct-cpu tick window of one thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTicks {
    /// Charged ticks, shifted by [`SCHED_TICK_SHIFT`]
    pub ticks: u64,
    /// First tick of the window
    pub ftick: u32,
    /// Last tick the window was advanced at
    pub ltick: u32,
}

impl CpuTicks {
    pub const fn new() -> Self {
        Self {
            ticks: 0,
            ftick: 0,
            ltick: 0,
        }
    }

    /// Advance the window to tick `t`, charging the elapsed ticks when the
    /// thread was running
    pub fn update(&mut self, t: u32, running: bool) {
        if t.wrapping_sub(self.ltick) >= SCHED_TICK_TARG {
            self.ticks = 0;
            self.ftick = t.wrapping_sub(SCHED_TICK_TARG);
        } else if t.wrapping_sub(self.ftick) >= SCHED_TICK_MAX {
            // The window has overfilled, rescale the charge to the part of
            // the window that remains and shift the window start up
            let window = u64::from(self.ltick.wrapping_sub(self.ftick));
            let new_ftick = t.wrapping_sub(SCHED_TICK_TARG);

            self.ticks = (self.ticks / window) * u64::from(self.ltick.wrapping_sub(new_ftick));
            self.ftick = new_ftick;
        }

        if running {
            self.ticks += u64::from(t.wrapping_sub(self.ltick)) << SCHED_TICK_SHIFT;
        }

        self.ltick = t;
    }
}

impl Default for CpuTicks {
    fn default() -> Self {
        Self::new()
    }
}

/// Timeshare priority for an interactivity score below the threshold
pub fn interact_priority(score: u32) -> u8 {
    debug_assert!(score < SCHED_INTERACT_THRESH);

    let span = u32::from(PRI_MAX_INTERACT - PRI_MIN_INTERACT) + 1;

    #[allow(clippy::cast_possible_truncation, reason = "Result is below PRI_MAX_INTERACT")]
    let offset = (span * score / SCHED_INTERACT_THRESH) as u8;

    PRI_MIN_INTERACT + offset
}

/// Timeshare priority for a batch thread, spread by recent CPU usage
pub fn batch_priority(pctcpu: &CpuTicks) -> u8 {
    let window = pctcpu.ltick.wrapping_sub(pctcpu.ftick).max(HZ);
    let usage = (pctcpu.ticks >> SCHED_TICK_SHIFT) / u64::from(window);

    #[allow(clippy::cast_possible_truncation, reason = "Clamped to SCHED_PRI_RANGE")]
    let usage = usage.min(u64::from(SCHED_PRI_RANGE - 1)) as u8;

    SCHED_PRI_MIN + usage
}

/// Timeshare priority from the thread's interactivity state
pub fn timeshare_priority(runtime: u64, slptime: u64, pctcpu: &CpuTicks) -> u8 {
    let score = interact_score(runtime, slptime);

    if score < SCHED_INTERACT_THRESH {
        interact_priority(score)
    } else {
        batch_priority(pctcpu)
    }
}

/// Slice length for a queue with `sysload` runnable loads
pub fn slice_for_load(sysload: u32) -> i32 {
    let load = sysload.saturating_sub(1);

    if load >= SCHED_SLICE_MIN_DIVISOR {
        SCHED_SLICE_MIN
    } else if load <= 1 {
        SCHED_SLICE
    } else {
        SCHED_SLICE / load as i32
    }
}
