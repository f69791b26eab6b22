//! Scheduler tick timing
//!
//! The local controller's one-shot timer drives the scheduler tick, but
//! its frequency is model specific. At boot it is calibrated against the
//! HPET; the resulting count per tick is what every re-arm uses.

use core::sync::atomic::{AtomicU32, Ordering};

use kernel_algo::sched::prio::HZ;

use crate::{
    acpi::AcpiInfo,
    intr, mem,
    debug_print::{HEADING_PREFIX, SUBHEADING_PREFIX},
    debug_println,
    debug_print
};

// HPET register offsets in bytes
const HPET_GEN_CAPAB: usize = 0x0;
const HPET_GEN_CONFIG: usize = 0x10;
const HPET_MAIN_COUNTER_VALUE: usize = 0xF0;

const APIC_TIMER_NUM_CALIBRATIONS: u32 = 5;

static TICKS_PER_QUANTUM: AtomicU32 = AtomicU32::new(0);

struct Hpet {
    base_addr: *mut u8
}

impl Hpet {
    pub fn new(acpi_info: &AcpiInfo) -> Self {
        Self {
            base_addr: mem::to_higher_half(acpi_info.hpet_info.base_address) as *mut u8,
        }
    }

    fn read_reg(&self, offset: usize) -> u64 {
        unsafe {
            self.base_addr
                .add(offset)
                .cast::<u64>()
                .read_volatile()
        }
    }

    fn write_reg(&self, offset: usize, data: u64) {
        unsafe {
            self.base_addr
                .add(offset)
                .cast::<u64>()
                .write_volatile(data)
        }
    }

    pub fn disable(&self) {
        // Also drops legacy replacement interrupt mapping, which we do not
        // want anyway
        self.write_reg(HPET_GEN_CONFIG, 0);
    }

    pub fn enable(&self) {
        self.write_reg(HPET_GEN_CONFIG, 1);
    }

    /// Timer period in femtoseconds
    pub fn period_fs(&self) -> u64 {
        self.read_reg(HPET_GEN_CAPAB) >> 32
    }

    pub fn set_counter_value(&self, val: u64) {
        self.write_reg(HPET_MAIN_COUNTER_VALUE, val);
    }

    pub fn counter_value(&self) -> u64 {
        self.read_reg(HPET_MAIN_COUNTER_VALUE)
    }
}

pub fn init(acpi_info: &AcpiInfo) {
    // Find the local controller timer frequency using the HPET as the
    // reference, then derive the one-shot count for one scheduler tick

    debug_println!(HEADING_PREFIX; "Calibrating the tick timer against the HPET");
    let hpet = Hpet::new(acpi_info);

    hpet.disable();

    let hpet_period = hpet.period_fs();
    let hpet_freq = 10_u64.pow(15) / hpet_period; // 1 fs = 10^-15 s

    debug_print!(SUBHEADING_PREFIX; "HPET frequency: ");
    print_mhz(hpet_freq);

    // Number of HPET ticks in a 10 millisecond calibration run
    let num_hpet_ticks = 10_u64.pow(13) / hpet_period; // 10^13 fs = 10 ms

    // Perform calibration runs and average the results
    let mut timer_ticks = 0;

    // Warmup run; a warmup first gives more consistent results, at least
    // in QEMU
    calibrate_timer(&hpet, num_hpet_ticks);

    for _ in 0..APIC_TIMER_NUM_CALIBRATIONS {
        timer_ticks += calibrate_timer(&hpet, num_hpet_ticks);
    }

    timer_ticks /= APIC_TIMER_NUM_CALIBRATIONS;

    // timer_ticks covered 10 ms, so freq = timer_ticks * 100 per second
    let timer_freq = u64::from(timer_ticks) * 100;

    debug_print!(SUBHEADING_PREFIX; "Tick timer frequency: ");
    print_mhz(timer_freq);

    // One scheduler tick is 1/HZ seconds
    let per_quantum = (timer_freq / u64::from(HZ)).max(1) as u32;
    TICKS_PER_QUANTUM.store(per_quantum, Ordering::Release);

    debug_println!(SUBHEADING_PREFIX; "One-shot count per tick: {per_quantum}");
}

fn calibrate_timer(hpet: &Hpet, num_hpet_ticks: u64) -> u32 {
    hpet.set_counter_value(0);

    // Start both timers; interrupts are still off, the one-shot expiring
    // early is harmless
    intr::arm_oneshot(intr::TIMER_VECTOR, u32::MAX);
    hpet.enable();

    // Poll the HPET counter until the window has passed
    while hpet.counter_value() < num_hpet_ticks {}

    let timer_ticks = u32::MAX - intr::timer_current_count();
    intr::timer_disable();
    hpet.disable();

    timer_ticks
}

/// Arm the one-shot for the next scheduler tick
///
/// Re-armed on every reschedule; a missed arm would stall the CPU.
pub fn arm_tick() {
    intr::arm_oneshot(intr::TIMER_VECTOR, TICKS_PER_QUANTUM.load(Ordering::Acquire));
}

/// Pull the next tick in to now, for preemptions owed at a boundary where
/// no trap frame is at hand
pub fn kick() {
    intr::arm_oneshot(intr::TIMER_VECTOR, 1);
}

fn print_mhz(freq: u64) {
    let freq_mhz = freq / 1_000_000;
    let freq_mhz_decimal = (freq - freq_mhz * 1_000_000) / 10_000; // 2 decimal places
    debug_println!("{freq_mhz}.{freq_mhz_decimal} MHz");
}
