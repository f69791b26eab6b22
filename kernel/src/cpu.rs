//! CPU layer: feature gate, MSR access, interrupt flag control and the
//! mapping from LAPIC ids to the dense core indices the scheduler uses

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use raw_cpuid::CpuId;
use x86_64::instructions::interrupts;
use x86_64::registers::model_specific::Msr;

use crate::{debug_print, debug_println, debug_print::{HEADING_PREFIX, SUBHEADING_PREFIX}};

pub const MAX_CPUS: usize = kernel_algo::sched::MAX_CPUS;

const NO_LAPIC_ID: u32 = u32::MAX;

const LAPIC_ID_INIT: AtomicU32 = AtomicU32::new(NO_LAPIC_ID);
static LAPIC_IDS: [AtomicU32; MAX_CPUS] = [LAPIC_ID_INIT; MAX_CPUS];
static CORE_COUNT: AtomicUsize = AtomicUsize::new(0);

pub fn rdmsr(id: u32) -> u64 {
    unsafe { Msr::new(id).read() }
}

pub fn wrmsr(id: u32, value: u64) {
    unsafe { Msr::new(id).write(value) }
}

pub fn intr_enabled() -> bool {
    interrupts::are_enabled()
}

pub fn set_intr_mode(enabled: bool) {
    if enabled {
        interrupts::enable();
    } else {
        interrupts::disable();
    }
}

/// Checks for required CPU features and registers the boot core
pub fn init() {
    debug_println!(HEADING_PREFIX; "Checking CPU features:");

    let cpuid = CpuId::new();

    // Print vendor
    debug_print!(SUBHEADING_PREFIX; "CPU Vendor: ");

    let vendor_info = cpuid.get_vendor_info();

    match vendor_info {
        Some(info) => debug_println!("{}", info.as_str()),
        None => debug_println!("(no vendor info available)"),
    }

    // Get feature support
    let feature_info = cpuid.get_feature_info().expect("Couldn't get CPUID feature info");

    let power_info = cpuid
        .get_thermal_power_info()
        .expect("Couldn't get CPUID thermal and power info");

    assert!(feature_info.has_msr(), "CPU does not support RDMSR/WRMSR");
    assert!(feature_info.has_apic(), "CPU does not support APIC");
    assert!(feature_info.has_tsc(), "CPU does not support TSC");

    // The one-shot timer must keep counting across idle states
    assert!(power_info.has_arat(), "CPU does not support Always-Running-APIC-Timer (ARAT)");

    debug_println!(SUBHEADING_PREFIX; "All required features supported");

    let boot_core = register_core(local_id());
    assert_eq!(boot_core, 0, "Boot core must be core 0");
}

/// The running core's LAPIC id
pub fn local_id() -> u32 {
    let feature_info = CpuId::new()
        .get_feature_info()
        .expect("Couldn't get CPUID feature info");

    u32::from(feature_info.initial_local_apic_id())
}

/// Assign the next dense core index to a LAPIC id
///
/// Re-registering an id returns its existing index.
pub fn register_core(lapic_id: u32) -> u8 {
    for (index, slot) in LAPIC_IDS.iter().enumerate() {
        let registered = slot.load(Ordering::Acquire);

        if registered == lapic_id {
            return index as u8;
        }

        if registered == NO_LAPIC_ID
            && slot
                .compare_exchange(NO_LAPIC_ID, lapic_id, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            CORE_COUNT.fetch_add(1, Ordering::AcqRel);
            return index as u8;
        }
    }

    panic!("More cores than MAX_CPUS");
}

pub fn core_count() -> usize {
    CORE_COUNT.load(Ordering::Acquire)
}

/// Dense index of the running core
pub fn core_id() -> u8 {
    let lapic_id = local_id();

    for (index, slot) in LAPIC_IDS.iter().enumerate() {
        if slot.load(Ordering::Acquire) == lapic_id {
            return index as u8;
        }
    }

    panic!("Running on an unregistered core (LAPIC id {lapic_id})");
}
