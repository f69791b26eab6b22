#![no_std]
#![no_main]

mod acpi;
mod cpu;
mod debug_print;
mod gdt;
mod intr;
mod mem;
mod sched;
mod timer;
mod trap;

use core::panic::PanicInfo;

use kernel_algo::sched::{prio, thread::SchedClass};
use limine::{
    BaseRevision,
    request::{HhdmRequest, MemoryMapRequest, RsdpRequest, SmpRequest, StackSizeRequest},
};

use crate::debug_print::HEADING_PREFIX;

const KERNEL_STACK_SIZE: u64 = 128 * 1024; // 128 KiB

// Limine bootloader requests
#[used] pub static BASE_REVISION: BaseRevision = BaseRevision::new();
#[used] pub static STACK_REQUEST: StackSizeRequest = StackSizeRequest::new().with_size(KERNEL_STACK_SIZE);
#[used] pub static MEM_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();
#[used] pub static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();
#[used] pub static ACPI_RSDP_REQUEST: RsdpRequest = RsdpRequest::new();
#[used] pub static SMP_REQUEST: SmpRequest = SmpRequest::new();

// Kernel entry point
#[no_mangle]
unsafe extern "C" fn _start() -> ! {
    assert!(BASE_REVISION.is_supported());

    debug_print::init();
    debug_println!(HEADING_PREFIX; "Kernel started");

    let hhdm_offset = HHDM_REQUEST
        .get_response()
        .expect("No HHDM offset given by the bootloader")
        .offset() as usize;

    mem::init(hhdm_offset);
    gdt::init();
    cpu::init();
    trap::init();

    let acpi_info = acpi::init(hhdm_offset);
    let ncpus = intr::init(&acpi_info);

    timer::init(&acpi_info);
    sched::init(ncpus);

    sched::kthread_spawn("main", SchedClass::Timeshare, prio::PRI_MIN_TIMESHARE, main_thread);

    start_secondary_cpus();

    // The boot context becomes CPU 0's idle thread
    sched::start()
}

fn start_secondary_cpus() {
    let Some(response) = SMP_REQUEST.get_response() else {
        return;
    };

    let bsp_lapic_id = response.bsp_lapic_id();

    for smp_cpu in response.cpus() {
        if smp_cpu.lapic_id == bsp_lapic_id {
            continue;
        }

        smp_cpu.goto_address.write(ap_start);
    }
}

unsafe extern "C" fn ap_start(_smp_cpu: &limine::smp::Cpu) -> ! {
    gdt::load_ap();
    trap::load_ap();
    intr::enable_local();

    sched::start()
}

fn main_thread() -> ! {
    debug_println!(HEADING_PREFIX; "Scheduler online, main thread running");

    loop {
        x86_64::instructions::hlt();
    }
}

#[panic_handler]
fn rust_panic(info: &PanicInfo) -> ! {
    debug_println!("\n**** KERNEL PANIC ****\n");

    debug_print!("Kernel panic occured at: ");

    match info.location() {
        Some(location) => debug_println!("{location}"),
        None => debug_println!("(no location available)")
    }

    debug_println!("\nMessage: {}", info.message());

    halt();
}

fn halt() -> ! {
    x86_64::instructions::interrupts::disable();

    loop {
        x86_64::instructions::hlt();
    }
}
