//! Interrupt routing: the IRQ slot table, the per-CPU local controller
//! and the I/O controllers with their pins
//!
//! Control flow for a device interrupt: hardware pin, I/O controller
//! redirection entry, slot (the kernel vector), registered handler, pin
//! EOI, local controller EOI. The scheduler timer bypasses the pin layer
//! entirely, its vector is reserved statically.

pub mod io_apic;
pub mod local_apic;

use core::fmt::Write;

use arrayvec::{ArrayString, ArrayVec};
use spinning_top::{RwSpinlock, Spinlock};
use x86_64::instructions::port::Port;

use kernel_algo::irq::{
    madt::{self, Madt, Record},
    redir::{self, TriggerMode},
    slots::{PinId, SlotTable, NUM_EXCEPTION_SLOTS},
    Gsi,
};

use io_apic::IoApic;
use local_apic::LocalApic;

use crate::{
    acpi::AcpiInfo,
    cpu, sched, trap,
    debug_println,
    debug_print::{HEADING_PREFIX, SUBHEADING_PREFIX},
};

/// Vector of the scheduler tick, reserved before any pin can bind it
pub const TIMER_VECTOR: u8 = 0x20;

const MAX_IO_APICS: usize = 8;
const MAX_PINS: usize = 224;

// Legacy PIC ports
const LEGACY_PIC1_BASE: u16 = 0x20;
const LEGACY_PIC1_DATA_PORT: u16 = LEGACY_PIC1_BASE + 1;
const LEGACY_PIC2_BASE: u16 = 0xA0;
const LEGACY_PIC2_DATA_PORT: u16 = LEGACY_PIC2_BASE + 1;

static SLOTS: Spinlock<SlotTable> = Spinlock::new(SlotTable::new());

// Data used by ISRs
struct IsrData {
    local_apic: LocalApic
}

static ISR_DATA: RwSpinlock<IsrData> = RwSpinlock::new(IsrData {
    local_apic: LocalApic::dummy(),
});

static IO_APICS: Spinlock<ArrayVec<IoApic, MAX_IO_APICS>> = Spinlock::new(ArrayVec::new_const());
static PINS: Spinlock<ArrayVec<IrqPin, MAX_PINS>> = Spinlock::new(ArrayVec::new_const());

/// A hardware interrupt input on one of the I/O controllers
pub struct IrqPin {
    pub name: ArrayString<16>,
    /// Index of the owning controller
    pub ioapic: u8,
    /// Pin index within that controller
    pub index: u8,
    pub gsi: Gsi,
    /// The slot serving this pin once configured
    pub slot: Option<u8>,
}

/// Bring up the whole interrupt substrate from the firmware table
///
/// Returns the number of enabled CPUs found while walking it.
pub fn init(acpi_info: &AcpiInfo) -> usize {
    debug_println!(HEADING_PREFIX; "Setting up interrupts:");

    {
        let mut slots = SLOTS.lock();
        slots.reserve_low(NUM_EXCEPTION_SLOTS);
        slots.reserve(TIMER_VECTOR);
    }

    let table = Madt::parse(acpi_info.madt_body)
        .expect("Interrupt controller table is malformed");

    // Disable legacy PIC if wired up
    if table.supports_8259() {
        debug_println!(SUBHEADING_PREFIX; "Disabling legacy PICs");

        let mut pic1 = Port::<u8>::new(LEGACY_PIC1_DATA_PORT);
        let mut pic2 = Port::<u8>::new(LEGACY_PIC2_DATA_PORT);

        // Mask all interrupts in both PICs
        unsafe {
            pic1.write(0xFF);
            pic2.write(0xFF);
        }
    }

    let mut ncpus = 0;

    for record in table.records() {
        match record {
            Record::LocalApic(rec) => {
                if rec.flags & madt::LOCAL_APIC_ENABLED != 0 {
                    cpu::register_core(u32::from(rec.apic_id));
                    ncpus += 1;
                }
            }
            Record::IoApic(rec) => add_io_apic(&rec),
            Record::Other { .. } => {}
        }
    }

    assert!(ncpus > 0, "Firmware table declares no enabled CPUs");

    debug_println!(SUBHEADING_PREFIX; "{ncpus} CPU(s) declared by the firmware table");

    // Local controller for the boot CPU; the base comes from the MSR,
    // the firmware table's copy is informational
    debug_println!(SUBHEADING_PREFIX; "Local controller base (from firmware table): {:#X}", table.local_ctrl_addr);

    let local_apic = LocalApic::new();
    debug_println!(SUBHEADING_PREFIX; "Local controller id: {:#X}", local_apic.id());

    local_apic.enable();

    *ISR_DATA.write() = IsrData { local_apic };

    // The scheduler tick and the spurious vector
    trap::set_handler(sched::reschedule, TIMER_VECTOR);
    trap::set_handler(spurious_handler, local_apic::SPURIOUS_VECTOR);

    ncpus
}

/// Enable the local controller of a freshly started core
pub fn enable_local() {
    // The MSR and the spurious register are per-core state even though
    // the MMIO window is shared
    LocalApic::new().enable();
}

fn add_io_apic(rec: &madt::IoApicRecord) {
    let mut io_apics = IO_APICS.lock();
    let mut pins = PINS.lock();

    #[allow(clippy::cast_possible_truncation, reason = "MAX_PINS fits in u16")]
    let pin_start = pins.len() as u16;

    let apic = IoApic::new(rec.id, rec.mmio_base, rec.gsi_base, pin_start);

    // GSI ranges of distinct controllers must not overlap
    for existing in io_apics.iter() {
        assert!(
            !existing.range().overlaps(&apic.range()),
            "I/O controller GSI ranges overlap"
        );
    }

    debug_println!(
        SUBHEADING_PREFIX;
        "I/O controller {} at {:#X}: {} pins, GSI base {}",
        rec.id,
        rec.mmio_base,
        apic.pin_count,
        rec.gsi_base
    );

    // Materialize this controller's pins and append them to its range;
    // everything starts masked until a driver configures it
    let apic_index = io_apics.len() as u8;

    for index in 0..apic.pin_count {
        apic.set_mask(index, true);

        let mut name = ArrayString::new();
        let _ = write!(name, "ioapic{}-{}", rec.id, index);

        pins.try_push(IrqPin {
            name,
            ioapic: apic_index,
            index,
            gsi: apic.gsi_base + u32::from(index),
            slot: None,
        })
        .expect("Too many interrupt pins");
    }

    io_apics.try_push(apic).expect("Too many I/O controllers");
}

/// Resolve a global system interrupt to its pin
pub fn pin_lookup(gsi: Gsi) -> Option<PinId> {
    let io_apics = IO_APICS.lock();

    io_apics.iter().find_map(|apic| {
        if apic.range().contains(gsi) {
            let offset = (gsi - apic.gsi_base) as u16;
            Some(PinId(apic.pin_start + offset))
        } else {
            None
        }
    })
}

/// Mask or unmask a pin
pub fn pin_mask(pin: PinId, masked: bool) {
    let pins = PINS.lock();
    let pin = pins.get(pin.0 as usize).expect("Unknown interrupt pin");

    let io_apics = IO_APICS.lock();
    let apic = io_apics.get(pin.ioapic as usize).expect("Pin without a controller");

    apic.set_mask(pin.index, masked);
}

/// Configure a pin's trigger mode and polarity, binding it to a slot
///
/// The slot lock is held while the vector is chosen. The pin stays masked
/// until the caller unmasks it, configuration always precedes unmasking.
pub fn pin_configure(pin_id: PinId, level: bool, high_polarity: bool) -> TriggerMode {
    let mut slots = SLOTS.lock();
    let vector = slots.bind(pin_id).expect("No free interrupt vectors");

    let mut pins = PINS.lock();
    let pin = pins.get_mut(pin_id.0 as usize).expect("Unknown interrupt pin");
    pin.slot = Some(vector);

    let io_apics = IO_APICS.lock();
    let apic = io_apics.get(pin.ioapic as usize).expect("Pin without a controller");

    let (word, mode) = redir::entry(level, high_polarity, vector);
    apic.write_entry(pin.index, word | redir::ENTRY_MASKED);

    mode
}

/// Acknowledge a pin's interrupt; delegates to the local controller
pub fn pin_eoi(_pin: PinId) {
    submit_eoi();
}

/// Route a configured pin's slot to `handler`
pub fn pin_set_handler(pin_id: PinId, handler: trap::TrapHandler) {
    let pins = PINS.lock();
    let pin = pins.get(pin_id.0 as usize).expect("Unknown interrupt pin");
    let slot = pin.slot.expect("Pin has no slot, configure it first");

    trap::set_handler(handler, slot);
}

/// Acknowledge the current interrupt at the local controller
pub fn submit_eoi() {
    ISR_DATA.read().local_apic.submit_eoi();
}

/// Arm the local controller's one-shot timer
pub fn arm_oneshot(vector: u8, count: u32) {
    ISR_DATA.read().local_apic.arm_oneshot(vector, count);
}

pub fn timer_disable() {
    ISR_DATA.read().local_apic.timer_disable();
}

pub fn timer_current_count() -> u32 {
    ISR_DATA.read().local_apic.timer_current_count()
}

// Spurious interrupts are dropped without an EOI
fn spurious_handler(_: &mut trap::TrapFrame) {}
