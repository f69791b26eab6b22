use core::ptr::NonNull;

use acpi::{madt::Madt, hpet::HpetInfo, sdt::SdtHeader, AcpiHandler, AcpiTables, PhysicalMapping};

use crate::{mem, debug_println, ACPI_RSDP_REQUEST, debug_print::{HEADING_PREFIX, SUBHEADING_PREFIX}};

#[derive(Clone)]
struct Handler {
    hhdm_offset: usize
}

impl AcpiHandler for Handler {
    unsafe fn map_physical_region<T>(&self, physical_address: usize, size: usize) -> PhysicalMapping<Self, T> {
        // Add HHDM offset to physical address to get the mapped address
        PhysicalMapping::new(
            physical_address,
            NonNull::new((physical_address + self.hhdm_offset) as *mut T).unwrap(),
            size,
            size,
            self.clone()
        )
    }

    fn unmap_physical_region<T>(_region: &PhysicalMapping<Self, T>) {

    }
}

pub struct AcpiInfo {
    /// The MADT body past the SDT header: the 8 byte local controller
    /// header followed by the interrupt controller records
    pub madt_body: &'static [u8],
    pub hpet_info: HpetInfo,
}

pub fn init(hhdm_offset: usize) -> AcpiInfo {
    debug_println!(HEADING_PREFIX; "Loading ACPI tables:");

    // Load RSDP
    debug_println!(SUBHEADING_PREFIX; "Loading RSDP");

    // `AcpiTables` expects a physical RSDP address, but bootloader gives us an HHDM address
    // Subtract the HHDM offset from the given RSDP address to get the physical address
    let rsdp_response = ACPI_RSDP_REQUEST
        .get_response()
        .expect("Bootloader did not give us an ACPI RSDP response");

    let rsdp_addr = rsdp_response.address() as usize - hhdm_offset;

    let handler = Handler { hhdm_offset };
    let acpi_tables = unsafe { AcpiTables::from_rsdp(handler, rsdp_addr).expect("Couldn't load RSDP") };

    // Find the MADT and keep its raw bytes, the interrupt code walks the
    // records itself
    debug_println!(SUBHEADING_PREFIX; "Loading MADT");

    let madt = acpi_tables
        .find_table::<Madt>()
        .expect("Couldn't find MADT");

    let madt_len = madt.header.length as usize;
    let madt_phys = madt.physical_start();

    assert!(madt_len > core::mem::size_of::<SdtHeader>(), "MADT shorter than its header");

    // The table is reachable through the higher-half mirror for the
    // kernel's whole lifetime, the mapping handler above never unmaps
    let madt_body = unsafe {
        core::slice::from_raw_parts(
            (mem::to_higher_half(madt_phys) + core::mem::size_of::<SdtHeader>()) as *const u8,
            madt_len - core::mem::size_of::<SdtHeader>(),
        )
    };

    debug_println!(SUBHEADING_PREFIX; "MADT record bytes: {}", madt_body.len());

    // Find HPET table
    debug_println!(SUBHEADING_PREFIX; "Loading HPET table");
    let hpet_info = HpetInfo::new(&acpi_tables).expect("Couldn't find HPET table");

    debug_println!(SUBHEADING_PREFIX; "HPET base address: {:#X}", hpet_info.base_address);

    AcpiInfo {
        madt_body,
        hpet_info,
    }
}
