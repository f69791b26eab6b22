//! The narrow memory interface the interrupt and scheduler code relies on:
//! higher-half translation of physical addresses and boot-time page
//! allocation. Device MMIO is reached through the bootloader's higher-half
//! mirror, which maps device ranges uncached.

use core::sync::atomic::{AtomicUsize, Ordering};

use limine::memory_map::EntryType;
use spinning_top::Spinlock;

use crate::{debug_println, debug_print::{HEADING_PREFIX, SUBHEADING_PREFIX}, MEM_MAP_REQUEST};

pub const PAGE_SIZE: usize = 4096;

/// A physical address
pub type PAddr = usize;

/// A virtual address
pub type VAddr = usize;

static HHDM_OFFSET: AtomicUsize = AtomicUsize::new(0);

struct FrameAlloc {
    /// Watermark inside the largest usable region
    next: PAddr,
    end: PAddr,
}

static FRAME_ALLOC: Spinlock<FrameAlloc> = Spinlock::new(FrameAlloc { next: 0, end: 0 });

pub fn init(hhdm_offset: usize) {
    debug_println!(HEADING_PREFIX; "Setting up boot memory:");

    HHDM_OFFSET.store(hhdm_offset, Ordering::Release);
    debug_println!(SUBHEADING_PREFIX; "HHDM offset: {hhdm_offset:#X}");

    let mem_map = MEM_MAP_REQUEST
        .get_response()
        .expect("No memory map given by the bootloader");

    // Boot allocations come from the largest usable region
    let largest = mem_map
        .entries()
        .iter()
        .filter(|entry| entry.entry_type == EntryType::USABLE)
        .max_by_key(|entry| entry.length)
        .expect("No usable memory region in the memory map");

    debug_println!(
        SUBHEADING_PREFIX;
        "Boot allocations from {:#X}, {} KiB usable",
        largest.base,
        largest.length / 1024
    );

    let mut alloc = FRAME_ALLOC.lock();
    alloc.next = largest.base as PAddr;
    alloc.end = (largest.base + largest.length) as PAddr;
}

pub fn to_higher_half(phys: PAddr) -> VAddr {
    phys + HHDM_OFFSET.load(Ordering::Acquire)
}

pub fn from_higher_half(virt: VAddr) -> PAddr {
    virt - HHDM_OFFSET.load(Ordering::Acquire)
}

/// Allocate `n` contiguous zeroed pages
///
/// Only used while bringing the kernel up; nothing in the steady state
/// allocates.
pub fn alloc_pages(n: usize) -> Option<PAddr> {
    let mut alloc = FRAME_ALLOC.lock();

    let base = alloc.next;
    let len = n.checked_mul(PAGE_SIZE)?;

    if base + len > alloc.end {
        return None;
    }

    alloc.next = base + len;

    unsafe {
        core::ptr::write_bytes(to_higher_half(base) as *mut u8, 0, len);
    }

    Some(base)
}
