use spinning_top::Spinlock;

use x86_64::{
    registers::segmentation::{Segment, CS, DS, ES, FS, GS, SS},
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment
    }
};

use crate::{
    debug_print::HEADING_PREFIX,
    debug_println
};

static GDT: Spinlock<GlobalDescriptorTable<8>> = Spinlock::new(GlobalDescriptorTable::empty());
static TSS: TaskStateSegment = TaskStateSegment::new();

static SELECTORS: Spinlock<Option<GdtInfo>> = Spinlock::new(None);

#[derive(Clone, Copy)]
pub struct GdtInfo {
    pub kernel_code_seg: SegmentSelector,
    pub kernel_data_seg: SegmentSelector,
}

pub fn init() {
    debug_println!(HEADING_PREFIX; "Loading GDT");

    // Fill GDT entries
    let mut gdt = GDT.lock();

    let kernel_code_seg = gdt.append(Descriptor::kernel_code_segment());
    let kernel_data_seg = gdt.append(Descriptor::kernel_data_segment());

    gdt.append(Descriptor::tss_segment(&TSS));

    unsafe {
        gdt.load_unsafe();

        CS::set_reg(kernel_code_seg);
        DS::set_reg(kernel_data_seg);
        ES::set_reg(kernel_data_seg);
        FS::set_reg(kernel_data_seg);
        GS::set_reg(kernel_data_seg);
        SS::set_reg(kernel_data_seg);
    }

    *SELECTORS.lock() = Some(GdtInfo {
        kernel_code_seg,
        kernel_data_seg,
    });
}

pub fn info() -> GdtInfo {
    SELECTORS.lock().expect("GDT not initialized")
}

/// Reload the shared GDT and kernel segments on a freshly started core
pub fn load_ap() {
    let info = info();
    let gdt = GDT.lock();

    unsafe {
        gdt.load_unsafe();

        CS::set_reg(info.kernel_code_seg);
        DS::set_reg(info.kernel_data_seg);
        ES::set_reg(info.kernel_data_seg);
        FS::set_reg(info.kernel_data_seg);
        GS::set_reg(info.kernel_data_seg);
        SS::set_reg(info.kernel_data_seg);
    }
}
