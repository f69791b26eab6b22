//! Trap delivery: routes a hardware vector to a registered handler with a
//! full register frame
//!
//! Every vector enters through a naked stub that pushes the remaining
//! registers on top of the hardware interrupt frame, forming a
//! [`TrapFrame`] in place on the stack. Handlers get `&mut` to that frame;
//! whatever is in it when the handler returns is what `iretq` resumes,
//! which is how the scheduler swaps threads without a separate context
//! switch primitive.

use core::arch::naked_asm;

use spinning_top::{RwSpinlock, Spinlock};
use x86_64::{structures::idt::InterruptDescriptorTable, VirtAddr};

use crate::{debug_println, debug_print::HEADING_PREFIX};

/// The register state of an interrupted thread, in stack order
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TrapFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub vector: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl TrapFrame {
    pub const fn zeroed() -> Self {
        Self {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rbp: 0,
            rdi: 0,
            rsi: 0,
            rdx: 0,
            rcx: 0,
            rbx: 0,
            rax: 0,
            vector: 0,
            error_code: 0,
            rip: 0,
            cs: 0,
            rflags: 0,
            rsp: 0,
            ss: 0,
        }
    }
}

pub type TrapHandler = fn(&mut TrapFrame);

static HANDLERS: RwSpinlock<[Option<TrapHandler>; 256]> = RwSpinlock::new([None; 256]);

/// Route `vector` to `handler`
pub fn set_handler(handler: TrapHandler, vector: u8) {
    HANDLERS.write()[vector as usize] = Some(handler);
}

extern "C" fn dispatch(frame: &mut TrapFrame) {
    let vector = frame.vector as usize;

    // Handler registration only happens at boot, readers never contend
    // with a writer at interrupt time
    let handler = HANDLERS.read()[vector];

    match handler {
        Some(handler) => handler(frame),
        None => unhandled(frame),
    }
}

fn unhandled(frame: &TrapFrame) {
    let vector = frame.vector as u8;

    if vector < 32 {
        panic!(
            "Unhandled CPU exception {} ({}) at {:#X}, error code {:#X}",
            vector,
            EXCEPTION_NAMES[vector as usize],
            frame.rip,
            frame.error_code
        );
    }

    // A stray device vector is acknowledged and dropped
    debug_println!(HEADING_PREFIX; "Stray interrupt on vector {vector}");
    crate::intr::submit_eoi();
}

static EXCEPTION_NAMES: [&str; 32] = [
    "divide error",
    "debug",
    "non-maskable interrupt",
    "breakpoint",
    "overflow",
    "bound range exceeded",
    "invalid opcode",
    "device not available",
    "double fault",
    "coprocessor segment overrun",
    "invalid TSS",
    "segment not present",
    "stack-segment fault",
    "general protection fault",
    "page fault",
    "reserved",
    "x87 floating point",
    "alignment check",
    "machine check",
    "SIMD floating point",
    "virtualization",
    "control protection",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "hypervisor injection",
    "VMM communication",
    "security exception",
    "reserved",
];

/// Entry stub for vectors where the CPU does not push an error code
#[unsafe(naked)]
unsafe extern "C" fn vector_stub<const VECTOR: u8>() {
    naked_asm!(
        "push 0",
        "push {vector}",
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "cld",
        "mov rdi, rsp",
        "call {dispatch}",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "add rsp, 16",
        "iretq",
        vector = const VECTOR,
        dispatch = sym dispatch,
    )
}

/// Entry stub for exceptions where the CPU pushes an error code itself
#[unsafe(naked)]
unsafe extern "C" fn vector_stub_err<const VECTOR: u8>() {
    naked_asm!(
        "push {vector}",
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "cld",
        "mov rdi, rsp",
        "call {dispatch}",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "add rsp, 16",
        "iretq",
        vector = const VECTOR,
        dispatch = sym dispatch,
    )
}

static IDT: Spinlock<InterruptDescriptorTable> = Spinlock::new(InterruptDescriptorTable::new());

pub fn init() {
    debug_println!(HEADING_PREFIX; "Setting up IDT");

    let mut idt = IDT.lock();

    unsafe {
        // CPU exceptions; the ones with hardware error codes use the
        // matching stub
        idt.divide_error.set_handler_addr(stub_addr(vector_stub::<0>));
        idt.debug.set_handler_addr(stub_addr(vector_stub::<1>));
        idt.non_maskable_interrupt.set_handler_addr(stub_addr(vector_stub::<2>));
        idt.breakpoint.set_handler_addr(stub_addr(vector_stub::<3>));
        idt.overflow.set_handler_addr(stub_addr(vector_stub::<4>));
        idt.bound_range_exceeded.set_handler_addr(stub_addr(vector_stub::<5>));
        idt.invalid_opcode.set_handler_addr(stub_addr(vector_stub::<6>));
        idt.device_not_available.set_handler_addr(stub_addr(vector_stub::<7>));
        idt.double_fault.set_handler_addr(stub_addr(vector_stub_err::<8>));
        idt.invalid_tss.set_handler_addr(stub_addr(vector_stub_err::<10>));
        idt.segment_not_present.set_handler_addr(stub_addr(vector_stub_err::<11>));
        idt.stack_segment_fault.set_handler_addr(stub_addr(vector_stub_err::<12>));
        idt.general_protection_fault.set_handler_addr(stub_addr(vector_stub_err::<13>));
        idt.page_fault.set_handler_addr(stub_addr(vector_stub_err::<14>));
        idt.x87_floating_point.set_handler_addr(stub_addr(vector_stub::<16>));
        idt.alignment_check.set_handler_addr(stub_addr(vector_stub_err::<17>));
        idt.machine_check.set_handler_addr(stub_addr(vector_stub::<18>));
        idt.simd_floating_point.set_handler_addr(stub_addr(vector_stub::<19>));
        idt.virtualization.set_handler_addr(stub_addr(vector_stub::<20>));

        // Device vectors 32..=255
        for (i, &stub) in DEVICE_STUBS.iter().enumerate() {
            idt[(i + 32) as u8].set_handler_addr(stub_addr(stub));
        }

        idt.load_unsafe();
    }
}

/// Load the shared IDT on a freshly started core
pub fn load_ap() {
    let idt = IDT.lock();

    unsafe {
        idt.load_unsafe();
    }
}

fn stub_addr(stub: unsafe extern "C" fn()) -> VirtAddr {
    VirtAddr::new(stub as usize as u64)
}

macro_rules! device_stub_block {
    ($($vector:literal)*) => {
        [$(vector_stub::<$vector> as unsafe extern "C" fn(),)*]
    };
}

static DEVICE_STUBS: [unsafe extern "C" fn(); 224] = device_stub_block![
     32  33  34  35  36  37  38  39  40  41  42  43  44  45  46  47
     48  49  50  51  52  53  54  55  56  57  58  59  60  61  62  63
     64  65  66  67  68  69  70  71  72  73  74  75  76  77  78  79
     80  81  82  83  84  85  86  87  88  89  90  91  92  93  94  95
     96  97  98  99 100 101 102 103 104 105 106 107 108 109 110 111
    112 113 114 115 116 117 118 119 120 121 122 123 124 125 126 127
    128 129 130 131 132 133 134 135 136 137 138 139 140 141 142 143
    144 145 146 147 148 149 150 151 152 153 154 155 156 157 158 159
    160 161 162 163 164 165 166 167 168 169 170 171 172 173 174 175
    176 177 178 179 180 181 182 183 184 185 186 187 188 189 190 191
    192 193 194 195 196 197 198 199 200 201 202 203 204 205 206 207
    208 209 210 211 212 213 214 215 216 217 218 219 220 221 222 223
    224 225 226 227 228 229 230 231 232 233 234 235 236 237 238 239
    240 241 242 243 244 245 246 247 248 249 250 251 252 253 254 255
];
