//! Exception plumbing.
//!
//! Every architectural vector funnels through a per-vector stub that
//! materializes the interrupted register file as an [`ExceptionFrame`]
//! and calls [`do_exception`]. The handler first consults the extables
//! (fault fixups registered by `rdmsr_safe` and friends), then prints the
//! register file, a decoded error code, and a symbolic backtrace before
//! panicking the CPU.

use core::fmt;

/// Software vector used by the usermode round trip to come home.
pub const RET2KERN_VECTOR: u8 = 0x30;
/// Legacy software syscall vector.
pub const SYSCALL_VECTOR: u8 = 0x80;

pub const IDT_ENTRIES: usize = 256;

/// The saved register file, in stub push order. The layout is part of
/// the assembly contract and must not be reordered.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct ExceptionFrame {
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
	// Hardware frame.
	pub rip: u64,
	pub cs: u64,
	pub rflags: u64,
	pub rsp: u64,
	pub ss: u64,
}

impl fmt::Display for ExceptionFrame {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		writeln!(
			f,
			"RIP: {:#018x} CS: {:#06x} RFLAGS: {:#018x}",
			self.rip, self.cs, self.rflags
		)?;
		writeln!(
			f,
			"RSP: {:#018x} SS: {:#06x} ERR: {:#x}",
			self.rsp, self.ss, self.error_code
		)?;
		writeln!(
			f,
			"RAX: {:#018x} RBX: {:#018x} RCX: {:#018x}",
			self.rax, self.rbx, self.rcx
		)?;
		writeln!(
			f,
			"RDX: {:#018x} RSI: {:#018x} RDI: {:#018x}",
			self.rdx, self.rsi, self.rdi
		)?;
		writeln!(
			f,
			"RBP: {:#018x} R8:  {:#018x} R9:  {:#018x}",
			self.rbp, self.r8, self.r9
		)?;
		writeln!(
			f,
			"R10: {:#018x} R11: {:#018x} R12: {:#018x}",
			self.r10, self.r11, self.r12
		)?;
		write!(
			f,
			"R13: {:#018x} R14: {:#018x} R15: {:#018x}",
			self.r13, self.r14, self.r15
		)
	}
}

/// One fault fixup: emitted into the `extables` linker section next to
/// every instruction that is allowed to fault.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct ExtableEntry {
	pub fault_addr: u64,
	pub fixup_addr: u64,
	/// Optional `extern "C" fn(&mut ExceptionFrame)`; zero when absent.
	pub handler: u64,
}

pub const VECTOR_NAMES: [&str; 32] = [
	"#DE Divide Error",
	"#DB Debug",
	"NMI Non-Maskable Interrupt",
	"#BP Breakpoint",
	"#OF Overflow",
	"#BR BOUND Range Exceeded",
	"#UD Invalid Opcode",
	"#NM Device Not Available",
	"#DF Double Fault",
	"Coprocessor Segment Overrun",
	"#TS Invalid TSS",
	"#NP Segment Not Present",
	"#SS Stack Segment Fault",
	"#GP General Protection",
	"#PF Page Fault",
	"Reserved (15)",
	"#MF x87 Floating-Point",
	"#AC Alignment Check",
	"#MC Machine Check",
	"#XM SIMD Floating-Point",
	"#VE Virtualization",
	"#CP Control Protection",
	"Reserved (22)",
	"Reserved (23)",
	"Reserved (24)",
	"Reserved (25)",
	"Reserved (26)",
	"Reserved (27)",
	"Reserved (28)",
	"Reserved (29)",
	"Reserved (30)",
	"Reserved (31)",
];

pub const PAGE_FAULT_VECTOR: u64 = 14;

/// Vectors whose error code is a segment-selector reference.
const SELECTOR_ERROR_VECTORS: [u64; 5] = [10, 11, 12, 13, 17];

/// Renders a page-fault error code as its conventional flag characters:
/// user/supervisor, write/read, instruction fetch, reserved-bit, present.
pub fn decode_page_fault_error(code: u64, out: &mut heapless::String<16>) {
	out.clear();
	let _ = out.push(if code & (1 << 2) != 0 { 'U' } else { 'S' });
	let _ = out.push(if code & (1 << 1) != 0 { 'W' } else { 'R' });
	let _ = out.push(if code & (1 << 4) != 0 { 'I' } else { '-' });
	let _ = out.push(if code & (1 << 3) != 0 { 'V' } else { '-' });
	let _ = out.push(if code & 1 != 0 { 'P' } else { '-' });
}

/// Splits a selector error code into (external, table name, index).
pub fn decode_selector_error(code: u64) -> (bool, &'static str, u64) {
	use bit_field::BitField;

	let table = match code.get_bits(1..3) {
		0b00 => "GDT",
		0b01 | 0b11 => "IDT",
		_ => "LDT",
	};
	(code.get_bit(0), table, code.get_bits(3..16))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn page_fault_code_for_user_read_of_kernel_pte() {
		// User-mode read hitting a present PTE without the user bit:
		// P=1, W=0, U=1.
		let mut buf = heapless::String::new();
		decode_page_fault_error(0b101, &mut buf);
		assert!(buf.contains('U'));
		assert!(buf.contains('R'));
		assert!(buf.contains('P'));
		assert!(!buf.contains('W'));
	}

	#[test]
	fn page_fault_code_for_missing_page() {
		let mut buf = heapless::String::new();
		decode_page_fault_error(0b010, &mut buf);
		assert_eq!(buf.as_str(), "SW---");
	}

	#[test]
	fn selector_error_decodes_table_and_index() {
		// Selector 0x18 in the GDT, internal.
		let (ext, table, index) = decode_selector_error(0x18);
		assert!(!ext);
		assert_eq!(table, "GDT");
		assert_eq!(index, 3);

		let (ext, table, index) = decode_selector_error((5 << 3) | 0b010 | 1);
		assert!(ext);
		assert_eq!(table, "IDT");
		assert_eq!(index, 5);
	}

	#[test]
	fn frame_layout_matches_the_stub_contract() {
		assert_eq!(core::mem::offset_of!(ExceptionFrame, r15), 0);
		assert_eq!(core::mem::offset_of!(ExceptionFrame, rax), 14 * 8);
		assert_eq!(core::mem::offset_of!(ExceptionFrame, vector), 15 * 8);
		assert_eq!(core::mem::offset_of!(ExceptionFrame, error_code), 16 * 8);
		assert_eq!(core::mem::offset_of!(ExceptionFrame, rip), 17 * 8);
		assert_eq!(core::mem::size_of::<ExceptionFrame>(), 22 * 8);
	}
}

#[cfg(target_os = "none")]
pub use self::hw::*;

#[cfg(target_os = "none")]
mod hw {
	use core::arch::naked_asm;
	use core::cell::UnsafeCell;

	use x86_64::instructions::tables::lidt;
	use x86_64::structures::DescriptorTablePointer;

	use super::*;
	use crate::arch::x86_64::kernel::core_local::GDT_KERN_CS64;
	use crate::mm::PAGE_SIZE_2M;
	use crate::symbols;

	pub use x86_64::instructions::interrupts::{disable, enable};

	/// A 16-byte interrupt gate.
	///
	/// See Intel Vol. 3A, Figure 6-8 (64-Bit IDT Gate Descriptors).
	#[derive(Clone, Copy)]
	#[repr(C)]
	struct IdtEntry {
		base_lo: u16,
		selector: u16,
		ist: u8,
		flags: u8,
		base_mid: u16,
		base_hi: u32,
		reserved: u32,
	}

	impl IdtEntry {
		const MISSING: IdtEntry = IdtEntry {
			base_lo: 0,
			selector: 0,
			ist: 0,
			flags: 0,
			base_mid: 0,
			base_hi: 0,
			reserved: 0,
		};

		fn new(handler: u64, dpl: u8, ist: u8) -> Self {
			// Present, interrupt gate (type 0xe).
			let flags = 0x80 | (dpl << 5) | 0x0e;
			IdtEntry {
				base_lo: handler as u16,
				selector: GDT_KERN_CS64 << 3,
				ist,
				flags,
				base_mid: (handler >> 16) as u16,
				base_hi: (handler >> 32) as u32,
				reserved: 0,
			}
		}
	}

	#[repr(C, align(4096))]
	struct Idt(UnsafeCell<[IdtEntry; IDT_ENTRIES]>);

	unsafe impl Sync for Idt {}

	/// All CPUs share one IDT; each per-CPU block keeps its own pointer.
	static IDT: Idt = Idt(UnsafeCell::new([IdtEntry::MISSING; IDT_ENTRIES]));

	fn set_gate(vector: u8, handler: u64, dpl: u8, ist: u8) {
		unsafe {
			(*IDT.0.get())[vector as usize] = IdtEntry::new(handler, dpl, ist);
		}
	}

	pub fn idt_pointer() -> (u16, u64) {
		(
			(IDT_ENTRIES * core::mem::size_of::<IdtEntry>() - 1) as u16,
			IDT.0.get() as u64,
		)
	}

	/// Loads the shared IDT on the running CPU.
	pub fn load_idt() {
		let (limit, base) = idt_pointer();
		let pointer = DescriptorTablePointer {
			limit,
			base: x86_64::VirtAddr::new(base),
		};
		unsafe {
			lidt(&pointer);
		}
	}

	macro_rules! exception_stub {
		($name:ident, $vector:literal) => {
			#[unsafe(naked)]
			extern "C" fn $name() {
				naked_asm!(
					"push 0",
					concat!("push ", $vector),
					"jmp {common}",
					common = sym exception_common,
				)
			}
		};
		($name:ident, $vector:literal, error_code) => {
			#[unsafe(naked)]
			extern "C" fn $name() {
				naked_asm!(
					concat!("push ", $vector),
					"jmp {common}",
					common = sym exception_common,
				)
			}
		};
	}

	exception_stub!(entry_divide_error, 0);
	exception_stub!(entry_debug, 1);
	exception_stub!(entry_nmi, 2);
	exception_stub!(entry_breakpoint, 3);
	exception_stub!(entry_overflow, 4);
	exception_stub!(entry_bound_range, 5);
	exception_stub!(entry_invalid_opcode, 6);
	exception_stub!(entry_device_not_available, 7);
	exception_stub!(entry_double_fault, 8, error_code);
	exception_stub!(entry_coproc_overrun, 9);
	exception_stub!(entry_invalid_tss, 10, error_code);
	exception_stub!(entry_segment_not_present, 11, error_code);
	exception_stub!(entry_stack_fault, 12, error_code);
	exception_stub!(entry_general_protection, 13, error_code);
	exception_stub!(entry_page_fault, 14, error_code);
	exception_stub!(entry_reserved_15, 15);
	exception_stub!(entry_x87_fault, 16);
	exception_stub!(entry_alignment_check, 17, error_code);
	exception_stub!(entry_machine_check, 18);
	exception_stub!(entry_simd_fault, 19);
	exception_stub!(entry_virtualization, 20);
	exception_stub!(entry_control_protection, 21, error_code);
	exception_stub!(entry_ret2kern, 0x30);
	exception_stub!(entry_syscall, 0x80);
	exception_stub!(entry_unknown, 0xff);

	/// Spills the full register file and hands a `&mut ExceptionFrame`
	/// to `do_exception`. The epilogue restores everything, so a fixup
	/// that rewrote `rip` resumes transparently.
	#[unsafe(naked)]
	extern "C" fn exception_common() {
		naked_asm!(
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
			"mov rdi, rsp",
			"call {handler}",
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
			handler = sym do_exception,
		)
	}

	/// Installs gates for all architectural vectors plus the software
	/// vectors. INT3 and INTO stay reachable from ring 3; the double
	/// fault always runs on its own IST stack.
	pub fn install() {
		let stubs: [extern "C" fn(); 22] = [
			entry_divide_error,
			entry_debug,
			entry_nmi,
			entry_breakpoint,
			entry_overflow,
			entry_bound_range,
			entry_invalid_opcode,
			entry_device_not_available,
			entry_double_fault,
			entry_coproc_overrun,
			entry_invalid_tss,
			entry_segment_not_present,
			entry_stack_fault,
			entry_general_protection,
			entry_page_fault,
			entry_reserved_15,
			entry_x87_fault,
			entry_alignment_check,
			entry_machine_check,
			entry_simd_fault,
			entry_virtualization,
			entry_control_protection,
		];

		for vector in 0..IDT_ENTRIES as u16 {
			set_gate(vector as u8, entry_unknown as u64, 0, 0);
		}
		for (vector, stub) in stubs.iter().enumerate() {
			let dpl = if vector == 3 || vector == 4 { 3 } else { 0 };
			let ist = if vector == 8 { 1 } else { 0 };
			set_gate(vector as u8, *stub as u64, dpl, ist);
		}
		set_gate(RET2KERN_VECTOR, entry_ret2kern as u64, 3, 0);
		set_gate(SYSCALL_VECTOR, entry_syscall as u64, 3, 0);

		load_idt();
	}

	extern "C" {
		static __start_extables: ExtableEntry;
		static __stop_extables: ExtableEntry;
	}

	/// Linear scan of the extables for a fixup matching the fault site.
	fn find_fixup(rip: u64) -> Option<ExtableEntry> {
		unsafe {
			let start = core::ptr::addr_of!(__start_extables);
			let stop = core::ptr::addr_of!(__stop_extables);
			let mut entry = start;
			while entry < stop {
				let e = entry.read();
				if e.fault_addr == rip {
					return Some(e);
				}
				entry = entry.add(1);
			}
		}
		None
	}

	/// Prints the symbolic call stack by chasing frame pointers inside
	/// the faulting stack's 2 MiB page; the walk ends as soon as the
	/// symbol table draws a blank.
	fn print_backtrace(frame: &ExceptionFrame) {
		println!("Call stack:");
		if let Some(name) = symbols::lookup(frame.rip) {
			println!("  [{:#018x}] {}", frame.rip, name);
		}

		let stack_page = frame.rsp & !(PAGE_SIZE_2M as u64 - 1);
		let mut rbp = frame.rbp;
		while rbp >= stack_page
			&& rbp + 8 < stack_page + PAGE_SIZE_2M as u64
		{
			let ret = unsafe { ((rbp + 8) as *const u64).read() };
			let Some(name) = symbols::lookup(ret) else {
				break;
			};
			println!("  [{ret:#018x}] {name}");
			rbp = unsafe { (rbp as *const u64).read() };
		}
	}

	fn vector_name(vector: u64) -> &'static str {
		match vector {
			v @ 0..=31 => VECTOR_NAMES[v as usize],
			v if v == u64::from(RET2KERN_VECTOR) => "Return To Kernel",
			v if v == u64::from(SYSCALL_VECTOR) => "Syscall",
			_ => "Unknown Interrupt",
		}
	}

	/// The common exception handler behind every stub.
	extern "C" fn do_exception(frame: &mut ExceptionFrame) {
		// Recoverable fault sites first.
		if let Some(entry) = find_fixup(frame.rip) {
			frame.rip = entry.fixup_addr;
			if entry.handler != 0 {
				let handler: extern "C" fn(&mut ExceptionFrame) =
					unsafe { core::mem::transmute(entry.handler) };
				handler(frame);
			}
			return;
		}

		match frame.vector {
			v if v == u64::from(RET2KERN_VECTOR) || v == u64::from(SYSCALL_VECTOR) => {
				// The usermode exercise helpers own these; nothing to do
				// in the substrate but acknowledge.
				debug!("{} at {:#x}", vector_name(v), frame.rip);
				return;
			}
			v if v > 31 => {
				warn!("Spurious interrupt (vector {v:#x}) at RIP {:#x}", frame.rip);
				return;
			}
			_ => {}
		}

		println!();
		println!("Exception: {}", vector_name(frame.vector));
		println!("{frame}");

		if frame.vector == PAGE_FAULT_VECTOR {
			let cr2 = x86_64::registers::control::Cr2::read_raw();
			let mut flags = heapless::String::new();
			decode_page_fault_error(frame.error_code, &mut flags);
			println!("Faulting address (CR2): {cr2:#018x} [error code: {flags}]");
		} else if SELECTOR_ERROR_VECTORS.contains(&frame.vector) && frame.error_code != 0 {
			let (external, table, index) = decode_selector_error(frame.error_code);
			println!(
				"Selector: index {index} in {table}{}",
				if external { " (external)" } else { "" }
			);
		}

		print_backtrace(frame);

		panic!("Unhandled {}", vector_name(frame.vector));
	}
}
