//! Early entry.
//!
//! The Multiboot2 loader drops us in 32-bit protected mode with paging
//! off, `eax` holding the magic and `ebx` the info block. The stub below
//! builds transient page tables (identity and kernel window, 2 MiB
//! pages over the first gigabyte, one shared page directory), enables
//! long mode, and calls into Rust on a static boot stack.
//!
//! Symbols are linked high; every address the 32-bit code touches is
//! rebased by `KERNEL_VIRT_BASE`.

use core::arch::global_asm;

global_asm!(
	".set KERNEL_VIRT_BASE, 0xffffffff80000000",
	// --- Multiboot2 header ---
	".section .multiboot_header, \"a\"",
	".balign 8",
	"mb_header_start:",
	"	.long 0xe85250d6",
	"	.long 0",
	"	.long mb_header_end - mb_header_start",
	"	.long -(0xe85250d6 + (mb_header_end - mb_header_start))",
	// End tag.
	"	.word 0",
	"	.word 0",
	"	.long 8",
	"mb_header_end:",

	// --- Transient page tables (reclaimed with the init sections) ---
	".section .data.init, \"aw\"",
	".balign 4096",
	".global boot_pml4",
	"boot_pml4:",
	"	.space 4096",
	"boot_pdpt_ident:",
	"	.space 4096",
	"boot_pdpt_kern:",
	"	.space 4096",
	// One page directory serves both windows: the low 30 address bits
	// of the two bases coincide.
	".global boot_pd_kern",
	"boot_pd_kern:",
	"	.space 4096",

	// --- Long-lived boot state: the BSP keeps running on this stack,
	// and the transient GDT stays loaded until the per-CPU one exists ---
	".section .data, \"aw\"",
	".balign 16",
	"boot_stack:",
	"	.space 0x4000",
	"boot_stack_top:",
	"boot_mb_magic:",
	"	.long 0",
	"boot_mb_info:",
	"	.long 0",
	// Selector layout mirrors the per-CPU GDT so the IDT gates stay
	// valid across the switch: 0x18 is 64-bit kernel code in both.
	".balign 8",
	".global boot_gdt",
	"boot_gdt:",
	"	.quad 0",
	"	.quad 0x00cf9a000000ffff", // 0x08: 32-bit kernel code
	"	.quad 0x00cf92000000ffff", // 0x10: 32-bit kernel data
	"	.quad 0x00af9a000000ffff", // 0x18: 64-bit kernel code
	"	.quad 0",                  // 0x20: transient TSS, filled late
	"	.quad 0",
	"boot_gdt_ptr:",
	"	.word boot_gdt_ptr - boot_gdt - 1",
	"	.quad boot_gdt - KERNEL_VIRT_BASE",

	// --- 32-bit entry ---
	".section .text.init, \"ax\"",
	".code32",
	".global _start",
	"_start:",
	"	cli",
	"	cld",
	"	movl %eax, boot_mb_magic - KERNEL_VIRT_BASE",
	"	movl %ebx, boot_mb_info - KERNEL_VIRT_BASE",
	"	movl $(boot_stack_top - KERNEL_VIRT_BASE), %esp",

	// Page directory: 512 entries of 2 MiB, present + writable + PS.
	"	movl $(boot_pd_kern - KERNEL_VIRT_BASE), %edi",
	"	movl $0x83, %eax",
	"	xorl %edx, %edx",
	"	movl $512, %ecx",
	"1:",
	"	movl %eax, (%edi)",
	"	movl %edx, 4(%edi)",
	"	addl $0x200000, %eax",
	"	addl $8, %edi",
	"	loop 1b",

	// Wire the hierarchy for both windows.
	"	movl $(boot_pd_kern - KERNEL_VIRT_BASE + 0x03), %eax",
	"	movl %eax, boot_pdpt_ident - KERNEL_VIRT_BASE",
	"	movl %eax, boot_pdpt_kern - KERNEL_VIRT_BASE + 510 * 8",
	"	movl $(boot_pdpt_ident - KERNEL_VIRT_BASE + 0x03), %eax",
	"	movl %eax, boot_pml4 - KERNEL_VIRT_BASE",
	"	movl $(boot_pdpt_kern - KERNEL_VIRT_BASE + 0x03), %eax",
	"	movl %eax, boot_pml4 - KERNEL_VIRT_BASE + 511 * 8",

	// PAE, root pointer, long mode (with NX), paging.
	"	movl %cr4, %eax",
	"	orl $0x20, %eax",
	"	movl %eax, %cr4",
	"	movl $(boot_pml4 - KERNEL_VIRT_BASE), %eax",
	"	movl %eax, %cr3",
	"	movl $0xc0000080, %ecx",
	"	rdmsr",
	"	orl $0x900, %eax",
	"	wrmsr",
	"	movl %cr0, %eax",
	"	orl $0x80010001, %eax", // PG | WP | PE
	"	movl %eax, %cr0",
	"	lgdtl boot_gdt_ptr - KERNEL_VIRT_BASE",
	"	ljmpl $0x18, $(boot64 - KERNEL_VIRT_BASE)",

	".code64",
	"boot64:",
	"	movw $0x10, %ax",
	"	movw %ax, %ds",
	"	movw %ax, %es",
	"	movw %ax, %ss",
	"	xorw %ax, %ax",
	"	movw %ax, %fs",
	"	movw %ax, %gs",
	// Move the stack and the instruction stream to the kernel window.
	"	movabsq $KERNEL_VIRT_BASE, %rax",
	"	addq %rax, %rsp",
	"	movabsq $boot_high, %rax",
	"	jmpq *%rax",
	"boot_high:",
	"	movl boot_mb_magic(%rip), %edi",
	"	movl boot_mb_info(%rip), %esi",
	"	movabsq $boot_start, %rax",
	"	callq *%rax",
	"2:",
	"	cli",
	"	hlt",
	"	jmp 2b",
	options(att_syntax),
);

extern "C" {
	static mut boot_gdt: [u64; BOOT_GDT_ENTRIES];
}

const BOOT_GDT_ENTRIES: usize = 6;
const BOOT_TSS_SELECTOR: u16 = 4;

/// Re-points GDTR at the kernel-window alias of the transient GDT.
///
/// The 32-bit stub loaded it by physical address, which the final page
/// tables no longer map; the reload must happen before the CR3 switch.
pub fn reload_boot_gdt() {
	use x86_64::structures::DescriptorTablePointer;

	let pointer = DescriptorTablePointer {
		limit: (BOOT_GDT_ENTRIES * 8 - 1) as u16,
		base: x86_64::VirtAddr::new(unsafe { core::ptr::addr_of!(boot_gdt) } as u64),
	};
	unsafe {
		x86_64::instructions::tables::lgdt(&pointer);
	}
}

struct StaticTss(core::cell::UnsafeCell<super::core_local::Tss>);

unsafe impl Sync for StaticTss {}

/// The transient TSS backing IST1 until the per-CPU blocks exist.
static BOOT_TSS: StaticTss = StaticTss(core::cell::UnsafeCell::new(super::core_local::Tss::new()));

#[repr(align(16))]
struct BootDfStack([u8; 4096]);

static BOOT_DF_STACK: BootDfStack = BootDfStack([0; 4096]);

/// Fills the transient TSS slots of the boot GDT and loads the task
/// register, giving the double-fault gate a usable IST1 from the first
/// instant the IDT is live.
pub fn install_boot_tss() {
	use x86_64::registers::segmentation::SegmentSelector;
	use x86_64::PrivilegeLevel;

	let tss = BOOT_TSS.0.get();
	unsafe {
		(*tss).ist[0] =
			core::ptr::addr_of!(BOOT_DF_STACK.0) as u64 + BOOT_DF_STACK.0.len() as u64 - 0x10;

		let (low, high) = super::core_local::make_tss_descriptor(
			tss as u64,
			core::mem::size_of::<super::core_local::Tss>() as u32 - 1,
		);
		let gdt = &raw mut boot_gdt;
		(*gdt)[BOOT_TSS_SELECTOR as usize] = low;
		(*gdt)[BOOT_TSS_SELECTOR as usize + 1] = high;

		x86_64::instructions::tables::load_tss(SegmentSelector::new(
			BOOT_TSS_SELECTOR,
			PrivilegeLevel::Ring0,
		));
	}
}
