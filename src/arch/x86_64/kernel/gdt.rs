//! Final segmentation setup.
//!
//! The early entry code runs on a transient flat GDT baked into the boot
//! stub. Once a CPU's per-CPU page exists, the tables are rebuilt there:
//! a ten-entry GDT (kernel and user segments, the TSS pair, the per-CPU
//! data segment) and a TSS whose `rsp0` points at a fresh kernel stack
//! and whose IST1 carries the dedicated double-fault stack.

use x86_64::instructions::tables::{lgdt, load_tss};
use x86_64::registers::segmentation::{Segment, SegmentSelector, CS, DS, ES, SS};
use x86_64::structures::DescriptorTablePointer;
use x86_64::PrivilegeLevel;

use super::core_local::{
	make_descriptor, make_tss_descriptor, Cpu, DescTablePtr, PerCpu, GDT_ENTRIES, GDT_KERN_CS64,
	GDT_KERN_DS32, GDT_PERCPU, GDT_TSS, KERN_CS32_DESC, KERN_CS64_DESC, KERN_DS32_DESC,
	USER_CS32_DESC, USER_CS64_DESC, USER_DS32_DESC,
};
use crate::config::KERNEL_STACK_ORDER;
use crate::mm::{self, GfpFlags, PAGE_ORDER_4K, PAGE_SIZE};

/// Builds the GDT and TSS inside `cpu`'s per-CPU page and loads them on
/// the running CPU.
pub fn install_percpu(cpu: &Cpu) {
	let percpu = cpu.percpu.as_mut_ptr::<PerCpu>();

	// One fresh kernel stack for ring-0 entries, one for double faults.
	let rsp0 = mm::get_free_pages_top(KERNEL_STACK_ORDER, GfpFlags::KERNEL)
		.expect("Out of memory for a kernel stack");
	let df_stack = mm::get_free_pages_top(PAGE_ORDER_4K, GfpFlags::KERNEL)
		.expect("Out of memory for the double-fault stack");

	unsafe {
		let tss = &mut (*percpu).tss;
		tss.rsp[0] = rsp0.as_u64() - 0x10;
		tss.ist[0] = df_stack.as_u64() - 0x10;

		let gdt = &mut (*percpu).gdt;
		gdt[0] = 0;
		gdt[1] = KERN_CS32_DESC;
		gdt[2] = KERN_DS32_DESC;
		gdt[3] = KERN_CS64_DESC;
		gdt[4] = USER_CS32_DESC;
		gdt[5] = USER_DS32_DESC;
		gdt[6] = USER_CS64_DESC;
		let (tss_low, tss_high) = make_tss_descriptor(
			core::ptr::from_ref(tss) as u64,
			core::mem::size_of_val(tss) as u32 - 1,
		);
		gdt[GDT_TSS as usize] = tss_low;
		gdt[GDT_TSS as usize + 1] = tss_high;
		// The per-CPU segment: a data view of this very page, so that
		// gs-relative loads reach the block through segmentation too.
		gdt[GDT_PERCPU as usize] =
			make_descriptor(cpu.percpu.as_u64() as u32, (PAGE_SIZE - 1) as u32, 0x93, 0x4);

		(*percpu).gdt_ptr = DescTablePtr {
			limit: (GDT_ENTRIES * 8 - 1) as u16,
			base: gdt.as_ptr() as u64,
		};
		let (idt_limit, idt_base) = super::interrupts::idt_pointer();
		(*percpu).idt_ptr = DescTablePtr {
			limit: idt_limit,
			base: idt_base,
		};

		let pointer = DescriptorTablePointer {
			limit: (GDT_ENTRIES * 8 - 1) as u16,
			base: x86_64::VirtAddr::new(gdt.as_ptr() as u64),
		};
		lgdt(&pointer);

		CS::set_reg(SegmentSelector::new(GDT_KERN_CS64, PrivilegeLevel::Ring0));
		DS::set_reg(SegmentSelector::new(GDT_KERN_DS32, PrivilegeLevel::Ring0));
		ES::set_reg(SegmentSelector::new(GDT_KERN_DS32, PrivilegeLevel::Ring0));
		SS::set_reg(SegmentSelector::new(GDT_KERN_DS32, PrivilegeLevel::Ring0));
		load_tss(SegmentSelector::new(GDT_TSS, PrivilegeLevel::Ring0));
	}

	debug!(
		"CPU[{}]: GDT/TSS installed (rsp0 {:#x}, IST1 {:#x})",
		cpu.id,
		rsp0.as_u64() - 0x10,
		df_stack.as_u64() - 0x10
	);
}
