//! Per-CPU state.
//!
//! Every logical CPU owns exactly one page-aligned block holding its
//! segmentation structures and scratch slots. The block is reachable
//! three ways: through the global CPU registry, through the GS base
//! (fast path), and through the CPU id mirrored into `IA32_TSC_AUX` so
//! that `rdtscp` names the running processor even before GS is loaded.

use memory_addresses::VirtAddr;

use crate::config::MAX_CPUS;
use crate::mm::PAGE_SIZE;

pub const INVALID_CPU: u32 = u32::MAX;

/// Number of GDT entries in a per-CPU block.
pub const GDT_ENTRIES: usize = 10;

pub const GDT_NULL: u16 = 0;
pub const GDT_KERN_CS32: u16 = 1;
pub const GDT_KERN_DS32: u16 = 2;
pub const GDT_KERN_CS64: u16 = 3;
pub const GDT_USER_CS32: u16 = 4;
pub const GDT_USER_DS32: u16 = 5;
pub const GDT_USER_CS64: u16 = 6;
/// A 64-bit TSS descriptor spans two slots.
pub const GDT_TSS: u16 = 7;
pub const GDT_PERCPU: u16 = 9;

/// The 64-bit task-state segment, laid out bit-exactly.
#[derive(Clone, Copy, Debug)]
#[repr(C, packed(4))]
pub struct Tss {
	reserved0: u32,
	/// Stack pointers for rings 0 through 2.
	pub rsp: [u64; 3],
	reserved1: u64,
	/// Interrupt-stack-table pointers; `ist[0]` is IST1.
	pub ist: [u64; 7],
	reserved2: u64,
	reserved3: u16,
	pub iomap_base: u16,
}

impl Tss {
	pub const fn new() -> Self {
		Self {
			reserved0: 0,
			rsp: [0; 3],
			reserved1: 0,
			ist: [0; 7],
			reserved2: 0,
			reserved3: 0,
			iomap_base: core::mem::size_of::<Tss>() as u16,
		}
	}
}

/// A pseudo-descriptor for `lgdt`/`lidt`.
#[derive(Clone, Copy, Debug)]
#[repr(C, packed(2))]
pub struct DescTablePtr {
	pub limit: u16,
	pub base: u64,
}

/// The per-CPU block. One page, identity-mapped: segment-descriptor
/// bases are 32 bits wide, so the block must live at a low address.
#[repr(C, align(4096))]
pub struct PerCpu {
	/// Self pointer, first so the GS fast path can fetch it.
	pub this: u64,
	pub cpu_id: u32,
	pub apic_id: u32,
	pub bsp: bool,
	pub enabled: bool,
	/// Saved user stack pointer of the usermode round trip.
	pub user_stack: u64,
	/// Saved kernel stack pointer for the return-to-kernel vector.
	pub ret2kern_sp: u64,
	pub gdt: [u64; GDT_ENTRIES],
	pub gdt_ptr: DescTablePtr,
	pub idt_ptr: DescTablePtr,
	pub tss: Tss,
}

const _: () = assert!(core::mem::size_of::<PerCpu>() <= PAGE_SIZE);

/// Builds an 8-byte segment descriptor from its raw fields.
///
/// `access` is the type/S/DPL/P byte, `flags` the AVL/L/DB/G nibble.
pub const fn make_descriptor(base: u32, limit: u32, access: u8, flags: u8) -> u64 {
	let base = base as u64;
	let limit = limit as u64;
	(limit & 0xffff)
		| ((base & 0xff_ffff) << 16)
		| ((access as u64) << 40)
		| (((limit >> 16) & 0xf) << 48)
		| (((flags as u64) & 0xf) << 52)
		| (((base >> 24) & 0xff) << 56)
}

pub const KERN_CS32_DESC: u64 = make_descriptor(0, 0xf_ffff, 0x9a, 0xc);
pub const KERN_DS32_DESC: u64 = make_descriptor(0, 0xf_ffff, 0x92, 0xc);
pub const KERN_CS64_DESC: u64 = make_descriptor(0, 0xf_ffff, 0x9a, 0xa);
pub const USER_CS32_DESC: u64 = make_descriptor(0, 0xf_ffff, 0xfa, 0xc);
pub const USER_DS32_DESC: u64 = make_descriptor(0, 0xf_ffff, 0xf2, 0xc);
pub const USER_CS64_DESC: u64 = make_descriptor(0, 0xf_ffff, 0xfa, 0xa);

/// A 16-byte available-64-bit-TSS descriptor as a slot pair.
pub fn make_tss_descriptor(base: u64, limit: u32) -> (u64, u64) {
	let low = make_descriptor(base as u32, limit, 0x89, 0x0);
	let high = base >> 32;
	(low, high)
}

/// Logical CPU descriptor kept on the global list.
#[derive(Clone, Copy, Debug)]
pub struct Cpu {
	pub id: u32,
	pub apic_id: u32,
	pub bsp: bool,
	pub enabled: bool,
	/// Bring-up on this CPU has finished (BSP init or `ap_callin`).
	pub done: bool,
	pub percpu: VirtAddr,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn flat_descriptors_match_the_reference_encoding() {
		assert_eq!(KERN_CS32_DESC, 0x00cf_9a00_0000_ffff);
		assert_eq!(KERN_DS32_DESC, 0x00cf_9200_0000_ffff);
		assert_eq!(KERN_CS64_DESC, 0x00af_9a00_0000_ffff);
		assert_eq!(USER_CS64_DESC, 0x00af_fa00_0000_ffff);
	}

	#[test]
	fn tss_descriptor_splits_the_base() {
		let (low, high) = make_tss_descriptor(0x1234_5678_9abc_def0, 0x67);
		// Type 0x89, base bits 0..24 and 24..32 in place.
		assert_eq!(low & 0xff, 0x67);
		assert_eq!((low >> 40) & 0xff, 0x89);
		assert_eq!((low >> 16) & 0xff_ffff, 0xbc_def0);
		assert_eq!(low >> 56, 0x9a);
		assert_eq!(high, 0x1234_5678);
	}

	#[test]
	fn tss_layout_is_architectural() {
		assert_eq!(core::mem::size_of::<Tss>(), 104);
		assert_eq!(core::mem::offset_of!(Tss, rsp), 4);
		assert_eq!(core::mem::offset_of!(Tss, ist), 36);
		assert_eq!(core::mem::offset_of!(Tss, iomap_base), 102);
	}

	#[test]
	fn percpu_fits_one_page() {
		assert!(core::mem::size_of::<PerCpu>() <= PAGE_SIZE);
	}
}

#[cfg(target_os = "none")]
pub use self::hw::*;

#[cfg(target_os = "none")]
mod hw {
	use core::arch::asm;

	use heapless::Vec;
	use hermit_sync::InterruptSpinMutex;
	use x86_64::registers::model_specific::GsBase;

	use super::*;
	use crate::errno::Errno;
	use crate::mm::{get_free_pages, GfpFlags, PAGE_ORDER_4K};

	static CPUS: InterruptSpinMutex<Vec<Cpu, MAX_CPUS>> = InterruptSpinMutex::new(Vec::new());

	/// Allocates and registers the per-CPU block for one enabled LAPIC.
	pub fn alloc_percpu(cpu_id: u32, apic_id: u32, bsp: bool) -> Result<(), Errno> {
		let kern_va = get_free_pages(PAGE_ORDER_4K, GfpFlags::IDENT | GfpFlags::KERNEL)
			.ok_or(Errno::NoMem)?;
		// The block is addressed through its identity alias: segment
		// descriptors carry 32-bit bases.
		let va = VirtAddr::new(crate::mm::virtualmem::virt_kern_to_paddr(kern_va).as_u64());
		assert!(
			va.as_u64() <= u64::from(u32::MAX),
			"Per-CPU page beyond the 32-bit descriptor-base limit"
		);

		unsafe {
			let percpu = va.as_mut_ptr::<PerCpu>();
			core::ptr::write_bytes(percpu, 0, 1);
			(*percpu).this = va.as_u64();
			(*percpu).cpu_id = cpu_id;
			(*percpu).apic_id = apic_id;
			(*percpu).bsp = bsp;
			(*percpu).enabled = true;
			(*percpu).tss = Tss::new();
		}

		let cpu = Cpu {
			id: cpu_id,
			apic_id,
			bsp,
			enabled: true,
			done: false,
			percpu: va,
		};
		CPUS.lock().push(cpu).map_err(|_| Errno::Range)?;

		debug!("CPU[{cpu_id}]: per-CPU page at {va:p} (APIC id {apic_id})");
		Ok(())
	}

	pub fn nr_cpus() -> u32 {
		CPUS.lock().len() as u32
	}

	pub fn cpu(id: u32) -> Option<Cpu> {
		CPUS.lock().iter().find(|cpu| cpu.id == id).copied()
	}

	pub fn bsp() -> Cpu {
		CPUS.lock()
			.iter()
			.find(|cpu| cpu.bsp)
			.copied()
			.expect("No BSP registered")
	}

	/// Snapshot of the CPU list, for bring-up iteration.
	pub fn cpus() -> Vec<Cpu, MAX_CPUS> {
		CPUS.lock().clone()
	}

	pub fn set_done(id: u32) {
		let mut cpus = CPUS.lock();
		if let Some(cpu) = cpus.iter_mut().find(|cpu| cpu.id == id) {
			cpu.done = true;
		}
	}

	/// The running CPU's block via the GS base.
	#[inline]
	pub fn current() -> &'static PerCpu {
		let this: u64;
		unsafe {
			asm!(
				"mov {}, gs:{}",
				out(reg) this,
				const core::mem::offset_of!(PerCpu, this),
				options(nomem, nostack, preserves_flags),
			);
			&*(this as *const PerCpu)
		}
	}

	#[inline]
	pub fn core_id() -> u32 {
		current().cpu_id
	}

	/// `core_id` that tolerates being called before `install` ran.
	pub fn try_core_id() -> Option<u32> {
		if GsBase::read().as_u64() == 0 {
			None
		} else {
			Some(core_id())
		}
	}

	/// Points GS at the CPU's block and mirrors the id into
	/// `IA32_TSC_AUX` for `rdtscp`.
	pub fn install(cpu_id: u32) {
		use crate::arch::x86_64::kernel::processor::{wrmsr, MSR_TSC_AUX};

		let cpu = cpu(cpu_id).expect("Installing per-CPU state for an unknown CPU");
		GsBase::write(x86_64::VirtAddr::new(cpu.percpu.as_u64()));
		unsafe {
			wrmsr(MSR_TSC_AUX, u64::from(cpu_id));
		}
	}
}

#[cfg(not(target_os = "none"))]
pub fn try_core_id() -> Option<u32> {
	None
}
