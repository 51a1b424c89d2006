//! Linker-section regions.
//!
//! A static description of the kernel image: every section range paired
//! with its address-space window base and default protections. The table
//! drives the construction of the final page tables and the reclamation
//! of the `*.init` sections once bring-up is over.

use memory_addresses::{PhysAddr, VirtAddr};

use crate::arch::x86_64::mm::paging::PteFlags;
use crate::config::VIRT_KERNEL_BASE;

/// One linker section and how it is to be mapped.
#[derive(Clone, Copy, Debug)]
pub struct Region {
	pub name: &'static str,
	/// Base of the window this region is mapped in.
	pub base: u64,
	pub start: VirtAddr,
	pub end: VirtAddr,
	pub flags: PteFlags,
}

/// Physical address backing `va` within `region`.
///
/// Kernel-window regions are linked at their load address plus the window
/// base, so the translation is a plain offset.
pub fn region_virt_to_phys(region: &Region, va: VirtAddr) -> PhysAddr {
	debug_assert!(va >= region.start && va < region.end);
	PhysAddr::new(va.as_u64() - region.base)
}

#[cfg(target_os = "none")]
pub use self::hw::*;

#[cfg(target_os = "none")]
mod hw {
	use super::*;
	use crate::arch::x86_64::mm::paging::{L1_PROT, L1_PROT_RO};
	use crate::mm::{Mfn, PAGE_ORDER_4K, PAGE_SIZE};

	extern "C" {
		static __text_start: u8;
		static __text_end: u8;
		static __rodata_start: u8;
		static __rodata_end: u8;
		static __data_start: u8;
		static __data_end: u8;
		static __bss_start: u8;
		static __bss_end: u8;
		static __init_start: u8;
		static __init_end: u8;
		static __kernel_end: u8;
	}

	fn sym(addr: &u8) -> VirtAddr {
		VirtAddr::from_ptr(core::ptr::from_ref(addr))
	}

	/// Executable, read-only text.
	const TEXT_PROT: PteFlags = PteFlags::PRESENT.union(PteFlags::ACCESSED);

	/// The regions table, leaves first the way the image is laid out.
	pub fn regions() -> [Region; 5] {
		unsafe {
			[
				Region {
					name: ".text",
					base: VIRT_KERNEL_BASE,
					start: sym(&__text_start),
					end: sym(&__text_end),
					flags: TEXT_PROT,
				},
				Region {
					name: ".rodata",
					base: VIRT_KERNEL_BASE,
					start: sym(&__rodata_start),
					end: sym(&__rodata_end),
					flags: L1_PROT_RO,
				},
				Region {
					name: ".data",
					base: VIRT_KERNEL_BASE,
					start: sym(&__data_start),
					end: sym(&__data_end),
					flags: L1_PROT.union(PteFlags::NO_EXECUTE),
				},
				Region {
					name: ".bss",
					base: VIRT_KERNEL_BASE,
					start: sym(&__bss_start),
					end: sym(&__bss_end),
					flags: L1_PROT.union(PteFlags::NO_EXECUTE),
				},
				Region {
					name: ".init",
					base: VIRT_KERNEL_BASE,
					start: sym(&__init_start),
					end: sym(&__init_end),
					// Boot code executes from here before the final
					// tables exist; the whole range is dropped later.
					flags: L1_PROT,
				},
			]
		}
	}

	/// First physical address past the kernel image.
	pub fn kernel_end_paddr() -> PhysAddr {
		PhysAddr::new(unsafe { sym(&__kernel_end) }.as_u64() - VIRT_KERNEL_BASE)
	}

	/// Whether `paddr` is occupied by a kernel section (including the
	/// image's boot tables below `__text_start`).
	pub fn in_kernel_section(paddr: PhysAddr) -> bool {
		paddr.as_u64() >= crate::config::KERNEL_PHYS_BASE
			&& paddr < kernel_end_paddr()
	}

	/// Unmaps the `*.init` sections and hands their frames to the frame
	/// allocator. Must run after the last init-section call.
	pub fn reclaim_init_sections() {
		use crate::arch::x86_64::mm::paging;
		use crate::mm::physicalmem;

		let (start, end) = unsafe { (sym(&__init_start), sym(&__init_end)) };
		let mut va = start;
		let mut pages = 0usize;
		while va < end {
			let paddr = PhysAddr::new(va.as_u64() - VIRT_KERNEL_BASE);
			paging::vunmap(va, PAGE_ORDER_4K).unwrap();
			physicalmem::reclaim_frame(Mfn::from_paddr(paddr), PAGE_ORDER_4K);
			va = VirtAddr::new(va.as_u64() + PAGE_SIZE as u64);
			pages += 1;
		}

		info!("Reclaimed {pages} init pages");
	}
}
