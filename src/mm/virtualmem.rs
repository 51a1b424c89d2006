//! Address-space windows.
//!
//! Every frame can be made visible at up to three fixed virtual bases:
//! the identity window, the user window, and the kernel window. A frame
//! may appear in several windows at once; unmapping one window does not
//! evict the others.

use memory_addresses::{PhysAddr, VirtAddr};

use crate::config::{VIRT_IDENT_BASE, VIRT_KERNEL_BASE, VIRT_USER_BASE};
use crate::mm::Mfn;

bitflags::bitflags! {
	/// Selects the windows a fresh allocation must appear in.
	#[derive(Clone, Copy, PartialEq, Eq, Debug)]
	pub struct GfpFlags: u32 {
		const IDENT = 1 << 0;
		const USER = 1 << 1;
		const KERNEL = 1 << 2;
		/// Historical alias of the kernel window; kept so callers can
		/// state the "mapping only" intent.
		const KERNEL_MAP = 1 << 3;
	}
}

/// Virtual address of `mfn` in the identity window.
#[inline]
pub fn mfn_to_virt_ident(mfn: Mfn) -> VirtAddr {
	VirtAddr::new(VIRT_IDENT_BASE + mfn.to_paddr().as_u64())
}

/// Virtual address of `mfn` in the user window.
#[inline]
pub fn mfn_to_virt_user(mfn: Mfn) -> VirtAddr {
	VirtAddr::new(VIRT_USER_BASE + mfn.to_paddr().as_u64())
}

/// Virtual address of `mfn` in the kernel window.
#[inline]
pub fn mfn_to_virt_kern(mfn: Mfn) -> VirtAddr {
	VirtAddr::new(VIRT_KERNEL_BASE + mfn.to_paddr().as_u64())
}

/// Physical address of a kernel-window virtual address.
#[inline]
pub fn virt_kern_to_paddr(va: VirtAddr) -> PhysAddr {
	PhysAddr::new(va.as_u64() - VIRT_KERNEL_BASE)
}

#[inline]
pub fn paddr_to_virt_kern(paddr: PhysAddr) -> VirtAddr {
	VirtAddr::new(VIRT_KERNEL_BASE + paddr.as_u64())
}

#[cfg(target_os = "none")]
pub use self::hw::*;

#[cfg(target_os = "none")]
mod hw {
	use hermit_sync::InterruptSpinMutex;

	use super::*;
	use crate::arch::x86_64::mm::paging::{self, PteFlags, L1_PROT, L1_PROT_USER};
	use crate::errno::Errno;
	use crate::mm::physicalmem::{self, FrameFlags};
	use crate::mm::{
		order_to_size, PAGE_ORDER_1G, PAGE_ORDER_2M, PAGE_ORDER_4K,
	};

	/// Serializes window bookkeeping across concurrent allocations.
	/// Distinct from (and taken before) the page-table lock.
	static MMAP_LOCK: InterruptSpinMutex<()> = InterruptSpinMutex::new(());

	/// Top of the contiguous boot-time identity mapping. Physical
	/// addresses below this are readable without further mapping.
	static IDENT_LIMIT: core::sync::atomic::AtomicU64 = core::sync::atomic::AtomicU64::new(0);

	pub fn ident_mapped_limit() -> u64 {
		IDENT_LIMIT.load(core::sync::atomic::Ordering::Relaxed)
	}

	pub fn vmap_ident_4k(mfn: Mfn, flags: PteFlags) -> Result<VirtAddr, Errno> {
		paging::vmap(mfn_to_virt_ident(mfn), mfn, PAGE_ORDER_4K, flags)
	}

	pub fn vmap_ident_2m(mfn: Mfn, flags: PteFlags) -> Result<VirtAddr, Errno> {
		paging::vmap(mfn_to_virt_ident(mfn), mfn, PAGE_ORDER_2M, flags)
	}

	pub fn vmap_ident_1g(mfn: Mfn, flags: PteFlags) -> Result<VirtAddr, Errno> {
		paging::vmap(mfn_to_virt_ident(mfn), mfn, PAGE_ORDER_1G, flags)
	}

	pub fn vmap_kern_4k(mfn: Mfn, flags: PteFlags) -> Result<VirtAddr, Errno> {
		paging::vmap(mfn_to_virt_kern(mfn), mfn, PAGE_ORDER_4K, flags)
	}

	pub fn vmap_kern_2m(mfn: Mfn, flags: PteFlags) -> Result<VirtAddr, Errno> {
		paging::vmap(mfn_to_virt_kern(mfn), mfn, PAGE_ORDER_2M, flags)
	}

	pub fn vmap_kern_1g(mfn: Mfn, flags: PteFlags) -> Result<VirtAddr, Errno> {
		paging::vmap(mfn_to_virt_kern(mfn), mfn, PAGE_ORDER_1G, flags)
	}

	pub fn vmap_user_4k(mfn: Mfn, flags: PteFlags) -> Result<VirtAddr, Errno> {
		paging::vmap(mfn_to_virt_user(mfn), mfn, PAGE_ORDER_4K, flags)
	}

	pub fn vmap_user_2m(mfn: Mfn, flags: PteFlags) -> Result<VirtAddr, Errno> {
		paging::vmap(mfn_to_virt_user(mfn), mfn, PAGE_ORDER_2M, flags)
	}

	pub fn vmap_user_1g(mfn: Mfn, flags: PteFlags) -> Result<VirtAddr, Errno> {
		paging::vmap(mfn_to_virt_user(mfn), mfn, PAGE_ORDER_1G, flags)
	}

	fn window_flags(order: usize, user: bool) -> PteFlags {
		let base = if user { L1_PROT_USER } else { L1_PROT };
		if order == PAGE_ORDER_4K {
			base
		} else {
			base | PteFlags::PSE
		}
	}

	fn map_windows(mfn: Mfn, order: usize, gfp: GfpFlags) -> Result<(), Errno> {
		if gfp.intersects(GfpFlags::IDENT) {
			paging::vmap(mfn_to_virt_ident(mfn), mfn, order, window_flags(order, false))?;
		}
		if gfp.intersects(GfpFlags::KERNEL | GfpFlags::KERNEL_MAP) {
			paging::vmap(mfn_to_virt_kern(mfn), mfn, order, window_flags(order, false))?;
		}
		if gfp.intersects(GfpFlags::USER) {
			paging::vmap(mfn_to_virt_user(mfn), mfn, order, window_flags(order, true))?;
		}
		Ok(())
	}

	/// The address handed back when several windows were requested:
	/// kernel first, then identity, then user.
	fn gfp_to_virt(mfn: Mfn, gfp: GfpFlags) -> VirtAddr {
		if gfp.intersects(GfpFlags::KERNEL | GfpFlags::KERNEL_MAP) {
			mfn_to_virt_kern(mfn)
		} else if gfp.intersects(GfpFlags::IDENT) {
			mfn_to_virt_ident(mfn)
		} else {
			mfn_to_virt_user(mfn)
		}
	}

	/// Allocates one frame of the given order and installs it in every
	/// requested window.
	pub fn get_free_pages(order: usize, gfp: GfpFlags) -> Option<VirtAddr> {
		assert!(!gfp.is_empty());

		let _guard = MMAP_LOCK.lock();
		let mfn = physicalmem::get_free_frames(order)?;

		if map_windows(mfn, order, gfp).is_err() {
			physicalmem::put_free_frames(mfn, order);
			return None;
		}
		physicalmem::update_flags(mfn, order, FrameFlags::MAPPED, FrameFlags::empty());

		Some(gfp_to_virt(mfn, gfp))
	}

	/// Like [`get_free_pages`], but returns the address one past the
	/// allocation: the natural form for a downward-growing stack.
	pub fn get_free_pages_top(order: usize, gfp: GfpFlags) -> Option<VirtAddr> {
		get_free_pages(order, gfp).map(|va| VirtAddr::new(va.as_u64() + order_to_size(order) as u64))
	}

	/// Unmaps every window view of the frame behind `va` and returns the
	/// frame to the allocator.
	pub fn put_pages(va: VirtAddr) {
		let _guard = MMAP_LOCK.lock();

		let (mfn, order, _) = paging::walk(va)
			.unwrap_or_else(|| panic!("put_pages: {va:p} is not mapped"));

		for window in [
			mfn_to_virt_ident(mfn),
			mfn_to_virt_kern(mfn),
			mfn_to_virt_user(mfn),
		] {
			if let Some((window_mfn, window_order, _)) = paging::walk(window) {
				if window_mfn == mfn && window_order == order {
					paging::vunmap(window, order).unwrap();
				}
			}
		}

		physicalmem::update_flags(mfn, order, FrameFlags::empty(), FrameFlags::MAPPED);
		physicalmem::put_free_frames(mfn, order);
	}

	/// Builds the final page-table hierarchy: the kernel image per the
	/// regions table, plus the identity window over low physical memory.
	pub fn init_pagetables() {
		use crate::mm::regions;

		info!("Initialize final page tables");

		paging::adopt_scratch_table();

		for region in regions::regions() {
			let mut va = region.start;
			while va < region.end {
				let mfn = Mfn::from_paddr(regions::region_virt_to_phys(&region, va));
				paging::vmap(va, mfn, PAGE_ORDER_4K, region.flags).unwrap();
				va = VirtAddr::new(va.as_u64() + order_to_size(PAGE_ORDER_4K) as u64);
			}
		}

		// Identity window over the first 2 MiB, 4 KiB-granular: firmware
		// structures (EBDA, BIOS ROM), the Multiboot blob, and the AP
		// trampoline, which executes from here during its long-mode hop.
		// Everything else enters the identity window per allocation.
		let ident_limit = order_to_size(PAGE_ORDER_2M) as u64;
		let mut paddr = 0;
		while paddr < ident_limit {
			let mfn = Mfn::from_paddr(PhysAddr::new(paddr));
			vmap_ident_4k(mfn, window_flags(PAGE_ORDER_4K, false)).unwrap();
			paddr += order_to_size(PAGE_ORDER_4K) as u64;
		}
		IDENT_LIMIT.store(ident_limit, core::sync::atomic::Ordering::Relaxed);

		paging::switch_to_final_tables();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn window_bases_do_not_overlap() {
		let mfn = Mfn::from_paddr(PhysAddr::new(0x20_0000));
		assert_eq!(mfn_to_virt_ident(mfn).as_u64(), 0x20_0000);
		assert_eq!(mfn_to_virt_user(mfn).as_u64(), 0x40_0000 + 0x20_0000);
		assert_eq!(
			mfn_to_virt_kern(mfn).as_u64(),
			0xffff_ffff_8000_0000 + 0x20_0000
		);
	}

	#[test]
	fn kernel_window_round_trip() {
		let pa = PhysAddr::new(0x123_4000);
		let va = paddr_to_virt_kern(pa);
		assert_eq!(virt_kern_to_paddr(va), pa);
		assert_eq!(mfn_to_virt_kern(Mfn::from_paddr(pa)), va);
	}
}
