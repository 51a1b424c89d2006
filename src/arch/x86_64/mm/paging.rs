//! Four-level page-table mapper.
//!
//! Arbitrary `(virtual, MFN, order, flags)` tuples are installed below the
//! CR3 root. Page-table frames themselves are reached through a transient
//! single-page window: a statically reserved 4 KiB scratch page whose PTE
//! is re-pointed at whichever table frame the walk needs next. The L1
//! table carrying that PTE is itself a static inside the kernel image and
//! is wired into both the boot and the final hierarchy, so the window
//! works across the CR3 switch.

use core::fmt;

use memory_addresses::{PhysAddr, VirtAddr};

use crate::mm::{Mfn, PAGE_ORDER_1G, PAGE_ORDER_2M, PAGE_ORDER_4K, PAGE_SHIFT, PAGE_SIZE};

pub const PT_ENTRIES: usize = 512;

/// Bits of a virtual address consumed by each table level.
const PAGE_MAP_BITS: usize = 9;
const PAGE_MAP_MASK: usize = PT_ENTRIES - 1;

/// Mask of the physical-address bits within a table entry.
const PTE_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

bitflags::bitflags! {
	/// Flags of an entry at any table level.
	///
	/// See Intel Vol. 3A, Tables 4-14 through 4-19.
	#[derive(Clone, Copy, PartialEq, Eq, Debug)]
	pub struct PteFlags: u64 {
		const PRESENT = 1 << 0;
		const WRITABLE = 1 << 1;
		const USER = 1 << 2;
		const WRITE_THROUGH = 1 << 3;
		const CACHE_DISABLE = 1 << 4;
		const ACCESSED = 1 << 5;
		const DIRTY = 1 << 6;
		/// In the PDPT and PD: this entry maps a 1 GiB / 2 MiB page.
		const PSE = 1 << 7;
		const GLOBAL = 1 << 8;
		const NO_EXECUTE = 1 << 63;
	}
}

/// Leaf protections for kernel mappings.
pub const L1_PROT: PteFlags = PteFlags::PRESENT
	.union(PteFlags::WRITABLE)
	.union(PteFlags::ACCESSED)
	.union(PteFlags::DIRTY);
pub const L1_PROT_RO: PteFlags = PteFlags::PRESENT
	.union(PteFlags::ACCESSED)
	.union(PteFlags::NO_EXECUTE);
pub const L1_PROT_USER: PteFlags = L1_PROT.union(PteFlags::USER);

/// Protections for non-leaf entries: the permissive union, so that leaf
/// entries alone decide the effective rights.
const TABLE_PROT: PteFlags = PteFlags::PRESENT
	.union(PteFlags::WRITABLE)
	.union(PteFlags::USER)
	.union(PteFlags::ACCESSED);

/// One entry at any of the four table levels.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
	pub const EMPTY: PageTableEntry = PageTableEntry(0);

	pub fn new(mfn: Mfn, flags: PteFlags) -> Self {
		debug_assert!(!mfn.is_invalid());
		PageTableEntry(((mfn.as_u64() << PAGE_SHIFT) & PTE_ADDR_MASK) | flags.bits())
	}

	pub fn is_present(self) -> bool {
		self.flags().contains(PteFlags::PRESENT)
	}

	pub fn is_large(self) -> bool {
		self.flags().contains(PteFlags::PSE)
	}

	pub fn mfn(self) -> Mfn {
		if self.is_present() {
			Mfn::new((self.0 & PTE_ADDR_MASK) >> PAGE_SHIFT)
		} else {
			Mfn::INVALID
		}
	}

	pub fn flags(self) -> PteFlags {
		PteFlags::from_bits_truncate(self.0)
	}

	pub fn raw(self) -> u64 {
		self.0
	}
}

impl fmt::Debug for PageTableEntry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "PageTableEntry({:#x})", self.0)
	}
}

/// Table index of `va` at `level`; levels are counted the hardware way,
/// L4 being the PML4 and L1 the PT.
#[inline]
pub fn table_index(va: VirtAddr, level: usize) -> usize {
	debug_assert!((1..=4).contains(&level));
	(va.as_u64() as usize >> PAGE_SHIFT >> ((level - 1) * PAGE_MAP_BITS)) & PAGE_MAP_MASK
}

/// The level at which a page of the given order is mapped.
#[inline]
pub fn order_to_level(order: usize) -> usize {
	match order {
		PAGE_ORDER_4K => 1,
		PAGE_ORDER_2M => 2,
		PAGE_ORDER_1G => 3,
		_ => panic!("No page-table level maps order {order}"),
	}
}

/// Default leaf flags for a mapping of the given order.
pub fn order_to_flags(order: usize) -> PteFlags {
	if order == PAGE_ORDER_4K {
		L1_PROT
	} else {
		L1_PROT | PteFlags::PSE
	}
}

#[cfg(target_os = "none")]
pub use self::hw::*;

#[cfg(target_os = "none")]
mod hw {
	use core::cell::UnsafeCell;
	use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

	use hermit_sync::InterruptSpinMutex;

	use super::*;
	use crate::config::VIRT_KERNEL_BASE;
	use crate::errno::Errno;
	use crate::mm::physicalmem::{self, FrameFlags};
	use crate::mm::{order_to_size, PAGE_SIZE_2M};

	/// Serializes every page-table mutation.
	static VMAP_LOCK: InterruptSpinMutex<()> = InterruptSpinMutex::new(());

	/// Root table of the final hierarchy; `u64::MAX` until allocated.
	/// Also consumed by the AP trampoline.
	static CR3_ROOT: AtomicU64 = AtomicU64::new(u64::MAX);

	/// PTE through which the scratch window is re-pointed.
	static SCRATCH_PTE: AtomicPtr<PageTableEntry> = AtomicPtr::new(core::ptr::null_mut());

	#[repr(C, align(4096))]
	struct ReservedPage(UnsafeCell<[u8; PAGE_SIZE]>);

	// The page content is never read as data; the VA is only ever an alias
	// for the table frame currently mapped through it.
	unsafe impl Sync for ReservedPage {}

	/// The statically reserved scratch page.
	static SCRATCH_WINDOW: ReservedPage = ReservedPage(UnsafeCell::new([0; PAGE_SIZE]));

	#[repr(C, align(4096))]
	struct StaticTable(UnsafeCell<[PageTableEntry; PT_ENTRIES]>);

	unsafe impl Sync for StaticTable {}

	impl StaticTable {
		const fn new() -> Self {
			StaticTable(UnsafeCell::new([PageTableEntry::EMPTY; PT_ENTRIES]))
		}

		fn ptr(&self) -> *mut PageTableEntry {
			self.0.get().cast()
		}
	}

	/// The L1 table that carries the scratch PTE. It lives in the image so
	/// that the boot tables and the final tables can share it.
	static SCRATCH_L1: StaticTable = StaticTable::new();

	extern "C" {
		/// L2 table of the boot hierarchy covering the kernel window.
		static mut boot_pd_kern: [PageTableEntry; PT_ENTRIES];
	}

	fn scratch_va() -> VirtAddr {
		VirtAddr::from_ptr(SCRATCH_WINDOW.0.get())
	}

	/// Translates an image symbol's virtual address to its load address.
	fn image_virt_to_phys(va: VirtAddr) -> PhysAddr {
		PhysAddr::new(va.as_u64() - VIRT_KERNEL_BASE)
	}

	#[inline]
	fn flush_tlb() {
		use x86_64::registers::control::Cr3;
		// Reloading CR3 drops every non-global translation.
		let (frame, cr3_flags) = Cr3::read();
		unsafe {
			Cr3::write(frame, cr3_flags);
		}
	}

	/// Re-points the scratch window at `mfn` and returns the window VA.
	///
	/// Callers must hold `VMAP_LOCK`.
	fn scratch_map(mfn: Mfn) -> *mut PageTableEntry {
		assert!(!mfn.is_invalid());
		let pte = SCRATCH_PTE.load(Ordering::Relaxed);
		assert!(!pte.is_null(), "Scratch window is not wired up yet");
		unsafe {
			pte.write(PageTableEntry::new(mfn, L1_PROT | PteFlags::NO_EXECUTE));
		}
		flush_tlb();
		scratch_va().as_mut_ptr()
	}

	/// Allocates and zeroes a fresh page-table frame.
	fn alloc_table_frame() -> Mfn {
		let mfn = physicalmem::get_free_frames(PAGE_ORDER_4K)
			.expect("Out of 4 KiB frames for page tables");
		physicalmem::update_flags(
			mfn,
			PAGE_ORDER_4K,
			FrameFlags::PAGETABLE,
			FrameFlags::empty(),
		);
		let table = scratch_map(mfn);
		unsafe {
			core::ptr::write_bytes(table, 0, PT_ENTRIES);
		}
		mfn
	}

	fn cr3_mfn() -> Mfn {
		let raw = CR3_ROOT.load(Ordering::Relaxed);
		if raw != u64::MAX {
			return Mfn::new(raw);
		}
		let mfn = alloc_table_frame();
		CR3_ROOT.store(mfn.as_u64(), Ordering::Relaxed);
		mfn
	}

	/// Physical address to be loaded into CR3 (BSP switch and AP boot).
	pub fn root_table_paddr() -> PhysAddr {
		Mfn::new(CR3_ROOT.load(Ordering::Relaxed)).to_paddr()
	}

	/// Returns the MFN stored at `index` of the table frame `tab_mfn`,
	/// allocating and linking a fresh table when the slot is empty.
	fn get_pgentry_mfn(tab_mfn: Mfn, index: usize) -> Mfn {
		let tab = scratch_map(tab_mfn);
		let entry = unsafe { tab.add(index).read() };
		if entry.is_present() {
			assert!(
				!entry.is_large(),
				"Walking into a large-page entry as if it were a table"
			);
			return entry.mfn();
		}

		let new_mfn = alloc_table_frame();
		// alloc_table_frame re-pointed the window; map the parent again.
		let tab = scratch_map(tab_mfn);
		unsafe {
			tab.add(index)
				.write(PageTableEntry::new(new_mfn, TABLE_PROT));
		}
		new_mfn
	}

	/// Installs a translation for `va`.
	///
	/// Intermediate tables are created on demand. `Mfn::INVALID` clears
	/// the leaf entry instead (see [`vunmap`]).
	pub fn vmap(va: VirtAddr, mfn: Mfn, order: usize, flags: PteFlags) -> Result<VirtAddr, Errno> {
		if va.as_u64() % order_to_size(order) as u64 != 0 {
			return Err(Errno::Inval);
		}
		let target_level = order_to_level(order);

		let _guard = VMAP_LOCK.lock();

		let mut tab_mfn = cr3_mfn();
		for level in ((target_level + 1)..=4).rev() {
			tab_mfn = get_pgentry_mfn(tab_mfn, table_index(va, level));
		}

		let tab = scratch_map(tab_mfn);
		let slot = unsafe { tab.add(table_index(va, target_level)) };
		if mfn.is_invalid() {
			unsafe { slot.write(PageTableEntry::EMPTY) };
		} else {
			let extra = if order == PAGE_ORDER_4K {
				PteFlags::empty()
			} else {
				PteFlags::PSE
			};
			unsafe { slot.write(PageTableEntry::new(mfn, flags | extra)) };
		}
		flush_tlb();

		Ok(va)
	}

	/// Removes the translation for `va`.
	pub fn vunmap(va: VirtAddr, order: usize) -> Result<VirtAddr, Errno> {
		vmap(va, Mfn::INVALID, order, PteFlags::empty())
	}

	/// Walks the live tables for `va` and returns `(mfn, order, flags)` of
	/// the mapping, if present.
	pub fn walk(va: VirtAddr) -> Option<(Mfn, usize, PteFlags)> {
		let _guard = VMAP_LOCK.lock();

		let raw = CR3_ROOT.load(Ordering::Relaxed);
		if raw == u64::MAX {
			return None;
		}

		let mut tab_mfn = Mfn::new(raw);
		for level in (1..=4).rev() {
			let tab = scratch_map(tab_mfn);
			let entry = unsafe { tab.add(table_index(va, level)).read() };
			if !entry.is_present() {
				return None;
			}
			match level {
				3 if entry.is_large() => {
					return Some((entry.mfn(), PAGE_ORDER_1G, entry.flags()));
				}
				2 if entry.is_large() => {
					return Some((entry.mfn(), PAGE_ORDER_2M, entry.flags()));
				}
				1 => return Some((entry.mfn(), PAGE_ORDER_4K, entry.flags())),
				_ => tab_mfn = entry.mfn(),
			}
		}
		unreachable!()
	}

	/// Translates a mapped virtual address to its physical address.
	pub fn virt_to_paddr(va: VirtAddr) -> Option<PhysAddr> {
		let (mfn, order, _) = walk(va)?;
		let offset = va.as_u64() & (order_to_size(order) as u64 - 1);
		Some(PhysAddr::new(mfn.to_paddr().as_u64() + offset))
	}

	/// Wires up the scratch window inside the *boot* hierarchy.
	///
	/// The 2 MiB region around the scratch page is re-described at 4 KiB
	/// granularity in `SCRATCH_L1`, and the boot L2 slot is re-pointed at
	/// that table. From here on `vmap` works.
	pub fn init() {
		let scratch = scratch_va();
		let region = VirtAddr::new(scratch.as_u64() & !(PAGE_SIZE_2M as u64 - 1));

		let l1 = SCRATCH_L1.ptr();
		for i in 0..PT_ENTRIES {
			let page_va = VirtAddr::new(region.as_u64() + (i * PAGE_SIZE) as u64);
			let paddr = image_virt_to_phys(page_va);
			// Keep the permissive boot protections: the region being
			// re-described 4 KiB-wise usually contains the running text.
			unsafe {
				l1.add(i)
					.write(PageTableEntry::new(Mfn::from_paddr(paddr), L1_PROT));
			}
		}

		let l1_mfn = Mfn::from_paddr(image_virt_to_phys(VirtAddr::from_ptr(l1)));
		unsafe {
			let pd = &raw mut boot_pd_kern;
			(*pd)[table_index(region, 2)] = PageTableEntry::new(l1_mfn, TABLE_PROT);
		}

		SCRATCH_PTE.store(
			unsafe { l1.add(table_index(scratch, 1)) },
			Ordering::Relaxed,
		);
		flush_tlb();
	}

	/// Pre-seeds the final hierarchy so that it reuses `SCRATCH_L1` for
	/// the 2 MiB region around the scratch page. The slot must be claimed
	/// before any other mapping touches that region, otherwise a fresh L1
	/// would shadow the window and the CR3 switch would strand it.
	pub fn adopt_scratch_table() {
		let scratch = scratch_va();
		let region = VirtAddr::new(scratch.as_u64() & !(PAGE_SIZE_2M as u64 - 1));
		let l1_mfn = Mfn::from_paddr(image_virt_to_phys(VirtAddr::from_ptr(SCRATCH_L1.ptr())));

		let _guard = VMAP_LOCK.lock();
		let mut tab_mfn = cr3_mfn();
		for level in [4, 3] {
			tab_mfn = get_pgentry_mfn(tab_mfn, table_index(region, level));
		}
		let tab = scratch_map(tab_mfn);
		unsafe {
			tab.add(table_index(region, 2))
				.write(PageTableEntry::new(l1_mfn, TABLE_PROT));
		}
	}

	/// Loads the final hierarchy into CR3.
	pub fn switch_to_final_tables() {
		use x86_64::registers::control::{Cr3, Cr3Flags};
		use x86_64::structures::paging::PhysFrame;

		let paddr = root_table_paddr();
		let frame = PhysFrame::from_start_address(x86_64::PhysAddr::new(paddr.as_u64())).unwrap();
		unsafe {
			Cr3::write(frame, Cr3Flags::empty());
		}
		info!("Switched to final page tables (CR3 {:#x})", paddr.as_u64());
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn pgentry_round_trip() {
		let mfn = Mfn::new(0x1_2345);
		let entry = PageTableEntry::new(mfn, L1_PROT);
		assert!(entry.is_present());
		assert_eq!(entry.mfn(), mfn);
		assert_eq!(entry.flags(), L1_PROT);
		assert_eq!(PageTableEntry::new(entry.mfn(), entry.flags()), entry);
	}

	#[test]
	fn absent_entry_yields_invalid_mfn() {
		assert!(PageTableEntry::EMPTY.mfn().is_invalid());
		assert!(!PageTableEntry::EMPTY.is_present());
	}

	#[test]
	fn large_bit_is_per_level() {
		let entry = PageTableEntry::new(Mfn::new(0x200), L1_PROT | PteFlags::PSE);
		assert!(entry.is_large());
		assert_eq!(order_to_flags(PAGE_ORDER_2M), L1_PROT | PteFlags::PSE);
		assert_eq!(order_to_flags(PAGE_ORDER_4K), L1_PROT);
	}

	#[test]
	fn table_indices_split_the_address() {
		let va = VirtAddr::new(0xffff_ffff_8010_3000);
		assert_eq!(table_index(va, 4), 511);
		assert_eq!(table_index(va, 3), 510);
		assert_eq!(table_index(va, 2), 0);
		assert_eq!(table_index(va, 1), 0x103);
	}

	#[test]
	fn levels_match_orders() {
		assert_eq!(order_to_level(PAGE_ORDER_4K), 1);
		assert_eq!(order_to_level(PAGE_ORDER_2M), 2);
		assert_eq!(order_to_level(PAGE_ORDER_1G), 3);
	}
}
