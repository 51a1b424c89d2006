//! Memory management.
//!
//! The physical side hands out power-of-two frame runs (4 KiB, 2 MiB,
//! 1 GiB); the virtual side installs them into up to three address-space
//! windows. A small `talc`-backed heap sits on top for `alloc` consumers.

pub mod physicalmem;
pub mod regions;
pub mod virtualmem;

use memory_addresses::PhysAddr;

pub use self::physicalmem::{
	get_free_frames, get_free_frames_cond, put_free_frames, reclaim_frame,
};
pub use self::virtualmem::GfpFlags;
#[cfg(target_os = "none")]
pub use self::virtualmem::{get_free_pages, get_free_pages_top, put_pages};

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
pub const PAGE_MASK: u64 = !((PAGE_SIZE as u64) - 1);

/// Frame orders are powers of two over `PAGE_SIZE`. Only the three orders
/// backed by the paging hardware are ever allocated.
pub const PAGE_ORDER_4K: usize = 0;
pub const PAGE_ORDER_2M: usize = 9;
pub const PAGE_ORDER_1G: usize = 18;

pub const PAGE_SIZE_2M: usize = PAGE_SIZE << PAGE_ORDER_2M;
pub const PAGE_SIZE_1G: usize = PAGE_SIZE << PAGE_ORDER_1G;

#[inline]
pub const fn order_to_size(order: usize) -> usize {
	PAGE_SIZE << order
}

/// A machine frame number: a physical address shifted right by `PAGE_SHIFT`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[repr(transparent)]
pub struct Mfn(u64);

impl Mfn {
	/// Sentinel for "no frame". Page-table walks must never dereference it.
	pub const INVALID: Mfn = Mfn(u64::MAX);

	#[inline]
	pub const fn new(raw: u64) -> Self {
		Mfn(raw)
	}

	#[inline]
	pub const fn from_paddr(paddr: PhysAddr) -> Self {
		Mfn(paddr.as_u64() >> PAGE_SHIFT)
	}

	#[inline]
	pub const fn to_paddr(self) -> PhysAddr {
		PhysAddr::new(self.0 << PAGE_SHIFT)
	}

	#[inline]
	pub const fn as_u64(self) -> u64 {
		self.0
	}

	#[inline]
	pub const fn is_invalid(self) -> bool {
		self.0 == Self::INVALID.0
	}

	#[inline]
	pub const fn offset(self, frames: u64) -> Self {
		Mfn(self.0 + frames)
	}
}

impl core::fmt::Display for Mfn {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		write!(f, "{:#x}", self.0)
	}
}

mod allocator {
	use core::alloc::{GlobalAlloc, Layout};
	use core::ptr;

	use hermit_sync::InterruptSpinMutex;
	use talc::{ErrOnOom, Span, Talc};

	/// The global kernel heap: `talc` behind one spin lock, fed a single
	/// arena carved from the frame allocator during bring-up.
	pub struct LockedHeap(InterruptSpinMutex<Talc<ErrOnOom>>);

	impl LockedHeap {
		pub const fn new() -> Self {
			Self(InterruptSpinMutex::new(Talc::new(ErrOnOom)))
		}

		pub unsafe fn claim(&self, base: *mut u8, size: usize) {
			unsafe {
				self.0
					.lock()
					.claim(Span::from_base_size(base, size))
					.expect("Cannot claim the kernel heap arena");
			}
		}
	}

	unsafe impl GlobalAlloc for LockedHeap {
		unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
			unsafe { self.0.lock().malloc(layout) }
				.map_or(ptr::null_mut(), |nn| nn.as_ptr())
		}

		unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
			if let Some(nn) = ptr::NonNull::new(ptr) {
				unsafe { self.0.lock().free(nn, layout) }
			}
		}
	}
}

#[cfg_attr(target_os = "none", global_allocator)]
static ALLOCATOR: allocator::LockedHeap = allocator::LockedHeap::new();

/// Size of the arena backing the `alloc` heap (one 2 MiB frame).
const HEAP_SIZE: usize = PAGE_SIZE_2M;

/// Brings up the kernel heap.
///
/// The final page tables must already be live: the heap arena is reached
/// through the kernel window.
#[cfg(target_os = "none")]
pub fn init_heap() {
	let va = get_free_pages(PAGE_ORDER_2M, GfpFlags::KERNEL)
		.expect("Cannot allocate the kernel heap arena");

	unsafe {
		ALLOCATOR.claim(va.as_mut_ptr::<u8>(), HEAP_SIZE);
	}

	info!("Kernel heap: {} KiB at {:p}", HEAP_SIZE >> 10, va);
}

pub fn print_information() {
	physicalmem::print_information();
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn mfn_paddr_round_trip() {
		let pa = PhysAddr::new(0x0123_4567_8000);
		assert_eq!(Mfn::from_paddr(pa).to_paddr(), pa);

		// Sub-page offsets are truncated to the page boundary.
		let unaligned = PhysAddr::new(0x0123_4567_8abc);
		assert_eq!(
			Mfn::from_paddr(unaligned).to_paddr().as_u64(),
			unaligned.as_u64() & PAGE_MASK
		);
	}

	#[test]
	fn orders_match_hardware_sizes() {
		assert_eq!(order_to_size(PAGE_ORDER_4K), 4096);
		assert_eq!(order_to_size(PAGE_ORDER_2M), 2 * 1024 * 1024);
		assert_eq!(order_to_size(PAGE_ORDER_1G), 1024 * 1024 * 1024);
	}
}
