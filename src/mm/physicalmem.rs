//! Physical frame allocator.
//!
//! Owns every frame of physical memory that is not claimed by a kernel
//! section. Frames are kept in one fixed arena; the per-order free and
//! busy lists are index-linked so that no allocation is needed to manage
//! them across interrupt boundaries.

use core::ops::Range;
use core::sync::atomic::{AtomicUsize, Ordering};

use hermit_sync::InterruptSpinMutex;
use memory_addresses::PhysAddr;

use crate::mm::{order_to_size, Mfn, PAGE_ORDER_1G, PAGE_ORDER_2M, PAGE_ORDER_4K, PAGE_SIZE};

bitflags::bitflags! {
	#[derive(Clone, Copy, PartialEq, Eq, Debug)]
	pub struct FrameFlags: u32 {
		/// The frame sits on a free list.
		const FREE = 1 << 0;
		/// The frame is installed in at least one address-space window.
		const MAPPED = 1 << 1;
		/// The frame must be mapped with caching disabled.
		const UNCACHEABLE = 1 << 2;
		/// The frame backs a page table.
		const PAGETABLE = 1 << 3;
	}
}

/// The frame orders the allocator manages, ascending.
pub const ORDERS: [usize; 3] = [PAGE_ORDER_4K, PAGE_ORDER_2M, PAGE_ORDER_1G];

/// Arena capacity. Sized like the original static pool: enough for the
/// canonical carve of tens of GiB of RAM.
const MAX_FRAMES: usize = 8192;

const NO_FRAME: u32 = u32::MAX;

/// Read-only view of a frame handed to `get_free_frames_cond` predicates.
#[derive(Clone, Copy, Debug)]
pub struct FrameInfo {
	pub mfn: Mfn,
	pub order: usize,
	pub refcount: u32,
	pub flags: FrameFlags,
}

#[derive(Clone, Copy)]
struct Frame {
	mfn: Mfn,
	order: u32,
	refcount: u32,
	flags: FrameFlags,
	prev: u32,
	next: u32,
}

impl Frame {
	const UNUSED: Frame = Frame {
		mfn: Mfn::INVALID,
		order: 0,
		refcount: 0,
		flags: FrameFlags::empty(),
		prev: NO_FRAME,
		next: NO_FRAME,
	};
}

#[derive(Clone, Copy)]
struct FrameList {
	head: u32,
	tail: u32,
	count: usize,
}

impl FrameList {
	const EMPTY: FrameList = FrameList {
		head: NO_FRAME,
		tail: NO_FRAME,
		count: 0,
	};
}

fn order_slot(order: usize) -> Option<usize> {
	ORDERS.iter().position(|&o| o == order)
}

pub struct FrameAllocator {
	frames: [Frame; MAX_FRAMES],
	used: usize,
	free: [FrameList; ORDERS.len()],
	busy: [FrameList; ORDERS.len()],
	total_memory: usize,
}

impl FrameAllocator {
	pub const fn new() -> Self {
		Self {
			frames: [Frame::UNUSED; MAX_FRAMES],
			used: 0,
			free: [FrameList::EMPTY; ORDERS.len()],
			busy: [FrameList::EMPTY; ORDERS.len()],
			total_memory: 0,
		}
	}

	fn new_frame(&mut self, mfn: Mfn, order: usize) -> u32 {
		assert!(
			self.used < MAX_FRAMES,
			"Not enough arena entries for the frame allocator"
		);
		let idx = self.used as u32;
		self.used += 1;

		self.frames[idx as usize] = Frame {
			mfn,
			order: order as u32,
			refcount: 0,
			flags: FrameFlags::FREE,
			prev: NO_FRAME,
			next: NO_FRAME,
		};
		idx
	}

	fn unlink(&mut self, list: &mut FrameList, idx: u32) {
		let (prev, next) = {
			let frame = &self.frames[idx as usize];
			(frame.prev, frame.next)
		};

		if prev == NO_FRAME {
			list.head = next;
		} else {
			self.frames[prev as usize].next = next;
		}
		if next == NO_FRAME {
			list.tail = prev;
		} else {
			self.frames[next as usize].prev = prev;
		}

		self.frames[idx as usize].prev = NO_FRAME;
		self.frames[idx as usize].next = NO_FRAME;
		list.count -= 1;
	}

	fn push_front(&mut self, list: &mut FrameList, idx: u32) {
		self.frames[idx as usize].prev = NO_FRAME;
		self.frames[idx as usize].next = list.head;
		if list.head != NO_FRAME {
			self.frames[list.head as usize].prev = idx;
		} else {
			list.tail = idx;
		}
		list.head = idx;
		list.count += 1;
	}

	fn push_back(&mut self, list: &mut FrameList, idx: u32) {
		self.frames[idx as usize].next = NO_FRAME;
		self.frames[idx as usize].prev = list.tail;
		if list.tail != NO_FRAME {
			self.frames[list.tail as usize].next = idx;
		} else {
			list.head = idx;
		}
		list.tail = idx;
		list.count += 1;
	}

	fn add_free_frame(&mut self, mfn: Mfn, order: usize, front: bool) {
		let slot = order_slot(order).expect("Unsupported frame order");
		let idx = self.new_frame(mfn, order);
		let mut list = self.free[slot];
		if front {
			self.push_front(&mut list, idx);
		} else {
			self.push_back(&mut list, idx);
		}
		self.free[slot] = list;
	}

	/// Carves one AVAILABLE physical range into the canonical frame
	/// sequence: 4 KiB frames up to the next 2 MiB boundary, 2 MiB frames
	/// up to the next 1 GiB boundary, all whole 1 GiB frames, then back
	/// down through 2 MiB and 4 KiB frames for the tail.
	///
	/// `early` ranges push their 4 KiB frames to the *front* of the free
	/// list: the initial mapping can only address 4 KiB frames before the
	/// final page tables exist and must find them first.
	pub fn add_memory_range(&mut self, range: Range<u64>, early: bool) {
		let size_2m = order_to_size(PAGE_ORDER_2M) as u64;
		let size_1g = order_to_size(PAGE_ORDER_1G) as u64;
		let page = PAGE_SIZE as u64;

		let mut cur = range.start;
		let end = range.end;

		// 4 KiB frames up to a 2 MiB boundary.
		while cur % size_2m != 0 && cur + page <= end {
			self.add_free_frame(Mfn::from_paddr(PhysAddr::new(cur)), PAGE_ORDER_4K, early);
			cur += page;
		}

		// 2 MiB frames up to a 1 GiB boundary.
		while cur % size_1g != 0 && cur + size_2m <= end {
			self.add_free_frame(Mfn::from_paddr(PhysAddr::new(cur)), PAGE_ORDER_2M, false);
			cur += size_2m;
		}

		// All whole 1 GiB frames.
		while cur + size_1g <= end {
			self.add_free_frame(Mfn::from_paddr(PhysAddr::new(cur)), PAGE_ORDER_1G, false);
			cur += size_1g;
		}

		// Remaining 2 MiB frames of the tail.
		while cur + size_2m <= end {
			self.add_free_frame(Mfn::from_paddr(PhysAddr::new(cur)), PAGE_ORDER_2M, false);
			cur += size_2m;
		}

		// Remaining 4 KiB frames of the tail.
		while cur + page <= end {
			self.add_free_frame(Mfn::from_paddr(PhysAddr::new(cur)), PAGE_ORDER_4K, false);
			cur += page;
		}

		self.total_memory += (end - range.start) as usize;
	}

	fn reserve(&mut self, slot: usize, idx: u32) -> Mfn {
		let mut list = self.free[slot];
		self.unlink(&mut list, idx);
		self.free[slot] = list;

		let frame = &mut self.frames[idx as usize];
		frame.refcount += 1;
		frame.flags.remove(FrameFlags::FREE);
		let mfn = frame.mfn;

		let mut list = self.busy[slot];
		self.push_front(&mut list, idx);
		self.busy[slot] = list;
		mfn
	}

	/// Takes the head of the free list at `order`. No splitting is
	/// performed; the call fails iff that list is empty.
	pub fn get_free_frames(&mut self, order: usize) -> Option<Mfn> {
		let slot = order_slot(order)?;
		let idx = self.free[slot].head;
		if idx == NO_FRAME {
			return None;
		}
		Some(self.reserve(slot, idx))
	}

	/// Returns the first free frame, scanned low order to high, for which
	/// `pred` holds.
	pub fn get_free_frames_cond(
		&mut self,
		pred: impl Fn(FrameInfo) -> bool,
	) -> Option<(Mfn, usize)> {
		for slot in 0..ORDERS.len() {
			let mut idx = self.free[slot].head;
			while idx != NO_FRAME {
				let frame = &self.frames[idx as usize];
				let info = FrameInfo {
					mfn: frame.mfn,
					order: frame.order as usize,
					refcount: frame.refcount,
					flags: frame.flags,
				};
				if pred(info) {
					return Some((self.reserve(slot, idx), ORDERS[slot]));
				}
				idx = frame.next;
			}
		}
		None
	}

	fn find_busy(&self, slot: usize, mfn: Mfn) -> Option<u32> {
		let mut idx = self.busy[slot].head;
		while idx != NO_FRAME {
			if self.frames[idx as usize].mfn == mfn {
				return Some(idx);
			}
			idx = self.frames[idx as usize].next;
		}
		None
	}

	/// Drops one reference on a busy frame, returning it to the free list
	/// when the last reference goes away.
	pub fn put_free_frames(&mut self, mfn: Mfn, order: usize) {
		let slot = order_slot(order).expect("Unsupported frame order");
		let idx = self
			.find_busy(slot, mfn)
			.unwrap_or_else(|| panic!("Returning frame {mfn} (order {order}) that is not busy"));

		let frame = &mut self.frames[idx as usize];
		frame.refcount -= 1;
		if frame.refcount > 0 {
			return;
		}
		frame.flags = FrameFlags::FREE;

		let mut list = self.busy[slot];
		self.unlink(&mut list, idx);
		self.busy[slot] = list;

		let mut list = self.free[slot];
		self.push_front(&mut list, idx);
		self.free[slot] = list;
	}

	/// Hands a never-allocated frame (for example a reclaimed init-section
	/// page) to the allocator.
	pub fn reclaim_frame(&mut self, mfn: Mfn, order: usize) {
		self.add_free_frame(mfn, order, false);
		self.total_memory += order_to_size(order);
	}

	/// Adjusts the flags of a busy frame. Returns `false` when the frame
	/// is not busy at that order.
	pub fn update_flags(
		&mut self,
		mfn: Mfn,
		order: usize,
		set: FrameFlags,
		clear: FrameFlags,
	) -> bool {
		let Some(slot) = order_slot(order) else {
			return false;
		};
		let Some(idx) = self.find_busy(slot, mfn) else {
			return false;
		};
		let frame = &mut self.frames[idx as usize];
		frame.flags.insert(set);
		frame.flags.remove(clear);
		true
	}

	pub fn free_count(&self, order: usize) -> usize {
		order_slot(order).map_or(0, |slot| self.free[slot].count)
	}

	pub fn busy_count(&self, order: usize) -> usize {
		order_slot(order).map_or(0, |slot| self.busy[slot].count)
	}

	pub fn total_memory(&self) -> usize {
		self.total_memory
	}
}

static PHYSICAL_ALLOCATOR: InterruptSpinMutex<FrameAllocator> =
	InterruptSpinMutex::new(FrameAllocator::new());

/// Total bytes under allocator control; filled once by `init`.
pub static TOTAL_MEMORY: AtomicUsize = AtomicUsize::new(0);

pub fn total_memory_size() -> usize {
	TOTAL_MEMORY.load(Ordering::Relaxed)
}

pub fn get_free_frames(order: usize) -> Option<Mfn> {
	PHYSICAL_ALLOCATOR.lock().get_free_frames(order)
}

pub fn get_free_frames_cond(pred: impl Fn(FrameInfo) -> bool) -> Option<(Mfn, usize)> {
	PHYSICAL_ALLOCATOR.lock().get_free_frames_cond(pred)
}

pub fn put_free_frames(mfn: Mfn, order: usize) {
	PHYSICAL_ALLOCATOR.lock().put_free_frames(mfn, order);
}

pub fn reclaim_frame(mfn: Mfn, order: usize) {
	PHYSICAL_ALLOCATOR.lock().reclaim_frame(mfn, order);
}

pub fn update_flags(mfn: Mfn, order: usize, set: FrameFlags, clear: FrameFlags) -> bool {
	PHYSICAL_ALLOCATOR.lock().update_flags(mfn, order, set, clear)
}

/// Populates the allocator from the loader-supplied memory map.
///
/// Every AVAILABLE range above the legacy low megabyte contributes frames;
/// the start of a range is advanced past the physical memory the kernel
/// image already occupies.
#[cfg(target_os = "none")]
pub fn init() {
	use crate::arch::x86_64::kernel::multiboot;
	use crate::mm::regions;

	info!("Initialize physical memory manager");

	let mut allocator = PHYSICAL_ALLOCATOR.lock();
	for (index, range) in multiboot::available_memory_ranges().enumerate() {
		// The low megabyte keeps its firmware structures (EBDA, trampoline).
		if range.end <= 0x10_0000 {
			continue;
		}

		let mut start = range.start.max(0x10_0000);
		while regions::in_kernel_section(PhysAddr::new(start)) {
			start += PAGE_SIZE as u64;
		}
		if start >= range.end {
			continue;
		}

		// The first usable ranges feed the early 4 KiB mappings and go to
		// the front of the free list.
		allocator.add_memory_range(start..range.end, index <= 1);
	}

	TOTAL_MEMORY.store(allocator.total_memory(), Ordering::Relaxed);

	info!(
		"Available memory: {} MiB",
		allocator.total_memory() >> 20
	);
	for order in ORDERS {
		let count = allocator.free_count(order);
		if count > 0 {
			info!("  {:4} KiB frames: {}", order_to_size(order) >> 10, count);
		}
	}
}

pub fn print_information() {
	let allocator = PHYSICAL_ALLOCATOR.lock();
	info!(
		"Physical memory: {} MiB total, free frames {}/{}/{}",
		allocator.total_memory() >> 20,
		allocator.free_count(PAGE_ORDER_4K),
		allocator.free_count(PAGE_ORDER_2M),
		allocator.free_count(PAGE_ORDER_1G),
	);
}

#[cfg(test)]
mod tests {
	use super::*;

	const MIB: u64 = 1024 * 1024;
	const GIB: u64 = 1024 * MIB;

	#[test]
	fn carve_aligns_up_then_down() {
		let mut allocator = FrameAllocator::new();
		// 0x1ff000 .. 0x4020_0000: a 4 KiB head, a 2 MiB run up to 1 GiB
		// would not fit, so expect 4 KiB + 2 MiB frames only.
		allocator.add_memory_range(0x1f_f000..0x4020_0000, true);

		assert_eq!(allocator.free_count(PAGE_ORDER_4K), 1);
		assert_eq!(allocator.free_count(PAGE_ORDER_1G), 0);
		assert_eq!(
			allocator.free_count(PAGE_ORDER_2M),
			(0x4020_0000 - 0x20_0000) / (2 * MIB as usize)
		);
	}

	#[test]
	fn carve_produces_gig_frames_in_the_middle() {
		let mut allocator = FrameAllocator::new();
		// 2 MiB .. 3 GiB + 2 MiB + 4 KiB.
		let start = 2 * MIB;
		let end = 3 * GIB + 2 * MIB + 0x1000;
		allocator.add_memory_range(start..end, false);

		assert_eq!(allocator.free_count(PAGE_ORDER_1G), 2);
		assert_eq!(allocator.free_count(PAGE_ORDER_4K), 1);
		// 2 MiB frames: from 2 MiB up to 1 GiB, plus one tail frame.
		assert_eq!(
			allocator.free_count(PAGE_ORDER_2M),
			((GIB - start) / (2 * MIB)) as usize + 1
		);
	}

	#[test]
	fn early_frames_go_to_the_front() {
		let mut allocator = FrameAllocator::new();
		allocator.add_memory_range(0x20_1000..0x20_3000, false);
		allocator.add_memory_range(0x10_0000..0x10_2000, true);

		// The early range was added last but must be allocated first.
		let first = allocator.get_free_frames(PAGE_ORDER_4K).unwrap();
		assert_eq!(first.to_paddr().as_u64(), 0x10_1000);
	}

	#[test]
	fn alloc_free_restores_list_membership() {
		let mut allocator = FrameAllocator::new();
		allocator.add_memory_range(0x20_0000..0x80_0000, false);
		let free_before = allocator.free_count(PAGE_ORDER_2M);

		let mfn = allocator.get_free_frames(PAGE_ORDER_2M).unwrap();
		assert_eq!(allocator.free_count(PAGE_ORDER_2M), free_before - 1);
		assert_eq!(allocator.busy_count(PAGE_ORDER_2M), 1);

		allocator.put_free_frames(mfn, PAGE_ORDER_2M);
		assert_eq!(allocator.free_count(PAGE_ORDER_2M), free_before);
		assert_eq!(allocator.busy_count(PAGE_ORDER_2M), 0);
	}

	#[test]
	fn empty_list_fails_without_splitting() {
		let mut allocator = FrameAllocator::new();
		allocator.add_memory_range(0x4000_0000..0x8000_0000, false);

		assert_eq!(allocator.free_count(PAGE_ORDER_1G), 1);
		assert!(allocator.get_free_frames(PAGE_ORDER_4K).is_none());
		assert!(allocator.get_free_frames(PAGE_ORDER_2M).is_none());
		assert!(allocator.get_free_frames(PAGE_ORDER_1G).is_some());
	}

	#[test]
	fn cond_search_scans_low_to_high() {
		let mut allocator = FrameAllocator::new();
		allocator.add_memory_range(0x20_0000..0x4000_0000, false);
		allocator.add_memory_range(0x4000_0000..0x8000_0000, false);

		// Any frame: the lowest order wins.
		let (_, order) = allocator.get_free_frames_cond(|_| true).unwrap();
		assert_eq!(order, PAGE_ORDER_2M);

		// Constrained to 1 GiB frames.
		let (mfn, order) = allocator
			.get_free_frames_cond(|f| f.order == PAGE_ORDER_1G)
			.unwrap();
		assert_eq!(order, PAGE_ORDER_1G);
		assert_eq!(mfn.to_paddr().as_u64(), 0x4000_0000);
	}

	#[test]
	fn refcounted_put_keeps_frame_busy() {
		let mut allocator = FrameAllocator::new();
		allocator.add_memory_range(0x20_0000..0x40_0000, false);

		let mfn = allocator.get_free_frames(PAGE_ORDER_2M).unwrap();
		assert!(allocator.update_flags(mfn, PAGE_ORDER_2M, FrameFlags::MAPPED, FrameFlags::empty()));

		// A second reference through the busy list.
		{
			let slot = order_slot(PAGE_ORDER_2M).unwrap();
			let idx = allocator.find_busy(slot, mfn).unwrap();
			allocator.frames[idx as usize].refcount += 1;
		}

		allocator.put_free_frames(mfn, PAGE_ORDER_2M);
		assert_eq!(allocator.busy_count(PAGE_ORDER_2M), 1);
		allocator.put_free_frames(mfn, PAGE_ORDER_2M);
		assert_eq!(allocator.busy_count(PAGE_ORDER_2M), 0);
	}

	#[test]
	#[should_panic(expected = "not busy")]
	fn returning_unknown_frame_panics() {
		let mut allocator = FrameAllocator::new();
		allocator.add_memory_range(0x20_0000..0x40_0000, false);
		allocator.put_free_frames(Mfn::new(0x123), PAGE_ORDER_2M);
	}

	#[test]
	fn reclaimed_frame_is_allocatable() {
		let mut allocator = FrameAllocator::new();
		allocator.reclaim_frame(Mfn::new(0x150), PAGE_ORDER_4K);
		assert_eq!(
			allocator.get_free_frames(PAGE_ORDER_4K),
			Some(Mfn::new(0x150))
		);
	}
}
