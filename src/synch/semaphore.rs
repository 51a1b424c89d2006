//! A counting, spinning semaphore.
//!
//! Tasks have no blocking primitives; a waiter burns its CPU until units
//! arrive. That is the deliberate contract of the cooperative model, so
//! the wait loop only inserts pause hints.

use core::sync::atomic::{AtomicIsize, Ordering};

use crossbeam_utils::Backoff;

/// A counting semaphore.
///
/// The counter may be initialized negative to demand that many `post`s
/// before the first `wait` gets through.
pub struct Semaphore {
	count: AtomicIsize,
}

impl Semaphore {
	pub const fn new(count: isize) -> Self {
		Self {
			count: AtomicIsize::new(count),
		}
	}

	/// Takes one unit without waiting. `false` when none is available.
	pub fn try_wait(&self) -> bool {
		self.try_wait_units(1)
	}

	/// Takes `units` at once without waiting.
	pub fn try_wait_units(&self, units: isize) -> bool {
		assert!(units > 0);
		let mut current = self.count.load(Ordering::Acquire);
		loop {
			if current < units {
				return false;
			}
			match self.count.compare_exchange_weak(
				current,
				current - units,
				Ordering::AcqRel,
				Ordering::Acquire,
			) {
				Ok(_) => return true,
				Err(seen) => current = seen,
			}
		}
	}

	/// Spins until one unit is available.
	pub fn wait(&self) {
		self.wait_units(1);
	}

	/// Spins until `units` can be taken at once.
	pub fn wait_units(&self, units: isize) {
		let backoff = Backoff::new();
		while !self.try_wait_units(units) {
			backoff.spin();
		}
	}

	/// Releases one unit.
	pub fn post(&self) {
		self.post_units(1);
	}

	/// Releases `units` at once.
	pub fn post_units(&self, units: isize) {
		assert!(units > 0);
		self.count.fetch_add(units, Ordering::AcqRel);
	}

	pub fn value(&self) -> isize {
		self.count.load(Ordering::Acquire)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn try_wait_respects_the_count() {
		let sem = Semaphore::new(2);
		assert!(sem.try_wait());
		assert!(sem.try_wait());
		assert!(!sem.try_wait());
		sem.post();
		assert!(sem.try_wait());
	}

	#[test]
	fn unit_batches_are_all_or_nothing() {
		let sem = Semaphore::new(3);
		assert!(!sem.try_wait_units(4));
		assert_eq!(sem.value(), 3);
		assert!(sem.try_wait_units(3));
		assert_eq!(sem.value(), 0);
		sem.post_units(5);
		assert_eq!(sem.value(), 5);
	}

	#[test]
	fn negative_start_demands_posts() {
		let sem = Semaphore::new(-1);
		assert!(!sem.try_wait());
		sem.post();
		assert!(!sem.try_wait());
		sem.post();
		assert!(sem.try_wait());
	}
}
