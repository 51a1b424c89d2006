//! Test-routine registry.
//!
//! The command line names tests; this registry maps the names to entry
//! functions. Real experiment bodies live outside the substrate and are
//! linked in through [`register`]; a built-in smoke entry keeps the
//! plumbing exercisable on a bare tree.

use hermit_sync::OnceCell;

use crate::scheduler::TaskFn;

/// One registered test routine.
#[derive(Clone, Copy)]
pub struct TestCase {
	pub name: &'static str,
	pub entry: TaskFn,
}

/// Experiment tables linked in from outside the substrate.
static EXTERNAL: OnceCell<&'static [TestCase]> = OnceCell::new();

/// Hands an experiment table to the dispatcher. May be called once.
pub fn register(cases: &'static [TestCase]) {
	EXTERNAL.set(cases).ok();
}

/// Built-in entries that only exercise the substrate itself.
static BUILTIN: [TestCase; 1] = [TestCase {
	name: "unit_tests",
	entry: unit_tests,
}];

/// Resolves a test name. The returned record carries the static name
/// the task keeps for its lifetime.
pub fn lookup(name: &str) -> Option<TestCase> {
	BUILTIN
		.iter()
		.chain(EXTERNAL.get().copied().unwrap_or(&[]).iter())
		.find(|case| case.name == name)
		.copied()
}

/// Smoke checks of the kernel plumbing a freshly booted machine can
/// always run.
fn unit_tests(_arg: usize) -> u64 {
	use crate::collections::Bitmap;
	use crate::synch::semaphore::Semaphore;

	println!("Let the unit tests begin");

	let mut map = Bitmap::new(128).expect("bitmap allocation");
	map.set_bit(77);
	assert!(map.test_bit(77));
	assert_eq!(map.first_set(), Some(77));
	map.clear_bit(77);
	assert_eq!(map.first_set(), None);

	let sem = Semaphore::new(1);
	assert!(sem.try_wait());
	assert!(!sem.try_wait());
	sem.post();
	assert!(sem.try_wait());

	let parsed = crate::env::parse("boolean=1 booleantwo=on");
	// Unknown keys parse cleanly and leave the defaults alone.
	assert!(parsed.keyboard);

	#[cfg(target_os = "none")]
	{
		use crate::arch::x86_64::kernel::apic::MSR_APIC_BASE;
		use crate::arch::x86_64::kernel::processor::rdmsr_safe;

		// A bogus MSR must report failure instead of faulting the CPU.
		assert!(rdmsr_safe(0xdead_beef).is_err());
		assert!(rdmsr_safe(MSR_APIC_BASE).is_ok());
	}

	0
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn builtin_lookup_resolves() {
		assert!(lookup("unit_tests").is_some());
		assert!(lookup("no_such_test").is_none());
	}

	#[test]
	fn builtin_smoke_entry_passes() {
		assert_eq!(unit_tests(0), 0);
	}
}
