//! Address-to-name lookup for backtraces.
//!
//! The symbol table itself is produced outside the kernel (a build step
//! embedding a sorted map); the kernel only consumes it. Without a
//! registered table every lookup misses, which cleanly terminates the
//! backtrace walk.

use hermit_sync::OnceCell;

/// One function symbol: `[start, end)` and its name.
#[derive(Clone, Copy, Debug)]
pub struct Symbol {
	pub start: u64,
	pub end: u64,
	pub name: &'static str,
}

static SYMBOLS: OnceCell<&'static [Symbol]> = OnceCell::new();

/// Hands the embedded symbol table to the kernel. May be called once.
pub fn register(table: &'static [Symbol]) {
	SYMBOLS.set(table).ok();
}

/// Resolves `addr` to the symbol covering it.
pub fn lookup(addr: u64) -> Option<&'static str> {
	SYMBOLS
		.get()?
		.iter()
		.find(|sym| addr >= sym.start && addr < sym.end)
		.map(|sym| sym.name)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn unknown_without_a_table() {
		// Lookups before registration must miss, not panic.
		assert_eq!(lookup(0xffff_ffff_8010_0000), None);
	}
}
