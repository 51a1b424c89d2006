//! Console fan-out.
//!
//! All kernel output funnels through one lock and one fixed formatting
//! buffer and is then replicated to every registered sink. Sinks are plain
//! function pointers so that output works before the heap exists.

use core::fmt;

use heapless::Vec;
use hermit_sync::InterruptTicketMutex;

use crate::config::{CONSOLE_BUFFER_SIZE, MAX_CONSOLE_SINKS};

/// A console sink receives every formatted chunk of kernel output.
pub type ConsoleSink = fn(&[u8]);

struct Console {
	sinks: Vec<ConsoleSink, MAX_CONSOLE_SINKS>,
	buffer: [u8; CONSOLE_BUFFER_SIZE],
	used: usize,
}

impl Console {
	const fn new() -> Self {
		Self {
			sinks: Vec::new(),
			buffer: [0; CONSOLE_BUFFER_SIZE],
			used: 0,
		}
	}

	fn flush(&mut self) {
		if self.used == 0 {
			return;
		}
		for sink in &self.sinks {
			sink(&self.buffer[..self.used]);
		}
		self.used = 0;
	}
}

impl fmt::Write for Console {
	fn write_str(&mut self, s: &str) -> fmt::Result {
		for &byte in s.as_bytes() {
			if self.used == self.buffer.len() {
				self.flush();
			}
			self.buffer[self.used] = byte;
			self.used += 1;
		}
		Ok(())
	}
}

static CONSOLE: InterruptTicketMutex<Console> = InterruptTicketMutex::new(Console::new());

/// Registers another output sink. Returns `false` when the fan-out is full.
pub fn register_sink(sink: ConsoleSink) -> bool {
	CONSOLE.lock().sinks.push(sink).is_ok()
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments<'_>) {
	use fmt::Write;

	let mut console = CONSOLE.lock();
	// Formatting into the fixed buffer cannot fail; overlong output is
	// flushed in chunks.
	console.write_fmt(args).ok();
	console.flush();
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn chunked_flush_preserves_order() {
		let mut console = Console::new();
		fn into_sink(_chunk: &[u8]) {}
		console.sinks.push(into_sink as ConsoleSink).unwrap();

		use core::fmt::Write;
		// Exceed the buffer to force intermediate flushes.
		for _ in 0..CONSOLE_BUFFER_SIZE {
			console.write_str("ab").unwrap();
		}
		console.flush();
		assert_eq!(console.used, 0);
	}
}
