//! COM port console sinks.
//!
//! The UARTs are driven through `uart_16550`; the non-default framing the
//! `comN=` command-line parameters allow (divisor, word length, parity,
//! stop bits) is programmed directly into the line-control registers,
//! which the crate does not expose.

use crate::env::parse_number;

pub const COM1_PORT: u16 = 0x3f8;
pub const COM2_PORT: u16 = 0x2f8;
pub const COM3_PORT: u16 = 0x3e8;
pub const COM4_PORT: u16 = 0x2e8;

pub const DEFAULT_BAUD: u32 = 115_200;

const UART_CLOCK: u32 = 115_200;

const VALID_BAUDS: [u32; 9] = [
	300, 1200, 2400, 4800, 9600, 19_200, 38_400, 57_600, 115_200,
];

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Parity {
	None = 0b000,
	Odd = 0b001,
	Even = 0b011,
	High = 0b101,
	Low = 0b111,
}

/// Framing and rate of one COM port.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ComConfig {
	pub port: u16,
	pub baud: u32,
	/// Word length in bits, 5 through 8.
	pub frame_size: u8,
	pub parity: Parity,
	/// 1 or 2.
	pub stop_bits: u8,
}

impl Default for ComConfig {
	fn default() -> Self {
		Self {
			port: COM1_PORT,
			baud: DEFAULT_BAUD,
			frame_size: 8,
			parity: Parity::None,
			stop_bits: 1,
		}
	}
}

impl ComConfig {
	/// Divisor latch value for the configured baud rate.
	pub fn divisor(&self) -> u16 {
		(UART_CLOCK / self.baud) as u16
	}

	/// Line-control register encoding of the framing.
	pub fn lcr(&self) -> u8 {
		let length = self.frame_size - 5;
		let stop = (self.stop_bits - 1) << 2;
		let parity = (self.parity as u8) << 3;
		length | stop | parity
	}
}

impl ComConfig {
	/// Parses a `port[,baud[,bits[,parity[,stop]]]]` parameter value.
	///
	/// Any invalid field rejects the whole value; the caller falls back
	/// to the defaults.
	pub fn parse(value: &str) -> Option<Self> {
		let mut fields = value.split(',');

		let port = match parse_number(fields.next()?)? {
			p @ 0x3f8 | p @ 0x2f8 | p @ 0x3e8 | p @ 0x2e8 => p as u16,
			_ => return None,
		};

		let mut config = ComConfig {
			port,
			..Default::default()
		};

		if let Some(baud) = fields.next().filter(|f| !f.is_empty()) {
			let baud = parse_number(baud)? as u32;
			if !VALID_BAUDS.contains(&baud) {
				return None;
			}
			config.baud = baud;
		}

		if let Some(bits) = fields.next().filter(|f| !f.is_empty()) {
			match parse_number(bits)? {
				b @ 5..=8 => config.frame_size = b as u8,
				_ => return None,
			}
		}

		if let Some(parity) = fields.next().filter(|f| !f.is_empty()) {
			config.parity = match parity {
				"n" => Parity::None,
				"o" => Parity::Odd,
				"e" => Parity::Even,
				"h" => Parity::High,
				"l" => Parity::Low,
				_ => return None,
			};
		}

		if let Some(stop) = fields.next().filter(|f| !f.is_empty()) {
			match parse_number(stop)? {
				s @ 1..=2 => config.stop_bits = s as u8,
				_ => return None,
			}
		}

		Some(config)
	}
}

#[cfg(target_os = "none")]
pub use self::hw::*;

#[cfg(target_os = "none")]
mod hw {
	use hermit_sync::InterruptSpinMutex;
	use x86_64::instructions::port::Port;

	use super::*;

	pub struct SerialPort {
		uart: uart_16550::SerialPort,
	}

	impl SerialPort {
		pub unsafe fn new(config: ComConfig) -> Self {
			let mut uart = unsafe { uart_16550::SerialPort::new(config.port) };
			uart.init();
			unsafe {
				Self::apply_framing(&config);
			}
			Self { uart }
		}

		/// Programs divisor latch and line control behind the crate's
		/// back: `init` fixes 38400 8N1, the command line may not.
		unsafe fn apply_framing(config: &ComConfig) {
			let mut lcr: Port<u8> = Port::new(config.port + 3);
			let mut dll: Port<u8> = Port::new(config.port);
			let mut dlm: Port<u8> = Port::new(config.port + 1);

			let divisor = config.divisor();
			unsafe {
				// DLAB on, divisor, DLAB off with the final framing.
				lcr.write(0x80);
				dll.write((divisor & 0xff) as u8);
				dlm.write((divisor >> 8) as u8);
				lcr.write(config.lcr());
			}
		}

		pub fn send(&mut self, buf: &[u8]) {
			for &byte in buf {
				if byte == b'\n' {
					self.uart.send(b'\r');
				}
				self.uart.send(byte);
			}
		}
	}

	/// The four COM slots. Slot 0 (the boot console) is filled at init;
	/// the others come up when a `comN=` parameter names them.
	static PORTS: [InterruptSpinMutex<Option<SerialPort>>; 4] =
		[const { InterruptSpinMutex::new(None) }; 4];

	fn com_send(index: usize, buf: &[u8]) {
		if let Some(port) = PORTS[index].lock().as_mut() {
			port.send(buf);
		}
	}

	fn com1_sink(buf: &[u8]) {
		com_send(0, buf);
	}

	fn com2_sink(buf: &[u8]) {
		com_send(1, buf);
	}

	fn com3_sink(buf: &[u8]) {
		com_send(2, buf);
	}

	fn com4_sink(buf: &[u8]) {
		com_send(3, buf);
	}

	const SINKS: [crate::console::ConsoleSink; 4] = [com1_sink, com2_sink, com3_sink, com4_sink];

	/// Brings up COM1 with default framing and hooks it into the console
	/// fan-out. Runs before command-line parsing; `configure` re-programs
	/// the port once the parameters are known.
	pub fn init() {
		let port = unsafe { SerialPort::new(ComConfig::default()) };
		*PORTS[0].lock() = Some(port);
		crate::console::register_sink(SINKS[0]);
	}

	/// Applies a parsed `comN=` parameter to slot `index` (0 through 3).
	/// A slot opened for the first time joins the console fan-out.
	pub fn configure(index: usize, config: ComConfig) {
		let port = unsafe { SerialPort::new(config) };
		let fresh = PORTS[index].lock().replace(port).is_none();
		// Registration happens outside the slot lock: the fan-out calls
		// back into the sink with the console lock held.
		if fresh && !crate::console::register_sink(SINKS[index]) {
			warn!("Console fan-out is full, COM{} stays silent", index + 1);
		}
	}

	/// QEMU's debugcon device: a write-only byte port.
	const QEMU_DEBUGCON_PORT: u16 = 0xe9;

	fn qemu_debug_sink(buf: &[u8]) {
		let mut port: Port<u8> = Port::new(QEMU_DEBUGCON_PORT);
		for &byte in buf {
			unsafe {
				port.write(byte);
			}
		}
	}

	/// Adds the QEMU debug console to the fan-out (the `qemu_console`
	/// command-line flag).
	pub fn enable_qemu_console() {
		crate::console::register_sink(qemu_debug_sink);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn full_parameter_parses() {
		let config = ComConfig::parse("0x3f8,115200,8,n,1").unwrap();
		assert_eq!(config, ComConfig::default());
	}

	#[test]
	fn omitted_fields_default() {
		let config = ComConfig::parse("0x2f8").unwrap();
		assert_eq!(config.port, COM2_PORT);
		assert_eq!(config.baud, DEFAULT_BAUD);
		assert_eq!(config.frame_size, 8);
		assert_eq!(config.parity, Parity::None);
		assert_eq!(config.stop_bits, 1);
	}

	#[test]
	fn bogus_port_is_rejected() {
		assert!(ComConfig::parse("0xdead").is_none());
		assert!(ComConfig::parse("").is_none());
		assert!(ComConfig::parse("0x3f8,123").is_none());
		assert!(ComConfig::parse("0x3f8,115200,9").is_none());
		assert!(ComConfig::parse("0x3f8,115200,8,x").is_none());
		assert!(ComConfig::parse("0x3f8,115200,8,n,3").is_none());
	}

	#[test]
	fn lcr_encodes_framing() {
		// 8N1
		assert_eq!(ComConfig::default().lcr(), 0b0000_0011);

		let config = ComConfig::parse("0x3f8,9600,7,e,2").unwrap();
		assert_eq!(config.lcr(), 0b0001_1110);
		assert_eq!(config.divisor(), 12);
	}
}
