//! Intel MP-table (MultiProcessor Specification 1.4) fallback.
//!
//! Platforms predating usable ACPI publish their topology through the MP
//! floating pointer and configuration table. The walk produces the same
//! CPU, I/O APIC, and override records the MADT path yields, so the rest
//! of the kernel never learns which firmware generation booted it.

use thiserror::Error;

use crate::arch::x86_64::kernel::ioapic::{
	decode_inti_flags, IrqDestination, IrqOverride, IrqType, ALL_LAPICS,
};
use crate::errno::Errno;

pub const MP_SIGNATURE: [u8; 4] = *b"_MP_";
pub const MPC_SIGNATURE: [u8; 4] = *b"PCMP";

/// Entry type tags of the base configuration table.
const MP_PROCESSOR: u8 = 0;
const MP_BUS: u8 = 1;
const MP_IOAPIC: u8 = 2;
const MP_INTSRC: u8 = 3;
const MP_LINTSRC: u8 = 4;

const CPU_ENABLED: u8 = 1 << 0;
const CPU_BSP: u8 = 1 << 1;
const IOAPIC_ENABLED: u8 = 1 << 0;

/// Interrupt types of INTSRC/LINTSRC entries.
const INT_TYPE_INT: u8 = 0;
const INT_TYPE_NMI: u8 = 1;
const INT_TYPE_SMI: u8 = 2;
const INT_TYPE_EXTINT: u8 = 3;

/// A LINTSRC destination of 0xff addresses all local APICs.
const LINT_ALL: u8 = 0xff;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpTableError {
	#[error("no MP floating pointer found")]
	NoFloatingPointer,
	#[error("checksum mismatch")]
	BadChecksum,
	#[error("bad signature")]
	BadSignature,
	#[error("no MP configuration table")]
	NoConfigTable,
	#[error("unknown entry type {0}")]
	UnknownEntry(u8),
}

impl From<MpTableError> for Errno {
	fn from(err: MpTableError) -> Self {
		match err {
			MpTableError::NoFloatingPointer => Errno::NoEnt,
			_ => Errno::Inval,
		}
	}
}

/// MP Floating Pointer Structure (16 bytes).
#[derive(Clone, Copy, Debug)]
#[repr(C, packed)]
pub struct MpFloatingPointer {
	pub signature: [u8; 4],
	pub physptr: u32,
	/// Length in 16-byte units; 1 for this revision.
	pub length: u8,
	pub spec_rev: u8,
	pub checksum: u8,
	/// Non-zero selects a default configuration instead of a table.
	pub feature1: u8,
	pub feature2: u8,
	pub feature3: u8,
	pub feature4: u8,
	pub feature5: u8,
}

/// MP Configuration Table header.
#[derive(Clone, Copy, Debug)]
#[repr(C, packed)]
pub struct MpConfigHeader {
	pub signature: [u8; 4],
	pub base_table_length: u16,
	pub spec_rev: u8,
	pub checksum: u8,
	pub oem_id: [u8; 8],
	pub product_id: [u8; 12],
	pub oem_table_ptr: u32,
	pub oem_table_size: u16,
	pub entry_count: u16,
	pub lapic_base: u32,
	pub ext_table_length: u16,
	pub ext_table_checksum: u8,
	pub reserved: u8,
}

#[derive(Clone, Copy, Debug)]
#[repr(C, packed)]
struct ProcessorEntry {
	entry_type: u8,
	lapic_id: u8,
	lapic_version: u8,
	cpu_flags: u8,
	cpu_signature: u32,
	feature_flags: u32,
	reserved: [u32; 2],
}

#[derive(Clone, Copy, Debug)]
#[repr(C, packed)]
struct BusEntry {
	entry_type: u8,
	bus_id: u8,
	bus_type: [u8; 6],
}

#[derive(Clone, Copy, Debug)]
#[repr(C, packed)]
struct IoApicEntry {
	entry_type: u8,
	id: u8,
	version: u8,
	flags: u8,
	address: u32,
}

#[derive(Clone, Copy, Debug)]
#[repr(C, packed)]
struct InterruptEntry {
	entry_type: u8,
	int_type: u8,
	flags: u16,
	src_bus: u8,
	src_irq: u8,
	dst: u8,
	dst_pin: u8,
}

/// A decoded MP configuration record, shaped like the MADT events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MpEntry {
	Processor {
		lapic_id: u8,
		enabled: bool,
		bsp: bool,
	},
	Bus {
		id: u8,
		name: [u8; 6],
	},
	IoApic {
		id: u8,
		address: u32,
	},
	/// `dst` is (I/O APIC id, pin) for INTSRC, (LAPIC id, LINT#) for
	/// LINTSRC records.
	Interrupt {
		local: bool,
		int_type: u8,
		flags: u16,
		src_bus: u8,
		src_irq: u8,
		dst: u8,
		dst_pin: u8,
	},
}

pub fn checksum_ok(bytes: &[u8]) -> bool {
	bytes.iter().fold(0u8, |acc, x| acc.wrapping_add(*x)) == 0
}

fn read_entry<T: Copy>(bytes: &[u8]) -> T {
	assert!(bytes.len() >= core::mem::size_of::<T>());
	unsafe { bytes.as_ptr().cast::<T>().read_unaligned() }
}

/// Walks the base configuration entries following the header.
pub fn parse_entries(
	bytes: &[u8],
	entry_count: u16,
	mut f: impl FnMut(MpEntry),
) -> Result<(), MpTableError> {
	let mut offset = 0usize;
	for _ in 0..entry_count {
		let entry_type = *bytes.get(offset).ok_or(MpTableError::BadSignature)?;
		match entry_type {
			MP_PROCESSOR => {
				let entry: ProcessorEntry = read_entry(&bytes[offset..]);
				f(MpEntry::Processor {
					lapic_id: entry.lapic_id,
					enabled: entry.cpu_flags & CPU_ENABLED != 0,
					bsp: entry.cpu_flags & CPU_BSP != 0,
				});
				offset += 20;
			}
			MP_BUS => {
				let entry: BusEntry = read_entry(&bytes[offset..]);
				f(MpEntry::Bus {
					id: entry.bus_id,
					name: entry.bus_type,
				});
				offset += 8;
			}
			MP_IOAPIC => {
				let entry: IoApicEntry = read_entry(&bytes[offset..]);
				if entry.flags & IOAPIC_ENABLED != 0 {
					f(MpEntry::IoApic {
						id: entry.id,
						address: entry.address,
					});
				}
				offset += 8;
			}
			MP_INTSRC | MP_LINTSRC => {
				let entry: InterruptEntry = read_entry(&bytes[offset..]);
				f(MpEntry::Interrupt {
					local: entry_type == MP_LINTSRC,
					int_type: entry.int_type,
					flags: entry.flags,
					src_bus: entry.src_bus,
					src_irq: entry.src_irq,
					dst: entry.dst,
					dst_pin: entry.dst_pin,
				});
				offset += 8;
			}
			unknown => return Err(MpTableError::UnknownEntry(unknown)),
		}
	}
	Ok(())
}

/// Builds the override record of one MP interrupt entry.
pub fn interrupt_to_override(
	int_type: u8,
	flags: u16,
	src_irq: u8,
	dst: IrqDestination,
	dst_lapic_uid: u32,
) -> Option<IrqOverride> {
	let typ = match int_type {
		INT_TYPE_INT => IrqType::Int,
		INT_TYPE_NMI => IrqType::Nmi,
		INT_TYPE_SMI => IrqType::Smi,
		INT_TYPE_EXTINT => IrqType::ExtInt,
		_ => return None,
	};
	let (polarity, trigger) = decode_inti_flags(flags);
	Some(IrqOverride {
		typ,
		src_irq,
		dst,
		dst_lapic_uid,
		polarity,
		trigger,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn floating_pointer_is_16_bytes() {
		assert_eq!(core::mem::size_of::<MpFloatingPointer>(), 16);
		assert_eq!(core::mem::size_of::<MpConfigHeader>(), 44);
	}

	#[test]
	fn checksum_over_floating_pointer() {
		let mut bytes = [0u8; 16];
		bytes[..4].copy_from_slice(&MP_SIGNATURE);
		bytes[9] = 4; // spec_rev
		assert!(!checksum_ok(&bytes));

		let sum: u8 = bytes.iter().fold(0u8, |acc, x| acc.wrapping_add(*x));
		bytes[10] = sum.wrapping_neg();
		assert!(checksum_ok(&bytes));
	}

	#[test]
	fn processor_entries_decode() {
		let mut stream = alloc::vec::Vec::new();
		// BSP, enabled.
		let mut bsp = [0u8; 20];
		bsp[0] = MP_PROCESSOR;
		bsp[1] = 0; // lapic id
		bsp[3] = CPU_ENABLED | CPU_BSP;
		stream.extend_from_slice(&bsp);
		// AP, disabled.
		let mut ap = [0u8; 20];
		ap[0] = MP_PROCESSOR;
		ap[1] = 1;
		stream.extend_from_slice(&ap);

		let mut seen = alloc::vec::Vec::new();
		parse_entries(&stream, 2, |entry| seen.push(entry)).unwrap();
		assert_eq!(
			seen,
			alloc::vec![
				MpEntry::Processor {
					lapic_id: 0,
					enabled: true,
					bsp: true
				},
				MpEntry::Processor {
					lapic_id: 1,
					enabled: false,
					bsp: false
				},
			]
		);
	}

	#[test]
	fn unknown_entry_is_an_error() {
		let stream = [0x77u8; 8];
		assert_eq!(
			parse_entries(&stream, 1, |_| {}),
			Err(MpTableError::UnknownEntry(0x77))
		);
	}

	#[test]
	fn interrupt_conversion_rejects_bad_types() {
		assert!(interrupt_to_override(9, 0, 0, IrqDestination::Gsi(0), ALL_LAPICS).is_none());
		let record =
			interrupt_to_override(INT_TYPE_EXTINT, 0b1111, 3, IrqDestination::Gsi(3), ALL_LAPICS)
				.unwrap();
		assert_eq!(record.typ, IrqType::ExtInt);
		assert_eq!(record.src_irq, 3);
	}
}

#[cfg(target_os = "none")]
pub use self::hw::*;

#[cfg(target_os = "none")]
mod hw {
	use memory_addresses::PhysAddr;

	use super::*;
	use crate::arch::x86_64::kernel::core_local::alloc_percpu;
	use crate::arch::x86_64::kernel::{apic, ioapic};

	/// EBDA segment pointer of the BIOS data area.
	const EBDA_PTR_LOCATION: u64 = 0x40e;
	/// Top of conventional memory; the last kilobyte is scanned.
	const BASE_MEMORY_TOP: u64 = 0x9_fc00;
	const BIOS_ROM_START: u64 = 0xf_0000;
	const BIOS_ROM_END: u64 = 0x10_0000;

	fn scan_window(start: u64, end: u64) -> Option<&'static MpFloatingPointer> {
		for current in (start..end).step_by(16) {
			let candidate = unsafe { &*(current as *const MpFloatingPointer) };
			if candidate.signature != MP_SIGNATURE {
				continue;
			}
			let bytes = unsafe { core::slice::from_raw_parts(current as *const u8, 16) };
			if !checksum_ok(bytes) {
				debug!("MP floating pointer at {current:#x} has a bad checksum");
				continue;
			}
			info!(
				"Found MP floating pointer at {current:#x} (spec rev 1.{})",
				candidate.spec_rev
			);
			return Some(candidate);
		}
		None
	}

	fn find_floating_pointer() -> Result<&'static MpFloatingPointer, MpTableError> {
		let ebda_segment = unsafe { (EBDA_PTR_LOCATION as *const u16).read_unaligned() };
		let ebda = u64::from(ebda_segment) << 4;

		if ebda > 0x400 {
			if let Some(mpf) = scan_window(ebda, ebda + 1024) {
				return Ok(mpf);
			}
		}
		if let Some(mpf) = scan_window(BASE_MEMORY_TOP, BASE_MEMORY_TOP + 1024) {
			return Ok(mpf);
		}
		scan_window(BIOS_ROM_START, BIOS_ROM_END).ok_or(MpTableError::NoFloatingPointer)
	}

	/// Walks the MP configuration into the same registries the MADT
	/// path fills. Returns the number of usable CPUs.
	pub fn init() -> Result<u32, MpTableError> {
		let mpf = find_floating_pointer()?;

		// A default-configuration system without a table would need the
		// canned topologies of MP spec chapter 5; none of the machines
		// this kernel probes ship that way.
		if mpf.physptr == 0 {
			panic!("MP floating pointer without a configuration table (default config {})",
				mpf.feature1);
		}

		let header = unsafe { &*(u64::from(mpf.physptr) as *const MpConfigHeader) };
		if header.signature != MPC_SIGNATURE {
			return Err(MpTableError::BadSignature);
		}
		let table_bytes = unsafe {
			core::slice::from_raw_parts(
				u64::from(mpf.physptr) as *const u8,
				header.base_table_length as usize,
			)
		};
		if !checksum_ok(table_bytes) {
			return Err(MpTableError::BadChecksum);
		}

		apic::set_lapic_base(PhysAddr::new(u64::from(header.lapic_base)));

		let entries = &table_bytes[core::mem::size_of::<MpConfigHeader>()..];
		let mut nr_cpus = 0u32;
		let mut isa_bus_id = None;
		let mut next_gsi_base = 0u32;

		let mut result = Ok(());
		parse_entries(entries, header.entry_count, |entry| match entry {
			MpEntry::Processor {
				lapic_id,
				enabled,
				bsp,
			} => {
				debug!(
					"MP: processor lapic {lapic_id} {}{}",
					if enabled { "enabled" } else { "disabled" },
					if bsp { " (BSP)" } else { "" }
				);
				if enabled {
					let cpu_id = nr_cpus;
					alloc_percpu(cpu_id, u32::from(lapic_id), bsp)
						.expect("Cannot allocate a per-CPU block");
					nr_cpus += 1;
				}
			}
			MpEntry::Bus { id, name } => {
				let name = core::str::from_utf8(&name).unwrap_or("").trim_end();
				debug!("MP: bus {id} \"{name}\"");
				if ioapic::add_system_bus(name).is_ok() && name == "ISA" {
					isa_bus_id = Some(id);
				}
			}
			MpEntry::IoApic { id, address } => {
				ioapic::register_ioapic(id, PhysAddr::new(u64::from(address)), next_gsi_base)
					.expect("Cannot register an I/O APIC");
				// MP tables carry no GSI numbering; successive IOAPICs
				// stack their pins the way ACPI would.
				next_gsi_base += 24;
			}
			MpEntry::Interrupt {
				local,
				int_type,
				flags,
				src_bus,
				src_irq,
				dst,
				dst_pin,
			} => {
				if isa_bus_id != Some(src_bus) {
					return;
				}
				let destination = if local {
					IrqDestination::Lint(dst_pin)
				} else {
					IrqDestination::Gsi(u32::from(dst_pin))
				};
				let uid = if local && dst == LINT_ALL {
					ALL_LAPICS
				} else {
					u32::from(dst)
				};
				if let Some(record) =
					interrupt_to_override(int_type, flags, src_irq, destination, uid)
				{
					if ioapic::add_irq_override("ISA", record).is_err() {
						result = Err(MpTableError::BadSignature);
					}
				}
			}
		})?;
		result?;

		info!("MP tables: {nr_cpus} usable CPUs");
		Ok(nr_cpus)
	}
}
