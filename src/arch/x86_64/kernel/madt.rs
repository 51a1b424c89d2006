//! MADT ("APIC" table) topology decoding.
//!
//! The entry stream enumerates local APICs, I/O APICs, and the interrupt
//! overrides of the platform. Enabled local APICs become per-CPU blocks;
//! everything else lands in the I/O APIC and bus tables.

use crate::arch::x86_64::kernel::ioapic::{
	decode_inti_flags, IrqDestination, IrqOverride, IrqType, ALL_LAPICS,
};

/// MADT body header following the common SDT header.
#[derive(Clone, Copy, Debug)]
#[repr(C, packed)]
pub struct MadtHeader {
	pub local_apic_address: u32,
	pub flags: u32,
}

/// MADT `flags` bit: the platform also carries dual 8259s.
pub const MADT_PCAT_COMPAT: u32 = 1 << 0;

/// `flags` bit of LAPIC/X2APIC entries: the processor is usable.
pub const LAPIC_ENABLED: u32 = 1 << 0;

#[derive(Clone, Copy, Debug)]
#[repr(C, packed)]
struct EntryHeader {
	entry_type: u8,
	length: u8,
}

#[derive(Clone, Copy, Debug)]
#[repr(C, packed)]
struct LapicEntry {
	acpi_uid: u8,
	apic_id: u8,
	flags: u32,
}

#[derive(Clone, Copy, Debug)]
#[repr(C, packed)]
struct IoApicEntry {
	id: u8,
	reserved: u8,
	address: u32,
	gsi_base: u32,
}

#[derive(Clone, Copy, Debug)]
#[repr(C, packed)]
struct IrqSourceOverrideEntry {
	bus: u8,
	source: u8,
	gsi: u32,
	flags: u16,
}

#[derive(Clone, Copy, Debug)]
#[repr(C, packed)]
struct NmiSourceEntry {
	flags: u16,
	gsi: u32,
}

#[derive(Clone, Copy, Debug)]
#[repr(C, packed)]
struct LapicNmiEntry {
	acpi_uid: u8,
	flags: u16,
	lint: u8,
}

#[derive(Clone, Copy, Debug)]
#[repr(C, packed)]
struct LapicAddressOverrideEntry {
	reserved: u16,
	address: u64,
}

#[derive(Clone, Copy, Debug)]
#[repr(C, packed)]
struct X2ApicEntry {
	reserved: u16,
	apic_id: u32,
	flags: u32,
	acpi_uid: u32,
}

#[derive(Clone, Copy, Debug)]
#[repr(C, packed)]
struct X2ApicNmiEntry {
	flags: u16,
	acpi_uid: u32,
	lint: u8,
	reserved: [u8; 3],
}

/// A decoded MADT entry, normalized across the xAPIC and x2APIC forms.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MadtEntry {
	Lapic {
		acpi_uid: u32,
		apic_id: u32,
		enabled: bool,
	},
	IoApic {
		id: u8,
		address: u32,
		gsi_base: u32,
	},
	IrqOverride(DecodedOverride),
	LapicAddressOverride {
		address: u64,
	},
	/// IOSAPIC and SAPIC records of Itanium platforms; logged and kept
	/// out of the tables.
	Sapic {
		entry_type: u8,
	},
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodedOverride {
	pub bus: u8,
	pub typ: IrqType,
	pub src_irq: u8,
	pub dst: IrqDestination,
	pub dst_lapic_uid: u32,
	pub flags: u16,
}

impl DecodedOverride {
	pub fn to_record(self) -> IrqOverride {
		let (polarity, trigger) = decode_inti_flags(self.flags);
		IrqOverride {
			typ: self.typ,
			src_irq: self.src_irq,
			dst: self.dst,
			dst_lapic_uid: self.dst_lapic_uid,
			polarity,
			trigger,
		}
	}
}

fn read_entry<T: Copy>(bytes: &[u8]) -> T {
	assert!(bytes.len() >= core::mem::size_of::<T>());
	unsafe { bytes.as_ptr().cast::<T>().read_unaligned() }
}

/// Walks the MADT entry stream, handing each decoded entry to `f`.
///
/// An entry type outside the ACPI-defined set means the table is
/// corrupt; that is fatal, not skippable.
pub fn parse_entries(mut bytes: &[u8], mut f: impl FnMut(MadtEntry)) {
	while bytes.len() >= core::mem::size_of::<EntryHeader>() {
		let header: EntryHeader = read_entry(bytes);
		let length = header.length as usize;
		assert!(
			length >= core::mem::size_of::<EntryHeader>() && length <= bytes.len(),
			"Truncated MADT entry (type {}, length {length})",
			header.entry_type
		);
		let body = &bytes[core::mem::size_of::<EntryHeader>()..length];

		match header.entry_type {
			0 => {
				let entry: LapicEntry = read_entry(body);
				f(MadtEntry::Lapic {
					acpi_uid: u32::from(entry.acpi_uid),
					apic_id: u32::from(entry.apic_id),
					enabled: entry.flags & LAPIC_ENABLED != 0,
				});
			}
			1 => {
				let entry: IoApicEntry = read_entry(body);
				f(MadtEntry::IoApic {
					id: entry.id,
					address: entry.address,
					gsi_base: entry.gsi_base,
				});
			}
			2 => {
				let entry: IrqSourceOverrideEntry = read_entry(body);
				f(MadtEntry::IrqOverride(DecodedOverride {
					bus: entry.bus,
					typ: IrqType::Int,
					src_irq: entry.source,
					dst: IrqDestination::Gsi(entry.gsi),
					dst_lapic_uid: ALL_LAPICS,
					flags: entry.flags,
				}));
			}
			3 => {
				let entry: NmiSourceEntry = read_entry(body);
				f(MadtEntry::IrqOverride(DecodedOverride {
					bus: 0,
					typ: IrqType::Nmi,
					src_irq: 0,
					dst: IrqDestination::Gsi(entry.gsi),
					dst_lapic_uid: ALL_LAPICS,
					flags: entry.flags,
				}));
			}
			4 => {
				let entry: LapicNmiEntry = read_entry(body);
				f(MadtEntry::IrqOverride(DecodedOverride {
					bus: 0,
					typ: IrqType::Nmi,
					src_irq: 0,
					dst: IrqDestination::Lint(entry.lint),
					dst_lapic_uid: if entry.acpi_uid == 0xff {
						ALL_LAPICS
					} else {
						u32::from(entry.acpi_uid)
					},
					flags: entry.flags,
				}));
			}
			5 => {
				let entry: LapicAddressOverrideEntry = read_entry(body);
				f(MadtEntry::LapicAddressOverride {
					address: entry.address,
				});
			}
			6 | 7 | 8 => {
				// IOSAPIC / LSAPIC / platform interrupt sources.
				f(MadtEntry::Sapic {
					entry_type: header.entry_type,
				});
			}
			9 => {
				let entry: X2ApicEntry = read_entry(body);
				f(MadtEntry::Lapic {
					acpi_uid: entry.acpi_uid,
					apic_id: entry.apic_id,
					enabled: entry.flags & LAPIC_ENABLED != 0,
				});
			}
			0xa => {
				let entry: X2ApicNmiEntry = read_entry(body);
				f(MadtEntry::IrqOverride(DecodedOverride {
					bus: 0,
					typ: IrqType::Nmi,
					src_irq: 0,
					dst: IrqDestination::Lint(entry.lint),
					dst_lapic_uid: if entry.acpi_uid == u32::MAX {
						ALL_LAPICS
					} else {
						entry.acpi_uid
					},
					flags: entry.flags,
				}));
			}
			unknown => panic!("Unknown MADT entry type {unknown}"),
		}

		bytes = &bytes[length..];
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn lapic_bytes(acpi_uid: u8, apic_id: u8, flags: u32) -> [u8; 8] {
		let f = flags.to_le_bytes();
		[0, 8, acpi_uid, apic_id, f[0], f[1], f[2], f[3]]
	}

	#[test]
	fn disabled_lapics_are_reported_disabled() {
		let mut stream = alloc::vec::Vec::new();
		stream.extend_from_slice(&lapic_bytes(0, 0, 1));
		stream.extend_from_slice(&lapic_bytes(1, 1, 0));
		stream.extend_from_slice(&lapic_bytes(2, 2, 1));
		stream.extend_from_slice(&lapic_bytes(3, 3, 0));

		let mut enabled = 0;
		let mut total = 0;
		parse_entries(&stream, |entry| {
			if let MadtEntry::Lapic { enabled: e, .. } = entry {
				total += 1;
				if e {
					enabled += 1;
				}
			}
		});
		assert_eq!(total, 4);
		assert_eq!(enabled, 2);
	}

	#[test]
	fn ioapic_and_override_entries_decode() {
		let mut stream = alloc::vec::Vec::new();
		// IOAPIC id 1 at 0xfec00000, GSI base 0.
		stream.extend_from_slice(&[1, 12, 1, 0, 0x00, 0x00, 0xc0, 0xfe, 0, 0, 0, 0]);
		// ISA IRQ 0 -> GSI 2, flags 0.
		stream.extend_from_slice(&[2, 10, 0, 0, 2, 0, 0, 0, 0, 0]);

		let mut seen = alloc::vec::Vec::new();
		parse_entries(&stream, |entry| seen.push(entry));

		assert_eq!(
			seen[0],
			MadtEntry::IoApic {
				id: 1,
				address: 0xfec0_0000,
				gsi_base: 0
			}
		);
		match seen[1] {
			MadtEntry::IrqOverride(o) => {
				assert_eq!(o.src_irq, 0);
				assert_eq!(o.dst, IrqDestination::Gsi(2));
				assert_eq!(o.typ, IrqType::Int);
			}
			_ => panic!("expected an override"),
		}
	}

	#[test]
	fn x2apic_entries_normalize_to_lapic() {
		// Type 9, length 16: reserved(2) apic_id(4) flags(4) uid(4).
		let mut stream = alloc::vec::Vec::new();
		stream.extend_from_slice(&[9, 16, 0, 0]);
		stream.extend_from_slice(&0x100u32.to_le_bytes());
		stream.extend_from_slice(&1u32.to_le_bytes());
		stream.extend_from_slice(&7u32.to_le_bytes());

		let mut seen = None;
		parse_entries(&stream, |entry| seen = Some(entry));
		assert_eq!(
			seen,
			Some(MadtEntry::Lapic {
				acpi_uid: 7,
				apic_id: 0x100,
				enabled: true
			})
		);
	}

	#[test]
	#[should_panic(expected = "Unknown MADT entry type")]
	fn unknown_entry_type_is_fatal() {
		parse_entries(&[0x42, 2], |_| {});
	}
}

#[cfg(target_os = "none")]
pub use self::hw::*;

#[cfg(target_os = "none")]
mod hw {
	use memory_addresses::PhysAddr;

	use super::*;
	use crate::arch::x86_64::kernel::core_local::alloc_percpu;
	use crate::arch::x86_64::kernel::{acpi, apic, ioapic};
	use crate::errno::Errno;

	/// Default physical base of the local APIC register window.
	const LAPIC_DEFAULT_ADDRESS: u64 = 0xfee0_0000;

	/// Decodes the MADT into per-CPU blocks, I/O APIC records, and bus
	/// overrides. Returns the number of usable CPUs.
	pub fn init() -> Result<u32, Errno> {
		let madt = acpi::get_madt().ok_or(Errno::NoEnt)?;

		let header: MadtHeader = unsafe {
			(madt.table_start_address() as *const MadtHeader).read_unaligned()
		};
		let mut lapic_address = PhysAddr::new(u64::from(header.local_apic_address));

		// An ISA bus exists whenever the platform carries legacy PICs
		// or the FADT claims legacy devices.
		if header.flags & MADT_PCAT_COMPAT != 0 || acpi::has_legacy_devices() {
			ioapic::add_system_bus("ISA").ok();
		}

		let bsp_apic_id = apic::bsp_apic_id();
		let mut nr_cpus = 0u32;

		let entries = unsafe {
			core::slice::from_raw_parts(
				(madt.table_start_address() + core::mem::size_of::<MadtHeader>()) as *const u8,
				madt.table_end_address()
					- madt.table_start_address()
					- core::mem::size_of::<MadtHeader>(),
			)
		};

		parse_entries(entries, |entry| match entry {
			MadtEntry::Lapic {
				acpi_uid,
				apic_id,
				enabled,
			} => {
				debug!(
					"MADT: LAPIC uid {acpi_uid} apic_id {apic_id} {}",
					if enabled { "enabled" } else { "disabled" }
				);
				if enabled {
					let cpu_id = nr_cpus;
					alloc_percpu(cpu_id, apic_id, apic_id == bsp_apic_id)
						.expect("Cannot allocate a per-CPU block");
					nr_cpus += 1;
				}
			}
			MadtEntry::IoApic {
				id,
				address,
				gsi_base,
			} => {
				ioapic::register_ioapic(id, PhysAddr::new(u64::from(address)), gsi_base)
					.expect("Cannot register an I/O APIC");
			}
			MadtEntry::IrqOverride(decoded) => {
				debug!("MADT: IRQ override {decoded:?}");
				// Non-ISA buses never show up in MADT overrides.
				ioapic::add_irq_override("ISA", decoded.to_record()).ok();
			}
			MadtEntry::LapicAddressOverride { address } => {
				lapic_address = PhysAddr::new(address);
			}
			MadtEntry::Sapic { entry_type } => {
				info!("MADT: ignoring IOSAPIC-family entry type {entry_type}");
			}
		});

		if lapic_address.as_u64() != LAPIC_DEFAULT_ADDRESS {
			info!("MADT: LAPIC address override {lapic_address:p}");
		}
		apic::set_lapic_base(lapic_address);

		Ok(nr_cpus)
	}
}
