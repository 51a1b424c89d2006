//! ACPI table discovery.
//!
//! Finds the RSDP (loader tag first, then the EBDA and BIOS ROM scan),
//! follows the RSDT or XSDT to the table directory, validates checksums,
//! and stashes the tables the rest of the kernel consumes: the MADT for
//! topology, the FADT for the legacy-device bits and the poweroff path,
//! and the HPET table for the timer collaborators.

use core::str;

use thiserror::Error;

use crate::errno::Errno;

/// Memory at this physical address holds the real-mode segment of the
/// Extended BIOS Data Area (EBDA).
const EBDA_PTR_LOCATION: u64 = 0x0000_040e;
/// Minimum physical address where a valid EBDA can be located.
const EBDA_MINIMUM_ADDRESS: u64 = 0x400;
/// The size of the EBDA window that is searched for the RSDP.
const EBDA_WINDOW_SIZE: u64 = 1024;
/// BIOS ROM window also searched for the RSDP.
const RSDP_SEARCH_ADDRESS_LOW: u64 = 0xe_0000;
const RSDP_SEARCH_ADDRESS_HIGH: u64 = 0x10_0000;
/// Length of the structure covered by the basic (ACPI 1.0) checksum.
const RSDP_CHECKSUM_LENGTH: usize = 20;
/// Length of the structure covered by the extended (ACPI 2.0+) checksum.
const RSDP_XCHECKSUM_LENGTH: usize = 36;

/// Bit to enable an ACPI sleep state.
const SLP_EN: u16 = 1 << 13;

/// FADT `iapc_boot_arch` bits.
pub const BOOT_ARCH_LEGACY_DEVICES: u16 = 1 << 0;
pub const BOOT_ARCH_8042: u16 = 1 << 1;
pub const BOOT_ARCH_VGA_NOT_PRESENT: u16 = 1 << 2;

/// ACPI AML opcode indicating that a name follows.
const AML_NAMEOP: u8 = 0x08;
/// ACPI AML opcode indicating that a package follows.
const AML_PACKAGEOP: u8 = 0x12;
/// ACPI AML opcode for a literal zero byte.
const AML_ZEROOP: u8 = 0x00;
/// ACPI AML opcode for a literal one byte.
const AML_ONEOP: u8 = 0x01;
/// ACPI AML opcode announcing a single data byte.
const AML_BYTEPREFIX: u8 = 0x0a;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcpiError {
	#[error("no RSDP found")]
	NoRsdp,
	#[error("invalid signature")]
	BadSignature,
	#[error("checksum mismatch")]
	BadChecksum,
	#[error("unsupported revision {0}")]
	BadRevision(u8),
	#[error("required table missing")]
	MissingTable,
}

impl From<AcpiError> for Errno {
	fn from(err: AcpiError) -> Self {
		match err {
			AcpiError::NoRsdp | AcpiError::MissingTable => Errno::NoEnt,
			_ => Errno::Inval,
		}
	}
}

/// The "Root System Description Pointer".
#[repr(C, packed)]
pub struct AcpiRsdp {
	pub signature: [u8; 8],
	pub checksum: u8,
	pub oem_id: [u8; 6],
	pub revision: u8,
	pub rsdt_physical_address: u32,
	pub length: u32,
	pub xsdt_physical_address: u64,
	pub extended_checksum: u8,
	pub reserved: [u8; 3],
}

impl AcpiRsdp {
	fn oem_id(&self) -> &str {
		str::from_utf8(&self.oem_id).unwrap_or("??????")
	}
}

/// The header of (almost) every ACPI table.
#[derive(Clone, Copy, Debug)]
#[repr(C, packed)]
pub struct AcpiSdtHeader {
	pub signature: [u8; 4],
	pub length: u32,
	pub revision: u8,
	pub checksum: u8,
	pub oem_id: [u8; 6],
	pub oem_table_id: [u8; 8],
	pub oem_revision: u32,
	pub creator_id: u32,
	pub creator_revision: u32,
}

impl AcpiSdtHeader {
	pub fn signature(&self) -> &str {
		str::from_utf8(&self.signature).unwrap_or("????")
	}
}

/// The ACPI Generic Address Structure (GAS).
#[repr(C, packed)]
pub struct AcpiGenericAddress {
	pub address_space: u8,
	pub bit_width: u8,
	pub bit_offset: u8,
	pub access_size: u8,
	pub address: u64,
}

const GENERIC_ADDRESS_IO_SPACE: u8 = 1;

/// The "Fixed ACPI Description Table" (FADT), revisions 1 and 2 both
/// start with this layout; later fields are guarded by the table length.
#[repr(C, packed)]
pub struct AcpiFadt {
	pub firmware_ctrl: u32,
	pub dsdt: u32,
	pub reserved1: u8,
	pub preferred_pm_profile: u8,
	pub sci_int: u16,
	pub smi_cmd: u32,
	pub acpi_enable: u8,
	pub acpi_disable: u8,
	pub s4bios_req: u8,
	pub pstate_cnt: u8,
	pub pm1a_evt_blk: u32,
	pub pm1b_evt_blk: u32,
	pub pm1a_cnt_blk: u32,
	pub pm1b_cnt_blk: u32,
	pub pm2_cnt_blk: u32,
	pub pm_tmr_blk: u32,
	pub gpe0_blk: u32,
	pub gpe1_blk: u32,
	pub pm1_evt_len: u8,
	pub pm1_cnt_len: u8,
	pub pm2_cnt_len: u8,
	pub pm_tmr_len: u8,
	pub gpe0_blk_len: u8,
	pub gpe1_blk_len: u8,
	pub gpe1_base: u8,
	pub cst_cnt: u8,
	pub p_lvl2_lat: u16,
	pub p_lvl3_lat: u16,
	pub flush_size: u16,
	pub flush_stride: u16,
	pub duty_offset: u8,
	pub duty_width: u8,
	pub day_alrm: u8,
	pub mon_alrm: u8,
	pub century: u8,
	pub iapc_boot_arch: u16,
	pub reserved2: u8,
	pub flags: u32,
	pub reset_reg: AcpiGenericAddress,
	pub reset_value: u8,
	pub arm_boot_arch: u16,
	pub fadt_minor_version: u8,
	pub x_firmware_ctrl: u64,
	pub x_dsdt: u64,
	pub x_pm1a_evt_blk: AcpiGenericAddress,
	pub x_pm1b_evt_blk: AcpiGenericAddress,
	pub x_pm1a_cnt_blk: AcpiGenericAddress,
	pub x_pm1b_cnt_blk: AcpiGenericAddress,
	pub x_pm2_cnt_blk: AcpiGenericAddress,
	pub x_pm_tmr_blk: AcpiGenericAddress,
	pub x_gpe0_blk: AcpiGenericAddress,
	pub x_gpe1_blk: AcpiGenericAddress,
	pub sleep_control_reg: AcpiGenericAddress,
	pub sleep_status_reg: AcpiGenericAddress,
	pub hypervisor_vendor_id: u64,
}

/// The "High Precision Event Timer" table body.
#[repr(C, packed)]
pub struct AcpiHpet {
	pub event_timer_block_id: u32,
	pub base_address: AcpiGenericAddress,
	pub hpet_number: u8,
	pub min_clock_tick: u16,
	pub page_protection: u8,
}

/// Verifies the checksum of an ACPI structure: the wrapping byte sum
/// over the whole structure must be zero.
pub fn verify_checksum(bytes: &[u8]) -> Result<(), AcpiError> {
	let checksum = bytes.iter().fold(0u8, |acc, x| acc.wrapping_add(*x));
	if checksum == 0 {
		Ok(())
	} else {
		Err(AcpiError::BadChecksum)
	}
}

/// Locates the `_S5_` package in AML bytecode and extracts SLP_TYPa.
///
/// No AML interpreter is embedded; the pattern search is enough for the
/// fixed shape every firmware emits for the soft-off object.
pub fn find_s5_slp_typ(aml: &[u8]) -> Option<u8> {
	let s5 = [b'_', b'S', b'5', b'_', AML_PACKAGEOP];
	let i = aml.windows(s5.len()).position(|window| window == s5)?;

	// A valid object is preceded by a NameOp, optionally with a root
	// prefix in between.
	if i < 2 || !(aml[i - 1] == AML_NAMEOP || (aml[i - 2] == AML_NAMEOP && aml[i - 1] == b'\\')) {
		return None;
	}

	// PkgLength must be the single-byte form and non-empty.
	let pkg_length = *aml.get(i + 5)?;
	let num_elements = *aml.get(i + 6)?;
	if pkg_length & 0b1100_0000 != 0 || num_elements == 0 {
		return None;
	}

	match *aml.get(i + 7)? {
		AML_ZEROOP => Some(0),
		AML_ONEOP => Some(1),
		AML_BYTEPREFIX => aml.get(i + 8).copied(),
		_ => None,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn with_checksum(mut bytes: alloc::vec::Vec<u8>) -> alloc::vec::Vec<u8> {
		let sum = bytes.iter().fold(0u8, |acc, x| acc.wrapping_add(*x));
		bytes.push(sum.wrapping_neg());
		bytes
	}

	#[test]
	fn checksum_accepts_zero_sum() {
		let table = with_checksum(alloc::vec![0x12, 0x34, 0x56]);
		assert_eq!(verify_checksum(&table), Ok(()));
		assert_eq!(verify_checksum(&table[..3]), Err(AcpiError::BadChecksum));
	}

	#[test]
	fn rsdp_layout_is_architectural() {
		assert_eq!(core::mem::size_of::<AcpiRsdp>(), 36);
		assert_eq!(core::mem::offset_of!(AcpiRsdp, revision), 15);
		assert_eq!(core::mem::offset_of!(AcpiRsdp, xsdt_physical_address), 24);
		assert_eq!(RSDP_CHECKSUM_LENGTH, 20);
		assert_eq!(RSDP_XCHECKSUM_LENGTH, 36);
	}

	#[test]
	fn sdt_header_is_36_bytes() {
		assert_eq!(core::mem::size_of::<AcpiSdtHeader>(), 36);
	}

	#[test]
	fn fadt_boot_arch_field_offset() {
		// iapc_boot_arch sits at offset 73 within the FADT body
		// (109 minus the 36-byte header).
		assert_eq!(core::mem::offset_of!(AcpiFadt, iapc_boot_arch), 73);
		assert_eq!(core::mem::offset_of!(AcpiFadt, pm1a_cnt_blk), 28);
	}

	#[test]
	fn s5_search_understands_byte_prefix() {
		// NameOp _S5_ PackageOp PkgLength NumElements BytePrefix 0x07 ...
		let aml = [
			0x10, 0x2b, AML_NAMEOP, b'_', b'S', b'5', b'_', AML_PACKAGEOP, 0x0a, 0x04,
			AML_BYTEPREFIX, 0x07, 0x00,
		];
		assert_eq!(find_s5_slp_typ(&aml), Some(0x07));
	}

	#[test]
	fn s5_search_rejects_wide_pkg_length() {
		let aml = [
			0x10, 0x2b, AML_NAMEOP, b'_', b'S', b'5', b'_', AML_PACKAGEOP, 0xc4, 0x04,
			AML_BYTEPREFIX, 0x07,
		];
		assert_eq!(find_s5_slp_typ(&aml), None);
	}

	#[test]
	fn s5_search_wants_a_name_op() {
		let aml = [
			0x10, 0x2b, 0x00, b'_', b'S', b'5', b'_', AML_PACKAGEOP, 0x0a, 0x04, AML_BYTEPREFIX,
			0x07,
		];
		assert_eq!(find_s5_slp_typ(&aml), None);
	}
}

#[cfg(target_os = "none")]
pub use self::hw::*;

#[cfg(target_os = "none")]
mod hw {
	use core::{mem, ptr, slice};

	use hermit_sync::OnceCell;
	use memory_addresses::PhysAddr;
	use x86_64::instructions::port::Port;

	use super::*;
	use crate::arch::x86_64::kernel::multiboot;
	use crate::arch::x86_64::mm::paging;
	use crate::mm::virtualmem::{ident_mapped_limit, vmap_ident_4k};
	use crate::mm::{Mfn, PAGE_ORDER_4K, PAGE_SIZE};

	/// The MADT, preserved for the topology walk.
	static MADT: OnceCell<AcpiTable<'static>> = OnceCell::new();
	/// PM1a control port and SLP_TYPa code for `poweroff`.
	static PM1A_CNT_BLK: OnceCell<u16> = OnceCell::new();
	static SLP_TYPA: OnceCell<u8> = OnceCell::new();
	/// FADT `iapc_boot_arch`, zero when the FADT predates the field.
	static BOOT_ARCH_FLAGS: OnceCell<u16> = OnceCell::new();
	/// HPET base address when the table is present.
	static HPET_BASE: OnceCell<PhysAddr> = OnceCell::new();

	/// A mapped view of one ACPI table.
	///
	/// Tables below the boot identity limit are read in place; higher
	/// ones get identity-window pages mapped on demand and unmapped when
	/// the view goes out of scope.
	pub struct AcpiTable<'a> {
		header: &'a AcpiSdtHeader,
		mapped: Option<(PhysAddr, usize)>,
	}

	// The view only ever aliases firmware memory.
	unsafe impl Send for AcpiTable<'_> {}
	unsafe impl Sync for AcpiTable<'_> {}

	fn map_ident_pages(base: PhysAddr, count: usize) {
		use crate::arch::x86_64::mm::paging::{L1_PROT_RO, PteFlags};
		for i in 0..count {
			let paddr = PhysAddr::new(base.as_u64() + (i * PAGE_SIZE) as u64);
			vmap_ident_4k(Mfn::from_paddr(paddr), L1_PROT_RO | PteFlags::NO_EXECUTE).unwrap();
		}
	}

	impl AcpiTable<'_> {
		/// Maps the table at `physical_address` and validates nothing
		/// but the length; callers check signature and checksum.
		fn map(physical_address: PhysAddr) -> Self {
			use align_address::Align;

			let map_base = physical_address.align_down(PAGE_SIZE as u64);
			let offset = (physical_address.as_u64() - map_base.as_u64()) as usize;

			// Two pages up front guarantee the header is readable even
			// when it crosses a page boundary.
			let mut count = 2usize;
			let mut mapped = None;
			if map_base.as_u64() + (count * PAGE_SIZE) as u64 > ident_mapped_limit() {
				map_ident_pages(map_base, count);
				mapped = Some((map_base, count));
			}

			let header =
				unsafe { &*((map_base.as_u64() as usize + offset) as *const AcpiSdtHeader) };
			let length = header.length as usize;

			if offset + length > count * PAGE_SIZE && mapped.is_some() {
				count = (offset + length).div_ceil(PAGE_SIZE);
				map_ident_pages(map_base, count);
				mapped = Some((map_base, count));
			}

			Self { header, mapped }
		}

		pub fn header(&self) -> &AcpiSdtHeader {
			self.header
		}

		pub fn header_start_address(&self) -> usize {
			ptr::from_ref(self.header) as usize
		}

		pub fn table_start_address(&self) -> usize {
			self.header_start_address() + mem::size_of::<AcpiSdtHeader>()
		}

		pub fn table_end_address(&self) -> usize {
			self.header_start_address() + self.header.length as usize
		}

		fn verify(&self) -> Result<(), AcpiError> {
			let bytes = unsafe {
				slice::from_raw_parts(
					self.header_start_address() as *const u8,
					self.header.length as usize,
				)
			};
			verify_checksum(bytes)
		}
	}

	impl Drop for AcpiTable<'_> {
		fn drop(&mut self) {
			if let Some((base, count)) = self.mapped {
				for i in 0..count {
					let va = memory_addresses::VirtAddr::new(
						base.as_u64() + (i * PAGE_SIZE) as u64,
					);
					paging::vunmap(va, PAGE_ORDER_4K).unwrap();
				}
			}
		}
	}

	/// Searches one 16-byte-strided window for the RSDP signature.
	fn detect_rsdp(start: u64, end: u64) -> Result<&'static AcpiRsdp, AcpiError> {
		for current in (start..end).step_by(16) {
			let rsdp = unsafe { &*(current as *const AcpiRsdp) };
			if &rsdp.signature != b"RSD PTR " {
				continue;
			}

			let bytes =
				unsafe { slice::from_raw_parts(current as *const u8, RSDP_XCHECKSUM_LENGTH) };
			if verify_checksum(&bytes[..RSDP_CHECKSUM_LENGTH]).is_err() {
				debug!("RSDP candidate at {current:#x} has a bad checksum");
				continue;
			}
			if rsdp.revision >= 2 && verify_checksum(bytes).is_err() {
				debug!("RSDP candidate at {current:#x} has a bad extended checksum");
				continue;
			}

			info!(
				"Found ACPI revision {} RSDP at {:#x} (OEM \"{}\")",
				rsdp.revision,
				current,
				rsdp.oem_id()
			);
			return Ok(rsdp);
		}

		Err(AcpiError::NoRsdp)
	}

	/// RSDP discovery: EBDA window first, BIOS ROM window second. Both
	/// live below the boot identity limit and are readable in place.
	fn detect_acpi() -> Result<multiboot::AcpiRoot, AcpiError> {
		if let Some(root) = multiboot::acpi_root() {
			debug!("Using the loader-supplied ACPI root at {:p}", root.sdt);
			return Ok(root);
		}

		let ebda_segment = unsafe { (EBDA_PTR_LOCATION as *const u16).read_unaligned() };
		let ebda = u64::from(ebda_segment) << 4;
		let rsdp = if ebda > EBDA_MINIMUM_ADDRESS {
			detect_rsdp(ebda, ebda + EBDA_WINDOW_SIZE)
		} else {
			Err(AcpiError::NoRsdp)
		}
		.or_else(|_| detect_rsdp(RSDP_SEARCH_ADDRESS_LOW, RSDP_SEARCH_ADDRESS_HIGH))?;

		if rsdp.revision >= 2 {
			Ok(multiboot::AcpiRoot {
				revision: rsdp.revision,
				sdt: PhysAddr::new(rsdp.xsdt_physical_address),
			})
		} else {
			Ok(multiboot::AcpiRoot {
				revision: rsdp.revision,
				sdt: PhysAddr::new(u64::from(rsdp.rsdt_physical_address)),
			})
		}
	}

	fn parse_fadt(fadt: AcpiTable<'_>) {
		let fadt_table = unsafe { &*(fadt.table_start_address() as *const AcpiFadt) };

		// Boot-architecture flags gate the i8042 and VGA collaborators.
		let boot_arch_offset = mem::offset_of!(AcpiFadt, iapc_boot_arch);
		let boot_arch = if fadt.table_start_address() + boot_arch_offset + 2
			<= fadt.table_end_address()
		{
			fadt_table.iapc_boot_arch
		} else {
			// Revision 1 tables end before the field; assume legacy.
			BOOT_ARCH_LEGACY_DEVICES | BOOT_ARCH_8042
		};
		BOOT_ARCH_FLAGS.set(boot_arch).ok();

		// Prefer the extended PM1a block when it names I/O space.
		let x_pm1a_offset = mem::offset_of!(AcpiFadt, x_pm1a_cnt_blk);
		let pm1a = if fadt.table_start_address() + x_pm1a_offset
			< fadt.table_end_address()
			&& fadt_table.x_pm1a_cnt_blk.address_space == GENERIC_ADDRESS_IO_SPACE
		{
			fadt_table.x_pm1a_cnt_blk.address as u16
		} else {
			fadt_table.pm1a_cnt_blk as u16
		};
		PM1A_CNT_BLK.set(pm1a).ok();

		// The DSDT hides SLP_TYPa inside the _S5_ object.
		let x_dsdt_offset = mem::offset_of!(AcpiFadt, x_dsdt);
		let dsdt_address = if fadt.table_start_address() + x_dsdt_offset
			< fadt.table_end_address()
			&& fadt_table.x_dsdt > 0
		{
			PhysAddr::new(fadt_table.x_dsdt)
		} else {
			PhysAddr::new(u64::from(fadt_table.dsdt))
		};

		let dsdt = AcpiTable::map(dsdt_address);
		if dsdt.header.signature() != "DSDT" || dsdt.verify().is_err() {
			warn!("DSDT at {dsdt_address:p} is invalid; ACPI poweroff unavailable");
			return;
		}
		search_s5(&dsdt);
	}

	fn search_s5(table: &AcpiTable<'_>) {
		if SLP_TYPA.get().is_some() {
			return;
		}
		let aml = unsafe {
			slice::from_raw_parts(
				table.table_start_address() as *const u8,
				table.table_end_address() - table.table_start_address(),
			)
		};
		if let Some(slp_typ) = find_s5_slp_typ(aml) {
			SLP_TYPA.set(slp_typ).ok();
		}
	}

	fn parse_hpet(hpet: AcpiTable<'_>) {
		let hpet_table = unsafe { &*(hpet.table_start_address() as *const AcpiHpet) };
		let base = PhysAddr::new(hpet_table.base_address.address);
		info!("HPET block {} at {:p}", { hpet_table.hpet_number }, base);
		HPET_BASE.set(base).ok();
	}

	pub fn get_madt() -> Option<&'static AcpiTable<'static>> {
		MADT.get()
	}

	pub fn has_legacy_devices() -> bool {
		BOOT_ARCH_FLAGS.get().is_none_or(|f| f & BOOT_ARCH_LEGACY_DEVICES != 0)
	}

	pub fn has_i8042() -> bool {
		BOOT_ARCH_FLAGS.get().is_none_or(|f| f & BOOT_ARCH_8042 != 0)
	}

	pub fn has_vga() -> bool {
		BOOT_ARCH_FLAGS.get().is_none_or(|f| f & BOOT_ARCH_VGA_NOT_PRESENT == 0)
	}

	pub fn hpet_base() -> Option<PhysAddr> {
		HPET_BASE.get().copied()
	}

	/// Powers the machine off through PM1a, when the FADT and DSDT gave
	/// us the recipe. Returns only on failure.
	pub fn poweroff() {
		if let (Some(&port), Some(&slp_typa)) = (PM1A_CNT_BLK.get(), SLP_TYPA.get()) {
			let bits = (u16::from(slp_typa) << 10) | SLP_EN;
			info!("ACPI poweroff (port {port:#x}, value {bits:#x})");
			unsafe {
				Port::<u16>::new(port).write(bits);
			}
		} else {
			warn!("ACPI poweroff is not available");
		}
	}

	/// Walks the ACPI directory. `Err(NoRsdp)` sends the caller down
	/// the MP-table fallback path.
	pub fn init() -> Result<(), AcpiError> {
		let root = detect_acpi()?;

		let directory = AcpiTable::map(root.sdt);
		let signature = directory.header.signature();
		let expect_xsdt = root.revision >= 2;
		if (expect_xsdt && signature != "XSDT") || (!expect_xsdt && signature != "RSDT") {
			return Err(AcpiError::BadSignature);
		}
		directory.verify()?;

		let entry_size = if expect_xsdt {
			mem::size_of::<u64>()
		} else {
			mem::size_of::<u32>()
		};

		let mut current = directory.table_start_address();
		while current < directory.table_end_address() {
			let table_paddr = if expect_xsdt {
				unsafe { (current as *const u64).read_unaligned() }
			} else {
				u64::from(unsafe { (current as *const u32).read_unaligned() })
			};
			current += entry_size;

			let table = AcpiTable::map(PhysAddr::new(table_paddr));
			let signature = table.header.signature();
			debug!("ACPI table \"{signature}\" at {table_paddr:#x}");

			match signature {
				"APIC" => {
					table.verify()?;
					MADT.set(table).ok();
				}
				"FACP" => {
					table.verify()?;
					parse_fadt(table);
				}
				"HPET" => {
					table.verify()?;
					parse_hpet(table);
				}
				"SSDT" => {
					if table.verify().is_ok() {
						search_s5(&table);
					}
				}
				_ => {}
			}
		}

		Ok(())
	}
}
