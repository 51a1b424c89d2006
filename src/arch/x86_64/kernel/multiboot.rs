//! Multiboot2 information block parsing.
//!
//! The loader leaves the info block somewhere in low memory; everything
//! the kernel needs later (command line, memory map, RSDP, framebuffer)
//! is copied out in situ before the frame allocator may hand those
//! frames to somebody else.

use core::ops::Range;

use heapless::{String, Vec};
use hermit_sync::OnceCell;
use memory_addresses::PhysAddr;
use multiboot2::{BootInformation, BootInformationHeader, MemoryAreaType};

/// Magic the loader passes in `eax`.
pub const MULTIBOOT2_BOOTLOADER_MAGIC: u32 = 0x36d7_6289;

const MAX_MEMORY_RANGES: usize = 16;
const MAX_CMDLINE: usize = 1024;

/// Root ACPI directory table as announced by the loader: the XSDT for
/// ACPI 2.0+, the RSDT before that.
#[derive(Clone, Copy, Debug)]
pub struct AcpiRoot {
	pub revision: u8,
	pub sdt: PhysAddr,
}

/// Framebuffer geometry, kept only for the console collaborators.
#[derive(Clone, Copy, Debug)]
pub struct FramebufferInfo {
	pub address: u64,
	pub pitch: u32,
	pub width: u32,
	pub height: u32,
	pub bpp: u8,
}

#[derive(Debug)]
struct BootData {
	cmdline: String<MAX_CMDLINE>,
	bootloader: String<64>,
	available: Vec<Range<u64>, MAX_MEMORY_RANGES>,
	acpi_root: Option<AcpiRoot>,
	framebuffer: Option<FramebufferInfo>,
	load_base: Option<u32>,
}

static BOOT_DATA: OnceCell<BootData> = OnceCell::new();

/// Tag types we consume (or deliberately ignore); everything else is
/// logged and skipped.
const KNOWN_TAGS: [u32; 12] = [1, 2, 3, 4, 5, 6, 8, 11, 12, 14, 15, 21];

fn log_unknown_tags(mbi: usize) {
	// Generic walk over the raw tag stream: (type, size) pairs padded to
	// eight bytes, terminated by type 0.
	let total_size = unsafe { (mbi as *const u32).read() } as usize;
	let mut offset = 8;
	while offset + 8 <= total_size {
		let typ = unsafe { ((mbi + offset) as *const u32).read() };
		let size = unsafe { ((mbi + offset + 4) as *const u32).read() } as usize;
		if typ == 0 {
			break;
		}
		if !KNOWN_TAGS.contains(&typ) {
			debug!("Skipping unknown Multiboot2 tag type {typ} ({size} bytes)");
		}
		offset += size.next_multiple_of(8);
	}
}

/// Parses the info block. `mbi` is the physical address handed over by
/// the loader; at this point it is identity-mapped by the boot tables.
pub fn init(magic: u32, mbi: usize) {
	assert_eq!(
		magic, MULTIBOOT2_BOOTLOADER_MAGIC,
		"Not booted by a Multiboot2-compliant loader (magic {magic:#x})"
	);

	let info = unsafe { BootInformation::load(mbi as *const BootInformationHeader) }
		.expect("Cannot parse the Multiboot2 information block");

	let mut data = BootData {
		cmdline: String::new(),
		bootloader: String::new(),
		available: Vec::new(),
		acpi_root: None,
		framebuffer: None,
		load_base: None,
	};

	if let Some(tag) = info.command_line_tag() {
		if let Ok(cmdline) = tag.cmdline() {
			// Length capping; an overlong command line is truncated.
			let take = cmdline.len().min(MAX_CMDLINE);
			data.cmdline.push_str(&cmdline[..take]).ok();
		}
	}

	if let Some(tag) = info.boot_loader_name_tag() {
		if let Ok(name) = tag.name() {
			let take = name.len().min(64);
			data.bootloader.push_str(&name[..take]).ok();
		}
	}

	for module in info.module_tags() {
		debug!(
			"Multiboot2 module at {:#x}..{:#x}",
			module.start_address(),
			module.end_address()
		);
	}

	if let Some(meminfo) = info.basic_memory_info_tag() {
		debug!(
			"Basic memory info: lower {} KiB, upper {} KiB",
			meminfo.memory_lower(),
			meminfo.memory_upper()
		);
	}

	let mmap = info
		.memory_map_tag()
		.expect("The loader did not supply a memory map");
	for area in mmap.memory_areas() {
		if MemoryAreaType::from(area.typ()) == MemoryAreaType::Available {
			data.available
				.push(area.start_address()..area.end_address())
				.expect("Too many memory ranges in the Multiboot2 memory map");
		}
	}

	// Prefer the ACPI 2.0 pointer when the loader hands us both. The tag
	// itself lives in the info block and may be recycled, so only the
	// directory-table address survives.
	if let Some(rsdp) = info.rsdp_v2_tag() {
		data.acpi_root = Some(AcpiRoot {
			revision: rsdp.revision(),
			sdt: PhysAddr::new(rsdp.xsdt_address() as u64),
		});
	} else if let Some(rsdp) = info.rsdp_v1_tag() {
		data.acpi_root = Some(AcpiRoot {
			revision: rsdp.revision(),
			sdt: PhysAddr::new(rsdp.rsdt_address() as u64),
		});
	}

	if let Some(Ok(fb)) = info.framebuffer_tag() {
		// Only INDEXED and RGB framebuffers are usable by the console
		// collaborators; EGA text mode is not.
		if fb.bpp() >= 8 {
			data.framebuffer = Some(FramebufferInfo {
				address: fb.address(),
				pitch: fb.pitch(),
				width: fb.width(),
				height: fb.height(),
				bpp: fb.bpp(),
			});
		}
	}

	if let Some(tag) = info.load_base_addr_tag() {
		data.load_base = Some(tag.load_base_addr());
	}

	log_unknown_tags(mbi);

	info!(
		"Booted by \"{}\" ({} available memory ranges)",
		data.bootloader.as_str(),
		data.available.len()
	);

	BOOT_DATA.set(data).expect("Multiboot data parsed twice");
}

fn data() -> &'static BootData {
	BOOT_DATA.get().expect("Multiboot data queried before init")
}

pub fn cmdline() -> &'static str {
	data().cmdline.as_str()
}

pub fn available_memory_ranges() -> impl Iterator<Item = Range<u64>> {
	data().available.iter().cloned()
}

/// The ACPI root directory the loader discovered, if any.
pub fn acpi_root() -> Option<AcpiRoot> {
	data().acpi_root
}

pub fn framebuffer() -> Option<FramebufferInfo> {
	data().framebuffer
}
