#![allow(dead_code)]

use core::arch::asm;
use core::hint::spin_loop;

use hermit_sync::Lazy;
use raw_cpuid::{CpuId, CpuIdReaderNative};
use x86_64::registers::model_specific::Msr;

use crate::errno::Errno;

/// CPU id of the running processor, mirrored by `percpu` initialization.
pub const MSR_TSC_AUX: u32 = 0xc000_0103;

/// Page Attribute Table.
pub const MSR_PAT: u32 = 0x277;

pub const MSR_MTRR_CAP: u32 = 0xfe;
pub const MSR_MTRR_DEF_TYPE: u32 = 0x2ff;
/// First variable-range MTRR; base/mask pairs are interleaved upwards.
pub const MSR_MTRR_PHYS_BASE0: u32 = 0x200;

static CPUID: Lazy<CpuId<CpuIdReaderNative>> = Lazy::new(CpuId::new);

#[derive(Debug)]
struct Features {
	physical_address_bits: u8,
	supports_1gib_pages: bool,
	supports_x2apic: bool,
	supports_tsc_deadline: bool,
	supports_fpu: bool,
	/// TSC frequency in MHz; zero when CPUID does not report one.
	tsc_mhz: u32,
}

static FEATURES: Lazy<Features> = Lazy::new(|| {
	let feature_info = CPUID.get_feature_info();
	let extended = CPUID.get_extended_processor_and_feature_identifiers();

	let tsc_mhz = CPUID
		.get_tsc_info()
		.and_then(|tsc| tsc.tsc_frequency())
		.map(|hz| (hz / 1_000_000) as u32)
		.or_else(|| {
			CPUID
				.get_processor_frequency_info()
				.map(|freq| u32::from(freq.processor_base_frequency()))
		})
		.unwrap_or(0);

	Features {
		physical_address_bits: CPUID
			.get_processor_capacity_feature_info()
			.map_or(36, |info| info.physical_address_bits()),
		supports_1gib_pages: extended.as_ref().is_some_and(|f| f.has_1gib_pages()),
		supports_x2apic: feature_info.as_ref().is_some_and(|f| f.has_x2apic()),
		supports_tsc_deadline: feature_info.as_ref().is_some_and(|f| f.has_tsc_deadline()),
		supports_fpu: feature_info.as_ref().is_some_and(|f| f.has_fpu()),
		tsc_mhz,
	}
});

pub fn get_physical_address_bits() -> u8 {
	FEATURES.physical_address_bits
}

pub fn supports_1gib_pages() -> bool {
	FEATURES.supports_1gib_pages
}

pub fn supports_x2apic() -> bool {
	FEATURES.supports_x2apic
}

pub fn supports_tsc_deadline() -> bool {
	FEATURES.supports_tsc_deadline
}

pub fn supports_fpu() -> bool {
	FEATURES.supports_fpu
}

/// TSC frequency in MHz. Falls back to a conservative guess when the
/// hypervisor or CPUID stays silent; `udelay` then waits too long rather
/// than too short.
pub fn get_frequency() -> u32 {
	match FEATURES.tsc_mhz {
		0 => 2000,
		mhz => mhz,
	}
}

pub fn print_information() {
	let vendor = CPUID.get_vendor_info();
	info!(
		"CPU: {} ({} MHz TSC, {} physical address bits)",
		vendor.as_ref().map_or("unknown", |v| v.as_str()),
		get_frequency(),
		get_physical_address_bits()
	);
	info!(
		"CPU features: x2apic={} 1gib-pages={} tsc-deadline={}",
		supports_x2apic(),
		supports_1gib_pages(),
		supports_tsc_deadline()
	);
}

#[inline]
pub fn rdtsc() -> u64 {
	unsafe { core::arch::x86_64::_rdtsc() }
}

/// Reads the TSC together with `IA32_TSC_AUX`, which percpu init loads
/// with the CPU id.
#[inline]
pub fn rdtscp() -> (u64, u32) {
	let mut aux = 0u32;
	let tsc = unsafe { core::arch::x86_64::__rdtscp(&mut aux) };
	(tsc, aux)
}

#[inline]
pub fn cpu_relax() {
	spin_loop();
}

pub fn halt() {
	x86_64::instructions::hlt();
}

/// Busy-waits at least `us` microseconds on the TSC.
pub fn udelay(us: u64) {
	let deadline = rdtsc() + us * u64::from(get_frequency());
	while rdtsc() < deadline {
		cpu_relax();
	}
}

pub unsafe fn rdmsr(msr: u32) -> u64 {
	unsafe { Msr::new(msr).read() }
}

pub unsafe fn wrmsr(msr: u32, value: u64) {
	unsafe { Msr::new(msr).write(value) }
}

/// Reads an MSR, surviving the #GP a bogus register number raises.
///
/// The faulting instruction carries an entry in the `extables` section;
/// the exception handler resets the instruction pointer to the fixup
/// label, which reports the failure instead of crashing.
pub fn rdmsr_safe(msr: u32) -> Result<u64, Errno> {
	let lo: u32;
	let hi: u32;
	let fault: u32;

	unsafe {
		asm!(
			"2:",
			"rdmsr",
			"xor {fault:e}, {fault:e}",
			"jmp 4f",
			"3:",
			"mov {fault:e}, 1",
			"xor eax, eax",
			"xor edx, edx",
			"4:",
			".pushsection extables, \"a\"",
			".balign 8",
			".quad 2b",
			".quad 3b",
			".quad 0",
			".popsection",
			in("ecx") msr,
			out("eax") lo,
			out("edx") hi,
			fault = out(reg) fault,
			options(nostack),
		);
	}

	if fault == 0 {
		Ok((u64::from(hi) << 32) | u64::from(lo))
	} else {
		Err(Errno::Fault)
	}
}

/// Writes an MSR, surviving the #GP a bogus register or value raises.
pub fn wrmsr_safe(msr: u32, value: u64) -> Result<(), Errno> {
	let fault: u32;

	unsafe {
		asm!(
			"2:",
			"wrmsr",
			"xor {fault:e}, {fault:e}",
			"jmp 4f",
			"3:",
			"mov {fault:e}, 1",
			"4:",
			".pushsection extables, \"a\"",
			".balign 8",
			".quad 2b",
			".quad 3b",
			".quad 0",
			".popsection",
			in("ecx") msr,
			in("eax") value as u32,
			in("edx") (value >> 32) as u32,
			fault = out(reg) fault,
			options(nostack),
		);
	}

	if fault == 0 { Ok(()) } else { Err(Errno::Fault) }
}

/// Memory types encodable in the PAT and the MTRRs.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum MemoryType {
	Uncacheable = 0x00,
	WriteCombining = 0x01,
	WriteThrough = 0x04,
	WriteProtect = 0x05,
	WriteBack = 0x06,
	UncachedMinus = 0x07,
}

impl MemoryType {
	pub fn from_bits(bits: u8) -> Option<Self> {
		match bits {
			0x00 => Some(Self::Uncacheable),
			0x01 => Some(Self::WriteCombining),
			0x04 => Some(Self::WriteThrough),
			0x05 => Some(Self::WriteProtect),
			0x06 => Some(Self::WriteBack),
			0x07 => Some(Self::UncachedMinus),
			_ => None,
		}
	}
}

/// The eight 8-bit fields of `IA32_PAT`.
#[inline]
pub fn pat_entry(pat: u64, index: usize) -> Option<MemoryType> {
	assert!(index < 8);
	MemoryType::from_bits(((pat >> (index * 8)) & 0xff) as u8)
}

#[inline]
pub fn set_pat_entry(pat: u64, index: usize, mt: MemoryType) -> u64 {
	assert!(index < 8);
	let shift = index * 8;
	(pat & !(0xffu64 << shift)) | ((mt as u64) << shift)
}

/// A variable-range MTRR base/mask pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mtrr {
	pub base: u64,
	pub mt: MemoryType,
	pub mask: u64,
	pub valid: bool,
}

const MTRR_VALID: u64 = 1 << 11;

impl Mtrr {
	pub fn encode(self) -> (u64, u64) {
		let base = (self.base & !0xfff) | self.mt as u64;
		let mut mask = self.mask & !0xfff;
		if self.valid {
			mask |= MTRR_VALID;
		}
		(base, mask)
	}

	pub fn decode(base: u64, mask: u64) -> Option<Self> {
		Some(Self {
			base: base & !0xfff,
			mt: MemoryType::from_bits((base & 0xff) as u8)?,
			mask: mask & !0xfff,
			valid: mask & MTRR_VALID != 0,
		})
	}
}

/// Number of variable-range MTRRs reported by `IA32_MTRRCAP`.
pub fn mtrr_count() -> u8 {
	rdmsr_safe(MSR_MTRR_CAP).map_or(0, |cap| (cap & 0xff) as u8)
}

pub fn read_mtrr(index: u8) -> Result<Mtrr, Errno> {
	let base = rdmsr_safe(MSR_MTRR_PHYS_BASE0 + 2 * u32::from(index))?;
	let mask = rdmsr_safe(MSR_MTRR_PHYS_BASE0 + 2 * u32::from(index) + 1)?;
	Mtrr::decode(base, mask).ok_or(Errno::Inval)
}

pub fn write_mtrr(index: u8, mtrr: Mtrr) -> Result<(), Errno> {
	let (base, mask) = mtrr.encode();
	wrmsr_safe(MSR_MTRR_PHYS_BASE0 + 2 * u32::from(index), base)?;
	wrmsr_safe(MSR_MTRR_PHYS_BASE0 + 2 * u32::from(index) + 1, mask)
}

/// Enables the FPU/SSE state machinery, for experiments that touch
/// vector state. Gated by the `fpu` command-line flag.
#[cfg(target_os = "none")]
pub fn enable_fpu() {
	use x86_64::registers::control::{Cr0, Cr0Flags, Cr4, Cr4Flags};

	unsafe {
		let mut cr0 = Cr0::read();
		cr0.remove(Cr0Flags::EMULATE_COPROCESSOR);
		cr0.insert(Cr0Flags::MONITOR_COPROCESSOR);
		Cr0::write(cr0);

		let mut cr4 = Cr4::read();
		cr4.insert(Cr4Flags::OSFXSR | Cr4Flags::OSXMMEXCPT_ENABLE);
		Cr4::write(cr4);

		core::arch::asm!("fninit", options(nomem, nostack));
	}
	info!("FPU enabled");
}

/// Flushes the cache line holding `ptr`.
#[inline]
pub fn clflush<T>(ptr: *const T) {
	unsafe {
		core::arch::x86_64::_mm_clflush(ptr.cast());
	}
}

/// Serialized, timed read of one cache line. The caller compares cold
/// and warm numbers; absolute values are machine-specific.
pub fn cache_read_access_time<T>(ptr: *const T) -> u64 {
	let start: u64;
	let end: u64;
	unsafe {
		asm!(
			"mfence",
			"lfence",
			"rdtsc",
			"shl rdx, 32",
			"or rax, rdx",
			"mov {start}, rax",
			"mov al, byte ptr [{line}]",
			"lfence",
			"rdtsc",
			"shl rdx, 32",
			"or rax, rdx",
			"mov {end}, rax",
			line = in(reg) ptr,
			start = out(reg) start,
			end = out(reg) end,
			out("rax") _,
			out("rdx") _,
			options(nostack),
		);
	}
	end - start
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn pat_field_encoding() {
		// The power-on default PAT.
		let pat = 0x0007_0406_0007_0406u64;
		assert_eq!(pat_entry(pat, 0), Some(MemoryType::WriteBack));
		assert_eq!(pat_entry(pat, 1), Some(MemoryType::WriteThrough));
		assert_eq!(pat_entry(pat, 3), Some(MemoryType::Uncacheable));

		let patched = set_pat_entry(pat, 1, MemoryType::WriteCombining);
		assert_eq!(pat_entry(patched, 1), Some(MemoryType::WriteCombining));
		// Neighboring entries are untouched.
		assert_eq!(pat_entry(patched, 0), Some(MemoryType::WriteBack));
		assert_eq!(pat_entry(patched, 2), Some(MemoryType::UncachedMinus));
	}

	#[test]
	fn mtrr_round_trip() {
		let mtrr = Mtrr {
			base: 0xfee0_0000,
			mt: MemoryType::Uncacheable,
			mask: 0xf_ffff_0000,
			valid: true,
		};
		let (base, mask) = mtrr.encode();
		assert_eq!(mask & MTRR_VALID, MTRR_VALID);
		assert_eq!(Mtrr::decode(base, mask), Some(mtrr));
	}

	#[test]
	fn mtrr_rejects_reserved_memory_type() {
		assert_eq!(Mtrr::decode(0x0000_0002, 0), None);
		assert_eq!(MemoryType::from_bits(0x03), None);
	}
}
