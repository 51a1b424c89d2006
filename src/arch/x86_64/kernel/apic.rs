//! Local APIC driver.
//!
//! The mode is chosen once at initialization: disabled, xAPIC through the
//! MMIO window, or x2APIC through the MSR register file. Every register
//! access funnels through [`apic_read`]/[`apic_write`], which dispatch on
//! the active mode; the 64-bit x2APIC ICR layout is the canonical form
//! and is split for the xAPIC register pair on the fly.

use core::sync::atomic::{AtomicU8, Ordering};

/// `IA32_APIC_BASE` and its mode bits.
pub const MSR_APIC_BASE: u32 = 0x1b;
pub const APIC_BASE_ENABLE: u64 = 1 << 11;
pub const APIC_BASE_EXTD: u64 = 1 << 10;
pub const APIC_BASE_BSP: u64 = 1 << 8;

/// First MSR of the x2APIC register file; xAPIC MMIO offsets map to it
/// as `base + (reg >> 4)`.
pub const MSR_X2APIC_REGS: u32 = 0x800;

/// xAPIC MMIO register offsets (the canonical naming).
pub const APIC_ID: u32 = 0x020;
pub const APIC_VERSION: u32 = 0x030;
pub const APIC_TPR: u32 = 0x080;
pub const APIC_EOI: u32 = 0x0b0;
pub const APIC_SPIV: u32 = 0x0f0;
pub const APIC_ESR: u32 = 0x280;
pub const APIC_ICR: u32 = 0x300;
pub const APIC_ICR2: u32 = 0x310;
pub const APIC_LVT_TIMER: u32 = 0x320;
pub const APIC_LVT_THERMAL: u32 = 0x330;
pub const APIC_LVT_PERF: u32 = 0x340;
pub const APIC_LVT_LINT0: u32 = 0x350;
pub const APIC_LVT_LINT1: u32 = 0x360;
pub const APIC_LVT_ERROR: u32 = 0x370;
pub const APIC_TMICT: u32 = 0x380;
pub const APIC_TMCCT: u32 = 0x390;
pub const APIC_TDCR: u32 = 0x3e0;

pub const APIC_SPIV_ENABLE: u32 = 1 << 8;
/// Spurious interrupts land on the canonical vector 0xff.
pub const SPURIOUS_VECTOR: u8 = 0xff;

pub const APIC_LVT_MASKED: u32 = 1 << 16;
pub const APIC_LVT_DELIVERY_NMI: u32 = 0b100 << 8;

/// ICR fields, 64-bit x2APIC layout.
pub const APIC_ICR_BUSY: u64 = 1 << 12;
pub const APIC_ICR_LEVEL_ASSERT: u64 = 1 << 14;
pub const APIC_ICR_TRIGGER_LEVEL: u64 = 1 << 15;
pub const APIC_ICR_DELIVERY_INIT: u64 = 0b101 << 8;
pub const APIC_ICR_DELIVERY_SIPI: u64 = 0b110 << 8;
pub const APIC_ICR_DEST_SHIFT: u64 = 32;

pub const APIC_TDCR_DIVIDE_BY_8: u32 = 0b0010;

/// The three driver states.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ApicMode {
	Disabled = 0,
	XApic = 1,
	X2Apic = 2,
}

static APIC_MODE: AtomicU8 = AtomicU8::new(ApicMode::Disabled as u8);

pub fn apic_get_mode() -> ApicMode {
	match APIC_MODE.load(Ordering::Acquire) {
		1 => ApicMode::XApic,
		2 => ApicMode::X2Apic,
		_ => ApicMode::Disabled,
	}
}

/// xAPIC register offset to x2APIC MSR translation.
#[inline]
pub const fn reg_to_msr(reg: u32) -> u32 {
	MSR_X2APIC_REGS + (reg >> 4)
}

/// `IA32_APIC_BASE` value for a requested mode, preserving base and BSP.
pub fn base_msr_for_mode(current: u64, mode: ApicMode) -> u64 {
	let cleared = current & !(APIC_BASE_ENABLE | APIC_BASE_EXTD);
	match mode {
		ApicMode::Disabled => cleared,
		ApicMode::XApic => cleared | APIC_BASE_ENABLE,
		ApicMode::X2Apic => cleared | APIC_BASE_ENABLE | APIC_BASE_EXTD,
	}
}

/// Splits a 64-bit ICR value into the xAPIC (ICR2, ICR) pair.
pub fn icr_split(value: u64) -> (u32, u32) {
	let dest = ((value >> APIC_ICR_DEST_SHIFT) as u32) << 24;
	(dest, value as u32)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn register_to_msr_mapping() {
		assert_eq!(reg_to_msr(APIC_ID), 0x802);
		assert_eq!(reg_to_msr(APIC_SPIV), 0x80f);
		assert_eq!(reg_to_msr(APIC_ICR), 0x830);
		assert_eq!(reg_to_msr(APIC_TMICT), 0x838);
	}

	#[test]
	fn base_msr_transitions() {
		let base = 0xfee0_0900; // base | BSP
		assert_eq!(
			base_msr_for_mode(base, ApicMode::XApic),
			base | APIC_BASE_ENABLE
		);
		assert_eq!(
			base_msr_for_mode(base, ApicMode::X2Apic),
			base | APIC_BASE_ENABLE | APIC_BASE_EXTD
		);
		assert_eq!(
			base_msr_for_mode(base | APIC_BASE_ENABLE | APIC_BASE_EXTD, ApicMode::Disabled),
			base
		);
	}

	#[test]
	fn icr_destination_moves_to_icr2() {
		let value = (0x17u64 << APIC_ICR_DEST_SHIFT)
			| APIC_ICR_DELIVERY_SIPI
			| APIC_ICR_LEVEL_ASSERT
			| 0x08;
		let (icr2, icr) = icr_split(value);
		assert_eq!(icr2, 0x17 << 24);
		assert_eq!(icr, (APIC_ICR_DELIVERY_SIPI | APIC_ICR_LEVEL_ASSERT) as u32 | 0x08);
	}
}

#[cfg(target_os = "none")]
pub use self::hw::*;

#[cfg(target_os = "none")]
mod hw {
	use core::sync::atomic::AtomicU64;

	use memory_addresses::PhysAddr;

	use super::*;
	use crate::arch::x86_64::kernel::processor::{self, rdmsr, wrmsr};
	use crate::arch::x86_64::mm::paging::{PteFlags, L1_PROT};
	use crate::mm::virtualmem::vmap_ident_4k;
	use crate::mm::Mfn;

	/// Physical base of the LAPIC MMIO window (MADT/MP discovery).
	static LAPIC_BASE: AtomicU64 = AtomicU64::new(0xfee0_0000);
	/// Identity-window alias of the MMIO page, valid in xAPIC mode.
	static LAPIC_MMIO: AtomicU64 = AtomicU64::new(0);

	pub fn set_lapic_base(base: PhysAddr) {
		LAPIC_BASE.store(base.as_u64(), Ordering::Release);
	}

	/// APIC id of the processor we booted on, from CPUID.
	pub fn bsp_apic_id() -> u32 {
		let result = unsafe { core::arch::x86_64::__cpuid(1) };
		result.ebx >> 24
	}

	fn mmio() -> *mut u32 {
		let mmio = LAPIC_MMIO.load(Ordering::Acquire);
		assert!(mmio != 0, "xAPIC access before the MMIO window is mapped");
		mmio as *mut u32
	}

	pub fn apic_read(reg: u32) -> u32 {
		match apic_get_mode() {
			ApicMode::Disabled => panic!("APIC read {reg:#x} while disabled"),
			ApicMode::XApic => unsafe { mmio().byte_add(reg as usize).read_volatile() },
			ApicMode::X2Apic => unsafe { rdmsr(reg_to_msr(reg)) as u32 },
		}
	}

	pub fn apic_write(reg: u32, value: u32) {
		match apic_get_mode() {
			ApicMode::Disabled => panic!("APIC write {reg:#x} while disabled"),
			ApicMode::XApic => unsafe {
				mmio().byte_add(reg as usize).write_volatile(value);
			},
			ApicMode::X2Apic => unsafe {
				wrmsr(reg_to_msr(reg), u64::from(value));
			},
		}
	}

	/// Writes the interrupt command register; `value` uses the 64-bit
	/// x2APIC layout with the destination in bits 32 and up.
	pub fn apic_icr_write(value: u64) {
		match apic_get_mode() {
			ApicMode::Disabled => panic!("ICR write while the APIC is disabled"),
			ApicMode::XApic => {
				let (icr2, icr) = icr_split(value);
				apic_write(APIC_ICR2, icr2);
				apic_write(APIC_ICR, icr);
			}
			ApicMode::X2Apic => unsafe {
				wrmsr(reg_to_msr(APIC_ICR), value);
			},
		}
	}

	/// Spins while a previous IPI is still being delivered. The busy
	/// flag exists only in xAPIC mode.
	pub fn apic_wait_ready() {
		if apic_get_mode() == ApicMode::XApic {
			while u64::from(apic_read(APIC_ICR)) & APIC_ICR_BUSY != 0 {
				processor::cpu_relax();
			}
		}
	}

	pub fn eoi() {
		apic_write(APIC_EOI, 0);
	}

	pub fn apic_id() -> u32 {
		match apic_get_mode() {
			ApicMode::X2Apic => apic_read(APIC_ID),
			_ => apic_read(APIC_ID) >> 24,
		}
	}

	/// Brings the local APIC of the running CPU into `mode`.
	///
	/// x2APIC is refused when CPUID does not advertise it; the caller
	/// falls back to xAPIC.
	pub fn init(mode: ApicMode) -> ApicMode {
		let mode = match mode {
			ApicMode::X2Apic if !processor::supports_x2apic() => {
				warn!("x2APIC requested but not supported, using xAPIC");
				ApicMode::XApic
			}
			other => other,
		};

		let base = unsafe { rdmsr(MSR_APIC_BASE) };
		unsafe {
			wrmsr(MSR_APIC_BASE, base_msr_for_mode(base, mode));
		}
		APIC_MODE.store(mode as u8, Ordering::Release);

		if mode == ApicMode::Disabled {
			return mode;
		}

		if mode == ApicMode::XApic && LAPIC_MMIO.load(Ordering::Acquire) == 0 {
			let paddr = PhysAddr::new(LAPIC_BASE.load(Ordering::Acquire));
			let va = vmap_ident_4k(
				Mfn::from_paddr(paddr),
				L1_PROT | PteFlags::CACHE_DISABLE | PteFlags::NO_EXECUTE,
			)
			.expect("Cannot map the LAPIC MMIO window");
			LAPIC_MMIO.store(va.as_u64(), Ordering::Release);
		}

		// Mask everything we do not route yet, point the error LVT at
		// its vector, open the TPR, and enable via SPIV.
		apic_write(APIC_LVT_TIMER, APIC_LVT_MASKED);
		apic_write(APIC_LVT_THERMAL, APIC_LVT_MASKED);
		apic_write(APIC_LVT_PERF, APIC_LVT_MASKED);
		apic_write(APIC_LVT_LINT0, APIC_LVT_MASKED);
		apic_write(APIC_LVT_LINT1, APIC_LVT_MASKED);
		apic_write(APIC_LVT_ERROR, 0xfe);
		apic_write(APIC_TPR, 0);
		apic_write(
			APIC_SPIV,
			APIC_SPIV_ENABLE | u32::from(SPURIOUS_VECTOR),
		);

		apply_nmi_overrides();

		debug!(
			"Local APIC {} initialized in {:?} mode",
			apic_id(),
			mode
		);
		mode
	}

	/// Programs LINT pins per the LAPIC-NMI override records targeting
	/// this CPU.
	fn apply_nmi_overrides() {
		use crate::arch::x86_64::kernel::core_local::try_core_id;
		use crate::arch::x86_64::kernel::ioapic;

		let uid = try_core_id().unwrap_or(0);
		ioapic::for_each_nmi_override(uid, |lint, _polarity, _trigger| {
			let reg = if lint == 0 { APIC_LVT_LINT0 } else { APIC_LVT_LINT1 };
			apic_write(reg, APIC_LVT_DELIVERY_NMI);
		});
	}

	/// One-microsecond timer calibration, for the `apic_timer` option.
	pub fn calibrate_timer() -> u64 {
		let calibration_us = 30_000;

		apic_write(APIC_TDCR, APIC_TDCR_DIVIDE_BY_8);
		apic_write(APIC_TMICT, u32::MAX);

		processor::udelay(calibration_us);

		let elapsed = u64::from(u32::MAX - apic_read(APIC_TMCCT));
		apic_write(APIC_TMICT, 0);
		elapsed / calibration_us
	}

	/// Arms a masked one-shot; the caller routes the vector first.
	pub fn set_oneshot_timer(vector: u8, ticks: u32) {
		apic_write(APIC_LVT_TIMER, u32::from(vector));
		apic_write(APIC_TMICT, ticks);
	}

	pub fn send_init(apic_id: u32) {
		apic_wait_ready();
		apic_icr_write(
			(u64::from(apic_id) << APIC_ICR_DEST_SHIFT)
				| APIC_ICR_TRIGGER_LEVEL
				| APIC_ICR_LEVEL_ASSERT
				| APIC_ICR_DELIVERY_INIT,
		);
	}

	pub fn send_sipi(apic_id: u32, vector: u8) {
		apic_wait_ready();
		apic_icr_write(
			(u64::from(apic_id) << APIC_ICR_DEST_SHIFT)
				| APIC_ICR_DELIVERY_SIPI
				| u64::from(vector),
		);
	}

	pub fn print_information() {
		info!(
			"APIC in use: {:?} (LAPIC base {:#x})",
			apic_get_mode(),
			LAPIC_BASE.load(Ordering::Relaxed)
		);
	}
}
