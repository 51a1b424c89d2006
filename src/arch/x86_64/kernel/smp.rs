//! SMP bring-up.
//!
//! The BSP starts the application processors one at a time: publish the
//! hand-off variables, copy and patch the trampoline, fire the
//! INIT-SIPI-SIPI sequence, then wait for the newcomer to flip the
//! shared call-in flag at the end of its initialization path.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use super::core_local::{self, Cpu};
use super::{apic, gdt, interrupts, processor, smp_boot};
use crate::config::KERNEL_STACK_ORDER;
use crate::mm::{get_free_pages_top, GfpFlags};

/// Hand-off: the id the next AP adopts.
static AP_CPU_ID: AtomicU32 = AtomicU32::new(0);
/// Hand-off: flipped by the AP once its traps and APIC are live.
static AP_CALLIN: AtomicBool = AtomicBool::new(false);

/// First Rust code on an application processor. Entered from the
/// trampoline with a fresh stack and the final page tables.
extern "C" fn ap_startup() -> ! {
	let cpu_id = AP_CPU_ID.load(Ordering::Acquire);
	let cpu = core_local::cpu(cpu_id).expect("AP started with an unknown CPU id");

	gdt::install_percpu(&cpu);
	interrupts::load_idt();
	core_local::install(cpu_id);
	apic::init(apic::apic_get_mode());

	core_local::set_done(cpu_id);
	AP_CALLIN.store(true, Ordering::Release);

	crate::scheduler::run_tasks(cpu_id);

	loop {
		processor::halt();
	}
}

fn boot_cpu(cpu: &Cpu) {
	if cpu.bsp || !cpu.enabled {
		return;
	}

	// A 2 MiB kernel stack; the trampoline jump plays the role of the
	// call instruction, hence the eight-byte bias.
	let stack_top = get_free_pages_top(KERNEL_STACK_ORDER, GfpFlags::KERNEL)
		.expect("Out of memory for an AP stack");

	AP_CPU_ID.store(cpu.id, Ordering::Release);
	AP_CALLIN.store(false, Ordering::Release);

	unsafe {
		smp_boot::install(
			crate::arch::x86_64::mm::paging::root_table_paddr().as_u64(),
			stack_top.as_u64() - 8,
			ap_startup as usize as u64,
		);
	}

	debug!("Starting AP {} (APIC id {})", cpu.id, cpu.apic_id);

	// INIT, deassert window, then two start-up IPIs; the ICR busy flag
	// is drained before every shot.
	apic::send_init(cpu.apic_id);
	processor::udelay(10_000);

	apic::send_sipi(cpu.apic_id, smp_boot::sipi_vector());
	processor::udelay(200);
	apic::send_sipi(cpu.apic_id, smp_boot::sipi_vector());
	apic::apic_wait_ready();

	while !AP_CALLIN.load(Ordering::Acquire) {
		processor::cpu_relax();
	}

	debug!("AP {} is up", cpu.id);
}

/// Boots every enabled non-BSP processor, strictly one at a time.
pub fn init() {
	let cpus = core_local::cpus();
	info!("Initializing SMP support ({} CPUs)", cpus.len());

	for cpu in &cpus {
		boot_cpu(cpu);
	}
}
