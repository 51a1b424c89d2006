//! A bare-metal x86-64 micro-kernel that hosts hardware and
//! micro-architectural experiments.
//!
//! The kernel is entered by a Multiboot2 loader, promotes the boot
//! processor into long mode, brings up memory management and the
//! interrupt plumbing, enumerates the CPU topology via ACPI (with an MP
//! table fallback), starts the application processors, and then drives
//! the test routines named on the command line across the CPUs. The
//! value is the substrate: a reproducible environment in which a single
//! routine may freely poke CR registers, MSRs, page tables, the APIC,
//! caches, and the TLB.

#![cfg_attr(target_os = "none", no_std)]
#![allow(clippy::missing_safety_doc)]

extern crate alloc;
#[macro_use]
extern crate log;

#[macro_use]
mod macros;

pub mod arch;
pub mod collections;
pub mod config;
pub mod console;
pub mod env;
pub mod errno;
mod logging;
pub mod mm;
pub mod scheduler;
pub mod symbols;
pub mod synch;
pub mod testcases;

#[cfg(target_os = "none")]
use crate::arch::x86_64::kernel::{
	acpi, apic, core_local, gdt, interrupts, ioapic, madt, mptable, multiboot, processor, serial,
};

/// Entry point of the boot processor, called with interrupts disabled on
/// the static boot stack.
#[cfg(target_os = "none")]
fn boot_processor_main(magic: u32, mbi: usize) -> ! {
	// Output first: a default-configured COM1 behind the console
	// fan-out, then the logger on top of it.
	serial::init();
	unsafe {
		logging::init();
	}

	info!("");
	info!("KTF - Kernel Test Framework!");
	info!("rig {}", config::KERNEL_VERSION);
	info!("");

	// Early trap plumbing on the transient GDT and TSS, so that every
	// fault from here on is reported instead of triple-faulting.
	arch::x86_64::kernel::install_boot_tss();
	interrupts::install();

	multiboot::init(magic, mbi);

	// Physical memory, the scratch window, the final page tables, and
	// the heap, in that strict order.
	mm::physicalmem::init();
	arch::x86_64::mm::paging::init();
	arch::x86_64::kernel::reload_boot_gdt();
	mm::virtualmem::init_pagetables();
	mm::init_heap();

	env::init();
	if env::options().qemu_console {
		serial::enable_qemu_console();
	}
	if env::options().fpu {
		processor::enable_fpu();
	}
	processor::print_information();
	mm::print_information();

	// Topology: ACPI first, MP tables when no RSDP exists.
	let nr_cpus = match acpi::init() {
		Ok(()) => madt::init().expect("MADT discovery failed"),
		Err(acpi::AcpiError::NoRsdp) => {
			info!("No ACPI tables, falling back to MP tables");
			mptable::init().expect("MP-table discovery failed")
		}
		Err(err) => panic!("ACPI discovery failed: {err}"),
	};
	info!("Topology: {nr_cpus} usable CPUs");

	// Rebuild the BSP's segmentation inside its per-CPU page and mirror
	// the id for rdtscp.
	let bsp = core_local::bsp();
	gdt::install_percpu(&bsp);
	interrupts::load_idt();
	core_local::install(bsp.id);
	core_local::set_done(bsp.id);

	// Interrupt controllers: the local APIC in the best supported mode,
	// then the I/O APIC redirections for the legacy devices we keep.
	let mode = if processor::supports_x2apic() {
		apic::ApicMode::X2Apic
	} else {
		apic::ApicMode::XApic
	};
	apic::init(mode);

	ioapic::mask_all();
	if env::options().keyboard && acpi::has_i8042() {
		ioapic::route_isa_irq(1, 0x21, bsp.apic_id as u8).ok();
	}
	if env::options().pit {
		ioapic::route_isa_irq(0, 0x20, bsp.apic_id as u8).ok();
	}
	if env::options().apic_timer {
		let ticks_per_us = apic::calibrate_timer();
		info!("APIC timer: {ticks_per_us} ticks per microsecond");
	}
	if env::options().hpet {
		match acpi::hpet_base() {
			Some(base) => info!("HPET available at {base:p}"),
			None => warn!("HPET requested but not present"),
		}
	}

	#[cfg(feature = "smp")]
	arch::x86_64::kernel::smp::init();

	apic::print_information();

	// Boot-only code and data have served their purpose.
	mm::regions::reclaim_init_sections();

	run_requested_tests(nr_cpus, bsp.id);

	info!("All tasks done.");

	if env::options().poweroff {
		acpi::poweroff();
	}

	loop {
		interrupts::disable();
		processor::halt();
	}
}

/// Creates one task per `tests=` entry, spreads them round-robin over
/// the CPUs, runs the boot CPU's share, and waits for the rest.
#[cfg(target_os = "none")]
fn run_requested_tests(nr_cpus: u32, bsp_id: u32) {
	let options = env::options();
	if options.tests.is_empty() {
		info!("No tests requested");
		return;
	}

	let mut tasks = alloc::vec::Vec::new();
	for name in &options.tests {
		let Some(case) = testcases::lookup(name.as_str()) else {
			warn!("Test {} not found", name.as_str());
			continue;
		};
		match scheduler::new_task(case.name, case.entry, 0) {
			Ok(task) => tasks.push(task),
			Err(err) => warn!("Cannot create task {}: {err}", case.name),
		}
	}

	// Hand out work one task per CPU; a CPU gets its next task only once
	// the previous one is done. The boot CPU doubles as the dispatcher
	// and runs its own share in place of a scheduler loop.
	let mut next = 0usize;
	loop {
		for cpu in 0..nr_cpus {
			if scheduler::get_task_for_cpu(cpu).is_none() {
				if let Some(task) = tasks.get(next) {
					scheduler::schedule_task(task, cpu);
					next += 1;
				}
			}
		}

		if let Some(task) = scheduler::get_task_for_cpu(bsp_id) {
			if task.state() == scheduler::TaskState::Scheduled {
				scheduler::run_task_inline(task);
			}
		}

		if tasks
			.iter()
			.all(|task| task.state() == scheduler::TaskState::Done)
		{
			break;
		}
		processor::cpu_relax();
	}

	scheduler::wait_for_all_tasks();

	for name in &options.tests {
		if let Some(task) = scheduler::get_task_by_name(name.as_str()) {
			info!("Test {} returned: {:#x}", task.name, task.result());
		}
	}

	// Release the application processors from their run loops.
	scheduler::terminate();
}

#[cfg(target_os = "none")]
mod runtime_glue {
	use core::panic::PanicInfo;

	use crate::arch::x86_64::kernel::{core_local, interrupts, processor};

	#[panic_handler]
	fn panic(info: &PanicInfo<'_>) -> ! {
		// The banner goes straight through println: the logger could be
		// the component that panicked.
		println!();
		match core_local::try_core_id() {
			Some(cpu) => println!("PANIC: CPU[{cpu}]: {info}"),
			None => println!("PANIC: {info}"),
		}

		// Other CPUs keep running until they hit a wait or panic too.
		loop {
			interrupts::disable();
			processor::halt();
		}
	}
}
