#[allow(dead_code)]
pub const KERNEL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Size of the kernel stack handed to every application processor and task.
pub const KERNEL_STACK_SIZE: usize = 0x20_0000;

/// Order of a kernel stack allocation (one 2 MiB frame).
pub const KERNEL_STACK_ORDER: usize = crate::mm::PAGE_ORDER_2M;

/// Maximum number of logical CPUs the static tables are sized for.
pub const MAX_CPUS: usize = 64;

/// Maximum number of I/O APICs the topology tables are sized for.
pub const MAX_IOAPICS: usize = 8;

/// Maximum number of IRQ override records per system bus.
pub const MAX_IRQ_OVERRIDES: usize = 32;

/// Maximum number of console sinks that can be registered: the four COM
/// ports, the QEMU debug console, and room for external sinks.
pub const MAX_CONSOLE_SINKS: usize = 8;

/// Size of the shared `printk` formatting buffer.
pub const CONSOLE_BUFFER_SIZE: usize = 1024;

/// Base of the identity-mapped virtual address-space window.
pub const VIRT_IDENT_BASE: u64 = 0x0;

/// Base of the user virtual address-space window.
pub const VIRT_USER_BASE: u64 = 0x40_0000;

/// Base of the kernel virtual address-space window (-2 GiB).
pub const VIRT_KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Physical load address of the kernel image.
pub const KERNEL_PHYS_BASE: u64 = 0x10_0000;

/// Physical page the AP boot trampoline is copied to.
/// The SIPI vector addressing scheme limits this to the first 1 MiB.
pub const AP_TRAMPOLINE_ADDRESS: u64 = 0x8000;
