pub mod paging;

pub use memory_addresses::{PhysAddr, VirtAddr};
