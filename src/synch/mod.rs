//! Synchronization primitives

pub mod semaphore;
