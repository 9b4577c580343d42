//! Synchronization primitives for environments without an OS lock.

pub mod mutex;
