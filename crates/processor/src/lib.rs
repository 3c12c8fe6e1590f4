//! Function processor runtime primitives.
//!
//! The execution runtime embedded in each function container leases
//! workers through an allocator; this crate provides the worker type, the
//! allocator capability and its two variants.

pub mod allocator;
pub mod worker;

pub use allocator::{
    AllocateError, AllocatorStatisticsSnapshot, FixedPoolWorkerAllocator,
    SingletonWorkerAllocator, WorkerAllocator,
};
pub use worker::Worker;
