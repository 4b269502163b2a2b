//! Block and address allocation
//!
//! Provides:
//! - Deterministic carving of pools into blocks (`cidr`)
//! - Host affinity and block claiming (`AffinityManager`)
//! - Address allocation within blocks (`AddressAllocator`)

pub mod cidr;
mod address_allocator;
mod block_allocator;

pub use address_allocator::AddressAllocator;
pub use block_allocator::{AffinityManager, BlockCursor};
