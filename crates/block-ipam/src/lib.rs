//! Block-based IP Address Management
//!
//! Hands container workloads addresses drawn from administrator-configured
//! pools while many hosts allocate concurrently against one shared
//! datastore:
//! - Pools carved into fixed-size blocks with host affinity
//! - Optimistic, sequence-conditioned block writes with bounded retry
//! - Ordered pool selection with disabled-pool exclusion
//! - Explicit (caller-chosen) and automatic allocation
//! - Dual-stack attach and idempotent release
//!
//! Features:
//! - Pluggable [`Datastore`] with an in-memory implementation
//! - Validated plugin configuration ([`NetConf`] -> [`AssignConfig`])
//! - Affinity borrowing, reclaim and release policies

pub mod allocator;
pub mod config;
pub mod datastore;
pub mod error;
pub mod models;
pub mod release;
pub mod retry;
pub mod selector;
pub mod service;

// Re-export core types
pub use config::{parse_cni_args, AssignConfig, CniArgs, EngineConfig, NetConf};
pub use datastore::{Datastore, DatastoreResult, MemoryDatastore};
pub use error::{DatastoreError, Error, Result};
pub use models::{
    AllocatedAddress, AllocationInfo, AllocationRequest, AssignResult, BlockRecord, Handle,
    IpFamily, Pool, PoolUsage, Versioned,
};
pub use release::AffinityPolicy;
pub use selector::{OrderedPools, PoolSelector, SelectionMode};
pub use service::IpamEngine;

/// Sizing defaults and hard limits
pub mod limits {
    /// Default IPv4 block: 64 addresses
    pub const DEFAULT_IPV4_BLOCK_PREFIX: u8 = 26;

    /// Default IPv6 block: 64 addresses
    pub const DEFAULT_IPV6_BLOCK_PREFIX: u8 = 122;

    /// Largest block is 65536 addresses
    pub const MAX_BLOCK_HOST_BITS: u8 = 16;

    /// Conditional write attempts before giving up with a busy error
    pub const DEFAULT_CAS_RETRIES: u32 = 5;

    /// Block claim attempts per pool per allocation
    pub const DEFAULT_MAX_BLOCK_CLAIMS: u32 = 1024;
}
