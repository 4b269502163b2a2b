//! Datastore interface consumed by the engine
//!
//! The engine keeps no shared state of its own: pools and blocks live in an
//! external, linearizable key-value store that every host talks to. The
//! [`Datastore`] trait is the narrow contract the engine needs from it:
//! reads, create-if-absent and sequence-conditioned writes.
//!
//! # Sequence contract
//!
//! Sequences are per block. A freshly created block is at sequence 1 and
//! every successful conditional write moves it to exactly `expected + 1`.
//! A write whose expected sequence is stale fails with
//! [`DatastoreError::Conflict`] and changes nothing.

mod memory;

pub use memory::MemoryDatastore;

use crate::error::DatastoreError;
use crate::models::{BlockRecord, Pool, Versioned};
use async_trait::async_trait;
use ipnet::IpNet;

/// Result type for datastore calls
pub type DatastoreResult<T> = std::result::Result<T, DatastoreError>;

/// Shared, authoritative address registry
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Fetch one pool by its CIDR
    async fn get_pool(&self, cidr: &IpNet) -> DatastoreResult<Pool>;

    /// All pools in priority order
    async fn list_pools(&self) -> DatastoreResult<Vec<Pool>>;

    /// Fetch a block with its current sequence
    async fn get_block(&self, cidr: &IpNet) -> DatastoreResult<Versioned<BlockRecord>>;

    /// Existing blocks of a pool, ordered by block address
    async fn list_blocks(&self, pool: &IpNet) -> DatastoreResult<Vec<Versioned<BlockRecord>>>;

    /// Create a block unless one already exists at `cidr`
    ///
    /// Exactly one of several racing creators succeeds; the rest receive
    /// [`DatastoreError::AlreadyExists`].
    async fn create_block_if_absent(
        &self,
        cidr: &IpNet,
        record: BlockRecord,
    ) -> DatastoreResult<u64>;

    /// Replace a block if its sequence still equals `expected`
    async fn conditional_write_block(
        &self,
        cidr: &IpNet,
        expected: u64,
        record: BlockRecord,
    ) -> DatastoreResult<u64>;
}
