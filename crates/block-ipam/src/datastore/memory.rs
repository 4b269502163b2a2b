//! In-memory datastore for development and testing
//!
//! Linearizable per key: block mutations go through the map's shard locks,
//! pool reads through a reader-writer lock. The pool administration helpers
//! stand in for the external pool tooling and are not part of [`Datastore`].

use super::{Datastore, DatastoreResult};
use crate::allocator::cidr;
use crate::error::DatastoreError;
use crate::models::{BlockRecord, Pool, Versioned};
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ipnet::IpNet;
use parking_lot::RwLock;

/// In-memory datastore
#[derive(Debug, Default)]
pub struct MemoryDatastore {
    /// Pools sorted by order, then insertion
    pools: RwLock<Vec<Pool>>,
    /// Blocks keyed by block CIDR
    blocks: DashMap<IpNet, Versioned<BlockRecord>>,
}

impl MemoryDatastore {
    /// Create an empty datastore
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a datastore holding the given pools
    pub fn with_pools(pools: impl IntoIterator<Item = Pool>) -> Result<Self> {
        let store = Self::new();
        for pool in pools {
            store.put_pool(pool)?;
        }
        Ok(store)
    }

    /// Insert or replace a pool
    ///
    /// A pool with the same CIDR is replaced in place; any other overlap
    /// is rejected.
    pub fn put_pool(&self, pool: Pool) -> Result<()> {
        cidr::validate_block_prefix(&pool.cidr, pool.block_prefix_len)?;

        let mut pools = self.pools.write();
        if let Some(existing) = pools.iter_mut().find(|p| p.cidr == pool.cidr) {
            *existing = pool;
        } else {
            if let Some(overlap) = pools.iter().find(|p| Self::overlaps(&p.cidr, &pool.cidr)) {
                return Err(Error::InvalidArgument(format!(
                    "pool {} overlaps existing pool {}",
                    pool.cidr, overlap.cidr
                )));
            }
            pools.push(pool);
        }
        // Stable sort keeps insertion order within equal priorities
        pools.sort_by_key(|p| p.order);
        Ok(())
    }

    /// Enable or disable a pool
    pub fn set_pool_disabled(&self, cidr: &IpNet, disabled: bool) -> Result<()> {
        let mut pools = self.pools.write();
        let pool = pools
            .iter_mut()
            .find(|p| p.cidr == cidr.trunc())
            .ok_or_else(|| Error::PoolNotFound(cidr.to_string()))?;
        pool.disabled = disabled;

        tracing::info!(pool = %cidr, disabled, "Updated pool state");
        Ok(())
    }

    /// Remove a pool; its blocks are left in place
    pub fn remove_pool(&self, cidr: &IpNet) -> Option<Pool> {
        let mut pools = self.pools.write();
        let index = pools.iter().position(|p| p.cidr == cidr.trunc())?;
        Some(pools.remove(index))
    }

    /// Number of blocks created so far
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    fn overlaps(a: &IpNet, b: &IpNet) -> bool {
        a.contains(&b.network()) || b.contains(&a.network())
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn get_pool(&self, cidr: &IpNet) -> DatastoreResult<Pool> {
        let target = cidr.trunc();
        self.pools
            .read()
            .iter()
            .find(|p| p.cidr == target)
            .cloned()
            .ok_or_else(|| DatastoreError::NotFound(format!("pool {}", cidr)))
    }

    async fn list_pools(&self) -> DatastoreResult<Vec<Pool>> {
        Ok(self.pools.read().clone())
    }

    async fn get_block(&self, cidr: &IpNet) -> DatastoreResult<Versioned<BlockRecord>> {
        self.blocks
            .get(cidr)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| DatastoreError::NotFound(format!("block {}", cidr)))
    }

    async fn list_blocks(&self, pool: &IpNet) -> DatastoreResult<Vec<Versioned<BlockRecord>>> {
        let mut blocks: Vec<Versioned<BlockRecord>> = self
            .blocks
            .iter()
            .filter(|entry| pool.contains(&entry.key().network()))
            .map(|entry| entry.value().clone())
            .collect();
        blocks.sort_by_key(|b| cidr::addr_to_u128(b.value.cidr.network()));
        Ok(blocks)
    }

    async fn create_block_if_absent(
        &self,
        cidr: &IpNet,
        record: BlockRecord,
    ) -> DatastoreResult<u64> {
        if record.cidr != *cidr {
            return Err(DatastoreError::Backend(format!(
                "record for {} stored under key {}",
                record.cidr, cidr
            )));
        }

        match self.blocks.entry(*cidr) {
            Entry::Occupied(_) => Err(DatastoreError::AlreadyExists(format!("block {}", cidr))),
            Entry::Vacant(slot) => {
                slot.insert(Versioned::new(record, 1));
                Ok(1)
            }
        }
    }

    async fn conditional_write_block(
        &self,
        cidr: &IpNet,
        expected: u64,
        record: BlockRecord,
    ) -> DatastoreResult<u64> {
        let mut entry = self
            .blocks
            .get_mut(cidr)
            .ok_or_else(|| DatastoreError::NotFound(format!("block {}", cidr)))?;

        if entry.sequence != expected {
            return Err(DatastoreError::Conflict {
                key: cidr.to_string(),
                expected,
                actual: entry.sequence,
            });
        }

        entry.value = record;
        entry.sequence += 1;
        Ok(entry.sequence)
    }
}
