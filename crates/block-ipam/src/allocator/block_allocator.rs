//! Block affinity and block claiming
//!
//! Each pool is carved into fixed-size blocks whose boundaries follow from
//! the pool CIDR and block prefix alone, so every host walks the same
//! candidate sequence. A host prefers blocks it already holds affinity for,
//! then claims unclaimed blocks with create-if-absent, and finally (unless
//! strict affinity is on) borrows free space from other hosts' blocks.

use crate::datastore::Datastore;
use crate::error::DatastoreError;
use crate::models::{BlockAffinity, BlockRecord, Pool};
use crate::retry::{update_block, BlockUpdate};
use crate::selector::OrderedPools;
use crate::{Error, Result};
use ipnet::IpNet;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

/// Walk position of a [`BlockCursor`] inside the current pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Not yet listed the pool's blocks
    Start,
    /// Draining blocks already affine to this host
    Affine,
    /// Claiming unclaimed sub-ranges in index order
    Claim,
    /// Borrowing from blocks held by other hosts
    Borrow,
}

/// Iteration state over candidate blocks for one allocation
///
/// Created by [`AffinityManager::cursor`] and advanced with
/// [`AffinityManager::next_block`]. A block handed out once is never handed
/// out again by the same cursor.
#[derive(Debug)]
pub struct BlockCursor {
    pools: OrderedPools,
    pool_index: usize,
    stage: Stage,
    queue: VecDeque<IpNet>,
    /// Affinity host of every block known to exist in the current pool
    known: HashMap<IpNet, Option<String>>,
    visited: HashSet<IpNet>,
    claim_index: u128,
    claims_attempted: u32,
}

impl BlockCursor {
    fn new(pools: OrderedPools) -> Self {
        Self {
            pools,
            pool_index: 0,
            stage: Stage::Start,
            queue: VecDeque::new(),
            known: HashMap::new(),
            visited: HashSet::new(),
            claim_index: 0,
            claims_attempted: 0,
        }
    }

    /// Pool currently being walked
    pub fn current_pool(&self) -> Option<&Pool> {
        self.pools.get(self.pool_index)
    }

    /// Blocks handed out so far
    pub fn visited(&self) -> usize {
        self.visited.len()
    }

    /// Stop claiming new sub-ranges of the current pool
    ///
    /// Only takes effect while the last block handed out came from the
    /// claim stage. Affine and borrowed blocks are still walked.
    pub fn halt_claims(&mut self) -> bool {
        if self.stage != Stage::Claim {
            return false;
        }
        self.claim_index = u128::MAX;
        true
    }

    fn advance_pool(&mut self) {
        self.pool_index += 1;
        self.stage = Stage::Start;
        self.queue.clear();
        self.known.clear();
        self.claim_index = 0;
        self.claims_attempted = 0;
    }

    fn hand_out(&mut self, block: IpNet) -> Option<IpNet> {
        self.visited.insert(block).then_some(block)
    }
}

/// Finds and claims blocks for the local host
#[derive(Clone)]
pub struct AffinityManager {
    store: Arc<dyn Datastore>,
    host: String,
    strict_affinity: bool,
    max_block_claims: u32,
    max_cas_retries: u32,
}

impl AffinityManager {
    pub fn new(
        store: Arc<dyn Datastore>,
        host: impl Into<String>,
        strict_affinity: bool,
        max_block_claims: u32,
        max_cas_retries: u32,
    ) -> Self {
        Self {
            store,
            host: host.into(),
            strict_affinity,
            max_block_claims: max_block_claims.max(1),
            max_cas_retries,
        }
    }

    /// Host this manager claims blocks for
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Start walking candidate blocks of `pools`, in pool order
    pub fn cursor(&self, pools: OrderedPools) -> BlockCursor {
        BlockCursor::new(pools)
    }

    /// Next block that may have free capacity, or `None` once every
    /// candidate pool is exhausted
    pub async fn next_block(&self, cursor: &mut BlockCursor) -> Result<Option<IpNet>> {
        loop {
            let Some(pool) = cursor.current_pool().cloned() else {
                return Ok(None);
            };

            match cursor.stage {
                Stage::Start => {
                    self.load_affine(&pool, cursor).await?;
                    cursor.stage = Stage::Affine;
                }
                Stage::Affine => {
                    if let Some(block) = cursor.queue.pop_front() {
                        if let Some(block) = cursor.hand_out(block) {
                            return Ok(Some(block));
                        }
                        continue;
                    }
                    cursor.stage = Stage::Claim;
                }
                Stage::Claim => {
                    if let Some(block) = self.claim_next(&pool, cursor).await? {
                        if let Some(block) = cursor.hand_out(block) {
                            return Ok(Some(block));
                        }
                        continue;
                    }
                    if self.strict_affinity {
                        debug!(pool = %pool.cidr, host = %self.host, "Pool exhausted for host");
                        cursor.advance_pool();
                    } else {
                        self.load_borrowable(&pool, cursor).await?;
                        cursor.stage = Stage::Borrow;
                    }
                }
                Stage::Borrow => {
                    if let Some(block) = cursor.queue.pop_front() {
                        if let Some(block) = cursor.hand_out(block) {
                            debug!(block = %block, host = %self.host, "Borrowing from block");
                            return Ok(Some(block));
                        }
                        continue;
                    }
                    debug!(pool = %pool.cidr, host = %self.host, "Pool exhausted");
                    cursor.advance_pool();
                }
            }
        }
    }

    /// Make sure the block at `block` exists, creating it affine to this
    /// host when absent
    pub async fn ensure_block(&self, pool: &Pool, block: IpNet) -> Result<()> {
        match self.store.get_block(&block).await {
            Ok(_) => Ok(()),
            Err(DatastoreError::NotFound(_)) => {
                let record = BlockRecord::new(block, pool.cidr, Some(&self.host));
                match self.store.create_block_if_absent(&block, record).await {
                    Ok(_) => {
                        info!(block = %block, host = %self.host, "Claimed block");
                        Ok(())
                    }
                    Err(DatastoreError::AlreadyExists(_)) => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drop this host's affinity on every empty block it holds
    ///
    /// Blocks still holding addresses keep their affinity. Returns the
    /// blocks that were released.
    pub async fn release_empty_affinities(&self) -> Result<Vec<IpNet>> {
        let mut released = Vec::new();

        for pool in self.store.list_pools().await? {
            for block in self.store.list_blocks(&pool.cidr).await? {
                let record = &block.value;
                if !record.is_affine_to(&self.host) || !record.is_empty() {
                    continue;
                }

                let host = self.host.as_str();
                let outcome = update_block(
                    self.store.as_ref(),
                    &record.cidr,
                    self.max_cas_retries,
                    |current, _| {
                        if current.is_affine_to(host) && current.is_empty() {
                            current.affinity = None;
                            BlockUpdate::Write(true)
                        } else {
                            BlockUpdate::Unchanged(false)
                        }
                    },
                )
                .await;

                match outcome {
                    Ok(outcome) if outcome.value => {
                        info!(block = %record.cidr, host = %self.host, "Released block affinity");
                        released.push(record.cidr);
                    }
                    Ok(_) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(released)
    }

    async fn load_affine(&self, pool: &Pool, cursor: &mut BlockCursor) -> Result<()> {
        let blocks = self.store.list_blocks(&pool.cidr).await?;

        cursor.queue.clear();
        for block in &blocks {
            let record = &block.value;
            cursor.known.insert(
                record.cidr,
                record.affinity.as_ref().map(|a| a.host.clone()),
            );
            if record.is_affine_to(&self.host) && !record.is_full() {
                cursor.queue.push_back(record.cidr);
            }
        }
        Ok(())
    }

    async fn load_borrowable(&self, pool: &Pool, cursor: &mut BlockCursor) -> Result<()> {
        let blocks = self.store.list_blocks(&pool.cidr).await?;

        cursor.queue = blocks
            .iter()
            .map(|b| &b.value)
            .filter(|record| !record.is_full() && !cursor.visited.contains(&record.cidr))
            .map(|record| record.cidr)
            .collect();
        Ok(())
    }

    /// Claim the next unclaimed sub-range of `pool`
    async fn claim_next(&self, pool: &Pool, cursor: &mut BlockCursor) -> Result<Option<IpNet>> {
        let total = pool.block_count();

        while cursor.claim_index < total && cursor.claims_attempted < self.max_block_claims {
            let index = cursor.claim_index;
            cursor.claim_index += 1;

            let Some(block) = pool.nth_block(index) else {
                break;
            };
            if cursor.visited.contains(&block) {
                continue;
            }

            let held = cursor.known.get(&block).map(Option::is_some);
            match held {
                // Held by some host already
                Some(true) => continue,
                Some(false) => {
                    cursor.claims_attempted += 1;
                    if self.claim_unaffined(&block).await? {
                        return Ok(Some(block));
                    }
                }
                None => {
                    cursor.claims_attempted += 1;
                    let record = BlockRecord::new(block, pool.cidr, Some(&self.host));
                    match self.store.create_block_if_absent(&block, record).await {
                        Ok(_) => {
                            info!(block = %block, pool = %pool.cidr, host = %self.host, "Claimed block");
                            return Ok(Some(block));
                        }
                        Err(DatastoreError::AlreadyExists(_)) => {
                            debug!(block = %block, host = %self.host, "Lost block claim race");
                            // The winner may have left it unaffined or may be us
                            // on a retried call; reclaim only what is free to take
                            if self.claim_unaffined(&block).await? {
                                return Ok(Some(block));
                            }
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }

        Ok(None)
    }

    /// Take affinity of an existing block nobody holds
    async fn claim_unaffined(&self, block: &IpNet) -> Result<bool> {
        let host = self.host.as_str();
        let result = update_block(self.store.as_ref(), block, self.max_cas_retries, |record, _| {
            if record.affinity.is_none() && !record.is_full() {
                record.affinity = Some(BlockAffinity::new(host));
                BlockUpdate::Write(true)
            } else {
                BlockUpdate::Unchanged(record.is_affine_to(host) && !record.is_full())
            }
        })
        .await;

        match result {
            Ok(outcome) => {
                if outcome.written {
                    info!(block = %block, host = %self.host, "Reclaimed unaffined block");
                }
                Ok(outcome.value)
            }
            Err(Error::ResourceBusy(_)) => Ok(false),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}
