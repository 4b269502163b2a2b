//! Address allocation within blocks
//!
//! Draws one address per call, either the lowest free ordinal of a
//! candidate block or a caller-chosen address. Every bit flip is a
//! sequence-conditioned block write.

use super::block_allocator::AffinityManager;
use super::cidr;
use crate::datastore::Datastore;
use crate::models::{AllocatedAddress, Handle, IpFamily, Pool};
use crate::retry::{update_block, BlockUpdate};
use crate::selector::OrderedPools;
use crate::{Error, Result};
use ipnet::IpNet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Allocates addresses from candidate pools
#[derive(Clone)]
pub struct AddressAllocator {
    store: Arc<dyn Datastore>,
    affinity: AffinityManager,
    max_cas_retries: u32,
}

impl AddressAllocator {
    pub fn new(store: Arc<dyn Datastore>, affinity: AffinityManager, max_cas_retries: u32) -> Self {
        Self {
            store,
            affinity,
            max_cas_retries,
        }
    }

    /// Allocate one address of `family` from `pools`
    ///
    /// With `explicit` set, exactly that address is reserved or the call
    /// fails; no other address is tried.
    pub async fn allocate(
        &self,
        pools: &OrderedPools,
        family: IpFamily,
        explicit: Option<IpAddr>,
        handle: Option<&Handle>,
    ) -> Result<AllocatedAddress> {
        match explicit {
            Some(ip) => self.allocate_explicit(pools, ip, handle).await,
            None => self.allocate_next(pools, family, handle).await,
        }
    }

    async fn allocate_explicit(
        &self,
        pools: &OrderedPools,
        ip: IpAddr,
        handle: Option<&Handle>,
    ) -> Result<AllocatedAddress> {
        let pool = pools.find_containing(&ip).ok_or(Error::PoolMismatch(ip))?;
        let block = pool.block_for(ip)?;

        self.affinity.ensure_block(pool, block).await?;

        let outcome = update_block(
            self.store.as_ref(),
            &block,
            self.max_cas_retries,
            |record, next| {
                let Some(ordinal) = record.ordinal(ip) else {
                    return BlockUpdate::Abort(Error::PoolMismatch(ip));
                };
                if record.allocate(ordinal, handle.cloned(), next) {
                    BlockUpdate::Write(())
                } else {
                    BlockUpdate::Abort(Error::AddressInUse(ip))
                }
            },
        )
        .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(Error::AddressInUse(ip)) => {
                debug!(ip = %ip, block = %block, "Requested address already allocated");
                return Err(Error::AddressInUse(ip));
            }
            Err(e) => return Err(e),
        };

        info!(ip = %ip, pool = %pool.cidr, block = %block, "Reserved requested address");
        Ok(Self::allocated(ip, pool, block, handle, outcome.sequence))
    }

    async fn allocate_next(
        &self,
        pools: &OrderedPools,
        family: IpFamily,
        handle: Option<&Handle>,
    ) -> Result<AllocatedAddress> {
        let mut cursor = self.affinity.cursor(pools.clone());
        let mut busy: Option<String> = None;

        while let Some(block) = self.affinity.next_block(&mut cursor).await? {
            let Some(pool) = cursor.current_pool().cloned() else {
                break;
            };

            let outcome = update_block(
                self.store.as_ref(),
                &block,
                self.max_cas_retries,
                |record, next| match record.lowest_free() {
                    Some(ordinal) => {
                        record.allocate(ordinal, handle.cloned(), next);
                        BlockUpdate::Write(Some(record.address_at(ordinal)))
                    }
                    None => BlockUpdate::Unchanged(None),
                },
            )
            .await;

            match outcome {
                Ok(outcome) => match outcome.value {
                    Some(ip) => {
                        info!(
                            ip = %ip,
                            pool = %pool.cidr,
                            block = %block,
                            host = %self.affinity.host(),
                            "Allocated address"
                        );
                        return Ok(Self::allocated(ip, &pool, block, handle, outcome.sequence));
                    }
                    None => debug!(block = %block, "Block full, moving on"),
                },
                Err(Error::ResourceBusy(reason)) => {
                    warn!(block = %block, reason = %reason, "Skipping contended block");
                    if cursor.halt_claims() {
                        debug!(pool = %pool.cidr, block = %block, "Fresh block contended, no further claims");
                    }
                    busy = Some(reason);
                }
                Err(e) if e.is_not_found() => {
                    debug!(block = %block, "Block vanished, moving on");
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(reason) = busy {
            warn!(
                family = %family,
                pools = ?pools.cidrs(),
                blocks_tried = cursor.visited(),
                "Candidate blocks contended, giving up"
            );
            return Err(Error::ResourceBusy(reason));
        }

        warn!(
            family = %family,
            pools = ?pools.cidrs(),
            blocks_tried = cursor.visited(),
            "No available addresses"
        );
        Err(Error::NoAvailableAddress(family))
    }

    fn allocated(
        ip: IpAddr,
        pool: &Pool,
        block: IpNet,
        handle: Option<&Handle>,
        sequence: u64,
    ) -> AllocatedAddress {
        AllocatedAddress {
            address: cidr::host_net(ip),
            pool: pool.cidr,
            block,
            handle: handle.cloned(),
            sequence,
        }
    }
}
