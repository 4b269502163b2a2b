//! Address release
//!
//! Release is idempotent: a missing block, a cleared bit or an address
//! outside every pool all count as success so that a retried or unmatched
//! detach never fails.

use crate::datastore::Datastore;
use crate::models::{BlockRecord, Handle};
use crate::retry::{update_block, BlockUpdate};
use crate::Result;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info};

/// What happens to a block's host affinity once its last address is freed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AffinityPolicy {
    /// Keep the affinity so the host reuses the block later
    #[default]
    Retain,
    /// Drop the affinity in the same write that empties the block
    ReleaseWhenEmpty,
}

/// Frees addresses back to their blocks
#[derive(Clone)]
pub struct ReleaseManager {
    store: Arc<dyn Datastore>,
    policy: AffinityPolicy,
    max_cas_retries: u32,
}

impl ReleaseManager {
    pub fn new(store: Arc<dyn Datastore>, policy: AffinityPolicy, max_cas_retries: u32) -> Self {
        Self {
            store,
            policy,
            max_cas_retries,
        }
    }

    pub fn policy(&self) -> AffinityPolicy {
        self.policy
    }

    /// Release a single address
    ///
    /// Returns whether an allocation was actually cleared.
    pub async fn release_ip(&self, ip: IpAddr) -> Result<bool> {
        let pools = self.store.list_pools().await?;
        let Some(pool) = pools.iter().find(|p| p.contains(&ip)) else {
            debug!(ip = %ip, "Address is not in any pool, nothing to release");
            return Ok(false);
        };
        let block = pool.block_for(ip)?;

        let policy = self.policy;
        let outcome = update_block(
            self.store.as_ref(),
            &block,
            self.max_cas_retries,
            |record, _| {
                let Some(ordinal) = record.ordinal(ip) else {
                    return BlockUpdate::Unchanged(false);
                };
                if record.release(ordinal).is_none() {
                    return BlockUpdate::Unchanged(false);
                }
                Self::apply_policy(policy, record);
                BlockUpdate::Write(true)
            },
        )
        .await;

        match outcome {
            Ok(outcome) if outcome.value => {
                info!(ip = %ip, block = %block, "Released address");
                Ok(true)
            }
            Ok(_) => {
                debug!(ip = %ip, "Address was not allocated");
                Ok(false)
            }
            Err(e) if e.is_not_found() => {
                debug!(ip = %ip, block = %block, "Block does not exist, nothing to release");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Release every address recorded against `handle`
    ///
    /// Returns the released addresses; an unknown handle releases nothing.
    pub async fn release_by_handle(&self, handle: &Handle) -> Result<Vec<IpAddr>> {
        let mut released = Vec::new();

        for pool in self.store.list_pools().await? {
            for block in self.store.list_blocks(&pool.cidr).await? {
                if block.value.ordinals_for_handle(handle).is_empty() {
                    continue;
                }
                released.extend(self.release_handle_in_block(&block.value.cidr, handle).await?);
            }
        }

        if released.is_empty() {
            debug!(handle = %handle, "No addresses held by handle");
        } else {
            info!(handle = %handle, count = released.len(), "Released addresses for handle");
        }
        Ok(released)
    }

    async fn release_handle_in_block(&self, block: &IpNet, handle: &Handle) -> Result<Vec<IpAddr>> {
        let policy = self.policy;
        let outcome = update_block(
            self.store.as_ref(),
            block,
            self.max_cas_retries,
            |record, _| {
                let freed: Vec<IpAddr> = record
                    .ordinals_for_handle(handle)
                    .into_iter()
                    .filter_map(|ordinal| {
                        record.release(ordinal)?;
                        Some(record.address_at(ordinal))
                    })
                    .collect();

                if freed.is_empty() {
                    BlockUpdate::Unchanged(freed)
                } else {
                    Self::apply_policy(policy, record);
                    BlockUpdate::Write(freed)
                }
            },
        )
        .await;

        match outcome {
            Ok(outcome) => Ok(outcome.value),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    fn apply_policy(policy: AffinityPolicy, record: &mut BlockRecord) {
        if policy == AffinityPolicy::ReleaseWhenEmpty && record.is_empty() {
            if let Some(affinity) = record.affinity.take() {
                debug!(block = %record.cidr, host = %affinity.host, "Block empty, dropping affinity");
            }
        }
    }
}
