//! IPAM engine service
//!
//! Core orchestration for one host, providing:
//! - Single-address allocation and release
//! - Attach/detach flows driven by validated configuration
//! - Allocation lookup and per-pool usage
//! - Host affinity cleanup

use crate::allocator::{AddressAllocator, AffinityManager};
use crate::config::{AssignConfig, EngineConfig};
use crate::datastore::Datastore;
use crate::error::DatastoreError;
use crate::models::{
    AllocatedAddress, AllocationInfo, AllocationRequest, AssignResult, Handle, IpFamily,
    PoolUsage,
};
use crate::release::ReleaseManager;
use crate::selector::{PoolSelector, SelectionMode};
use crate::{Error, Result};
use ipnet::IpNet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// IPAM engine bound to one host and one datastore
#[derive(Clone)]
pub struct IpamEngine {
    /// Configuration
    config: EngineConfig,
    /// Shared registry
    store: Arc<dyn Datastore>,
    /// Hint resolution and pool ordering
    selector: PoolSelector,
    /// Block affinity for this host
    affinity: AffinityManager,
    /// Address allocation
    allocator: AddressAllocator,
    /// Address release
    releaser: ReleaseManager,
}

impl IpamEngine {
    /// Create an engine for `config.hostname` on top of `store`
    pub fn new(store: Arc<dyn Datastore>, config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let affinity = AffinityManager::new(
            store.clone(),
            config.hostname.clone(),
            config.strict_affinity,
            config.max_block_claims,
            config.max_cas_retries,
        );
        let allocator = AddressAllocator::new(store.clone(), affinity.clone(), config.max_cas_retries);
        let releaser = ReleaseManager::new(store.clone(), config.affinity_policy, config.max_cas_retries);

        Ok(Self {
            selector: PoolSelector::new(store.clone()),
            affinity,
            allocator,
            releaser,
            store,
            config,
        })
    }

    pub fn hostname(&self) -> &str {
        &self.config.hostname
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ==================== Allocation ====================

    /// Allocate a single address
    pub async fn allocate_ip(&self, request: &AllocationRequest) -> Result<AllocatedAddress> {
        let (family, mode) = match request.explicit_ip {
            Some(ip) => {
                if IpFamily::of(&ip) != request.family {
                    return Err(Error::InvalidArgument(format!(
                        "explicit address {} is not {}",
                        ip, request.family
                    )));
                }
                (request.family, SelectionMode::Explicit)
            }
            None => (request.family, SelectionMode::Automatic),
        };

        let pools = self
            .selector
            .select(family, request.pool_hints.as_deref(), mode)
            .await?;

        self.allocator
            .allocate(&pools, family, request.explicit_ip, request.handle.as_ref())
            .await
    }

    /// Run the attach flow for `config`
    ///
    /// An explicit address replaces automatic allocation and yields exactly
    /// that address. Otherwise one address per requested family is
    /// allocated; if any family fails, addresses already allocated by this
    /// call are released again before the error is returned.
    pub async fn assign(&self, config: &AssignConfig, handle: Option<&Handle>) -> Result<AssignResult> {
        let mut result = AssignResult::default();

        if let Some(ip) = config.explicit_ip {
            let family = IpFamily::of(&ip);
            let request = Self::request(config, family, Some(ip), handle);
            let allocated = self.allocate_ip(&request).await?;
            Self::store_result(&mut result, allocated);
            return Ok(result);
        }

        for family in config.families() {
            let request = Self::request(config, family, None, handle);
            match self.allocate_ip(&request).await {
                Ok(allocated) => Self::store_result(&mut result, allocated),
                Err(e) => {
                    warn!(family = %family, error = %e, "Allocation failed, rolling back");
                    return Err(self.roll_back(&result, e).await);
                }
            }
        }

        info!(
            host = %self.config.hostname,
            handle = ?handle.map(Handle::as_str),
            addresses = result.len(),
            "Assigned addresses"
        );
        Ok(result)
    }

    fn request(
        config: &AssignConfig,
        family: IpFamily,
        explicit_ip: Option<IpAddr>,
        handle: Option<&Handle>,
    ) -> AllocationRequest {
        AllocationRequest {
            family,
            explicit_ip,
            pool_hints: config.pool_hints(family).map(<[IpNet]>::to_vec),
            handle: handle.cloned(),
        }
    }

    fn store_result(result: &mut AssignResult, allocated: AllocatedAddress) {
        match allocated.family() {
            IpFamily::V4 => result.ipv4 = Some(allocated),
            IpFamily::V6 => result.ipv6 = Some(allocated),
        }
    }

    /// Release what `result` holds and return the error to report
    ///
    /// A failed release is folded into the returned error together with
    /// the addresses left allocated.
    async fn roll_back(&self, result: &AssignResult, cause: Error) -> Error {
        let mut leaked = Vec::new();
        let mut reason = None;

        for allocated in result.addresses() {
            if let Err(e) = self.releaser.release_ip(allocated.ip()).await {
                warn!(ip = %allocated.ip(), error = %e, "Failed to roll back allocation");
                leaked.push(allocated.ip());
                reason = Some(e.to_string());
            }
        }

        match reason {
            Some(reason) => Error::RollbackFailed {
                source: Box::new(cause),
                leaked,
                reason,
            },
            None => cause,
        }
    }

    // ==================== Release ====================

    /// Release one address; releasing a free or unknown address succeeds
    pub async fn release_ip(&self, ip: IpAddr) -> Result<bool> {
        self.releaser.release_ip(ip).await
    }

    /// Release every address held by `handle`
    pub async fn release_by_handle(&self, handle: &Handle) -> Result<Vec<IpAddr>> {
        self.releaser.release_by_handle(handle).await
    }

    /// Run the detach flow for `config`
    ///
    /// An explicit address releases exactly that address; otherwise the
    /// handle's addresses are released.
    pub async fn release(&self, config: &AssignConfig, handle: Option<&Handle>) -> Result<Vec<IpAddr>> {
        if let Some(ip) = config.explicit_ip {
            let released = self.release_ip(ip).await?;
            return Ok(if released { vec![ip] } else { Vec::new() });
        }

        match handle {
            Some(handle) => self.release_by_handle(handle).await,
            None => {
                debug!("Release without address or handle, nothing to do");
                Ok(Vec::new())
            }
        }
    }

    // ==================== Inspection ====================

    /// Details of an allocated address, `None` if it is free
    pub async fn get_allocation(&self, ip: IpAddr) -> Result<Option<AllocationInfo>> {
        let pools = self.store.list_pools().await?;
        let Some(pool) = pools.iter().find(|p| p.contains(&ip)) else {
            return Ok(None);
        };
        let block = pool.block_for(ip)?;

        let record = match self.store.get_block(&block).await {
            Ok(record) => record.value,
            Err(DatastoreError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let Some(ordinal) = record.ordinal(ip).filter(|o| record.allocations.is_set(*o)) else {
            return Ok(None);
        };

        Ok(record.attribute(ordinal).map(|attr| AllocationInfo {
            address: ip,
            pool: pool.cidr,
            block,
            handle: attr.handle.clone(),
            sequence: attr.sequence,
            allocated_at: attr.allocated_at,
        }))
    }

    /// Usage of every pool, in priority order
    pub async fn pool_usage(&self) -> Result<Vec<PoolUsage>> {
        let mut usage = Vec::new();

        for pool in self.store.list_pools().await? {
            let blocks = self.store.list_blocks(&pool.cidr).await?;
            let block_capacity: u64 = blocks.iter().map(|b| u64::from(b.value.capacity())).sum();
            let allocated: u64 = blocks
                .iter()
                .map(|b| u64::from(b.value.allocated_count()))
                .sum();

            let utilization_percent = if block_capacity == 0 {
                0.0
            } else {
                (allocated as f64 / block_capacity as f64) * 100.0
            };

            usage.push(PoolUsage {
                pool: pool.cidr,
                disabled: pool.disabled,
                blocks: blocks.len(),
                block_capacity,
                allocated,
                utilization_percent,
            });
        }

        Ok(usage)
    }

    // ==================== Affinity ====================

    /// Drop this host's affinity on its empty blocks
    pub async fn release_host_affinities(&self) -> Result<Vec<IpNet>> {
        let released = self.affinity.release_empty_affinities().await?;
        info!(
            host = %self.config.hostname,
            blocks = released.len(),
            "Released host affinities"
        );
        Ok(released)
    }
}
