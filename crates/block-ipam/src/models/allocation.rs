//! Allocation requests, results and reports

use crate::allocator::cidr;
use crate::models::IpFamily;
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Correlation key grouping the addresses of one workload
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(String);

impl Handle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Handle {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for Handle {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Request for a single address of one family
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRequest {
    /// Family to allocate from
    pub family: IpFamily,
    /// Caller-chosen address; disables the automatic search
    pub explicit_ip: Option<IpAddr>,
    /// Ordered pool hints; `None` means every enabled pool of the family
    pub pool_hints: Option<Vec<IpNet>>,
    /// Workload correlation key
    pub handle: Option<Handle>,
}

impl AllocationRequest {
    /// Automatic allocation from every enabled pool of `family`
    pub fn auto(family: IpFamily) -> Self {
        Self {
            family,
            explicit_ip: None,
            pool_hints: None,
            handle: None,
        }
    }

    /// Allocation of one specific address
    pub fn explicit(ip: IpAddr) -> Self {
        Self {
            family: IpFamily::of(&ip),
            explicit_ip: Some(ip),
            pool_hints: None,
            handle: None,
        }
    }

    pub fn with_pools(mut self, pools: Vec<IpNet>) -> Self {
        self.pool_hints = Some(pools);
        self
    }

    pub fn with_handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }
}

/// A successfully allocated address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatedAddress {
    /// Address with a host mask (/32 or /128)
    pub address: IpNet,
    /// Owning pool
    pub pool: IpNet,
    /// Owning block
    pub block: IpNet,
    /// Workload correlation key
    pub handle: Option<Handle>,
    /// Block sequence written by the allocation
    pub sequence: u64,
}

impl AllocatedAddress {
    pub fn ip(&self) -> IpAddr {
        self.address.addr()
    }

    pub fn family(&self) -> IpFamily {
        IpFamily::of_net(&self.address)
    }

    /// Host mask as hex, `ffffffff` for IPv4
    pub fn mask_hex(&self) -> String {
        cidr::mask_hex(&self.address)
    }
}

/// Result of a full attach
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignResult {
    pub ipv4: Option<AllocatedAddress>,
    pub ipv6: Option<AllocatedAddress>,
}

impl AssignResult {
    /// Allocated addresses, IPv4 first
    pub fn addresses(&self) -> Vec<&AllocatedAddress> {
        self.ipv4.iter().chain(self.ipv6.iter()).collect()
    }

    pub fn len(&self) -> usize {
        self.addresses().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ipv4.is_none() && self.ipv6.is_none()
    }
}

/// Lookup result for an allocated address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationInfo {
    pub address: IpAddr,
    pub pool: IpNet,
    pub block: IpNet,
    pub handle: Option<Handle>,
    pub sequence: u64,
    pub allocated_at: DateTime<Utc>,
}

/// Utilisation of one pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolUsage {
    pub pool: IpNet,
    pub disabled: bool,
    /// Blocks created so far
    pub blocks: usize,
    /// Addresses in created blocks
    pub block_capacity: u64,
    /// Allocated addresses
    pub allocated: u64,
    /// Allocated addresses as a percentage of the created block capacity
    pub utilization_percent: f64,
}
