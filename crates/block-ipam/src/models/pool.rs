//! Address pool model

use crate::allocator::cidr;
use crate::Result;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Address family of a pool, block or allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IpFamily {
    #[serde(rename = "ipv4")]
    V4,
    #[serde(rename = "ipv6")]
    V6,
}

impl IpFamily {
    /// Family of an address
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }

    /// Family of a network
    pub fn of_net(net: &IpNet) -> Self {
        match net {
            IpNet::V4(_) => IpFamily::V4,
            IpNet::V6(_) => IpFamily::V6,
        }
    }

    /// Default block prefix length for pools of this family
    pub fn default_block_prefix(&self) -> u8 {
        match self {
            IpFamily::V4 => crate::limits::DEFAULT_IPV4_BLOCK_PREFIX,
            IpFamily::V6 => crate::limits::DEFAULT_IPV6_BLOCK_PREFIX,
        }
    }
}

impl std::fmt::Display for IpFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpFamily::V4 => write!(f, "IPv4"),
            IpFamily::V6 => write!(f, "IPv6"),
        }
    }
}

/// An administrator-configured address pool
///
/// Pools are owned by external tooling; the engine only reads them. Each
/// pool is carved into fixed-size blocks of `block_prefix_len`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    /// Pool range, always stored truncated to its network address
    pub cidr: IpNet,
    /// Prefix length of the blocks carved from this pool
    pub block_prefix_len: u8,
    /// Disabled pools never serve automatic allocations
    #[serde(default)]
    pub disabled: bool,
    /// Priority; lower values are tried first
    #[serde(default)]
    pub order: u32,
}

impl Pool {
    /// Create an enabled pool with the family's default block size
    ///
    /// Pools smaller than one default block become a single block.
    pub fn new(cidr: IpNet) -> Self {
        let cidr = cidr.trunc();
        let block_prefix_len = IpFamily::of_net(&cidr)
            .default_block_prefix()
            .max(cidr.prefix_len());

        Self {
            cidr,
            block_prefix_len,
            disabled: false,
            order: 0,
        }
    }

    /// Create an enabled pool with an explicit block prefix length
    pub fn with_block_prefix(cidr: IpNet, block_prefix_len: u8) -> Result<Self> {
        let cidr = cidr.trunc();
        cidr::validate_block_prefix(&cidr, block_prefix_len)?;

        Ok(Self {
            cidr,
            block_prefix_len,
            disabled: false,
            order: 0,
        })
    }

    /// Set the pool priority
    pub fn with_order(mut self, order: u32) -> Self {
        self.order = order;
        self
    }

    /// Mark the pool disabled
    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    /// Address family of the pool
    pub fn family(&self) -> IpFamily {
        IpFamily::of_net(&self.cidr)
    }

    /// Whether the pool can serve automatic allocations
    pub fn is_enabled(&self) -> bool {
        !self.disabled
    }

    /// Check if an address is within this pool
    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.cidr.contains(addr)
    }

    /// Number of blocks the pool is carved into
    pub fn block_count(&self) -> u128 {
        cidr::block_count(&self.cidr, self.block_prefix_len)
    }

    /// Number of addresses per block
    pub fn block_capacity(&self) -> u32 {
        let bits = u32::from(self.cidr.max_prefix_len().saturating_sub(self.block_prefix_len));
        1u32.checked_shl(bits).unwrap_or(u32::MAX)
    }

    /// The block at `index`, counting from the pool's network address
    pub fn nth_block(&self, index: u128) -> Option<IpNet> {
        cidr::nth_block(&self.cidr, self.block_prefix_len, index)
    }

    /// The block that owns `addr`
    pub fn block_for(&self, addr: IpAddr) -> Result<IpNet> {
        cidr::block_containing(addr, self.block_prefix_len)
    }
}
