//! Address arithmetic shared by block carving and address selection
//!
//! Addresses of both families are handled as `u128` so that the same code
//! computes block boundaries for IPv4 and IPv6 pools. Every block boundary is
//! a pure function of the pool CIDR and the block prefix length, which is what
//! lets independent hosts agree on block ranges without coordinating.

use crate::models::IpFamily;
use crate::{Error, Result};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Convert an address to its numeric value
pub fn addr_to_u128(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// Convert a numeric value back to an address of the given family
///
/// IPv4 values are truncated to their low 32 bits.
pub fn u128_to_addr(value: u128, family: IpFamily) -> IpAddr {
    match family {
        IpFamily::V4 => IpAddr::V4(Ipv4Addr::from(value as u32)),
        IpFamily::V6 => IpAddr::V6(Ipv6Addr::from(value)),
    }
}

/// Number of host bits in a network
pub fn host_bits(net: &IpNet) -> u8 {
    net.max_prefix_len() - net.prefix_len()
}

/// The single-address network for `addr` (/32 or /128)
pub fn host_net(addr: IpAddr) -> IpNet {
    match addr {
        IpAddr::V4(v4) => IpNet::V4(Ipv4Net::from(v4)),
        IpAddr::V6(v6) => IpNet::V6(Ipv6Net::from(v6)),
    }
}

/// The block of prefix length `block_prefix` that contains `addr`
pub fn block_containing(addr: IpAddr, block_prefix: u8) -> Result<IpNet> {
    Ok(IpNet::new(addr, block_prefix)?.trunc())
}

/// Number of blocks of `block_prefix` that fit in `pool`
///
/// Saturates at `u128::MAX` for a /0 IPv6 pool carved into /128 blocks.
pub fn block_count(pool: &IpNet, block_prefix: u8) -> u128 {
    if block_prefix < pool.prefix_len() {
        return 0;
    }
    let bits = u32::from(block_prefix - pool.prefix_len());
    1u128.checked_shl(bits).unwrap_or(u128::MAX)
}

/// The `index`-th block of `block_prefix` inside `pool`, counting from the
/// pool's network address
pub fn nth_block(pool: &IpNet, block_prefix: u8, index: u128) -> Option<IpNet> {
    if index >= block_count(pool, block_prefix) {
        return None;
    }
    let block_bits = u32::from(pool.max_prefix_len() - block_prefix);
    let offset = index.checked_shl(block_bits)?;
    let start = addr_to_u128(pool.network()).checked_add(offset)?;
    let family = IpFamily::of_net(pool);
    IpNet::new(u128_to_addr(start, family), block_prefix).ok()
}

/// Offset of `addr` inside `block`, or `None` when it lies outside
pub fn ordinal_in_block(block: &IpNet, addr: IpAddr) -> Option<u32> {
    if !block.contains(&addr) {
        return None;
    }
    let offset = addr_to_u128(addr) - addr_to_u128(block.network());
    u32::try_from(offset).ok()
}

/// Address at `ordinal` inside `block`
pub fn address_at(block: &IpNet, ordinal: u32) -> IpAddr {
    let value = addr_to_u128(block.network()) + u128::from(ordinal);
    u128_to_addr(value, IpFamily::of_net(block))
}

/// Hexadecimal rendering of a network mask, e.g. `ffffffff` for a /32
pub fn mask_hex(net: &IpNet) -> String {
    match net.netmask() {
        IpAddr::V4(mask) => mask.octets().iter().map(|b| format!("{:02x}", b)).collect(),
        IpAddr::V6(mask) => mask.octets().iter().map(|b| format!("{:02x}", b)).collect(),
    }
}

/// Validate a block prefix length against its pool
pub fn validate_block_prefix(pool: &IpNet, block_prefix: u8) -> Result<()> {
    if block_prefix < pool.prefix_len() {
        return Err(Error::InvalidCidr(format!(
            "Block prefix /{} is shorter than pool prefix {}",
            block_prefix, pool
        )));
    }
    if block_prefix > pool.max_prefix_len() {
        return Err(Error::InvalidCidr(format!(
            "Block prefix /{} exceeds the maximum for {}",
            block_prefix, pool
        )));
    }
    let bits = pool.max_prefix_len() - block_prefix;
    if bits > crate::limits::MAX_BLOCK_HOST_BITS {
        return Err(Error::InvalidCidr(format!(
            "Block prefix /{} is too large: at most {} host bits per block",
            block_prefix,
            crate::limits::MAX_BLOCK_HOST_BITS
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_block_containing() {
        let addr = IpAddr::from_str("192.168.123.123").unwrap();
        let block = block_containing(addr, 26).unwrap();
        assert_eq!(block.to_string(), "192.168.123.64/26");

        let addr6 = IpAddr::from_str("fd80:24e2:f998:72d6::1:5").unwrap();
        let block6 = block_containing(addr6, 122).unwrap();
        assert_eq!(block6.to_string(), "fd80:24e2:f998:72d6::1:0/122");
    }

    #[test]
    fn test_block_count() {
        let pool = IpNet::from_str("192.168.0.0/16").unwrap();
        assert_eq!(block_count(&pool, 26), 1024);
        assert_eq!(block_count(&pool, 16), 1);
        assert_eq!(block_count(&pool, 12), 0);

        let v6 = IpNet::from_str("::/0").unwrap();
        assert_eq!(block_count(&v6, 128), u128::MAX);
    }

    #[test]
    fn test_nth_block_sequential() {
        let pool = IpNet::from_str("192.169.1.0/24").unwrap();

        assert_eq!(nth_block(&pool, 26, 0).unwrap().to_string(), "192.169.1.0/26");
        assert_eq!(nth_block(&pool, 26, 1).unwrap().to_string(), "192.169.1.64/26");
        assert_eq!(nth_block(&pool, 26, 3).unwrap().to_string(), "192.169.1.192/26");
        assert!(nth_block(&pool, 26, 4).is_none());
    }

    #[test]
    fn test_nth_block_ipv6() {
        let pool = IpNet::from_str("fd80:24e2:f998:72d6::/64").unwrap();
        let second = nth_block(&pool, 122, 1).unwrap();
        assert_eq!(second.to_string(), "fd80:24e2:f998:72d6::40/122");
    }

    #[test]
    fn test_ordinal_round_trip() {
        let block = IpNet::from_str("10.0.0.64/26").unwrap();
        let addr = IpAddr::from_str("10.0.0.70").unwrap();

        let ordinal = ordinal_in_block(&block, addr).unwrap();
        assert_eq!(ordinal, 6);
        assert_eq!(address_at(&block, ordinal), addr);

        let outside = IpAddr::from_str("10.0.0.1").unwrap();
        assert!(ordinal_in_block(&block, outside).is_none());
    }

    #[test]
    fn test_host_net_masks() {
        let v4 = host_net(IpAddr::from_str("192.168.123.123").unwrap());
        assert_eq!(v4.to_string(), "192.168.123.123/32");
        assert_eq!(mask_hex(&v4), "ffffffff");

        let v6 = host_net(IpAddr::from_str("fd80::1").unwrap());
        assert_eq!(v6.prefix_len(), 128);
        assert_eq!(mask_hex(&v6), "ffffffffffffffffffffffffffffffff");
    }

    #[test]
    fn test_validate_block_prefix() {
        let pool = IpNet::from_str("10.0.0.0/16").unwrap();
        assert!(validate_block_prefix(&pool, 26).is_ok());
        assert!(validate_block_prefix(&pool, 16).is_ok());
        assert!(validate_block_prefix(&pool, 8).is_err());
        assert!(validate_block_prefix(&pool, 33).is_err());

        let v6 = IpNet::from_str("fd00::/48").unwrap();
        assert!(validate_block_prefix(&v6, 122).is_ok());
        assert!(validate_block_prefix(&v6, 64).is_err());
    }
}
