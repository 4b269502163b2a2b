//! Block records and their allocation bitmaps

use crate::allocator::cidr;
use crate::models::{Handle, IpFamily};
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

/// A record paired with the datastore sequence it was read at
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub value: T,
    pub sequence: u64,
}

impl<T> Versioned<T> {
    pub fn new(value: T, sequence: u64) -> Self {
        Self { value, sequence }
    }
}

/// Fixed-length bitset of allocated ordinals within a block
///
/// Bit `i` corresponds to the block's network address plus `i`, so the
/// lowest clear bit is also the numerically lowest free address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationBitmap {
    len: u32,
    words: Vec<u64>,
}

impl AllocationBitmap {
    /// Create an empty bitmap with `len` slots
    pub fn new(len: u32) -> Self {
        let words = (len as usize).div_ceil(64);
        Self {
            len,
            words: vec![0; words],
        }
    }

    /// Number of slots
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_set(&self, ordinal: u32) -> bool {
        if ordinal >= self.len {
            return false;
        }
        let (word, bit) = Self::position(ordinal);
        self.words[word] & (1u64 << bit) != 0
    }

    /// Set a bit; returns false when it was already set or out of range
    pub fn set(&mut self, ordinal: u32) -> bool {
        if ordinal >= self.len || self.is_set(ordinal) {
            return false;
        }
        let (word, bit) = Self::position(ordinal);
        self.words[word] |= 1u64 << bit;
        true
    }

    /// Clear a bit; returns false when it was already clear or out of range
    pub fn clear(&mut self, ordinal: u32) -> bool {
        if !self.is_set(ordinal) {
            return false;
        }
        let (word, bit) = Self::position(ordinal);
        self.words[word] &= !(1u64 << bit);
        true
    }

    /// Lowest clear ordinal
    pub fn first_clear(&self) -> Option<u32> {
        for (index, word) in self.words.iter().enumerate() {
            if *word != u64::MAX {
                let ordinal = index as u32 * 64 + word.trailing_ones();
                return (ordinal < self.len).then_some(ordinal);
            }
        }
        None
    }

    /// Number of set bits
    pub fn count_set(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn is_full(&self) -> bool {
        self.count_set() == self.len
    }

    /// Iterate over set ordinals in ascending order
    pub fn iter_set(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.len).filter(move |&ordinal| self.is_set(ordinal))
    }

    fn position(ordinal: u32) -> (usize, u32) {
        ((ordinal / 64) as usize, ordinal % 64)
    }
}

/// A host's claim on a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockAffinity {
    /// Host name holding the claim
    pub host: String,
    /// When the claim was made
    pub claimed_at: DateTime<Utc>,
}

impl BlockAffinity {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            claimed_at: Utc::now(),
        }
    }
}

/// Attributes of one allocated ordinal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationAttr {
    /// Workload correlation key
    pub handle: Option<Handle>,
    /// Block sequence written by the allocating conditional write
    pub sequence: u64,
    /// When the address was allocated
    pub allocated_at: DateTime<Utc>,
}

/// A block of addresses carved from exactly one pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRecord {
    /// Block range
    pub cidr: IpNet,
    /// Owning pool
    pub pool: IpNet,
    /// Host affinity, if any
    pub affinity: Option<BlockAffinity>,
    /// Allocated ordinals
    pub allocations: AllocationBitmap,
    /// Attributes keyed by allocated ordinal
    #[serde(default)]
    pub attributes: BTreeMap<u32, AllocationAttr>,
}

impl BlockRecord {
    /// Create an empty block, optionally affine to `host`
    pub fn new(cidr: IpNet, pool: IpNet, host: Option<&str>) -> Self {
        let bits = u32::from(cidr::host_bits(&cidr));
        let capacity = 1u32.checked_shl(bits).unwrap_or(u32::MAX);

        Self {
            cidr,
            pool,
            affinity: host.map(BlockAffinity::new),
            allocations: AllocationBitmap::new(capacity),
            attributes: BTreeMap::new(),
        }
    }

    pub fn family(&self) -> IpFamily {
        IpFamily::of_net(&self.cidr)
    }

    /// Total addresses in the block
    pub fn capacity(&self) -> u32 {
        self.allocations.len()
    }

    pub fn allocated_count(&self) -> u32 {
        self.allocations.count_set()
    }

    pub fn free_count(&self) -> u32 {
        self.capacity() - self.allocated_count()
    }

    pub fn is_full(&self) -> bool {
        self.allocations.is_full()
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    /// Check whether `host` holds the block's affinity
    pub fn is_affine_to(&self, host: &str) -> bool {
        self.affinity.as_ref().is_some_and(|a| a.host == host)
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.cidr.contains(addr)
    }

    /// Ordinal of `addr` within the block
    pub fn ordinal(&self, addr: IpAddr) -> Option<u32> {
        cidr::ordinal_in_block(&self.cidr, addr)
    }

    /// Address at `ordinal`
    pub fn address_at(&self, ordinal: u32) -> IpAddr {
        cidr::address_at(&self.cidr, ordinal)
    }

    /// Lowest free ordinal
    pub fn lowest_free(&self) -> Option<u32> {
        self.allocations.first_clear()
    }

    pub fn is_allocated(&self, addr: IpAddr) -> bool {
        self.ordinal(addr)
            .is_some_and(|ordinal| self.allocations.is_set(ordinal))
    }

    /// Mark `ordinal` allocated; returns false when it is already in use
    pub fn allocate(&mut self, ordinal: u32, handle: Option<Handle>, sequence: u64) -> bool {
        if !self.allocations.set(ordinal) {
            return false;
        }
        self.attributes.insert(
            ordinal,
            AllocationAttr {
                handle,
                sequence,
                allocated_at: Utc::now(),
            },
        );
        true
    }

    /// Free `ordinal`, returning its attributes if it was allocated
    pub fn release(&mut self, ordinal: u32) -> Option<AllocationAttr> {
        if !self.allocations.clear(ordinal) {
            return None;
        }
        let attr = self.attributes.remove(&ordinal);
        attr.or_else(|| {
            Some(AllocationAttr {
                handle: None,
                sequence: 0,
                allocated_at: Utc::now(),
            })
        })
    }

    /// Attributes of an allocated ordinal
    pub fn attribute(&self, ordinal: u32) -> Option<&AllocationAttr> {
        self.attributes.get(&ordinal)
    }

    /// Allocated ordinals tagged with `handle`, ascending
    pub fn ordinals_for_handle(&self, handle: &Handle) -> Vec<u32> {
        self.attributes
            .iter()
            .filter(|(_, attr)| attr.handle.as_ref() == Some(handle))
            .map(|(ordinal, _)| *ordinal)
            .collect()
    }

    /// All allocated addresses, ascending
    pub fn allocated_addresses(&self) -> Vec<IpAddr> {
        self.allocations
            .iter_set()
            .map(|ordinal| self.address_at(ordinal))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn block(cidr: &str) -> BlockRecord {
        let cidr = IpNet::from_str(cidr).unwrap();
        let pool = IpNet::new(cidr.network(), 16).unwrap().trunc();
        BlockRecord::new(cidr, pool, Some("host-a"))
    }

    #[test]
    fn test_bitmap_first_clear() {
        let mut bitmap = AllocationBitmap::new(130);
        assert_eq!(bitmap.first_clear(), Some(0));

        for ordinal in 0..70 {
            assert!(bitmap.set(ordinal));
        }
        assert_eq!(bitmap.first_clear(), Some(70));

        bitmap.clear(3);
        assert_eq!(bitmap.first_clear(), Some(3));
    }

    #[test]
    fn test_bitmap_full_with_partial_word() {
        let mut bitmap = AllocationBitmap::new(16);
        for ordinal in 0..16 {
            bitmap.set(ordinal);
        }
        assert!(bitmap.is_full());
        assert_eq!(bitmap.first_clear(), None);
        assert!(!bitmap.set(16));
    }

    #[test]
    fn test_bitmap_set_twice() {
        let mut bitmap = AllocationBitmap::new(64);
        assert!(bitmap.set(5));
        assert!(!bitmap.set(5));
        assert!(bitmap.clear(5));
        assert!(!bitmap.clear(5));
        assert!(bitmap.is_empty());
    }

    #[test]
    fn test_block_capacity() {
        let b = block("192.168.0.0/26");
        assert_eq!(b.capacity(), 64);
        assert_eq!(b.free_count(), 64);
        assert!(b.is_empty());
        assert!(b.is_affine_to("host-a"));
        assert!(!b.is_affine_to("host-b"));
    }

    #[test]
    fn test_lowest_free_is_lowest_address() {
        let mut b = block("192.168.0.64/26");
        let ordinal = b.lowest_free().unwrap();
        assert_eq!(b.address_at(ordinal).to_string(), "192.168.0.64");

        assert!(b.allocate(ordinal, None, 2));
        let next = b.lowest_free().unwrap();
        assert_eq!(b.address_at(next).to_string(), "192.168.0.65");
    }

    #[test]
    fn test_allocate_and_release() {
        let mut b = block("10.0.0.0/26");
        let handle = Handle::new("container-1");

        assert!(b.allocate(7, Some(handle.clone()), 4));
        assert!(!b.allocate(7, None, 5));
        assert!(b.is_allocated(IpAddr::from_str("10.0.0.7").unwrap()));
        assert_eq!(b.attribute(7).unwrap().sequence, 4);

        let released = b.release(7).unwrap();
        assert_eq!(released.handle, Some(handle));
        assert!(b.release(7).is_none());
        assert!(b.is_empty());
    }

    #[test]
    fn test_ordinals_for_handle() {
        let mut b = block("10.0.0.0/26");
        let handle = Handle::new("workload");

        b.allocate(1, Some(handle.clone()), 2);
        b.allocate(2, Some(Handle::new("other")), 3);
        b.allocate(9, Some(handle.clone()), 4);

        assert_eq!(b.ordinals_for_handle(&handle), vec![1, 9]);
        assert_eq!(b.allocated_addresses().len(), 3);
    }

    #[test]
    fn test_block_serialization() {
        let mut b = block("10.0.0.0/26");
        b.allocate(3, Some(Handle::new("h")), 2);

        let json = serde_json::to_string(&b).unwrap();
        let restored: BlockRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, b);
    }
}
