//! Data models for address management

mod allocation;
mod block;
mod pool;

pub use allocation::{
    AllocatedAddress, AllocationInfo, AllocationRequest, AssignResult, Handle, PoolUsage,
};
pub use block::{AllocationAttr, AllocationBitmap, BlockAffinity, BlockRecord, Versioned};
pub use pool::{IpFamily, Pool};
