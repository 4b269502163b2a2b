//! Error types for address management

use crate::models::IpFamily;
use ipnet::IpNet;
use std::net::IpAddr;
use thiserror::Error;

/// Result type for IPAM operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by a [`Datastore`](crate::datastore::Datastore) implementation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DatastoreError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    #[error("Sequence conflict on {key}: expected {expected}, found {actual}")]
    Conflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("Datastore backend error: {0}")]
    Backend(String),
}

/// IPAM engine errors
#[derive(Debug, Clone, Error)]
pub enum Error {
    // Pool selection errors
    #[error("the given pool ({0}) does not exist")]
    PoolNotFound(String),

    #[error("pool {pool} is not an {expected} pool")]
    PoolFamilyMismatch { pool: IpNet, expected: IpFamily },

    // Allocation errors
    #[error("address {0} is not in any of the candidate pools")]
    PoolMismatch(IpAddr),

    #[error("address {0} is already in use")]
    AddressInUse(IpAddr),

    #[error("no available {0} addresses in the candidate pools")]
    NoAvailableAddress(IpFamily),

    #[error("resource busy: {0}")]
    ResourceBusy(String),

    #[error("{source}; rollback failed, {leaked:?} still allocated: {reason}")]
    RollbackFailed {
        source: Box<Error>,
        leaked: Vec<IpAddr>,
        reason: String,
    },

    // Boundary errors
    #[error("Invalid CIDR: {0}")]
    InvalidCidr(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Datastore errors
    #[error("Datastore error: {0}")]
    Datastore(#[from] DatastoreError),
}

impl Error {
    /// True when the underlying cause is a missing datastore record
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Datastore(DatastoreError::NotFound(_)))
    }
}

impl From<ipnet::PrefixLenError> for Error {
    fn from(e: ipnet::PrefixLenError) -> Self {
        Error::InvalidCidr(e.to_string())
    }
}

impl From<ipnet::AddrParseError> for Error {
    fn from(e: ipnet::AddrParseError) -> Self {
        Error::InvalidCidr(e.to_string())
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(e: std::net::AddrParseError) -> Self {
        Error::InvalidCidr(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}
