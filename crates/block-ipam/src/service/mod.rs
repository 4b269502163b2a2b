//! Engine service

mod manager;

pub use manager::IpamEngine;
