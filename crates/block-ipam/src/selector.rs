//! Pool selection
//!
//! Turns the caller's pool hints (or "every pool") into an explicit,
//! ordered candidate list. The order of the returned [`OrderedPools`] is the
//! order in which the allocator tries pools.

use crate::datastore::Datastore;
use crate::error::DatastoreError;
use crate::models::{IpFamily, Pool};
use crate::{Error, Result};
use ipnet::IpNet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// What the selected pools will be used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    /// Automatic addressing; disabled pools are excluded
    Automatic,
    /// A caller-chosen address; disabled pools stay eligible
    Explicit,
}

/// Candidate pools in try order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderedPools(Vec<Pool>);

impl OrderedPools {
    pub fn new(pools: Vec<Pool>) -> Self {
        Self(pools)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Pool> {
        self.0.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Pool> {
        self.0.iter()
    }

    /// First candidate pool containing `addr`
    pub fn find_containing(&self, addr: &IpAddr) -> Option<&Pool> {
        self.0.iter().find(|p| p.contains(addr))
    }

    /// Candidate CIDRs in order
    pub fn cidrs(&self) -> Vec<IpNet> {
        self.0.iter().map(|p| p.cidr).collect()
    }
}

impl IntoIterator for OrderedPools {
    type Item = Pool;
    type IntoIter = std::vec::IntoIter<Pool>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a OrderedPools {
    type Item = &'a Pool;
    type IntoIter = std::slice::Iter<'a, Pool>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Resolves pool hints into candidate pools
#[derive(Clone)]
pub struct PoolSelector {
    store: Arc<dyn Datastore>,
}

impl PoolSelector {
    pub fn new(store: Arc<dyn Datastore>) -> Self {
        Self { store }
    }

    /// Select candidate pools for `family`
    ///
    /// Without hints every pool of the family is returned in configured
    /// priority order. With hints, every hint is resolved before anything
    /// is returned, so an unknown pool fails the call wherever it appears in
    /// the list.
    pub async fn select(
        &self,
        family: IpFamily,
        hints: Option<&[IpNet]>,
        mode: SelectionMode,
    ) -> Result<OrderedPools> {
        let pools = match hints {
            Some(hints) if !hints.is_empty() => self.resolve_hints(family, hints).await?,
            _ => self
                .store
                .list_pools()
                .await?
                .into_iter()
                .filter(|p| p.family() == family)
                .collect(),
        };

        let hinted = hints.is_some_and(|h| !h.is_empty());
        let selected: Vec<Pool> = pools
            .into_iter()
            .filter(|pool| {
                if mode == SelectionMode::Automatic && pool.disabled {
                    if hinted {
                        warn!(pool = %pool.cidr, "Requested pool is disabled, skipping");
                    } else {
                        debug!(pool = %pool.cidr, "Skipping disabled pool");
                    }
                    return false;
                }
                true
            })
            .collect();

        Ok(OrderedPools::new(selected))
    }

    async fn resolve_hints(&self, family: IpFamily, hints: &[IpNet]) -> Result<Vec<Pool>> {
        let mut resolved: Vec<Pool> = Vec::with_capacity(hints.len());

        for hint in hints {
            let pool = match self.store.get_pool(&hint.trunc()).await {
                Ok(pool) => pool,
                Err(DatastoreError::NotFound(_)) => {
                    warn!(pool = %hint, "Requested pool does not exist");
                    return Err(Error::PoolNotFound(hint.to_string()));
                }
                Err(e) => return Err(e.into()),
            };

            if pool.family() != family {
                return Err(Error::PoolFamilyMismatch {
                    pool: pool.cidr,
                    expected: family,
                });
            }

            if !resolved.iter().any(|p| p.cidr == pool.cidr) {
                resolved.push(pool);
            }
        }

        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::MemoryDatastore;
    use std::str::FromStr;

    fn net(s: &str) -> IpNet {
        IpNet::from_str(s).unwrap()
    }

    fn selector() -> (Arc<MemoryDatastore>, PoolSelector) {
        let store = Arc::new(
            MemoryDatastore::with_pools([
                Pool::new(net("192.168.0.0/16")),
                Pool::new(net("192.169.1.0/24")).disabled(),
                Pool::new(net("10.10.0.0/16")).with_order(10),
                Pool::new(net("fd80:24e2:f998:72d6::/64")),
            ])
            .unwrap(),
        );
        (store.clone(), PoolSelector::new(store))
    }

    #[tokio::test]
    async fn test_all_enabled_pools_in_order() {
        let (_, selector) = selector();

        let pools = selector
            .select(IpFamily::V4, None, SelectionMode::Automatic)
            .await
            .unwrap();
        assert_eq!(pools.cidrs(), vec![net("192.168.0.0/16"), net("10.10.0.0/16")]);
    }

    #[tokio::test]
    async fn test_explicit_mode_keeps_disabled() {
        let (_, selector) = selector();

        let pools = selector
            .select(IpFamily::V4, None, SelectionMode::Explicit)
            .await
            .unwrap();
        assert_eq!(pools.len(), 3);
        assert!(pools.find_containing(&"192.169.1.9".parse().unwrap()).is_some());
    }

    #[tokio::test]
    async fn test_family_filter() {
        let (_, selector) = selector();

        let pools = selector
            .select(IpFamily::V6, None, SelectionMode::Automatic)
            .await
            .unwrap();
        assert_eq!(pools.cidrs(), vec![net("fd80:24e2:f998:72d6::/64")]);
    }

    #[tokio::test]
    async fn test_hints_preserve_caller_order() {
        let (_, selector) = selector();
        let hints = [net("10.10.0.0/16"), net("192.168.0.0/16")];

        let pools = selector
            .select(IpFamily::V4, Some(&hints), SelectionMode::Automatic)
            .await
            .unwrap();
        assert_eq!(pools.cidrs(), hints.to_vec());
    }

    #[tokio::test]
    async fn test_unknown_hint_fails_in_any_position() {
        let (_, selector) = selector();

        for hints in [
            [net("172.16.0.0/16"), net("192.168.0.0/16")],
            [net("192.168.0.0/16"), net("172.16.0.0/16")],
        ] {
            let err = selector
                .select(IpFamily::V4, Some(&hints), SelectionMode::Automatic)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::PoolNotFound(_)));
            assert!(err.to_string().contains("172.16.0.0/16) does not exist"));
        }
    }

    #[tokio::test]
    async fn test_hint_with_host_bits() {
        let (_, selector) = selector();

        let hints = [net("192.168.4.1/16")];
        let pools = selector
            .select(IpFamily::V4, Some(&hints), SelectionMode::Automatic)
            .await
            .unwrap();
        assert_eq!(pools.cidrs(), vec![net("192.168.0.0/16")]);

        // Unknown pools are reported as the caller wrote them
        let hints = [net("172.16.5.5/16")];
        let err = selector
            .select(IpFamily::V4, Some(&hints), SelectionMode::Automatic)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("(172.16.5.5/16) does not exist"));
    }

    #[tokio::test]
    async fn test_disabled_hint_excluded_for_automatic() {
        let (_, selector) = selector();
        let hints = [net("192.169.1.0/24"), net("192.168.0.0/16")];

        let auto = selector
            .select(IpFamily::V4, Some(&hints), SelectionMode::Automatic)
            .await
            .unwrap();
        assert_eq!(auto.cidrs(), vec![net("192.168.0.0/16")]);

        let explicit = selector
            .select(IpFamily::V4, Some(&hints), SelectionMode::Explicit)
            .await
            .unwrap();
        assert_eq!(explicit.cidrs(), hints.to_vec());
    }

    #[tokio::test]
    async fn test_wrong_family_hint() {
        let (_, selector) = selector();
        let hints = [net("fd80:24e2:f998:72d6::/64")];

        let err = selector
            .select(IpFamily::V4, Some(&hints), SelectionMode::Automatic)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PoolFamilyMismatch { .. }));
    }

    #[tokio::test]
    async fn test_pool_disabled_after_selection_setup() {
        let (store, selector) = selector();
        store.set_pool_disabled(&net("192.168.0.0/16"), true).unwrap();

        let pools = selector
            .select(IpFamily::V4, None, SelectionMode::Automatic)
            .await
            .unwrap();
        assert_eq!(pools.cidrs(), vec![net("10.10.0.0/16")]);
    }
}
