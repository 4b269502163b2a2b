//! Read / compute / conditional-write with bounded retry
//!
//! Every block mutation in the engine, allocation and release alike, goes
//! through [`update_block`]: read the block and its sequence, let the caller
//! mutate a copy, write it back conditioned on the sequence. A concurrent
//! writer makes the write fail with a conflict, which triggers a fresh read
//! and another attempt until the attempt budget runs out.

use crate::datastore::Datastore;
use crate::error::DatastoreError;
use crate::models::BlockRecord;
use crate::{Error, Result};
use ipnet::IpNet;
use tracing::debug;

/// Decision returned by a block mutation
#[derive(Debug)]
pub enum BlockUpdate<T> {
    /// Persist the mutated record and return the value
    Write(T),
    /// Nothing to persist; return the value without writing
    Unchanged(T),
    /// Stop immediately with an error
    Abort(Error),
}

/// Outcome of a successful [`update_block`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CasOutcome<T> {
    pub value: T,
    /// Block sequence after the call
    pub sequence: u64,
    /// Whether a write was issued
    pub written: bool,
}

/// Apply `mutate` to a block under optimistic concurrency control
///
/// `mutate` receives a copy of the current record and the sequence the
/// block will have if the write lands. It may run several times; it must
/// derive everything from the record it is handed.
///
/// Returns [`Error::ResourceBusy`] after `max_attempts` conflicting writes.
/// A missing block surfaces as a datastore not-found error.
pub async fn update_block<T, F>(
    store: &dyn Datastore,
    cidr: &IpNet,
    max_attempts: u32,
    mut mutate: F,
) -> Result<CasOutcome<T>>
where
    F: FnMut(&mut BlockRecord, u64) -> BlockUpdate<T> + Send,
    T: Send,
{
    let attempts = max_attempts.max(1);

    for attempt in 1..=attempts {
        let current = store.get_block(cidr).await?;
        let mut record = current.value;

        match mutate(&mut record, current.sequence + 1) {
            BlockUpdate::Unchanged(value) => {
                return Ok(CasOutcome {
                    value,
                    sequence: current.sequence,
                    written: false,
                });
            }
            BlockUpdate::Abort(err) => return Err(err),
            BlockUpdate::Write(value) => {
                match store
                    .conditional_write_block(cidr, current.sequence, record)
                    .await
                {
                    Ok(sequence) => {
                        return Ok(CasOutcome {
                            value,
                            sequence,
                            written: true,
                        });
                    }
                    Err(DatastoreError::Conflict { actual, .. }) => {
                        debug!(
                            block = %cidr,
                            attempt,
                            expected = current.sequence,
                            actual,
                            "Block changed concurrently, retrying"
                        );
                        tokio::task::yield_now().await;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }

    Err(Error::ResourceBusy(format!(
        "block {} changed concurrently on {} attempts",
        cidr, attempts
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::{DatastoreResult, MemoryDatastore};
    use crate::models::{Pool, Versioned};
    use async_trait::async_trait;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn net(s: &str) -> IpNet {
        IpNet::from_str(s).unwrap()
    }

    async fn store_with_block() -> MemoryDatastore {
        let store = MemoryDatastore::with_pools([Pool::new(net("10.0.0.0/16"))]).unwrap();
        let cidr = net("10.0.0.0/26");
        store
            .create_block_if_absent(&cidr, BlockRecord::new(cidr, net("10.0.0.0/16"), None))
            .await
            .unwrap();
        store
    }

    /// Wraps a store and rejects the first `conflicts` conditional writes
    struct Contended {
        inner: MemoryDatastore,
        conflicts: AtomicU32,
    }

    #[async_trait]
    impl Datastore for Contended {
        async fn get_pool(&self, cidr: &IpNet) -> DatastoreResult<Pool> {
            self.inner.get_pool(cidr).await
        }

        async fn list_pools(&self) -> DatastoreResult<Vec<Pool>> {
            self.inner.list_pools().await
        }

        async fn get_block(&self, cidr: &IpNet) -> DatastoreResult<Versioned<BlockRecord>> {
            self.inner.get_block(cidr).await
        }

        async fn list_blocks(&self, pool: &IpNet) -> DatastoreResult<Vec<Versioned<BlockRecord>>> {
            self.inner.list_blocks(pool).await
        }

        async fn create_block_if_absent(
            &self,
            cidr: &IpNet,
            record: BlockRecord,
        ) -> DatastoreResult<u64> {
            self.inner.create_block_if_absent(cidr, record).await
        }

        async fn conditional_write_block(
            &self,
            cidr: &IpNet,
            expected: u64,
            record: BlockRecord,
        ) -> DatastoreResult<u64> {
            let remaining = self.conflicts.load(Ordering::SeqCst);
            if remaining > 0 {
                self.conflicts.store(remaining - 1, Ordering::SeqCst);
                return Err(DatastoreError::Conflict {
                    key: cidr.to_string(),
                    expected,
                    actual: expected + 1,
                });
            }
            self.inner.conditional_write_block(cidr, expected, record).await
        }
    }

    #[tokio::test]
    async fn test_write_advances_sequence() {
        let store = store_with_block().await;
        let cidr = net("10.0.0.0/26");

        let outcome = update_block(&store, &cidr, 3, |record, next| {
            record.allocate(0, None, next);
            BlockUpdate::Write(next)
        })
        .await
        .unwrap();

        assert!(outcome.written);
        assert_eq!(outcome.value, 2);
        assert_eq!(outcome.sequence, 2);
        assert_eq!(store.get_block(&cidr).await.unwrap().value.attribute(0).unwrap().sequence, 2);
    }

    #[tokio::test]
    async fn test_unchanged_skips_write() {
        let store = store_with_block().await;
        let cidr = net("10.0.0.0/26");

        let outcome = update_block(&store, &cidr, 3, |_, _| BlockUpdate::Unchanged("noop"))
            .await
            .unwrap();

        assert!(!outcome.written);
        assert_eq!(outcome.sequence, 1);
        assert_eq!(store.get_block(&cidr).await.unwrap().sequence, 1);
    }

    #[tokio::test]
    async fn test_abort_propagates() {
        let store = store_with_block().await;
        let cidr = net("10.0.0.0/26");
        let ip = "10.0.0.1".parse().unwrap();

        let result: Result<CasOutcome<()>> =
            update_block(&store, &cidr, 3, |_, _| BlockUpdate::Abort(Error::AddressInUse(ip))).await;
        assert!(matches!(result, Err(Error::AddressInUse(_))));
    }

    #[tokio::test]
    async fn test_conflicts_are_retried() {
        let store = Contended {
            inner: store_with_block().await,
            conflicts: AtomicU32::new(2),
        };
        let cidr = net("10.0.0.0/26");
        let mut calls = 0;

        let outcome = update_block(&store, &cidr, 3, |record, next| {
            calls += 1;
            record.allocate(0, None, next);
            BlockUpdate::Write(())
        })
        .await
        .unwrap();

        assert!(outcome.written);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let store = Contended {
            inner: store_with_block().await,
            conflicts: AtomicU32::new(10),
        };
        let cidr = net("10.0.0.0/26");

        let result = update_block(&store, &cidr, 4, |record, next| {
            record.allocate(0, None, next);
            BlockUpdate::Write(())
        })
        .await;

        assert!(matches!(result, Err(Error::ResourceBusy(_))));
        assert_eq!(store.conflicts.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_missing_block_is_not_found() {
        let store = MemoryDatastore::new();
        let result = update_block(&store, &net("10.0.0.0/26"), 3, |_, _| BlockUpdate::Write(()))
            .await;

        assert!(result.unwrap_err().is_not_found());
    }
}
