//! Hierarchy Store
//!
//! Transactional storage for clusters, domains, projects and their services
//! and resources. This is an in-memory implementation of the storage
//! boundary: one writer at a time, changes visible only after commit.

mod transaction;

pub use transaction::Transaction;

use crate::error::{Error, Result};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};
use transaction::Tables;

/// Interval that doubles before each wait for the schema
const SCHEMA_WAIT_BASE: Duration = Duration::from_secs(1);

// =============================================================================
// Schema Version Source
// =============================================================================

/// Exposes the schema version applied by the migration tooling
#[async_trait]
pub trait SchemaVersionSource: Send + Sync {
    async fn current_schema_version(&self) -> Result<Option<i64>>;
}

/// Block until the store reports `expected`, doubling the wait each time
///
/// Errors from the source are fatal and returned immediately.
pub async fn wait_for_schema<S>(source: &S, expected: i64) -> Result<()>
where
    S: SchemaVersionSource + ?Sized,
{
    let mut backoff = ExponentialBackoff {
        current_interval: SCHEMA_WAIT_BASE * 2,
        initial_interval: SCHEMA_WAIT_BASE * 2,
        randomization_factor: 0.0,
        multiplier: 2.0,
        max_interval: Duration::from_secs(u64::from(u32::MAX)),
        max_elapsed_time: None,
        ..Default::default()
    };

    debug!("Waiting for database to migrate to schema version {}", expected);
    loop {
        if source.current_schema_version().await? == Some(expected) {
            break;
        }
        let wait = backoff.next_backoff().unwrap_or(SCHEMA_WAIT_BASE);
        info!(
            "Database is not migrated to schema version {} yet - will retry in {} seconds",
            expected,
            wait.as_secs()
        );
        tokio::time::sleep(wait).await;
    }

    debug!("Database is migrated - commencing normal startup");
    Ok(())
}

// =============================================================================
// Hierarchy Store
// =============================================================================

/// Shared transactional store, the only shared mutable state of the engine
pub struct HierarchyStore {
    tables: Arc<Mutex<Tables>>,
    schema_version: RwLock<Option<i64>>,
    available: Arc<AtomicBool>,
}

impl HierarchyStore {
    /// Create an empty store with no schema applied
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            schema_version: RwLock::new(None),
            available: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Create an empty store with `version` already applied
    pub fn with_schema_version(version: i64) -> Arc<Self> {
        let store = Self::new();
        store.set_schema_version(version);
        store
    }

    /// Record a schema migration
    pub fn set_schema_version(&self, version: i64) {
        *self.schema_version.write() = Some(version);
    }

    /// Simulate losing or regaining the storage connection
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Begin a transaction, waiting for concurrent transactions to finish
    pub async fn begin(&self) -> Result<Transaction> {
        self.ensure_available()?;
        let guard = self.tables.clone().lock_owned().await;
        self.ensure_available()?;
        Ok(Transaction::new(guard, self.available.clone()))
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::StorageUnavailable("store is not reachable".into()))
        }
    }
}

#[async_trait]
impl SchemaVersionSource for HierarchyStore {
    async fn current_schema_version(&self) -> Result<Option<i64>> {
        self.ensure_available()?;
        Ok(*self.schema_version.read())
    }
}
