//! Storage abstraction and per-table shared locks.

use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};

use crate::block::SendableBlockStream;
use crate::catalog::StorageId;
use crate::error::{CinderError, Result};
use crate::sink::BoxedSink;

/// Type of storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableType {
    /// A base table with stored data
    Base,
    /// A materialized view
    View,
    /// A read-only projection of an external object
    External,
}

/// A shared lock on a storage, released on drop.
///
/// Read pipelines and sinks carry this guard so the lock lives exactly as
/// long as the operation that acquired it.
#[derive(Debug)]
pub struct SharedTableLock {
    _guard: ArcRwLockReadGuard<RawRwLock, ()>,
}

/// An exclusive lock on a storage, released on drop.
#[derive(Debug)]
pub struct ExclusiveTableLock {
    _guard: ArcRwLockWriteGuard<RawRwLock, ()>,
}

/// The lock object every storage owns.
#[derive(Debug, Clone, Default)]
pub struct TableLock {
    inner: Arc<RwLock<()>>,
}

impl TableLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a shared lock for the lifetime of a query.
    pub fn lock_for_share(&self) -> SharedTableLock {
        SharedTableLock {
            _guard: self.inner.read_arc(),
        }
    }

    /// Take an exclusive lock.
    pub fn lock_exclusive(&self) -> ExclusiveTableLock {
        ExclusiveTableLock {
            _guard: self.inner.write_arc(),
        }
    }
}

/// Trait for storages owned by the catalog.
///
/// A storage provides its shape, a read path producing frame-delimited
/// blocks, and a write path producing a sink. Lifecycle hooks default to
/// no-ops so simple engines only implement what they support.
pub trait Storage: Debug + Send + Sync {
    /// Return this storage as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// The id this storage is registered under.
    fn storage_id(&self) -> StorageId;

    /// Get the storage type.
    fn table_type(&self) -> TableType {
        TableType::Base
    }

    /// The declared shape of this storage.
    fn schema(&self) -> SchemaRef;

    /// The storage's table lock.
    fn table_lock(&self) -> &TableLock;

    /// Open a read stream, optionally projecting columns by index.
    fn read(&self, projection: Option<&[usize]>) -> Result<SendableBlockStream>;

    /// Open a sink for writing.
    fn write(&self) -> Result<BoxedSink> {
        Err(CinderError::not_implemented(format!(
            "Writes are not supported by {}",
            self.storage_id()
        )))
    }

    /// Remove all data, keeping the storage registered.
    fn truncate(&self) -> Result<()> {
        Err(CinderError::not_implemented(format!(
            "Truncate is not supported by {}",
            self.storage_id()
        )))
    }

    /// Adopt a new id after a rename or exchange.
    fn rename_in_memory(&self, new_id: StorageId) -> Result<()>;

    /// Hook invoked when the storage is dropped from the catalog.
    fn on_drop(&self) -> Result<()> {
        Ok(())
    }
}
