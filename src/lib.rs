//! cinder - derived-table propagation core of an embedded columnar engine
//!
//! cinder is the engine-internal slice of a column-oriented analytical
//! database that turns transient query state into durable derived state:
//! writes fan out to dependent views, aggregating tables keep an
//! always-live aggregation, materialized views refresh incrementally or
//! on a schedule, and externally-configured dictionaries reload in the
//! background with backoff.
//!
//! # Features
//!
//! - **Frame-preserving dataflow**: blocks move between sources and sinks
//!   in delimited frames, and the fan-out writer broadcasts every frame
//!   to a table plus all of its dependent views
//! - **Aggregating tables**: storages defined by an aggregation query,
//!   feeding a shared aggregation arena on write and materializing it on
//!   read
//! - **Materialized views**: inner or `TO`-table targets, shadow-build
//!   refresh with an atomic exchange, and scheduled periodic refresh
//! - **Loadable registry**: config-file and catalog provenances, staggered
//!   background reload, exponential backoff on failure
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use arrow::datatypes::{DataType, Field, Schema};
//! use cinder::{Engine, Result, StorageId};
//!
//! fn main() -> Result<()> {
//!     let engine = Engine::new();
//!
//!     let schema = Arc::new(Schema::new(vec![
//!         Field::new("city", DataType::Utf8, false),
//!         Field::new("amount", DataType::Int64, false),
//!     ]));
//!     engine.create_table(StorageId::new("default", "sales"), schema)?;
//!
//!     // Writes now flow through the fan-out writer, reaching the table
//!     // and every materialized view that depends on it.
//!     Ok(())
//! }
//! ```

pub mod aggregate;
pub mod block;
pub mod catalog;
pub mod copy;
pub mod dictionary;
pub mod error;
pub mod fanout;
pub mod registry;
pub mod schedule;
pub mod sink;
pub mod storage;
pub mod transform;

// Re-export commonly used types
pub use block::{Block, BlockStream, BlocksStream, ProfileInfo};
pub use catalog::{Catalog, Storage, StorageId, TableType};
pub use copy::{copy_blocks, CancellationToken};
pub use error::{CinderError, Result};
pub use fanout::PushingToViewsSink;
pub use sink::Sink;

use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;

use crate::schedule::SchedulePool;
use crate::storage::{
    AggregatingMemoryTable, AggregationQuery, CreateViewParams, MaterializedView, MemoryTable,
};

/// Engine-wide feature switches.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Allow `ALTER`ing a materialized view's SELECT
    pub allow_experimental_alter_view_structure: bool,
}

/// The engine facade: a catalog, a schedule pool, and settings.
///
/// This is the assembly point the subsystems hang off of; every
/// operation below is a thin composition of the public pieces.
#[derive(Debug)]
pub struct Engine {
    catalog: Arc<Catalog>,
    schedule_pool: Arc<SchedulePool>,
    settings: EngineSettings,
}

impl Engine {
    /// Create an engine with a default catalog and a running pool.
    pub fn new() -> Self {
        Self::with_settings(EngineSettings::default())
    }

    /// Create an engine with explicit settings.
    pub fn with_settings(settings: EngineSettings) -> Self {
        Self {
            catalog: Arc::new(Catalog::new()),
            schedule_pool: Arc::new(SchedulePool::new()),
            settings,
        }
    }

    /// The global catalog.
    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// The background schedule pool.
    pub fn schedule_pool(&self) -> &Arc<SchedulePool> {
        &self.schedule_pool
    }

    /// Engine settings.
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Create and register an in-memory base table.
    pub fn create_table(&self, id: StorageId, schema: SchemaRef) -> Result<Arc<MemoryTable>> {
        let table = Arc::new(MemoryTable::empty(id, schema));
        self.catalog.register_table(table.clone())?;
        Ok(table)
    }

    /// Create and register an aggregating in-memory table.
    pub fn create_aggregating_table(
        &self,
        id: StorageId,
        query: AggregationQuery,
    ) -> Result<Arc<AggregatingMemoryTable>> {
        let table = AggregatingMemoryTable::new(id, &self.catalog, query)?;
        self.catalog.register_table(table.clone())?;
        Ok(table)
    }

    /// Create, register, and start a materialized view.
    pub fn create_materialized_view(
        &self,
        params: CreateViewParams,
    ) -> Result<Arc<MaterializedView>> {
        let view = MaterializedView::create(self.catalog.clone(), &self.schedule_pool, params)?;
        self.catalog.register_table(view.clone())?;
        view.startup();
        Ok(view)
    }

    /// Insert batches into a table through the fan-out writer, so every
    /// dependent view receives them too.
    pub fn insert_into(&self, id: &StorageId, batches: Vec<RecordBatch>) -> Result<()> {
        let mut source = BlocksStream::one_frame(batches);
        let mut sink = PushingToViewsSink::new(&self.catalog, id, false)?;
        copy_blocks(&mut source, &mut sink, None)
    }

    /// Read a table's current contents.
    pub fn read_table(&self, id: &StorageId) -> Result<Vec<RecordBatch>> {
        let storage = self.catalog.get_table(id)?;
        let mut stream = storage.read(None)?;
        let mut batches = Vec::new();
        while let Some(block) = stream.read()? {
            batches.push(block.batch);
        }
        Ok(batches)
    }

    /// Drop a table or view, running its lifecycle hook.
    pub fn drop_table(&self, id: &StorageId) -> Result<()> {
        self.catalog.drop_table(id)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

/// Prelude module for common imports.
pub mod prelude {
    pub use crate::block::{Block, BlockStream, BlocksStream};
    pub use crate::catalog::{Catalog, Storage, StorageId};
    pub use crate::copy::{copy_blocks, CancellationToken};
    pub use crate::error::{CinderError, Result};
    pub use crate::sink::Sink;
    pub use crate::{Engine, EngineSettings};
}
