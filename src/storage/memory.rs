//! In-memory base table backed by Arrow RecordBatches.
//!
//! This is the engine the fan-out writer targets directly and the default
//! inner engine for materialized views.

use std::any::Any;
use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use parking_lot::RwLock;

use crate::block::{same_shape, Block, BlocksStream, SendableBlockStream};
use crate::catalog::{Storage, StorageId, TableLock, TableType};
use crate::error::{CinderError, Result};
use crate::sink::{BoxedSink, Sink};

/// An in-memory table.
#[derive(Debug)]
pub struct MemoryTable {
    id: RwLock<StorageId>,
    schema: SchemaRef,
    batches: Arc<RwLock<Vec<RecordBatch>>>,
    lock: TableLock,
}

impl MemoryTable {
    /// Create a memory table with initial data.
    pub fn new(id: StorageId, schema: SchemaRef, batches: Vec<RecordBatch>) -> Self {
        Self {
            id: RwLock::new(id),
            schema,
            batches: Arc::new(RwLock::new(batches)),
            lock: TableLock::new(),
        }
    }

    /// Create an empty memory table.
    pub fn empty(id: StorageId, schema: SchemaRef) -> Self {
        Self::new(id, schema, Vec::new())
    }

    /// Number of rows across all batches.
    pub fn num_rows(&self) -> usize {
        self.batches.read().iter().map(|b| b.num_rows()).sum()
    }

    /// Number of stored batches.
    pub fn num_batches(&self) -> usize {
        self.batches.read().len()
    }

    /// Snapshot of the current batches.
    pub fn snapshot(&self) -> Vec<RecordBatch> {
        self.batches.read().clone()
    }
}

impl Storage for MemoryTable {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn storage_id(&self) -> StorageId {
        self.id.read().clone()
    }

    fn table_type(&self) -> TableType {
        TableType::Base
    }

    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn table_lock(&self) -> &TableLock {
        &self.lock
    }

    fn read(&self, projection: Option<&[usize]>) -> Result<SendableBlockStream> {
        let batches = self.batches.read();
        let mut result = Vec::with_capacity(batches.len());

        for batch in batches.iter() {
            let projected = match projection {
                Some(indices) => batch.project(indices)?,
                None => batch.clone(),
            };
            result.push(projected);
        }
        drop(batches);

        Ok(Box::new(BlocksStream::one_frame(result)))
    }

    fn write(&self) -> Result<BoxedSink> {
        Ok(Box::new(MemorySink {
            schema: self.schema.clone(),
            batches: self.batches.clone(),
            pending: Vec::new(),
        }))
    }

    fn truncate(&self) -> Result<()> {
        self.batches.write().clear();
        Ok(())
    }

    fn rename_in_memory(&self, new_id: StorageId) -> Result<()> {
        *self.id.write() = new_id;
        Ok(())
    }
}

/// Sink appending frames to a [`MemoryTable`].
///
/// Blocks are staged per frame and installed at the suffix, so a frame
/// becomes visible to readers as a unit.
#[derive(Debug)]
struct MemorySink {
    schema: SchemaRef,
    batches: Arc<RwLock<Vec<RecordBatch>>>,
    pending: Vec<RecordBatch>,
}

impl Sink for MemorySink {
    fn write_prefix(&mut self) -> Result<()> {
        self.pending.clear();
        Ok(())
    }

    fn write(&mut self, block: &Block) -> Result<()> {
        if !same_shape(&block.schema(), &self.schema) {
            return Err(CinderError::schema(format!(
                "Block shape {:?} does not match table shape {:?}",
                block.schema().fields(),
                self.schema.fields()
            )));
        }
        self.pending.push(block.batch.clone());
        Ok(())
    }

    fn write_suffix(&mut self) -> Result<()> {
        let mut batches = self.batches.write();
        batches.append(&mut self.pending);
        Ok(())
    }
}
