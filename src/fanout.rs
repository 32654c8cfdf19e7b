//! Dataflow fan-out writer.
//!
//! A sink constructed over a base storage that forwards every frame to the
//! storage itself plus a sub-writer per dependent view. Sub-writers are
//! fan-out sinks in their own right, so propagation is transitive through
//! the dependency DAG. When the base storage is itself a materialized
//! view, the primary output recurses to the view's target table.

use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use tracing::debug;

use crate::block::Block;
use crate::catalog::{Catalog, StorageId};
use crate::error::{CinderError, Result};
use crate::sink::{BoxedSink, Sink};
use crate::storage::MaterializedView;
use crate::transform::BlockTransform;

/// One dependent view attached to the fan-out.
struct ViewOutput {
    id: StorageId,
    /// The view's saved SELECT in executable form; `None` writes the
    /// block through unchanged (the target applies its own stages).
    transform: Option<Arc<dyn BlockTransform>>,
    sink: Box<PushingToViewsSink>,
}

/// Writes data to the specified table and to all dependent views.
pub struct PushingToViewsSink {
    storage_id: StorageId,
    output: Option<BoxedSink>,
    views: Vec<ViewOutput>,
}

impl PushingToViewsSink {
    /// Construct the fan-out over `id`.
    ///
    /// `suppress_primary_write` skips the primary sink so a caller can
    /// propagate to views only.
    pub fn new(
        catalog: &Arc<Catalog>,
        id: &StorageId,
        suppress_primary_write: bool,
    ) -> Result<Self> {
        let storage = catalog.get_table(id)?;

        let output = if let Some(view) = storage.as_any().downcast_ref::<MaterializedView>() {
            // The view's own writes land in its target table, and anything
            // hanging off the target receives them transitively.
            let target_id = view.target_table_id();
            Some(Box::new(Self::new(catalog, &target_id, false)?) as BoxedSink)
        } else if !suppress_primary_write {
            Some(storage.write()?)
        } else {
            None
        };

        let dependent = catalog.dependent_views(id);
        let mut views = Vec::with_capacity(dependent.len());
        for view_id in dependent {
            let view_storage = catalog.get_table(&view_id)?;
            let transform = view_storage
                .as_any()
                .downcast_ref::<MaterializedView>()
                .map(|view| view.select_transform());
            let sink = Box::new(Self::new(catalog, &view_id, false)?);
            views.push(ViewOutput {
                id: view_id,
                transform,
                sink,
            });
        }

        if !views.is_empty() {
            debug!(table = %id, views = views.len(), "fan-out writer opened");
        }

        Ok(Self {
            storage_id: id.clone(),
            output,
            views,
        })
    }

    /// The storage this fan-out was constructed over.
    pub fn storage_id(&self) -> &StorageId {
        &self.storage_id
    }
}

fn forward_err(id: &StorageId, e: CinderError) -> CinderError {
    CinderError::forward(format!("pushing to view '{}': {}", id, e))
}

impl Sink for PushingToViewsSink {
    fn set_sample_block(&mut self, batch: &RecordBatch) -> Result<()> {
        if let Some(output) = &mut self.output {
            output.set_sample_block(batch)?;
        }
        for view in &mut self.views {
            let converted = match &view.transform {
                Some(transform) => transform.transform(batch)?,
                None => batch.clone(),
            };
            view.sink
                .set_sample_block(&converted)
                .map_err(|e| forward_err(&view.id, e))?;
        }
        Ok(())
    }

    fn write_prefix(&mut self) -> Result<()> {
        if let Some(output) = &mut self.output {
            output.write_prefix()?;
        }
        for view in &mut self.views {
            view.sink
                .write_prefix()
                .map_err(|e| forward_err(&view.id, e))?;
        }
        Ok(())
    }

    fn write(&mut self, block: &Block) -> Result<()> {
        if let Some(output) = &mut self.output {
            output.write(block)?;
        }
        // Best-effort serial: a failing view aborts the remainder, and the
        // writes already issued stand.
        for view in &mut self.views {
            let forwarded = match &view.transform {
                Some(transform) => block.with_batch(transform.transform(&block.batch)?),
                None => block.clone(),
            };
            view.sink
                .write(&forwarded)
                .map_err(|e| forward_err(&view.id, e))?;
        }
        Ok(())
    }

    fn write_suffix(&mut self) -> Result<()> {
        if let Some(output) = &mut self.output {
            output.write_suffix()?;
        }
        for view in &mut self.views {
            view.sink
                .write_suffix()
                .map_err(|e| forward_err(&view.id, e))?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(output) = &mut self.output {
            output.flush()?;
        }
        for view in &mut self.views {
            view.sink.flush().map_err(|e| forward_err(&view.id, e))?;
        }
        Ok(())
    }

    fn set_totals(&mut self, totals: &RecordBatch) -> Result<()> {
        if let Some(output) = &mut self.output {
            output.set_totals(totals)?;
        }
        Ok(())
    }

    fn set_extremes(&mut self, extremes: &RecordBatch) -> Result<()> {
        if let Some(output) = &mut self.output {
            output.set_extremes(extremes)?;
        }
        Ok(())
    }

    fn set_rows_before_limit(&mut self, rows: u64) -> Result<()> {
        if let Some(output) = &mut self.output {
            output.set_rows_before_limit(rows)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Storage;
    use crate::storage::MemoryTable;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema, SchemaRef};

    fn test_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]))
    }

    fn make_batch(values: Vec<i64>) -> RecordBatch {
        RecordBatch::try_new(test_schema(), vec![Arc::new(Int64Array::from(values))]).unwrap()
    }

    fn register_memory_table(catalog: &Catalog, name: &str) -> Arc<MemoryTable> {
        let table = Arc::new(MemoryTable::empty(
            StorageId::new("default", name),
            test_schema(),
        ));
        catalog.register_table(table.clone()).unwrap();
        table
    }

    #[test]
    fn test_write_reaches_primary() {
        let catalog = Arc::new(Catalog::new());
        let table = register_memory_table(&catalog, "base");

        let mut sink =
            PushingToViewsSink::new(&catalog, &StorageId::new("default", "base"), false).unwrap();
        sink.write_prefix().unwrap();
        sink.write(&Block::single_frame(make_batch(vec![1, 2]))).unwrap();
        sink.write_suffix().unwrap();

        assert_eq!(table.num_rows(), 2);
    }

    #[test]
    fn test_suppressed_primary_write() {
        let catalog = Arc::new(Catalog::new());
        let table = register_memory_table(&catalog, "base");

        let mut sink =
            PushingToViewsSink::new(&catalog, &StorageId::new("default", "base"), true).unwrap();
        sink.write_prefix().unwrap();
        sink.write(&Block::single_frame(make_batch(vec![1]))).unwrap();
        sink.write_suffix().unwrap();

        assert_eq!(table.num_rows(), 0);
    }

    #[test]
    fn test_missing_table_fails_construction() {
        let catalog = Arc::new(Catalog::new());
        let result =
            PushingToViewsSink::new(&catalog, &StorageId::new("default", "absent"), false);
        assert!(result.is_err());
    }

    #[test]
    fn test_fan_out_to_plain_dependent() {
        // A dependency edge to another base table: the write lands in both.
        let catalog = Arc::new(Catalog::new());
        let base = register_memory_table(&catalog, "base");
        let shadow = register_memory_table(&catalog, "shadow");

        catalog.add_dependency(base.storage_id(), shadow.storage_id());

        let mut sink =
            PushingToViewsSink::new(&catalog, &StorageId::new("default", "base"), false).unwrap();
        sink.write_prefix().unwrap();
        sink.write(&Block::single_frame(make_batch(vec![7]))).unwrap();
        sink.write_suffix().unwrap();

        assert_eq!(base.num_rows(), 1);
        assert_eq!(shadow.num_rows(), 1);
    }

    #[test]
    fn test_view_error_is_forward_error() {
        let catalog = Arc::new(Catalog::new());
        let base = register_memory_table(&catalog, "base");

        // Dependent with an incompatible shape: its sink rejects blocks.
        let narrow = Arc::new(MemoryTable::empty(
            StorageId::new("default", "narrow"),
            Arc::new(Schema::new(vec![Field::new("w", DataType::Int64, false)])),
        ));
        catalog.register_table(narrow.clone()).unwrap();
        catalog.add_dependency(base.storage_id(), narrow.storage_id());

        let mut sink =
            PushingToViewsSink::new(&catalog, &StorageId::new("default", "base"), false).unwrap();
        sink.write_prefix().unwrap();
        let err = sink
            .write(&Block::single_frame(make_batch(vec![1])))
            .unwrap_err();
        assert!(matches!(err, CinderError::Forward { .. }));

        // The primary write already happened and is not rolled back.
        assert_eq!(base.num_rows(), 1);
    }
}
