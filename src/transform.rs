//! Executable expression stages applied to blocks.
//!
//! The engine treats expression evaluation as an external concern: a stage
//! is anything implementing [`BlockTransform`]. The concrete transforms
//! here cover what the derived-table core itself needs: projections,
//! shape conversion, and chained stages.

use std::fmt;
use std::sync::Arc;

use arrow::array::ArrayRef;
use arrow::datatypes::{Schema, SchemaRef};
use arrow::record_batch::RecordBatch;

use crate::block::{Block, BlockStream, ProfileInfo};
use crate::error::{CinderError, Result};

/// A pure batch-to-batch stage.
pub trait BlockTransform: Send + Sync {
    /// Apply the stage to one batch.
    fn transform(&self, batch: &RecordBatch) -> Result<RecordBatch>;

    /// The shape this stage produces for a given input shape.
    fn output_schema(&self, input: &SchemaRef) -> Result<SchemaRef> {
        let empty = RecordBatch::new_empty(input.clone());
        Ok(self.transform(&empty)?.schema())
    }
}

impl fmt::Debug for dyn BlockTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BlockTransform")
    }
}

/// Passes batches through untouched.
#[derive(Debug, Default, Clone)]
pub struct IdentityTransform;

impl BlockTransform for IdentityTransform {
    fn transform(&self, batch: &RecordBatch) -> Result<RecordBatch> {
        Ok(batch.clone())
    }

    fn output_schema(&self, input: &SchemaRef) -> Result<SchemaRef> {
        Ok(input.clone())
    }
}

/// Projects a batch down to the named columns, in the given order.
#[derive(Debug, Clone)]
pub struct ProjectionTransform {
    columns: Vec<String>,
}

impl ProjectionTransform {
    pub fn new(columns: Vec<String>) -> Self {
        Self { columns }
    }
}

impl BlockTransform for ProjectionTransform {
    fn transform(&self, batch: &RecordBatch) -> Result<RecordBatch> {
        let schema = batch.schema();
        let mut indices = Vec::with_capacity(self.columns.len());
        for name in &self.columns {
            let idx = schema.index_of(name).map_err(|_| {
                CinderError::schema(format!("Column '{}' not found in projection input", name))
            })?;
            indices.push(idx);
        }

        let columns: Vec<ArrayRef> = indices.iter().map(|&i| batch.column(i).clone()).collect();
        let fields: Vec<_> = indices.iter().map(|&i| schema.field(i).clone()).collect();
        Ok(RecordBatch::try_new(
            Arc::new(Schema::new(fields)),
            columns,
        )?)
    }
}

/// Reorders a batch's columns by name to match a target shape, verifying
/// that types line up position by position afterwards.
#[derive(Debug, Clone)]
pub struct ConvertingTransform {
    target: SchemaRef,
}

impl ConvertingTransform {
    pub fn new(target: SchemaRef) -> Self {
        Self { target }
    }
}

impl BlockTransform for ConvertingTransform {
    fn transform(&self, batch: &RecordBatch) -> Result<RecordBatch> {
        let schema = batch.schema();
        let mut columns = Vec::with_capacity(self.target.fields().len());

        for field in self.target.fields() {
            let idx = schema.index_of(field.name()).map_err(|_| {
                CinderError::schema(format!(
                    "Column '{}' required by the target shape is missing",
                    field.name()
                ))
            })?;
            let column = batch.column(idx);
            if column.data_type() != field.data_type() {
                return Err(CinderError::type_error(format!(
                    "Column '{}' has type {:?}, target shape requires {:?}",
                    field.name(),
                    column.data_type(),
                    field.data_type()
                )));
            }
            columns.push(column.clone());
        }

        Ok(RecordBatch::try_new(self.target.clone(), columns)?)
    }

    fn output_schema(&self, _input: &SchemaRef) -> Result<SchemaRef> {
        Ok(self.target.clone())
    }
}

/// Applies stages in sequence.
#[derive(Debug, Clone, Default)]
pub struct ChainTransform {
    stages: Vec<Arc<dyn BlockTransform>>,
}

impl ChainTransform {
    pub fn new(stages: Vec<Arc<dyn BlockTransform>>) -> Self {
        Self { stages }
    }
}

impl BlockTransform for ChainTransform {
    fn transform(&self, batch: &RecordBatch) -> Result<RecordBatch> {
        let mut current = batch.clone();
        for stage in &self.stages {
            current = stage.transform(&current)?;
        }
        Ok(current)
    }
}

/// A block stream applying a transform to each block, preserving frame
/// markers; optionally keeps a resource guard alive for its lifetime.
pub struct TransformingBlockStream {
    inner: Box<dyn BlockStream>,
    transform: Arc<dyn BlockTransform>,
    _guard: Option<Box<dyn Send>>,
}

impl TransformingBlockStream {
    pub fn new(inner: Box<dyn BlockStream>, transform: Arc<dyn BlockTransform>) -> Self {
        Self {
            inner,
            transform,
            _guard: None,
        }
    }

    /// Attach an opaque guard released when the stream is dropped.
    pub fn with_guard(mut self, guard: Box<dyn Send>) -> Self {
        self._guard = Some(guard);
        self
    }
}

impl BlockStream for TransformingBlockStream {
    fn read(&mut self) -> Result<Option<Block>> {
        match self.inner.read()? {
            Some(block) => {
                let batch = self.transform.transform(&block.batch)?;
                Ok(Some(block.with_batch(batch)))
            }
            None => Ok(None),
        }
    }

    fn profile_info(&self) -> Option<&ProfileInfo> {
        self.inner.profile_info()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field};

    fn make_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![1, 2])),
                Arc::new(StringArray::from(vec!["a", "b"])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_projection() {
        let transform = ProjectionTransform::new(vec!["name".to_string()]);
        let out = transform.transform(&make_batch()).unwrap();
        assert_eq!(out.num_columns(), 1);
        assert_eq!(out.schema().field(0).name(), "name");
    }

    #[test]
    fn test_projection_missing_column() {
        let transform = ProjectionTransform::new(vec!["missing".to_string()]);
        assert!(transform.transform(&make_batch()).is_err());
    }

    #[test]
    fn test_converting_reorders() {
        let target = Arc::new(Schema::new(vec![
            Field::new("name", DataType::Utf8, true),
            Field::new("id", DataType::Int64, false),
        ]));
        let transform = ConvertingTransform::new(target);
        let out = transform.transform(&make_batch()).unwrap();
        assert_eq!(out.schema().field(0).name(), "name");
        assert_eq!(out.schema().field(1).name(), "id");
    }

    #[test]
    fn test_converting_type_mismatch() {
        let target = Arc::new(Schema::new(vec![Field::new("id", DataType::Utf8, false)]));
        let transform = ConvertingTransform::new(target);
        assert!(transform.transform(&make_batch()).is_err());
    }

    #[test]
    fn test_chain() {
        let chain = ChainTransform::new(vec![
            Arc::new(IdentityTransform),
            Arc::new(ProjectionTransform::new(vec!["id".to_string()])),
        ]);
        let out = chain.transform(&make_batch()).unwrap();
        assert_eq!(out.num_columns(), 1);
    }

    #[test]
    fn test_output_schema_via_empty_batch() {
        let transform = ProjectionTransform::new(vec!["id".to_string()]);
        let schema = transform.output_schema(&make_batch().schema()).unwrap();
        assert_eq!(schema.fields().len(), 1);
        assert_eq!(schema.field(0).name(), "id");
    }
}
