//! Storage whose definition is an aggregation query.
//!
//! Every write feeds an always-live aggregator; every read materializes
//! the current aggregate state into a one-frame block stream. The state is
//! process-lifetime: it survives until the table is dropped or truncated.

use std::any::Any;
use std::sync::Arc;

use arrow::array::ArrayRef;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;

use crate::aggregate::{
    AggregateDescriptor, AggregatedVariants, Aggregator, AggregatorParams, SharedAggregatedData,
};
use crate::block::{same_shape, Block, BlocksStream, SendableBlockStream};
use crate::catalog::{Catalog, Storage, StorageId, TableLock, TableType};
use crate::error::{CinderError, Result};
use crate::sink::{BoxedSink, Sink};
use crate::transform::BlockTransform;

/// The pre-analyzed defining query of an aggregating table.
///
/// SQL analysis happens upstream; this carries its result: the source
/// table, the grouping keys, the aggregate descriptors, and the
/// expression stages around the aggregation.
#[derive(Debug, Clone)]
pub struct AggregationQuery {
    /// Table whose rows feed the aggregation
    pub source: StorageId,
    /// Grouping-key column names, resolved after `before_aggregation`
    pub group_by: Vec<String>,
    /// Aggregate columns
    pub aggregates: Vec<AggregateDescriptor>,
    /// Converts source-shaped rows into the shape fed to the aggregator
    pub before_aggregation: Option<Arc<dyn BlockTransform>>,
    /// Stage applied to merged output before ordering
    pub before_order_by: Option<Arc<dyn BlockTransform>>,
    /// Final projection producing the declared result shape
    pub final_projection: Option<Arc<dyn BlockTransform>>,
    /// When true, an aggregation over an empty set yields no rows instead
    /// of the single-row empty aggregate
    pub empty_result_for_aggregation_by_empty_set: bool,
}

impl AggregationQuery {
    /// A plain `agg(..) GROUP BY keys` over a source table.
    pub fn new(
        source: StorageId,
        group_by: Vec<&str>,
        aggregates: Vec<AggregateDescriptor>,
    ) -> Self {
        Self {
            source,
            group_by: group_by.into_iter().map(str::to_string).collect(),
            aggregates,
            before_aggregation: None,
            before_order_by: None,
            final_projection: None,
            empty_result_for_aggregation_by_empty_set: false,
        }
    }

    /// Set the pre-aggregation stage.
    pub fn with_before_aggregation(mut self, stage: Arc<dyn BlockTransform>) -> Self {
        self.before_aggregation = Some(stage);
        self
    }

    /// Set the final projection stage.
    pub fn with_final_projection(mut self, stage: Arc<dyn BlockTransform>) -> Self {
        self.final_projection = Some(stage);
        self
    }
}

/// In-memory storage that aggregates everything written into it.
#[derive(Debug)]
pub struct AggregatingMemoryTable {
    id: parking_lot::RwLock<StorageId>,
    query: AggregationQuery,
    /// Shape writes must arrive in (the source table's shape)
    source_schema: SchemaRef,
    /// Shape reads produce after all stages
    output_schema: SchemaRef,
    aggregator: Arc<Aggregator>,
    shared: Arc<SharedAggregatedData>,
    lock: TableLock,
}

impl AggregatingMemoryTable {
    /// Build the table, resolving the source through the catalog.
    pub fn new(id: StorageId, catalog: &Catalog, query: AggregationQuery) -> Result<Arc<Self>> {
        let source = catalog.get_table(&query.source)?;
        let source_schema = source.schema();

        // Shape entering the aggregator, after the pre-aggregation stage.
        let aggregation_header = match &query.before_aggregation {
            Some(stage) => stage.output_schema(&source_schema)?,
            None => source_schema.clone(),
        };

        let params = Arc::new(AggregatorParams::new(
            aggregation_header,
            &query.group_by,
            &query.aggregates,
        )?);
        let aggregator = Arc::new(Aggregator::new(params.clone()));

        let mut output_schema = params.output_schema().clone();
        if let Some(stage) = &query.before_order_by {
            output_schema = stage.output_schema(&output_schema)?;
        }
        if let Some(stage) = &query.final_projection {
            output_schema = stage.output_schema(&output_schema)?;
        }

        let table = Arc::new(Self {
            id: parking_lot::RwLock::new(id),
            source_schema,
            output_schema,
            aggregator,
            shared: Arc::new(SharedAggregatedData::new()),
            query,
            lock: TableLock::new(),
        });

        table.seed_empty_aggregate()?;
        Ok(table)
    }

    /// With no grouping keys an untouched table must read as the canonical
    /// single-row empty aggregate, so pass one zero-row block through the
    /// write path.
    fn seed_empty_aggregate(&self) -> Result<()> {
        if self.aggregator.params().keys_size() != 0
            || self.query.empty_result_for_aggregation_by_empty_set
        {
            return Ok(());
        }
        let mut sink = self.make_sink();
        sink.write_prefix()?;
        sink.write(&Block::single_frame(RecordBatch::new_empty(
            self.source_schema.clone(),
        )))?;
        sink.write_suffix()
    }

    fn make_sink(&self) -> AggregatingSink {
        AggregatingSink {
            source_schema: self.source_schema.clone(),
            before_aggregation: self.query.before_aggregation.clone(),
            aggregator: self.aggregator.clone(),
            shared: self.shared.clone(),
            key_columns: Vec::new(),
            aggregate_columns: Vec::new(),
        }
    }

    /// Number of groups currently held.
    pub fn num_groups(&self) -> usize {
        self.shared.with_variants(|variants| variants.len())
    }
}

impl Storage for AggregatingMemoryTable {
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
        self.output_schema.clone()
    }

    fn table_lock(&self) -> &TableLock {
        &self.lock
    }

    fn read(&self, projection: Option<&[usize]>) -> Result<SendableBlockStream> {
        let merged = self
            .shared
            .with_variants(|variants| self.aggregator.merge_variants(variants))?;

        let mut batches = Vec::with_capacity(merged.len());
        for batch in merged {
            let mut current = batch;
            if let Some(stage) = &self.query.before_order_by {
                current = stage.transform(&current)?;
            }
            if let Some(stage) = &self.query.final_projection {
                current = stage.transform(&current)?;
            }
            if let Some(indices) = projection {
                current = current.project(indices)?;
            }
            batches.push(current);
        }

        Ok(Box::new(BlocksStream::one_frame(batches)))
    }

    fn write(&self) -> Result<BoxedSink> {
        Ok(Box::new(self.make_sink()))
    }

    fn truncate(&self) -> Result<()> {
        self.shared.clear();
        // Keep the canonical empty aggregate readable after truncation.
        self.seed_empty_aggregate()
    }

    fn rename_in_memory(&self, new_id: StorageId) -> Result<()> {
        *self.id.write() = new_id;
        Ok(())
    }

    fn on_drop(&self) -> Result<()> {
        self.shared.clear();
        Ok(())
    }
}

/// Sink feeding the shared aggregator.
///
/// Each sink owns its key/aggregate scratch vectors; the shared arena is
/// the only state writers contend on.
struct AggregatingSink {
    source_schema: SchemaRef,
    before_aggregation: Option<Arc<dyn BlockTransform>>,
    aggregator: Arc<Aggregator>,
    shared: Arc<SharedAggregatedData>,
    key_columns: Vec<ArrayRef>,
    aggregate_columns: Vec<ArrayRef>,
}

impl Sink for AggregatingSink {
    fn write_prefix(&mut self) -> Result<()> {
        Ok(())
    }

    fn write(&mut self, block: &Block) -> Result<()> {
        if !same_shape(&block.schema(), &self.source_schema) {
            return Err(CinderError::schema(format!(
                "Block shape {:?} does not match the pre-aggregation shape {:?}",
                block.schema().fields(),
                self.source_schema.fields()
            )));
        }

        let batch = match &self.before_aggregation {
            Some(stage) => stage.transform(&block.batch)?,
            None => block.batch.clone(),
        };

        let aggregator = &self.aggregator;
        let key_columns = &mut self.key_columns;
        let aggregate_columns = &mut self.aggregate_columns;
        self.shared.with_variants(|variants: &mut AggregatedVariants| {
            aggregator.execute_on_block(&batch, variants, key_columns, aggregate_columns)
        })
    }

    fn write_suffix(&mut self) -> Result<()> {
        Ok(())
    }
}
