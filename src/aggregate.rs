//! Aggregation machinery shared by the aggregating in-memory table.
//!
//! The state lives in one arena ([`AggregatedVariants`]) created when the
//! owning table is constructed and kept until the table is dropped or
//! truncated. Writers feed blocks through [`Aggregator::execute_on_block`]
//! with their own scratch vectors; readers merge the arena into finalized
//! batches without disturbing it.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Float64Array, Int64Array};
use arrow::compute;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use parking_lot::Mutex;

use crate::error::{CinderError, Result};

/// Supported aggregate functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

impl AggregateFunction {
    /// Arrow type of the finalized value.
    pub fn output_type(&self) -> DataType {
        match self {
            AggregateFunction::Count => DataType::Int64,
            _ => DataType::Float64,
        }
    }
}

/// An aggregate column as written in the defining query.
#[derive(Debug, Clone)]
pub struct AggregateDescriptor {
    /// The aggregate function
    pub function: AggregateFunction,
    /// Argument column name; `None` means count-rows
    pub argument: Option<String>,
    /// Name of the output column
    pub output_name: String,
}

impl AggregateDescriptor {
    pub fn new(
        function: AggregateFunction,
        argument: Option<&str>,
        output_name: impl Into<String>,
    ) -> Self {
        Self {
            function,
            argument: argument.map(str::to_string),
            output_name: output_name.into(),
        }
    }
}

/// An aggregate bound to a column position in the aggregation header.
#[derive(Debug, Clone)]
struct BoundAggregate {
    function: AggregateFunction,
    argument: Option<usize>,
    output_name: String,
}

/// Parameters fixing the shape fed to the aggregator and the grouping.
#[derive(Debug)]
pub struct AggregatorParams {
    /// Shape of blocks entering the aggregator
    header: SchemaRef,
    /// Positions of the grouping-key columns in the header
    key_positions: Vec<usize>,
    aggregates: Vec<BoundAggregate>,
    /// keys followed by finalized aggregates
    output_schema: SchemaRef,
}

impl AggregatorParams {
    /// Bind key names and aggregate arguments against `header`.
    pub fn new(
        header: SchemaRef,
        group_by: &[String],
        aggregates: &[AggregateDescriptor],
    ) -> Result<Self> {
        let mut key_positions = Vec::with_capacity(group_by.len());
        for key in group_by {
            let idx = header.index_of(key).map_err(|_| {
                CinderError::schema(format!("Grouping key '{}' not found in input shape", key))
            })?;
            key_positions.push(idx);
        }

        let mut bound = Vec::with_capacity(aggregates.len());
        for descriptor in aggregates {
            let argument = match &descriptor.argument {
                Some(name) => Some(header.index_of(name).map_err(|_| {
                    CinderError::schema(format!(
                        "Aggregate argument '{}' not found in input shape",
                        name
                    ))
                })?),
                None => None,
            };
            bound.push(BoundAggregate {
                function: descriptor.function,
                argument,
                output_name: descriptor.output_name.clone(),
            });
        }

        let mut fields: Vec<Field> = key_positions
            .iter()
            .map(|&i| header.field(i).clone())
            .collect();
        for aggregate in &bound {
            fields.push(Field::new(
                &aggregate.output_name,
                aggregate.function.output_type(),
                true,
            ));
        }
        let output_schema = Arc::new(Schema::new(fields));

        Ok(Self {
            header,
            key_positions,
            aggregates: bound,
            output_schema,
        })
    }

    /// Shape of blocks the aggregator consumes.
    pub fn header(&self) -> &SchemaRef {
        &self.header
    }

    /// Number of grouping keys.
    pub fn keys_size(&self) -> usize {
        self.key_positions.len()
    }

    /// Number of aggregate columns.
    pub fn aggregates_size(&self) -> usize {
        self.aggregates.len()
    }

    /// Shape of the finalized output.
    pub fn output_schema(&self) -> &SchemaRef {
        &self.output_schema
    }
}

/// Running state of one aggregate within one group.
trait Accumulator: Send + Sync {
    /// Fold a column of values into the state.
    fn update(&mut self, values: &ArrayRef) -> Result<()>;

    /// Produce the finalized one-row result.
    fn finalize(&self) -> Result<ArrayRef>;
}

struct CountAccumulator {
    count: i64,
}

impl Accumulator for CountAccumulator {
    fn update(&mut self, values: &ArrayRef) -> Result<()> {
        self.count += (values.len() - values.null_count()) as i64;
        Ok(())
    }

    fn finalize(&self) -> Result<ArrayRef> {
        Ok(Arc::new(Int64Array::from(vec![self.count])))
    }

}

struct SumAccumulator {
    sum: Option<f64>,
}

impl Accumulator for SumAccumulator {
    fn update(&mut self, values: &ArrayRef) -> Result<()> {
        if let Some(s) = numeric_sum(values)? {
            self.sum = Some(self.sum.unwrap_or(0.0) + s);
        }
        Ok(())
    }

    fn finalize(&self) -> Result<ArrayRef> {
        Ok(Arc::new(Float64Array::from(vec![self.sum])))
    }

}

struct AvgAccumulator {
    sum: f64,
    count: u64,
}

impl Accumulator for AvgAccumulator {
    fn update(&mut self, values: &ArrayRef) -> Result<()> {
        if let Some(s) = numeric_sum(values)? {
            self.sum += s;
        }
        self.count += (values.len() - values.null_count()) as u64;
        Ok(())
    }

    fn finalize(&self) -> Result<ArrayRef> {
        let avg = if self.count > 0 {
            Some(self.sum / self.count as f64)
        } else {
            None
        };
        Ok(Arc::new(Float64Array::from(vec![avg])))
    }

}

struct MinAccumulator {
    min: Option<f64>,
}

impl Accumulator for MinAccumulator {
    fn update(&mut self, values: &ArrayRef) -> Result<()> {
        if let Some(m) = numeric_min(values)? {
            self.min = Some(self.min.map(|current| current.min(m)).unwrap_or(m));
        }
        Ok(())
    }

    fn finalize(&self) -> Result<ArrayRef> {
        Ok(Arc::new(Float64Array::from(vec![self.min])))
    }

}

struct MaxAccumulator {
    max: Option<f64>,
}

impl Accumulator for MaxAccumulator {
    fn update(&mut self, values: &ArrayRef) -> Result<()> {
        if let Some(m) = numeric_max(values)? {
            self.max = Some(self.max.map(|current| current.max(m)).unwrap_or(m));
        }
        Ok(())
    }

    fn finalize(&self) -> Result<ArrayRef> {
        Ok(Arc::new(Float64Array::from(vec![self.max])))
    }

}

fn numeric_sum(values: &ArrayRef) -> Result<Option<f64>> {
    match values.data_type() {
        DataType::Int64 => {
            let array = downcast::<Int64Array>(values)?;
            Ok(compute::sum(array).map(|v| v as f64))
        }
        DataType::Float64 => {
            let array = downcast::<Float64Array>(values)?;
            Ok(compute::sum(array))
        }
        other => Err(CinderError::type_error(format!(
            "Aggregation over type {:?} is not supported",
            other
        ))),
    }
}

fn numeric_min(values: &ArrayRef) -> Result<Option<f64>> {
    match values.data_type() {
        DataType::Int64 => {
            let array = downcast::<Int64Array>(values)?;
            Ok(compute::min(array).map(|v| v as f64))
        }
        DataType::Float64 => {
            let array = downcast::<Float64Array>(values)?;
            Ok(compute::min(array))
        }
        other => Err(CinderError::type_error(format!(
            "Aggregation over type {:?} is not supported",
            other
        ))),
    }
}

fn numeric_max(values: &ArrayRef) -> Result<Option<f64>> {
    match values.data_type() {
        DataType::Int64 => {
            let array = downcast::<Int64Array>(values)?;
            Ok(compute::max(array).map(|v| v as f64))
        }
        DataType::Float64 => {
            let array = downcast::<Float64Array>(values)?;
            Ok(compute::max(array))
        }
        other => Err(CinderError::type_error(format!(
            "Aggregation over type {:?} is not supported",
            other
        ))),
    }
}

fn downcast<'a, T: 'static>(array: &'a ArrayRef) -> Result<&'a T> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| CinderError::internal("Unexpected array type in aggregation"))
}

fn create_accumulator(function: AggregateFunction) -> Box<dyn Accumulator> {
    match function {
        AggregateFunction::Count => Box::new(CountAccumulator { count: 0 }),
        AggregateFunction::Sum => Box::new(SumAccumulator { sum: None }),
        AggregateFunction::Avg => Box::new(AvgAccumulator { sum: 0.0, count: 0 }),
        AggregateFunction::Min => Box::new(MinAccumulator { min: None }),
        AggregateFunction::Max => Box::new(MaxAccumulator { max: None }),
    }
}

/// One group: its key values (one-row slices) and per-aggregate state.
struct GroupEntry {
    keys: Vec<ArrayRef>,
    accumulators: Vec<Box<dyn Accumulator>>,
}

impl GroupEntry {
    fn matches(&self, key_columns: &[ArrayRef], row: usize) -> bool {
        self.keys
            .iter()
            .zip(key_columns.iter())
            .all(|(stored, column)| stored.to_data() == column.slice(row, 1).to_data())
    }
}

/// The aggregation arena: hash buckets of groups with exact-key chaining.
#[derive(Default)]
pub struct AggregatedVariants {
    buckets: HashMap<u64, Vec<GroupEntry>>,
}

impl AggregatedVariants {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of groups accumulated so far.
    pub fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    fn clear(&mut self) {
        self.buckets.clear();
    }
}

impl std::fmt::Debug for AggregatedVariants {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregatedVariants")
            .field("groups", &self.len())
            .finish()
    }
}

/// The single shared aggregation slot owned by an aggregating table.
#[derive(Debug)]
pub struct SharedAggregatedData {
    variants: Mutex<AggregatedVariants>,
}

impl SharedAggregatedData {
    pub fn new() -> Self {
        Self {
            variants: Mutex::new(AggregatedVariants::new()),
        }
    }

    /// Access the arena under its lock.
    pub fn with_variants<R>(&self, f: impl FnOnce(&mut AggregatedVariants) -> R) -> R {
        f(&mut self.variants.lock())
    }

    /// Drop all accumulated state.
    pub fn clear(&self) {
        self.variants.lock().clear();
    }
}

impl Default for SharedAggregatedData {
    fn default() -> Self {
        Self::new()
    }
}

/// Stateless executor over [`AggregatorParams`].
#[derive(Debug)]
pub struct Aggregator {
    params: Arc<AggregatorParams>,
}

impl Aggregator {
    pub fn new(params: Arc<AggregatorParams>) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &AggregatorParams {
        &self.params
    }

    /// Fold one block into `variants`.
    ///
    /// `key_columns` and `aggregate_columns` are caller-owned scratch,
    /// refilled on every call so parallel writers never alias each other.
    pub fn execute_on_block(
        &self,
        batch: &RecordBatch,
        variants: &mut AggregatedVariants,
        key_columns: &mut Vec<ArrayRef>,
        aggregate_columns: &mut Vec<ArrayRef>,
    ) -> Result<()> {
        key_columns.clear();
        for &position in &self.params.key_positions {
            key_columns.push(batch.column(position).clone());
        }

        aggregate_columns.clear();
        for aggregate in &self.params.aggregates {
            match aggregate.argument {
                Some(position) => aggregate_columns.push(batch.column(position).clone()),
                // count-rows: a surrogate column of ones
                None => aggregate_columns.push(Arc::new(Int64Array::from(vec![
                    1i64;
                    batch.num_rows()
                ])) as ArrayRef),
            }
        }

        if self.params.key_positions.is_empty() {
            let bucket = variants.buckets.entry(0).or_default();
            if bucket.is_empty() {
                bucket.push(GroupEntry {
                    keys: Vec::new(),
                    accumulators: self
                        .params
                        .aggregates
                        .iter()
                        .map(|a| create_accumulator(a.function))
                        .collect(),
                });
            }
            if batch.num_rows() > 0 {
                let entry = &mut bucket[0];
                for (accumulator, column) in
                    entry.accumulators.iter_mut().zip(aggregate_columns.iter())
                {
                    accumulator.update(column)?;
                }
            }
            return Ok(());
        }

        for row in 0..batch.num_rows() {
            let hash = hash_row(key_columns, row)?;
            let bucket = variants.buckets.entry(hash).or_default();

            let index = match bucket.iter().position(|e| e.matches(key_columns, row)) {
                Some(index) => index,
                None => {
                    bucket.push(GroupEntry {
                        keys: key_columns.iter().map(|c| c.slice(row, 1)).collect(),
                        accumulators: self
                            .params
                            .aggregates
                            .iter()
                            .map(|a| create_accumulator(a.function))
                            .collect(),
                    });
                    bucket.len() - 1
                }
            };

            let entry = &mut bucket[index];
            for (accumulator, column) in entry.accumulators.iter_mut().zip(aggregate_columns.iter())
            {
                accumulator.update(&column.slice(row, 1))?;
            }
        }

        Ok(())
    }

    /// Merge the arena into finalized batches without consuming it.
    ///
    /// Concurrent writes during the merge are not observed by this read:
    /// the caller holds the arena lock for the duration.
    pub fn merge_variants(&self, variants: &AggregatedVariants) -> Result<Vec<RecordBatch>> {
        if variants.is_empty() {
            return Ok(Vec::new());
        }

        let num_keys = self.params.keys_size();
        let num_aggregates = self.params.aggregates_size();

        let mut key_column_parts: Vec<Vec<ArrayRef>> = vec![Vec::new(); num_keys];
        let mut aggregate_column_parts: Vec<Vec<ArrayRef>> = vec![Vec::new(); num_aggregates];

        for bucket in variants.buckets.values() {
            for entry in bucket {
                for (i, key) in entry.keys.iter().enumerate() {
                    key_column_parts[i].push(key.clone());
                }
                for (i, accumulator) in entry.accumulators.iter().enumerate() {
                    aggregate_column_parts[i].push(accumulator.finalize()?);
                }
            }
        }

        let mut columns: Vec<ArrayRef> = Vec::with_capacity(num_keys + num_aggregates);
        for parts in key_column_parts.into_iter().chain(aggregate_column_parts) {
            let refs: Vec<&dyn Array> = parts.iter().map(|a| a.as_ref()).collect();
            columns.push(compute::concat(&refs)?);
        }

        Ok(vec![RecordBatch::try_new(
            self.params.output_schema.clone(),
            columns,
        )?])
    }
}

/// Hash the grouping-key projection of one row.
fn hash_row(key_columns: &[ArrayRef], row: usize) -> Result<u64> {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();

    for column in key_columns {
        if column.is_null(row) {
            0u8.hash(&mut hasher);
            continue;
        }
        match column.data_type() {
            DataType::Int64 => {
                downcast::<Int64Array>(column)?.value(row).hash(&mut hasher);
            }
            DataType::Float64 => {
                downcast::<Float64Array>(column)?
                    .value(row)
                    .to_bits()
                    .hash(&mut hasher);
            }
            DataType::Utf8 => {
                downcast::<arrow::array::StringArray>(column)?
                    .value(row)
                    .hash(&mut hasher);
            }
            DataType::Boolean => {
                downcast::<arrow::array::BooleanArray>(column)?
                    .value(row)
                    .hash(&mut hasher);
            }
            other => {
                return Err(CinderError::not_implemented(format!(
                    "Grouping by type {:?}",
                    other
                )));
            }
        }
    }

    Ok(hasher.finish())
}
