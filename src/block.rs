//! Frame-marked columnar blocks and block sources.
//!
//! A *block* is one Arrow `RecordBatch` together with two frame markers.
//! A *frame* is a delimited group of blocks sharing one sample shape; it is
//! the unit at which a sink sees a prefix/suffix boundary and at which the
//! shape may change between groups.

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;

use crate::error::Result;

/// One columnar batch within a frame.
#[derive(Debug, Clone)]
pub struct Block {
    /// The columnar payload.
    pub batch: RecordBatch,
    /// This block opens a new frame.
    pub is_start_frame: bool,
    /// This block closes the current frame.
    pub is_end_frame: bool,
}

impl Block {
    /// Create a block with explicit frame markers.
    pub fn new(batch: RecordBatch, is_start_frame: bool, is_end_frame: bool) -> Self {
        Self {
            batch,
            is_start_frame,
            is_end_frame,
        }
    }

    /// Create a single-block frame (both markers set).
    pub fn single_frame(batch: RecordBatch) -> Self {
        Self::new(batch, true, true)
    }

    /// Create a block with no frame markers.
    pub fn plain(batch: RecordBatch) -> Self {
        Self::new(batch, false, false)
    }

    /// The sample shape of this block.
    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    /// Number of rows in the block.
    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    /// Replace the payload, keeping the frame markers.
    pub fn with_batch(&self, batch: RecordBatch) -> Self {
        Self::new(batch, self.is_start_frame, self.is_end_frame)
    }
}

/// Profiling metadata a source may expose after its last block.
#[derive(Debug, Clone, Default)]
pub struct ProfileInfo {
    /// Row count before a LIMIT was applied, if one was.
    pub rows_before_limit: Option<u64>,
    /// Totals row computed alongside the stream.
    pub totals: Option<RecordBatch>,
    /// Per-column extremes computed alongside the stream.
    pub extremes: Option<RecordBatch>,
}

/// A pull-based source of blocks.
///
/// Blocks arrive in order; `read` returns `None` once the source is
/// exhausted. Profiling info, when present, becomes meaningful only after
/// the last block has been read.
pub trait BlockStream: Send {
    /// Read the next block, or `None` at end of stream.
    fn read(&mut self) -> Result<Option<Block>>;

    /// Profiling metadata, if this source tracks any.
    fn profile_info(&self) -> Option<&ProfileInfo> {
        None
    }
}

/// Boxed block stream, the common currency of read paths.
pub type SendableBlockStream = Box<dyn BlockStream>;

/// A stream over a fixed set of batches forming one frame.
///
/// The first block carries the start marker and the last the end marker;
/// an empty batch list yields an empty stream (the copier synthesizes the
/// empty frame in that case).
#[derive(Debug)]
pub struct BlocksStream {
    blocks: std::vec::IntoIter<Block>,
    profile: Option<ProfileInfo>,
}

impl BlocksStream {
    /// Build a one-frame stream from batches.
    pub fn one_frame(batches: Vec<RecordBatch>) -> Self {
        let last = batches.len().saturating_sub(1);
        let blocks: Vec<Block> = batches
            .into_iter()
            .enumerate()
            .map(|(i, batch)| Block::new(batch, i == 0, i == last))
            .collect();
        Self {
            blocks: blocks.into_iter(),
            profile: None,
        }
    }

    /// Build a stream from pre-marked blocks.
    pub fn from_blocks(blocks: Vec<Block>) -> Self {
        Self {
            blocks: blocks.into_iter(),
            profile: None,
        }
    }

    /// Attach profiling metadata to be exposed after the last block.
    pub fn with_profile(mut self, profile: ProfileInfo) -> Self {
        self.profile = Some(profile);
        self
    }
}

impl BlockStream for BlocksStream {
    fn read(&mut self) -> Result<Option<Block>> {
        Ok(self.blocks.next())
    }

    fn profile_info(&self) -> Option<&ProfileInfo> {
        self.profile.as_ref()
    }
}

/// A stream producing exactly one single-block frame.
#[derive(Debug)]
pub struct OneBlockStream {
    block: Option<Block>,
}

impl OneBlockStream {
    pub fn new(batch: RecordBatch) -> Self {
        Self {
            block: Some(Block::single_frame(batch)),
        }
    }
}

impl BlockStream for OneBlockStream {
    fn read(&mut self) -> Result<Option<Block>> {
        Ok(self.block.take())
    }
}

/// Check that two shapes are identical by name and type, position by
/// position.
pub fn same_shape(left: &SchemaRef, right: &SchemaRef) -> bool {
    left.fields().len() == right.fields().len()
        && left
            .fields()
            .iter()
            .zip(right.fields().iter())
            .all(|(a, b)| a.name() == b.name() && a.data_type() == b.data_type())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    fn make_batch(values: Vec<i64>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))]).unwrap()
    }

    #[test]
    fn test_single_frame_markers() {
        let block = Block::single_frame(make_batch(vec![1]));
        assert!(block.is_start_frame);
        assert!(block.is_end_frame);
        assert_eq!(block.num_rows(), 1);
    }

    #[test]
    fn test_one_frame_stream_markers() {
        let mut stream =
            BlocksStream::one_frame(vec![make_batch(vec![1, 2]), make_batch(vec![3])]);

        let first = stream.read().unwrap().unwrap();
        assert!(first.is_start_frame);
        assert!(!first.is_end_frame);

        let second = stream.read().unwrap().unwrap();
        assert!(!second.is_start_frame);
        assert!(second.is_end_frame);

        assert!(stream.read().unwrap().is_none());
    }

    #[test]
    fn test_one_frame_single_batch() {
        let mut stream = BlocksStream::one_frame(vec![make_batch(vec![1])]);
        let block = stream.read().unwrap().unwrap();
        assert!(block.is_start_frame && block.is_end_frame);
    }

    #[test]
    fn test_same_shape() {
        let a = make_batch(vec![1]).schema();
        let b = make_batch(vec![2]).schema();
        assert!(same_shape(&a, &b));

        let other = Arc::new(Schema::new(vec![Field::new("w", DataType::Int64, false)]));
        assert!(!same_shape(&a, &other));
    }
}
