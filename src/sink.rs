//! The sink abstraction: an object absorbing a stream of blocks with
//! prefix/suffix frame boundaries.
//!
//! A conformant sink accepts exactly one prefix/suffix pair per frame and
//! at least one sample-shape call before the first write of a frame. The
//! metadata setters are optional and default to no-ops.

use arrow::record_batch::RecordBatch;

use crate::block::Block;
use crate::error::Result;

/// Absorbs an ordered stream of frame-delimited blocks.
pub trait Sink: Send {
    /// Announce the sample shape of the upcoming frame.
    fn set_sample_block(&mut self, _batch: &RecordBatch) -> Result<()> {
        Ok(())
    }

    /// Open a frame.
    fn write_prefix(&mut self) -> Result<()>;

    /// Write one block of the current frame.
    fn write(&mut self, block: &Block) -> Result<()>;

    /// Close the current frame.
    fn write_suffix(&mut self) -> Result<()>;

    /// Flush buffered state downstream.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Forward a totals row.
    fn set_totals(&mut self, _totals: &RecordBatch) -> Result<()> {
        Ok(())
    }

    /// Forward per-column extremes.
    fn set_extremes(&mut self, _extremes: &RecordBatch) -> Result<()> {
        Ok(())
    }

    /// Forward the pre-limit row count.
    fn set_rows_before_limit(&mut self, _rows: u64) -> Result<()> {
        Ok(())
    }
}

/// Boxed sink, the common currency of write paths.
pub type BoxedSink = Box<dyn Sink>;
