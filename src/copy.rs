//! Block pipe copier: transfers an ordered sequence of frames from a block
//! source to a sink, preserving frame boundaries and honoring an external
//! cancellation flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::block::BlockStream;
use crate::error::Result;
use crate::sink::Sink;

/// A cancellation token that can be shared across threads.
///
/// The copier checks the flag with sequential consistency before
/// processing each block and before forwarding stream metadata.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

fn is_cancelled(token: Option<&CancellationToken>) -> bool {
    token.map_or(false, CancellationToken::is_cancelled)
}

/// Copy all blocks from `from` to `to`, preserving frame structure.
///
/// On the first block, and on any start-frame block while no frame is
/// open, the sink receives the sample shape and a prefix; every end-frame
/// block is followed by a suffix. An empty input still produces one
/// well-formed empty frame. Cancellation is final: once observed, the
/// copier returns without emitting a suffix.
pub fn copy_blocks(
    from: &mut dyn BlockStream,
    to: &mut dyn Sink,
    cancel: Option<&CancellationToken>,
) -> Result<()> {
    let mut open_frame = false;
    let mut no_data = true;

    while let Some(block) = from.read()? {
        no_data = false;

        if is_cancelled(cancel) {
            break;
        }

        if !open_frame || block.is_start_frame {
            to.set_sample_block(&block.batch)?;
            to.write_prefix()?;
            open_frame = true;
        }

        to.write(&block)?;

        if block.is_end_frame {
            to.write_suffix()?;
            open_frame = false;
        }
    }

    if no_data {
        to.write_prefix()?;
        open_frame = true;
    }

    if is_cancelled(cancel) {
        return Ok(());
    }

    if let Some(profile) = from.profile_info() {
        if let Some(rows) = profile.rows_before_limit {
            to.set_rows_before_limit(rows)?;
        }
        if let Some(totals) = &profile.totals {
            to.set_totals(totals)?;
        }
        if let Some(extremes) = &profile.extremes {
            to.set_extremes(extremes)?;
        }
    }

    if is_cancelled(cancel) {
        return Ok(());
    }

    if open_frame {
        to.write_suffix()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Block, BlocksStream, ProfileInfo};
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use std::sync::Arc;

    fn make_batch(values: Vec<i64>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))]).unwrap()
    }

    /// Records every sink call in order for assertions.
    #[derive(Debug, Default)]
    struct RecordingSink {
        events: Vec<String>,
    }

    impl Sink for RecordingSink {
        fn set_sample_block(&mut self, _batch: &RecordBatch) -> Result<()> {
            self.events.push("sample".into());
            Ok(())
        }

        fn write_prefix(&mut self) -> Result<()> {
            self.events.push("prefix".into());
            Ok(())
        }

        fn write(&mut self, block: &Block) -> Result<()> {
            self.events.push(format!("write:{}", block.num_rows()));
            Ok(())
        }

        fn write_suffix(&mut self) -> Result<()> {
            self.events.push("suffix".into());
            Ok(())
        }

        fn set_rows_before_limit(&mut self, rows: u64) -> Result<()> {
            self.events.push(format!("rows_before_limit:{}", rows));
            Ok(())
        }
    }

    #[test]
    fn test_two_block_single_frame() {
        let blocks = vec![
            Block::new(make_batch(vec![1, 2]), true, false),
            Block::new(make_batch(vec![3, 4, 5]), false, true),
        ];
        let mut src = BlocksStream::from_blocks(blocks);
        let mut dst = RecordingSink::default();

        copy_blocks(&mut src, &mut dst, None).unwrap();

        assert_eq!(
            dst.events,
            vec!["sample", "prefix", "write:2", "write:3", "suffix"]
        );
    }

    #[test]
    fn test_two_disjoint_frames() {
        let blocks = vec![
            Block::single_frame(make_batch(vec![1])),
            Block::single_frame(make_batch(vec![2])),
        ];
        let mut src = BlocksStream::from_blocks(blocks);
        let mut dst = RecordingSink::default();

        copy_blocks(&mut src, &mut dst, None).unwrap();

        assert_eq!(
            dst.events,
            vec![
                "sample", "prefix", "write:1", "suffix", "sample", "prefix", "write:1", "suffix"
            ]
        );
    }

    #[test]
    fn test_empty_input_emits_empty_frame() {
        let mut src = BlocksStream::from_blocks(vec![]);
        let mut dst = RecordingSink::default();

        copy_blocks(&mut src, &mut dst, None).unwrap();

        assert_eq!(dst.events, vec!["prefix", "suffix"]);
    }

    #[test]
    fn test_cancelled_before_first_block() {
        let blocks = vec![Block::single_frame(make_batch(vec![1]))];
        let mut src = BlocksStream::from_blocks(blocks);
        let mut dst = RecordingSink::default();

        let token = CancellationToken::new();
        token.cancel();

        copy_blocks(&mut src, &mut dst, Some(&token)).unwrap();

        // The block was read but never written, and no suffix is emitted.
        assert!(dst.events.is_empty());
    }

    #[test]
    fn test_noop_cancel_equals_no_flag() {
        let make_src = || {
            BlocksStream::from_blocks(vec![
                Block::new(make_batch(vec![1]), true, false),
                Block::new(make_batch(vec![2]), false, true),
            ])
        };

        let mut plain = RecordingSink::default();
        copy_blocks(&mut make_src(), &mut plain, None).unwrap();

        let token = CancellationToken::new();
        let mut flagged = RecordingSink::default();
        copy_blocks(&mut make_src(), &mut flagged, Some(&token)).unwrap();

        assert_eq!(plain.events, flagged.events);
    }

    #[test]
    fn test_profile_info_forwarded() {
        let profile = ProfileInfo {
            rows_before_limit: Some(42),
            totals: None,
            extremes: None,
        };
        let mut src =
            BlocksStream::one_frame(vec![make_batch(vec![1])]).with_profile(profile);
        let mut dst = RecordingSink::default();

        copy_blocks(&mut src, &mut dst, None).unwrap();

        assert_eq!(
            dst.events,
            vec!["sample", "prefix", "write:1", "suffix", "rows_before_limit:42"]
        );
    }

    #[test]
    fn test_frame_left_open_gets_suffix_at_end() {
        // A trailing block without an end marker still closes its frame.
        let blocks = vec![Block::new(make_batch(vec![1]), true, false)];
        let mut src = BlocksStream::from_blocks(blocks);
        let mut dst = RecordingSink::default();

        copy_blocks(&mut src, &mut dst, None).unwrap();

        assert_eq!(dst.events, vec!["sample", "prefix", "write:1", "suffix"]);
    }
}
