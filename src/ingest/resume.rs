//! Deciding what to read for a blob that has (or lacks) a checkpoint.

use crate::checkpoint::CheckpointRecord;
use crate::config::StartPosition;
use crate::storage::ObjectDescriptor;

/// Work to do for one blob in checkpoint mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPlan {
    /// Entity tag matches the checkpoint. Nothing to fetch or persist.
    Skip,
    /// Fetch `[start, end)`, emit it, then checkpoint at `end`.
    Read { start: u64, end: u64 },
    /// No new bytes, but the checkpoint must record `offset` under the
    /// current entity tag.
    Advance { offset: u64 },
}

/// Plan the read for `blob` given its stored checkpoint, if any.
///
/// A stored offset beyond the current length means the blob was replaced
/// by a shorter one, so it is read again from the start.
pub fn plan(
    checkpoint: Option<&CheckpointRecord>,
    blob: &ObjectDescriptor,
    start_position: StartPosition,
) -> ReadPlan {
    let end = blob.content_length;
    let start = match checkpoint {
        Some(record) if record.entity_tag.as_deref() == Some(blob.entity_tag.as_str()) => {
            return ReadPlan::Skip;
        }
        Some(record) if record.byte_offset > end => 0,
        Some(record) => record.byte_offset,
        None => match start_position {
            StartPosition::Beginning => 0,
            StartPosition::End => end,
        },
    };

    if start == end {
        ReadPlan::Advance { offset: end }
    } else {
        ReadPlan::Read { start, end }
    }
}
