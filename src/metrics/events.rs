//! Internal events for metrics emission.
//!
//! Each struct is something measurable that happened during a cycle.

use metrics::{counter, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Blobs that survived the staleness filter in one listing.
pub struct BlobsListed {
    pub count: u64,
}

impl InternalEvent for BlobsListed {
    fn emit(self) {
        trace!(count = self.count, "Blobs listed");
        counter!("blobtail_blobs_listed_total").increment(self.count);
    }
}

/// Listing pages requested from the store.
pub struct ListPageFetched;

impl InternalEvent for ListPageFetched {
    fn emit(self) {
        counter!("blobtail_list_pages_total").increment(1);
    }
}

/// Bytes fetched from blobs.
pub struct BytesFetched {
    pub bytes: u64,
}

impl InternalEvent for BytesFetched {
    fn emit(self) {
        trace!(bytes = self.bytes, "Bytes fetched");
        counter!("blobtail_bytes_fetched_total").increment(self.bytes);
    }
}

/// Events handed to the sink.
pub struct EventsEmitted {
    pub count: u64,
}

impl InternalEvent for EventsEmitted {
    fn emit(self) {
        trace!(count = self.count, "Events emitted");
        counter!("blobtail_events_emitted_total").increment(self.count);
    }
}

/// Blobs skipped because their entity tag matched the checkpoint.
pub struct BlobSkipped;

impl InternalEvent for BlobSkipped {
    fn emit(self) {
        counter!("blobtail_blobs_skipped_total").increment(1);
    }
}

/// Checkpoint records persisted.
pub struct CheckpointWritten;

impl InternalEvent for CheckpointWritten {
    fn emit(self) {
        counter!("blobtail_checkpoints_written_total").increment(1);
    }
}

/// Outcome of a lease acquisition attempt.
#[derive(Debug, Clone, Copy)]
pub enum LockOutcome {
    Acquired,
    Contended,
}

impl LockOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            LockOutcome::Acquired => "acquired",
            LockOutcome::Contended => "contended",
        }
    }
}

/// Event emitted for each lease attempt.
pub struct LockAttempted {
    pub outcome: LockOutcome,
}

impl InternalEvent for LockAttempted {
    fn emit(self) {
        trace!(outcome = self.outcome.as_str(), "Lock attempted");
        counter!("blobtail_lock_attempts_total", "outcome" => self.outcome.as_str()).increment(1);
    }
}

/// How a cycle ended.
#[derive(Debug, Clone, Copy)]
pub enum CycleStatus {
    Completed,
    Aborted,
    Shutdown,
}

impl CycleStatus {
    fn as_str(&self) -> &'static str {
        match self {
            CycleStatus::Completed => "completed",
            CycleStatus::Aborted => "aborted",
            CycleStatus::Shutdown => "shutdown",
        }
    }
}

/// Event emitted at the end of every cycle.
pub struct CycleFinished {
    pub status: CycleStatus,
    pub duration: Duration,
}

impl InternalEvent for CycleFinished {
    fn emit(self) {
        trace!(
            status = self.status.as_str(),
            duration_ms = self.duration.as_millis(),
            "Cycle finished"
        );
        counter!("blobtail_cycles_total", "status" => self.status.as_str()).increment(1);
        histogram!("blobtail_cycle_duration_seconds").record(self.duration.as_secs_f64());
    }
}
