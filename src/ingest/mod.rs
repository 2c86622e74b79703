//! The ingestion engine.
//!
//! - `listing`: paginated, staleness-filtered container enumeration
//! - `resume`: what to read for a blob given its checkpoint
//! - `locker`: single-claim lease locking when no checkpoint table is used
//! - `cycle`: one poll of list, fetch, decode, emit and checkpoint

pub mod cycle;
pub mod listing;
pub mod locker;
pub mod resume;

pub use cycle::{CycleStats, IngestionCycle, Tracking};
pub use listing::{Listing, ObjectLister};
pub use locker::{LOCK_SUFFIX, LeaseLocker};
pub use resume::ReadPlan;

use std::future::Future;
use tokio_util::sync::CancellationToken;

use crate::error::{IngestError, ShutdownRequestedSnafu};

/// Race `fut` against shutdown. Cancellation wins ties.
pub(crate) async fn until_cancelled<F: Future>(
    shutdown: &CancellationToken,
    fut: F,
) -> Result<F::Output, IngestError> {
    tokio::select! {
        biased;

        _ = shutdown.cancelled() => ShutdownRequestedSnafu.fail(),
        output = fut => Ok(output),
    }
}
