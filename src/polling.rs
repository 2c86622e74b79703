//! Fixed-interval polling loop.

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Result of a single polling iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationResult {
    /// Work was done.
    ProcessedItems,
    /// Nothing new to process.
    NoItems,
    /// Shutdown was requested mid-iteration.
    Shutdown,
}

/// Something that can be driven by [`PollScheduler`].
#[async_trait]
pub trait PollingProcessor: Send {
    async fn poll(&mut self, shutdown: &CancellationToken) -> IterationResult;
}

/// Repeats a processor at a fixed interval until shutdown.
#[derive(Debug, Clone, Copy)]
pub struct PollScheduler {
    interval: Duration,
}

impl PollScheduler {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// The stop condition is checked before every iteration. A slow
    /// iteration delays the next one; the wait only starts once it is done.
    pub async fn run<P: PollingProcessor>(&self, processor: &mut P, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                info!("Shutdown requested, not starting another poll");
                break;
            }

            match processor.poll(&shutdown).await {
                IterationResult::Shutdown => {
                    info!("Shutdown requested during poll");
                    break;
                }
                IterationResult::NoItems => {
                    info!(
                        "No new items, waiting {}s before next poll",
                        self.interval.as_secs()
                    );
                }
                IterationResult::ProcessedItems => {
                    info!(
                        "Iteration complete, waiting {}s before next poll",
                        self.interval.as_secs()
                    );
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested during poll wait");
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct Scripted {
        results: VecDeque<IterationResult>,
        polls: usize,
        cancel_after: Option<(usize, CancellationToken)>,
    }

    impl Scripted {
        fn new(results: impl IntoIterator<Item = IterationResult>) -> Self {
            Self {
                results: results.into_iter().collect(),
                polls: 0,
                cancel_after: None,
            }
        }
    }

    #[async_trait]
    impl PollingProcessor for Scripted {
        async fn poll(&mut self, _shutdown: &CancellationToken) -> IterationResult {
            self.polls += 1;
            if let Some((after, token)) = &self.cancel_after
                && self.polls >= *after
            {
                token.cancel();
            }
            self.results
                .pop_front()
                .unwrap_or(IterationResult::NoItems)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_processor_reports_shutdown() {
        let mut processor = Scripted::new([
            IterationResult::ProcessedItems,
            IterationResult::NoItems,
            IterationResult::Shutdown,
        ]);
        PollScheduler::new(Duration::from_secs(10))
            .run(&mut processor, CancellationToken::new())
            .await;
        assert_eq!(processor.polls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_token_prevents_first_poll() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let mut processor = Scripted::new([]);
        PollScheduler::new(Duration::from_secs(10))
            .run(&mut processor, shutdown)
            .await;
        assert_eq!(processor.polls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_wait() {
        let shutdown = CancellationToken::new();
        let mut processor = Scripted::new([]);
        processor.cancel_after = Some((2, shutdown.clone()));

        let started = tokio::time::Instant::now();
        PollScheduler::new(Duration::from_secs(10))
            .run(&mut processor, shutdown)
            .await;

        assert_eq!(processor.polls, 2);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }
}
