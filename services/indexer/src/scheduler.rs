//! Timers driving ingestion and reconciliation.
//!
//! Two independent intervals: the poll interval spawns one ingestion cycle
//! per event type each tick, and the sweep interval spawns one reconciliation
//! sweep per type. Types run concurrently; overlap within a type is resolved
//! by the per-type guards, so a slow cycle turns later ticks into no-ops.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use types::event::EventType;

use crate::ingestion::{CycleError, CycleReport, Ingestor};
use crate::reconcile::{ReconciliationSweep, SweepError, SweepReport};

pub struct Scheduler {
    ingestors: Vec<Arc<Ingestor>>,
    sweep: Arc<ReconciliationSweep>,
    poll_interval: Duration,
    sweep_interval: Duration,
    cancel: CancellationToken,
}

/// Running scheduler. Dropping it does not stop the timers; call
/// [`SchedulerHandle::shutdown`].
pub struct SchedulerHandle {
    cancel: CancellationToken,
    poll: JoinHandle<()>,
    sweep: JoinHandle<()>,
}

impl Scheduler {
    pub fn new(
        ingestors: Vec<Arc<Ingestor>>,
        sweep: Arc<ReconciliationSweep>,
        poll_interval: Duration,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            ingestors,
            sweep,
            poll_interval,
            sweep_interval,
            cancel: CancellationToken::new(),
        }
    }

    /// Start both timers. Consumes the scheduler so it can only start once.
    pub fn start(self) -> SchedulerHandle {
        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            sweep_interval_secs = self.sweep_interval.as_secs(),
            types = self.ingestors.len(),
            "Starting scheduler"
        );

        let ingestors = self.ingestors;
        let poll = tokio::spawn(run_timer(
            "poll",
            self.poll_interval,
            self.cancel.clone(),
            move |tasks| {
                for ingestor in &ingestors {
                    let ingestor = Arc::clone(ingestor);
                    tasks.spawn(async move {
                        let event_type = ingestor.event_type();
                        log_cycle(event_type, ingestor.run_cycle().await);
                    });
                }
            },
        ));

        let sweeper = self.sweep;
        let sweep = tokio::spawn(run_timer(
            "sweep",
            self.sweep_interval,
            self.cancel.clone(),
            move |tasks| {
                for event_type in EventType::ALL {
                    let sweeper = Arc::clone(&sweeper);
                    tasks.spawn(async move {
                        log_sweep(event_type, sweeper.run(event_type).await);
                    });
                }
            },
        ));

        SchedulerHandle {
            cancel: self.cancel,
            poll,
            sweep,
        }
    }
}

impl SchedulerHandle {
    /// Stop issuing ticks. In-flight cycles run to completion.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait for both timers to stop and their in-flight tasks to finish.
    pub async fn join(self) {
        for (name, handle) in [("poll", self.poll), ("sweep", self.sweep)] {
            if let Err(e) = handle.await {
                error!(timer = name, error = %e, "Timer task panicked");
            }
        }
    }
}

fn run_timer<F>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    mut on_tick: F,
) -> impl Future<Output = ()> + Send
where
    F: FnMut(&mut JoinSet<()>) + Send + 'static,
{
    async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => on_tick(&mut tasks),
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(timer = name, error = %e, "Scheduled task panicked");
                    }
                }
            }
        }

        debug!(timer = name, in_flight = tasks.len(), "Timer stopped, draining tasks");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(timer = name, error = %e, "Scheduled task panicked");
            }
        }
        info!(timer = name, "Timer stopped");
    }
}

fn log_cycle(event_type: EventType, result: Result<CycleReport, CycleError>) {
    match result {
        Ok(CycleReport::Idle { cursor }) => {
            debug!(event_type = event_type.as_str(), cursor, "No new events")
        }
        Ok(_) => {}
        // Already warned with cursor context by the ingestor
        Err(CycleError::Upstream(_)) => {}
        Err(e @ CycleError::Store(_)) => {
            error!(event_type = event_type.as_str(), error = %e, "Ingestion cycle failed")
        }
        Err(e @ CycleError::Delivery { .. }) => {
            error!(
                event_type = event_type.as_str(),
                error = %e,
                "Ingestion cycle delivery rejected"
            )
        }
    }
}

fn log_sweep(event_type: EventType, result: Result<SweepReport, SweepError>) {
    match result {
        Ok(SweepReport::Swept { selected, .. }) if selected > 0 => {
            info!(event_type = event_type.as_str(), selected, "Sweep finished")
        }
        Ok(_) => {}
        Err(e) => warn!(event_type = event_type.as_str(), error = %e, "Sweep failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::Forwarder;
    use crate::metrics::IndexerMetrics;
    use crate::store::{EventStore, SqliteEventStore};
    use crate::testing::{cancel_event, match_event, FakeFeed, FakeOrderbook, OrderbookReply};

    struct Fixture {
        store: Arc<SqliteEventStore>,
        feed: Arc<FakeFeed>,
        orderbook: Arc<FakeOrderbook>,
        metrics: Arc<IndexerMetrics>,
    }

    impl Fixture {
        fn new(reply: OrderbookReply) -> Self {
            Self {
                store: Arc::new(SqliteEventStore::open_in_memory().unwrap()),
                feed: Arc::new(FakeFeed::new(vec![])),
                orderbook: Arc::new(FakeOrderbook::new(reply)),
                metrics: Arc::new(IndexerMetrics::new()),
            }
        }

        fn scheduler(&self, poll: Duration, sweep: Duration) -> Scheduler {
            let forwarder = Arc::new(Forwarder::new(
                self.orderbook.clone(),
                self.store.clone(),
                self.metrics.clone(),
            ));
            let ingestors = EventType::ALL
                .iter()
                .map(|t| {
                    Arc::new(Ingestor::new(
                        *t,
                        100,
                        self.store.clone(),
                        self.feed.clone(),
                        forwarder.clone(),
                        self.metrics.clone(),
                    ))
                })
                .collect();
            let sweeper = Arc::new(ReconciliationSweep::new(
                self.store.clone(),
                forwarder,
                self.metrics.clone(),
                50,
            ));
            Scheduler::new(ingestors, sweeper, poll, sweep)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_ingest_both_types() {
        let fixture = Fixture::new(OrderbookReply::AllSuccess);
        let handle = fixture
            .scheduler(Duration::from_secs(1), Duration::from_secs(3600))
            .start();

        fixture.feed.push(match_event("0x01", 5));
        fixture.feed.push(cancel_event("0x02", 6));
        tokio::time::sleep(Duration::from_millis(2500)).await;

        assert_eq!(fixture.store.count(EventType::Match).unwrap(), 1);
        assert_eq!(fixture.store.count(EventType::Cancel).unwrap(), 1);
        assert!(fixture.metrics.export()["cycles_run"] >= 4);

        handle.shutdown();
        handle.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_cycle_skips_overlapping_ticks() {
        let fixture = Fixture::new(OrderbookReply::AllSuccess);
        fixture.feed.set_delay(Duration::from_millis(3500));
        let handle = fixture
            .scheduler(Duration::from_secs(1), Duration::from_secs(3600))
            .start();

        tokio::time::sleep(Duration::from_millis(3200)).await;

        // One fetch per type is still in flight; later ticks were dropped
        assert_eq!(fixture.feed.calls().len(), 2);
        assert!(fixture.metrics.export()["cycles_skipped"] >= 2);

        handle.shutdown();
        handle.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_retries_undelivered_events() {
        let fixture = Fixture::new(OrderbookReply::Unreachable);
        fixture.feed.push(match_event("0x01", 5));
        let handle = fixture
            .scheduler(Duration::from_secs(1), Duration::from_secs(10))
            .start();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(fixture.store.pending_delivery(EventType::Match, 10).unwrap().len(), 1);

        fixture.orderbook.set_reply(OrderbookReply::AllSuccess);
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(fixture.store.pending_delivery(EventType::Match, 10).unwrap().is_empty());
        assert!(fixture.metrics.export()["sweeps_run"] >= 2);

        handle.shutdown();
        handle.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_in_flight_cycle() {
        let fixture = Fixture::new(OrderbookReply::AllSuccess);
        fixture.feed.push(match_event("0x01", 5));
        fixture.feed.set_delay(Duration::from_secs(2));
        let handle = fixture
            .scheduler(Duration::from_secs(1), Duration::from_secs(3600))
            .start();

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown();
        handle.join().await;

        assert_eq!(fixture.store.count(EventType::Match).unwrap(), 1);
    }
}
