//! Reconciliation sweep.
//!
//! Periodically re-delivers stored events whose `delivery_status` is still
//! unset. Events the orderbook already answered for, including with an error
//! description, are not swept again. Selection favors the least-attempted
//! rows, so events the orderbook keeps leaving unanswered rotate out of the
//! batch instead of blocking the rows behind them.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};
use types::event::EventType;

use crate::delivery::{DeliveryOutcome, ForwardError, Forwarder};
use crate::guard::CycleGuard;
use crate::metrics::IndexerMetrics;
use crate::store::{EventStore, StoreError};

#[derive(Error, Debug)]
pub enum SweepError {
    #[error("pending query failed: {0}")]
    Store(#[from] StoreError),

    #[error("sweep delivery rejected: {0}")]
    Delivery(#[from] ForwardError),
}

/// Outcome of one sweep for a type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepReport {
    /// A previous sweep for the type was still running.
    Skipped,
    /// `selected` pending events were handed to the forwarder.
    Swept {
        selected: usize,
        delivery: DeliveryOutcome,
    },
}

pub struct ReconciliationSweep {
    store: Arc<dyn EventStore>,
    forwarder: Arc<Forwarder>,
    metrics: Arc<IndexerMetrics>,
    batch_size: usize,
    guards: HashMap<EventType, CycleGuard>,
}

impl ReconciliationSweep {
    pub fn new(
        store: Arc<dyn EventStore>,
        forwarder: Arc<Forwarder>,
        metrics: Arc<IndexerMetrics>,
        batch_size: usize,
    ) -> Self {
        let guards = EventType::ALL
            .iter()
            .map(|t| (*t, CycleGuard::new()))
            .collect();

        Self {
            store,
            forwarder,
            metrics,
            batch_size,
            guards,
        }
    }

    pub fn is_running(&self, event_type: EventType) -> bool {
        self.guards
            .get(&event_type)
            .is_some_and(CycleGuard::is_busy)
    }

    /// Re-deliver up to `batch_size` pending events of `event_type`.
    pub async fn run(&self, event_type: EventType) -> Result<SweepReport, SweepError> {
        let permit = self.guards.get(&event_type).and_then(CycleGuard::try_acquire);
        let Some(_permit) = permit else {
            self.metrics.record_sweep_skipped();
            debug!(
                event_type = event_type.as_str(),
                "Previous sweep still running, skipping"
            );
            return Ok(SweepReport::Skipped);
        };

        let pending = self.store.pending_delivery(event_type, self.batch_size)?;
        let selected = pending.len();
        self.metrics.record_sweep(selected as u64);

        if selected == 0 {
            debug!(event_type = event_type.as_str(), "Nothing pending");
            return Ok(SweepReport::Swept {
                selected,
                delivery: DeliveryOutcome::Skipped,
            });
        }

        info!(
            event_type = event_type.as_str(),
            selected, "Re-delivering pending events"
        );
        let delivery = self.forwarder.deliver(&pending).await?;

        Ok(SweepReport::Swept { selected, delivery })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteEventStore;
    use crate::testing::{cancel_event, hash, match_event, FakeOrderbook, OrderbookReply};
    use serde_json::json;
    use types::delivery::DeliveryStatus;
    use types::ids::TxHash;

    fn sweep(
        reply: OrderbookReply,
        batch_size: usize,
    ) -> (ReconciliationSweep, Arc<SqliteEventStore>, Arc<FakeOrderbook>) {
        let store = Arc::new(SqliteEventStore::open_in_memory().unwrap());
        let orderbook = Arc::new(FakeOrderbook::new(reply));
        let metrics = Arc::new(IndexerMetrics::new());
        let forwarder = Arc::new(Forwarder::new(orderbook.clone(), store.clone(), metrics.clone()));
        let sweep = ReconciliationSweep::new(store.clone(), forwarder, metrics, batch_size);
        (sweep, store, orderbook)
    }

    #[tokio::test]
    async fn test_sweep_delivers_pending_and_closes_them() {
        let (sweep, store, orderbook) = sweep(OrderbookReply::AllSuccess, 50);
        store.upsert(&match_event("0x01", 1)).unwrap();
        store.upsert(&match_event("0x02", 2)).unwrap();

        let report = sweep.run(EventType::Match).await.unwrap();
        assert!(matches!(report, SweepReport::Swept { selected: 2, .. }));
        assert!(store.pending_delivery(EventType::Match, 50).unwrap().is_empty());

        // Second pass finds nothing and sends nothing
        let report = sweep.run(EventType::Match).await.unwrap();
        assert_eq!(
            report,
            SweepReport::Swept { selected: 0, delivery: DeliveryOutcome::Skipped }
        );
        assert_eq!(orderbook.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_respects_batch_size_and_order() {
        let (sweep, store, orderbook) = sweep(OrderbookReply::AllSuccess, 2);
        store.upsert(&cancel_event("0x03", 9)).unwrap();
        store.upsert(&cancel_event("0x01", 4)).unwrap();
        store.upsert(&cancel_event("0x02", 4)).unwrap();

        sweep.run(EventType::Cancel).await.unwrap();

        assert_eq!(
            orderbook.calls(),
            vec![(EventType::Cancel, vec![hash("0x01"), hash("0x02")])]
        );
        let pending = store.pending_delivery(EventType::Cancel, 10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].tx_hash, hash("0x03"));
    }

    #[tokio::test]
    async fn test_sweep_skips_recorded_error_statuses() {
        let (sweep, store, orderbook) = sweep(OrderbookReply::AllSuccess, 50);
        store.upsert(&match_event("0x01", 1)).unwrap();
        store
            .set_delivery_status(&hash("0x01"), &DeliveryStatus::Error("order expired".into()))
            .unwrap();

        sweep.run(EventType::Match).await.unwrap();
        assert!(orderbook.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_sweep_keeps_events_pending() {
        let (sweep, store, _orderbook) = sweep(OrderbookReply::Unreachable, 50);
        store.upsert(&match_event("0x01", 1)).unwrap();

        let report = sweep.run(EventType::Match).await.unwrap();
        assert_eq!(
            report,
            SweepReport::Swept { selected: 1, delivery: DeliveryOutcome::Unreachable }
        );
        assert_eq!(store.pending_delivery(EventType::Match, 50).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_sweep_response_is_raised() {
        let (sweep, store, _orderbook) = sweep(OrderbookReply::Raw(json!("accepted")), 50);
        store.upsert(&match_event("0x01", 1)).unwrap();

        let err = sweep.run(EventType::Match).await.unwrap_err();
        assert!(matches!(err, SweepError::Delivery(ForwardError::Malformed(_))));
        assert!(!sweep.is_running(EventType::Match));
    }

    async fn swept_hashes(reply: OrderbookReply) -> Vec<Vec<TxHash>> {
        let (sweep, store, orderbook) = sweep(reply, 2);
        for (raw, block) in [("0x01", 1), ("0x02", 2), ("0x03", 3)] {
            store.upsert(&match_event(raw, block)).unwrap();
        }

        for _ in 0..3 {
            let _ = sweep.run(EventType::Match).await;
        }

        orderbook.calls().into_iter().map(|(_, hashes)| hashes).collect()
    }

    #[tokio::test]
    async fn test_unanswered_events_do_not_starve_the_rest() {
        let batches = swept_hashes(OrderbookReply::Raw(json!({}))).await;

        assert_eq!(batches[0], vec![hash("0x01"), hash("0x02")]);
        assert_eq!(batches[1], vec![hash("0x03"), hash("0x01")]);
        assert_eq!(batches[2], vec![hash("0x02"), hash("0x03")]);
    }

    #[tokio::test]
    async fn test_poison_batch_does_not_starve_the_rest() {
        let batches = swept_hashes(OrderbookReply::Raw(json!(["bad"]))).await;

        assert_eq!(batches.len(), 3);
        assert!(batches[1].contains(&hash("0x03")));
    }

    #[tokio::test]
    async fn test_sweep_only_touches_requested_type() {
        let (sweep, store, orderbook) = sweep(OrderbookReply::AllSuccess, 50);
        store.upsert(&match_event("0x01", 1)).unwrap();
        store.upsert(&cancel_event("0x02", 1)).unwrap();

        sweep.run(EventType::Cancel).await.unwrap();

        assert_eq!(orderbook.calls(), vec![(EventType::Cancel, vec![hash("0x02")])]);
        assert_eq!(store.pending_delivery(EventType::Match, 50).unwrap().len(), 1);
    }
}
