//! Per-type ingestion cycle.
//!
//! One cycle pulls a single page from the upstream feed and persists it in
//! upstream order, one event at a time. The cursor advances only after each
//! individual persist succeeds, and the first persistence failure halts the
//! rest of the page. A restart can therefore never find the cursor ahead of
//! an event that was not stored.
//!
//! Invariants:
//! - Cursor never exceeds the block of the last persisted event
//! - No event after a failed persist is stored in the same cycle
//! - Delivery failures never alter cursor or stored rows

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, error, info, warn};
use types::event::{EventType, IndexedEvent};
use types::ids::TxHash;

use crate::cursor::CursorState;
use crate::delivery::{DeliveryOutcome, ForwardError, Forwarder};
use crate::guard::CycleGuard;
use crate::metrics::IndexerMetrics;
use crate::store::{EventStore, StoreError};
use crate::upstream::{EventFeed, UpstreamError};

/// Errors that end a cycle.
#[derive(Error, Debug)]
pub enum CycleError {
    /// Page fetch failed; nothing was changed.
    #[error("upstream fetch failed: {0}")]
    Upstream(#[from] UpstreamError),

    /// Cursor or exclusion read failed; nothing was changed.
    #[error("store read failed: {0}")]
    Store(#[from] StoreError),

    /// Ingestion completed but the orderbook response broke its contract.
    #[error("delivery of {persisted} persisted events rejected: {source}")]
    Delivery {
        persisted: usize,
        #[source]
        source: ForwardError,
    },
}

/// Outcome of one scheduler tick for a type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleReport {
    /// A previous cycle was still running.
    Skipped,
    /// Upstream had nothing new.
    Idle { cursor: u64 },
    /// A page was processed.
    Ingested {
        fetched: usize,
        persisted: usize,
        cursor: u64,
        /// First event that failed to persist, if the page was cut short.
        halted_at: Option<TxHash>,
        delivery: DeliveryOutcome,
    },
}

/// Ingestion state machine for one event type.
pub struct Ingestor {
    event_type: EventType,
    page_size: usize,
    cursor: CursorState,
    guard: CycleGuard,
    store: Arc<dyn EventStore>,
    feed: Arc<dyn EventFeed>,
    forwarder: Arc<Forwarder>,
    metrics: Arc<IndexerMetrics>,
}

impl Ingestor {
    pub fn new(
        event_type: EventType,
        page_size: usize,
        store: Arc<dyn EventStore>,
        feed: Arc<dyn EventFeed>,
        forwarder: Arc<Forwarder>,
        metrics: Arc<IndexerMetrics>,
    ) -> Self {
        info!(
            event_type = event_type.as_str(),
            page_size, "Ingestor initialized"
        );

        Self {
            event_type,
            page_size,
            cursor: CursorState::new(event_type),
            guard: CycleGuard::new(),
            store,
            feed,
            forwarder,
            metrics,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    /// Current in-memory cursor, `None` until the first cycle.
    pub fn cursor(&self) -> Option<u64> {
        self.cursor.get()
    }

    pub fn is_running(&self) -> bool {
        self.guard.is_busy()
    }

    /// Run one cycle unless one is already in flight.
    pub async fn run_cycle(&self) -> Result<CycleReport, CycleError> {
        let Some(_permit) = self.guard.try_acquire() else {
            self.metrics.record_cycle_skipped();
            debug!(
                event_type = self.event_type.as_str(),
                "Previous cycle still running, skipping tick"
            );
            return Ok(CycleReport::Skipped);
        };

        let started = Instant::now();
        let result = self.ingest_page().await;
        self.metrics.record_cycle(started.elapsed().as_millis() as u64);
        result
    }

    async fn ingest_page(&self) -> Result<CycleReport, CycleError> {
        let event_type = self.event_type;
        let cursor = self.cursor.get_or_init(self.store.as_ref())?;
        let exclude = self.store.hashes_at_block(event_type, cursor)?;

        let events = match self
            .feed
            .fetch_page(event_type, cursor, &exclude, self.page_size)
            .await
        {
            Ok(events) => events,
            Err(e) => {
                self.metrics.record_upstream_failure();
                warn!(
                    event_type = event_type.as_str(),
                    cursor,
                    error = %e,
                    "Upstream fetch failed, retrying next tick"
                );
                return Err(e.into());
            }
        };

        if events.is_empty() {
            return Ok(CycleReport::Idle { cursor });
        }

        let fetched = events.len();
        let mut to_deliver: Vec<IndexedEvent> = Vec::with_capacity(fetched);
        let mut halted_at = None;
        let mut seen: BTreeSet<TxHash> = BTreeSet::new();

        for event in events {
            if exclude.contains(&event.tx_hash) {
                debug!(tx_hash = %event.tx_hash, "Dropping already-stored event from page");
                continue;
            }
            if seen.contains(&event.tx_hash) {
                debug!(tx_hash = %event.tx_hash, "Dropping repeated event from page");
                continue;
            }
            if event.event_type() != event_type {
                warn!(
                    tx_hash = %event.tx_hash,
                    expected = event_type.as_str(),
                    found = event.event_type().as_str(),
                    "Dropping event of foreign type from page"
                );
                continue;
            }

            match self.store.upsert(&event) {
                Ok(()) => {
                    self.cursor.advance(event.block_number);
                    seen.insert(event.tx_hash.clone());
                    to_deliver.push(event);
                }
                Err(e) => {
                    self.metrics.record_persist_failure();
                    error!(
                        event_type = event_type.as_str(),
                        tx_hash = %event.tx_hash,
                        block_number = event.block_number,
                        persisted = to_deliver.len(),
                        error = %e,
                        "Persist failed, halting page"
                    );
                    halted_at = Some(event.tx_hash);
                    break;
                }
            }
        }

        let persisted = to_deliver.len();
        self.metrics.record_persisted(persisted as u64);
        let cursor = self.cursor.get().unwrap_or(cursor);

        info!(
            event_type = event_type.as_str(),
            fetched,
            persisted,
            cursor,
            halted = halted_at.is_some(),
            "Page ingested"
        );

        let delivery = self
            .forwarder
            .deliver(&to_deliver)
            .await
            .map_err(|source| CycleError::Delivery { persisted, source })?;

        Ok(CycleReport::Ingested {
            fetched,
            persisted,
            cursor,
            halted_at,
            delivery,
        })
    }
}
