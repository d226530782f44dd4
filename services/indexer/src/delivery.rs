//! Delivery of persisted events to the orderbook service.
//!
//! Delivery is best effort from the ingestor's side: transport failures are
//! logged and leave `delivery_status` unset for the reconciliation sweep.
//! A response that cannot be mapped back onto the batch is a contract
//! violation and is raised instead of written.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use types::delivery::DeliveryStatus;
use types::event::{EventPayload, EventType, IndexedEvent};
use types::ids::{Address, OrderHash, TxHash};

use crate::metrics::IndexerMetrics;
use crate::store::EventStore;

/// Per-transaction outcome reported by the orderbook.
pub type StatusMap = BTreeMap<TxHash, DeliveryStatus>;

/// Failure reaching the orderbook. Never raised past the forwarder.
#[derive(Error, Debug)]
pub enum DownstreamError {
    #[error("orderbook request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("orderbook returned HTTP {0}")]
    Status(u16),
}

/// The orderbook answered with something that is not a status map for the batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed orderbook response: {0}")]
pub struct MalformedResponse(pub String);

/// Contract violations surfaced by [`Forwarder::deliver`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ForwardError {
    #[error(transparent)]
    Malformed(#[from] MalformedResponse),

    #[error("delivery batch mixes event types: expected {expected}, found {found} ({tx_hash})")]
    MixedBatch {
        expected: EventType,
        found: EventType,
        tx_hash: TxHash,
    },
}

/// Downstream consumer of indexed events.
#[async_trait]
pub trait Orderbook: Send + Sync {
    /// Submit one batch of same-type events, returning the raw response body.
    async fn submit(
        &self,
        event_type: EventType,
        events: &[IndexedEvent],
    ) -> Result<Value, DownstreamError>;
}

/// Map a response body onto the submitted batch.
///
/// The body must be a JSON object whose keys are transaction hashes from the
/// batch and whose values are non-empty status strings. Batch members absent
/// from the object are left pending.
pub fn parse_status_map(
    body: &Value,
    batch: &[IndexedEvent],
) -> Result<StatusMap, MalformedResponse> {
    let object = body
        .as_object()
        .ok_or_else(|| MalformedResponse(format!("expected object keyed by tx hash, got {body}")))?;

    let submitted: BTreeSet<&TxHash> = batch.iter().map(|e| &e.tx_hash).collect();
    let mut statuses = StatusMap::new();

    for (key, value) in object {
        let tx_hash = TxHash::parse(key.as_str())
            .map_err(|_| MalformedResponse(format!("key {key:?} is not a transaction hash")))?;
        if !submitted.contains(&tx_hash) {
            return Err(MalformedResponse(format!(
                "status for {tx_hash} which was not in the batch"
            )));
        }

        let raw = value
            .as_str()
            .ok_or_else(|| {
                MalformedResponse(format!("status for {tx_hash} is not a string: {value}"))
            })?;
        let status = DeliveryStatus::parse(raw)
            .map_err(|e| MalformedResponse(format!("status for {tx_hash}: {e}")))?;

        statuses.insert(tx_hash, status);
    }

    Ok(statuses)
}

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Nothing to deliver.
    Skipped,
    /// The orderbook could not be reached; statuses stay unset.
    Unreachable,
    /// The orderbook answered; `written` statuses were stored.
    Delivered { statuses: StatusMap, written: usize },
}

/// Sends persisted batches to the orderbook and records the outcome per event.
pub struct Forwarder {
    orderbook: Arc<dyn Orderbook>,
    store: Arc<dyn EventStore>,
    metrics: Arc<IndexerMetrics>,
}

impl Forwarder {
    pub fn new(
        orderbook: Arc<dyn Orderbook>,
        store: Arc<dyn EventStore>,
        metrics: Arc<IndexerMetrics>,
    ) -> Self {
        Self {
            orderbook,
            store,
            metrics,
        }
    }

    /// Deliver an ordered batch of same-type events in a single request.
    pub async fn deliver(&self, events: &[IndexedEvent]) -> Result<DeliveryOutcome, ForwardError> {
        let Some(first) = events.first() else {
            return Ok(DeliveryOutcome::Skipped);
        };
        let event_type = first.event_type();
        if let Some(other) = events.iter().find(|e| e.event_type() != event_type) {
            return Err(ForwardError::MixedBatch {
                expected: event_type,
                found: other.event_type(),
                tx_hash: other.tx_hash.clone(),
            });
        }

        let submitted = self.orderbook.submit(event_type, events).await;
        self.record_attempts(events);

        let body = match submitted {
            Ok(body) => body,
            Err(e) => {
                self.metrics.record_unreachable();
                warn!(
                    event_type = event_type.as_str(),
                    batch = events.len(),
                    error = %e,
                    "Orderbook unreachable, leaving statuses pending"
                );
                return Ok(DeliveryOutcome::Unreachable);
            }
        };

        let statuses = match parse_status_map(&body, events) {
            Ok(statuses) => statuses,
            Err(e) => {
                self.metrics.record_malformed_response();
                error!(
                    event_type = event_type.as_str(),
                    batch = events.len(),
                    error = %e,
                    "Orderbook response rejected"
                );
                return Err(e.into());
            }
        };

        let mut written = 0;
        for (tx_hash, status) in &statuses {
            match self.store.set_delivery_status(tx_hash, status) {
                Ok(()) => written += 1,
                Err(e) => {
                    self.metrics.record_status_write_failure();
                    warn!(
                        tx_hash = %tx_hash,
                        status = %status,
                        error = %e,
                        "Failed to record delivery status"
                    );
                }
            }
        }

        let rejected = statuses.values().filter(|s| !s.is_terminal()).count();
        if rejected > 0 {
            warn!(
                event_type = event_type.as_str(),
                rejected,
                "Orderbook rejected events"
            );
        }

        let missing = events.len() - statuses.len();
        if missing > 0 {
            debug!(
                event_type = event_type.as_str(),
                missing,
                "Orderbook omitted statuses, events stay pending"
            );
        }

        self.metrics.record_delivered(written as u64);
        info!(
            event_type = event_type.as_str(),
            batch = events.len(),
            written,
            "Batch delivered"
        );

        Ok(DeliveryOutcome::Delivered { statuses, written })
    }

    fn record_attempts(&self, events: &[IndexedEvent]) {
        let hashes: Vec<TxHash> = events.iter().map(|e| e.tx_hash.clone()).collect();
        if let Err(e) = self.store.record_attempts(&hashes) {
            self.metrics.record_status_write_failure();
            warn!(
                batch = hashes.len(),
                error = %e,
                "Failed to record delivery attempts"
            );
        }
    }
}

/// Wire shape of one forwarded event.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeliveryPayload<'a> {
    tx_hash: &'a TxHash,
    block_number: u64,
    block_timestamp: i64,
    tx_from: &'a Address,
    left_order_hash: &'a OrderHash,
    left_maker: &'a Address,
    #[serde(skip_serializing_if = "Option::is_none")]
    right_order_hash: Option<&'a OrderHash>,
    #[serde(skip_serializing_if = "Option::is_none")]
    right_maker: Option<&'a Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    new_left_fill: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    new_right_fill: Option<&'a str>,
}

impl<'a> From<&'a IndexedEvent> for DeliveryPayload<'a> {
    fn from(event: &'a IndexedEvent) -> Self {
        let (right_order_hash, right_maker, new_left_fill, new_right_fill) = match &event.payload {
            EventPayload::Match(m) => (
                Some(&m.right_order_hash),
                Some(&m.right_maker),
                Some(m.new_left_fill.as_str()),
                Some(m.new_right_fill.as_str()),
            ),
            EventPayload::Cancel(_) => (None, None, None, None),
        };

        Self {
            tx_hash: &event.tx_hash,
            block_number: event.block_number,
            block_timestamp: event.block_timestamp,
            tx_from: &event.tx_from,
            left_order_hash: event.left_order_hash(),
            left_maker: event.left_maker(),
            right_order_hash,
            right_maker,
            new_left_fill,
            new_right_fill,
        }
    }
}

/// reqwest-backed orderbook client.
///
/// `PUT {base_url}/internal/orders/{type}` with `{"events": [...]}`.
pub struct OrderbookClient {
    http: reqwest::Client,
    base_url: String,
}

impl OrderbookClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, DownstreamError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Orderbook for OrderbookClient {
    async fn submit(
        &self,
        event_type: EventType,
        events: &[IndexedEvent],
    ) -> Result<Value, DownstreamError> {
        let payload: Vec<DeliveryPayload<'_>> = events.iter().map(DeliveryPayload::from).collect();

        let response = self
            .http
            .put(format!("{}/internal/orders/{}", self.base_url, event_type))
            .json(&serde_json::json!({ "events": payload }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownstreamError::Status(status.as_u16()));
        }

        Ok(response.json::<Value>().await?)
    }
}
