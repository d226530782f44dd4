//! In-process fakes and fixtures shared by unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::time::Duration;
use types::delivery::DeliveryStatus;
use types::event::{EventPayload, EventType, IndexedEvent, OrderCancel, OrderMatch};
use types::ids::{Address, OrderHash, TxHash};

use crate::delivery::{DownstreamError, Orderbook};
use crate::store::{EventStore, SqliteEventStore, StoreError, StoredEvent};
use crate::upstream::{EventFeed, UpstreamError};

pub fn hash(raw: &str) -> TxHash {
    TxHash::parse(raw).unwrap()
}

pub fn match_event(tx_hash: &str, block_number: u64) -> IndexedEvent {
    IndexedEvent {
        tx_hash: hash(tx_hash),
        tx_from: Address::new("0xsender"),
        tx_value: "0".to_string(),
        block_number,
        block_timestamp: 1_700_000_000 + block_number as i64,
        payload: EventPayload::Match(OrderMatch {
            left_order_hash: OrderHash::new(format!("{tx_hash}-left")),
            right_order_hash: OrderHash::new(format!("{tx_hash}-right")),
            left_maker: Address::new("0xalice"),
            right_maker: Address::new("0xbob"),
            new_left_fill: "100".to_string(),
            new_right_fill: "1".to_string(),
            left_asset_class: "ERC721".to_string(),
            right_asset_class: "ETH".to_string(),
            left_asset_data: "0x01".to_string(),
            right_asset_data: "0x".to_string(),
        }),
    }
}

pub fn cancel_event(tx_hash: &str, block_number: u64) -> IndexedEvent {
    IndexedEvent {
        tx_hash: hash(tx_hash),
        tx_from: Address::new("0xsender"),
        tx_value: "0".to_string(),
        block_number,
        block_timestamp: 1_700_000_000 + block_number as i64,
        payload: EventPayload::Cancel(OrderCancel {
            left_order_hash: OrderHash::new(format!("{tx_hash}-left")),
            left_maker: Address::new("0xalice"),
        }),
    }
}

/// Recorded `fetch_page` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedCall {
    pub event_type: EventType,
    pub from_block: u64,
    pub exclude: BTreeSet<TxHash>,
}

/// Upstream feed over a fixed event list that honors the page contract.
#[derive(Default)]
pub struct FakeFeed {
    events: Mutex<Vec<IndexedEvent>>,
    calls: Mutex<Vec<FeedCall>>,
    failing: Mutex<bool>,
    delay: Mutex<Option<Duration>>,
}

impl FakeFeed {
    pub fn new(events: Vec<IndexedEvent>) -> Self {
        Self {
            events: Mutex::new(events),
            ..Default::default()
        }
    }

    pub fn push(&self, event: IndexedEvent) {
        self.events.lock().push(event);
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn calls(&self) -> Vec<FeedCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl EventFeed for FakeFeed {
    async fn fetch_page(
        &self,
        event_type: EventType,
        from_block: u64,
        exclude: &BTreeSet<TxHash>,
        page_size: usize,
    ) -> Result<Vec<IndexedEvent>, UpstreamError> {
        self.calls.lock().push(FeedCall {
            event_type,
            from_block,
            exclude: exclude.clone(),
        });

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if *self.failing.lock() {
            return Err(UpstreamError::Status(503));
        }

        let mut page: Vec<IndexedEvent> = self
            .events
            .lock()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .filter(|e| e.block_number >= from_block)
            .filter(|e| !exclude.contains(&e.tx_hash))
            .cloned()
            .collect();
        page.sort_by_key(|e| e.block_number);
        page.truncate(page_size);
        Ok(page)
    }
}

/// How [`FakeOrderbook`] answers.
#[derive(Debug, Clone)]
pub enum OrderbookReply {
    AllSuccess,
    Unreachable,
    Raw(Value),
}

pub struct FakeOrderbook {
    reply: Mutex<OrderbookReply>,
    calls: Mutex<Vec<(EventType, Vec<TxHash>)>>,
}

impl FakeOrderbook {
    pub fn new(reply: OrderbookReply) -> Self {
        Self {
            reply: Mutex::new(reply),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_reply(&self, reply: OrderbookReply) {
        *self.reply.lock() = reply;
    }

    pub fn calls(&self) -> Vec<(EventType, Vec<TxHash>)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Orderbook for FakeOrderbook {
    async fn submit(
        &self,
        event_type: EventType,
        events: &[IndexedEvent],
    ) -> Result<Value, DownstreamError> {
        self.calls
            .lock()
            .push((event_type, events.iter().map(|e| e.tx_hash.clone()).collect()));

        let reply = self.reply.lock().clone();
        match reply {
            OrderbookReply::AllSuccess => Ok(Value::Object(
                events
                    .iter()
                    .map(|e| (e.tx_hash.to_string(), Value::from(DeliveryStatus::SUCCESS)))
                    .collect(),
            )),
            OrderbookReply::Unreachable => Err(DownstreamError::Status(502)),
            OrderbookReply::Raw(value) => Ok(value),
        }
    }
}

/// SQLite store whose upserts fail for selected hashes.
pub struct FlakyStore {
    inner: SqliteEventStore,
    fail_upserts: Mutex<HashSet<TxHash>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: SqliteEventStore::open_in_memory().unwrap(),
            fail_upserts: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail_upsert_of(&self, tx_hash: &str) {
        self.fail_upserts.lock().insert(hash(tx_hash));
    }

    pub fn heal(&self) {
        self.fail_upserts.lock().clear();
    }
}

impl EventStore for FlakyStore {
    fn upsert(&self, event: &IndexedEvent) -> Result<(), StoreError> {
        if self.fail_upserts.lock().contains(&event.tx_hash) {
            return Err(StoreError::Io(std::io::Error::other("disk full")));
        }
        self.inner.upsert(event)
    }

    fn max_block(&self, event_type: EventType) -> Result<Option<u64>, StoreError> {
        self.inner.max_block(event_type)
    }

    fn hashes_at_block(
        &self,
        event_type: EventType,
        block_number: u64,
    ) -> Result<BTreeSet<TxHash>, StoreError> {
        self.inner.hashes_at_block(event_type, block_number)
    }

    fn pending_delivery(
        &self,
        event_type: EventType,
        limit: usize,
    ) -> Result<Vec<IndexedEvent>, StoreError> {
        self.inner.pending_delivery(event_type, limit)
    }

    fn record_attempts(&self, tx_hashes: &[TxHash]) -> Result<(), StoreError> {
        self.inner.record_attempts(tx_hashes)
    }

    fn set_delivery_status(
        &self,
        tx_hash: &TxHash,
        status: &DeliveryStatus,
    ) -> Result<(), StoreError> {
        self.inner.set_delivery_status(tx_hash, status)
    }

    fn get(&self, tx_hash: &TxHash) -> Result<Option<StoredEvent>, StoreError> {
        self.inner.get(tx_hash)
    }

    fn count(&self, event_type: EventType) -> Result<u64, StoreError> {
        self.inner.count(event_type)
    }
}
