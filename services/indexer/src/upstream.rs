//! Upstream event feed.
//!
//! Events come from a GraphQL subgraph indexing the marketplace contract.
//! Pagination is cursor based: a page is every event at or after the cursor
//! block, minus the transactions already stored at the cursor block itself.
//! A block can hold many events and a page can end mid-block, so excluding
//! by block alone would either repeat or skip events.

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use types::event::{EventPayload, EventType, IndexedEvent, OrderCancel, OrderMatch};
use types::ids::{Address, OrderHash, TxHash};

/// Errors fetching a page from the upstream feed.
///
/// All of them are recoverable: the cycle ends and the next tick retries
/// from the unchanged cursor.
#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("subgraph request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("subgraph returned HTTP {0}")]
    Status(u16),

    #[error("subgraph query error: {0}")]
    GraphQl(String),

    #[error("subgraph response decode failed: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("subgraph violated page contract: {0}")]
    Contract(String),
}

/// Source of ordered, paginated events for one type.
#[async_trait]
pub trait EventFeed: Send + Sync {
    /// Up to `page_size` events of `event_type` at block >= `from_block`
    /// whose hash is not in `exclude`, ascending by block number.
    async fn fetch_page(
        &self,
        event_type: EventType,
        from_block: u64,
        exclude: &BTreeSet<TxHash>,
        page_size: usize,
    ) -> Result<Vec<IndexedEvent>, UpstreamError>;
}

const MATCH_FIELDS: &str = "id txFrom txValue blockNumber blockTimestamp \
     leftOrderHash rightOrderHash leftMaker rightMaker newLeftFill newRightFill \
     leftAssetClass rightAssetClass leftAssetData rightAssetData";

const CANCEL_FIELDS: &str = "id txFrom txValue blockNumber blockTimestamp leftOrderHash leftMaker";

fn entity_name(event_type: EventType) -> &'static str {
    match event_type {
        EventType::Match => "orderMatchEntities",
        EventType::Cancel => "orderCancelEntities",
    }
}

/// Build the page query.
///
/// Hashes are interpolated directly; `TxHash` only admits `0x` + hex, so
/// they cannot break out of the string literal.
pub fn build_query(
    event_type: EventType,
    from_block: u64,
    exclude: &BTreeSet<TxHash>,
    page_size: usize,
) -> String {
    let excluded = exclude
        .iter()
        .map(|hash| format!("\"{}\"", hash))
        .collect::<Vec<_>>()
        .join(", ");
    let fields = match event_type {
        EventType::Match => MATCH_FIELDS,
        EventType::Cancel => CANCEL_FIELDS,
    };

    format!(
        "{{ {entity}(first: {page_size}, orderBy: blockNumber, orderDirection: asc, \
         where: {{ blockNumber_gte: {from_block}, id_not_in: [{excluded}] }}) {{ {fields} }} }}",
        entity = entity_name(event_type),
    )
}

/// Decode a subgraph response body into events, enforcing the page contract.
pub fn decode_page(
    event_type: EventType,
    from_block: u64,
    body: &[u8],
) -> Result<Vec<IndexedEvent>, UpstreamError> {
    let events = match event_type {
        EventType::Match => {
            let page: MatchPage = unwrap_graphql(serde_json::from_slice(body)?)?;
            page.order_match_entities
                .into_iter()
                .map(RawMatch::into_event)
                .collect::<Vec<_>>()
        }
        EventType::Cancel => {
            let page: CancelPage = unwrap_graphql(serde_json::from_slice(body)?)?;
            page.order_cancel_entities
                .into_iter()
                .map(RawCancel::into_event)
                .collect()
        }
    };

    verify_page(from_block, &events)?;
    Ok(events)
}

fn verify_page(from_block: u64, events: &[IndexedEvent]) -> Result<(), UpstreamError> {
    let mut previous = from_block;
    for event in events {
        if event.block_number < from_block {
            return Err(UpstreamError::Contract(format!(
                "event {} at block {} precedes requested block {}",
                event.tx_hash, event.block_number, from_block
            )));
        }
        if event.block_number < previous {
            return Err(UpstreamError::Contract(format!(
                "event {} at block {} out of order after block {}",
                event.tx_hash, event.block_number, previous
            )));
        }
        previous = event.block_number;
    }
    Ok(())
}

fn unwrap_graphql<T>(response: GraphQlResponse<T>) -> Result<T, UpstreamError> {
    if !response.errors.is_empty() {
        let messages = response
            .errors
            .into_iter()
            .map(|e| e.message)
            .collect::<Vec<_>>()
            .join("; ");
        return Err(UpstreamError::GraphQl(messages));
    }
    response
        .data
        .ok_or_else(|| UpstreamError::GraphQl("response carried no data".to_string()))
}

/// reqwest-backed subgraph client.
pub struct SubgraphClient {
    http: reqwest::Client,
    endpoint: String,
}

impl SubgraphClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl EventFeed for SubgraphClient {
    async fn fetch_page(
        &self,
        event_type: EventType,
        from_block: u64,
        exclude: &BTreeSet<TxHash>,
        page_size: usize,
    ) -> Result<Vec<IndexedEvent>, UpstreamError> {
        let query = build_query(event_type, from_block, exclude, page_size);

        let response = self
            .http
            .post(&self.endpoint)
            .json(&serde_json::json!({ "query": query }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::Status(status.as_u16()));
        }

        let body = response.bytes().await?;
        let events = decode_page(event_type, from_block, &body)?;

        debug!(
            event_type = event_type.as_str(),
            from_block,
            excluded = exclude.len(),
            returned = events.len(),
            "Fetched upstream page"
        );
        Ok(events)
    }
}

#[derive(Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MatchPage {
    order_match_entities: Vec<RawMatch>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelPage {
    order_cancel_entities: Vec<RawCancel>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMatch {
    id: TxHash,
    tx_from: String,
    #[serde(deserialize_with = "de_amount")]
    tx_value: String,
    #[serde(deserialize_with = "de_u64")]
    block_number: u64,
    #[serde(deserialize_with = "de_i64")]
    block_timestamp: i64,
    left_order_hash: String,
    right_order_hash: String,
    left_maker: String,
    right_maker: String,
    #[serde(deserialize_with = "de_amount")]
    new_left_fill: String,
    #[serde(deserialize_with = "de_amount")]
    new_right_fill: String,
    #[serde(default)]
    left_asset_class: String,
    #[serde(default)]
    right_asset_class: String,
    #[serde(default)]
    left_asset_data: String,
    #[serde(default)]
    right_asset_data: String,
}

impl RawMatch {
    fn into_event(self) -> IndexedEvent {
        IndexedEvent {
            tx_hash: self.id,
            tx_from: Address::new(self.tx_from),
            tx_value: self.tx_value,
            block_number: self.block_number,
            block_timestamp: self.block_timestamp,
            payload: EventPayload::Match(OrderMatch {
                left_order_hash: OrderHash::new(self.left_order_hash),
                right_order_hash: OrderHash::new(self.right_order_hash),
                left_maker: Address::new(self.left_maker),
                right_maker: Address::new(self.right_maker),
                new_left_fill: self.new_left_fill,
                new_right_fill: self.new_right_fill,
                left_asset_class: self.left_asset_class,
                right_asset_class: self.right_asset_class,
                left_asset_data: self.left_asset_data,
                right_asset_data: self.right_asset_data,
            }),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCancel {
    id: TxHash,
    tx_from: String,
    #[serde(deserialize_with = "de_amount")]
    tx_value: String,
    #[serde(deserialize_with = "de_u64")]
    block_number: u64,
    #[serde(deserialize_with = "de_i64")]
    block_timestamp: i64,
    left_order_hash: String,
    left_maker: String,
}

impl RawCancel {
    fn into_event(self) -> IndexedEvent {
        IndexedEvent {
            tx_hash: self.id,
            tx_from: Address::new(self.tx_from),
            tx_value: self.tx_value,
            block_number: self.block_number,
            block_timestamp: self.block_timestamp,
            payload: EventPayload::Cancel(OrderCancel {
                left_order_hash: OrderHash::new(self.left_order_hash),
                left_maker: Address::new(self.left_maker),
            }),
        }
    }
}

/// Subgraph `BigInt` fields arrive as decimal strings; plain JSON numbers
/// are accepted too.
#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(serde_json::Number),
    String(String),
}

fn de_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => n
            .as_u64()
            .ok_or_else(|| serde::de::Error::custom(format!("expected unsigned integer, got {n}"))),
        NumberOrString::String(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

fn de_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => n
            .as_i64()
            .ok_or_else(|| serde::de::Error::custom(format!("expected integer, got {n}"))),
        NumberOrString::String(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

fn de_amount<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => Ok(n.to_string()),
        NumberOrString::String(s) => Ok(s),
    }
}
