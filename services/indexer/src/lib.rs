//! Marketplace Event Indexer
//!
//! Follows order `match` and `cancel` events published by the marketplace
//! subgraph and:
//! - Persists each event exactly once, keyed by transaction hash
//! - Tracks a per-type block cursor recoverable from storage
//! - Forwards freshly persisted batches to the orderbook service
//! - Re-delivers unresolved events with a periodic reconciliation sweep
//!
//! # Architecture
//!
//! ```text
//!        Subgraph (GraphQL)
//!              │
//!       ┌──────▼──────┐
//!       │  Ingestor   │  ← one per type, guarded, cursor + exclusion set
//!       └──────┬──────┘
//!              │ persist in order, halt on first failure
//!       ┌──────▼──────┐        ┌──────────────┐
//!       │ EventStore  │◄───────│ Reconcile    │  ← pending (unset status)
//!       └──────┬──────┘        └──────┬───────┘
//!              │                      │
//!       ┌──────▼──────────────────────▼──┐
//!       │           Forwarder            │
//!       └──────────────┬─────────────────┘
//!                      │ PUT /internal/orders/{type}
//!                 Orderbook
//! ```

pub mod config;
pub mod cursor;
pub mod delivery;
pub mod guard;
pub mod ingestion;
pub mod metrics;
pub mod reconcile;
pub mod scheduler;
pub mod status;
pub mod store;
pub mod upstream;

#[cfg(test)]
mod testing;

// Service version
pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");
