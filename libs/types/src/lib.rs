//! Types library for the marketplace order-event indexer
//!
//! Core type definitions shared by the indexing pipeline: event records,
//! identifiers, and delivery outcomes.
//!
//! # Modules
//! - `ids`: Identifiers (TxHash, OrderHash, Address)
//! - `event`: Order match / cancel event records
//! - `delivery`: Downstream delivery status
//! - `errors`: Error taxonomy

pub mod delivery;
pub mod errors;
pub mod event;
pub mod ids;

