#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::unused_self,
    rust_2018_idioms,
    rust_2024_compatibility
)]
#![allow(clippy::type_complexity)]

//! # Candle-Data
//! Live tick ingestion for dynamically selected instruments, aggregated into one-minute OHLC
//! candles annotated with large single trades ("Big Player" volume).
//!
//! The pipeline is:
//! * [`SubscriptionRegistry`](registry::SubscriptionRegistry) receives alert driven subscribe
//!   requests and owns one worker task per symbol.
//! * [`GapReconciler`](reconcile::GapReconciler) backfills `[market open, subscription time)`
//!   from a [`HistoricalFetcher`](reconcile::HistoricalFetcher) before live ticks are released.
//! * [`TickStreamClient`](feed::TickStreamClient) multiplexes one live feed connection,
//!   de-duplicates ticks and routes them to the owning symbol worker.
//! * [`CandleAggregator`](aggregator::CandleAggregator) turns ticks into closed candles.
//! * [`PersistenceGateway`](gateway::PersistenceGateway) merges candles into a
//!   [`CandleStore`](store::CandleStore) idempotently and enforces the retention window.
//!
//! [`CandleService`](service::CandleService) wires all of the above together.

/// Tick to one-minute [`Candle`](candle::Candle) state machine.
pub mod aggregator;

/// [`Candle`](candle::Candle), [`CandleKey`](candle::CandleKey) and candle merge precedence.
pub mod candle;

/// Service [`Config`](config::Config) with defaults, builder methods and environment overlay.
pub mod config;

/// All errors generated in `candle-data`.
pub mod error;

/// Live tick feed: connector abstraction, dispatcher, reconnection and de-duplication.
pub mod feed;

/// Idempotent, retention aware persistence front for a [`CandleStore`](store::CandleStore).
pub mod gateway;

/// HTTP [`HistoricalFetcher`](reconcile::HistoricalFetcher) implementation.
pub mod historical;

/// [`Symbol`](instrument::Symbol), [`Instrument`](instrument::Instrument) and the
/// reference-data backed [`InstrumentCache`](instrument::InstrumentCache).
pub mod instrument;

/// Historical gap detection and backfill.
pub mod reconcile;

/// Symbol subscription lifecycle.
pub mod registry;

/// Top level wiring of the ingestion pipeline.
pub mod service;

/// Market session times, minute buckets and clocks.
pub mod session;

/// Keyed candle storage collaborator and an in-memory implementation.
pub mod store;

/// Normalised live [`Tick`](tick::Tick).
pub mod tick;

/// Per-symbol owning worker task.
mod worker;
