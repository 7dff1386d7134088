//! A per-client WebSocket fan-out proxy sitting between many untrusted
//! downstream clients and a single upstream binary-options trading feed.
//!
//! # Modules
//!
//! - [`config`] - process configuration (listen port, upstream URL, asset
//!   table, rate limits, logging)
//! - [`logging`] - structured logging setup
//! - [`error`] - session-level error taxonomy
//! - [`registry`] - Asset Registry (C1)
//! - [`aggregator`] - Event Aggregator (C2)
//! - [`balance`] - Balance Normalizer (C3)
//! - [`order_builder`] - Order Builder (C4)
//! - [`upstream`] - Upstream Link (C5): wire protocol + connection state machine
//! - [`downstream`] - downstream-facing command/event wire types
//! - [`session`] - Session Mediator (C6)
//! - [`gateway`] - Acceptor (C7): HTTP/WebSocket entry point and session registry

pub mod aggregator;
pub mod balance;
pub mod config;
pub mod downstream;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod order_builder;
pub mod registry;
pub mod session;
pub mod upstream;
