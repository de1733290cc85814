//! The broker: router between cores and sub-brokers, keeper of global
//! naming, and orchestrator of the initialization and execution barriers.
//! The root broker additionally owns id allocation.

#![deny(clippy::all)]

mod broker;

pub use broker::{Broker, BrokerConfig};
