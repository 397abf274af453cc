//! Aggregation and live ranking of business events across document
//! collections.

pub mod agent;
pub mod aggregate;
pub mod clock;
pub mod config;
pub mod engine;
pub mod export;
pub mod identity;
pub mod live;
pub mod registry;
pub mod source;
pub mod trend;
