//! Outward surfaces: Prometheus metrics, health probe and the consumer API.

pub mod api;
pub mod health;

pub use api::{router, ApiState};
pub use health::HealthMetrics;
