//! Shared types for the order-fulfillment saga workspace.

pub mod types;

pub use types::CorrelationId;
