//! HTTP request handlers.

pub mod dead_letter;
pub mod health;

pub use health::{health_check, prometheus_metrics};
