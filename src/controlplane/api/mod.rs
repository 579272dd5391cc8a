//! Operator API
//!
//! Read-only HTTP surface over a running controller: health, readiness,
//! Prometheus metrics and views of the cached volumes and claims.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
