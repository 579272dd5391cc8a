//! Domain layer - Core types and port definitions
//!
//! This module defines the binder's data model and the traits (ports) that
//! adapters implement, following hexagonal architecture principles.

pub mod model;
pub mod ports;
pub mod quantity;
pub mod selector;

pub use model::*;
pub use ports::*;
pub use quantity::{format_quantity, parse_quantity};
pub use selector::{LabelSelector, LabelSelectorRequirement, SelectorOperator};
