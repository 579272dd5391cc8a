//! Control Plane
//!
//! Runs the binder against a live object store:
//! - **controller**: informers, dispatcher and worker loops
//! - **backends**: volume plugins (host-path, remote HTTP provisioner)
//! - **api**: read-only operator HTTP surface

pub mod api;
pub mod backends;
pub mod controller;

pub use api::{ApiServer, ApiServerConfig, RestRouter};
pub use backends::{BackendFactory, HostPathPlugin, HttpPlugin};
pub use controller::{dispatch, Controller, ControllerHandle};
