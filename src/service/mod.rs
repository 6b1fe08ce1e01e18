//! Service layer
//!
//! Orchestration over the data and federation layers, consumed by the
//! HTTP handlers and by host-platform glue (admin screens, CLI, editor
//! integration) through typed operations.

mod federation;

pub use federation::FederationService;
