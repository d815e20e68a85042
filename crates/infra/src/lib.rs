//! Infrastructure layer: transport adapters for the event bus.

pub mod event_bus;
pub mod registry;

pub use registry::default_registry;

mod integration_tests;
