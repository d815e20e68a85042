//! `ispforge-core`: foundation building blocks shared by the event bus crates.
//!
//! This crate contains **pure** primitives (no transport or runtime concerns).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult, require_name};
pub use id::EventId;
