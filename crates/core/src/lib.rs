//! `courier-core`: identity primitives shared by the outbox pipeline.
//!
//! This crate contains **pure** types (no I/O, no async runtime).

pub mod context;
pub mod error;
pub mod id;

pub use context::IdentityContext;
pub use error::DomainError;
pub use id::{EventId, RequestId, TenantId, UserId};
