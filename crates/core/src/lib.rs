//! Domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives shared by every module: aggregate
//! identity, strongly-typed identifiers, module names and the domain error model.

pub mod aggregate;
pub mod error;
pub mod id;
pub mod module;

pub use aggregate::AggregateRoot;
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, EventId};
pub use module::ModuleName;
