//! `loyaltysync-core`: domain foundation for customer synchronization.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, phone normalization and the local customer record that the
//! sync handlers reconcile against the remote loyalty backend.

pub mod customer;
pub mod error;
pub mod id;
pub mod phone;

pub use customer::{CardIdentity, Customer, CustomerCard, Gender};
pub use error::{DomainError, DomainResult};
pub use id::UserId;
pub use phone::Phone;
