//! Request aggregate - domain model and state transitions.
//!
//! This module re-exports types from `domain::request`.
//! See that module for the actual implementations.

pub use crate::domain::actor::{Actor, Role, UserId};
pub use crate::domain::request::{state::*, transitions};
