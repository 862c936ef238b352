//! Request aggregate - domain model and state transitions.
//!
//! This module contains the core domain logic for emergency requests:
//! - Request types and the status enum
//! - The transition table and its side effects
//! - Transition authority checks

pub mod state;
pub mod transitions;

// Re-export commonly used types
pub use state::*;
