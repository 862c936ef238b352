//! Core domain types for the towline dispatch core.
//!
//! This module contains pure domain types with no persistence dependencies:
//! - Emergency requests, their status machine and transition rules
//! - Coordinates and the proximity filter
//! - Payments and ratings
//! - Caller identity

pub mod actor;
pub mod geo;
pub mod payment;
pub mod rating;
pub mod request;
