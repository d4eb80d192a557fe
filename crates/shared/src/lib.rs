//! Subtrack Shared Types
//!
//! This crate contains types shared across the Subtrack billing services.

pub mod types;

pub use types::*;
