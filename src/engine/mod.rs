//! # Engine Module
//!
//! Host-side building blocks that do not touch the device:
//! - Logical element types and their packing descriptors
//! - The word packing codec and read-range arithmetic
//! - Error types shared by every layer
//!
//! Public API exposure is controlled by `lib.rs`.

pub mod types;
pub mod error;
pub mod codec;
