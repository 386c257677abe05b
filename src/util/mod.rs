//! Utility types and functions shared across the crate.
//!
//! - [`Error`] / [`Result`] - Error handling
//! - Math type re-exports from `glam` and `ray-math`
//! - Little-endian field access for node and header bytes

mod bytes;
mod error;
mod math;

pub use bytes::*;
pub use error::*;
pub use math::*;
