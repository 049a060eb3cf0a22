#![forbid(unsafe_code)]
#![doc = "Common types, error taxonomy, and algorithm identifiers for ferric."]

pub mod algorithm;
pub mod error;

pub use algorithm::*;
pub use error::*;
