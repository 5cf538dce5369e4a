//! Data model shared by the defender collector and agent crates.

pub mod id;
pub mod types;
