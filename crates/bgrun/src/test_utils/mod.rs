//! Test utilities shared by the unit tests.

pub mod generators;
pub mod stores;

pub use generators::*;
pub use stores::*;
