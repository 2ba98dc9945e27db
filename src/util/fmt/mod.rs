//! Human-readable output: error messages, and the tree printers used to
//! inspect parsed and resolved declarations.

pub mod error;
pub mod tree;
