//! File system helpers.

pub mod walker;
