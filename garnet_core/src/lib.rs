//! Garnet core: the value encoding and symbol table.
//!
//! This crate is the leaf of the workspace. It defines the uniform 64-bit
//! `Value` word shared by every other crate and the process-wide symbol
//! interner. Nothing here allocates on the garbage-collected heap — heap
//! integers, strings and friends live in `garnet_runtime`, which layers the
//! object model on top of this encoding.

#![warn(clippy::all)]

pub mod intern;
pub mod value;

pub use intern::{intern, Symbol};
pub use value::Value;

/// Garnet version string, taken from the workspace manifest.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The Ruby language level Garnet targets. Informational only — source-level
/// compatibility with a specific minor version is a non-goal.
pub const RUBY_VERSION: (u32, u32) = (3, 3);
