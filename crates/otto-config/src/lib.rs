//! Configuration loading for the Otto control plane.
//!
//! Configs are JSON with comments (JSON5 syntax). Every object carries a
//! `class` field (dotted logical type name) and a `config` sub-object; the
//! loader instantiates them through registries of factory closures.

pub mod builders;
pub mod loader;

pub use builders::*;
pub use loader::*;
