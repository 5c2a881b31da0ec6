//! The main optimization loop.

pub mod driver;

pub use driver::*;
