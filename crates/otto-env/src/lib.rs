//! A hierarchy of benchmark environments.
//!
//! Every node can be set up, run, queried for status and torn down; a
//! composite node owns an ordered sequence of children and aggregates their
//! behavior.

pub mod composite;
pub mod environment;
pub mod fileshare;
pub mod local;
pub mod mock;
pub mod remote;

pub use composite::*;
pub use environment::*;
pub use fileshare::*;
pub use local::*;
pub use mock::*;
pub use remote::*;
