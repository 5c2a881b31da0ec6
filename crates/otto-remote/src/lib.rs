//! Remote-operation plumbing: the uniform async REST contract and the host
//! operations service built on top of it.

pub mod host_ops;
pub mod poller;

pub use host_ops::*;
pub use poller::*;
