//! Ottobench: closed-loop benchmark autotuning platform.
//!
//! This facade re-exports the workspace crates so that integration tests and
//! downstream tools can depend on a single package.

pub use otto_config as config;
pub use otto_core as core;
pub use otto_driver as driver;
pub use otto_env as env;
pub use otto_optimizer as optimizer;
pub use otto_remote as remote;
pub use otto_services as services;
pub use otto_storage as storage;
pub use otto_tunables as tunables;
