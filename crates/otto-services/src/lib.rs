//! Services expose named operations (provisioning, I/O, execution) to
//! environments through a registry assembled by composition.

pub mod fileshare;
pub mod local_exec;
pub mod registry;

pub use fileshare::*;
pub use local_exec::*;
pub use registry::*;
