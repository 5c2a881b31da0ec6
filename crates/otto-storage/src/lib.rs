//! Persistence of experiments and trials.
//!
//! The driver opens an [`ExperimentScope`] as a transactional boundary; all
//! trial creations, updates and reads within one scope see a consistent view.

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sql;
pub mod storage;
pub mod trial;

pub use memory::*;
#[cfg(feature = "sqlite")]
pub use sql::*;
pub use storage::*;
pub use trial::*;
