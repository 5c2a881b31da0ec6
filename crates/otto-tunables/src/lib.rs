//! Tunable parameter model.
//!
//! A [`Tunable`] is one adjustable parameter with a constrained value domain.
//! Tunables co-vary in named [`CovariantGroup`]s, and a [`TunableGroups`]
//! collection is the unit of configuration-space subsetting that environments
//! consume and optimizers search.

pub mod group;
pub mod groups;
pub mod tunable;

pub use group::*;
pub use groups::*;
pub use tunable::*;
