//! Test support for herald: payload fixtures, scriptable fakes for every
//! external collaborator, and helpers for waiting on store state.

pub mod job;
pub mod mock;
pub mod queue;

pub use job::*;
pub use mock::*;
pub use queue::*;
