/// In-process job store backed by a mutex-guarded map.
pub mod memory;

/// PostgreSQL persistence for the job store.
///
/// This module provides `PostgresJobStore`, a durable implementation of the
/// [`crate::JobStore`] trait.
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryJobStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresJobStore;
