/// In-process store guarded by a single mutex.
///
/// This module provides `InMemoryStore`, the default backend for tests and
/// single-process embedding. It implements both [`crate::JobStore`] and
/// [`crate::DeadLetterStore`].
pub mod memory;

/// PostgreSQL persistence for jobs and dead-letter records.
///
/// This module provides `PostgresStore`, a durable implementation of both
/// store traits with embedded migrations.
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;
