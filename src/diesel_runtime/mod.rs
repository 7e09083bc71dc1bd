//! Canonical store runtime
//!
//! The backend-neutral store capability ([`store`]) with an in-memory
//! implementation, plus the Diesel/Postgres implementation, its connection
//! pool and the schema bootstrap (feature `postgres`).

pub mod memory;
pub mod store;

#[cfg(feature = "postgres")]
pub mod database;
#[cfg(feature = "postgres")]
pub mod pg_store;
#[cfg(feature = "postgres")]
pub mod schema;

// Re-export key types
pub use memory::{MemoryState, MemoryStore, Stored};
pub use store::{EntityKind, EntityStore, StoreError, TransactionWork, TransactionalStore};

#[cfg(feature = "postgres")]
pub use database::{Database, DatabaseConfig, DbConnection, Pool, PooledConnection};
#[cfg(feature = "postgres")]
pub use pg_store::PgEntityStore;
#[cfg(feature = "postgres")]
pub use schema::ensure_schema;
