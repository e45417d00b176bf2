//! Persistence for monitors and incidents
//!
//! ## Backends
//!
//! - **SQLite** (default): Embedded database, shared by worker and scheduler processes
//! - **In-Memory**: No persistence, for tests and single-process runs
//!
//! ## Usage
//!
//! ```no_run
//! use endpoint_monitoring::storage::{StorageBackend, sqlite::SqliteBackend};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = SqliteBackend::new("./monitoring.db").await?;
//!     let open = backend.count_open_incidents().await?;
//!     println!("{open} open incidents");
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod error;
pub mod memory;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

pub use backend::{HealthStatus, StorageBackend};
pub use error::{StorageError, StorageResult};
pub use memory::MemoryBackend;
