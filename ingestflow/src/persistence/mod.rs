//! Relational persistence: the driver contract, its drivers and the batch persister.
//!
//! The core only sees [`Database`] and [`Connection`]. `SQLite` is always
//! available; `PostgreSQL` is behind the `postgres` feature (on by default).

mod driver;
mod persister;
#[cfg(feature = "postgres")]
mod postgres;
mod sqlite;

pub use driver::{
    validate_identifier, with_transaction, Connection, Database, Dialect, Row, SqlValue,
};
pub use persister::{BatchPersister, SaveSummary};
#[cfg(feature = "postgres")]
pub use postgres::PostgresDatabase;
pub use sqlite::SqliteDatabase;

use std::sync::Arc;

use crate::config::{DatabaseBackend, DatabaseSettings};
#[cfg(not(feature = "postgres"))]
use crate::errors::ConfigurationError;
use crate::errors::IngestError;

/// Builds the database selected by `settings`. No connection is opened.
///
/// # Errors
///
/// Returns a configuration error if Postgres is selected in a build without
/// the `postgres` feature.
pub fn open_database(settings: &DatabaseSettings) -> Result<Arc<dyn Database>, IngestError> {
    match settings.backend {
        #[cfg(feature = "postgres")]
        DatabaseBackend::Postgres => Ok(Arc::new(PostgresDatabase::from_settings(settings))),
        #[cfg(not(feature = "postgres"))]
        DatabaseBackend::Postgres => Err(ConfigurationError::new(
            "postgres backend requested but ingestflow was built without the `postgres` feature",
        )
        .into()),
        DatabaseBackend::Sqlite => Ok(Arc::new(SqliteDatabase::new(settings.path.clone()))),
    }
}
