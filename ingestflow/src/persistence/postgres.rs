//! `PostgreSQL` driver over the sync `postgres` client.
//!
//! The client drives its own internal runtime, so it must only be called
//! from blocking threads; the crate routes every call through
//! [`crate::worker::run_blocking`].

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use postgres::{Client, NoTls};

use super::driver::{Connection, Database, Dialect, Row, SqlValue};
use crate::config::DatabaseSettings;
use crate::errors::PersistenceError;

/// A `PostgreSQL` server reachable with a libpq-style connection string.
#[derive(Clone)]
pub struct PostgresDatabase {
    config: postgres::Config,
}

impl std::fmt::Debug for PostgresDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresDatabase")
            .field("host", &self.config.get_hosts())
            .field("dbname", &self.config.get_dbname())
            .finish_non_exhaustive()
    }
}

impl PostgresDatabase {
    /// Parses `connstr`, e.g. `"host=localhost dbname=ingestiondb user=postgres"`.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Connect`] if the string does not parse.
    pub fn new(connstr: &str) -> Result<Self, PersistenceError> {
        let config = connstr
            .parse::<postgres::Config>()
            .map_err(PersistenceError::connect)?;
        Ok(Self { config })
    }

    /// Takes host, port, database and credentials verbatim from `settings`.
    #[must_use]
    pub fn from_settings(settings: &DatabaseSettings) -> Self {
        let mut config = postgres::Config::new();
        config
            .host(&settings.host)
            .port(settings.port)
            .dbname(&settings.dbname)
            .user(&settings.user)
            .password(&settings.password);
        Self { config }
    }
}

impl Database for PostgresDatabase {
    fn connect(&self) -> Result<Box<dyn Connection>, PersistenceError> {
        let client = self
            .config
            .connect(NoTls)
            .map_err(PersistenceError::connect)?;
        Ok(Box::new(PostgresConnection { client }))
    }

    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }
}

struct PostgresConnection {
    client: Client,
}

impl ToSql for SqlValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            Self::Null => Ok(IsNull::Yes),
            Self::Int(v) if *ty == Type::INT4 => i32::try_from(*v)?.to_sql(ty, out),
            Self::Int(v) if *ty == Type::INT2 => i16::try_from(*v)?.to_sql(ty, out),
            Self::Int(v) => v.to_sql(ty, out),
            Self::Text(v) => v.to_sql(ty, out),
            Self::Timestamp(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn bind(params: &[SqlValue]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

fn column_value(row: &postgres::Row, idx: usize) -> Result<SqlValue, PersistenceError> {
    let ty = row.columns()[idx].type_();
    let value = if *ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(idx)?.map(SqlValue::Int)
    } else if *ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(idx)?
            .map(|v| SqlValue::Int(v.into()))
    } else if *ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(idx)?
            .map(|v| SqlValue::Int(v.into()))
    } else if *ty == Type::TIMESTAMPTZ {
        row.try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(SqlValue::Timestamp)
    } else if *ty == Type::TEXT || *ty == Type::VARCHAR || *ty == Type::BPCHAR || *ty == Type::NAME
    {
        row.try_get::<_, Option<String>>(idx)?.map(SqlValue::Text)
    } else {
        return Err(PersistenceError::Backend(format!(
            "unsupported column type {ty} at position {idx}"
        )));
    };
    Ok(value.unwrap_or(SqlValue::Null))
}

impl Connection for PostgresConnection {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, PersistenceError> {
        Ok(self.client.execute(sql, &bind(params))?)
    }

    fn fetch_all(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, PersistenceError> {
        let rows = self.client.query(sql, &bind(params))?;
        rows.iter()
            .map(|row| (0..row.len()).map(|idx| column_value(row, idx)).collect())
            .collect()
    }

    fn batch_execute(&mut self, sql: &str) -> Result<(), PersistenceError> {
        self.client.batch_execute(sql)?;
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<(), PersistenceError> {
        self.client.close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_connection_string() {
        let db = PostgresDatabase::new("host=localhost port=5432 dbname=ingestiondb user=u")
            .unwrap();
        assert_eq!(db.dialect(), Dialect::Postgres);
        assert_eq!(db.config.get_dbname(), Some("ingestiondb"));
    }

    #[test]
    fn test_from_settings() {
        let settings = DatabaseSettings {
            host: "db.internal".to_string(),
            dbname: "events".to_string(),
            ..DatabaseSettings::default()
        };
        let db = PostgresDatabase::from_settings(&settings);
        assert_eq!(db.config.get_dbname(), Some("events"));
        assert!(format!("{db:?}").contains("events"));
    }

    #[test]
    fn test_credentials_with_spaces_and_quotes() {
        let settings = DatabaseSettings {
            user: "ingest user".to_string(),
            password: r"p@ss w'rd\=1".to_string(),
            ..DatabaseSettings::default()
        };
        let direct = PostgresDatabase::from_settings(&settings);
        assert_eq!(direct.config.get_user(), Some("ingest user"));
        assert_eq!(direct.config.get_password(), Some(br"p@ss w'rd\=1".as_slice()));

        let parsed = PostgresDatabase::new(&settings.connection_string()).unwrap();
        assert_eq!(parsed.config.get_user(), Some("ingest user"));
        assert_eq!(parsed.config.get_password(), Some(br"p@ss w'rd\=1".as_slice()));
    }

    #[test]
    fn test_rejects_malformed_connection_string() {
        let err = PostgresDatabase::new("host=localhost port=notaport").unwrap_err();
        assert!(matches!(err, PersistenceError::Connect(_)));
    }

    #[test]
    fn test_null_binds_as_null() {
        let mut buf = BytesMut::new();
        let result = SqlValue::Null.to_sql(&Type::INT8, &mut buf).unwrap();
        assert!(matches!(result, IsNull::Yes));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_int_narrows_for_int4() {
        let mut buf = BytesMut::new();
        SqlValue::Int(7).to_sql(&Type::INT4, &mut buf).unwrap();
        assert_eq!(buf.len(), 4);

        let mut buf = BytesMut::new();
        assert!(SqlValue::Int(i64::MAX).to_sql(&Type::INT4, &mut buf).is_err());
    }
}
