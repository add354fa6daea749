//! Parameter binding for database queries.
//!
//! Raw statements bind `SqlValue`s as they come. Routine arguments are bound
//! by their declared catalog type so the server sees the width it expects.

use crate::error::{PortalError, PortalResult};
use crate::models::{BoundArg, SqlType, SqlValue};
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::sqlite::SqliteArguments;
use sqlx::{MySql, Postgres, Sqlite};

type MySqlQuery<'q> = sqlx::query::Query<'q, MySql, MySqlArguments>;
type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;
type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// Bind a value to a MySQL query.
pub(crate) fn bind_mysql_value<'q>(query: MySqlQuery<'q>, value: &'q SqlValue) -> MySqlQuery<'q> {
    match value {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Bool(v) => query.bind(*v),
        SqlValue::Int(v) => query.bind(*v),
        SqlValue::Float(v) => query.bind(*v),
        SqlValue::Text(v) => query.bind(v.as_str()),
        SqlValue::Bytes(v) => query.bind(v.as_slice()),
    }
}

/// Bind a value to a PostgreSQL query.
pub(crate) fn bind_postgres_value<'q>(query: PgQuery<'q>, value: &'q SqlValue) -> PgQuery<'q> {
    match value {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Bool(v) => query.bind(*v),
        SqlValue::Int(v) => query.bind(*v),
        SqlValue::Float(v) => query.bind(*v),
        SqlValue::Text(v) => query.bind(v.as_str()),
        SqlValue::Bytes(v) => query.bind(v.as_slice()),
    }
}

/// Bind a value to a SQLite query.
pub(crate) fn bind_sqlite_value<'q>(query: SqliteQuery<'q>, value: &'q SqlValue) -> SqliteQuery<'q> {
    match value {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Bool(v) => query.bind(*v),
        SqlValue::Int(v) => query.bind(*v),
        SqlValue::Float(v) => query.bind(*v),
        SqlValue::Text(v) => query.bind(v.as_str()),
        SqlValue::Bytes(v) => query.bind(v.as_slice()),
    }
}

fn narrow<T: TryFrom<i64>>(arg: &BoundArg, v: i64) -> PortalResult<T> {
    T::try_from(v).map_err(|_| {
        PortalError::invalid_input(format!(
            "Value {} is out of range for parameter {} ({})",
            v, arg.name, arg.sql_type
        ))
    })
}

/// Bind a routine argument to a MySQL query.
///
/// MySQL coerces on the server; only integer widths are checked here.
pub(crate) fn bind_mysql_arg<'q>(query: MySqlQuery<'q>, arg: &'q BoundArg) -> PortalResult<MySqlQuery<'q>> {
    Ok(match (&arg.sql_type, &arg.value) {
        (SqlType::TinyInt, SqlValue::Int(v)) => query.bind(narrow::<i8>(arg, *v)?),
        (SqlType::SmallInt, SqlValue::Int(v)) => query.bind(narrow::<i16>(arg, *v)?),
        (SqlType::Int, SqlValue::Int(v)) => query.bind(narrow::<i32>(arg, *v)?),
        (SqlType::Bit, SqlValue::Int(v)) => query.bind(*v != 0),
        (SqlType::Decimal | SqlType::Float, SqlValue::Int(v)) => query.bind(*v as f64),
        (_, value) => bind_mysql_value(query, value),
    })
}

/// Bind a routine argument to a PostgreSQL query.
///
/// Placeholders carry an explicit cast, so the bound Rust type only has to be
/// castable to the declared type.
pub(crate) fn bind_postgres_arg<'q>(query: PgQuery<'q>, arg: &'q BoundArg) -> PortalResult<PgQuery<'q>> {
    Ok(match (&arg.sql_type, &arg.value) {
        (SqlType::TinyInt | SqlType::SmallInt, SqlValue::Int(v)) => {
            query.bind(narrow::<i16>(arg, *v)?)
        }
        (SqlType::Int, SqlValue::Int(v)) => query.bind(narrow::<i32>(arg, *v)?),
        (SqlType::Bit, SqlValue::Int(v)) => query.bind(*v != 0),
        (SqlType::Decimal | SqlType::Float, SqlValue::Int(v)) => query.bind(*v as f64),
        (_, value) => bind_postgres_value(query, value),
    })
}
