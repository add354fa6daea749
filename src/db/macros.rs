//! Database dispatch macro.
//!
//! Generates the `DbPool` match arms so per-engine code stays linear and
//! readable. Expands at compile time with zero runtime overhead.

/// Macro for generating database dispatch match arms.
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(pool, {
///     MySql(p) => mysql::fetch_rows(p, stmt, timeout).await,
///     Postgres(p) => postgres::fetch_rows(p, stmt, timeout).await,
///     SQLite(p) => sqlite::fetch_rows(p, stmt, timeout).await,
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($pool:expr, { $($variant:ident($p:ident) => $body:expr),+ $(,)? }) => {
        match $pool {
            $(
                $crate::db::pool::DbPool::$variant($p) => $body,
            )+
        }
    };
}

pub use impl_db_dispatch;
