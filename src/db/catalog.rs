//! Stored-routine catalog introspection and call rendering.
//!
//! Signatures are discovered from `INFORMATION_SCHEMA.ROUTINES` and
//! `INFORMATION_SCHEMA.PARAMETERS` rather than hard-coded, so the same call
//! works against ERP databases whose routines drifted between environments.
//! Discovered signatures are cached per target with a short TTL.
//!
//! # Architecture
//!
//! Catalog SQL lives in the `queries` submodule. The `mysql` and `postgres`
//! submodules expose the same `describe` / `call` pair; SQLite has no stored
//! routines and always reports "not found".

use crate::db::executor::timeout_error;
use crate::db::pool::DbPool;
use crate::db::types::RowToRecord;
use crate::error::{PortalError, PortalResult};
use crate::models::{
    BoundArg, Engine, ParamMode, ProcedureName, ProcedureSignature, ResultSet, RoutineKind,
    SignatureParam, SqlType, TargetKey,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

/// Read a routine signature from the catalog.
pub(crate) async fn describe(
    pool: &DbPool,
    name: &ProcedureName,
) -> PortalResult<Option<ProcedureSignature>> {
    debug!(procedure = %name, "Reading routine signature from catalog");
    crate::impl_db_dispatch!(pool, {
        MySql(p) => mysql::describe(p, name).await,
        Postgres(p) => postgres::describe(p, name).await,
        SQLite(_p) => Ok(None),
    })
}

/// Call a routine. `args` must already be in ordinal order.
pub(crate) async fn call(
    pool: &DbPool,
    signature: &ProcedureSignature,
    args: &[BoundArg],
    query_timeout: Duration,
) -> PortalResult<Vec<ResultSet>> {
    let sql = render_call(pool.engine(), signature);
    debug!(procedure = %signature.name, args = args.len(), "Calling routine");
    crate::impl_db_dispatch!(pool, {
        MySql(p) => mysql::call(p, &sql, args, query_timeout).await,
        Postgres(p) => postgres::call(p, &sql, signature.kind, args, query_timeout).await,
        SQLite(_p) => Err(PortalError::procedure_not_found(signature.name.as_str())),
    })
}

/// Render the statement text for a routine call.
///
/// Input parameters become placeholders. Output-only parameters become a
/// session variable on MySQL and `NULL` for Postgres procedures; Postgres
/// functions omit them.
pub fn render_call(engine: Engine, signature: &ProcedureSignature) -> String {
    let mut slots = Vec::with_capacity(signature.parameters.len());
    let mut placeholder = 0;

    for param in &signature.parameters {
        if param.mode.is_input() {
            placeholder += 1;
            slots.push(match engine {
                Engine::Postgres => match param.sql_type.pg_cast() {
                    Some(cast) => format!("${}::{}", placeholder, cast),
                    None => format!("${}", placeholder),
                },
                Engine::MySql | Engine::Sqlite => "?".to_string(),
            });
        } else {
            match (engine, signature.kind) {
                (Engine::Postgres, RoutineKind::Function) => {}
                (Engine::Postgres, RoutineKind::Procedure) => slots.push("NULL".to_string()),
                _ => slots.push(format!("@out_{}", param.ordinal)),
            }
        }
    }

    let args = slots.join(", ");
    match (engine, signature.kind) {
        (Engine::Postgres, RoutineKind::Function) => {
            format!("SELECT * FROM {}({})", signature.name, args)
        }
        _ => format!("CALL {}({})", signature.name, args),
    }
}

fn routine_kind(routine_type: &str) -> RoutineKind {
    if routine_type.eq_ignore_ascii_case("FUNCTION") {
        RoutineKind::Function
    } else {
        RoutineKind::Procedure
    }
}

// =============================================================================
// Signature Cache
// =============================================================================

struct CachedSignature {
    fetched_at: Instant,
    signature: Arc<ProcedureSignature>,
}

/// Discovered signatures keyed by target and lowercased routine name.
pub struct SignatureCache {
    ttl: Duration,
    entries: RwLock<HashMap<(TargetKey, String), CachedSignature>>,
}

impl SignatureCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn cache_key(target: &TargetKey, name: &ProcedureName) -> (TargetKey, String) {
        (target.clone(), name.as_str().to_ascii_lowercase())
    }

    /// Cached signature, if present and younger than the TTL.
    pub async fn get(
        &self,
        target: &TargetKey,
        name: &ProcedureName,
    ) -> Option<Arc<ProcedureSignature>> {
        let entries = self.entries.read().await;
        entries
            .get(&Self::cache_key(target, name))
            .filter(|cached| cached.fetched_at.elapsed() < self.ttl)
            .map(|cached| Arc::clone(&cached.signature))
    }

    pub async fn insert(
        &self,
        target: &TargetKey,
        signature: ProcedureSignature,
    ) -> Arc<ProcedureSignature> {
        let key = Self::cache_key(target, &signature.name);
        let signature = Arc::new(signature);
        self.entries.write().await.insert(
            key,
            CachedSignature {
                fetched_at: Instant::now(),
                signature: Arc::clone(&signature),
            },
        );
        signature
    }

    pub async fn invalidate(&self, target: &TargetKey, name: &ProcedureName) {
        self.entries
            .write()
            .await
            .remove(&Self::cache_key(target, name));
    }

    /// Drop every signature cached for a target.
    pub async fn invalidate_target(&self, target: &TargetKey) {
        self.entries.write().await.retain(|(key, _), _| key != target);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

// =============================================================================
// SQL Query Templates
// =============================================================================
//
// Catalog columns are cast to text: some servers report them as binary or
// domain types that would not decode into `String`.

mod queries {
    pub mod mysql {
        pub const ROUTINE: &str = r#"
            SELECT
                CAST(ROUTINE_NAME AS CHAR) AS routine_name,
                CAST(ROUTINE_TYPE AS CHAR) AS routine_type
            FROM INFORMATION_SCHEMA.ROUTINES
            WHERE ROUTINE_SCHEMA = COALESCE(?, DATABASE())
            AND ROUTINE_NAME = ?
            LIMIT 1
            "#;

        // ORDINAL_POSITION 0 is a function's return value
        pub const PARAMETERS: &str = r#"
            SELECT
                CAST(PARAMETER_NAME AS CHAR) AS parameter_name,
                CAST(ORDINAL_POSITION AS SIGNED) AS ordinal,
                CAST(DATA_TYPE AS CHAR) AS data_type,
                CAST(PARAMETER_MODE AS CHAR) AS parameter_mode
            FROM INFORMATION_SCHEMA.PARAMETERS
            WHERE SPECIFIC_SCHEMA = COALESCE(?, DATABASE())
            AND SPECIFIC_NAME = ?
            AND ORDINAL_POSITION > 0
            ORDER BY ORDINAL_POSITION
            "#;
    }

    pub mod postgres {
        // Overloads resolve to the first specific name
        pub const ROUTINE: &str = r#"
            SELECT
                specific_name::text AS specific_name,
                routine_type::text AS routine_type
            FROM information_schema.routines
            WHERE routine_schema = COALESCE($1::text, current_schema())
            AND lower(routine_name) = lower($2)
            ORDER BY specific_name
            LIMIT 1
            "#;

        pub const PARAMETERS: &str = r#"
            SELECT
                parameter_name::text AS parameter_name,
                ordinal_position::int AS ordinal,
                data_type::text AS data_type,
                parameter_mode::text AS parameter_mode
            FROM information_schema.parameters
            WHERE specific_schema = COALESCE($1::text, current_schema())
            AND specific_name = $2
            ORDER BY ordinal_position
            "#;
    }
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================

mod mysql {
    use super::*;
    use crate::db::params::bind_mysql_arg;
    use futures_util::TryStreamExt;
    use sqlx::mysql::MySqlRow;
    use sqlx::{Either, MySqlPool, Row};
    use tokio::time::timeout;

    /// MySQL may return VARBINARY instead of VARCHAR depending on charset configuration.
    fn get_optional_string(row: &MySqlRow, column: &str) -> Option<String> {
        row.try_get::<Option<String>, _>(column)
            .ok()
            .flatten()
            .or_else(|| {
                row.try_get::<Option<Vec<u8>>, _>(column)
                    .ok()
                    .flatten()
                    .and_then(|bytes| String::from_utf8(bytes).ok())
            })
    }

    pub async fn describe(
        pool: &MySqlPool,
        name: &ProcedureName,
    ) -> PortalResult<Option<ProcedureSignature>> {
        let routine = sqlx::query(queries::mysql::ROUTINE)
            .bind(name.schema())
            .bind(name.routine())
            .fetch_optional(pool)
            .await?;

        let Some(routine) = routine else {
            return Ok(None);
        };
        let routine_name =
            get_optional_string(&routine, "routine_name").unwrap_or_else(|| name.routine().into());
        let kind = routine_kind(&get_optional_string(&routine, "routine_type").unwrap_or_default());

        let rows = sqlx::query(queries::mysql::PARAMETERS)
            .bind(name.schema())
            .bind(&routine_name)
            .fetch_all(pool)
            .await?;

        let parameters = rows
            .iter()
            .map(|row| {
                let ordinal = row.try_get::<i64, _>("ordinal").unwrap_or_default();
                SignatureParam {
                    name: get_optional_string(row, "parameter_name").unwrap_or_default(),
                    ordinal: u32::try_from(ordinal).unwrap_or_default(),
                    sql_type: SqlType::from_catalog(
                        &get_optional_string(row, "data_type").unwrap_or_default(),
                    ),
                    mode: ParamMode::from_catalog(
                        get_optional_string(row, "parameter_mode").as_deref(),
                    ),
                }
            })
            .collect();

        Ok(Some(ProcedureSignature {
            name: name.clone(),
            kind,
            parameters,
        }))
    }

    /// Each result set is terminated by a status packet; the last one
    /// belongs to the CALL itself and carries no rows.
    pub async fn call(
        pool: &MySqlPool,
        sql: &str,
        args: &[BoundArg],
        query_timeout: Duration,
    ) -> PortalResult<Vec<ResultSet>> {
        let mut query = sqlx::query(sql);
        for arg in args {
            query = bind_mysql_arg(query, arg)?;
        }

        let collect = async move {
            let mut sets: Vec<ResultSet> = Vec::new();
            let mut current = ResultSet::new();
            #[allow(deprecated)]
            let mut stream = query.fetch_many(pool);
            while let Some(item) = stream.try_next().await? {
                match item {
                    Either::Left(_) => sets.push(std::mem::take(&mut current)),
                    Either::Right(row) => current.push(row.to_record()),
                }
            }
            if !current.is_empty() {
                sets.push(current);
            }
            if sets.last().is_some_and(Vec::is_empty) {
                sets.pop();
            }
            Ok::<_, sqlx::Error>(sets)
        };

        match timeout(query_timeout, collect).await {
            Ok(sets) => Ok(sets?),
            Err(_) => Err(timeout_error("procedure call", query_timeout)),
        }
    }
}

mod postgres {
    use super::*;
    use crate::db::params::bind_postgres_arg;
    use sqlx::{PgPool, Row};
    use tokio::time::timeout;

    pub async fn describe(
        pool: &PgPool,
        name: &ProcedureName,
    ) -> PortalResult<Option<ProcedureSignature>> {
        let routine = sqlx::query(queries::postgres::ROUTINE)
            .bind(name.schema())
            .bind(name.routine())
            .fetch_optional(pool)
            .await?;

        let Some(routine) = routine else {
            return Ok(None);
        };
        let specific_name: String = routine.try_get("specific_name")?;
        let routine_type: Option<String> = routine.try_get("routine_type")?;
        let kind = routine_kind(routine_type.as_deref().unwrap_or_default());

        let rows = sqlx::query(queries::postgres::PARAMETERS)
            .bind(name.schema())
            .bind(&specific_name)
            .fetch_all(pool)
            .await?;

        let mut parameters = Vec::with_capacity(rows.len());
        for row in &rows {
            let ordinal: i32 = row.try_get("ordinal")?;
            let param_name: Option<String> = row.try_get("parameter_name")?;
            let data_type: Option<String> = row.try_get("data_type")?;
            let mode: Option<String> = row.try_get("parameter_mode")?;
            parameters.push(SignatureParam {
                // Unnamed parameters can only be addressed positionally
                name: param_name.unwrap_or_else(|| format!("${}", ordinal)),
                ordinal: u32::try_from(ordinal).unwrap_or_default(),
                sql_type: SqlType::from_catalog(data_type.as_deref().unwrap_or_default()),
                mode: ParamMode::from_catalog(mode.as_deref()),
            });
        }

        Ok(Some(ProcedureSignature {
            name: name.clone(),
            kind,
            parameters,
        }))
    }

    /// Functions always yield one result set. Procedures yield one only when
    /// they return rows (INOUT values).
    pub async fn call(
        pool: &PgPool,
        sql: &str,
        kind: RoutineKind,
        args: &[BoundArg],
        query_timeout: Duration,
    ) -> PortalResult<Vec<ResultSet>> {
        let mut query = sqlx::query(sql);
        for arg in args {
            query = bind_postgres_arg(query, arg)?;
        }

        let rows = match timeout(query_timeout, query.fetch_all(pool)).await {
            Ok(rows) => rows?,
            Err(_) => return Err(timeout_error("procedure call", query_timeout)),
        };
        let set: ResultSet = rows.iter().map(RowToRecord::to_record).collect();

        Ok(match kind {
            RoutineKind::Function => vec![set],
            RoutineKind::Procedure if set.is_empty() => Vec::new(),
            RoutineKind::Procedure => vec![set],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ConnectionTarget;

    fn remission_signature(kind: RoutineKind) -> ProcedureSignature {
        ProcedureSignature {
            name: ProcedureName::parse("spGeneraRemisionCompra").unwrap(),
            kind,
            parameters: vec![
                SignatureParam {
                    name: "ID".into(),
                    ordinal: 1,
                    sql_type: SqlType::Int,
                    mode: ParamMode::In,
                },
                SignatureParam {
                    name: "Usuario".into(),
                    ordinal: 2,
                    sql_type: SqlType::Text,
                    mode: ParamMode::In,
                },
                SignatureParam {
                    name: "Folio".into(),
                    ordinal: 3,
                    sql_type: SqlType::Text,
                    mode: ParamMode::Out,
                },
            ],
        }
    }

    #[test]
    fn test_render_mysql_call() {
        let sql = render_call(Engine::MySql, &remission_signature(RoutineKind::Procedure));
        assert_eq!(sql, "CALL spGeneraRemisionCompra(?, ?, @out_3)");
    }

    #[test]
    fn test_render_postgres_procedure_and_function() {
        let sql = render_call(Engine::Postgres, &remission_signature(RoutineKind::Procedure));
        assert_eq!(
            sql,
            "CALL spGeneraRemisionCompra($1::integer, $2::varchar, NULL)"
        );

        let sql = render_call(Engine::Postgres, &remission_signature(RoutineKind::Function));
        assert_eq!(
            sql,
            "SELECT * FROM spGeneraRemisionCompra($1::integer, $2::varchar)"
        );
    }

    #[test]
    fn test_postgres_casts_keep_width_and_offset() {
        let signature = ProcedureSignature {
            name: ProcedureName::parse("portal_recepcion").unwrap(),
            kind: RoutineKind::Function,
            parameters: vec![
                SignatureParam {
                    name: "usuario".into(),
                    ordinal: 1,
                    sql_type: SqlType::from_catalog("character"),
                    mode: ParamMode::In,
                },
                SignatureParam {
                    name: "recibido".into(),
                    ordinal: 2,
                    sql_type: SqlType::from_catalog("timestamp with time zone"),
                    mode: ParamMode::In,
                },
                SignatureParam {
                    name: "capturado".into(),
                    ordinal: 3,
                    sql_type: SqlType::from_catalog("timestamp without time zone"),
                    mode: ParamMode::In,
                },
            ],
        };
        assert_eq!(
            render_call(Engine::Postgres, &signature),
            "SELECT * FROM portal_recepcion($1::bpchar, $2::timestamptz, $3::timestamp)"
        );
    }

    #[test]
    fn test_render_without_parameters() {
        let signature = ProcedureSignature {
            name: ProcedureName::parse("erp.spPing").unwrap(),
            kind: RoutineKind::Procedure,
            parameters: Vec::new(),
        };
        assert_eq!(render_call(Engine::MySql, &signature), "CALL erp.spPing()");
    }

    #[test]
    fn test_routine_kind() {
        assert_eq!(routine_kind("FUNCTION"), RoutineKind::Function);
        assert_eq!(routine_kind("PROCEDURE"), RoutineKind::Procedure);
        assert_eq!(routine_kind(""), RoutineKind::Procedure);
    }

    #[tokio::test]
    async fn test_cache_is_case_insensitive_and_per_target() {
        let cache = SignatureCache::new(Duration::from_secs(300));
        let acme = ConnectionTarget::sqlite("acme.db").key();
        let globex = ConnectionTarget::sqlite("globex.db").key();

        cache
            .insert(&acme, remission_signature(RoutineKind::Procedure))
            .await;

        let upper = ProcedureName::parse("SPGENERAREMISIONCOMPRA").unwrap();
        assert!(cache.get(&acme, &upper).await.is_some());
        assert!(cache.get(&globex, &upper).await.is_none());

        cache.invalidate(&acme, &upper).await;
        assert!(cache.get(&acme, &upper).await.is_none());
    }

    #[tokio::test]
    async fn test_cache_entries_expire() {
        let cache = SignatureCache::new(Duration::from_millis(10));
        let target = ConnectionTarget::sqlite("acme.db").key();
        let signature = remission_signature(RoutineKind::Procedure);
        let name = signature.name.clone();

        cache.insert(&target, signature).await;
        assert!(cache.get(&target, &name).await.is_some());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get(&target, &name).await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_target() {
        let cache = SignatureCache::new(Duration::from_secs(300));
        let target = ConnectionTarget::sqlite("acme.db").key();
        cache
            .insert(&target, remission_signature(RoutineKind::Procedure))
            .await;
        assert_eq!(cache.len().await, 1);

        cache.invalidate_target(&target).await;
        assert_eq!(cache.len().await, 0);
    }
}
