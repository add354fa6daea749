//! Stored-procedure invoker.
//!
//! Calls are bound against the routine signature discovered from the catalog.
//! Binding fails closed: a missing, unknown or mistyped parameter is a
//! `ParameterMismatch` and nothing is executed. A signature served from cache
//! gets one chance to be refreshed before the mismatch is reported.

use crate::db::{Connector, ConnectionRegistry, SignatureCache, SqlBackend};
use crate::diagnostics::DebugLog;
use crate::error::{PortalError, PortalResult};
use crate::models::{
    BoundArg, ConnectionTarget, ParamMode, ProcedureCall, ProcedureName, ProcedureParam,
    ProcedureSignature, Record, ResultSet, SqlValue, TargetKey, normalize_param_name,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Runs stored procedures on registry-managed connections.
pub struct ProcedureInvoker<C: Connector> {
    registry: ConnectionRegistry<C>,
    signatures: Arc<SignatureCache>,
    debug_log: Arc<DebugLog>,
    query_timeout: Duration,
}

impl<C: Connector> Clone for ProcedureInvoker<C> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            signatures: Arc::clone(&self.signatures),
            debug_log: Arc::clone(&self.debug_log),
            query_timeout: self.query_timeout,
        }
    }
}

impl<C> ProcedureInvoker<C>
where
    C: Connector,
    C::Pool: SqlBackend,
{
    pub fn new(
        registry: ConnectionRegistry<C>,
        signatures: Arc<SignatureCache>,
        debug_log: Arc<DebugLog>,
        query_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            signatures,
            debug_log,
            query_timeout,
        }
    }

    pub fn debug_log(&self) -> &Arc<DebugLog> {
        &self.debug_log
    }

    /// Drop cached signatures for a target whose connection details changed.
    pub async fn forget_target(&self, target: &ConnectionTarget) {
        self.signatures.invalidate_target(&target.key()).await;
    }

    /// Call a procedure and return the result set selected by `call.result_set`.
    ///
    /// A procedure that returns no result sets yields an empty vector for
    /// index 0; any other out-of-range index is `InvalidInput`.
    pub async fn invoke(
        &self,
        target: &ConnectionTarget,
        call: &ProcedureCall,
    ) -> PortalResult<Vec<Record>> {
        let sets = self.observe(target, call, Some(call.result_set)).await?;
        select_result_set(sets, call.result_set, &call.procedure)
    }

    /// Call a procedure and return every result set it produced.
    pub async fn invoke_all(
        &self,
        target: &ConnectionTarget,
        call: &ProcedureCall,
    ) -> PortalResult<Vec<ResultSet>> {
        self.observe(target, call, None).await
    }

    /// Run a call and record its outcome. A requested result set that the
    /// procedure did not produce is recorded as a failure.
    async fn observe(
        &self,
        target: &ConnectionTarget,
        call: &ProcedureCall,
        wanted: Option<usize>,
    ) -> PortalResult<Vec<ResultSet>> {
        let started = Instant::now();
        let result = self.run(target, call).await.and_then(|sets| match wanted {
            Some(index) => check_result_set(&sets, index, &call.procedure).map(|()| sets),
            None => Ok(sets),
        });
        let elapsed = started.elapsed();

        match &result {
            Ok(sets) => {
                debug!(
                    procedure = %call.procedure,
                    target = %target.summary(),
                    result_sets = sets.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Stored procedure completed"
                );
                self.debug_log
                    .record(call, target.summary(), Ok(sets), elapsed);
            }
            Err(err) => {
                warn!(
                    procedure = %call.procedure,
                    target = %target.summary(),
                    code = err.code(),
                    error = %err,
                    "Stored procedure failed"
                );
                self.debug_log
                    .record(call, target.summary(), Err(err), elapsed);
            }
        }
        result
    }

    async fn run(
        &self,
        target: &ConnectionTarget,
        call: &ProcedureCall,
    ) -> PortalResult<Vec<ResultSet>> {
        let name = ProcedureName::parse(&call.procedure)?;
        let backend = self.registry.acquire(target).await?;
        let key = target.key();

        let (signature, args) = self.bind(&backend, &key, &name, call).await?;
        backend
            .call_procedure(&signature, &args, self.query_timeout)
            .await
            .map_err(|err| err.in_procedure(name.as_str()))
    }

    /// Bind against the cached signature, refreshing it once on mismatch.
    async fn bind(
        &self,
        backend: &C::Pool,
        key: &TargetKey,
        name: &ProcedureName,
        call: &ProcedureCall,
    ) -> PortalResult<(Arc<ProcedureSignature>, Vec<BoundArg>)> {
        if let Some(cached) = self.signatures.get(key, name).await {
            match bind_arguments(&cached, call) {
                Ok(args) => return Ok((cached, args)),
                Err(err) => {
                    debug!(procedure = %name, error = %err, "Cached signature rejected call, re-reading catalog");
                    self.signatures.invalidate(key, name).await;
                }
            }
        }

        let described = timeout(self.query_timeout, backend.describe_procedure(name))
            .await
            .map_err(|_| PortalError::timeout("catalog lookup", self.query_timeout.as_secs()))?;
        let fresh = described?.ok_or_else(|| PortalError::procedure_not_found(name.as_str()))?;
        let fresh = self.signatures.insert(key, fresh).await;
        let args = bind_arguments(&fresh, call)?;
        Ok((fresh, args))
    }
}

/// Match call parameters to catalog parameters and order them by ordinal.
///
/// Names compare case-insensitively with any leading `@` removed. `INOUT`
/// parameters that were not supplied are bound as NULL.
pub fn bind_arguments(
    signature: &ProcedureSignature,
    call: &ProcedureCall,
) -> PortalResult<Vec<BoundArg>> {
    let procedure = signature.name.as_str();
    let mismatch = |detail: String| PortalError::parameter_mismatch(procedure, detail);

    let mut supplied: HashMap<String, &ProcedureParam> = HashMap::with_capacity(call.params.len());
    for param in &call.params {
        if supplied
            .insert(normalize_param_name(&param.name), param)
            .is_some()
        {
            return Err(mismatch(format!("parameter {} supplied more than once", param.name)));
        }
    }

    let mut declared: Vec<_> = signature
        .parameters
        .iter()
        .filter(|p| p.mode.is_input())
        .collect();
    declared.sort_by_key(|p| p.ordinal);

    let mut args = Vec::with_capacity(declared.len());
    for slot in declared {
        match supplied.remove(&normalize_param_name(&slot.name)) {
            Some(param) => {
                if !param.sql_type.matches_catalog(&slot.sql_type) {
                    return Err(mismatch(format!(
                        "parameter {} declared as {} but the routine expects {}",
                        slot.name, param.sql_type, slot.sql_type
                    )));
                }
                if !slot.sql_type.accepts(&param.value) {
                    return Err(mismatch(format!(
                        "{} value cannot be bound to parameter {} ({})",
                        param.value.type_name(),
                        slot.name,
                        slot.sql_type
                    )));
                }
                args.push(BoundArg {
                    name: slot.name.clone(),
                    sql_type: slot.sql_type.clone(),
                    value: param.value.clone(),
                });
            }
            None if slot.mode == ParamMode::In => {
                return Err(mismatch(format!("missing parameter {}", slot.name)));
            }
            None => args.push(BoundArg {
                name: slot.name.clone(),
                sql_type: slot.sql_type.clone(),
                value: SqlValue::Null,
            }),
        }
    }

    if !supplied.is_empty() {
        let mut unknown: Vec<&str> = supplied.values().map(|p| p.name.as_str()).collect();
        unknown.sort_unstable();
        return Err(mismatch(format!("unknown parameter(s): {}", unknown.join(", "))));
    }

    Ok(args)
}

fn check_result_set(sets: &[ResultSet], index: usize, procedure: &str) -> PortalResult<()> {
    if index < sets.len() || (sets.is_empty() && index == 0) {
        return Ok(());
    }
    Err(PortalError::invalid_input(format!(
        "Result set {} requested but {} returned {}",
        index,
        procedure,
        sets.len()
    )))
}

fn select_result_set(
    mut sets: Vec<ResultSet>,
    index: usize,
    procedure: &str,
) -> PortalResult<Vec<Record>> {
    check_result_set(&sets, index, procedure)?;
    if sets.is_empty() {
        return Ok(Vec::new());
    }
    Ok(sets.swap_remove(index))
}
