//! Stored-procedure call diagnostics.
//!
//! Every invocation is appended to a bounded ring buffer. Entries are tagged
//! with the correlation id of the request that made the call, so one
//! request's parameters never show up as another request's "last call".
//! Parameter values and result samples are redacted before they are stored.

use crate::error::PortalError;
use crate::models::{ProcedureCall, Record, ResultSet, SqlType, SqlValue, TargetSummary};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

tokio::task_local! {
    static CORRELATION_ID: String;
}

/// Run `fut` with `id` as the current correlation id.
pub async fn with_correlation_id<F: Future>(id: String, fut: F) -> F::Output {
    CORRELATION_ID.scope(id, fut).await
}

/// Correlation id of the current request, if any.
pub fn current_correlation_id() -> Option<String> {
    CORRELATION_ID.try_with(Clone::clone).ok()
}

const REDACTED: &str = "***";
const MAX_TEXT_CHARS: usize = 64;
const MAX_SAMPLE_ROWS: usize = 3;

/// Name fragments that mark a parameter or column as personal or secret.
const SENSITIVE_FRAGMENTS: &[&str] = &[
    "password",
    "pwd",
    "secret",
    "token",
    "email",
    "telefono",
    "phone",
    "comentario",
    "observaciones",
    "nota",
];

fn is_sensitive_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    SENSITIVE_FRAGMENTS.iter().any(|f| lower.contains(f))
}

fn truncate(text: &str) -> String {
    if text.chars().count() > MAX_TEXT_CHARS {
        let head: String = text.chars().take(MAX_TEXT_CHARS).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}

fn redact_value(value: &SqlValue) -> JsonValue {
    match value {
        SqlValue::Null => JsonValue::Null,
        SqlValue::Bool(v) => JsonValue::Bool(*v),
        SqlValue::Int(v) => JsonValue::from(*v),
        SqlValue::Float(v) => JsonValue::from(*v),
        SqlValue::Text(v) => JsonValue::String(truncate(v)),
        SqlValue::Bytes(v) => JsonValue::String(format!("<{} bytes>", v.len())),
    }
}

fn redact_record(record: &Record) -> Record {
    record
        .iter()
        .map(|(column, value)| {
            let value = if is_sensitive_name(column) {
                JsonValue::String(REDACTED.into())
            } else {
                match value {
                    JsonValue::String(s) => JsonValue::String(truncate(s)),
                    other => other.clone(),
                }
            };
            (column.clone(), value)
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RedactedParam {
    pub name: String,
    pub sql_type: SqlType,
    pub value: JsonValue,
}

/// What was called, where, and with which (redacted) arguments.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSummary {
    pub procedure: String,
    pub target: TargetSummary,
    pub params: Vec<RedactedParam>,
}

impl CallSummary {
    pub fn new(call: &ProcedureCall, target: TargetSummary) -> Self {
        let params = call
            .params
            .iter()
            .map(|p| RedactedParam {
                name: p.name.clone(),
                sql_type: p.sql_type.clone(),
                value: if p.sensitive || is_sensitive_name(&p.name) {
                    JsonValue::String(REDACTED.into())
                } else {
                    redact_value(&p.value)
                },
            })
            .collect();

        Self {
            procedure: call.procedure.clone(),
            target,
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallOutcome {
    Success {
        result_sets: usize,
        rows: usize,
        /// First rows of the first result set
        sample: Vec<Record>,
    },
    Failure {
        error_kind: String,
        message: String,
    },
}

impl CallOutcome {
    pub fn from_result(result: Result<&[ResultSet], &PortalError>) -> Self {
        match result {
            Ok(sets) => Self::Success {
                result_sets: sets.len(),
                rows: sets.iter().map(Vec::len).sum(),
                sample: sets
                    .first()
                    .map(|set| set.iter().take(MAX_SAMPLE_ROWS).map(redact_record).collect())
                    .unwrap_or_default(),
            },
            Err(err) => Self::Failure {
                error_kind: err.code().to_string(),
                message: err.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DebugEntry {
    pub sequence: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
    pub call: CallSummary,
    pub outcome: CallOutcome,
    pub elapsed_ms: u64,
}

/// Single-slot view of the newest call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DebugRecord {
    pub last_call: Option<CallSummary>,
    pub last_result: Option<CallOutcome>,
    pub last_error: Option<String>,
}

/// Bounded ring buffer of recent procedure calls.
#[derive(Debug)]
pub struct DebugLog {
    capacity: usize,
    next_sequence: AtomicU64,
    entries: Mutex<VecDeque<DebugEntry>>,
}

impl DebugLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next_sequence: AtomicU64::new(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an entry, evicting the oldest when full. Never fails.
    pub fn record(
        &self,
        call: &ProcedureCall,
        target: TargetSummary,
        result: Result<&[ResultSet], &PortalError>,
        elapsed: Duration,
    ) {
        if self.capacity == 0 {
            return;
        }

        let entry = DebugEntry {
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
            correlation_id: current_correlation_id(),
            recorded_at: Utc::now(),
            call: CallSummary::new(call, target),
            outcome: CallOutcome::from_result(result),
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        };

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Entries newest first, optionally only those from one request.
    pub fn recent(&self, limit: usize, correlation_id: Option<&str>) -> Vec<DebugEntry> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .rev()
            .filter(|e| correlation_id.is_none_or(|id| e.correlation_id.as_deref() == Some(id)))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn latest(&self) -> DebugRecord {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = entries.back() else {
            return DebugRecord::default();
        };

        let (last_result, last_error) = match &entry.outcome {
            CallOutcome::Success { .. } => (Some(entry.outcome.clone()), None),
            CallOutcome::Failure { message, .. } => (None, Some(message.clone())),
        };
        DebugRecord {
            last_call: Some(entry.call.clone()),
            last_result,
            last_error,
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DebugLog {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_DEBUG_CAPACITY)
    }
}
