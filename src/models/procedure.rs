//! Stored-procedure call and catalog signature models.

use crate::error::{PortalError, PortalResult};
use crate::models::SqlValue;
use crate::models::is_identifier;
use serde::Serialize;

/// Declared SQL type family of a parameter.
///
/// Catalog type names vary per engine (`int4`, `integer`, `INT`); they are
/// normalized into these families before comparison.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlType {
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    Bit,
    Decimal,
    Float,
    Char,
    Text,
    Date,
    DateTime,
    /// Timestamp that keeps its UTC offset (`timestamptz`)
    DateTimeTz,
    Time,
    Uuid,
    Binary,
    Json,
    Other(String),
}

impl SqlType {
    /// Normalize a catalog `DATA_TYPE` into a type family.
    pub fn from_catalog(data_type: &str) -> Self {
        let lower = data_type.trim().to_lowercase();
        let base = lower.split('(').next().unwrap_or_default().trim();

        match base {
            "tinyint" => Self::TinyInt,
            "smallint" | "int2" => Self::SmallInt,
            "int" | "integer" | "int4" | "mediumint" | "serial" => Self::Int,
            "bigint" | "int8" | "bigserial" => Self::BigInt,
            "bit" | "bool" | "boolean" => Self::Bit,
            "decimal" | "numeric" | "money" | "smallmoney" => Self::Decimal,
            "float" | "float4" | "float8" | "real" | "double" | "double precision" => Self::Float,
            "char" | "nchar" | "character" | "bpchar" => Self::Char,
            "varchar" | "nvarchar" | "character varying" | "text" | "ntext" | "tinytext"
            | "mediumtext" | "longtext" | "enum" => Self::Text,
            "date" => Self::Date,
            "datetime" | "datetime2" | "smalldatetime" | "timestamp"
            | "timestamp without time zone" => Self::DateTime,
            "timestamp with time zone" | "timestamptz" | "datetimeoffset" => Self::DateTimeTz,
            "time" | "time without time zone" | "timetz" => Self::Time,
            "uuid" | "uniqueidentifier" => Self::Uuid,
            "binary" | "varbinary" | "blob" | "bytea" | "image" | "longblob" => Self::Binary,
            "json" | "jsonb" => Self::Json,
            _ => Self::Other(lower),
        }
    }

    /// Coarse family used for signature comparison.
    ///
    /// Integer widths, and text vs char, are compared as one family: engines
    /// report the same declaration differently across versions.
    fn family(&self) -> &str {
        match self {
            Self::TinyInt | Self::SmallInt | Self::Int | Self::BigInt => "integer",
            Self::Char | Self::Text => "text",
            Self::Bit => "bit",
            Self::Decimal => "decimal",
            Self::Float => "float",
            Self::Date => "date",
            Self::DateTime | Self::DateTimeTz => "datetime",
            Self::Time => "time",
            Self::Uuid => "uuid",
            Self::Binary => "binary",
            Self::Json => "json",
            Self::Other(name) => name,
        }
    }

    /// Whether a declared type matches the catalog's type for the same parameter.
    pub fn matches_catalog(&self, catalog: &SqlType) -> bool {
        self.family() == catalog.family()
    }

    /// Whether `value` can be bound to a parameter of this type.
    pub fn accepts(&self, value: &SqlValue) -> bool {
        match (self, value) {
            (_, SqlValue::Null) => true,
            (Self::TinyInt | Self::SmallInt | Self::Int | Self::BigInt, SqlValue::Int(_)) => true,
            (Self::Bit, SqlValue::Bool(_) | SqlValue::Int(0 | 1)) => true,
            (Self::Decimal | Self::Float, SqlValue::Int(_) | SqlValue::Float(_)) => true,
            (Self::Decimal, SqlValue::Text(s)) => s.trim().parse::<f64>().is_ok(),
            (
                Self::Char
                | Self::Text
                | Self::Date
                | Self::DateTime
                | Self::DateTimeTz
                | Self::Time
                | Self::Uuid
                | Self::Json
                | Self::Other(_),
                SqlValue::Text(_),
            ) => true,
            (Self::Binary, SqlValue::Bytes(_)) => true,
            _ => false,
        }
    }

    /// Postgres cast appended to a placeholder so overload resolution sees the declared type.
    pub fn pg_cast(&self) -> Option<&'static str> {
        match self {
            Self::TinyInt | Self::SmallInt => Some("smallint"),
            Self::Int => Some("integer"),
            Self::BigInt => Some("bigint"),
            Self::Bit => Some("boolean"),
            Self::Decimal => Some("numeric"),
            Self::Float => Some("double precision"),
            // `character` alone means character(1) and would truncate
            Self::Char => Some("bpchar"),
            Self::Text => Some("varchar"),
            Self::Date => Some("date"),
            Self::DateTime => Some("timestamp"),
            Self::DateTimeTz => Some("timestamptz"),
            Self::Time => Some("time"),
            Self::Uuid => Some("uuid"),
            Self::Binary => Some("bytea"),
            Self::Json => Some("jsonb"),
            Self::Other(_) => None,
        }
    }
}

impl std::fmt::Display for SqlType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Other(name) => write!(f, "{}", name),
            other => write!(f, "{}", other.family_display()),
        }
    }
}

impl SqlType {
    fn family_display(&self) -> &'static str {
        match self {
            Self::TinyInt => "tinyint",
            Self::SmallInt => "smallint",
            Self::Int => "int",
            Self::BigInt => "bigint",
            Self::Bit => "bit",
            Self::Decimal => "decimal",
            Self::Float => "float",
            Self::Char => "char",
            Self::Text => "varchar",
            Self::Date => "date",
            Self::DateTime => "datetime",
            Self::DateTimeTz => "datetimeoffset",
            Self::Time => "time",
            Self::Uuid => "uuid",
            Self::Binary => "varbinary",
            Self::Json => "json",
            Self::Other(_) => "other",
        }
    }
}

/// Validated, optionally schema-qualified routine name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ProcedureName(String);

impl ProcedureName {
    pub fn parse(name: &str) -> PortalResult<Self> {
        let segments: Vec<&str> = name.split('.').collect();
        if segments.len() > 2 || !segments.iter().all(|s| is_identifier(s)) {
            return Err(PortalError::invalid_input(format!(
                "Invalid stored procedure name: {:?}",
                name
            )));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Schema part, when qualified.
    pub fn schema(&self) -> Option<&str> {
        self.0.split_once('.').map(|(schema, _)| schema)
    }

    /// Unqualified routine name.
    pub fn routine(&self) -> &str {
        self.0
            .split_once('.')
            .map(|(_, name)| name)
            .unwrap_or(&self.0)
    }
}

impl std::fmt::Display for ProcedureName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One argument of a stored-procedure call.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcedureParam {
    pub name: String,
    pub sql_type: SqlType,
    pub value: SqlValue,
    /// Redacted in diagnostics
    pub sensitive: bool,
}

/// A stored-procedure invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcedureCall {
    pub procedure: String,
    pub params: Vec<ProcedureParam>,
    /// Which result set the caller wants (default: first)
    pub result_set: usize,
}

impl ProcedureCall {
    pub fn new(procedure: impl Into<String>) -> Self {
        Self {
            procedure: procedure.into(),
            params: Vec::new(),
            result_set: 0,
        }
    }

    pub fn param(mut self, name: &str, sql_type: SqlType, value: impl Into<SqlValue>) -> Self {
        self.params.push(ProcedureParam {
            name: name.to_string(),
            sql_type,
            value: value.into(),
            sensitive: false,
        });
        self
    }

    pub fn sensitive_param(
        mut self,
        name: &str,
        sql_type: SqlType,
        value: impl Into<SqlValue>,
    ) -> Self {
        self.params.push(ProcedureParam {
            name: name.to_string(),
            sql_type,
            value: value.into(),
            sensitive: true,
        });
        self
    }

    pub fn result_set(mut self, index: usize) -> Self {
        self.result_set = index;
        self
    }
}

/// Whether the routine is called with CALL or selected from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutineKind {
    Procedure,
    Function,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamMode {
    In,
    Out,
    InOut,
}

impl ParamMode {
    pub fn from_catalog(mode: Option<&str>) -> Self {
        match mode.map(|m| m.trim().to_ascii_uppercase()).as_deref() {
            Some("OUT") => Self::Out,
            Some("INOUT") => Self::InOut,
            _ => Self::In,
        }
    }

    pub fn is_input(&self) -> bool {
        matches!(self, Self::In | Self::InOut)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignatureParam {
    pub name: String,
    pub ordinal: u32,
    pub sql_type: SqlType,
    pub mode: ParamMode,
}

/// Parameter list of a routine as discovered from the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcedureSignature {
    pub name: ProcedureName,
    pub kind: RoutineKind,
    /// Sorted by ordinal
    pub parameters: Vec<SignatureParam>,
}

impl ProcedureSignature {
    pub fn input_count(&self) -> usize {
        self.parameters.iter().filter(|p| p.mode.is_input()).count()
    }
}

/// A call argument bound to its catalog slot.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundArg {
    pub name: String,
    pub sql_type: SqlType,
    pub value: SqlValue,
}

/// Strip SQL Server style `@` prefixes and compare case-insensitively.
pub fn normalize_param_name(name: &str) -> String {
    name.trim().trim_start_matches('@').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_type_from_catalog() {
        assert_eq!(SqlType::from_catalog("INT"), SqlType::Int);
        assert_eq!(SqlType::from_catalog("int4"), SqlType::Int);
        assert_eq!(SqlType::from_catalog("character varying"), SqlType::Text);
        assert_eq!(SqlType::from_catalog("varchar(50)"), SqlType::Text);
        assert_eq!(SqlType::from_catalog("numeric"), SqlType::Decimal);
        assert_eq!(SqlType::from_catalog("datetime2"), SqlType::DateTime);
        assert_eq!(
            SqlType::from_catalog("timestamp with time zone"),
            SqlType::DateTimeTz
        );
        assert_eq!(SqlType::from_catalog("bpchar"), SqlType::Char);
        assert_eq!(
            SqlType::from_catalog("geometry"),
            SqlType::Other("geometry".into())
        );
    }

    #[test]
    fn test_type_family_matching() {
        assert!(SqlType::Int.matches_catalog(&SqlType::BigInt));
        assert!(SqlType::Text.matches_catalog(&SqlType::Char));
        assert!(!SqlType::Int.matches_catalog(&SqlType::Text));
        assert!(!SqlType::Date.matches_catalog(&SqlType::DateTime));
        assert!(SqlType::DateTime.matches_catalog(&SqlType::DateTimeTz));
    }

    #[test]
    fn test_accepts() {
        assert!(SqlType::Int.accepts(&SqlValue::Int(1)));
        assert!(SqlType::Int.accepts(&SqlValue::Null));
        assert!(!SqlType::Int.accepts(&SqlValue::Text("1".into())));
        assert!(SqlType::Decimal.accepts(&SqlValue::Text("12.50".into())));
        assert!(!SqlType::Decimal.accepts(&SqlValue::Text("doce".into())));
        assert!(SqlType::Bit.accepts(&SqlValue::Int(1)));
        assert!(!SqlType::Bit.accepts(&SqlValue::Int(2)));
    }

    #[test]
    fn test_procedure_name_validation() {
        assert!(ProcedureName::parse("spGeneraRemisionCompra").is_ok());
        let qualified = ProcedureName::parse("dbo.spGeneraRemisionCompra").unwrap();
        assert_eq!(qualified.schema(), Some("dbo"));
        assert_eq!(qualified.routine(), "spGeneraRemisionCompra");

        assert!(ProcedureName::parse("sp; DROP TABLE x").is_err());
        assert!(ProcedureName::parse("a.b.c").is_err());
        assert!(ProcedureName::parse("").is_err());
    }

    #[test]
    fn test_param_mode_and_names() {
        assert_eq!(ParamMode::from_catalog(Some("inout")), ParamMode::InOut);
        assert_eq!(ParamMode::from_catalog(None), ParamMode::In);
        assert_eq!(normalize_param_name("@IdOrden"), "idorden");
    }

    #[test]
    fn test_call_builder() {
        let call = ProcedureCall::new("spX")
            .param("ID", SqlType::Int, 5)
            .sensitive_param("Password", SqlType::Text, "hunter2")
            .result_set(1);
        assert_eq!(call.params.len(), 2);
        assert!(call.params[1].sensitive);
        assert_eq!(call.result_set, 1);
    }
}
