//! Data model of one introspection call.
//!
//! Everything here is built fresh per query and dropped at the end of it.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use typeprobe_pg::{ErrorFields, FieldDescription};

/// Server-reported error about the query under inspection.
///
/// This is data, not a fault: the connection is idle-ready again by the time
/// a caller sees one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseError {
    /// Server routine (`R`), or the SQLSTATE when the routine is missing
    pub error_code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    /// 1-based character offset into the query
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sqlstate: Option<String>,
}

/// Code used for failures of the `EXPLAIN EXECUTE` step.
pub const EXPLAIN_FAILED: &str = "EXPLAIN_FAILED";

impl ParseError {
    pub fn from_server(fields: &ErrorFields) -> Self {
        let sqlstate = (!fields.code.is_empty()).then(|| fields.code.clone());
        Self {
            error_code: fields
                .routine
                .clone()
                .or_else(|| sqlstate.clone())
                .unwrap_or_default(),
            message: fields.message.clone(),
            hint: fields.hint.clone(),
            position: fields.position,
            sqlstate,
        }
    }

    pub fn explain_failed(message: impl Into<String>, sqlstate: Option<String>) -> Self {
        Self {
            error_code: EXPLAIN_FAILED.to_string(),
            message: message.into(),
            hint: None,
            position: None,
            sqlstate,
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.message, self.error_code)?;
        if let Some(position) = self.position {
            write!(f, " at position {}", position)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, " (hint: {})", hint)?;
        }
        Ok(())
    }
}

/// Result of a step that the server may reject as data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Outcome<T> {
    Ok(T),
    ServerError(ParseError),
}

impl<T> Outcome<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Ok(value) => Outcome::Ok(f(value)),
            Outcome::ServerError(e) => Outcome::ServerError(e),
        }
    }

    pub fn into_result(self) -> Result<T, ParseError> {
        match self {
            Outcome::Ok(value) => Ok(value),
            Outcome::ServerError(e) => Err(e),
        }
    }
}

/// One result column as described by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeField {
    pub name: String,
    pub table_oid: u32,
    /// `<= 0` for anything that is not a real table column
    pub column_attr: i16,
    pub type_oid: u32,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: i16,
}

impl TypeField {
    /// Table column this field reads, when it reads one directly.
    pub fn column_key(&self) -> Option<ColumnKey> {
        (self.column_attr > 0).then_some(ColumnKey {
            table_oid: self.table_oid,
            column_attr: self.column_attr,
        })
    }
}

impl From<FieldDescription> for TypeField {
    fn from(field: FieldDescription) -> Self {
        Self {
            name: field.name,
            table_oid: field.table_oid,
            column_attr: field.column_attr,
            type_oid: field.type_oid,
            type_size: field.type_size,
            type_modifier: field.type_modifier,
            format: field.format,
        }
    }
}

/// Parameter and result types of a prepared statement, as raw oids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeDescription {
    pub params: Vec<u32>,
    pub fields: Vec<TypeField>,
}

/// What the prober hands on: a description or the server's complaint.
pub type RawTypeData = Outcome<TypeDescription>;

/// One `pg_type` row, joined with at most one `pg_enum` label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeRow {
    pub oid: u32,
    pub type_name: String,
    /// `typtype`; `e` for enums
    pub type_kind: String,
    pub enum_label: Option<String>,
    /// `typcategory`; `A` for arrays
    pub type_category: String,
    /// `typelem`; 0 unless an array
    pub element_type_oid: u32,
}

/// A type a code generator can map to a host-language type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MappableType {
    Scalar {
        name: String,
    },
    Enum {
        name: String,
        labels: Vec<String>,
    },
    Array {
        name: String,
        #[serde(rename = "elementType")]
        element_type: Box<MappableType>,
    },
}

impl MappableType {
    pub fn scalar(name: impl Into<String>) -> Self {
        MappableType::Scalar { name: name.into() }
    }

    pub fn name(&self) -> &str {
        match self {
            MappableType::Scalar { name }
            | MappableType::Enum { name, .. }
            | MappableType::Array { name, .. } => name,
        }
    }
}

impl fmt::Display for MappableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MappableType::Scalar { name } => write!(f, "{}", name),
            MappableType::Enum { name, labels } => write!(f, "{}({})", name, labels.join("|")),
            MappableType::Array { element_type, .. } => write!(f, "{}[]", element_type),
        }
    }
}

/// Table oid plus attribute number: joins result fields to `pg_attribute`
/// and `pg_description` rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ColumnKey {
    pub table_oid: u32,
    pub column_attr: i16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnComment {
    pub table_oid: u32,
    pub column_attr: i16,
    pub comment: String,
}

impl ColumnComment {
    pub fn key(&self) -> ColumnKey {
        ColumnKey {
            table_oid: self.table_oid,
            column_attr: self.column_attr,
        }
    }
}

/// `pg_attribute` facts about one table column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnAttribute {
    pub name: String,
    pub not_null: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReturnType {
    pub return_name: String,
    pub column_name: String,
    #[serde(rename = "type")]
    pub type_: MappableType,
    pub nullable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamMetadata {
    pub params: Vec<MappableType>,
    /// 1-based placeholder index to caller-chosen name
    pub mapping: BTreeMap<usize, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryTypesResult {
    pub param_metadata: ParamMetadata,
    pub return_types: Vec<ReturnType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InferOptions {
    /// Prove executability with `EXPLAIN EXECUTE` before resolving types
    pub explain: bool,
}

impl Default for InferOptions {
    fn default() -> Self {
        Self { explain: true }
    }
}
