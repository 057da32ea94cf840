//! Declared table schemas.
//!
//! Schemas arrive as JSON (usually a string column in the job metadata) using the
//! `name`/`type`/`mode`/`fields` vocabulary. [`TableSchema::from_json`] validates them into a
//! closed [`FieldType`] so the rest of the crate never deals with raw tags.

use crate::error::{Error, Result};
use crate::registry::ScalarType;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Field mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// May be null
    Nullable,
    /// Expected to be present
    Required,
    /// A list of values of the field's type
    Repeated,
}

impl Mode {
    /// Parse a mode tag.
    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag.trim().to_ascii_uppercase().as_str() {
            "NULLABLE" => Ok(Mode::Nullable),
            "REQUIRED" => Ok(Mode::Required),
            "REPEATED" => Ok(Mode::Repeated),
            _ => Err(Error::invalid_schema(format!("Invalid field mode: {}", tag))),
        }
    }

    /// Canonical tag.
    pub fn tag(&self) -> &'static str {
        match self {
            Mode::Nullable => "NULLABLE",
            Mode::Required => "REQUIRED",
            Mode::Repeated => "REPEATED",
        }
    }
}

/// Type of a field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    /// A scalar handled by the type registry
    Scalar(ScalarType),
    /// A nested record with its own ordered fields
    Record(Vec<FieldSchema>),
}

impl FieldType {
    /// Canonical tag.
    pub fn tag(&self) -> &'static str {
        match self {
            FieldType::Scalar(s) => s.tag(),
            FieldType::Record(_) => "RECORD",
        }
    }
}

/// One destination column (or nested field).
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSchema {
    /// Field name, unique within its nesting level
    pub name: String,
    /// Field type
    pub field_type: FieldType,
    /// Field mode
    pub mode: Mode,
    /// Part of the destination primary key
    pub is_primary_key: bool,
}

impl FieldSchema {
    /// Create a nullable scalar field.
    pub fn scalar(name: impl Into<String>, scalar: ScalarType) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::Scalar(scalar),
            mode: Mode::Nullable,
            is_primary_key: false,
        }
    }

    /// Create a nullable record field.
    pub fn record(name: impl Into<String>, fields: Vec<FieldSchema>) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::Record(fields),
            mode: Mode::Nullable,
            is_primary_key: false,
        }
    }

    /// Set the mode.
    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Mark as primary key column.
    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self
    }

    /// Whether the destination stores this field as a JSON document.
    pub fn is_structured(&self) -> bool {
        self.mode == Mode::Repeated || matches!(self.field_type, FieldType::Record(_))
    }
}

/// Field as written in job metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Field name
    pub name: String,
    /// Type tag
    #[serde(rename = "type")]
    pub field_type: String,
    /// Mode tag
    #[serde(default)]
    pub mode: Option<String>,
    /// Nested fields for `RECORD`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<FieldSpec>>,
    /// Primary key flag
    #[serde(default)]
    pub is_primary_key: bool,
}

impl TryFrom<FieldSpec> for FieldSchema {
    type Error = Error;

    fn try_from(spec: FieldSpec) -> Result<Self> {
        let mode = match spec.mode.as_deref() {
            Some(tag) => Mode::from_tag(tag)?,
            None => {
                return Err(Error::invalid_schema(format!(
                    "Field '{}' has no mode",
                    spec.name
                )));
            }
        };

        let field_type = if spec.field_type.trim().eq_ignore_ascii_case("RECORD") {
            let nested = spec.fields.unwrap_or_default();
            if nested.is_empty() {
                return Err(Error::invalid_schema(format!(
                    "RECORD field '{}' must declare its fields",
                    spec.name
                )));
            }
            FieldType::Record(convert_fields(nested)?)
        } else {
            let scalar = ScalarType::from_tag(&spec.field_type).map_err(|_| {
                Error::invalid_schema(format!(
                    "Invalid field type: {} (field '{}')",
                    spec.field_type, spec.name
                ))
            })?;
            FieldType::Scalar(scalar)
        };

        Ok(FieldSchema {
            name: spec.name,
            field_type,
            mode,
            is_primary_key: spec.is_primary_key,
        })
    }
}

impl From<&FieldSchema> for FieldSpec {
    fn from(field: &FieldSchema) -> Self {
        FieldSpec {
            name: field.name.clone(),
            field_type: field.field_type.tag().to_string(),
            mode: Some(field.mode.tag().to_string()),
            fields: match &field.field_type {
                FieldType::Record(nested) => Some(nested.iter().map(FieldSpec::from).collect()),
                FieldType::Scalar(_) => None,
            },
            is_primary_key: field.is_primary_key,
        }
    }
}

fn convert_fields(specs: Vec<FieldSpec>) -> Result<Vec<FieldSchema>> {
    let mut seen = HashSet::new();
    let mut fields = Vec::with_capacity(specs.len());
    for spec in specs {
        if !seen.insert(spec.name.clone()) {
            return Err(Error::invalid_schema(format!(
                "Duplicate field name: {}",
                spec.name
            )));
        }
        fields.push(FieldSchema::try_from(spec)?);
    }
    Ok(fields)
}

/// Ordered list of destination columns.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TableSchema {
    fields: Vec<FieldSchema>,
}

impl TableSchema {
    /// Build from already validated fields.
    pub fn new(fields: Vec<FieldSchema>) -> Result<Self> {
        let mut seen = HashSet::new();
        for field in &fields {
            if !seen.insert(field.name.as_str()) {
                return Err(Error::invalid_schema(format!(
                    "Duplicate field name: {}",
                    field.name
                )));
            }
        }
        Ok(Self { fields })
    }

    /// Validate raw field specs.
    pub fn from_specs(specs: Vec<FieldSpec>) -> Result<Self> {
        Ok(Self {
            fields: convert_fields(specs)?,
        })
    }

    /// Parse a JSON-encoded schema (an array of field specs).
    pub fn from_json(json: &str) -> Result<Self> {
        let specs: Vec<FieldSpec> = serde_json::from_str(json)
            .map_err(|e| Error::invalid_schema(format!("Schema is not valid JSON: {}", e)))?;
        Self::from_specs(specs)
    }

    /// Build a schema from introspected `(column_name, declared_type)` pairs.
    ///
    /// Every column is `NULLABLE`; columns listed in `key_columns` become the primary key.
    pub fn from_introspection(columns: &[IntrospectedColumn], key_columns: &[String]) -> Self {
        let fields = columns
            .iter()
            .map(|c| FieldSchema {
                name: c.name.clone(),
                field_type: FieldType::Scalar(c.scalar_type()),
                mode: Mode::Nullable,
                is_primary_key: key_columns.iter().any(|k| k == &c.name),
            })
            .collect();
        Self { fields }
    }

    /// Copy of the schema without the named top-level columns.
    pub fn without_fields(&self, names: &[String]) -> Self {
        Self {
            fields: self
                .fields
                .iter()
                .filter(|f| !names.contains(&f.name))
                .cloned()
                .collect(),
        }
    }

    /// Fields in column order.
    pub fn fields(&self) -> &[FieldSchema] {
        &self.fields
    }

    /// Get a field by name.
    pub fn get(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Column names in order.
    pub fn column_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    /// Primary key columns in order.
    pub fn primary_key(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|f| f.is_primary_key)
            .map(|f| f.name.as_str())
            .collect()
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the schema has no columns.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Serialize back to the metadata JSON vocabulary.
    pub fn to_json(&self) -> String {
        let specs: Vec<FieldSpec> = self.fields.iter().map(FieldSpec::from).collect();
        serde_json::to_string(&specs).unwrap_or_else(|_| "[]".to_string())
    }
}

impl fmt::Display for TableSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cols: Vec<String> = self
            .fields
            .iter()
            .map(|c| format!("{} {}", c.name, c.field_type.tag()))
            .collect();
        write!(f, "({})", cols.join(", "))
    }
}

/// Schema introspection result from a relational source.
#[derive(Debug, Clone, PartialEq)]
pub struct IntrospectedColumn {
    /// Column name
    pub name: String,
    /// Declared database type
    pub declared_type: String,
}

impl IntrospectedColumn {
    /// Create a new introspected column.
    pub fn new(name: impl Into<String>, declared_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            declared_type: declared_type.into(),
        }
    }

    /// Map the declared database type to a scalar type tag.
    pub fn scalar_type(&self) -> ScalarType {
        scalar_from_declared(&self.declared_type)
    }
}

/// Map a relational declared type (PostgreSQL, MySQL or SQL Server vocabulary) to a scalar type.
pub fn scalar_from_declared(declared: &str) -> ScalarType {
    let normalized = declared.trim().to_lowercase();
    match normalized.as_str() {
        "boolean" | "bool" | "bit" => ScalarType::Boolean,
        "smallint" | "int2" | "integer" | "int" | "int4" | "bigint" | "int8" | "tinyint"
        | "mediumint" | "serial" | "bigserial" => ScalarType::Integer,
        "real" | "float4" | "double precision" | "float8" | "float" | "double" | "money" => {
            ScalarType::Float
        }
        "date" => ScalarType::Date,
        "time" | "time without time zone" | "time with time zone" | "timetz" => ScalarType::Time,
        "timestamp"
        | "timestamp without time zone"
        | "timestamp with time zone"
        | "timestamptz"
        | "datetime"
        | "datetime2"
        | "smalldatetime" => ScalarType::Timestamp,
        "json" | "jsonb" => ScalarType::JsonString,
        s if s.starts_with("numeric") || s.starts_with("decimal") => ScalarType::Float,
        _ => ScalarType::String,
    }
}
