//! Schema-driven record normalization.
//!
//! A [`Normalizer`] is built once per [`TableSchema`] and owned by the job that uses it. It turns
//! raw, possibly irregular source documents into [`NormalizedRecord`]s whose columns follow the
//! schema order exactly.

use crate::error::{BatchError, FieldError};
use crate::registry::{ScalarType, Value, is_blank, json_kind};
use crate::schema::{FieldSchema, FieldType, Mode, TableSchema};
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// Per-field conversion plan.
#[derive(Debug, Clone)]
enum FieldNormalizer {
    Scalar(ScalarType),
    Record(RecordNormalizer),
    Repeated(ListNormalizer),
}

impl FieldNormalizer {
    fn for_field(field: &FieldSchema) -> Self {
        match field.mode {
            Mode::Repeated => FieldNormalizer::Repeated(ListNormalizer::new(&field.field_type)),
            Mode::Nullable | Mode::Required => match &field.field_type {
                FieldType::Scalar(scalar) => FieldNormalizer::Scalar(*scalar),
                FieldType::Record(nested) => FieldNormalizer::Record(RecordNormalizer::new(nested)),
            },
        }
    }

    fn normalize(&self, raw: &JsonValue) -> Result<Value, FieldError> {
        match self {
            FieldNormalizer::Scalar(scalar) => scalar.coerce(raw),
            FieldNormalizer::Record(record) => record.normalize(raw),
            FieldNormalizer::Repeated(list) => list.normalize(raw),
        }
    }
}

/// Element plan of a repeated field; the field's own mode is ignored.
#[derive(Debug, Clone)]
enum ElementNormalizer {
    Scalar(ScalarType),
    Record(RecordNormalizer),
}

#[derive(Debug, Clone)]
struct ListNormalizer {
    element: ElementNormalizer,
}

impl ListNormalizer {
    fn new(field_type: &FieldType) -> Self {
        let element = match field_type {
            FieldType::Scalar(scalar) => ElementNormalizer::Scalar(*scalar),
            FieldType::Record(nested) => ElementNormalizer::Record(RecordNormalizer::new(nested)),
        };
        Self { element }
    }

    fn normalize(&self, raw: &JsonValue) -> Result<Value, FieldError> {
        let decoded;
        let mut data = raw;
        if let ElementNormalizer::Scalar(ScalarType::JsonString) = &self.element {
            // Only an encoded string decodes; anything else is an empty list
            decoded = match raw {
                JsonValue::String(text) => {
                    serde_json::from_str::<JsonValue>(text).unwrap_or(JsonValue::Array(vec![]))
                }
                _ => JsonValue::Array(vec![]),
            };
            data = &decoded;
        }

        let items = match data {
            // Plain strings are never treated as a set of values
            JsonValue::Null | JsonValue::String(_) => return Ok(Value::List(vec![])),
            JsonValue::Array(items) => items,
            other => {
                return Err(FieldError::TypeMismatch {
                    expected: "REPEATED",
                    found: json_kind(other),
                });
            }
        };

        items
            .iter()
            .filter(|item| !is_blank(item))
            .map(|item| match &self.element {
                ElementNormalizer::Scalar(scalar) => scalar.coerce(item),
                ElementNormalizer::Record(record) => record.normalize(item),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List)
    }
}

#[derive(Debug, Clone)]
struct RecordNormalizer {
    fields: HashMap<String, FieldNormalizer>,
}

impl RecordNormalizer {
    fn new(schema: &[FieldSchema]) -> Self {
        let fields = schema
            .iter()
            .map(|f| (f.name.clone(), FieldNormalizer::for_field(f)))
            .collect();
        Self { fields }
    }

    fn normalize(&self, raw: &JsonValue) -> Result<Value, FieldError> {
        let decoded;
        let mut data = raw;
        if let JsonValue::String(text) = raw {
            if !text.is_empty() {
                decoded = serde_json::from_str::<JsonValue>(text).map_err(|e| {
                    FieldError::Decode {
                        expected: "RECORD",
                        message: e.to_string(),
                    }
                })?;
                data = &decoded;
            }
        }

        let map = match data {
            JsonValue::Object(map) => map,
            other if is_falsy(other) => return Ok(Value::Record(BTreeMap::new())),
            other => {
                return Err(FieldError::TypeMismatch {
                    expected: "RECORD",
                    found: json_kind(other),
                });
            }
        };

        let mut result = BTreeMap::new();
        for (key, value) in map {
            let Some(normalizer) = self.fields.get(key) else {
                continue;
            };
            let normalized = normalizer.normalize(value).unwrap_or_else(|e| {
                debug!(field = %key, error = %e, "Nested field set to null");
                Value::Null
            });
            result.insert(key.clone(), normalized);
        }
        Ok(Value::Record(result))
    }
}

fn is_falsy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::Bool(b) => !b,
        JsonValue::Number(n) => n.as_f64() == Some(0.0),
        JsonValue::String(s) => s.is_empty(),
        JsonValue::Array(a) => a.is_empty(),
        JsonValue::Object(o) => o.is_empty(),
    }
}

/// One normalized row: every schema column, in schema order.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl NormalizedRecord {
    /// Rebuild a row from a staged `name -> value` map; absent columns become `Null`.
    pub fn from_map(columns: Arc<[String]>, mut map: BTreeMap<String, Value>) -> Self {
        let values = columns
            .iter()
            .map(|c| map.remove(c).unwrap_or(Value::Null))
            .collect();
        Self { columns, values }
    }

    /// Value of a column.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
    }

    /// Values in column order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Column names in order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// `(column, value)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(String::as_str).zip(self.values.iter())
    }

    /// Convert to a JSON object.
    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(
            self.iter()
                .map(|(k, v)| (k.to_string(), v.to_json()))
                .collect(),
        )
    }
}

impl Serialize for NormalizedRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (k, v) in self.iter() {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// Result of normalizing one batch.
#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    /// Records, in input order
    pub records: Vec<NormalizedRecord>,
    /// Number of field values replaced by null
    pub field_errors: usize,
}

impl NormalizedBatch {
    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the batch holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Normalization plan for one table schema.
#[derive(Debug, Clone)]
pub struct Normalizer {
    columns: Arc<[String]>,
    fields: Vec<FieldNormalizer>,
    index: HashMap<String, usize>,
}

impl Normalizer {
    /// Build the plan for a schema.
    pub fn new(schema: &TableSchema) -> Self {
        debug!("Generating normalizer for {} columns", schema.len());
        let columns: Arc<[String]> = schema.column_names().into();
        let fields = schema.fields().iter().map(FieldNormalizer::for_field).collect();
        let index = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.clone(), i))
            .collect();
        Self {
            columns,
            fields,
            index,
        }
    }

    /// Column names shared by every record this normalizer produces.
    pub fn columns(&self) -> Arc<[String]> {
        Arc::clone(&self.columns)
    }

    /// Normalize one raw record.
    ///
    /// Field failures are recovered as `null` and reported in the returned count.
    pub fn normalize_record(
        &self,
        index: usize,
        raw: &JsonValue,
    ) -> Result<(NormalizedRecord, usize), BatchError> {
        let map = raw.as_object().ok_or_else(|| BatchError::NotAMapping {
            index,
            found: json_kind(raw),
        })?;

        let mut values = vec![Value::Null; self.columns.len()];
        let mut failures = 0;
        for (key, value) in map {
            let Some(&pos) = self.index.get(key) else {
                continue;
            };
            match self.fields[pos].normalize(value) {
                Ok(normalized) => values[pos] = normalized,
                Err(e) => {
                    failures += 1;
                    warn!(
                        record = index,
                        field = %key,
                        value = %value,
                        error = %e,
                        "Field could not be normalized, storing null"
                    );
                }
            }
        }

        Ok((
            NormalizedRecord {
                columns: Arc::clone(&self.columns),
                values,
            },
            failures,
        ))
    }

    /// Normalize a batch of raw records.
    ///
    /// Field-level problems never fail the batch; a record that is not a mapping does.
    pub fn normalize_data(&self, data: &[JsonValue]) -> Result<NormalizedBatch, BatchError> {
        let mut batch = NormalizedBatch {
            records: Vec::with_capacity(data.len()),
            field_errors: 0,
        };
        for (i, raw) in data.iter().enumerate() {
            let (record, failures) = self.normalize_record(i, raw)?;
            batch.records.push(record);
            batch.field_errors += failures;
        }
        if batch.field_errors > 0 {
            warn!(
                "{} field values set to null while normalizing {} records",
                batch.field_errors,
                batch.records.len()
            );
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn schema(json: &str) -> TableSchema {
        TableSchema::from_json(json).unwrap()
    }

    fn orders() -> TableSchema {
        schema(
            r#"[
            {"name": "id", "type": "INTEGER", "mode": "REQUIRED", "is_primary_key": true},
            {"name": "tags", "type": "STRING", "mode": "REPEATED"},
            {"name": "address", "type": "RECORD", "mode": "NULLABLE", "fields": [
                {"name": "city", "type": "STRING", "mode": "NULLABLE"},
                {"name": "zip", "type": "INTEGER", "mode": "NULLABLE"}
            ]},
            {"name": "items", "type": "RECORD", "mode": "REPEATED", "fields": [
                {"name": "sku", "type": "STRING", "mode": "REQUIRED"},
                {"name": "qty", "type": "INTEGER", "mode": "NULLABLE"}
            ]},
            {"name": "codes", "type": "JSON_STRING", "mode": "REPEATED"},
            {"name": "price", "type": "FLOAT", "mode": "NULLABLE"}
        ]"#,
        )
    }

    #[test]
    fn test_end_to_end_example() {
        let schema = schema(
            r#"[{"name":"id","type":"INTEGER","mode":"REQUIRED","is_primary_key":true},
                {"name":"tags","type":"STRING","mode":"REPEATED"}]"#,
        );
        let normalizer = Normalizer::new(&schema);
        let batch = normalizer
            .normalize_data(&[json!({"id": "7", "tags": ["a", "", null, "b"]})])
            .unwrap();
        assert_eq!(batch.records[0].to_json(), json!({"id": 7, "tags": ["a", "b"]}));
        assert_eq!(batch.field_errors, 0);
    }

    #[test]
    fn test_row_follows_schema_order_with_explicit_nulls() {
        let normalizer = Normalizer::new(&orders());
        let batch = normalizer
            .normalize_data(&[json!({"price": "9.5", "id": 1, "unknown": true})])
            .unwrap();
        let record = &batch.records[0];
        assert_eq!(
            record.columns(),
            &["id", "tags", "address", "items", "codes", "price"]
        );
        assert_eq!(record.get("id"), Some(&Value::Integer(1)));
        assert_eq!(record.get("price"), Some(&Value::Float(9.5)));
        assert_eq!(record.get("address"), Some(&Value::Null));
        assert_eq!(record.get("unknown"), None);
    }

    #[test]
    fn test_field_failure_keeps_record() {
        let normalizer = Normalizer::new(&orders());
        let batch = normalizer
            .normalize_data(&[
                json!({"id": "not-a-number", "price": 1}),
                json!({"id": 2, "price": "cheap"}),
            ])
            .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.field_errors, 2);
        assert_eq!(batch.records[0].get("id"), Some(&Value::Null));
        assert_eq!(batch.records[0].get("price"), Some(&Value::Float(1.0)));
        assert_eq!(batch.records[1].get("id"), Some(&Value::Integer(2)));
        assert_eq!(batch.records[1].get("price"), Some(&Value::Null));
    }

    #[test]
    fn test_non_mapping_record_aborts_batch() {
        let normalizer = Normalizer::new(&orders());
        let err = normalizer
            .normalize_data(&[json!({"id": 1}), json!([1, 2, 3])])
            .unwrap_err();
        assert_eq!(
            err,
            BatchError::NotAMapping {
                index: 1,
                found: "array"
            }
        );
    }

    #[test]
    fn test_encoded_record_matches_decoded() {
        let normalizer = Normalizer::new(&orders());
        let decoded = json!({"id": 1, "address": {"city": "Hue", "zip": "530000", "x": 1}});
        let encoded = json!({"id": 1, "address": r#"{"city": "Hue", "zip": "530000", "x": 1}"#});
        let a = normalizer.normalize_data(&[decoded]).unwrap();
        let b = normalizer.normalize_data(&[encoded]).unwrap();
        assert_eq!(a.records, b.records);
        assert_eq!(
            a.records[0].get("address").unwrap().to_json(),
            json!({"city": "Hue", "zip": 530000})
        );
    }

    #[test]
    fn test_nested_missing_key_has_no_entry_and_failure_is_local() {
        let normalizer = Normalizer::new(&orders());
        let batch = normalizer
            .normalize_data(&[json!({"address": {"zip": "abc"}})])
            .unwrap();
        // The nested failure does not fail the top-level field
        assert_eq!(batch.field_errors, 0);
        assert_eq!(
            batch.records[0].get("address").unwrap().to_json(),
            json!({"zip": null})
        );
    }

    #[test]
    fn test_falsy_record_is_empty_mapping() {
        let normalizer = Normalizer::new(&orders());
        let batch = normalizer
            .normalize_data(&[json!({"address": null}), json!({"address": ""})])
            .unwrap();
        for record in &batch.records {
            assert_eq!(record.get("address").unwrap().to_json(), json!({}));
        }
    }

    #[test]
    fn test_undecodable_record_string_is_field_error() {
        let normalizer = Normalizer::new(&orders());
        let batch = normalizer
            .normalize_data(&[json!({"id": 3, "address": "{not json"})])
            .unwrap();
        assert_eq!(batch.field_errors, 1);
        assert_eq!(batch.records[0].get("address"), Some(&Value::Null));
        assert_eq!(batch.records[0].get("id"), Some(&Value::Integer(3)));
    }

    #[test]
    fn test_repeated_records() {
        let normalizer = Normalizer::new(&orders());
        let batch = normalizer
            .normalize_data(&[json!({"items": [
                {"sku": "A1", "qty": "2"},
                null,
                "",
                {"sku": "B2", "extra": 1}
            ]})])
            .unwrap();
        assert_eq!(
            batch.records[0].get("items").unwrap().to_json(),
            json!([{"sku": "A1", "qty": 2}, {"sku": "B2"}])
        );
    }

    #[test]
    fn test_string_lists_are_empty() {
        let normalizer = Normalizer::new(&orders());
        let batch = normalizer
            .normalize_data(&[json!({"tags": "a,b,c"}), json!({"tags": []}), json!({"tags": null})])
            .unwrap();
        for record in &batch.records {
            assert_eq!(record.get("tags"), Some(&Value::List(vec![])));
        }
    }

    #[test]
    fn test_json_string_list_decoding() {
        let normalizer = Normalizer::new(&orders());
        let batch = normalizer
            .normalize_data(&[
                json!({"codes": r#"["x", "", {"k": 1}]"#}),
                json!({"codes": "not json"}),
                json!({"codes": r#""just a string""#}),
            ])
            .unwrap();
        assert_eq!(
            batch.records[0].get("codes").unwrap().to_json(),
            json!(["x", r#"{"k":1}"#])
        );
        assert_eq!(batch.records[1].get("codes"), Some(&Value::List(vec![])));
        assert_eq!(batch.records[2].get("codes"), Some(&Value::List(vec![])));
    }

    #[test]
    fn test_json_string_list_needs_encoded_value() {
        let normalizer = Normalizer::new(&orders());
        let batch = normalizer
            .normalize_data(&[
                json!({"codes": ["x", "y"]}),
                json!({"codes": {"k": 1}}),
                json!({"codes": 42}),
            ])
            .unwrap();
        assert_eq!(batch.field_errors, 0);
        for record in &batch.records {
            assert_eq!(record.get("codes"), Some(&Value::List(vec![])));
        }
    }

    #[test]
    fn test_repeated_element_failure_nulls_field() {
        let normalizer = Normalizer::new(&orders());
        let schema = schema(r#"[{"name":"ns","type":"INTEGER","mode":"REPEATED"}]"#);
        let ints = Normalizer::new(&schema);
        let batch = ints.normalize_data(&[json!({"ns": ["1", "x"]})]).unwrap();
        assert_eq!(batch.field_errors, 1);
        assert_eq!(batch.records[0].get("ns"), Some(&Value::Null));

        let batch = normalizer.normalize_data(&[json!({"tags": {"a": 1}})]).unwrap();
        assert_eq!(batch.field_errors, 1);
    }

    #[test]
    fn test_serialize_keeps_column_order() {
        let normalizer = Normalizer::new(&orders());
        let batch = normalizer.normalize_data(&[json!({"price": 2, "id": 1})]).unwrap();
        let line = serde_json::to_string(&batch.records[0]).unwrap();
        assert_eq!(
            line,
            r#"{"id":1,"tags":null,"address":null,"items":null,"codes":null,"price":2.0}"#
        );
    }

    #[test]
    fn test_from_map_fills_missing_columns() {
        let columns: Arc<[String]> = vec!["a".to_string(), "b".to_string()].into();
        let mut map = BTreeMap::new();
        map.insert("b".to_string(), Value::Integer(1));
        map.insert("zzz".to_string(), Value::Integer(2));
        let record = NormalizedRecord::from_map(columns, map);
        assert_eq!(record.values(), &[Value::Null, Value::Integer(1)]);
    }

    fn raw_element() -> impl Strategy<Value = JsonValue> {
        prop_oneof![
            Just(JsonValue::Null),
            Just(json!("")),
            "[a-z]{1,8}".prop_map(JsonValue::String),
            any::<i32>().prop_map(|n| json!(n)),
        ]
    }

    proptest! {
        #[test]
        fn prop_repeated_never_contains_blank(items in prop::collection::vec(raw_element(), 0..20)) {
            let schema = schema(r#"[{"name":"tags","type":"STRING","mode":"REPEATED"}]"#);
            let normalizer = Normalizer::new(&schema);
            let batch = normalizer.normalize_data(&[json!({"tags": items})]).unwrap();
            match batch.records[0].get("tags").unwrap() {
                Value::List(values) => {
                    for v in values {
                        prop_assert!(!v.is_null());
                        prop_assert!(v != &Value::String(String::new()));
                    }
                }
                other => prop_assert!(false, "unexpected {:?}", other),
            }
        }

        #[test]
        fn prop_output_order_matches_input(ids in prop::collection::vec(any::<i64>(), 0..50)) {
            let schema = schema(r#"[{"name":"id","type":"INTEGER","mode":"REQUIRED"}]"#);
            let normalizer = Normalizer::new(&schema);
            let raw: Vec<JsonValue> = ids.iter().map(|i| json!({"id": i.to_string()})).collect();
            let batch = normalizer.normalize_data(&raw).unwrap();
            let out: Vec<Value> = batch.records.iter().map(|r| r.values()[0].clone()).collect();
            let expected: Vec<Value> = ids.into_iter().map(Value::Integer).collect();
            prop_assert_eq!(out, expected);
        }
    }
}
