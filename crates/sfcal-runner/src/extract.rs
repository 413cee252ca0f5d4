//! Extraction of survival fractions from one calibration record.
//!
//! A record is a JSON object keyed by channel. Each requested output column
//! names a path of keys from the channel entry down to a leaf object holding
//! `sf` (and nominally `sf_err`). Lookup failures never leave this module:
//! they become nulls in the table.
//!
//! The upstream analysis copied `sf` into the `_err` companion column instead
//! of reading `sf_err`. [`ErrorSource::Sf`] keeps that behaviour and is the
//! default; [`ErrorSource::SfErr`] reads the sibling `sf_err` instead.

use crate::ordered;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use sfcal_core::Table;
use std::borrow::Cow;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("calibration record must be a JSON object keyed by channel, found {found}")]
    NotAnObject { found: &'static str },
}

/// Which leaf key feeds the `<column>_err` companion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSource {
    /// Copy `sf` into `_err`, as the upstream tables do.
    #[default]
    Sf,
    /// Read the sibling `sf_err`; null when absent.
    SfErr,
}

/// How far a failed lookup reaches within one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureScope {
    /// The first failing column is nulled and the channel's remaining
    /// columns are skipped.
    #[default]
    Channel,
    /// Each column succeeds or fails on its own.
    Field,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExtractionPolicy {
    pub error_source: ErrorSource,
    pub failure_scope: FailureScope,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SfField {
    pub column: String,
    pub path: Vec<String>,
}

impl SfField {
    pub fn error_column(&self) -> String {
        format!("{}_err", self.column)
    }
}

/// Ordered mapping from output column to field path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SfFields(Vec<SfField>);

impl SfFields {
    pub fn new<I, C, P, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (C, P)>,
        C: Into<String>,
        P: IntoIterator<Item = K>,
        K: Into<String>,
    {
        Self(
            fields
                .into_iter()
                .map(|(column, path)| SfField {
                    column: column.into(),
                    path: path.into_iter().map(Into::into).collect(),
                })
                .collect(),
        )
    }

    pub fn iter(&self) -> impl Iterator<Item = &SfField> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Value columns in mapping order followed by their `_err` companions.
    pub fn table_columns(&self) -> Vec<String> {
        self.0
            .iter()
            .map(|f| f.column.clone())
            .chain(self.0.iter().map(SfField::error_column))
            .collect()
    }
}

impl<'de> Deserialize<'de> for SfFields {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pairs: Vec<(String, Vec<String>)> = ordered::entries(deserializer)?;
        Ok(Self::new(pairs))
    }
}

/// Why a field path could not be resolved for a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupFailure {
    MissingKey { depth: usize, key: String },
    NotAnObject { depth: usize, key: String },
    MissingSf,
    NotANumber { found: &'static str },
}

impl fmt::Display for LookupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LookupFailure::MissingKey { depth, key } => {
                write!(f, "key '{}' missing at depth {}", key, depth)
            }
            LookupFailure::NotAnObject { depth, key } => {
                write!(f, "cannot index '{}' at depth {}: not an object", key, depth)
            }
            LookupFailure::MissingSf => f.write_str("leaf has no 'sf'"),
            LookupFailure::NotANumber { found } => write!(f, "'sf' is {}, not a number", found),
        }
    }
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Follows `path` one key at a time from `node`.
pub fn walk_field_path<'a>(node: &'a Value, path: &[String]) -> Result<&'a Value, LookupFailure> {
    path.iter()
        .enumerate()
        .try_fold(node, |current, (depth, key)| match current {
            Value::Object(map) => map.get(key).ok_or_else(|| LookupFailure::MissingKey {
                depth,
                key: key.clone(),
            }),
            _ => Err(LookupFailure::NotAnObject {
                depth,
                key: key.clone(),
            }),
        })
}

fn numeric_or_null(value: &Value) -> Option<Value> {
    match value {
        Value::Number(_) | Value::Null => Some(value.clone()),
        _ => None,
    }
}

/// Resolves one field for a channel entry into `(sf, sf_err column value)`.
pub fn lookup_sf(
    channel: &Value,
    field: &SfField,
    error_source: ErrorSource,
) -> Result<(Value, Value), LookupFailure> {
    let leaf = walk_field_path(channel, &field.path)?;
    let sf = leaf.get("sf").ok_or(LookupFailure::MissingSf)?;
    let sf = numeric_or_null(sf).ok_or(LookupFailure::NotANumber {
        found: value_type_name(sf),
    })?;
    let err = match error_source {
        ErrorSource::Sf => sf.clone(),
        ErrorSource::SfErr => leaf
            .get("sf_err")
            .and_then(numeric_or_null)
            .unwrap_or(Value::Null),
    };
    Ok((sf, err))
}

/// Builds the per-channel table for `record`.
///
/// Rows follow the record's channel order and every channel gets a row,
/// even when none of its fields resolve.
pub fn construct_sf_table(
    record: &Value,
    fields: &SfFields,
    policy: ExtractionPolicy,
) -> Result<Table, ExtractError> {
    let channels = record.as_object().ok_or(ExtractError::NotAnObject {
        found: value_type_name(record),
    })?;
    let mut table = Table::with_columns("channel", fields.table_columns());
    for (channel, entry) in channels {
        table.ensure_row(channel);
        for field in fields.iter() {
            match lookup_sf(entry, field, policy.error_source) {
                Ok((sf, err)) => {
                    table.set(channel, &field.column, sf);
                    table.set(channel, &field.error_column(), err);
                }
                Err(failure) => {
                    debug!(channel = %channel, column = %field.column, %failure, "survival fraction unavailable");
                    table.set(channel, &field.column, Value::Null);
                    if policy.failure_scope == FailureScope::Channel {
                        break;
                    }
                }
            }
        }
    }
    Ok(table)
}

/// Replaces the non-finite literals Python's JSON writer emits (`NaN`,
/// `Infinity`, `-Infinity`) with `null` outside of strings.
pub fn sanitize_non_finite(text: &str) -> Cow<'_, str> {
    const LITERALS: [&str; 3] = ["-Infinity", "Infinity", "NaN"];
    if !LITERALS.iter().any(|lit| text.contains(lit)) {
        return Cow::Borrowed(text);
    }
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut rest = text;
    while let Some(c) = rest.chars().next() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
        } else if c == '"' {
            in_string = true;
        } else if let Some(lit) = LITERALS.iter().find(|lit| rest.starts_with(**lit)) {
            out.push_str("null");
            rest = &rest[lit.len()..];
            continue;
        }
        out.push(c);
        rest = &rest[c.len_utf8()..];
    }
    Cow::Owned(out)
}

/// One run's calibration record loaded from disk.
#[derive(Debug, Clone)]
pub struct SfRecord {
    path: PathBuf,
    data: Value,
}

impl SfRecord {
    pub fn load(path: &Path) -> Result<Self, ExtractError> {
        let text = fs::read_to_string(path).map_err(|source| ExtractError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let data = serde_json::from_str(&sanitize_non_finite(&text)).map_err(|source| {
            ExtractError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            data,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn construct_sf_table(
        &self,
        fields: &SfFields,
        policy: ExtractionPolicy,
    ) -> Result<Table, ExtractError> {
        construct_sf_table(&self.data, fields, policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tl_dep() -> SfFields {
        SfFields::new([("sf_TlDEP", ["results", "aoe", "low_side_sfs", "1592.5"])])
    }

    fn three_fields() -> SfFields {
        SfFields::new([
            ("sf_TlDEP", vec!["results", "aoe", "low_side_sfs", "1592.5"]),
            ("sf_SEP", vec!["results", "lq", "sfs", "2103.5"]),
            ("sf_FEP", vec!["results", "aoe", "low_side_sfs", "2614.5"]),
        ])
    }

    fn record() -> Value {
        json!({
            "ch1": {"results": {"aoe": {"low_side_sfs": {
                "1592.5": {"sf": 89.3, "sf_err": 0.5},
                "2614.5": {"sf": 99.1, "sf_err": 0.1}
            }}}},
            "ch2": {"results": {"lq": {"sfs": {"2103.5": {"sf": 7.2, "sf_err": 0.3}}}}}
        })
    }

    #[test]
    fn err_column_copies_sf_by_default() {
        let table = construct_sf_table(&record(), &tl_dep(), ExtractionPolicy::default()).expect("table");
        assert_eq!(table.columns(), ["sf_TlDEP", "sf_TlDEP_err"]);
        assert_eq!(table.get("ch1", "sf_TlDEP"), Some(&json!(89.3)));
        // upstream anomaly: the companion carries the same value, not sf_err
        assert_eq!(table.get("ch1", "sf_TlDEP_err"), Some(&json!(89.3)));
    }

    #[test]
    fn err_column_reads_sf_err_when_requested() {
        let policy = ExtractionPolicy {
            error_source: ErrorSource::SfErr,
            ..ExtractionPolicy::default()
        };
        let table = construct_sf_table(&record(), &tl_dep(), policy).expect("table");
        assert_eq!(table.get("ch1", "sf_TlDEP"), Some(&json!(89.3)));
        assert_eq!(table.get("ch1", "sf_TlDEP_err"), Some(&json!(0.5)));

        let no_err = json!({"ch9": {"leaf": {"sf": 12.0}}});
        let fields = SfFields::new([("sf_x", ["leaf"])]);
        let table = construct_sf_table(&no_err, &fields, policy).expect("table");
        assert_eq!(table.get("ch9", "sf_x"), Some(&json!(12.0)));
        assert_eq!(table.get("ch9", "sf_x_err"), Some(&Value::Null));
    }

    #[test]
    fn missing_branch_nulls_the_channel() {
        let table = construct_sf_table(&record(), &tl_dep(), ExtractionPolicy::default()).expect("table");
        assert_eq!(table.index(), ["ch1", "ch2"]);
        assert_eq!(table.get("ch2", "sf_TlDEP"), Some(&Value::Null));
        assert_eq!(table.get("ch2", "sf_TlDEP_err"), Some(&Value::Null));
    }

    #[test]
    fn channel_scope_skips_fields_after_first_failure() {
        let table =
            construct_sf_table(&record(), &three_fields(), ExtractionPolicy::default()).expect("table");
        assert_eq!(
            table.columns(),
            ["sf_TlDEP", "sf_SEP", "sf_FEP", "sf_TlDEP_err", "sf_SEP_err", "sf_FEP_err"]
        );
        // ch1: TlDEP resolves, SEP fails, FEP is never attempted
        assert_eq!(table.get("ch1", "sf_TlDEP"), Some(&json!(89.3)));
        assert_eq!(table.get("ch1", "sf_SEP"), Some(&Value::Null));
        assert_eq!(table.get("ch1", "sf_FEP"), Some(&Value::Null));
        assert_eq!(table.get("ch1", "sf_FEP_err"), Some(&Value::Null));
        // ch2: TlDEP fails first, SEP is present but skipped
        assert_eq!(table.get("ch2", "sf_SEP"), Some(&Value::Null));
        assert_eq!(table.get("ch2", "sf_SEP_err"), Some(&Value::Null));
    }

    #[test]
    fn field_scope_isolates_failures() {
        let policy = ExtractionPolicy {
            failure_scope: FailureScope::Field,
            ..ExtractionPolicy::default()
        };
        let table = construct_sf_table(&record(), &three_fields(), policy).expect("table");
        assert_eq!(table.get("ch1", "sf_SEP"), Some(&Value::Null));
        assert_eq!(table.get("ch1", "sf_FEP"), Some(&json!(99.1)));
        assert_eq!(table.get("ch2", "sf_TlDEP"), Some(&Value::Null));
        assert_eq!(table.get("ch2", "sf_SEP"), Some(&json!(7.2)));
        assert_eq!(table.get("ch2", "sf_FEP"), Some(&Value::Null));
    }

    #[test]
    fn walk_reports_which_level_failed() {
        let path: Vec<String> = ["results", "aoe", "low_side_sfs"].map(String::from).to_vec();
        let record = record();
        let ch2 = &record["ch2"];
        assert_eq!(
            walk_field_path(ch2, &path),
            Err(LookupFailure::MissingKey {
                depth: 1,
                key: "aoe".to_string()
            })
        );
        let flat = json!({"results": 3});
        assert_eq!(
            walk_field_path(&flat, &path),
            Err(LookupFailure::NotAnObject {
                depth: 1,
                key: "aoe".to_string()
            })
        );
        assert_eq!(walk_field_path(&flat, &[]), Ok(&flat));
    }

    #[test]
    fn leaf_must_hold_numeric_sf() {
        let field = SfField {
            column: "sf_x".to_string(),
            path: vec!["leaf".to_string()],
        };
        let missing = json!({"leaf": {"sf_err": 1.0}});
        assert_eq!(lookup_sf(&missing, &field, ErrorSource::Sf), Err(LookupFailure::MissingSf));
        let text = json!({"leaf": {"sf": "high"}});
        assert_eq!(
            lookup_sf(&text, &field, ErrorSource::Sf),
            Err(LookupFailure::NotANumber { found: "string" })
        );
        let scalar = json!({"leaf": 4});
        assert_eq!(lookup_sf(&scalar, &field, ErrorSource::Sf), Err(LookupFailure::MissingSf));
    }

    #[test]
    fn non_object_record_is_rejected() {
        let err = construct_sf_table(&json!([1, 2]), &tl_dep(), ExtractionPolicy::default())
            .expect_err("array record");
        assert!(matches!(err, ExtractError::NotAnObject { found: "array" }));
    }

    #[test]
    fn fields_deserialize_in_document_order() {
        let fields: SfFields = serde_json::from_str(
            r#"{"sf_z": ["a"], "sf_a": ["b", "c"], "sf_m": []}"#,
        )
        .expect("fields");
        let columns: Vec<&str> = fields.iter().map(|f| f.column.as_str()).collect();
        assert_eq!(columns, ["sf_z", "sf_a", "sf_m"]);
        assert_eq!(fields.iter().nth(1).map(|f| f.path.len()), Some(2));
    }

    #[test]
    fn sanitize_replaces_python_literals_outside_strings() {
        let raw = r#"{"a": NaN, "b": -Infinity, "c": "NaN \" Infinity", "d": [Infinity, 1]}"#;
        let clean = sanitize_non_finite(raw);
        assert_eq!(
            clean,
            r#"{"a": null, "b": null, "c": "NaN \" Infinity", "d": [null, 1]}"#
        );
        let parsed: Value = serde_json::from_str(&clean).expect("valid json");
        assert_eq!(parsed["c"], json!("NaN \" Infinity"));
        assert!(matches!(sanitize_non_finite("{\"a\": 1}"), Cow::Borrowed(_)));
    }

    #[test]
    fn record_loads_from_disk() {
        let root = std::env::temp_dir().join(format!(
            "sfcal_extract_test_{}_{}",
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&root).expect("temp dir");
        let path = root.join("l200-p07-r007-cal-par_pht.json");
        fs::write(
            &path,
            r#"{"ch1": {"results": {"aoe": {"low_side_sfs": {"1592.5": {"sf": NaN, "sf_err": NaN}}}}}}"#,
        )
        .expect("write");
        let record = SfRecord::load(&path).expect("load");
        assert_eq!(record.path(), path.as_path());
        let table = record
            .construct_sf_table(&tl_dep(), ExtractionPolicy::default())
            .expect("table");
        assert_eq!(table.get("ch1", "sf_TlDEP"), Some(&Value::Null));

        let err = SfRecord::load(&root.join("absent.json")).expect_err("missing");
        assert!(matches!(err, ExtractError::Io { .. }));
        let _ = fs::remove_dir_all(root);
    }
}
