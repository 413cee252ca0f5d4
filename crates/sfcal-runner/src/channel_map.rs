//! Channel maps: which detector sits behind each readout channel in a run.

use serde_json::Value;
use sfcal_core::{load_structured_file, ChannelId, Table, TableError};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub const GEDS: &str = "geds";
pub const CAL: &str = "cal";

#[derive(Debug, Error)]
pub enum ChannelMapError {
    #[error("channel map not found: {}", path.display())]
    NotFound { path: PathBuf },
    #[error("load {}: {source}", path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
    #[error("channel map entry '{entry}' has no daq.rawid")]
    MissingRawId { entry: String },
    #[error(transparent)]
    Table(#[from] TableError),
}

/// Arguments handed to a [`ChannelMapProvider`] for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMapQuery {
    pub system: String,
    pub experiment: String,
    pub period: String,
    pub run: u32,
    pub datatype: String,
    pub version: String,
    pub data_root: PathBuf,
}

pub trait ChannelMapProvider {
    /// One row per channel with at least a bare numeric `channel` and a
    /// detector `name`; any further columns are carried as metadata.
    fn channel_map(&self, query: &ChannelMapQuery) -> Result<Table, ChannelMapError>;
}

/// Indexes a provider table by canonical `ch<digits>` channel ids.
pub fn normalize_channel_map(raw: Table) -> Result<Table, ChannelMapError> {
    let indexed = raw.set_index("channel", |v| {
        ChannelId::from_raw(v).ok().map(String::from)
    })?;
    Ok(indexed)
}

/// Reads legend-metadata style channel maps from `<root>/<period>-r<NNN>.json`
/// (or `.yaml`). Entries are keyed by detector name and carry `system`,
/// `daq.rawid` and free-form metadata, flattened into dotted column names.
#[derive(Debug, Clone)]
pub struct FileChannelMapProvider {
    root: PathBuf,
}

impl FileChannelMapProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn locate(&self, query: &ChannelMapQuery) -> Result<PathBuf, ChannelMapError> {
        let stem = format!("{}-r{:03}", query.period, query.run);
        for ext in ["json", "yaml", "yml"] {
            let candidate = self.root.join(format!("{}.{}", stem, ext));
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        Err(ChannelMapError::NotFound {
            path: self.root.join(format!("{}.json", stem)),
        })
    }
}

fn flatten_into(prefix: &str, value: &Value, out: &mut Vec<(String, Value)>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let column = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten_into(&column, child, out);
            }
        }
        other => out.push((prefix.to_string(), other.clone())),
    }
}

impl ChannelMapProvider for FileChannelMapProvider {
    fn channel_map(&self, query: &ChannelMapQuery) -> Result<Table, ChannelMapError> {
        let path = self.locate(query)?;
        let doc = load_structured_file(&path).map_err(|source| ChannelMapError::Load {
            path: path.clone(),
            source,
        })?;
        let entries = doc.as_object().ok_or_else(|| ChannelMapError::Load {
            path: path.clone(),
            source: anyhow::anyhow!("expected an object keyed by detector name"),
        })?;

        let mut table = Table::with_columns("", ["channel", "name"]);
        for (key, entry) in entries {
            if entry.get("system").and_then(Value::as_str) != Some(query.system.as_str()) {
                continue;
            }
            let rawid = entry
                .pointer("/daq/rawid")
                .ok_or_else(|| ChannelMapError::MissingRawId { entry: key.clone() })?;
            let label = table.len().to_string();
            table.set(&label, "channel", rawid.clone());
            let name = entry
                .get("name")
                .cloned()
                .unwrap_or_else(|| Value::String(key.clone()));
            table.set(&label, "name", name);

            let mut metadata = Vec::new();
            flatten_into("", entry, &mut metadata);
            for (column, value) in metadata {
                if column != "name" && column != "channel" {
                    table.set(&label, &column, value);
                }
            }
        }
        debug!(path = %path.display(), system = %query.system, channels = table.len(), "loaded channel map");
        Ok(table)
    }
}
