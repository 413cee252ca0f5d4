use anyhow::{anyhow, Result};
use serde::Deserialize;
use serde_json::Value;
use sfcal_core::{load_structured_file, RunId, Table};
use sfcal_schemas::validate_against;
use std::path::{Path, PathBuf};
use tracing::info;

pub mod channel_map;
pub mod extract;
mod ordered;
pub mod partition;

pub use channel_map::{ChannelMapError, ChannelMapProvider, ChannelMapQuery, FileChannelMapProvider};
pub use extract::{ErrorSource, ExtractError, ExtractionPolicy, FailureScope, SfFields};
pub use partition::{AggregateError, Partition, PartitionOptions};

pub const SETTINGS_SCHEMA: &str = "sf_settings_v1.jsonschema";

fn default_experiment() -> String {
    partition::DEFAULT_EXPERIMENT.to_string()
}

fn default_version() -> String {
    partition::DEFAULT_VERSION.to_string()
}

fn default_map_columns() -> Vec<String> {
    vec!["name".to_string()]
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub schema_version: Option<String>,
    /// Partition name to run ids, in document order.
    #[serde(deserialize_with = "ordered::entries")]
    pub partitions: Vec<(String, Vec<RunId>)>,
    pub data_path: PathBuf,
    pub survival_fractions: SfFields,
    #[serde(default = "default_experiment")]
    pub experiment: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub channel_map_path: Option<PathBuf>,
    #[serde(default = "default_map_columns")]
    pub channel_map_columns: Vec<String>,
    #[serde(default)]
    pub extraction: ExtractionPolicy,
}

impl Settings {
    pub fn from_value(value: Value) -> Result<Self> {
        validate_against(SETTINGS_SCHEMA, &value)?;
        let settings: Settings = serde_json::from_value(value)?;
        partition::check_output_columns(&settings.survival_fractions, &settings.channel_map_columns)?;
        Ok(settings)
    }

    pub fn partition_options(&self) -> PartitionOptions {
        PartitionOptions {
            experiment: self.experiment.clone(),
            version: self.version.clone(),
            map_columns: self.channel_map_columns.clone(),
            policy: self.extraction,
        }
    }

    /// Directory read by [`FileChannelMapProvider`];
    /// `<data_path>/<version>/channelmaps` unless configured.
    pub fn channel_map_root(&self) -> PathBuf {
        self.channel_map_path
            .clone()
            .unwrap_or_else(|| self.data_path.join(&self.version).join("channelmaps"))
    }
}

pub fn load_settings(path: &Path) -> Result<Settings> {
    let value = load_structured_file(path)?;
    Settings::from_value(value).map_err(|e| anyhow!("settings {}: {}", path.display(), e))
}

/// Calibration record that fed one run of one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSource {
    pub partition: String,
    pub run: RunId,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Aggregation {
    pub table: Table,
    pub sources: Vec<RecordSource>,
}

/// Builds every partition's survival-fraction table, tags it with the
/// partition name and concatenates them in settings order.
pub fn aggregate_survival_fractions(
    settings: &Settings,
    provider: &dyn ChannelMapProvider,
) -> Result<Aggregation, AggregateError> {
    let mut tables = Vec::with_capacity(settings.partitions.len());
    let mut sources = Vec::new();
    for (name, runs) in &settings.partitions {
        info!(partition = %name, runs = runs.len(), "partition");
        let partition = Partition::new(runs, &settings.data_path, provider, settings.partition_options())?;
        let table = partition
            .get_detector_sfs(&settings.survival_fractions)?
            .with_constant("partition", Value::String(name.clone()));
        sources.extend(partition.sf_info().iter().map(|(run, path)| RecordSource {
            partition: name.clone(),
            run: run.clone(),
            path: path.clone(),
        }));
        tables.push(table);
    }
    Ok(Aggregation {
        table: Table::concat(std::iter::once(Table::new("channel")).chain(tables)),
        sources,
    })
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run: RunId,
    pub record: PathBuf,
    pub channels: usize,
}

#[derive(Debug, Clone)]
pub struct PartitionSummary {
    pub name: String,
    pub runs: Vec<RunSummary>,
}

/// Resolves records and channel maps for every partition without extracting.
pub fn describe_partitions(
    settings: &Settings,
    provider: &dyn ChannelMapProvider,
) -> Result<Vec<PartitionSummary>, AggregateError> {
    let mut out = Vec::with_capacity(settings.partitions.len());
    for (name, runs) in &settings.partitions {
        let partition = Partition::new(runs, &settings.data_path, provider, settings.partition_options())?;
        let runs = partition
            .sf_info()
            .iter()
            .map(|(run, record)| RunSummary {
                run: run.clone(),
                record: record.clone(),
                channels: partition.channel_maps().get(run).map_or(0, Table::len),
            })
            .collect();
        out.push(PartitionSummary {
            name: name.clone(),
            runs,
        });
    }
    Ok(out)
}
