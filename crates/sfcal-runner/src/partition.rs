use crate::channel_map::{normalize_channel_map, ChannelMapError, ChannelMapProvider, ChannelMapQuery, CAL, GEDS};
use crate::extract::{ExtractError, ExtractionPolicy, SfFields, SfRecord};
use serde_json::Value;
use sfcal_core::{RunId, Table, TableError};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use walkdir::WalkDir;

/// Layout below `<data_root>/<version>` holding per-run calibration records.
pub const PAR_CAL_DIRS: [&str; 4] = ["generated", "par", "pht", "cal"];
pub const DEFAULT_VERSION: &str = "v02.00";
pub const DEFAULT_EXPERIMENT: &str = "L200";

#[derive(Debug, Error)]
pub enum AggregateError {
    /// The storage layout is broken; not recoverable.
    #[error("The path:\n{}\ndoes not exist!", path.display())]
    PathNotFound { path: PathBuf },
    #[error("no calibration record (*.json) in {}", dir.display())]
    NoRecordFile { dir: PathBuf },
    #[error("list {}: {source}", dir.display())]
    ListDir {
        dir: PathBuf,
        #[source]
        source: walkdir::Error,
    },
    #[error("channel map for {run}: {source}")]
    ChannelMap {
        run: RunId,
        #[source]
        source: ChannelMapError,
    },
    #[error("calibration record for {run}: {source}")]
    Extract {
        run: RunId,
        #[source]
        source: ExtractError,
    },
    #[error("no channel map resolved for {run}")]
    MissingChannelMap { run: RunId },
    #[error("output column '{column}' is produced twice; rename the survival fraction or channel-map column")]
    ColumnCollision { column: String },
    #[error("joining channel map for {run}: {source}")]
    Join {
        run: RunId,
        #[source]
        source: TableError,
    },
}

fn require_path(path: &Path) -> Result<(), AggregateError> {
    if path.exists() {
        Ok(())
    } else {
        Err(AggregateError::PathNotFound {
            path: path.to_path_buf(),
        })
    }
}

/// Settings shared by every partition of one aggregation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionOptions {
    pub experiment: String,
    pub version: String,
    /// Channel-map columns carried into the result next to the survival
    /// fractions.
    pub map_columns: Vec<String>,
    pub policy: ExtractionPolicy,
}

impl Default for PartitionOptions {
    fn default() -> Self {
        Self {
            experiment: DEFAULT_EXPERIMENT.to_string(),
            version: DEFAULT_VERSION.to_string(),
            map_columns: vec!["name".to_string()],
            policy: ExtractionPolicy::default(),
        }
    }
}

/// Columns added by the aggregation itself (`channel` is the index).
pub const RESERVED_COLUMNS: [&str; 3] = ["channel", "run", "partition"];

/// Every output column must come from exactly one source: a survival
/// fraction, its `_err` companion, a channel-map column or a reserved one.
pub fn check_output_columns(sf_fields: &SfFields, map_columns: &[String]) -> Result<(), AggregateError> {
    let mut seen = BTreeSet::new();
    let produced = sf_fields
        .table_columns()
        .into_iter()
        .chain(map_columns.iter().cloned())
        .chain(RESERVED_COLUMNS.iter().map(|c| c.to_string()));
    for column in produced {
        if !seen.insert(column.clone()) {
            return Err(AggregateError::ColumnCollision { column });
        }
    }
    Ok(())
}

/// Drops repeated run ids, keeping the first occurrence.
fn unique_runs(run_list: &[RunId]) -> Vec<RunId> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::with_capacity(run_list.len());
    for run in run_list {
        if seen.insert(run.clone()) {
            out.push(run.clone());
        } else {
            warn!(run = %run, "duplicate run in partition ignored");
        }
    }
    out
}

/// Locates each run's calibration record under
/// `<data_root>/<version>/generated/par/pht/cal/<period>/<run>/`.
///
/// The record is the first file (by name) containing `.json`.
pub fn resolve_sf_json_paths(
    run_list: &[RunId],
    data_root: &Path,
    version: &str,
) -> Result<Vec<(RunId, PathBuf)>, AggregateError> {
    let cal_dir = PAR_CAL_DIRS
        .iter()
        .fold(data_root.join(version), |dir, part| dir.join(part));
    require_path(&cal_dir)?;

    let mut paths = Vec::with_capacity(run_list.len());
    for run in unique_runs(run_list) {
        let run_dir = cal_dir.join(run.period()).join(run.run());
        require_path(&run_dir)?;
        let mut record = None;
        for entry in WalkDir::new(&run_dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|source| AggregateError::ListDir {
                dir: run_dir.clone(),
                source,
            })?;
            let is_json = entry.file_name().to_string_lossy().contains(".json");
            if is_json && entry.file_type().is_file() {
                record = Some(entry.into_path());
                break;
            }
        }
        let record = record.ok_or_else(|| AggregateError::NoRecordFile {
            dir: run_dir.clone(),
        })?;
        paths.push((run, record));
    }
    Ok(paths)
}

/// Fetches and normalizes the germanium channel map of every run.
pub fn resolve_channel_maps(
    run_list: &[RunId],
    data_root: &Path,
    provider: &dyn ChannelMapProvider,
    options: &PartitionOptions,
) -> Result<BTreeMap<RunId, Table>, AggregateError> {
    let mut maps = BTreeMap::new();
    for run in unique_runs(run_list) {
        let query = ChannelMapQuery {
            system: GEDS.to_string(),
            experiment: options.experiment.clone(),
            period: run.period().to_string(),
            run: run.run_number(),
            datatype: CAL.to_string(),
            version: options.version.clone(),
            data_root: data_root.to_path_buf(),
        };
        info!(run = %run, "loading channel map");
        let map = provider
            .channel_map(&query)
            .and_then(normalize_channel_map)
            .map_err(|source| AggregateError::ChannelMap {
                run: run.clone(),
                source,
            })?;
        maps.insert(run, map);
    }
    Ok(maps)
}

/// Runs of one partition with their calibration records and channel maps.
#[derive(Debug, Clone)]
pub struct Partition {
    sf_info: Vec<(RunId, PathBuf)>,
    channel_maps: BTreeMap<RunId, Table>,
    options: PartitionOptions,
}

impl Partition {
    pub fn new(
        run_list: &[RunId],
        data_path: &Path,
        provider: &dyn ChannelMapProvider,
        options: PartitionOptions,
    ) -> Result<Self, AggregateError> {
        require_path(data_path)?;
        let run_list = unique_runs(run_list);
        let sf_info = resolve_sf_json_paths(&run_list, data_path, &options.version)?;
        let channel_maps = resolve_channel_maps(&run_list, data_path, provider, &options)?;
        Ok(Self {
            sf_info,
            channel_maps,
            options,
        })
    }

    /// Calibration record path per run, in run-list order.
    pub fn sf_info(&self) -> &[(RunId, PathBuf)] {
        &self.sf_info
    }

    pub fn channel_maps(&self) -> &BTreeMap<RunId, Table> {
        &self.channel_maps
    }

    /// Survival fractions of every run with detector names attached.
    ///
    /// Per run, the extracted table drives the row set: channels missing
    /// from the channel map keep a null `name`, channels only in the map are
    /// dropped. Runs are concatenated in run-list order.
    pub fn get_detector_sfs(&self, sf_fields: &SfFields) -> Result<Table, AggregateError> {
        check_output_columns(sf_fields, &self.options.map_columns)?;
        info!(runs = self.sf_info.len(), "getting survival fractions from calibration records");
        let mut tables = Vec::with_capacity(self.sf_info.len());
        for (run, path) in &self.sf_info {
            info!(run = %run, record = %path.display(), "extracting");
            let table = SfRecord::load(path)
                .and_then(|record| record.construct_sf_table(sf_fields, self.options.policy))
                .map_err(|source| AggregateError::Extract {
                    run: run.clone(),
                    source,
                })?
                .with_constant("run", Value::String(run.to_string()));
            let map = self
                .channel_maps
                .get(run)
                .ok_or_else(|| AggregateError::MissingChannelMap { run: run.clone() })?;
            let table = table
                .left_join(map, &self.options.map_columns)
                .map_err(|source| AggregateError::Join {
                    run: run.clone(),
                    source,
                })?;
            tables.push(table);
        }
        Ok(Table::concat(std::iter::once(Table::new("channel")).chain(tables)))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::fs;

    /// Provider serving prebuilt raw channel maps keyed by `<period>-r<NNN>`.
    #[derive(Default)]
    pub struct StaticProvider {
        pub maps: BTreeMap<String, Table>,
    }

    impl StaticProvider {
        pub fn with(mut self, run: &str, rows: &[(u64, &str)]) -> Self {
            let mut table = Table::with_columns("", ["channel", "name"]);
            for (i, (channel, name)) in rows.iter().enumerate() {
                table
                    .push_row(i.to_string(), vec![Value::from(*channel), Value::from(*name)])
                    .expect("row");
            }
            self.maps.insert(run.to_string(), table);
            self
        }
    }

    impl ChannelMapProvider for StaticProvider {
        fn channel_map(&self, query: &ChannelMapQuery) -> Result<Table, ChannelMapError> {
            let key = format!("{}-r{:03}", query.period, query.run);
            self.maps
                .get(&key)
                .cloned()
                .ok_or_else(|| ChannelMapError::NotFound { path: PathBuf::from(key) })
        }
    }

    pub fn temp_data_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "sfcal_{}_{}_{}",
            tag,
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&root).expect("temp dir");
        root
    }

    pub fn write_record(root: &Path, run: &str, file_name: &str, record: &Value) -> PathBuf {
        let run = RunId::parse(run).expect("run id");
        let dir = root
            .join(DEFAULT_VERSION)
            .join("generated/par/pht/cal")
            .join(run.period())
            .join(run.run());
        fs::create_dir_all(&dir).expect("run dir");
        let path = dir.join(file_name);
        fs::write(&path, record.to_string()).expect("write record");
        path
    }

    pub fn sf_entry(sf: f64) -> Value {
        serde_json::json!({"results": {"aoe": {"low_side_sfs": {"1592.5": {"sf": sf, "sf_err": 0.5}}}}})
    }
}
