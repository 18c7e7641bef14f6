//! Orchestration for parameter sweeps over a remote calculation surface.
//!
//! A sweep walks every combination of a [`sweep_core::Grid`], applies each
//! one to a spreadsheet-backed calculation surface, waits for the surface to
//! settle, reads the outcome metrics and submits one flat record per
//! combination to the aggregation service. Runs are resumable: the service
//! itself is the source of truth for where the previous run stopped.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

use sweep_core::{
    round_to, Dimension, Grid, GridError, ParamStore, PortError, RecordedParam, ResultRecord,
    ResultSink, SubmitAck, Surface, SweepStep,
};
use sweep_sheets::{CellRef, SheetsSurface};

// ---------------------------------------------------------------------------
// Instrument lock

#[derive(Debug, Error)]
pub enum LockError {
    #[error("sweep already in progress for '{instrument}' (lock file {path})")]
    Held { instrument: String, path: String },
    #[error("cannot create lock under {dir}: {source}")]
    Io {
        dir: String,
        #[source]
        source: std::io::Error,
    },
}

/// Guards one instrument's calculation surface against concurrent sweeps
/// started from the same host. The lock file is removed on drop; a file left
/// behind by a killed process must be cleared by the operator.
#[derive(Debug)]
pub struct InstrumentLock {
    path: PathBuf,
}

impl Drop for InstrumentLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

pub fn acquire_instrument_lock(dir: &Path, instrument: &str) -> Result<InstrumentLock, LockError> {
    fs::create_dir_all(dir).map_err(|e| LockError::Io {
        dir: dir.display().to_string(),
        source: e,
    })?;
    let path = dir.join(format!("{}.lock", lock_file_stem(instrument)));
    match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(mut file) => {
            let payload = json!({
                "pid": std::process::id(),
                "instrument": instrument,
                "acquired_at": Utc::now().to_rfc3339(),
            });
            let _ = file.write_all(payload.to_string().as_bytes());
            let _ = file.sync_all();
            Ok(InstrumentLock { path })
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(LockError::Held {
            instrument: instrument.to_string(),
            path: path.display().to_string(),
        }),
        Err(e) => Err(LockError::Io {
            dir: dir.display().to_string(),
            source: e,
        }),
    }
}

fn lock_file_stem(instrument: &str) -> String {
    instrument
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Configuration

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("instrument must not be empty")]
    MissingInstrument,
    #[error("dataset must not be empty")]
    MissingDataset,
    #[error("surface.spreadsheet must not be empty")]
    MissingSpreadsheet,
    #[error(transparent)]
    Grid(#[from] GridError),
    #[error("dimension '{name}': bad {field} '{cell}': {detail}")]
    BadCell {
        name: String,
        field: &'static str,
        cell: String,
        detail: String,
    },
    #[error("metric '{name}': bad cell '{cell}': {detail}")]
    BadMetricCell {
        name: String,
        cell: String,
        detail: String,
    },
    #[error("cell '{cell}' is used more than once")]
    DuplicateCell { cell: String },
    #[error("at least one metric cell is required")]
    NoMetrics,
    #[error("duplicate metric name '{name}'")]
    DuplicateMetric { name: String },
    #[error("baseline is missing a value for dimension '{name}'")]
    BaselineMissing { name: String },
    #[error("baseline names unknown dimension '{name}'")]
    BaselineUnknown { name: String },
    #[error("pacing min {min}s exceeds max {max}s")]
    PacingRange { min: u64, max: u64 },
}

/// One sweep as the operator declares it: which instrument, which surface,
/// which dimensions, and how the run should behave.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    pub instrument: String,
    pub dataset: String,
    pub surface: SurfaceConfig,
    pub results: ResultsConfig,
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,
    pub dimensions: Vec<Dimension>,
    pub baseline: BTreeMap<String, f64>,
    pub metrics: Vec<MetricCell>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurfaceConfig {
    #[serde(default = "default_surface_base")]
    pub base_url: String,
    pub spreadsheet: String,
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// Shifts every configured cell to the right, so one spreadsheet can
    /// host several instruments side by side.
    #[serde(default)]
    pub column_offset: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsConfig {
    pub base_url: String,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PacingConfig {
    #[serde(default = "default_pacing_min")]
    pub min_secs: u64,
    #[serde(default = "default_pacing_max")]
    pub max_secs: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        PacingConfig {
            min_secs: default_pacing_min(),
            max_secs: default_pacing_max(),
        }
    }
}

/// An outcome cell read after each combination settles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricCell {
    pub name: String,
    pub cell: String,
}

fn default_surface_base() -> String {
    sweep_sheets::DEFAULT_BASE_URL.to_string()
}

fn default_token_env() -> String {
    "SWEEP_SHEETS_TOKEN".to_string()
}

fn default_lock_dir() -> PathBuf {
    PathBuf::from(".sweep/locks")
}

fn default_pacing_min() -> u64 {
    20
}

fn default_pacing_max() -> u64 {
    30
}

/// Everything the driver needs, derived from a validated config: the grid,
/// the baseline values in dimension order, and metric cells with the column
/// offset applied.
#[derive(Debug, Clone)]
pub struct SweepSetup {
    pub instrument: String,
    pub dataset: String,
    pub grid: Grid,
    pub baseline_values: Vec<f64>,
    pub metrics: Vec<MetricCell>,
}

pub fn load_config(path: &Path) -> Result<SweepConfig, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        source: e,
    })?;
    serde_yaml::from_str(&raw).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        source: e,
    })
}

impl SweepConfig {
    pub fn resolve(&self) -> Result<SweepSetup, ConfigError> {
        if self.instrument.trim().is_empty() {
            return Err(ConfigError::MissingInstrument);
        }
        if self.dataset.trim().is_empty() {
            return Err(ConfigError::MissingDataset);
        }
        if self.surface.spreadsheet.trim().is_empty() {
            return Err(ConfigError::MissingSpreadsheet);
        }
        if self.pacing.min_secs > self.pacing.max_secs {
            return Err(ConfigError::PacingRange {
                min: self.pacing.min_secs,
                max: self.pacing.max_secs,
            });
        }
        if self.metrics.is_empty() {
            return Err(ConfigError::NoMetrics);
        }

        let offset = self.surface.column_offset;
        let mut dims = Vec::with_capacity(self.dimensions.len());
        for dim in &self.dimensions {
            dims.push(Dimension {
                name: dim.name.clone(),
                cell: shifted_cell(&dim.name, "cell", &dim.cell, offset)?,
                check_cell: shifted_cell(&dim.name, "check_cell", &dim.check_cell, offset)?,
                values: dim.values.clone(),
            });
        }
        let grid = Grid::new(dims)?;

        let mut used_cells = BTreeSet::new();
        for dim in grid.dimensions() {
            for cell in [&dim.cell, &dim.check_cell] {
                if !used_cells.insert(cell.clone()) {
                    return Err(ConfigError::DuplicateCell { cell: cell.clone() });
                }
            }
        }

        let mut metrics = Vec::with_capacity(self.metrics.len());
        let mut metric_names = BTreeSet::new();
        for metric in &self.metrics {
            if !metric_names.insert(metric.name.clone()) {
                return Err(ConfigError::DuplicateMetric {
                    name: metric.name.clone(),
                });
            }
            let cell = CellRef::parse(&metric.cell)
                .map_err(|e| ConfigError::BadMetricCell {
                    name: metric.name.clone(),
                    cell: metric.cell.clone(),
                    detail: e.to_string(),
                })?
                .with_col_offset(offset)
                .to_string();
            if !used_cells.insert(cell.clone()) {
                return Err(ConfigError::DuplicateCell { cell });
            }
            metrics.push(MetricCell {
                name: metric.name.clone(),
                cell,
            });
        }

        let mut baseline_values = Vec::with_capacity(grid.dimensions().len());
        for dim in grid.dimensions() {
            let value = self
                .baseline
                .get(&dim.name)
                .copied()
                .ok_or_else(|| ConfigError::BaselineMissing {
                    name: dim.name.clone(),
                })?;
            baseline_values.push(value);
        }
        for name in self.baseline.keys() {
            if !grid.dimensions().iter().any(|d| &d.name == name) {
                return Err(ConfigError::BaselineUnknown { name: name.clone() });
            }
        }

        Ok(SweepSetup {
            instrument: self.instrument.clone(),
            dataset: self.dataset.clone(),
            grid,
            baseline_values,
            metrics,
        })
    }
}

fn shifted_cell(
    name: &str,
    field: &'static str,
    cell: &str,
    offset: u32,
) -> Result<String, ConfigError> {
    let parsed = CellRef::parse(cell).map_err(|e| ConfigError::BadCell {
        name: name.to_string(),
        field,
        cell: cell.to_string(),
        detail: e.to_string(),
    })?;
    Ok(parsed.with_col_offset(offset).to_string())
}

/// Starter config with the stock backtest layout. `spreadsheet` must be
/// filled in before the file is usable.
pub fn config_template() -> &'static str {
    r#"instrument: 601899-bdl-1y-1
dataset: data1y
surface:
  base_url: https://sheets.googleapis.com/v4/spreadsheets
  spreadsheet: ''
  token_env: SWEEP_SHEETS_TOKEN
  column_offset: 0
results:
  base_url: http://sxapi.stplan.cn/api/Stock
  # webhook_url: https://example.net/hooks/sweeps
pacing:
  min_secs: 20
  max_secs: 30
lock_dir: .sweep/locks
dimensions:
  - name: multiplier
    cell: B6
    check_cell: I6
    values: [3, 3.5, 4]
  - name: danbian
    cell: B7
    check_cell: I7
    values: [0.82, 0.83, 0.84, 0.85, 0.86, 0.87, 0.88, 0.89, 0.9, 0.91, 0.92]
  - name: xiancang
    cell: B9
    check_cell: I9
    values: [0.3]
  - name: zhishu
    cell: B10
    check_cell: I10
    values: [1]
  - name: smoothing
    cell: B11
    check_cell: I11
    values: [0, 0.01, 0.02, 0.03, 0.04, 0.05, 0.06, 0.07, 0.08, 0.09, 0.1]
  - name: bordering
    cell: B12
    check_cell: I12
    values: [0.18, 0.19, 0.2, 0.21, 0.22, 0.23, 0.24, 0.25, 0.26, 0.27]
baseline:
  multiplier: 4
  danbian: 0.85
  xiancang: 0.24
  zhishu: 0.88
  smoothing: 0.08
  bordering: 0.38
metrics:
  - { name: return_rate, cell: I15 }
  - { name: annualized_rate, cell: I16 }
  - { name: maxdd, cell: I17 }
  - { name: index_rate, cell: I18 }
  - { name: index_annualized_rate, cell: I19 }
  - { name: max_index_dd, cell: I20 }
  - { name: fee_total, cell: I21 }
  - { name: fee_annualized, cell: I22 }
  - { name: year_rate, cell: I23 }
"#
}

// ---------------------------------------------------------------------------
// Settle pacing

/// Uniform random pause, in whole seconds, between committing inputs and
/// trusting what the surface computed from them. Zero bounds make it a
/// no-op so tests can run the driver flat out.
#[derive(Debug, Clone, Copy)]
pub struct SettlePacing {
    min_secs: u64,
    max_secs: u64,
}

impl SettlePacing {
    pub fn new(min_secs: u64, max_secs: u64) -> Self {
        if min_secs > max_secs {
            SettlePacing {
                min_secs: max_secs,
                max_secs: min_secs,
            }
        } else {
            SettlePacing { min_secs, max_secs }
        }
    }

    pub fn none() -> Self {
        SettlePacing {
            min_secs: 0,
            max_secs: 0,
        }
    }

    pub fn draw_secs(&self) -> u64 {
        if self.max_secs == 0 {
            return 0;
        }
        rand::thread_rng().gen_range(self.min_secs..=self.max_secs)
    }

    pub fn pause(&self) {
        let secs = self.draw_secs();
        if secs == 0 {
            return;
        }
        tracing::debug!("settling for {}s", secs);
        thread::sleep(Duration::from_secs(secs));
    }
}

impl From<PacingConfig> for SettlePacing {
    fn from(config: PacingConfig) -> Self {
        SettlePacing::new(config.min_secs, config.max_secs)
    }
}

// ---------------------------------------------------------------------------
// Aggregation service client

/// Blocking client for the aggregation service. One endpoint inserts flat
/// result records, the other returns the most recent record for an
/// instrument; together they make sweeps resumable.
pub struct ResultsClient {
    http: reqwest::blocking::Client,
    base_url: String,
    dimension_names: Vec<String>,
}

impl ResultsClient {
    pub fn new(base_url: impl Into<String>, dimension_names: Vec<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        ResultsClient {
            http: reqwest::blocking::Client::new(),
            base_url,
            dimension_names,
        }
    }

    fn endpoint(&self, name: &str) -> String {
        format!("{}/{}", self.base_url, name)
    }

    fn post_json(&self, url: &str, body: &Value) -> Result<reqwest::blocking::Response, PortError> {
        self.http
            .post(url)
            .json(body)
            .send()
            .map_err(|e| PortError::transport(url, e))
    }
}

/// Deterministic key for one step of one sweep, so a retried submission can
/// be recognized server side.
pub fn submission_key(instrument: &str, dataset: &str, step: SweepStep) -> String {
    let mut hasher = Sha256::new();
    hasher.update(instrument.as_bytes());
    hasher.update(b"|");
    hasher.update(dataset.as_bytes());
    hasher.update(b"|");
    hasher.update(step.to_string().as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

fn record_body(record: &ResultRecord) -> Value {
    let mut body = serde_json::Map::new();
    body.insert("stock_no".to_string(), Value::from(record.instrument.clone()));
    for param in &record.params {
        body.insert(param.name.clone(), Value::from(param.value));
        body.insert(
            format!("{}_index", param.name),
            Value::from(param.position as u64),
        );
    }
    for (name, value) in &record.metrics {
        body.insert(name.clone(), Value::from(*value));
    }
    body.insert(
        "request_id".to_string(),
        Value::from(record.request_id.clone()),
    );
    Value::Object(body)
}

fn position_from(value: &Value) -> Option<usize> {
    if let Some(n) = value.as_u64() {
        return usize::try_from(n).ok();
    }
    // Some backends hand integers back as floats.
    let f = value.as_f64()?;
    if f.fract() == 0.0 && f >= 0.0 {
        Some(f as usize)
    } else {
        None
    }
}

impl ResultSink for ResultsClient {
    fn submit(&self, record: &ResultRecord) -> Result<SubmitAck, PortError> {
        let url = self.endpoint("InsertStockTemplateParam");
        let response = self.post_json(&url, &record_body(record))?;
        let status = response.status();
        if !status.is_success() {
            tracing::warn!("step {}: sink returned status {}", record.step, status);
            return Ok(SubmitAck {
                accepted: false,
                running_count: 0,
            });
        }
        let body: Value = match response.json() {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("step {}: sink body unreadable: {}", record.step, e);
                return Ok(SubmitAck {
                    accepted: false,
                    running_count: 0,
                });
            }
        };
        match body.get("ret_count").and_then(Value::as_i64) {
            Some(count) => Ok(SubmitAck {
                accepted: true,
                running_count: count,
            }),
            None => {
                tracing::warn!("step {}: sink body lacks ret_count", record.step);
                Ok(SubmitAck {
                    accepted: false,
                    running_count: 0,
                })
            }
        }
    }
}

impl ParamStore for ResultsClient {
    fn lookup(&self, instrument: &str) -> Result<Option<sweep_core::StoredCombination>, PortError> {
        let url = self.endpoint("GetSingleStockTemplateParam");
        let response = self.post_json(&url, &json!({ "stock_no": instrument }))?;
        let status = response.status();
        if !status.is_success() {
            return Err(PortError::transport(
                &url,
                format!("lookup rejected with status {}", status),
            ));
        }
        let body: Value = response.json().map_err(|e| PortError::malformed(&url, e))?;
        let ret_obj = match body.get("ret_obj") {
            None | Some(Value::Null) => return Ok(None),
            Some(obj) => obj,
        };
        let mut positions = BTreeMap::new();
        for name in &self.dimension_names {
            let field = format!("{}_index", name);
            let position = ret_obj
                .get(&field)
                .and_then(position_from)
                .ok_or_else(|| {
                    PortError::malformed(
                        &url,
                        format!("missing or non-integer field '{}'", field),
                    )
                })?;
            positions.insert(name.clone(), position);
        }
        Ok(Some(sweep_core::StoredCombination { positions }))
    }
}

// ---------------------------------------------------------------------------
// Resume

/// Where a run starts and whether the baseline combination is pushed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartPlan {
    pub start_index: u64,
    pub baseline_needed: bool,
}

#[derive(Debug, Error)]
pub enum ResumeError {
    /// "No prior data" and "could not find out" must never be conflated;
    /// the sweep does not start until the store can be consulted.
    #[error("cannot determine start index for '{instrument}': {detail}")]
    Indeterminate { instrument: String, detail: String },
}

pub fn determine_start(
    store: &dyn ParamStore,
    grid: &Grid,
    instrument: &str,
) -> Result<StartPlan, ResumeError> {
    let indeterminate = |detail: String| ResumeError::Indeterminate {
        instrument: instrument.to_string(),
        detail,
    };
    let recorded = store
        .lookup(instrument)
        .map_err(|e| indeterminate(e.to_string()))?;
    let Some(stored) = recorded else {
        tracing::info!("no prior record for {}; starting fresh with baseline", instrument);
        return Ok(StartPlan {
            start_index: 0,
            baseline_needed: true,
        });
    };

    let mut positions = Vec::with_capacity(grid.dimensions().len());
    for dim in grid.dimensions() {
        let position = stored
            .positions
            .get(&dim.name)
            .copied()
            .ok_or_else(|| {
                indeterminate(format!("record lacks position for dimension '{}'", dim.name))
            })?;
        positions.push(position);
    }
    let recorded_index = grid
        .encode(&positions)
        .map_err(|e| indeterminate(e.to_string()))?;
    let start_index = recorded_index + 1;
    tracing::info!(
        "resuming {} at index {} (last recorded index {})",
        instrument,
        start_index,
        recorded_index
    );
    Ok(StartPlan {
        start_index,
        baseline_needed: false,
    })
}

// ---------------------------------------------------------------------------
// Driver

#[derive(Debug, Error)]
pub enum SweepError {
    #[error(transparent)]
    Grid(#[from] GridError),
    #[error("surface failed at step {step}: {source}")]
    Surface {
        step: SweepStep,
        last_completed: Option<u64>,
        #[source]
        source: PortError,
    },
    #[error("inputs did not settle at step {step}; mirror cells still differ after one retry")]
    Settlement {
        step: SweepStep,
        last_completed: Option<u64>,
    },
}

impl SweepError {
    /// Last grid index fully completed by this run, if any. The store still
    /// knows the true resume point either way.
    pub fn last_completed(&self) -> Option<u64> {
        match self {
            SweepError::Grid(_) => None,
            SweepError::Surface { last_completed, .. } => *last_completed,
            SweepError::Settlement { last_completed, .. } => *last_completed,
        }
    }
}

/// What a finished run did.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub instrument: String,
    pub dataset: String,
    pub total_count: u64,
    pub start_index: u64,
    pub baseline_pushed: bool,
    pub steps_completed: u64,
    pub records_accepted: u64,
    pub records_lost: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Walks the grid: writes each combination to the surface, waits for it to
/// settle, verifies the mirror cells, reads the metrics and submits one
/// record per step. Surface trouble is fatal, sink trouble is not.
pub struct SweepDriver<'a> {
    setup: &'a SweepSetup,
    surface: &'a dyn Surface,
    sink: &'a dyn ResultSink,
    pacing: SettlePacing,
}

impl<'a> SweepDriver<'a> {
    pub fn new(
        setup: &'a SweepSetup,
        surface: &'a dyn Surface,
        sink: &'a dyn ResultSink,
        pacing: SettlePacing,
    ) -> Self {
        SweepDriver {
            setup,
            surface,
            sink,
            pacing,
        }
    }

    pub fn run(&self, plan: StartPlan) -> Result<RunReport, SweepError> {
        let started_at = Utc::now();
        let total = self.setup.grid.total_count();
        let mut last_completed: Option<u64> = None;
        let mut steps_completed = 0u64;
        let mut records_accepted = 0u64;
        let mut records_lost = 0u64;

        if plan.baseline_needed {
            let positions = vec![0usize; self.setup.grid.dimensions().len()];
            let accepted = self.run_step(
                SweepStep::Baseline,
                &self.setup.baseline_values,
                &positions,
                last_completed,
            )?;
            if accepted {
                records_accepted += 1;
            } else {
                records_lost += 1;
            }
        }

        for index in plan.start_index..total {
            let combination = self.setup.grid.decode(index)?;
            let accepted = self.run_step(
                SweepStep::Index(index),
                &combination.values,
                &combination.positions,
                last_completed,
            )?;
            last_completed = Some(index);
            steps_completed += 1;
            if accepted {
                records_accepted += 1;
            } else {
                records_lost += 1;
            }
        }

        let report = RunReport {
            instrument: self.setup.instrument.clone(),
            dataset: self.setup.dataset.clone(),
            total_count: total,
            start_index: plan.start_index,
            baseline_pushed: plan.baseline_needed,
            steps_completed,
            records_accepted,
            records_lost,
            started_at,
            finished_at: Utc::now(),
        };
        tracing::info!(
            "sweep over {} finished: {} steps, {} records accepted, {} lost",
            report.instrument,
            report.steps_completed,
            report.records_accepted,
            report.records_lost
        );
        Ok(report)
    }

    /// One full cycle for one combination. Returns whether the sink accepted
    /// the record.
    fn run_step(
        &self,
        step: SweepStep,
        values: &[f64],
        positions: &[usize],
        last_completed: Option<u64>,
    ) -> Result<bool, SweepError> {
        let dims = self.setup.grid.dimensions();
        tracing::info!("step {}: applying {:?}", step, values);

        for (dim, &value) in dims.iter().zip(values) {
            self.surface
                .write_cell(&dim.cell, value)
                .map_err(|e| SweepError::Surface {
                    step,
                    last_completed,
                    source: e,
                })?;
        }
        self.pacing.pause();

        let mut inputs = self.read_input_pairs(step, last_completed)?;
        if !pairs_settled(&inputs) {
            tracing::warn!("step {}: mirror cells differ, settling once more", step);
            self.pacing.pause();
            inputs = self.read_input_pairs(step, last_completed)?;
            if !pairs_settled(&inputs) {
                return Err(SweepError::Settlement {
                    step,
                    last_completed,
                });
            }
        }

        let mut metrics = BTreeMap::new();
        for metric in &self.setup.metrics {
            let value = self
                .surface
                .read_cell(&metric.cell)
                .map_err(|e| SweepError::Surface {
                    step,
                    last_completed,
                    source: e,
                })?;
            metrics.insert(metric.name.clone(), round_to(value, 4));
        }

        let params = dims
            .iter()
            .zip(&inputs)
            .zip(positions)
            .map(|((dim, &(input, _)), &position)| RecordedParam {
                name: dim.name.clone(),
                value: input,
                position,
            })
            .collect();
        let record = ResultRecord {
            instrument: self.setup.instrument.clone(),
            dataset: self.setup.dataset.clone(),
            step,
            params,
            metrics,
            request_id: submission_key(&self.setup.instrument, &self.setup.dataset, step),
        };

        match self.sink.submit(&record) {
            Ok(ack) if ack.accepted => {
                tracing::info!("step {}: recorded ({} rows total)", step, ack.running_count);
                Ok(true)
            }
            Ok(_) => {
                tracing::warn!("step {}: sink did not accept the record, continuing", step);
                Ok(false)
            }
            Err(e) => {
                tracing::warn!("step {}: submit failed: {}, continuing", step, e);
                Ok(false)
            }
        }
    }

    /// Reads every input cell and its mirror, both rounded to two decimals,
    /// which is the precision the surface echoes back.
    fn read_input_pairs(
        &self,
        step: SweepStep,
        last_completed: Option<u64>,
    ) -> Result<Vec<(f64, f64)>, SweepError> {
        let surface_err = |e| SweepError::Surface {
            step,
            last_completed,
            source: e,
        };
        let mut pairs = Vec::with_capacity(self.setup.grid.dimensions().len());
        for dim in self.setup.grid.dimensions() {
            let input = self.surface.read_cell(&dim.cell).map_err(surface_err)?;
            let mirror = self
                .surface
                .read_cell(&dim.check_cell)
                .map_err(surface_err)?;
            pairs.push((round_to(input, 2), round_to(mirror, 2)));
        }
        Ok(pairs)
    }
}

fn pairs_settled(pairs: &[(f64, f64)]) -> bool {
    pairs.iter().all(|(input, mirror)| input == mirror)
}

// ---------------------------------------------------------------------------
// Operator notification

/// Fire-and-forget webhook for fatal sweep failures. A lost notification
/// only costs visibility, so delivery errors are logged and swallowed.
pub struct WebhookNotifier {
    http: reqwest::blocking::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        WebhookNotifier {
            http: reqwest::blocking::Client::new(),
            url: url.into(),
        }
    }

    pub fn notify(&self, title: &str, text: &str) {
        let body = json!({ "title": title, "text": text });
        match self.http.post(&self.url).json(&body).send() {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                tracing::warn!("webhook returned status {}", response.status());
            }
            Err(e) => {
                tracing::warn!("webhook delivery failed: {}", e);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Entry points

/// Cardinality view of a configured sweep.
#[derive(Debug, Clone)]
pub struct SweepSummary {
    pub instrument: String,
    pub dataset: String,
    pub dimensions: Vec<(String, usize)>,
    pub total_count: u64,
    pub metric_names: Vec<String>,
    pub pacing_secs: (u64, u64),
}

fn summarize(config: &SweepConfig, setup: &SweepSetup) -> SweepSummary {
    SweepSummary {
        instrument: setup.instrument.clone(),
        dataset: setup.dataset.clone(),
        dimensions: setup
            .grid
            .dimensions()
            .iter()
            .map(|d| (d.name.clone(), d.values.len()))
            .collect(),
        total_count: setup.grid.total_count(),
        metric_names: setup.metrics.iter().map(|m| m.name.clone()).collect(),
        pacing_secs: (config.pacing.min_secs, config.pacing.max_secs),
    }
}

/// Validates a config without touching the network.
pub fn describe_sweep(config_path: &Path) -> Result<SweepSummary> {
    let config = load_config(config_path)?;
    let setup = config.resolve()?;
    Ok(summarize(&config, &setup))
}

/// Validates a config and asks the aggregation service where the sweep
/// would start, without driving the surface.
pub fn plan_sweep(config_path: &Path) -> Result<(SweepSummary, StartPlan)> {
    let config = load_config(config_path)?;
    let setup = config.resolve()?;
    let client = results_client(&config, &setup);
    let plan = determine_start(&client, &setup.grid, &setup.instrument)?;
    Ok((summarize(&config, &setup), plan))
}

/// Runs the sweep described by the config file to completion. With
/// `start_override` the resume lookup is skipped and the baseline is not
/// pushed.
pub fn run_sweep(config_path: &Path, start_override: Option<u64>) -> Result<RunReport> {
    let config = load_config(config_path)?;
    let setup = config.resolve()?;
    let _lock = acquire_instrument_lock(&config.lock_dir, &setup.instrument)?;

    let token = std::env::var(&config.surface.token_env).map_err(|_| {
        anyhow!(
            "surface_token_missing: set {} to the sheets bearer token",
            config.surface.token_env
        )
    })?;
    let surface = SheetsSurface::new(
        &config.surface.base_url,
        &config.surface.spreadsheet,
        &setup.dataset,
        token,
    );
    let client = results_client(&config, &setup);
    let notifier = config.results.webhook_url.as_deref().map(WebhookNotifier::new);

    let plan = match start_override {
        Some(start_index) => {
            let total = setup.grid.total_count();
            if start_index >= total {
                return Err(anyhow!(
                    "start_out_of_range: index {} exceeds grid of {} combinations",
                    start_index,
                    total
                ));
            }
            StartPlan {
                start_index,
                baseline_needed: false,
            }
        }
        None => match determine_start(&client, &setup.grid, &setup.instrument) {
            Ok(plan) => plan,
            Err(e) => {
                if let Some(notifier) = &notifier {
                    notifier.notify(
                        "sweep did not start",
                        &format!("{}: {}", setup.instrument, e),
                    );
                }
                return Err(e.into());
            }
        },
    };

    let driver = SweepDriver::new(&setup, &surface, &client, config.pacing.into());
    match driver.run(plan) {
        Ok(report) => Ok(report),
        Err(e) => {
            if let Some(notifier) = &notifier {
                let resume_note = match e.last_completed() {
                    Some(index) => format!("last completed index {}", index),
                    None => "no step completed in this run".to_string(),
                };
                notifier.notify(
                    "sweep failed",
                    &format!("{}: {} ({})", setup.instrument, e, resume_note),
                );
            }
            Err(e.into())
        }
    }
}

fn results_client(config: &SweepConfig, setup: &SweepSetup) -> ResultsClient {
    let names = setup
        .grid
        .dimensions()
        .iter()
        .map(|d| d.name.clone())
        .collect();
    ResultsClient::new(&config.results.base_url, names)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template_config() -> SweepConfig {
        let mut config: SweepConfig = serde_yaml::from_str(config_template()).unwrap();
        config.surface.spreadsheet = "sheet123".to_string();
        config
    }

    #[test]
    fn template_parses_with_defaults() {
        let config: SweepConfig = serde_yaml::from_str(config_template()).unwrap();
        assert_eq!(config.instrument, "601899-bdl-1y-1");
        assert_eq!(config.dataset, "data1y");
        assert_eq!(config.pacing.min_secs, 20);
        assert_eq!(config.pacing.max_secs, 30);
        assert_eq!(config.surface.token_env, "SWEEP_SHEETS_TOKEN");
        assert_eq!(config.surface.column_offset, 0);
        assert!(config.results.webhook_url.is_none());
        assert_eq!(config.dimensions.len(), 6);
        assert_eq!(config.metrics.len(), 9);
    }

    #[test]
    fn template_without_spreadsheet_does_not_resolve() {
        let config: SweepConfig = serde_yaml::from_str(config_template()).unwrap();
        assert!(matches!(
            config.resolve(),
            Err(ConfigError::MissingSpreadsheet)
        ));
    }

    #[test]
    fn resolved_template_matches_the_backtest_layout() {
        let setup = template_config().resolve().unwrap();
        assert_eq!(setup.grid.total_count(), 3630);
        assert_eq!(
            setup.baseline_values,
            vec![4.0, 0.85, 0.24, 0.88, 0.08, 0.38]
        );
        assert_eq!(setup.metrics.len(), 9);
        assert_eq!(setup.metrics[0].cell, "I15");
        assert_eq!(setup.metrics[8].cell, "I23");
        let dims = setup.grid.dimensions();
        assert_eq!(dims[0].cell, "B6");
        assert_eq!(dims[0].check_cell, "I6");
        assert_eq!(dims[5].cell, "B12");
    }

    #[test]
    fn column_offset_shifts_every_cell() {
        let mut config = template_config();
        config.surface.column_offset = 4;
        let setup = config.resolve().unwrap();
        let dims = setup.grid.dimensions();
        assert_eq!(dims[0].cell, "F6");
        assert_eq!(dims[0].check_cell, "M6");
        assert_eq!(setup.metrics[0].cell, "M15");
    }

    #[test]
    fn load_config_round_trips_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sweep.yaml");
        fs::write(&path, config_template()).unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.instrument, "601899-bdl-1y-1");
        assert!(matches!(
            load_config(&dir.path().join("missing.yaml")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sweep.yaml");
        fs::write(&path, "instrument: [unclosed").unwrap();
        assert!(matches!(
            load_config(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn bad_dimension_cell_is_rejected() {
        let mut config = template_config();
        config.dimensions[0].cell = "6B".to_string();
        assert!(matches!(
            config.resolve(),
            Err(ConfigError::BadCell { field: "cell", .. })
        ));
    }

    #[test]
    fn duplicate_cells_are_rejected() {
        let mut config = template_config();
        config.dimensions[1].cell = "B6".to_string();
        assert!(matches!(
            config.resolve(),
            Err(ConfigError::DuplicateCell { cell }) if cell == "B6"
        ));

        let mut config = template_config();
        config.metrics[0].cell = "I6".to_string();
        assert!(matches!(
            config.resolve(),
            Err(ConfigError::DuplicateCell { cell }) if cell == "I6"
        ));
    }

    #[test]
    fn baseline_must_cover_every_dimension() {
        let mut config = template_config();
        config.baseline.remove("danbian");
        assert!(matches!(
            config.resolve(),
            Err(ConfigError::BaselineMissing { name }) if name == "danbian"
        ));

        let mut config = template_config();
        config.baseline.insert("volatility".to_string(), 0.5);
        assert!(matches!(
            config.resolve(),
            Err(ConfigError::BaselineUnknown { name }) if name == "volatility"
        ));
    }

    #[test]
    fn metrics_are_required_and_unique() {
        let mut config = template_config();
        config.metrics.clear();
        assert!(matches!(config.resolve(), Err(ConfigError::NoMetrics)));

        let mut config = template_config();
        config.metrics[1].name = "return_rate".to_string();
        assert!(matches!(
            config.resolve(),
            Err(ConfigError::DuplicateMetric { name }) if name == "return_rate"
        ));
    }

    #[test]
    fn inverted_pacing_is_rejected() {
        let mut config = template_config();
        config.pacing.min_secs = 40;
        assert!(matches!(
            config.resolve(),
            Err(ConfigError::PacingRange { min: 40, max: 30 })
        ));
    }

    #[test]
    fn lock_is_exclusive_per_instrument_and_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let lock = acquire_instrument_lock(dir.path(), "601899-bdl-1y-1").unwrap();
        assert!(matches!(
            acquire_instrument_lock(dir.path(), "601899-bdl-1y-1"),
            Err(LockError::Held { .. })
        ));
        acquire_instrument_lock(dir.path(), "000002-other").unwrap();
        drop(lock);
        acquire_instrument_lock(dir.path(), "601899-bdl-1y-1").unwrap();
    }

    #[test]
    fn lock_file_name_is_sanitized() {
        assert_eq!(lock_file_stem("601899-bdl-1y-1"), "601899-bdl-1y-1");
        assert_eq!(lock_file_stem("a/b see:d"), "a_b_see_d");
    }

    #[test]
    fn pacing_draw_stays_in_bounds() {
        let pacing = SettlePacing::new(20, 30);
        for _ in 0..200 {
            let secs = pacing.draw_secs();
            assert!((20..=30).contains(&secs));
        }
        assert_eq!(SettlePacing::none().draw_secs(), 0);
        // Inverted bounds are normalized rather than panicking in gen_range.
        let inverted = SettlePacing::new(9, 3);
        for _ in 0..50 {
            assert!((3..=9).contains(&inverted.draw_secs()));
        }
    }

    #[test]
    fn submission_key_is_deterministic_and_step_specific() {
        let a = submission_key("601899-bdl-1y-1", "data1y", SweepStep::Index(363));
        let b = submission_key("601899-bdl-1y-1", "data1y", SweepStep::Index(363));
        let c = submission_key("601899-bdl-1y-1", "data1y", SweepStep::Index(364));
        let d = submission_key("601899-bdl-1y-1", "data1y", SweepStep::Baseline);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn record_body_is_flat() {
        let record = ResultRecord {
            instrument: "601899-bdl-1y-1".to_string(),
            dataset: "data1y".to_string(),
            step: SweepStep::Index(7),
            params: vec![
                RecordedParam {
                    name: "multiplier".to_string(),
                    value: 3.5,
                    position: 1,
                },
                RecordedParam {
                    name: "danbian".to_string(),
                    value: 0.84,
                    position: 2,
                },
            ],
            metrics: BTreeMap::from([("return_rate".to_string(), 0.1234)]),
            request_id: "abc123".to_string(),
        };
        let body = record_body(&record);
        assert_eq!(body["stock_no"], "601899-bdl-1y-1");
        assert_eq!(body["multiplier"], 3.5);
        assert_eq!(body["multiplier_index"], 1);
        assert_eq!(body["danbian"], 0.84);
        assert_eq!(body["danbian_index"], 2);
        assert_eq!(body["return_rate"], 0.1234);
        assert_eq!(body["request_id"], "abc123");
        assert!(body.get("dataset").is_none());
    }

    #[test]
    fn positions_accept_integral_floats_only() {
        assert_eq!(position_from(&json!(3)), Some(3));
        assert_eq!(position_from(&json!(3.0)), Some(3));
        assert_eq!(position_from(&json!(0)), Some(0));
        assert_eq!(position_from(&json!(3.5)), None);
        assert_eq!(position_from(&json!(-1)), None);
        assert_eq!(position_from(&json!("3")), None);
    }
}
