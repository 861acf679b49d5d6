use crate::error::{AtspmError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

pub const DEFAULT_BIN_SIZE_MINUTES: u32 = 15;
pub const DEFAULT_NO_DATA_MIN: u32 = 5;
const THREADS_ENV: &str = "ATSPM_THREADS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationName {
    HasData,
    Actuations,
    Communications,
    Terminations,
    DetectorFaults,
    Timeline,
    UnmatchedEvents,
    SplitFailures,
    YellowRed,
    ArrivalOnGreen,
    DetectorHealth,
}

impl AggregationName {
    pub const ALL: [AggregationName; 11] = [
        AggregationName::HasData,
        AggregationName::Actuations,
        AggregationName::Communications,
        AggregationName::Terminations,
        AggregationName::DetectorFaults,
        AggregationName::Timeline,
        AggregationName::UnmatchedEvents,
        AggregationName::SplitFailures,
        AggregationName::YellowRed,
        AggregationName::ArrivalOnGreen,
        AggregationName::DetectorHealth,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HasData => "has_data",
            Self::Actuations => "actuations",
            Self::Communications => "communications",
            Self::Terminations => "terminations",
            Self::DetectorFaults => "detector_faults",
            Self::Timeline => "timeline",
            Self::UnmatchedEvents => "unmatched_events",
            Self::SplitFailures => "split_failures",
            Self::YellowRed => "yellow_red",
            Self::ArrivalOnGreen => "arrival_on_green",
            Self::DetectorHealth => "detector_health",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|name| name.as_str() == raw.trim())
    }
}

impl std::fmt::Display for AggregationName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HasDataParams {
    /// Completeness granularity in minutes; every sub-window of this width must carry an event.
    pub no_data_min: u32,
}

impl Default for HasDataParams {
    fn default() -> Self {
        Self {
            no_data_min: DEFAULT_NO_DATA_MIN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TimelineParams {
    /// Off→on gaps shorter than this are merged into one interval.
    pub chatter_tolerance_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SplitFailureParams {
    pub by_approach: bool,
    pub green_occupancy_threshold: f64,
    pub red_occupancy_threshold: f64,
    /// Seconds after the start of red at which the cycle barrier is placed.
    pub barrier_offset: f64,
    pub chatter_tolerance_ms: u64,
}

impl Default for SplitFailureParams {
    fn default() -> Self {
        Self {
            by_approach: true,
            green_occupancy_threshold: 0.80,
            red_occupancy_threshold: 0.80,
            barrier_offset: 5.0,
            chatter_tolerance_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct YellowRedParams {
    /// Seconds added to detector-on timestamps.
    pub latency_offset: f64,
}

impl Default for YellowRedParams {
    fn default() -> Self {
        Self {
            latency_offset: 1.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ArrivalOnGreenParams {
    pub latency_offset: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupLevel {
    District,
    Corridor,
}

impl GroupLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::District => "district",
            Self::Corridor => "corridor",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DetectorHealthParams {
    pub decomposition_window_days: u32,
    /// Minimum observations inside the rolling window before a baseline is emitted.
    pub min_periods: usize,
    pub z_threshold: f64,
    pub geh_threshold: f64,
    pub grouping: Vec<GroupLevel>,
    pub return_last_n_days: u32,
    pub day_start_hour: u32,
    pub day_end_hour: u32,
    pub early_morning_end_hour: u32,
    pub excessive_ratio: f64,
    pub excessive_min_count: i64,
    pub early_morning_ratio: f64,
    pub early_morning_min_count: i64,
}

impl Default for DetectorHealthParams {
    fn default() -> Self {
        Self {
            decomposition_window_days: 7,
            min_periods: 50,
            z_threshold: 3.5,
            geh_threshold: 5.0,
            grouping: Vec::new(),
            return_last_n_days: 1,
            day_start_hour: 6,
            day_end_hour: 18,
            early_morning_end_hour: 5,
            excessive_ratio: 3.0,
            excessive_min_count: 40,
            early_morning_ratio: 0.75,
            early_morning_min_count: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NoParams {}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawAggregationRequest")]
pub enum AggregationRequest {
    HasData(HasDataParams),
    Actuations,
    Communications,
    Terminations,
    DetectorFaults,
    Timeline(TimelineParams),
    UnmatchedEvents(TimelineParams),
    SplitFailures(SplitFailureParams),
    YellowRed(YellowRedParams),
    ArrivalOnGreen(ArrivalOnGreenParams),
    DetectorHealth(DetectorHealthParams),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAggregationRequest {
    name: String,
    #[serde(default)]
    params: serde_json::Value,
}

fn parse_params<T: serde::de::DeserializeOwned>(
    name: &str,
    params: serde_json::Value,
) -> std::result::Result<T, String> {
    let params = if params.is_null() {
        serde_json::Value::Object(Default::default())
    } else {
        params
    };
    serde_json::from_value(params).map_err(|err| format!("invalid params for {name}: {err}"))
}

impl TryFrom<RawAggregationRequest> for AggregationRequest {
    type Error = String;

    fn try_from(raw: RawAggregationRequest) -> std::result::Result<Self, Self::Error> {
        let name = AggregationName::parse(&raw.name)
            .ok_or_else(|| format!("unknown aggregation name {:?}", raw.name))?;
        let label = name.as_str();
        let params = raw.params;
        Ok(match name {
            AggregationName::HasData => Self::HasData(parse_params(label, params)?),
            AggregationName::Timeline => Self::Timeline(parse_params(label, params)?),
            AggregationName::UnmatchedEvents => {
                Self::UnmatchedEvents(parse_params(label, params)?)
            }
            AggregationName::SplitFailures => Self::SplitFailures(parse_params(label, params)?),
            AggregationName::YellowRed => Self::YellowRed(parse_params(label, params)?),
            AggregationName::ArrivalOnGreen => Self::ArrivalOnGreen(parse_params(label, params)?),
            AggregationName::DetectorHealth => Self::DetectorHealth(parse_params(label, params)?),
            AggregationName::Actuations
            | AggregationName::Communications
            | AggregationName::Terminations
            | AggregationName::DetectorFaults => {
                let _: NoParams = parse_params(label, params)?;
                match name {
                    AggregationName::Actuations => Self::Actuations,
                    AggregationName::Communications => Self::Communications,
                    AggregationName::Terminations => Self::Terminations,
                    _ => Self::DetectorFaults,
                }
            }
        })
    }
}

impl AggregationRequest {
    pub fn name(&self) -> AggregationName {
        match self {
            Self::HasData(_) => AggregationName::HasData,
            Self::Actuations => AggregationName::Actuations,
            Self::Communications => AggregationName::Communications,
            Self::Terminations => AggregationName::Terminations,
            Self::DetectorFaults => AggregationName::DetectorFaults,
            Self::Timeline(_) => AggregationName::Timeline,
            Self::UnmatchedEvents(_) => AggregationName::UnmatchedEvents,
            Self::SplitFailures(_) => AggregationName::SplitFailures,
            Self::YellowRed(_) => AggregationName::YellowRed,
            Self::ArrivalOnGreen(_) => AggregationName::ArrivalOnGreen,
            Self::DetectorHealth(_) => AggregationName::DetectorHealth,
        }
    }

    /// Default parameters for an aggregation that is pulled in only as a dependency.
    pub fn implicit(name: AggregationName) -> Self {
        match name {
            AggregationName::HasData => Self::HasData(HasDataParams::default()),
            AggregationName::Actuations => Self::Actuations,
            AggregationName::Communications => Self::Communications,
            AggregationName::Terminations => Self::Terminations,
            AggregationName::DetectorFaults => Self::DetectorFaults,
            AggregationName::Timeline => Self::Timeline(TimelineParams::default()),
            AggregationName::UnmatchedEvents => Self::UnmatchedEvents(TimelineParams::default()),
            AggregationName::SplitFailures => Self::SplitFailures(SplitFailureParams::default()),
            AggregationName::YellowRed => Self::YellowRed(YellowRedParams::default()),
            AggregationName::ArrivalOnGreen => {
                Self::ArrivalOnGreen(ArrivalOnGreenParams::default())
            }
            AggregationName::DetectorHealth => {
                Self::DetectorHealth(DetectorHealthParams::default())
            }
        }
    }
}

fn default_bin_size() -> u32 {
    DEFAULT_BIN_SIZE_MINUTES
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessorConfig {
    #[serde(default = "default_bin_size")]
    pub bin_size: u32,
    #[serde(default)]
    pub remove_incomplete: bool,
    /// Engine worker threads; left to DuckDB when unset.
    #[serde(default)]
    pub threads: Option<usize>,
    pub aggregations: Vec<AggregationRequest>,
}

impl ProcessorConfig {
    pub fn new(aggregations: Vec<AggregationRequest>) -> Self {
        Self {
            bin_size: DEFAULT_BIN_SIZE_MINUTES,
            remove_incomplete: false,
            threads: None,
            aggregations,
        }
    }

    pub fn from_json_str(contents: &str) -> Result<Self> {
        let mut config: ProcessorConfig =
            serde_json::from_str(contents).map_err(|err| AtspmError::config(err.to_string()))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        let Ok(raw) = std::env::var(THREADS_ENV) else {
            return;
        };
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return;
        }
        match trimmed.parse::<usize>() {
            Ok(threads) if threads > 0 => self.threads = Some(threads),
            _ => tracing::warn!(
                env = THREADS_ENV,
                value = trimmed,
                "ignoring invalid thread override"
            ),
        }
    }

    pub fn request(&self, name: AggregationName) -> Option<&AggregationRequest> {
        self.aggregations.iter().find(|req| req.name() == name)
    }

    pub fn has_data_params(&self) -> HasDataParams {
        match self.request(AggregationName::HasData) {
            Some(AggregationRequest::HasData(params)) => *params,
            _ => HasDataParams::default(),
        }
    }

    pub fn detector_health_grouping(&self) -> Vec<GroupLevel> {
        match self.request(AggregationName::DetectorHealth) {
            Some(AggregationRequest::DetectorHealth(params)) => params.grouping.clone(),
            _ => Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.bin_size == 0 || self.bin_size > 1440 {
            return Err(AtspmError::config(format!(
                "bin_size must be between 1 and 1440 minutes (got {})",
                self.bin_size
            )));
        }
        if self.threads == Some(0) {
            return Err(AtspmError::config("threads must be at least 1"));
        }

        let mut seen = BTreeSet::new();
        for request in &self.aggregations {
            if !seen.insert(request.name()) {
                return Err(AtspmError::config(format!(
                    "aggregation {} requested more than once",
                    request.name()
                )));
            }
        }

        let plans_has_data = crate::services::aggregation::stages::plan(self)
            .iter()
            .any(|step| step.name() == AggregationName::HasData);
        if plans_has_data {
            let no_data_min = self.has_data_params().no_data_min;
            if no_data_min == 0 {
                return Err(AtspmError::config("no_data_min must be at least 1"));
            }
            if self.bin_size % no_data_min != 0 {
                return Err(AtspmError::config(format!(
                    "bin_size {} is not evenly divisible by no_data_min {}",
                    self.bin_size, no_data_min
                )));
            }
        }

        for request in &self.aggregations {
            match request {
                AggregationRequest::SplitFailures(params) => {
                    for (label, value) in [
                        ("green_occupancy_threshold", params.green_occupancy_threshold),
                        ("red_occupancy_threshold", params.red_occupancy_threshold),
                    ] {
                        if !(0.0..=1.0).contains(&value) {
                            return Err(AtspmError::config(format!(
                                "{label} must be within [0, 1] (got {value})"
                            )));
                        }
                    }
                    if !(params.barrier_offset.is_finite() && params.barrier_offset > 0.0) {
                        return Err(AtspmError::config("barrier_offset must be positive"));
                    }
                }
                AggregationRequest::YellowRed(YellowRedParams { latency_offset })
                | AggregationRequest::ArrivalOnGreen(ArrivalOnGreenParams { latency_offset }) => {
                    if !latency_offset.is_finite() {
                        return Err(AtspmError::config("latency_offset must be finite"));
                    }
                }
                AggregationRequest::DetectorHealth(params) => {
                    if params.decomposition_window_days == 0 || params.min_periods == 0 {
                        return Err(AtspmError::config(
                            "decomposition_window_days and min_periods must be positive",
                        ));
                    }
                    if !(params.z_threshold > 0.0 && params.geh_threshold >= 0.0) {
                        return Err(AtspmError::config(
                            "z_threshold must be positive and geh_threshold non-negative",
                        ));
                    }
                    if params.return_last_n_days == 0 {
                        return Err(AtspmError::config("return_last_n_days must be positive"));
                    }
                    if params.day_start_hour >= params.day_end_hour || params.day_end_hour > 24 {
                        return Err(AtspmError::config(
                            "day_start_hour must be before day_end_hour",
                        ));
                    }
                    if params.early_morning_end_hour > 24 {
                        return Err(AtspmError::config("early_morning_end_hour must be <= 24"));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Parquet,
    Csv,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Parquet => "parquet",
            Self::Csv => "csv",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    pub dir: PathBuf,
    #[serde(default)]
    pub format: OutputFormat,
    #[serde(default)]
    pub separate_folders: bool,
    #[serde(default)]
    pub file_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputPaths {
    pub raw_data: PathBuf,
    #[serde(default)]
    pub detector_config: Option<PathBuf>,
    #[serde(default)]
    pub unmatched_events: Option<PathBuf>,
    #[serde(default)]
    pub device_groups: Option<PathBuf>,
}

/// File-level configuration consumed by the `atspm` binary.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub processor: ProcessorConfig,
    pub inputs: InputPaths,
    pub output: OutputConfig,
}

impl RunConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: RunConfig = serde_json::from_str(&contents)
            .map_err(|err| AtspmError::config(format!("{}: {err}", path.display())))?;
        config.processor.apply_env_overrides();
        config.processor.validate()?;
        Ok(config)
    }
}
