use crate::config::{AggregationName, AggregationRequest, ProcessorConfig};
use crate::error::{AtspmError, Result};
use crate::services::aggregation::arrivals::{arrival_on_green, yellow_red};
use crate::services::aggregation::counts::{
    self, ActuationRow, DetectorFaultRow, HasDataRow,
};
use crate::services::aggregation::mapper::{resolve, Measure, MeasureConfig, MeasureResult};
use crate::services::aggregation::occupancy::split_failures;
use crate::services::aggregation::stages::{self, PlannedStep};
use crate::services::aggregation::timeline::{reconstruct, Timeline, TimelineRow};
use crate::services::aggregation::types::{
    codes, DeviceId, EventClass, OutputTable, RawEvent, TableRow,
};
use crate::services::health::anomaly::{detector_health, HealthInputs};
use crate::services::loader::{load_inputs, LoadRequest, LoadedInputs, ALL_EVENTS, RAW_DATA};
use crate::services::session::AnalyticalSession;
use crate::services::sink::TableSink;
use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

const MEASURE_CODES: [i16; 5] = [
    codes::PHASE_BEGIN_GREEN,
    codes::PHASE_BEGIN_YELLOW,
    codes::PHASE_BEGIN_RED_CLEARANCE,
    codes::DETECTOR_OFF,
    codes::DETECTOR_ON,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Idle,
    Loaded,
    Aggregated,
    Saved,
    Closed,
}

impl ProcessorState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Loaded => "loaded",
            Self::Aggregated => "aggregated",
            Self::Saved => "saved",
            Self::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded { rows: usize },
    Failed { reason: String },
    /// The measure had no usable detector configuration.
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepReport {
    pub name: AggregationName,
    #[serde(flatten)]
    pub status: StepStatus,
    pub duration_ms: u64,
    pub requested: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunReport {
    pub steps: Vec<StepReport>,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn step(&self, name: AggregationName) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn succeeded(&self, name: AggregationName) -> bool {
        matches!(
            self.step(name).map(|s| &s.status),
            Some(StepStatus::Succeeded { .. })
        )
    }

    pub fn failures(&self) -> impl Iterator<Item = &StepReport> + '_ {
        self.steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Failed { .. }))
    }
}

enum StepOutcome {
    Table(OutputTable),
    Disabled(String),
}

type BinKey = (DeviceId, NaiveDateTime);

/// Typed outputs later stages read.
#[derive(Default)]
struct Intermediates {
    has_data: Option<Vec<HasDataRow>>,
    complete_bins: Option<HashSet<BinKey>>,
    actuations: Option<Vec<ActuationRow>>,
    detector_faults: Option<Vec<DetectorFaultRow>>,
}

struct StageContext<'a> {
    session: &'a AnalyticalSession,
    loaded: &'a LoadedInputs,
    bin_size: u32,
    remove_incomplete: bool,
}

/// Runs one batch: load, aggregate, save, close.
pub struct SignalDataProcessor {
    config: ProcessorConfig,
    state: ProcessorState,
    session: Option<AnalyticalSession>,
    loaded: Option<LoadedInputs>,
    plan: Vec<PlannedStep>,
    tables: BTreeMap<AggregationName, OutputTable>,
    report: Option<RunReport>,
}

impl SignalDataProcessor {
    pub fn new(config: ProcessorConfig) -> Result<Self> {
        config.validate()?;
        let plan = stages::plan(&config);
        Ok(Self {
            config,
            state: ProcessorState::Idle,
            session: None,
            loaded: None,
            plan,
            tables: BTreeMap::new(),
            report: None,
        })
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn state(&self) -> ProcessorState {
        self.state
    }

    pub fn plan(&self) -> &[PlannedStep] {
        &self.plan
    }

    pub fn loaded(&self) -> Option<&LoadedInputs> {
        self.loaded.as_ref()
    }

    fn invalid_state(&self, expected: &'static str) -> AtspmError {
        AtspmError::InvalidState {
            expected,
            actual: self.state.as_str(),
        }
    }

    pub fn load(&mut self, request: LoadRequest) -> Result<()> {
        match self.state {
            ProcessorState::Idle => {}
            ProcessorState::Closed => return Err(self.invalid_state("idle")),
            other => {
                tracing::warn!(state = other.as_str(), "inputs already loaded; ignoring load()");
                return Ok(());
            }
        }

        let grouping = self.config.detector_health_grouping();
        if !grouping.is_empty() && request.device_groups.is_none() {
            return Err(AtspmError::MissingGroupTable {
                levels: grouping.iter().map(|l| l.as_str().to_string()).collect(),
            });
        }

        let started = Instant::now();
        let session = AnalyticalSession::open(self.config.threads)?;
        let loaded = match load_inputs(&session, &request) {
            Ok(loaded) => loaded,
            Err(err) => {
                if let Err(close_err) = session.close() {
                    tracing::warn!(error = %close_err, "failed to close session after load error");
                }
                return Err(err);
            }
        };
        tracing::info!(
            rows_read = loaded.raw_data.rows_read,
            out_of_range = loaded.raw_data.out_of_range,
            duplicates = loaded.raw_data.duplicates,
            rows_loaded = loaded.raw_data.rows_loaded,
            supplement_rows = loaded.unmatched_events.as_ref().map(|s| s.rows_loaded),
            detectors = loaded.detector_config.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "loaded inputs"
        );
        self.session = Some(session);
        self.loaded = Some(loaded);
        self.state = ProcessorState::Loaded;
        Ok(())
    }

    pub fn aggregate(&mut self) -> Result<RunReport> {
        match self.state {
            ProcessorState::Loaded => {}
            ProcessorState::Aggregated | ProcessorState::Saved => {
                tracing::warn!(state = self.state.as_str(), "aggregations already ran");
                return Ok(self.report.clone().unwrap_or_default());
            }
            _ => return Err(self.invalid_state("loaded")),
        }
        let (Some(session), Some(loaded)) = (self.session.as_ref(), self.loaded.as_ref()) else {
            return Err(self.invalid_state("loaded"));
        };
        let ctx = StageContext {
            session,
            loaded,
            bin_size: self.config.bin_size,
            remove_incomplete: self.config.remove_incomplete,
        };

        let run_started = Instant::now();
        let mut intermediates = Intermediates::default();
        let mut report = RunReport::default();
        for step in &self.plan {
            let name = step.name();
            let started = Instant::now();
            tracing::info!(step = %name, requested = step.requested, "aggregation step started");

            let failed_dependency = stages::dependencies(name, ctx.remove_incomplete)
                .into_iter()
                .find(|dep| !report.succeeded(*dep));
            let status = match failed_dependency {
                Some(dependency) => {
                    let err = AtspmError::DependencyFailed {
                        step: name.to_string(),
                        dependency: dependency.to_string(),
                    };
                    tracing::warn!(step = %name, dependency = %dependency, "aggregation step skipped");
                    StepStatus::Failed {
                        reason: err.to_string(),
                    }
                }
                None => match run_stage(&ctx, &mut intermediates, &step.request) {
                    Ok(StepOutcome::Table(table)) => {
                        let rows = table.len();
                        self.tables.insert(name, table);
                        StepStatus::Succeeded { rows }
                    }
                    Ok(StepOutcome::Disabled(reason)) => {
                        tracing::warn!(step = %name, reason = %reason, "measure disabled for this run");
                        StepStatus::Skipped { reason }
                    }
                    Err(err) => {
                        let err = AtspmError::step(name.as_str(), err);
                        tracing::warn!(step = %name, error = %err, "aggregation step failed");
                        StepStatus::Failed {
                            reason: err.to_string(),
                        }
                    }
                },
            };

            let duration_ms = started.elapsed().as_millis() as u64;
            if let StepStatus::Succeeded { rows } = status {
                tracing::info!(step = %name, rows, duration_ms, "aggregation step finished");
            }
            report.steps.push(StepReport {
                name,
                status,
                duration_ms,
                requested: step.requested,
            });
        }
        report.duration_ms = run_started.elapsed().as_millis() as u64;
        tracing::info!(
            steps = report.steps.len(),
            failed = report.failures().count(),
            duration_ms = report.duration_ms,
            "aggregation run finished"
        );

        self.report = Some(report.clone());
        self.state = ProcessorState::Aggregated;
        Ok(report)
    }

    pub fn table(&self, name: AggregationName) -> Option<&OutputTable> {
        self.tables.get(&name)
    }

    pub fn report(&self) -> Option<&RunReport> {
        self.report.as_ref()
    }

    /// Hands every requested table that was produced to `sink`, in execution order.
    pub fn save(&mut self, sink: &mut dyn TableSink) -> Result<()> {
        if !matches!(
            self.state,
            ProcessorState::Aggregated | ProcessorState::Saved
        ) {
            return Err(self.invalid_state("aggregated"));
        }
        let started = Instant::now();
        let mut written = 0usize;
        for step in self.plan.iter().filter(|s| s.requested) {
            let Some(table) = self.tables.get(&step.name()) else {
                tracing::debug!(table = %step.name(), "no output to save");
                continue;
            };
            sink.write_table(table)?;
            written += 1;
        }
        tracing::info!(
            tables = written,
            duration_ms = started.elapsed().as_millis() as u64,
            "saved aggregation outputs"
        );
        self.state = ProcessorState::Saved;
        Ok(())
    }

    /// Releases the analytical session. Later calls are no-ops.
    pub fn close(&mut self) -> Result<()> {
        self.state = ProcessorState::Closed;
        if let Some(session) = self.session.take() {
            session.close()?;
            tracing::debug!("closed analytical session");
        }
        Ok(())
    }

    fn process(&mut self, request: LoadRequest, sink: &mut dyn TableSink) -> Result<RunReport> {
        self.load(request)?;
        let report = self.aggregate()?;
        self.save(sink)?;
        Ok(report)
    }

    pub fn run(&mut self, request: LoadRequest, sink: &mut dyn TableSink) -> Result<RunReport> {
        let outcome = self.process(request, sink);
        let closed = self.close();
        let report = outcome?;
        closed?;
        Ok(report)
    }
}

fn retain_complete<R: TableRow>(rows: Vec<R>, complete: Option<&HashSet<BinKey>>) -> Vec<R> {
    let Some(complete) = complete else {
        return rows;
    };
    rows.into_iter()
        .filter(|row| row.bin_key().map_or(true, |key| complete.contains(&key)))
        .collect()
}

fn rebuild_timeline(ctx: &StageContext<'_>, chatter_tolerance_ms: u64) -> Result<Timeline> {
    let events = ctx.session.fetch_events(ALL_EVENTS, &EventClass::codes())?;
    let horizon = ctx.session.max_timestamp(ALL_EVENTS)?;
    let timeline = reconstruct(&events, horizon, chatter_tolerance_ms);
    tracing::debug!(
        intervals = timeline.intervals.len(),
        unmatched = timeline.unmatched().count(),
        merged_gaps = timeline.merged_gaps,
        "rebuilt event timeline"
    );
    Ok(timeline)
}

fn measure_inputs(
    ctx: &StageContext<'_>,
    measure: Measure,
) -> Result<std::result::Result<(MeasureConfig, Vec<RawEvent>), String>> {
    match resolve(measure, &ctx.loaded.detector_config) {
        MeasureResult::Disabled(reason) => Ok(Err(reason)),
        MeasureResult::Enabled(config) => {
            let events = ctx.session.fetch_events(RAW_DATA, &MEASURE_CODES)?;
            Ok(Ok((config, events)))
        }
    }
}

fn run_stage(
    ctx: &StageContext<'_>,
    intermediates: &mut Intermediates,
    request: &AggregationRequest,
) -> Result<StepOutcome> {
    let name = request.name();
    let label = name.as_str();
    let bin_size = ctx.bin_size;
    let complete = if ctx.remove_incomplete && stages::filters_on_completeness(name) {
        let bins = intermediates
            .complete_bins
            .as_ref()
            .ok_or_else(|| AtspmError::DependencyFailed {
                step: label.to_string(),
                dependency: AggregationName::HasData.to_string(),
            })?;
        Some(bins)
    } else {
        None
    };

    let table = match request {
        AggregationRequest::HasData(params) => {
            let rows = counts::has_data(ctx.session, bin_size, params.no_data_min)?;
            let table = OutputTable::from_rows(label, &rows);
            intermediates.complete_bins =
                Some(rows.iter().map(|r| (r.device_id, r.timestamp)).collect());
            intermediates.has_data = Some(rows);
            table
        }
        AggregationRequest::Actuations => {
            let rows = retain_complete(counts::actuations(ctx.session, bin_size)?, complete);
            let table = OutputTable::from_rows(label, &rows);
            intermediates.actuations = Some(rows);
            table
        }
        AggregationRequest::Communications => {
            let rows = retain_complete(counts::communications(ctx.session, bin_size)?, complete);
            OutputTable::from_rows(label, &rows)
        }
        AggregationRequest::Terminations => {
            let rows = retain_complete(counts::terminations(ctx.session, bin_size)?, complete);
            OutputTable::from_rows(label, &rows)
        }
        AggregationRequest::DetectorFaults => {
            let rows = retain_complete(counts::detector_faults(ctx.session, bin_size)?, complete);
            let table = OutputTable::from_rows(label, &rows);
            intermediates.detector_faults = Some(rows);
            table
        }
        AggregationRequest::Timeline(params) => {
            let timeline = rebuild_timeline(ctx, params.chatter_tolerance_ms)?;
            let rows: Vec<TimelineRow> =
                timeline.closed().filter_map(TimelineRow::from_closed).collect();
            OutputTable::from_rows(label, &rows)
        }
        AggregationRequest::UnmatchedEvents(params) => {
            let timeline = rebuild_timeline(ctx, params.chatter_tolerance_ms)?;
            OutputTable::from_rows(label, &timeline.unmatched_events())
        }
        AggregationRequest::SplitFailures(params) => {
            let (config, events) = match measure_inputs(ctx, Measure::SplitFailure)? {
                Ok(inputs) => inputs,
                Err(reason) => return Ok(StepOutcome::Disabled(reason)),
            };
            let rows = retain_complete(split_failures(&config, &events, params, bin_size), complete);
            OutputTable::from_rows(label, &rows)
        }
        AggregationRequest::YellowRed(params) => {
            let (config, events) = match measure_inputs(ctx, Measure::YellowRed)? {
                Ok(inputs) => inputs,
                Err(reason) => return Ok(StepOutcome::Disabled(reason)),
            };
            let rows = yellow_red(&config, &events, params.latency_offset, bin_size);
            OutputTable::from_rows(label, &retain_complete(rows, complete))
        }
        AggregationRequest::ArrivalOnGreen(params) => {
            let (config, events) = match measure_inputs(ctx, Measure::ArrivalOnGreen)? {
                Ok(inputs) => inputs,
                Err(reason) => return Ok(StepOutcome::Disabled(reason)),
            };
            let rows = arrival_on_green(&config, &events, params.latency_offset, bin_size);
            OutputTable::from_rows(label, &retain_complete(rows, complete))
        }
        AggregationRequest::DetectorHealth(params) => {
            let missing = |dependency: AggregationName| AtspmError::DependencyFailed {
                step: label.to_string(),
                dependency: dependency.to_string(),
            };
            let has_data = intermediates
                .has_data
                .as_deref()
                .ok_or_else(|| missing(AggregationName::HasData))?;
            let actuations = intermediates
                .actuations
                .as_deref()
                .ok_or_else(|| missing(AggregationName::Actuations))?;
            let detector_faults = intermediates
                .detector_faults
                .as_deref()
                .ok_or_else(|| missing(AggregationName::DetectorFaults))?;
            let inputs = HealthInputs {
                has_data,
                actuations,
                detector_faults,
                device_groups: ctx.loaded.device_groups.as_deref().unwrap_or(&[]),
            };
            let rows = retain_complete(detector_health(&inputs, params, bin_size), complete);
            OutputTable::from_rows(label, &rows)
        }
    };
    Ok(StepOutcome::Table(table))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DetectorHealthParams, GroupLevel, HasDataParams, TimelineParams};
    use crate::services::aggregation::types::Cell;
    use crate::services::loader::{EventSource, TableSource};
    use crate::services::sink::MemorySink;
    use crate::test_support::{detector, detector_pulse, phase_cycle, to_records, ts};

    fn events() -> Vec<RawEvent> {
        let mut events = phase_cycle(ts("2024-03-05 08:00:00"), 1, 2);
        for on in ["2024-03-05 08:01:00", "2024-03-05 08:06:00", "2024-03-05 08:11:00", "2024-03-05 08:16:00"] {
            events.extend(detector_pulse(ts(on), 2.0, 1, 5));
        }
        events
    }

    fn request() -> LoadRequest {
        LoadRequest::new(
            EventSource::Records(to_records(&events())),
            TableSource::Records(vec![detector(1, 2, 5, "Presence")]),
        )
    }

    fn processor(aggregations: Vec<AggregationRequest>) -> anyhow::Result<SignalDataProcessor> {
        let mut config = ProcessorConfig::new(aggregations);
        config.threads = Some(1);
        Ok(SignalDataProcessor::new(config)?)
    }

    #[test]
    fn lifecycle_rejects_out_of_order_calls() -> anyhow::Result<()> {
        let mut processor = processor(vec![AggregationRequest::Actuations])?;
        assert!(matches!(
            processor.aggregate(),
            Err(AtspmError::InvalidState { .. })
        ));
        let mut sink = MemorySink::new();
        assert!(processor.save(&mut sink).is_err());

        processor.load(request())?;
        processor.load(request())?;
        assert_eq!(processor.state(), ProcessorState::Loaded);
        assert_eq!(processor.loaded().map(|l| l.raw_data.rows_loaded), Some(11));

        processor.aggregate()?;
        processor.save(&mut sink)?;
        processor.close()?;
        processor.close()?;
        assert!(processor.load(request()).is_err());
        Ok(())
    }

    #[test]
    fn grouping_without_group_table_is_fatal() -> anyhow::Result<()> {
        let mut processor = processor(vec![AggregationRequest::DetectorHealth(
            DetectorHealthParams {
                grouping: vec![GroupLevel::District],
                ..DetectorHealthParams::default()
            },
        )])?;
        let err = processor.load(request()).unwrap_err();
        assert!(matches!(err, AtspmError::MissingGroupTable { .. }));
        assert!(err.is_fatal_input());
        assert_eq!(processor.state(), ProcessorState::Idle);
        Ok(())
    }

    #[test]
    fn unconfigured_measures_are_skipped_not_failed() -> anyhow::Result<()> {
        let mut processor = processor(vec![
            AggregationRequest::ArrivalOnGreen(Default::default()),
            AggregationRequest::SplitFailures(Default::default()),
            AggregationRequest::Actuations,
        ])?;
        processor.load(request())?;
        let report = processor.aggregate()?;
        assert!(matches!(
            report.step(AggregationName::ArrivalOnGreen).map(|s| &s.status),
            Some(StepStatus::Skipped { .. })
        ));
        assert!(report.succeeded(AggregationName::SplitFailures));
        assert!(report.succeeded(AggregationName::Actuations));
        assert!(processor.table(AggregationName::ArrivalOnGreen).is_none());
        assert_eq!(
            processor.table(AggregationName::SplitFailures).map(OutputTable::len),
            Some(1)
        );
        Ok(())
    }

    #[test]
    fn incomplete_bins_are_removed() -> anyhow::Result<()> {
        let mut config = ProcessorConfig::new(vec![AggregationRequest::Actuations]);
        config.remove_incomplete = true;
        let mut processor = SignalDataProcessor::new(config)?;
        processor.load(request())?;
        let report = processor.aggregate()?;
        let has_data = report.step(AggregationName::HasData);
        assert_eq!(has_data.map(|s| s.requested), Some(false));

        let Some(actuations) = processor.table(AggregationName::Actuations) else {
            panic!("actuations missing");
        };
        assert_eq!(actuations.len(), 1);
        let timestamps = actuations.column("TimeStamp").unwrap_or_default();
        assert_eq!(timestamps, vec![&Cell::Timestamp(Some(ts("2024-03-05 08:00:00")))]);

        let mut sink = MemorySink::new();
        processor.save(&mut sink)?;
        assert_eq!(sink.names(), vec!["actuations"]);
        Ok(())
    }

    #[test]
    fn failed_step_does_not_stop_independent_steps() -> anyhow::Result<()> {
        let mut processor = processor(vec![
            AggregationRequest::Timeline(TimelineParams::default()),
            AggregationRequest::HasData(HasDataParams::default()),
            AggregationRequest::DetectorHealth(DetectorHealthParams::default()),
        ])?;
        processor.load(request())?;
        if let Some(session) = processor.session.as_ref() {
            session.execute_batch(
                "DROP VIEW all_events; ALTER TABLE raw_data RENAME COLUMN EventId TO Code;",
            )?;
        }
        let report = processor.aggregate()?;
        assert!(report.succeeded(AggregationName::HasData));
        assert!(!report.succeeded(AggregationName::Timeline));
        assert!(!report.succeeded(AggregationName::Actuations));
        let Some(StepStatus::Failed { reason }) =
            report.step(AggregationName::DetectorHealth).map(|s| s.status.clone())
        else {
            panic!("detector_health should fail");
        };
        assert!(reason.contains("actuations"));
        let Some(StepStatus::Failed { reason }) =
            report.step(AggregationName::Timeline).map(|s| s.status.clone())
        else {
            panic!("timeline should fail");
        };
        assert!(reason.starts_with("aggregation timeline failed: duckdb:"));
        assert_eq!(report.failures().count(), 4);
        Ok(())
    }
}
