use crate::config::SplitFailureParams;
use crate::services::aggregation::cycles::{cycles_by_phase, segment, Cycle};
use crate::services::aggregation::mapper::{combine_by_approach, MeasureConfig};
use crate::services::aggregation::timeline::pair_transitions;
use crate::services::aggregation::types::{
    col, Cell, Column, ColumnType, DeviceId, RawEvent, TableRow,
};
use crate::time::{floor_to_bin, overlap_seconds, seconds_between};
use chrono::{Duration, NaiveDateTime};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq)]
pub struct SplitFailureRow {
    /// Start of red for the cycle.
    pub timestamp: NaiveDateTime,
    pub bin: NaiveDateTime,
    pub device_id: DeviceId,
    pub phase: i16,
    pub detector: Option<i16>,
    pub cycle_id: i64,
    pub green_time: f64,
    pub green_occupancy: f64,
    pub red_occupancy: f64,
    pub split_failure: bool,
}

impl TableRow for SplitFailureRow {
    const COLUMNS: &'static [Column] = &[
        col("TimeStamp", ColumnType::Timestamp),
        col("DeviceId", ColumnType::Integer),
        col("Phase", ColumnType::Integer),
        col("Detector", ColumnType::Integer),
        col("CycleId", ColumnType::BigInt),
        col("Green_Time", ColumnType::Double),
        col("Green_Occupancy", ColumnType::Double),
        col("Red_Occupancy", ColumnType::Double),
        col("Split_Failure", ColumnType::Boolean),
    ];

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::Timestamp(Some(self.timestamp)),
            Cell::Int(Some(i64::from(self.device_id))),
            Cell::Int(Some(i64::from(self.phase))),
            Cell::Int(self.detector.map(i64::from)),
            Cell::Int(Some(self.cycle_id)),
            Cell::Float(Some(self.green_time)),
            Cell::Float(Some(self.green_occupancy)),
            Cell::Float(Some(self.red_occupancy)),
            Cell::Bool(self.split_failure),
        ]
    }

    fn bin_key(&self) -> Option<(DeviceId, NaiveDateTime)> {
        Some((self.device_id, self.bin))
    }
}

/// Both occupancies must reach their threshold.
pub fn is_split_failure(
    green_occupancy: f64,
    red_occupancy: f64,
    green_threshold: f64,
    red_threshold: f64,
) -> bool {
    red_occupancy >= red_threshold && green_occupancy >= green_threshold
}

/// Share of `window` covered by `spans`, which must be sorted and non-overlapping.
pub fn occupancy(spans: &[(NaiveDateTime, NaiveDateTime)], window: (NaiveDateTime, NaiveDateTime)) -> f64 {
    let (window_start, window_end) = window;
    let length = seconds_between(window_start, window_end);
    if length <= 0.0 {
        return 0.0;
    }
    let first = spans.partition_point(|(_, end)| *end <= window_start);
    let covered: f64 = spans[first..]
        .iter()
        .take_while(|(start, _)| *start < window_end)
        .map(|(start, end)| overlap_seconds(*start, *end, window_start, window_end))
        .sum();
    (covered / length).clamp(0.0, 1.0)
}

type DetectorKey = (DeviceId, i16, Option<i16>);

/// Green and red occupancy per cycle and detector (or approach), classified against thresholds.
pub fn split_failures(
    config: &MeasureConfig,
    events: &[RawEvent],
    params: &SplitFailureParams,
    bin_size: u32,
) -> Vec<SplitFailureRow> {
    let mut transitions = config.attach_phases(events);
    if params.by_approach {
        transitions = combine_by_approach(&transitions);
    }
    let pairing = pair_transitions(
        transitions
            .iter()
            .map(|t| ((t.device_id, t.phase, t.detector), t.timestamp, t.on))
            .collect(),
        None,
        Duration::milliseconds(i64::try_from(params.chatter_tolerance_ms).unwrap_or(i64::MAX)),
    );

    let mut spans: BTreeMap<DetectorKey, Vec<(NaiveDateTime, NaiveDateTime)>> = BTreeMap::new();
    for (key, start, end) in pairing.closed() {
        spans.entry(key).or_default().push((start, end));
    }
    for list in spans.values_mut() {
        list.sort();
    }

    // Every configured detector gets a row per cycle, even without actuations.
    let keys: BTreeSet<DetectorKey> = if params.by_approach {
        config
            .phases()
            .into_iter()
            .map(|(device, phase)| (device, phase, None))
            .collect()
    } else {
        config
            .channels
            .iter()
            .map(|((device, channel), phase)| (*device, *phase, Some(*channel)))
            .collect()
    };

    let cycles = cycles_by_phase(&segment(&config.phase_events(events), params.barrier_offset));
    let empty = Vec::new();
    let mut rows = Vec::new();
    for key in keys {
        let (device_id, phase, detector) = key;
        let Some(phase_cycles) = cycles.get(&(device_id, phase)) else {
            continue;
        };
        let detector_spans = spans.get(&key).unwrap_or(&empty);
        for cycle in phase_cycles {
            if let Some(row) = cycle_row(cycle, detector, detector_spans, params, bin_size) {
                rows.push(row);
            }
        }
    }
    rows.sort_by(|a, b| {
        (a.device_id, a.phase, a.detector, a.timestamp).cmp(&(
            b.device_id,
            b.phase,
            b.detector,
            b.timestamp,
        ))
    });
    rows
}

fn cycle_row(
    cycle: &Cycle,
    detector: Option<i16>,
    spans: &[(NaiveDateTime, NaiveDateTime)],
    params: &SplitFailureParams,
    bin_size: u32,
) -> Option<SplitFailureRow> {
    let green = cycle.green_window();
    let red = cycle.red_window();
    if green.1 <= green.0 || red.1 <= red.0 {
        return None;
    }
    let green_occupancy = occupancy(spans, green);
    let red_occupancy = occupancy(spans, red);
    Some(SplitFailureRow {
        timestamp: cycle.red_start,
        bin: floor_to_bin(cycle.red_start, bin_size),
        device_id: cycle.device_id,
        phase: cycle.phase,
        detector,
        cycle_id: cycle.cycle_id,
        green_time: seconds_between(green.0, green.1),
        green_occupancy,
        red_occupancy,
        split_failure: is_split_failure(
            green_occupancy,
            red_occupancy,
            params.green_occupancy_threshold,
            params.red_occupancy_threshold,
        ),
    })
}
