use crate::services::aggregation::cycles::{PhaseStates, SignalState};
use crate::services::aggregation::mapper::MeasureConfig;
use crate::services::aggregation::types::{
    col, Cell, Column, ColumnType, DeviceId, RawEvent, TableRow,
};
use crate::time::{floor_to_bin, seconds_between, shift_seconds};
use chrono::NaiveDateTime;
use std::collections::BTreeMap;

/// A detector actuation located in the phase state it arrived during.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Arrival {
    device_id: DeviceId,
    phase: i16,
    bin: NaiveDateTime,
    state: SignalState,
    since_state_start: f64,
}

/// Detector-on events shifted by `latency_offset`, paired with the phase state at arrival.
///
/// Actuations before the first phase event of their phase are dropped.
fn arrivals(
    config: &MeasureConfig,
    events: &[RawEvent],
    latency_offset: f64,
    bin_size: u32,
) -> Vec<Arrival> {
    let states = PhaseStates::from_events(&config.phase_events(events));
    config
        .attach_phases(events)
        .into_iter()
        .filter(|t| t.on)
        .filter_map(|t| {
            let arrival = shift_seconds(t.timestamp, latency_offset);
            let (state, since) = states.state_at(t.device_id, t.phase, arrival)?;
            Some(Arrival {
                device_id: t.device_id,
                phase: t.phase,
                bin: floor_to_bin(arrival, bin_size),
                state,
                since_state_start: seconds_between(since, arrival),
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct YellowRedRow {
    pub timestamp: NaiveDateTime,
    pub device_id: DeviceId,
    pub phase: i16,
    pub yellow_actuations: i64,
    pub red_actuations: i64,
    pub avg_red_offset: Option<f64>,
}

impl TableRow for YellowRedRow {
    const COLUMNS: &'static [Column] = &[
        col("TimeStamp", ColumnType::Timestamp),
        col("DeviceId", ColumnType::Integer),
        col("Phase", ColumnType::Integer),
        col("Yellow_Actuations", ColumnType::BigInt),
        col("Red_Actuations", ColumnType::BigInt),
        col("Avg_Red_Offset", ColumnType::Double),
    ];

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::Timestamp(Some(self.timestamp)),
            Cell::Int(Some(i64::from(self.device_id))),
            Cell::Int(Some(i64::from(self.phase))),
            Cell::Int(Some(self.yellow_actuations)),
            Cell::Int(Some(self.red_actuations)),
            Cell::Float(self.avg_red_offset),
        ]
    }

    fn bin_key(&self) -> Option<(DeviceId, NaiveDateTime)> {
        Some((self.device_id, self.timestamp))
    }
}

/// Actuations arriving on yellow or red per bin and phase, with the mean seconds into red.
pub fn yellow_red(
    config: &MeasureConfig,
    events: &[RawEvent],
    latency_offset: f64,
    bin_size: u32,
) -> Vec<YellowRedRow> {
    #[derive(Default)]
    struct Acc {
        yellow: i64,
        red: i64,
        red_offset_sum: f64,
    }

    let mut bins: BTreeMap<(DeviceId, i16, NaiveDateTime), Acc> = BTreeMap::new();
    for arrival in arrivals(config, events, latency_offset, bin_size) {
        let slot = (arrival.device_id, arrival.phase, arrival.bin);
        match arrival.state {
            SignalState::Green => {}
            SignalState::Yellow => bins.entry(slot).or_default().yellow += 1,
            SignalState::Red => {
                let acc = bins.entry(slot).or_default();
                acc.red += 1;
                acc.red_offset_sum += arrival.since_state_start;
            }
        }
    }

    bins.into_iter()
        .map(|((device_id, phase, timestamp), acc)| YellowRedRow {
            timestamp,
            device_id,
            phase,
            yellow_actuations: acc.yellow,
            red_actuations: acc.red,
            avg_red_offset: (acc.red > 0).then(|| acc.red_offset_sum / acc.red as f64),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArrivalOnGreenRow {
    pub timestamp: NaiveDateTime,
    pub device_id: DeviceId,
    pub phase: i16,
    pub total_actuations: i64,
    pub arrivals_on_green: i64,
    pub percent_aog: f64,
}

impl TableRow for ArrivalOnGreenRow {
    const COLUMNS: &'static [Column] = &[
        col("TimeStamp", ColumnType::Timestamp),
        col("DeviceId", ColumnType::Integer),
        col("Phase", ColumnType::Integer),
        col("Total_Actuations", ColumnType::BigInt),
        col("Arrivals_On_Green", ColumnType::BigInt),
        col("Percent_AOG", ColumnType::Double),
    ];

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::Timestamp(Some(self.timestamp)),
            Cell::Int(Some(i64::from(self.device_id))),
            Cell::Int(Some(i64::from(self.phase))),
            Cell::Int(Some(self.total_actuations)),
            Cell::Int(Some(self.arrivals_on_green)),
            Cell::Float(Some(self.percent_aog)),
        ]
    }

    fn bin_key(&self) -> Option<(DeviceId, NaiveDateTime)> {
        Some((self.device_id, self.timestamp))
    }
}

pub fn arrival_on_green(
    config: &MeasureConfig,
    events: &[RawEvent],
    latency_offset: f64,
    bin_size: u32,
) -> Vec<ArrivalOnGreenRow> {
    let mut bins: BTreeMap<(DeviceId, i16, NaiveDateTime), (i64, i64)> = BTreeMap::new();
    for arrival in arrivals(config, events, latency_offset, bin_size) {
        let counts = bins
            .entry((arrival.device_id, arrival.phase, arrival.bin))
            .or_default();
        counts.0 += 1;
        if arrival.state == SignalState::Green {
            counts.1 += 1;
        }
    }
    bins.into_iter()
        .map(|((device_id, phase, timestamp), (total, on_green))| ArrivalOnGreenRow {
            timestamp,
            device_id,
            phase,
            total_actuations: total,
            arrivals_on_green: on_green,
            percent_aog: on_green as f64 / total as f64,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::aggregation::mapper::{resolve, Measure, MeasureResult};
    use crate::test_support::{detector, event, phase_cycle, ts};

    fn measure(measure: Measure, function: &str) -> MeasureConfig {
        match resolve(measure, &[detector(1, 2, 7, function)]) {
            MeasureResult::Enabled(config) => config,
            MeasureResult::Disabled(reason) => panic!("{reason}"),
        }
    }

    fn scenario() -> Vec<RawEvent> {
        let mut events = phase_cycle(ts("2024-03-05 08:00:00"), 1, 2);
        events.extend([
            // Before any phase state: ignored.
            event("2024-03-05 07:59:50", 1, 82, 7),
            event("2024-03-05 08:00:05", 1, 82, 7),
            event("2024-03-05 08:00:19", 1, 82, 7),
            event("2024-03-05 08:00:25", 1, 82, 7),
            event("2024-03-05 08:00:30", 1, 82, 7),
            event("2024-03-05 08:00:31", 1, 81, 7),
        ]);
        events
    }

    #[test]
    fn latency_shifts_arrivals_into_later_states() {
        let config = measure(Measure::YellowRed, "Yellow_Red");
        let rows = yellow_red(&config, &scenario(), 1.5, 15);
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        // 08:00:19 + 1.5 s lands in yellow; 08:00:25 and 08:00:30 arrive 2.5 s and 7.5 s into red.
        assert_eq!(row.yellow_actuations, 1);
        assert_eq!(row.red_actuations, 2);
        assert_eq!(row.avg_red_offset, Some(5.0));

        let without_latency = yellow_red(&config, &scenario(), 0.0, 15);
        assert_eq!(without_latency[0].yellow_actuations, 0);
        assert_eq!(without_latency[0].red_actuations, 2);
    }

    #[test]
    fn percent_arrivals_on_green() {
        let config = measure(Measure::ArrivalOnGreen, "Advance");
        let rows = arrival_on_green(&config, &scenario(), 0.0, 15);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_actuations, 4);
        assert_eq!(rows[0].arrivals_on_green, 2);
        assert_eq!(rows[0].percent_aog, 0.5);
        assert_eq!(rows[0].timestamp, ts("2024-03-05 08:00:00"));
    }
}
