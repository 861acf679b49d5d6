use crate::config::{DetectorHealthParams, GroupLevel};
use crate::services::aggregation::counts::{ActuationRow, DetectorFaultRow, HasDataRow};
use crate::services::aggregation::types::{
    col, Cell, Column, ColumnType, DeviceGroup, DeviceId, FaultType, TableRow,
};
use crate::services::health::decompose::{
    decompose, DecomposeSettings, DecomposedPoint, SeriesKey, SeriesPoint,
};
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone, PartialEq)]
pub struct DetectorHealthRow {
    pub timestamp: NaiveDateTime,
    pub device_id: DeviceId,
    pub detector: i16,
    pub total: f64,
    pub rolling_median: f64,
    pub season_day: f64,
    pub season_week: f64,
    pub residual: f64,
    pub geh: Option<f64>,
    pub geh_z: Option<f64>,
    pub group_z: Option<f64>,
    pub ratio: Option<f64>,
    pub fault: FaultType,
}

impl TableRow for DetectorHealthRow {
    const COLUMNS: &'static [Column] = &[
        col("TimeStamp", ColumnType::Timestamp),
        col("DeviceId", ColumnType::Integer),
        col("Detector", ColumnType::Integer),
        col("Total", ColumnType::Double),
        col("Rolling_Median", ColumnType::Double),
        col("Season_Day", ColumnType::Double),
        col("Season_Week", ColumnType::Double),
        col("Residual", ColumnType::Double),
        col("GEH", ColumnType::Double),
        col("GEH_Z", ColumnType::Double),
        col("Group_Z", ColumnType::Double),
        col("Ratio", ColumnType::Double),
        col("Fault", ColumnType::Varchar),
    ];

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::Timestamp(Some(self.timestamp)),
            Cell::Int(Some(i64::from(self.device_id))),
            Cell::Int(Some(i64::from(self.detector))),
            Cell::Float(Some(self.total)),
            Cell::Float(Some(self.rolling_median)),
            Cell::Float(Some(self.season_day)),
            Cell::Float(Some(self.season_week)),
            Cell::Float(Some(self.residual)),
            Cell::Float(self.geh),
            Cell::Float(self.geh_z),
            Cell::Float(self.group_z),
            Cell::Float(self.ratio),
            Cell::Text(Some(self.fault.as_str().to_string())),
        ]
    }

    fn bin_key(&self) -> Option<(DeviceId, NaiveDateTime)> {
        Some((self.device_id, self.timestamp))
    }
}

/// Signed GEH statistic of an observed count against its expected value.
///
/// Zero when both are zero; `None` when the denominator vanishes (or goes negative) while the
/// counts still differ.
pub fn geh(actual: f64, expected: f64) -> Option<f64> {
    let diff = actual - expected;
    let numerator = 2.0 * diff * diff;
    let denominator = actual + expected;
    if numerator == 0.0 {
        return Some(0.0);
    }
    if denominator <= 0.0 {
        return None;
    }
    let value = diff.signum() * (numerator / denominator).sqrt();
    value.is_finite().then_some(value)
}

/// Standard scores with the sample standard deviation; fewer than two finite values or zero
/// spread yields no scores.
pub fn zscores(values: &[Option<f64>]) -> Vec<Option<f64>> {
    use statrs::statistics::Statistics;

    let finite: Vec<f64> = values
        .iter()
        .flatten()
        .copied()
        .filter(|v| v.is_finite())
        .collect();
    if finite.len() < 2 {
        return vec![None; values.len()];
    }
    let mean = finite.iter().mean();
    let std_dev = finite.iter().std_dev();
    if !(std_dev.is_finite() && std_dev > 0.0) {
        return vec![None; values.len()];
    }
    values
        .iter()
        .map(|v| v.filter(|v| v.is_finite()).map(|v| (v - mean) / std_dev))
        .collect()
}

/// Cross every detector with every complete bin of its device, filling missing counts with zero.
pub fn clean_series(has_data: &[HasDataRow], actuations: &[ActuationRow]) -> Vec<SeriesPoint> {
    let mut complete: BTreeMap<DeviceId, Vec<NaiveDateTime>> = BTreeMap::new();
    for row in has_data {
        complete.entry(row.device_id).or_default().push(row.timestamp);
    }
    let counts: HashMap<(DeviceId, i16, NaiveDateTime), i64> = actuations
        .iter()
        .map(|row| ((row.device_id, row.detector, row.timestamp), row.total))
        .collect();
    let pairs: BTreeSet<SeriesKey> = actuations
        .iter()
        .map(|row| (row.device_id, row.detector))
        .collect();

    let mut out = Vec::new();
    for (device_id, detector) in pairs {
        let Some(bins) = complete.get(&device_id) else {
            continue;
        };
        for &timestamp in bins {
            let total = counts
                .get(&(device_id, detector, timestamp))
                .copied()
                .unwrap_or(0);
            out.push(SeriesPoint {
                key: (device_id, detector),
                timestamp,
                total: total as f64,
            });
        }
    }
    out
}

fn hour_time(hour: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or(NaiveTime::MIN)
}

fn within_hours(ts: NaiveDateTime, start_hour: u32, end_hour: u32) -> bool {
    let hour = ts.hour();
    if end_hour >= 24 {
        return hour >= start_hour;
    }
    crate::time::time_of_day_within(ts, hour_time(start_hour), hour_time(end_hour))
}

/// Count divided by the mean daytime count of the same detector and date.
pub fn daytime_ratios(
    points: &[DecomposedPoint],
    params: &DetectorHealthParams,
) -> Vec<Option<f64>> {
    use statrs::statistics::Statistics;

    let mut daytime: HashMap<(SeriesKey, NaiveDate), Vec<f64>> = HashMap::new();
    for p in points {
        if within_hours(p.timestamp, params.day_start_hour, params.day_end_hour) {
            daytime
                .entry((p.key, p.timestamp.date()))
                .or_default()
                .push(p.total);
        }
    }
    let means: HashMap<(SeriesKey, NaiveDate), f64> = daytime
        .into_iter()
        .map(|(key, values)| (key, values.iter().mean()))
        .collect();
    points
        .iter()
        .map(|p| {
            let mean = means.get(&(p.key, p.timestamp.date())).copied()?;
            (mean.is_finite() && mean > 0.0).then(|| p.total / mean)
        })
        .collect()
}

/// Ratio fault: implausible volume outside the daytime pattern.
pub fn is_excessive(
    ts: NaiveDateTime,
    total: f64,
    ratio: Option<f64>,
    params: &DetectorHealthParams,
) -> bool {
    let Some(ratio) = ratio else {
        return false;
    };
    let daytime = within_hours(ts, params.day_start_hour, params.day_end_hour);
    let early = within_hours(ts, 0, params.early_morning_end_hour);
    let off_pattern = !daytime
        && ratio >= params.excessive_ratio
        && total > params.excessive_min_count as f64;
    let early_morning = early
        && ratio > params.early_morning_ratio
        && total > params.early_morning_min_count as f64;
    off_pattern || early_morning
}

/// Statistical anomaly: both the standardised score and the GEH exceed their thresholds.
pub fn is_anomaly(z: Option<f64>, geh: Option<f64>, params: &DetectorHealthParams) -> bool {
    match (z, geh) {
        (Some(z), Some(geh)) => z.abs() >= params.z_threshold && geh.abs() > params.geh_threshold,
        _ => false,
    }
}

/// Applies fault rules column-wise from lowest to highest precedence, so later passes overwrite.
pub fn classify(
    excessive: &[bool],
    anomaly: &[bool],
    hardware: &[Option<FaultType>],
) -> Vec<FaultType> {
    let mut faults = vec![FaultType::None; excessive.len()];
    for (fault, _) in faults.iter_mut().zip(excessive).filter(|(_, hit)| **hit) {
        *fault = FaultType::Excessive;
    }
    for (fault, _) in faults.iter_mut().zip(anomaly).filter(|(_, hit)| **hit) {
        *fault = FaultType::Anomaly;
    }
    for (fault, hw) in faults.iter_mut().zip(hardware) {
        if let Some(hw) = (*hw).filter(|f| f.is_hardware()) {
            *fault = hw;
        }
    }
    faults
}

fn group_label(group: &DeviceGroup, level: GroupLevel) -> Option<&str> {
    match level {
        GroupLevel::District => group.district.as_deref(),
        GroupLevel::Corridor => group.corridor.as_deref(),
    }
}

/// z of the device-level scores within each (bin, group); the largest magnitude across levels.
fn group_zscores(
    points: &[DecomposedPoint],
    device_z: &[Option<f64>],
    groups: &[DeviceGroup],
    levels: &[GroupLevel],
) -> Vec<Option<f64>> {
    let by_device: HashMap<DeviceId, &DeviceGroup> =
        groups.iter().map(|g| (g.device_id, g)).collect();
    let mut best: Vec<Option<f64>> = vec![None; points.len()];

    for &level in levels {
        let mut members: HashMap<(NaiveDateTime, &str), Vec<usize>> = HashMap::new();
        for (idx, p) in points.iter().enumerate() {
            let Some(label) = by_device
                .get(&p.key.0)
                .and_then(|g| group_label(g, level))
            else {
                continue;
            };
            members.entry((p.timestamp, label)).or_default().push(idx);
        }
        for indices in members.values() {
            let values: Vec<Option<f64>> = indices.iter().map(|&i| device_z[i]).collect();
            for (&idx, z) in indices.iter().zip(zscores(&values)) {
                let Some(z) = z else {
                    continue;
                };
                if best[idx].map_or(true, |current| z.abs() > current.abs()) {
                    best[idx] = Some(z);
                }
            }
        }
    }
    best
}

pub struct HealthInputs<'a> {
    pub has_data: &'a [HasDataRow],
    pub actuations: &'a [ActuationRow],
    pub detector_faults: &'a [DetectorFaultRow],
    pub device_groups: &'a [DeviceGroup],
}

/// Full detector-health pipeline, truncated to the trailing `return_last_n_days`.
pub fn detector_health(
    inputs: &HealthInputs<'_>,
    params: &DetectorHealthParams,
    bin_size: u32,
) -> Vec<DetectorHealthRow> {
    let series = clean_series(inputs.has_data, inputs.actuations);
    let mut points = decompose(
        &series,
        &DecomposeSettings {
            window: Duration::days(i64::from(params.decomposition_window_days)),
            min_periods: params.min_periods,
            bin_size,
        },
    );
    points.sort_by_key(|p| (p.key, p.timestamp));

    let gehs: Vec<Option<f64>> = points.iter().map(|p| geh(p.total, p.expected())).collect();

    let mut device_z: Vec<Option<f64>> = vec![None; points.len()];
    let mut per_series: BTreeMap<SeriesKey, Vec<usize>> = BTreeMap::new();
    for (idx, p) in points.iter().enumerate() {
        per_series.entry(p.key).or_default().push(idx);
    }
    for indices in per_series.values() {
        let values: Vec<Option<f64>> = indices.iter().map(|&i| gehs[i]).collect();
        for (&idx, z) in indices.iter().zip(zscores(&values)) {
            device_z[idx] = z;
        }
    }

    let grouped = !params.grouping.is_empty();
    let group_z = if grouped {
        group_zscores(&points, &device_z, inputs.device_groups, &params.grouping)
    } else {
        vec![None; points.len()]
    };
    let ratios = daytime_ratios(&points, params);

    let hardware_by_bin: HashMap<(DeviceId, i16, NaiveDateTime), FaultType> = inputs
        .detector_faults
        .iter()
        .map(|row| ((row.device_id, row.detector, row.timestamp), row.fault))
        .collect();
    let hardware: Vec<Option<FaultType>> = points
        .iter()
        .map(|p| hardware_by_bin.get(&(p.key.0, p.key.1, p.timestamp)).copied())
        .collect();

    let excessive: Vec<bool> = points
        .iter()
        .zip(&ratios)
        .map(|(p, ratio)| is_excessive(p.timestamp, p.total, *ratio, params))
        .collect();
    let anomaly: Vec<bool> = (0..points.len())
        .map(|i| {
            let z = if grouped { group_z[i] } else { device_z[i] };
            is_anomaly(z, gehs[i], params)
        })
        .collect();
    let faults = classify(&excessive, &anomaly, &hardware);

    let Some(last_day) = points.iter().map(|p| p.timestamp.date()).max() else {
        return Vec::new();
    };
    let first_day = last_day - Duration::days(i64::from(params.return_last_n_days.max(1)) - 1);

    let rows: Vec<DetectorHealthRow> = points
        .iter()
        .enumerate()
        .filter(|(_, p)| p.timestamp.date() >= first_day)
        .map(|(i, p)| DetectorHealthRow {
            timestamp: p.timestamp,
            device_id: p.key.0,
            detector: p.key.1,
            total: p.total,
            rolling_median: p.rolling_median,
            season_day: p.season_day,
            season_week: p.season_week,
            residual: p.residual,
            geh: gehs[i],
            geh_z: device_z[i],
            group_z: group_z[i],
            ratio: ratios[i],
            fault: faults[i],
        })
        .collect();
    let flagged = rows.iter().filter(|r| r.fault != FaultType::None).count();
    tracing::debug!(rows = rows.len(), flagged, "classified detector health");
    rows
}
