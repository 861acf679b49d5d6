mod common;

use atspm_core::config::{
    AggregationName, AggregationRequest, DetectorHealthParams, GroupLevel, ProcessorConfig,
};
use atspm_core::services::aggregation::types::{Cell, DeviceGroup, OutputTable};
use atspm_core::services::loader::{EventSource, LoadRequest, RawEventRecord, TableSource};
use atspm_core::services::sink::MemorySink;
use atspm_core::SignalDataProcessor;
use chrono::{Datelike, Duration, NaiveDateTime, Weekday};
use common::{detector, pulse, ts};

const FIRST_DAY: &str = "2024-03-04 00:00:00";
const DAYS: i64 = 16;

/// Actuations for one bin spread evenly so every five-minute sub-window sees traffic.
fn bin_pulses(out: &mut Vec<RawEventRecord>, bin: NaiveDateTime, count: i64, device_id: i32) {
    let spacing = 900 / count;
    for k in 0..count {
        pulse(out, bin + Duration::seconds(k * spacing), 1_000, device_id, 5);
    }
}

fn is_tuesday_eight(bin: NaiveDateTime) -> bool {
    bin.weekday() == Weekday::Tue && bin.time() == ts("2024-03-05 08:00:00").time()
}

/// Sixteen days of 15-minute volumes; Tuesday 08:00 normally carries ~50 vehicles.
///
/// Device 7 drops to 5 vehicles on the final Tuesday. Device 8, when included, keeps a
/// varying baseline with no drop.
fn history(with_neighbour: bool) -> Vec<RawEventRecord> {
    let start = ts(FIRST_DAY);
    let last_day = start + Duration::days(DAYS - 1);
    let mut out = Vec::new();
    for i in 0..DAYS * 96 {
        let bin = start + Duration::minutes(15 * i);
        let count = if is_tuesday_eight(bin) {
            if bin.date() == last_day.date() {
                5
            } else {
                50
            }
        } else {
            6
        };
        bin_pulses(&mut out, bin, count, 7);
        if with_neighbour {
            bin_pulses(&mut out, bin, 6 + (i * 7 + i / 96) % 4, 8);
        }
    }
    out
}

fn run(params: DetectorHealthParams, with_neighbour: bool) -> anyhow::Result<OutputTable> {
    let mut request = LoadRequest::new(
        EventSource::Records(history(with_neighbour)),
        TableSource::Records(vec![detector(7, 2, 5, "Presence"), detector(8, 2, 5, "Presence")]),
    );
    if with_neighbour {
        request = request.with_device_groups(TableSource::Records(vec![
            DeviceGroup {
                device_id: 7,
                district: Some("north".to_string()),
                corridor: None,
            },
            DeviceGroup {
                device_id: 8,
                district: Some("north".to_string()),
                corridor: None,
            },
        ]));
    }
    let mut processor = SignalDataProcessor::new(ProcessorConfig::new(vec![
        AggregationRequest::DetectorHealth(params),
    ]))?;
    let mut sink = MemorySink::new();
    let report = processor.run(request, &mut sink)?;
    assert!(report.succeeded(AggregationName::DetectorHealth), "{report:?}");
    assert_eq!(sink.names(), vec!["detector_health"]);
    sink.into_tables()
        .remove("detector_health")
        .ok_or_else(|| anyhow::anyhow!("detector_health missing"))
}

fn row_at<'a>(table: &'a OutputTable, device_id: i64, at: &str) -> &'a [Cell] {
    let at = ts(at);
    table
        .rows
        .iter()
        .find(|row| row[0].as_timestamp() == Some(at) && row[1].as_i64() == Some(device_id))
        .map(Vec::as_slice)
        .unwrap_or_else(|| panic!("no row for device {device_id} at {at}"))
}

fn value(table: &OutputTable, row: &[Cell], column: &str) -> Option<f64> {
    table.column_index(column).and_then(|idx| row[idx].as_f64())
}

fn fault(table: &OutputTable, row: &[Cell]) -> String {
    table
        .column_index("Fault")
        .and_then(|idx| row[idx].as_text())
        .unwrap_or_default()
        .to_string()
}

#[test]
fn low_tuesday_volume_is_a_statistical_anomaly_not_a_ratio_fault() -> anyhow::Result<()> {
    let table = run(DetectorHealthParams::default(), false)?;

    // Only the final day is returned.
    assert_eq!(table.len(), 96);
    assert!(table
        .column("TimeStamp")
        .unwrap_or_default()
        .iter()
        .all(|c| c.as_timestamp().map(|t| t.date()) == Some(ts("2024-03-19 00:00:00").date())));

    let row = row_at(&table, 7, "2024-03-19 08:00:00");
    assert_eq!(value(&table, row, "Total"), Some(5.0));
    let ratio = value(&table, row, "Ratio").unwrap_or_default();
    assert!(ratio > 0.0 && ratio < 1.0);
    let geh = value(&table, row, "GEH").unwrap_or_default();
    assert!(geh < -5.0, "GEH {geh}");
    let z = value(&table, row, "GEH_Z").unwrap_or_default();
    assert!(z <= -3.5, "z {z}");
    assert_eq!(value(&table, row, "Group_Z"), None);
    assert_eq!(fault(&table, row), "Anomaly");

    let flagged = table
        .rows
        .iter()
        .filter(|row| fault(&table, row) != "None")
        .count();
    assert_eq!(flagged, 1);
    Ok(())
}

#[test]
fn grouping_scores_devices_against_their_district() -> anyhow::Result<()> {
    let params = DetectorHealthParams {
        grouping: vec![GroupLevel::District],
        ..DetectorHealthParams::default()
    };
    let table = run(params, true)?;
    let row = row_at(&table, 7, "2024-03-19 08:00:00");
    let device_z = value(&table, row, "GEH_Z").unwrap_or_default();
    assert!(device_z <= -3.5);
    // Two devices per district bound the group score well under the threshold.
    let group_z = value(&table, row, "Group_Z").unwrap_or(f64::NAN);
    assert!(group_z.abs() < 1.0, "group z {group_z}");
    assert_eq!(fault(&table, row), "None");
    Ok(())
}
