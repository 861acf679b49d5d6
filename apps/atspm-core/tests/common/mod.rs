#![allow(dead_code)]

use atspm_core::services::aggregation::types::{DetectorConfig, DetectorFunction, DeviceId};
use atspm_core::services::loader::RawEventRecord;
use chrono::{Duration, NaiveDateTime};

pub fn ts(raw: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").expect("test timestamp")
}

pub fn record(at: NaiveDateTime, device_id: DeviceId, event_id: i64, parameter: i64) -> RawEventRecord {
    RawEventRecord {
        timestamp: at.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        device_id,
        event_id,
        parameter,
    }
}

pub fn detector(device_id: DeviceId, phase: i16, parameter: i16, function: &str) -> DetectorConfig {
    DetectorConfig {
        device_id,
        phase,
        parameter,
        function: DetectorFunction::parse(function),
    }
}

/// One signal cycle: green at `green`, yellow after `green_secs`, red clearance 4 s later.
pub fn cycle(out: &mut Vec<RawEventRecord>, green: NaiveDateTime, green_secs: i64, device_id: DeviceId, phase: i64) {
    out.push(record(green, device_id, 1, phase));
    out.push(record(green + Duration::seconds(green_secs), device_id, 8, phase));
    out.push(record(green + Duration::seconds(green_secs + 4), device_id, 10, phase));
}

/// Detector on at `on`, off `millis` later.
pub fn pulse(out: &mut Vec<RawEventRecord>, on: NaiveDateTime, millis: i64, device_id: DeviceId, channel: i64) {
    out.push(record(on, device_id, 82, channel));
    out.push(record(on + Duration::milliseconds(millis), device_id, 81, channel));
}

/// Fifteen minutes of a two-phase intersection on device 7.
///
/// Phase 2 runs 60 s cycles with presence lane 5 (saturated for the first five cycles), yellow/red
/// detector 6 and advance detector 9. Phase 4 carries a gap-out and a max-out.
pub fn intersection(start: NaiveDateTime) -> Vec<RawEventRecord> {
    let mut out = Vec::new();
    for i in 0..15 {
        let green = start + Duration::seconds(60 * i);
        cycle(&mut out, green, 30, 7, 2);
        if i < 5 {
            // Covers green and the whole red window up to the barrier.
            pulse(&mut out, green, 39_000, 7, 5);
        } else {
            pulse(&mut out, green + Duration::seconds(5), 2_000, 7, 5);
        }
        pulse(&mut out, green + Duration::seconds(10), 500, 7, 9);
        pulse(&mut out, green + Duration::seconds(45), 500, 7, 9);
        pulse(&mut out, green + Duration::seconds(29), 300, 7, 6);
        pulse(&mut out, green + Duration::seconds(36), 300, 7, 6);
    }
    out.push(record(start + Duration::seconds(50), 7, 4, 4));
    out.push(record(start + Duration::seconds(110), 7, 5, 4));
    out.push(record(start + Duration::seconds(111), 7, 43, 4));
    out.push(record(start + Duration::seconds(300), 7, 502, 100));
    // A detector left on at the end of the batch.
    out.push(record(start + Duration::seconds(898), 7, 82, 11));
    out
}

pub fn intersection_detectors() -> Vec<DetectorConfig> {
    vec![
        detector(7, 2, 5, "Presence"),
        detector(7, 2, 6, "Yellow_Red"),
        detector(7, 2, 9, "Advance"),
    ]
}
