use crate::services::aggregation::types::{
    codes, DetectorConfig, DetectorFunction, DeviceId, RawEvent,
};
use crate::services::loader::RawEventRecord;
use chrono::NaiveDateTime;

pub fn ts(raw: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f").expect("test timestamp")
}

pub fn event(raw_ts: &str, device_id: DeviceId, event_id: i16, parameter: i16) -> RawEvent {
    RawEvent {
        timestamp: ts(raw_ts),
        device_id,
        event_id,
        parameter,
    }
}

pub fn record(raw_ts: &str, device_id: DeviceId, event_id: i64, parameter: i64) -> RawEventRecord {
    RawEventRecord {
        timestamp: raw_ts.to_string(),
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

/// Green at `green`, yellow 20 s later, red clearance 4 s after that, for one phase.
pub fn phase_cycle(green: NaiveDateTime, device_id: DeviceId, phase: i16) -> Vec<RawEvent> {
    let at = |offset: i64| green + chrono::Duration::seconds(offset);
    vec![
        RawEvent {
            timestamp: at(0),
            device_id,
            event_id: codes::PHASE_BEGIN_GREEN,
            parameter: phase,
        },
        RawEvent {
            timestamp: at(20),
            device_id,
            event_id: codes::PHASE_BEGIN_YELLOW,
            parameter: phase,
        },
        RawEvent {
            timestamp: at(24),
            device_id,
            event_id: codes::PHASE_BEGIN_RED_CLEARANCE,
            parameter: phase,
        },
    ]
}

pub fn detector_pulse(
    on: NaiveDateTime,
    seconds: f64,
    device_id: DeviceId,
    channel: i16,
) -> [RawEvent; 2] {
    [
        RawEvent {
            timestamp: on,
            device_id,
            event_id: codes::DETECTOR_ON,
            parameter: channel,
        },
        RawEvent {
            timestamp: crate::time::shift_seconds(on, seconds),
            device_id,
            event_id: codes::DETECTOR_OFF,
            parameter: channel,
        },
    ]
}

pub fn to_records(events: &[RawEvent]) -> Vec<RawEventRecord> {
    events
        .iter()
        .map(|e| RawEventRecord {
            timestamp: e.timestamp.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
            device_id: e.device_id,
            event_id: i64::from(e.event_id),
            parameter: i64::from(e.parameter),
        })
        .collect()
}
