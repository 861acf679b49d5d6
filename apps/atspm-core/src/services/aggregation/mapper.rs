use crate::services::aggregation::types::{
    codes, DetectorConfig, DetectorFunction, DeviceId, RawEvent,
};
use chrono::NaiveDateTime;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Detector-based measures and the configured detector function each one needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Measure {
    SplitFailure,
    YellowRed,
    ArrivalOnGreen,
}

impl Measure {
    pub fn function(self) -> DetectorFunction {
        match self {
            Self::SplitFailure => DetectorFunction::Presence,
            Self::YellowRed => DetectorFunction::YellowRed,
            Self::ArrivalOnGreen => DetectorFunction::Advance,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SplitFailure => "split_failures",
            Self::YellowRed => "yellow_red",
            Self::ArrivalOnGreen => "arrival_on_green",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeasureConfig {
    pub measure: Measure,
    /// (device, detector channel) → phase.
    pub channels: BTreeMap<(DeviceId, i16), i16>,
    pub devices: BTreeSet<DeviceId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MeasureResult {
    Enabled(MeasureConfig),
    Disabled(String),
}

/// Selects the configuration rows for `measure`; a measure without any rows is disabled.
pub fn resolve(measure: Measure, configs: &[DetectorConfig]) -> MeasureResult {
    let function = measure.function();
    let channels: BTreeMap<(DeviceId, i16), i16> = configs
        .iter()
        .filter(|c| c.function == function)
        .map(|c| ((c.device_id, c.parameter), c.phase))
        .collect();
    if channels.is_empty() {
        return MeasureResult::Disabled(format!(
            "no {} detectors configured",
            function.as_str()
        ));
    }
    let devices = channels.keys().map(|(device, _)| *device).collect();
    MeasureResult::Enabled(MeasureConfig {
        measure,
        channels,
        devices,
    })
}

/// A detector on/off transition attached to the phase it serves.
///
/// `detector` is `None` once lane detectors have been combined into one approach signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhasedTransition {
    pub device_id: DeviceId,
    pub phase: i16,
    pub detector: Option<i16>,
    pub timestamp: NaiveDateTime,
    pub on: bool,
}

impl MeasureConfig {
    pub fn phase_for(&self, device_id: DeviceId, channel: i16) -> Option<i16> {
        self.channels.get(&(device_id, channel)).copied()
    }

    /// Phases that have at least one configured detector, per device.
    pub fn phases(&self) -> BTreeSet<(DeviceId, i16)> {
        self.channels
            .iter()
            .map(|((device, _), phase)| (*device, *phase))
            .collect()
    }

    /// Detector on/off events for configured channels, tagged with their phase.
    pub fn attach_phases(&self, events: &[RawEvent]) -> Vec<PhasedTransition> {
        let mut out: Vec<PhasedTransition> = events
            .iter()
            .filter_map(|event| {
                let on = match event.event_id {
                    codes::DETECTOR_ON => true,
                    codes::DETECTOR_OFF => false,
                    _ => return None,
                };
                let phase = self.phase_for(event.device_id, event.parameter)?;
                Some(PhasedTransition {
                    device_id: event.device_id,
                    phase,
                    detector: Some(event.parameter),
                    timestamp: event.timestamp,
                    on,
                })
            })
            .collect();
        out.sort_by_key(|t| (t.device_id, t.phase, t.detector, t.timestamp, t.on));
        out
    }

    /// Phase state events (green, yellow, red clearance) for phases this measure covers.
    pub fn phase_events(&self, events: &[RawEvent]) -> Vec<RawEvent> {
        let phases = self.phases();
        events
            .iter()
            .filter(|event| {
                matches!(
                    event.event_id,
                    codes::PHASE_BEGIN_GREEN
                        | codes::PHASE_BEGIN_YELLOW
                        | codes::PHASE_BEGIN_RED_CLEARANCE
                ) && phases.contains(&(event.device_id, event.parameter))
            })
            .copied()
            .collect()
    }
}

/// Merges lane detectors of one approach: the combined signal is on while any member is on.
pub fn combine_by_approach(transitions: &[PhasedTransition]) -> Vec<PhasedTransition> {
    let mut grouped: HashMap<(DeviceId, i16), Vec<&PhasedTransition>> = HashMap::new();
    for t in transitions {
        grouped.entry((t.device_id, t.phase)).or_default().push(t);
    }

    let mut out = Vec::new();
    for ((device_id, phase), mut members) in grouped {
        members.sort_by_key(|t| (t.timestamp, t.on, t.detector));
        let mut active: BTreeSet<Option<i16>> = BTreeSet::new();
        let mut idx = 0;
        while idx < members.len() {
            let timestamp = members[idx].timestamp;
            let end = members[idx..]
                .iter()
                .position(|t| t.timestamp != timestamp)
                .map_or(members.len(), |n| idx + n);
            let mut instant = members[idx..end].to_vec();
            idx = end;
            // Active detectors switch off before new ons; an idle detector's off follows its on.
            let active_at_start = active.clone();
            instant.sort_by_key(|t| match (t.on, active_at_start.contains(&t.detector)) {
                (false, true) => 0,
                (true, _) => 1,
                (false, false) => 2,
            });
            for t in instant {
                let was_on = !active.is_empty();
                if t.on {
                    active.insert(t.detector);
                } else {
                    active.remove(&t.detector);
                }
                let is_on = !active.is_empty();
                if was_on != is_on {
                    out.push(PhasedTransition {
                        device_id,
                        phase,
                        detector: None,
                        timestamp,
                        on: is_on,
                    });
                }
            }
        }
    }
    out.sort_by_key(|t| (t.device_id, t.phase, t.timestamp, t.on));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::aggregation::timeline::pair_transitions;
    use crate::test_support::{detector, event, ts};
    use chrono::Duration;

    #[test]
    fn missing_function_disables_the_measure() {
        let configs = vec![detector(1, 2, 5, "Presence")];
        assert!(matches!(
            resolve(Measure::SplitFailure, &configs),
            MeasureResult::Enabled(_)
        ));
        match resolve(Measure::ArrivalOnGreen, &configs) {
            MeasureResult::Disabled(reason) => assert!(reason.contains("Advance")),
            other => panic!("expected disabled, got {other:?}"),
        }
    }

    #[test]
    fn attaches_phases_to_configured_channels_only() {
        let configs = vec![detector(1, 2, 5, "Presence"), detector(1, 6, 9, "Advance")];
        let MeasureResult::Enabled(config) = resolve(Measure::SplitFailure, &configs) else {
            panic!("measure should be enabled");
        };
        let events = vec![
            event("2024-03-05 00:00:00", 1, 82, 5),
            event("2024-03-05 00:00:01", 1, 82, 9),
            event("2024-03-05 00:00:02", 1, 81, 5),
            event("2024-03-05 00:00:03", 2, 82, 5),
            event("2024-03-05 00:00:04", 1, 1, 2),
            event("2024-03-05 00:00:05", 1, 1, 6),
        ];
        let phased = config.attach_phases(&events);
        assert_eq!(phased.len(), 2);
        assert!(phased.iter().all(|t| t.phase == 2 && t.detector == Some(5)));
        let phase_events = config.phase_events(&events);
        assert_eq!(phase_events.len(), 1);
        assert_eq!(phase_events[0].parameter, 2);
    }

    #[test]
    fn approach_signal_is_on_while_any_lane_is_on() {
        let lane = |raw: &str, detector: i16, on: bool| PhasedTransition {
            device_id: 1,
            phase: 2,
            detector: Some(detector),
            timestamp: ts(raw),
            on,
        };
        let combined = combine_by_approach(&[
            lane("2024-03-05 00:00:00", 1, true),
            lane("2024-03-05 00:00:02", 2, true),
            lane("2024-03-05 00:00:03", 1, false),
            lane("2024-03-05 00:00:05", 2, false),
            lane("2024-03-05 00:00:05", 1, true),
            lane("2024-03-05 00:00:07", 1, false),
        ]);
        let states: Vec<(NaiveDateTime, bool)> =
            combined.iter().map(|t| (t.timestamp, t.on)).collect();
        assert_eq!(
            states,
            vec![
                (ts("2024-03-05 00:00:00"), true),
                (ts("2024-03-05 00:00:05"), false),
                (ts("2024-03-05 00:00:05"), true),
                (ts("2024-03-05 00:00:07"), false),
            ]
        );
        assert!(combined.iter().all(|t| t.detector.is_none()));
    }

    #[test]
    fn instantaneous_lane_pulse_does_not_hold_the_approach_on() {
        let lane = |raw: &str, on: bool| PhasedTransition {
            device_id: 1,
            phase: 2,
            detector: Some(3),
            timestamp: ts(raw),
            on,
        };
        let combined = combine_by_approach(&[
            lane("2024-03-05 00:00:00", false),
            lane("2024-03-05 00:00:00", true),
            lane("2024-03-05 00:00:50", true),
            lane("2024-03-05 00:00:51", false),
        ]);
        let pairing = pair_transitions(
            combined
                .iter()
                .map(|t| ((t.device_id, t.phase), t.timestamp, t.on))
                .collect(),
            None,
            Duration::zero(),
        );
        let closed: Vec<_> = pairing.closed().map(|(_, start, end)| (start, end)).collect();
        assert_eq!(
            closed,
            vec![
                (ts("2024-03-05 00:00:00"), ts("2024-03-05 00:00:00")),
                (ts("2024-03-05 00:00:50"), ts("2024-03-05 00:00:51")),
            ]
        );
        assert_eq!(pairing.open().count(), 0);
    }
}
