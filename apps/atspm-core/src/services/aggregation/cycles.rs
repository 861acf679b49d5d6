use crate::services::aggregation::types::{codes, DeviceId, RawEvent};
use crate::time::shift_seconds;
use chrono::NaiveDateTime;
use std::collections::BTreeMap;

/// One signal cycle of a phase, closed by the barrier after the start of red.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cycle {
    pub device_id: DeviceId,
    pub phase: i16,
    pub cycle_id: i64,
    pub start: NaiveDateTime,
    pub green_start: NaiveDateTime,
    pub yellow_start: NaiveDateTime,
    pub red_start: NaiveDateTime,
    pub barrier: NaiveDateTime,
}

impl Cycle {
    pub fn green_window(&self) -> (NaiveDateTime, NaiveDateTime) {
        (self.green_start, self.yellow_start)
    }

    pub fn red_window(&self) -> (NaiveDateTime, NaiveDateTime) {
        (self.red_start, self.barrier)
    }

    pub fn contains(&self, ts: NaiveDateTime) -> bool {
        self.start <= ts && ts < self.barrier
    }
}

fn phase_order(event_id: i16) -> u8 {
    match event_id {
        codes::PHASE_BEGIN_GREEN => 0,
        codes::PHASE_BEGIN_YELLOW => 1,
        _ => 2,
    }
}

/// Segments phase events into cycles per (device, phase).
///
/// A cycle is emitted at each start of red that follows a green and a yellow. Cycles are
/// contiguous: each starts at the previous barrier, the first at its own green.
pub fn segment(phase_events: &[RawEvent], barrier_offset: f64) -> Vec<Cycle> {
    let mut grouped: BTreeMap<(DeviceId, i16), Vec<&RawEvent>> = BTreeMap::new();
    for event in phase_events {
        if matches!(
            event.event_id,
            codes::PHASE_BEGIN_GREEN | codes::PHASE_BEGIN_YELLOW | codes::PHASE_BEGIN_RED_CLEARANCE
        ) {
            grouped
                .entry((event.device_id, event.parameter))
                .or_default()
                .push(event);
        }
    }

    let mut cycles = Vec::new();
    for ((device_id, phase), mut events) in grouped {
        events.sort_by_key(|e| (e.timestamp, phase_order(e.event_id)));
        let mut green: Option<NaiveDateTime> = None;
        let mut yellow: Option<NaiveDateTime> = None;
        let mut previous_barrier: Option<NaiveDateTime> = None;
        let mut cycle_id = 0i64;

        for event in events {
            match event.event_id {
                codes::PHASE_BEGIN_GREEN => {
                    green = Some(event.timestamp);
                    yellow = None;
                }
                codes::PHASE_BEGIN_YELLOW => {
                    if green.is_some() {
                        yellow = Some(event.timestamp);
                    }
                }
                _ => {
                    let (Some(green_start), Some(yellow_start)) = (green.take(), yellow.take())
                    else {
                        continue;
                    };
                    let red_start = event.timestamp;
                    let barrier = shift_seconds(red_start, barrier_offset);
                    let start = match previous_barrier {
                        Some(prev) if prev < barrier => prev,
                        _ => green_start,
                    };
                    cycle_id += 1;
                    cycles.push(Cycle {
                        device_id,
                        phase,
                        cycle_id,
                        start,
                        green_start,
                        yellow_start,
                        red_start,
                        barrier,
                    });
                    previous_barrier = Some(barrier);
                }
            }
        }
    }
    cycles
}

/// Cycles of one (device, phase), searchable by timestamp.
pub fn cycles_by_phase(cycles: &[Cycle]) -> BTreeMap<(DeviceId, i16), Vec<Cycle>> {
    let mut out: BTreeMap<(DeviceId, i16), Vec<Cycle>> = BTreeMap::new();
    for cycle in cycles {
        out.entry((cycle.device_id, cycle.phase))
            .or_default()
            .push(*cycle);
    }
    out
}

/// The cycle whose span contains `ts`.
pub fn cycle_at(cycles: &[Cycle], ts: NaiveDateTime) -> Option<&Cycle> {
    let idx = cycles.partition_point(|c| c.barrier <= ts);
    cycles.get(idx).filter(|c| c.contains(ts))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalState {
    Green,
    Yellow,
    Red,
}

/// Step function of green/yellow/red per (device, phase).
#[derive(Debug, Clone, Default)]
pub struct PhaseStates {
    changes: BTreeMap<(DeviceId, i16), Vec<(NaiveDateTime, SignalState)>>,
}

impl PhaseStates {
    pub fn from_events(phase_events: &[RawEvent]) -> Self {
        let mut changes: BTreeMap<(DeviceId, i16), Vec<(NaiveDateTime, SignalState)>> =
            BTreeMap::new();
        let mut sorted: Vec<&RawEvent> = phase_events.iter().collect();
        sorted.sort_by_key(|e| (e.device_id, e.parameter, e.timestamp, phase_order(e.event_id)));
        for event in sorted {
            let state = match event.event_id {
                codes::PHASE_BEGIN_GREEN => SignalState::Green,
                codes::PHASE_BEGIN_YELLOW => SignalState::Yellow,
                codes::PHASE_BEGIN_RED_CLEARANCE => SignalState::Red,
                _ => continue,
            };
            changes
                .entry((event.device_id, event.parameter))
                .or_default()
                .push((event.timestamp, state));
        }
        Self { changes }
    }

    /// State in effect at `ts` and when it began; `None` before the first phase event.
    pub fn state_at(
        &self,
        device_id: DeviceId,
        phase: i16,
        ts: NaiveDateTime,
    ) -> Option<(SignalState, NaiveDateTime)> {
        let changes = self.changes.get(&(device_id, phase))?;
        let idx = changes.partition_point(|(at, _)| *at <= ts);
        let (since, state) = changes.get(idx.checked_sub(1)?)?;
        Some((*state, *since))
    }
}
