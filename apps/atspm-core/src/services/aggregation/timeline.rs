use crate::services::aggregation::types::{
    col, Cell, Column, ColumnType, DeviceId, EventClass, RawEvent, StateInterval, TableRow,
};
use chrono::{Duration, NaiveDateTime};
use std::collections::BTreeMap;

/// One reconstructed span for an arbitrary pairing key; `end == None` is still open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Span<K> {
    pub key: K,
    pub start: NaiveDateTime,
    pub end: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pairing<K> {
    pub spans: Vec<Span<K>>,
    pub orphan_offs: usize,
    pub merged_gaps: usize,
}

impl<K: Copy> Pairing<K> {
    pub fn closed(&self) -> impl Iterator<Item = (K, NaiveDateTime, NaiveDateTime)> + '_ {
        self.spans
            .iter()
            .filter_map(|span| span.end.map(|end| (span.key, span.start, end)))
    }

    pub fn open(&self) -> impl Iterator<Item = &Span<K>> + '_ {
        self.spans.iter().filter(|span| span.end.is_none())
    }
}

#[derive(Debug, Default)]
struct KeyState {
    open: Option<NaiveDateTime>,
    /// Last closed span, held back until the next on shows whether it was chatter.
    pending: Option<(NaiveDateTime, NaiveDateTime)>,
}

struct Pairer<K> {
    chatter: Duration,
    spans: Vec<Span<K>>,
    orphan_offs: usize,
    merged_gaps: usize,
}

impl<K: Copy> Pairer<K> {
    fn on(&mut self, key: K, state: &mut KeyState, ts: NaiveDateTime) {
        if state.open.is_some() {
            return;
        }
        match state.pending.take() {
            Some((start, end)) if self.chatter > Duration::zero() && ts - end < self.chatter => {
                state.open = Some(start);
                self.merged_gaps += 1;
            }
            Some((start, end)) => {
                self.spans.push(Span {
                    key,
                    start,
                    end: Some(end),
                });
                state.open = Some(ts);
            }
            None => state.open = Some(ts),
        }
    }

    fn off(&mut self, state: &mut KeyState, ts: NaiveDateTime) {
        match state.open.take() {
            Some(start) => state.pending = Some((start, ts)),
            None => self.orphan_offs += 1,
        }
    }
}

/// Pairs on/off transitions per key.
///
/// Transitions are sorted by key and time. At equal timestamps an open interval is closed before
/// a new one opens; with nothing open the on is applied first, so an instantaneous pulse becomes
/// a zero-length interval. A repeated on while open keeps the earliest start; an off with
/// nothing open is counted as an orphan. An on arriving less than `chatter` after the previous
/// close reopens that interval.
pub fn pair_transitions<K: Ord + Copy>(
    mut transitions: Vec<(K, NaiveDateTime, bool)>,
    horizon: Option<NaiveDateTime>,
    chatter: Duration,
) -> Pairing<K> {
    if let Some(horizon) = horizon {
        transitions.retain(|(_, ts, _)| *ts <= horizon);
    }
    transitions.sort_by_key(|(key, ts, on)| (*key, *ts, *on));

    let mut pairer = Pairer {
        chatter,
        spans: Vec::new(),
        orphan_offs: 0,
        merged_gaps: 0,
    };
    let mut states: BTreeMap<K, KeyState> = BTreeMap::new();

    let mut idx = 0;
    while idx < transitions.len() {
        let (key, ts, _) = transitions[idx];
        let end = transitions[idx..]
            .iter()
            .position(|(k, t, _)| *k != key || *t != ts)
            .map_or(transitions.len(), |n| idx + n);
        let ons = transitions[idx..end].iter().filter(|(_, _, on)| *on).count();
        let offs = end - idx - ons;
        idx = end;

        let state = states.entry(key).or_default();
        let close_first = state.open.is_some();
        if close_first {
            for _ in 0..offs {
                pairer.off(state, ts);
            }
        }
        for _ in 0..ons {
            pairer.on(key, state, ts);
        }
        if !close_first {
            for _ in 0..offs {
                pairer.off(state, ts);
            }
        }
    }

    let Pairer {
        mut spans,
        orphan_offs,
        merged_gaps,
        ..
    } = pairer;
    for (key, state) in states {
        if let Some((start, end)) = state.pending {
            spans.push(Span {
                key,
                start,
                end: Some(end),
            });
        }
        if let Some(start) = state.open {
            spans.push(Span {
                key,
                start,
                end: None,
            });
        }
    }
    spans.sort();
    Pairing {
        spans,
        orphan_offs,
        merged_gaps,
    }
}

/// Reconstructed state intervals for every event class of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Timeline {
    pub intervals: Vec<StateInterval>,
    pub orphan_offs: usize,
    pub merged_gaps: usize,
}

impl Timeline {
    pub fn closed(&self) -> impl Iterator<Item = &StateInterval> + '_ {
        self.intervals.iter().filter(|i| i.is_closed())
    }

    pub fn unmatched(&self) -> impl Iterator<Item = &StateInterval> + '_ {
        self.intervals.iter().filter(|i| !i.is_closed())
    }

    /// The opening events of still-open intervals, ready to be fed back as the next supplement.
    pub fn unmatched_events(&self) -> Vec<RawEvent> {
        let mut out: Vec<RawEvent> = self
            .unmatched()
            .map(|interval| RawEvent {
                timestamp: interval.start,
                device_id: interval.device_id,
                event_id: interval.class.on_code(),
                parameter: interval.channel,
            })
            .collect();
        out.sort();
        out.dedup();
        out
    }
}

/// Rebuilds detector, phase and pedestrian intervals from point events.
///
/// Chatter merging only applies to detector intervals.
pub fn reconstruct(
    events: &[RawEvent],
    horizon: Option<NaiveDateTime>,
    chatter_tolerance_ms: u64,
) -> Timeline {
    let horizon = horizon.or_else(|| events.iter().map(|e| e.timestamp).max());
    let chatter = Duration::milliseconds(i64::try_from(chatter_tolerance_ms).unwrap_or(i64::MAX));

    let mut detector = Vec::new();
    let mut phase = Vec::new();
    for event in events {
        for class in EventClass::ALL {
            let on = if event.event_id == class.on_code() {
                true
            } else if event.event_id == class.off_code() {
                false
            } else {
                continue;
            };
            let key = (event.device_id, class, event.parameter);
            if class == EventClass::Detector {
                detector.push((key, event.timestamp, on));
            } else {
                phase.push((key, event.timestamp, on));
            }
        }
    }

    let detector = pair_transitions(detector, horizon, chatter);
    let phase = pair_transitions(phase, horizon, Duration::zero());

    let mut intervals: Vec<StateInterval> = detector
        .spans
        .iter()
        .chain(phase.spans.iter())
        .map(|span| {
            let (device_id, class, channel) = span.key;
            StateInterval {
                device_id,
                class,
                channel,
                start: span.start,
                end: span.end,
            }
        })
        .collect();
    intervals.sort_by_key(|i| (i.device_id, i.class, i.channel, i.start));

    let orphan_offs = detector.orphan_offs + phase.orphan_offs;
    if orphan_offs > 0 {
        tracing::debug!(orphan_offs, "off events without a matching on");
    }
    Timeline {
        intervals,
        orphan_offs,
        merged_gaps: detector.merged_gaps,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimelineRow {
    pub device_id: DeviceId,
    pub class: EventClass,
    pub channel: i16,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl TimelineRow {
    pub fn from_closed(interval: &StateInterval) -> Option<Self> {
        Some(Self {
            device_id: interval.device_id,
            class: interval.class,
            channel: interval.channel,
            start: interval.start,
            end: interval.end?,
        })
    }
}

impl TableRow for TimelineRow {
    const COLUMNS: &'static [Column] = &[
        col("DeviceId", ColumnType::Integer),
        col("EventClass", ColumnType::Varchar),
        col("Channel", ColumnType::Integer),
        col("StartTime", ColumnType::Timestamp),
        col("EndTime", ColumnType::Timestamp),
        col("Duration", ColumnType::Double),
    ];

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::Int(Some(i64::from(self.device_id))),
            Cell::Text(Some(self.class.as_str().to_string())),
            Cell::Int(Some(i64::from(self.channel))),
            Cell::Timestamp(Some(self.start)),
            Cell::Timestamp(Some(self.end)),
            Cell::Float(Some(crate::time::seconds_between(self.start, self.end))),
        ]
    }
}
