use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

pub type DeviceId = i32;

pub mod codes {
    pub const PHASE_BEGIN_GREEN: i16 = 1;
    pub const PHASE_GAP_OUT: i16 = 4;
    pub const PHASE_MAX_OUT: i16 = 5;
    pub const PHASE_FORCE_OFF: i16 = 6;
    pub const PHASE_BEGIN_YELLOW: i16 = 8;
    pub const PHASE_BEGIN_RED_CLEARANCE: i16 = 10;
    pub const PHASE_END_RED_CLEARANCE: i16 = 11;
    pub const PED_BEGIN_WALK: i16 = 21;
    pub const PED_BEGIN_CLEARANCE: i16 = 22;
    pub const PHASE_CALL_REGISTERED: i16 = 43;
    pub const DETECTOR_OFF: i16 = 81;
    pub const DETECTOR_ON: i16 = 82;
    pub const DETECTOR_RESTORED: i16 = 83;
    pub const DETECTOR_STUCK_ON: i16 = 87;
    pub const DETECTOR_ERRATIC: i16 = 88;
    pub const COMMUNICATION_CODES: [i16; 3] = [400, 502, 503];

    pub const MIN_CODE: i64 = 0;
    pub const MAX_CODE: i64 = 32767;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RawEvent {
    pub timestamp: NaiveDateTime,
    pub device_id: DeviceId,
    pub event_id: i16,
    pub parameter: i16,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DetectorFunction {
    Presence,
    YellowRed,
    Advance,
    Other(String),
}

impl DetectorFunction {
    pub fn parse(raw: &str) -> Self {
        let normalized = raw
            .trim()
            .to_ascii_lowercase()
            .replace([' ', '-', '_'], "");
        match normalized.as_str() {
            "presence" => Self::Presence,
            "yellowred" => Self::YellowRed,
            "advance" => Self::Advance,
            _ => Self::Other(raw.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Presence => "Presence",
            Self::YellowRed => "Yellow_Red",
            Self::Advance => "Advance",
            Self::Other(raw) => raw,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DetectorConfig {
    pub device_id: DeviceId,
    pub phase: i16,
    pub parameter: i16,
    pub function: DetectorFunction,
}

/// Spatial grouping of devices used to normalise anomaly scores.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceGroup {
    pub device_id: DeviceId,
    pub district: Option<String>,
    pub corridor: Option<String>,
}

/// Paired on/off event streams reconstructed into state intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventClass {
    Detector,
    Green,
    Yellow,
    RedClearance,
    PedWalk,
}

impl EventClass {
    pub const ALL: [EventClass; 5] = [
        EventClass::Detector,
        EventClass::Green,
        EventClass::Yellow,
        EventClass::RedClearance,
        EventClass::PedWalk,
    ];

    pub fn on_code(self) -> i16 {
        match self {
            Self::Detector => codes::DETECTOR_ON,
            Self::Green => codes::PHASE_BEGIN_GREEN,
            Self::Yellow => codes::PHASE_BEGIN_YELLOW,
            Self::RedClearance => codes::PHASE_BEGIN_RED_CLEARANCE,
            Self::PedWalk => codes::PED_BEGIN_WALK,
        }
    }

    pub fn off_code(self) -> i16 {
        match self {
            Self::Detector => codes::DETECTOR_OFF,
            Self::Green => codes::PHASE_BEGIN_YELLOW,
            Self::Yellow => codes::PHASE_BEGIN_RED_CLEARANCE,
            Self::RedClearance => codes::PHASE_END_RED_CLEARANCE,
            Self::PedWalk => codes::PED_BEGIN_CLEARANCE,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Detector => "Detector",
            Self::Green => "Green",
            Self::Yellow => "Yellow",
            Self::RedClearance => "Red Clearance",
            Self::PedWalk => "Ped Walk",
        }
    }

    pub fn codes() -> Vec<i16> {
        let mut out: Vec<i16> = Self::ALL
            .iter()
            .flat_map(|class| [class.on_code(), class.off_code()])
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }
}

/// One reconstructed on→off span. `end == None` means the interval never closed within the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateInterval {
    pub device_id: DeviceId,
    pub class: EventClass,
    pub channel: i16,
    pub start: NaiveDateTime,
    pub end: Option<NaiveDateTime>,
}

impl StateInterval {
    pub fn is_closed(&self) -> bool {
        self.end.is_some()
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        self.end
            .map(|end| crate::time::seconds_between(self.start, end))
    }
}

/// Detector fault categories, listed from highest to lowest precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FaultType {
    StuckOn,
    Erratic,
    Anomaly,
    Excessive,
    None,
}

impl FaultType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StuckOn => "Stuck On",
            Self::Erratic => "Erratic",
            Self::Anomaly => "Anomaly",
            Self::Excessive => "Excessive",
            Self::None => "None",
        }
    }

    pub fn is_hardware(self) -> bool {
        matches!(self, Self::StuckOn | Self::Erratic)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    BigInt,
    Double,
    Boolean,
    Varchar,
    Timestamp,
}

impl ColumnType {
    pub fn sql(self) -> &'static str {
        match self {
            Self::Integer => "INTEGER",
            Self::BigInt => "BIGINT",
            Self::Double => "DOUBLE",
            Self::Boolean => "BOOLEAN",
            Self::Varchar => "VARCHAR",
            Self::Timestamp => "TIMESTAMP",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnType,
}

pub const fn col(name: &'static str, kind: ColumnType) -> Column {
    Column { name, kind }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Int(Option<i64>),
    Float(Option<f64>),
    Bool(bool),
    Text(Option<String>),
    Timestamp(Option<NaiveDateTime>),
}

impl Cell {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => *v,
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => *v,
            Self::Int(v) => v.map(|v| v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(v) => v.as_deref(),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            Self::Timestamp(v) => *v,
            _ => None,
        }
    }
}

/// A typed row of one of the output relations.
pub trait TableRow {
    const COLUMNS: &'static [Column];

    fn cells(&self) -> Vec<Cell>;

    /// `(DeviceId, TimeStamp bin)` used for completeness filtering; `None` opts out.
    fn bin_key(&self) -> Option<(DeviceId, NaiveDateTime)> {
        None
    }
}

impl TableRow for RawEvent {
    const COLUMNS: &'static [Column] = &[
        col("TimeStamp", ColumnType::Timestamp),
        col("DeviceId", ColumnType::Integer),
        col("EventId", ColumnType::Integer),
        col("Parameter", ColumnType::Integer),
    ];

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::Timestamp(Some(self.timestamp)),
            Cell::Int(Some(i64::from(self.device_id))),
            Cell::Int(Some(i64::from(self.event_id))),
            Cell::Int(Some(i64::from(self.parameter))),
        ]
    }
}

/// Schema-stable, type-erased relation handed to the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputTable {
    pub name: String,
    pub columns: &'static [Column],
    pub rows: Vec<Vec<Cell>>,
}

impl OutputTable {
    pub fn from_rows<R: TableRow>(name: impl Into<String>, rows: &[R]) -> Self {
        Self {
            name: name.into(),
            columns: R::COLUMNS,
            rows: rows.iter().map(TableRow::cells).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// All values of one column, for assertions and downstream consumers.
    pub fn column(&self, name: &str) -> Option<Vec<&Cell>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().filter_map(|row| row.get(idx)).collect())
    }
}
