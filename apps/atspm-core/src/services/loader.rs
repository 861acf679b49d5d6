use crate::error::{AtspmError, Result};
use crate::services::aggregation::types::{
    codes, DetectorConfig, DetectorFunction, DeviceGroup, DeviceId,
};
use crate::services::session::{quote_ident, quote_literal, AnalyticalSession};
use duckdb::{params, Appender};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const RAW_DATA: &str = "raw_data";
pub const ALL_EVENTS: &str = "all_events";
pub const DETECTOR_CONFIG: &str = "detector_config";
pub const DEVICE_GROUPS: &str = "device_groups";
const UNMATCHED_SUPPLEMENT: &str = "unmatched_supplement";

/// Raw event as supplied by the caller, before type coercion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEventRecord {
    pub timestamp: String,
    pub device_id: DeviceId,
    pub event_id: i64,
    pub parameter: i64,
}

/// Where a loader input comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum TableSource<T> {
    Parquet(PathBuf),
    Csv(PathBuf),
    Records(Vec<T>),
}

impl<T> TableSource<T> {
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("parquet") => Ok(Self::Parquet(path)),
            Some("csv") => Ok(Self::Csv(path)),
            _ => Err(AtspmError::config(format!(
                "unsupported input file {} (expected .parquet or .csv)",
                path.display()
            ))),
        }
    }
}

pub type EventSource = TableSource<RawEventRecord>;

/// Everything the processor consumes for one run.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub raw_data: EventSource,
    pub detector_config: TableSource<DetectorConfig>,
    pub unmatched_events: Option<EventSource>,
    pub device_groups: Option<TableSource<DeviceGroup>>,
}

impl LoadRequest {
    pub fn new(raw_data: EventSource, detector_config: TableSource<DetectorConfig>) -> Self {
        Self {
            raw_data,
            detector_config,
            unmatched_events: None,
            device_groups: None,
        }
    }

    pub fn with_unmatched_events(mut self, source: EventSource) -> Self {
        self.unmatched_events = Some(source);
        self
    }

    pub fn with_device_groups(mut self, source: TableSource<DeviceGroup>) -> Self {
        self.device_groups = Some(source);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventLoadSummary {
    pub rows_read: u64,
    pub out_of_range: u64,
    pub duplicates: u64,
    pub rows_loaded: u64,
}

#[derive(Debug, Clone, Default)]
pub struct LoadedInputs {
    pub raw_data: EventLoadSummary,
    pub unmatched_events: Option<EventLoadSummary>,
    pub detector_config: Vec<DetectorConfig>,
    pub device_groups: Option<Vec<DeviceGroup>>,
}

/// Records that can be appended into a staging table.
trait StagedRecord {
    const STAGING_COLUMNS: &'static str;

    fn append(&self, appender: &mut Appender<'_>) -> duckdb::Result<()>;
}

impl StagedRecord for RawEventRecord {
    const STAGING_COLUMNS: &'static str =
        "TimeStamp VARCHAR, DeviceId INTEGER, EventId BIGINT, Parameter BIGINT";

    fn append(&self, appender: &mut Appender<'_>) -> duckdb::Result<()> {
        appender.append_row(params![
            self.timestamp,
            self.device_id,
            self.event_id,
            self.parameter
        ])
    }
}

impl StagedRecord for DetectorConfig {
    const STAGING_COLUMNS: &'static str =
        "DeviceId INTEGER, Phase INTEGER, Parameter INTEGER, Function VARCHAR";

    fn append(&self, appender: &mut Appender<'_>) -> duckdb::Result<()> {
        appender.append_row(params![
            self.device_id,
            i32::from(self.phase),
            i32::from(self.parameter),
            self.function.as_str()
        ])
    }
}

impl StagedRecord for DeviceGroup {
    const STAGING_COLUMNS: &'static str = "DeviceId INTEGER, District VARCHAR, Corridor VARCHAR";

    fn append(&self, appender: &mut Appender<'_>) -> duckdb::Result<()> {
        appender.append_row(params![self.device_id, self.district, self.corridor])
    }
}

/// Materialises `source` as table `name`, either by reading a file or appending records.
fn stage<T: StagedRecord>(
    session: &AnalyticalSession,
    name: &str,
    source: &TableSource<T>,
) -> Result<()> {
    let table = quote_ident(name);
    match source {
        TableSource::Parquet(path) => session.execute_batch(&format!(
            "CREATE OR REPLACE TABLE {table} AS SELECT * FROM read_parquet({})",
            path_literal(path)
        )),
        TableSource::Csv(path) => session.execute_batch(&format!(
            "CREATE OR REPLACE TABLE {table} AS SELECT * FROM read_csv_auto({}, header=true, all_varchar=true)",
            path_literal(path)
        )),
        TableSource::Records(records) => {
            session.execute_batch(&format!(
                "CREATE OR REPLACE TABLE {table} ({})",
                T::STAGING_COLUMNS
            ))?;
            let mut appender = session.connection().appender(name)?;
            for record in records {
                record.append(&mut appender)?;
            }
            appender.flush()?;
            Ok(())
        }
    }
}

fn path_literal(path: &Path) -> String {
    quote_literal(&path.display().to_string())
}

/// Coerces one event batch into `target`, failing on timestamps that do not parse.
pub fn load_events(
    session: &AnalyticalSession,
    source: &EventSource,
    target: &str,
    source_name: &str,
) -> Result<EventLoadSummary> {
    let staging = format!("{target}_staging");
    stage(session, &staging, source)?;
    let staging_sql = quote_ident(&staging);
    let typed = format!("{target}_typed");
    let typed_sql = quote_ident(&typed);

    session.execute_batch(&format!(
        r#"
        CREATE OR REPLACE TEMP TABLE {typed_sql} AS
        SELECT
            CAST(TimeStamp AS VARCHAR) AS RawTimeStamp,
            TRY_CAST(TimeStamp AS TIMESTAMP) AS TimeStamp,
            TRY_CAST(DeviceId AS INTEGER) AS DeviceId,
            TRY_CAST(EventId AS BIGINT) AS EventId,
            TRY_CAST(Parameter AS BIGINT) AS Parameter
        FROM {staging_sql}
        "#
    ))?;

    let conn = session.connection();
    let (bad_rows, sample): (i64, Option<String>) = conn.query_row(
        &format!(
            "SELECT count(*), min(coalesce(RawTimeStamp, '<null>')) FROM {typed_sql} WHERE TimeStamp IS NULL"
        ),
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    if bad_rows > 0 {
        session.execute_batch(&format!(
            "DROP TABLE IF EXISTS {staging_sql}; DROP TABLE IF EXISTS {typed_sql};"
        ))?;
        return Err(AtspmError::DataFormat {
            source_name: source_name.to_string(),
            sample: sample.unwrap_or_default(),
            rows: bad_rows as u64,
        });
    }

    let rows_read = session.count_rows(&typed)?;
    let target_sql = quote_ident(target);
    session.execute_batch(&format!(
        r#"
        CREATE OR REPLACE TABLE {target_sql} AS
        SELECT DISTINCT
            TimeStamp,
            DeviceId,
            CAST(EventId AS INTEGER) AS EventId,
            CAST(Parameter AS INTEGER) AS Parameter
        FROM {typed_sql}
        WHERE DeviceId IS NOT NULL
          AND EventId BETWEEN {min} AND {max}
          AND Parameter BETWEEN {min} AND {max}
        ORDER BY DeviceId, TimeStamp, EventId, Parameter;
        DROP TABLE IF EXISTS {staging_sql};
        "#,
        min = codes::MIN_CODE,
        max = codes::MAX_CODE,
    ))?;

    let in_range: i64 = conn.query_row(
        &format!(
            "SELECT count(*) FROM {typed_sql} WHERE DeviceId IS NOT NULL AND EventId BETWEEN {} AND {} AND Parameter BETWEEN {} AND {}",
            codes::MIN_CODE,
            codes::MAX_CODE,
            codes::MIN_CODE,
            codes::MAX_CODE
        ),
        [],
        |row| row.get(0),
    )?;
    session.execute_batch(&format!("DROP TABLE IF EXISTS {typed_sql}"))?;

    let rows_loaded = session.count_rows(target)?;
    let in_range = in_range.max(0) as u64;
    let summary = EventLoadSummary {
        rows_read,
        out_of_range: rows_read.saturating_sub(in_range),
        duplicates: in_range.saturating_sub(rows_loaded),
        rows_loaded,
    };
    tracing::info!(
        source = source_name,
        rows_read = summary.rows_read,
        out_of_range = summary.out_of_range,
        duplicates = summary.duplicates,
        rows_loaded = summary.rows_loaded,
        "loaded events"
    );
    Ok(summary)
}

/// Loads and types the phase–detector configuration.
pub fn load_detector_config(
    session: &AnalyticalSession,
    source: &TableSource<DetectorConfig>,
) -> Result<Vec<DetectorConfig>> {
    let staging = format!("{DETECTOR_CONFIG}_staging");
    stage(session, &staging, source)?;
    session.execute_batch(&format!(
        r#"
        CREATE OR REPLACE TABLE {DETECTOR_CONFIG} AS
        SELECT DISTINCT
            TRY_CAST(DeviceId AS INTEGER) AS DeviceId,
            TRY_CAST(Phase AS INTEGER) AS Phase,
            TRY_CAST(Parameter AS INTEGER) AS Parameter,
            trim(CAST(Function AS VARCHAR)) AS Function
        FROM {staging}
        WHERE TRY_CAST(DeviceId AS INTEGER) IS NOT NULL
          AND TRY_CAST(Phase AS INTEGER) BETWEEN {min} AND {max}
          AND TRY_CAST(Parameter AS INTEGER) BETWEEN {min} AND {max}
          AND Function IS NOT NULL;
        DROP TABLE IF EXISTS {staging};
        "#,
        staging = quote_ident(&staging),
        min = codes::MIN_CODE,
        max = codes::MAX_CODE,
    ))?;

    let mut stmt = session.connection().prepare(&format!(
        "SELECT DeviceId, Phase, Parameter, Function FROM {DETECTOR_CONFIG} ORDER BY DeviceId, Function, Parameter, Phase"
    ))?;
    let mut rows = stmt.query([])?;
    let mut by_key: BTreeMap<(DeviceId, String, i16), DetectorConfig> = BTreeMap::new();
    let mut conflicts = 0usize;
    while let Some(row) = rows.next()? {
        let device_id: DeviceId = row.get(0)?;
        let phase: i32 = row.get(1)?;
        let parameter: i32 = row.get(2)?;
        let function: String = row.get(3)?;
        let (Ok(phase), Ok(parameter)) = (i16::try_from(phase), i16::try_from(parameter)) else {
            continue;
        };
        let function = DetectorFunction::parse(&function);
        let key = (device_id, function.as_str().to_string(), parameter);
        if by_key.contains_key(&key) {
            conflicts += 1;
            continue;
        }
        by_key.insert(
            key,
            DetectorConfig {
                device_id,
                phase,
                parameter,
                function,
            },
        );
    }
    if conflicts > 0 {
        tracing::warn!(
            conflicts,
            "detector channels mapped to more than one phase for the same function; keeping the lowest phase"
        );
    }
    let configs: Vec<DetectorConfig> = by_key.into_values().collect();
    tracing::info!(rows = configs.len(), "loaded detector configuration");
    Ok(configs)
}

pub fn load_device_groups(
    session: &AnalyticalSession,
    source: &TableSource<DeviceGroup>,
) -> Result<Vec<DeviceGroup>> {
    let staging = format!("{DEVICE_GROUPS}_staging");
    stage(session, &staging, source)?;
    session.execute_batch(&format!(
        r#"
        CREATE OR REPLACE TABLE {DEVICE_GROUPS} AS
        SELECT
            TRY_CAST(DeviceId AS INTEGER) AS DeviceId,
            CAST(District AS VARCHAR) AS District,
            CAST(Corridor AS VARCHAR) AS Corridor
        FROM {staging}
        WHERE TRY_CAST(DeviceId AS INTEGER) IS NOT NULL;
        DROP TABLE IF EXISTS {staging};
        "#,
        staging = quote_ident(&staging),
    ))?;

    let mut stmt = session.connection().prepare(&format!(
        "SELECT DeviceId, District, Corridor FROM {DEVICE_GROUPS} ORDER BY DeviceId"
    ))?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(DeviceGroup {
            device_id: row.get(0)?,
            district: row.get(1)?,
            corridor: row.get(2)?,
        });
    }
    tracing::info!(rows = out.len(), "loaded device groups");
    Ok(out)
}

/// Loads every input of `request`; builds `raw_data` and the `all_events` view for the timeline.
pub fn load_inputs(session: &AnalyticalSession, request: &LoadRequest) -> Result<LoadedInputs> {
    let raw_data = load_events(session, &request.raw_data, RAW_DATA, RAW_DATA)?;

    let unmatched_events = match &request.unmatched_events {
        Some(source) => Some(load_events(
            session,
            source,
            UNMATCHED_SUPPLEMENT,
            "unmatched_events",
        )?),
        None => None,
    };
    let view_sql = if unmatched_events.is_some() {
        format!(
            "CREATE OR REPLACE VIEW {ALL_EVENTS} AS SELECT * FROM {RAW_DATA} UNION SELECT * FROM {UNMATCHED_SUPPLEMENT}"
        )
    } else {
        format!("CREATE OR REPLACE VIEW {ALL_EVENTS} AS SELECT * FROM {RAW_DATA}")
    };
    session.execute_batch(&view_sql)?;

    let detector_config = load_detector_config(session, &request.detector_config)?;
    let device_groups = match &request.device_groups {
        Some(source) => Some(load_device_groups(session, source)?),
        None => None,
    };

    Ok(LoadedInputs {
        raw_data,
        unmatched_events,
        detector_config,
        device_groups,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{detector, record, ts};

    fn session() -> anyhow::Result<AnalyticalSession> {
        Ok(AnalyticalSession::open(Some(1))?)
    }

    #[test]
    fn filters_out_of_range_codes_and_duplicates() -> anyhow::Result<()> {
        let session = session()?;
        let source = EventSource::Records(vec![
            record("2024-03-05 00:00:00", 1, 82, 2),
            record("2024-03-05 00:00:00", 1, 82, 2),
            record("2024-03-05 00:00:01", 1, 40000, 2),
            record("2024-03-05 00:00:02", 1, 81, -1),
            record("2024-03-05 00:00:03", 1, 81, 2),
        ]);
        let summary = load_events(&session, &source, RAW_DATA, RAW_DATA)?;
        assert_eq!(
            summary,
            EventLoadSummary {
                rows_read: 5,
                out_of_range: 2,
                duplicates: 1,
                rows_loaded: 2,
            }
        );
        let events = session.fetch_events(RAW_DATA, &[81, 82])?;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].timestamp, ts("2024-03-05 00:00:03"));
        Ok(())
    }

    #[test]
    fn malformed_supplement_timestamps_fail_with_data_format() -> anyhow::Result<()> {
        let session = session()?;
        let raw = EventSource::Records(vec![record("2024-03-05 00:00:00", 1, 82, 2)]);
        let request = LoadRequest::new(raw, TableSource::Records(Vec::new()))
            .with_unmatched_events(EventSource::Records(vec![
                record("2024-03-05 00:00:00", 1, 82, 2),
                record("13/01/2024 7:00", 1, 82, 2),
            ]));
        let err = load_inputs(&session, &request).unwrap_err();
        match err {
            AtspmError::DataFormat {
                source_name,
                sample,
                rows,
            } => {
                assert_eq!(source_name, "unmatched_events");
                assert_eq!(sample, "13/01/2024 7:00");
                assert_eq!(rows, 1);
            }
            other => panic!("unexpected error {other}"),
        }
        Ok(())
    }

    #[test]
    fn all_events_view_merges_the_supplement() -> anyhow::Result<()> {
        let session = session()?;
        let request = LoadRequest::new(
            EventSource::Records(vec![record("2024-03-05 00:01:00", 1, 81, 2)]),
            TableSource::Records(vec![detector(1, 2, 2, "Presence")]),
        )
        .with_unmatched_events(EventSource::Records(vec![record(
            "2024-03-04 23:59:00",
            1,
            82,
            2,
        )]));
        let loaded = load_inputs(&session, &request)?;
        assert_eq!(loaded.raw_data.rows_loaded, 1);
        assert_eq!(session.count_rows(ALL_EVENTS)?, 2);
        assert_eq!(session.count_rows(RAW_DATA)?, 1);
        assert_eq!(loaded.detector_config.len(), 1);
        Ok(())
    }

    #[test]
    fn reads_csv_inputs() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events = temp.path().join("events.csv");
        std::fs::write(
            &events,
            "TimeStamp,DeviceId,EventId,Parameter\n2024-03-05 00:00:00,7,82,1\n2024-03-05 00:00:04.5,7,81,1\n",
        )?;
        let config = temp.path().join("config.csv");
        std::fs::write(
            &config,
            "DeviceId,Phase,Parameter,Function\n7,2,1,Presence\n7,6,1,Presence\n7,2,1,Yellow_Red\n",
        )?;

        let session = session()?;
        let request = LoadRequest::new(
            TableSource::from_path(&events)?,
            TableSource::from_path(&config)?,
        );
        let loaded = load_inputs(&session, &request)?;
        assert_eq!(loaded.raw_data.rows_loaded, 2);
        // Channel 1 maps to two phases for Presence; only the lowest is kept.
        assert_eq!(loaded.detector_config.len(), 2);
        assert!(loaded
            .detector_config
            .iter()
            .any(|c| c.function == DetectorFunction::YellowRed));
        let events = session.fetch_events(RAW_DATA, &[81])?;
        assert_eq!(events[0].timestamp, ts("2024-03-05 00:00:04.5"));
        Ok(())
    }

    #[test]
    fn rejects_unknown_file_extensions() {
        assert!(EventSource::from_path("events.json").is_err());
    }
}
