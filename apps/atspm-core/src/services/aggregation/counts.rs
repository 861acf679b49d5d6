use crate::error::Result;
use crate::services::aggregation::types::{
    codes, col, Cell, Column, ColumnType, DeviceId, FaultType, TableRow,
};
use crate::services::loader::RAW_DATA;
use crate::services::session::{bucket_sql, AnalyticalSession};
use crate::time::floor_to_bin;
use chrono::{Duration, NaiveDateTime};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HasDataRow {
    pub timestamp: NaiveDateTime,
    pub device_id: DeviceId,
}

impl TableRow for HasDataRow {
    const COLUMNS: &'static [Column] = &[
        col("TimeStamp", ColumnType::Timestamp),
        col("DeviceId", ColumnType::Integer),
    ];

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::Timestamp(Some(self.timestamp)),
            Cell::Int(Some(i64::from(self.device_id))),
        ]
    }
}

/// Bins in which every `no_data_min` sub-window carries at least one event.
pub fn has_data(
    session: &AnalyticalSession,
    bin_size: u32,
    no_data_min: u32,
) -> Result<Vec<HasDataRow>> {
    let no_data_min = no_data_min.max(1);
    let bin_secs = i64::from(bin_size.max(1)) * 60;
    let required = (bin_size / no_data_min).max(1);
    let sql = format!(
        r#"
        WITH sub AS (
            SELECT DISTINCT DeviceId, {sub_bucket} AS sub_bucket
            FROM {RAW_DATA}
        )
        SELECT CAST(floor(sub_bucket / {bin_secs}) * {bin_secs} AS BIGINT) AS bucket, DeviceId
        FROM sub
        GROUP BY 1, 2
        HAVING count(*) >= {required}
        ORDER BY 2, 1
        "#,
        sub_bucket = bucket_sql("TimeStamp", no_data_min),
    );
    session.query_bucketed(&sql, |timestamp, device_id, _| {
        Ok(HasDataRow {
            timestamp,
            device_id,
        })
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActuationRow {
    pub timestamp: NaiveDateTime,
    pub device_id: DeviceId,
    pub detector: i16,
    pub total: i64,
}

impl TableRow for ActuationRow {
    const COLUMNS: &'static [Column] = &[
        col("TimeStamp", ColumnType::Timestamp),
        col("DeviceId", ColumnType::Integer),
        col("Detector", ColumnType::Integer),
        col("Total", ColumnType::BigInt),
    ];

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::Timestamp(Some(self.timestamp)),
            Cell::Int(Some(i64::from(self.device_id))),
            Cell::Int(Some(i64::from(self.detector))),
            Cell::Int(Some(self.total)),
        ]
    }

    fn bin_key(&self) -> Option<(DeviceId, NaiveDateTime)> {
        Some((self.device_id, self.timestamp))
    }
}

/// Detector-on counts per bin and detector channel.
pub fn actuations(session: &AnalyticalSession, bin_size: u32) -> Result<Vec<ActuationRow>> {
    let sql = format!(
        r#"
        SELECT {bucket} AS bucket, DeviceId, Parameter, count(*) AS Total
        FROM {RAW_DATA}
        WHERE EventId = {on}
        GROUP BY 1, 2, 3
        ORDER BY 2, 3, 1
        "#,
        bucket = bucket_sql("TimeStamp", bin_size),
        on = codes::DETECTOR_ON,
    );
    let rows = session.query_bucketed(&sql, |timestamp, device_id, row| {
        let detector: i32 = row.get(2)?;
        Ok(ActuationRow {
            timestamp,
            device_id,
            detector: detector as i16,
            total: row.get(3)?,
        })
    })?;
    Ok(rows)
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommunicationRow {
    pub timestamp: NaiveDateTime,
    pub device_id: DeviceId,
    pub event_id: i16,
    pub average: f64,
}

impl TableRow for CommunicationRow {
    const COLUMNS: &'static [Column] = &[
        col("TimeStamp", ColumnType::Timestamp),
        col("DeviceId", ColumnType::Integer),
        col("EventId", ColumnType::Integer),
        col("Average", ColumnType::Double),
    ];

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::Timestamp(Some(self.timestamp)),
            Cell::Int(Some(i64::from(self.device_id))),
            Cell::Int(Some(i64::from(self.event_id))),
            Cell::Float(Some(self.average)),
        ]
    }

    fn bin_key(&self) -> Option<(DeviceId, NaiveDateTime)> {
        Some((self.device_id, self.timestamp))
    }
}

/// Mean communication status parameter per bin and status code.
pub fn communications(
    session: &AnalyticalSession,
    bin_size: u32,
) -> Result<Vec<CommunicationRow>> {
    let codes_sql = codes::COMMUNICATION_CODES
        .iter()
        .map(|code| code.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        r#"
        SELECT {bucket} AS bucket, DeviceId, EventId, avg(Parameter) AS Average
        FROM {RAW_DATA}
        WHERE EventId IN ({codes_sql})
        GROUP BY 1, 2, 3
        ORDER BY 2, 3, 1
        "#,
        bucket = bucket_sql("TimeStamp", bin_size),
    );
    session.query_bucketed(&sql, |timestamp, device_id, row| {
        let event_id: i32 = row.get(2)?;
        Ok(CommunicationRow {
            timestamp,
            device_id,
            event_id: event_id as i16,
            average: row.get(3)?,
        })
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct TerminationRow {
    pub timestamp: NaiveDateTime,
    pub device_id: DeviceId,
    pub phase: i16,
    pub gap_out: i64,
    pub max_out: i64,
    pub force_off: i64,
    pub phase_call: i64,
    pub pct_max_out: f64,
}

impl TableRow for TerminationRow {
    const COLUMNS: &'static [Column] = &[
        col("TimeStamp", ColumnType::Timestamp),
        col("DeviceId", ColumnType::Integer),
        col("Phase", ColumnType::Integer),
        col("GapOut", ColumnType::BigInt),
        col("MaxOut", ColumnType::BigInt),
        col("ForceOff", ColumnType::BigInt),
        col("PhaseCall", ColumnType::BigInt),
        col("Pct_MaxOut", ColumnType::Double),
    ];

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::Timestamp(Some(self.timestamp)),
            Cell::Int(Some(i64::from(self.device_id))),
            Cell::Int(Some(i64::from(self.phase))),
            Cell::Int(Some(self.gap_out)),
            Cell::Int(Some(self.max_out)),
            Cell::Int(Some(self.force_off)),
            Cell::Int(Some(self.phase_call)),
            Cell::Float(Some(self.pct_max_out)),
        ]
    }

    fn bin_key(&self) -> Option<(DeviceId, NaiveDateTime)> {
        Some((self.device_id, self.timestamp))
    }
}

/// Share of phase terminations that ran to max or were forced off.
pub fn pct_max_out(gap_out: i64, max_out: i64, force_off: i64) -> f64 {
    let denominator = gap_out + max_out + force_off;
    if denominator <= 0 {
        return 0.0;
    }
    (max_out + force_off) as f64 / denominator as f64
}

pub fn terminations(session: &AnalyticalSession, bin_size: u32) -> Result<Vec<TerminationRow>> {
    let sql = format!(
        r#"
        SELECT {bucket} AS bucket, DeviceId, Parameter,
            count(*) FILTER (WHERE EventId = {gap}) AS GapOut,
            count(*) FILTER (WHERE EventId = {max}) AS MaxOut,
            count(*) FILTER (WHERE EventId = {force}) AS ForceOff,
            count(*) FILTER (WHERE EventId = {call}) AS PhaseCall
        FROM {RAW_DATA}
        WHERE EventId IN ({gap}, {max}, {force}, {call})
        GROUP BY 1, 2, 3
        ORDER BY 2, 3, 1
        "#,
        bucket = bucket_sql("TimeStamp", bin_size),
        gap = codes::PHASE_GAP_OUT,
        max = codes::PHASE_MAX_OUT,
        force = codes::PHASE_FORCE_OFF,
        call = codes::PHASE_CALL_REGISTERED,
    );
    session.query_bucketed(&sql, |timestamp, device_id, row| {
        let phase: i32 = row.get(2)?;
        let gap_out: i64 = row.get(3)?;
        let max_out: i64 = row.get(4)?;
        let force_off: i64 = row.get(5)?;
        Ok(TerminationRow {
            timestamp,
            device_id,
            phase: phase as i16,
            gap_out,
            max_out,
            force_off,
            phase_call: row.get(6)?,
            pct_max_out: pct_max_out(gap_out, max_out, force_off),
        })
    })
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DetectorFaultRow {
    pub timestamp: NaiveDateTime,
    pub device_id: DeviceId,
    pub detector: i16,
    pub fault: FaultType,
}

impl TableRow for DetectorFaultRow {
    const COLUMNS: &'static [Column] = &[
        col("TimeStamp", ColumnType::Timestamp),
        col("DeviceId", ColumnType::Integer),
        col("Detector", ColumnType::Integer),
        col("Fault", ColumnType::Varchar),
    ];

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::Timestamp(Some(self.timestamp)),
            Cell::Int(Some(i64::from(self.device_id))),
            Cell::Int(Some(i64::from(self.detector))),
            Cell::Text(Some(self.fault.as_str().to_string())),
        ]
    }

    fn bin_key(&self) -> Option<(DeviceId, NaiveDateTime)> {
        Some((self.device_id, self.timestamp))
    }
}

/// Hardware fault bins per detector.
///
/// A stuck-on report marks every bin until the detector next reports off or restored (or the
/// end of the batch). Erratic reports mark their own bin. Stuck-on wins within a bin.
pub fn detector_faults(
    session: &AnalyticalSession,
    bin_size: u32,
) -> Result<Vec<DetectorFaultRow>> {
    let events = session.fetch_events(
        RAW_DATA,
        &[
            codes::DETECTOR_OFF,
            codes::DETECTOR_RESTORED,
            codes::DETECTOR_STUCK_ON,
            codes::DETECTOR_ERRATIC,
        ],
    )?;
    let Some(horizon) = session.max_timestamp(RAW_DATA)? else {
        return Ok(Vec::new());
    };

    let mut per_detector: BTreeMap<(DeviceId, i16), Vec<(NaiveDateTime, i16)>> = BTreeMap::new();
    for event in &events {
        per_detector
            .entry((event.device_id, event.parameter))
            .or_default()
            .push((event.timestamp, event.event_id));
    }

    let step = Duration::minutes(i64::from(bin_size.max(1)));
    let mut faults: BTreeMap<(DeviceId, i16, NaiveDateTime), FaultType> = BTreeMap::new();
    for ((device_id, detector), mut list) in per_detector {
        list.sort();
        let mut marked: Vec<(NaiveDateTime, FaultType)> = Vec::new();
        let mut stuck_since: Option<NaiveDateTime> = None;
        for (ts, code) in list {
            match code {
                codes::DETECTOR_STUCK_ON => {
                    stuck_since.get_or_insert(ts);
                }
                codes::DETECTOR_ERRATIC => {
                    marked.push((floor_to_bin(ts, bin_size), FaultType::Erratic));
                }
                _ => {
                    if let Some(since) = stuck_since.take() {
                        stuck_bins(&mut marked, since, ts, bin_size, step);
                    }
                }
            }
        }
        if let Some(since) = stuck_since {
            stuck_bins(&mut marked, since, horizon, bin_size, step);
        }
        for (bin, fault) in marked {
            faults
                .entry((device_id, detector, bin))
                .and_modify(|existing| *existing = (*existing).min(fault))
                .or_insert(fault);
        }
    }

    let mut rows: Vec<DetectorFaultRow> = faults
        .into_iter()
        .map(|((device_id, detector, timestamp), fault)| DetectorFaultRow {
            timestamp,
            device_id,
            detector,
            fault,
        })
        .collect();
    rows.sort_by_key(|r| (r.device_id, r.detector, r.timestamp));
    Ok(rows)
}

fn stuck_bins(
    marked: &mut Vec<(NaiveDateTime, FaultType)>,
    since: NaiveDateTime,
    until: NaiveDateTime,
    bin_size: u32,
    step: Duration,
) {
    let mut bin = floor_to_bin(since, bin_size);
    loop {
        marked.push((bin, FaultType::StuckOn));
        bin += step;
        if bin >= until {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::loader::{load_events, EventSource};
    use crate::test_support::{record, ts};

    fn loaded(records: Vec<crate::services::loader::RawEventRecord>) -> anyhow::Result<AnalyticalSession> {
        let session = AnalyticalSession::open(Some(1))?;
        load_events(&session, &EventSource::Records(records), RAW_DATA, RAW_DATA)?;
        Ok(session)
    }

    #[test]
    fn has_data_requires_every_sub_window() -> anyhow::Result<()> {
        let session = loaded(vec![
            // Device 1: events in all three 5-minute windows of 08:00.
            record("2024-03-05 08:01:00", 1, 82, 1),
            record("2024-03-05 08:06:00", 1, 82, 1),
            record("2024-03-05 08:11:00", 1, 82, 1),
            // Device 2: nothing between 08:05 and 08:10.
            record("2024-03-05 08:01:00", 2, 82, 1),
            record("2024-03-05 08:11:00", 2, 82, 1),
        ])?;
        let rows = has_data(&session, 15, 5)?;
        assert_eq!(
            rows,
            vec![HasDataRow {
                timestamp: ts("2024-03-05 08:00:00"),
                device_id: 1,
            }]
        );
        Ok(())
    }

    #[test]
    fn counts_actuations_communications_and_terminations() -> anyhow::Result<()> {
        let session = loaded(vec![
            record("2024-03-05 08:01:00", 1, 82, 3),
            record("2024-03-05 08:02:00", 1, 82, 3),
            record("2024-03-05 08:16:00", 1, 82, 3),
            record("2024-03-05 08:01:00", 1, 400, 1),
            record("2024-03-05 08:03:00", 1, 400, 0),
            record("2024-03-05 08:01:00", 1, 4, 2),
            record("2024-03-05 08:02:00", 1, 5, 2),
            record("2024-03-05 08:03:00", 1, 6, 2),
            record("2024-03-05 08:04:00", 1, 4, 2),
            record("2024-03-05 08:05:00", 1, 43, 2),
        ])?;

        let actuations = actuations(&session, 15)?;
        assert_eq!(actuations.len(), 2);
        assert_eq!(actuations[0].total, 2);
        assert_eq!(actuations[1].timestamp, ts("2024-03-05 08:15:00"));

        let comms = communications(&session, 15)?;
        assert_eq!(comms.len(), 1);
        assert_eq!(comms[0].average, 0.5);

        let terms = terminations(&session, 15)?;
        assert_eq!(terms.len(), 1);
        assert_eq!(
            (terms[0].gap_out, terms[0].max_out, terms[0].force_off, terms[0].phase_call),
            (2, 1, 1, 1)
        );
        assert_eq!(terms[0].pct_max_out, 0.5);
        assert_eq!(pct_max_out(0, 0, 0), 0.0);
        Ok(())
    }

    #[test]
    fn stuck_on_carries_forward_until_cleared() -> anyhow::Result<()> {
        let session = loaded(vec![
            record("2024-03-05 08:05:00", 1, 87, 4),
            record("2024-03-05 08:20:00", 1, 88, 4),
            record("2024-03-05 08:40:00", 1, 83, 4),
            record("2024-03-05 09:10:00", 1, 88, 4),
            record("2024-03-05 09:20:00", 1, 82, 9),
        ])?;
        let rows = detector_faults(&session, 15)?;
        let summary: Vec<(NaiveDateTime, FaultType)> =
            rows.iter().map(|r| (r.timestamp, r.fault)).collect();
        assert_eq!(
            summary,
            vec![
                (ts("2024-03-05 08:00:00"), FaultType::StuckOn),
                (ts("2024-03-05 08:15:00"), FaultType::StuckOn),
                (ts("2024-03-05 08:30:00"), FaultType::StuckOn),
                (ts("2024-03-05 09:00:00"), FaultType::Erratic),
            ]
        );
        Ok(())
    }
}
