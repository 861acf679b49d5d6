use crate::error::Result;
use crate::services::aggregation::types::{DeviceId, RawEvent};
use crate::time::from_epoch_seconds;
use chrono::NaiveDateTime;
use duckdb::Connection;

/// One isolated in-memory analytical engine per run.
///
/// The processor owns the session exclusively; it is closed exactly once through [`close`].
///
/// [`close`]: AnalyticalSession::close
pub struct AnalyticalSession {
    conn: Connection,
    threads: Option<usize>,
}

impl std::fmt::Debug for AnalyticalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalyticalSession")
            .field("threads", &self.threads)
            .finish()
    }
}

impl AnalyticalSession {
    pub fn open(threads: Option<usize>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let _ = conn.execute("PRAGMA enable_progress_bar=false", []);
        if let Some(threads) = threads {
            conn.execute(&format!("PRAGMA threads={}", threads.max(1)), [])?;
        }
        tracing::debug!(threads = ?threads, "opened analytical session");
        Ok(Self { conn, threads })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    pub fn count_rows(&self, table: &str) -> Result<u64> {
        let sql = format!("SELECT count(*) FROM {}", quote_ident(table));
        let count: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    /// Events of `table` restricted to `codes`, ordered by device, time, code and parameter.
    pub fn fetch_events(&self, table: &str, codes: &[i16]) -> Result<Vec<RawEvent>> {
        if codes.is_empty() {
            return Ok(Vec::new());
        }
        let codes_sql = codes
            .iter()
            .map(|code| code.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            r#"
            SELECT TimeStamp, DeviceId, EventId, Parameter
            FROM {table}
            WHERE EventId IN ({codes_sql})
            ORDER BY DeviceId, TimeStamp, EventId, Parameter
            "#,
            table = quote_ident(table),
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let timestamp: NaiveDateTime = row.get(0)?;
            let device_id: DeviceId = row.get(1)?;
            let event_id: i32 = row.get(2)?;
            let parameter: i32 = row.get(3)?;
            // Loader keeps codes inside the i16 range.
            let (Ok(event_id), Ok(parameter)) = (i16::try_from(event_id), i16::try_from(parameter))
            else {
                continue;
            };
            out.push(RawEvent {
                timestamp,
                device_id,
                event_id,
                parameter,
            });
        }
        Ok(out)
    }

    /// Maximum event timestamp in `table`, the default batch horizon.
    pub fn max_timestamp(&self, table: &str) -> Result<Option<NaiveDateTime>> {
        let sql = format!("SELECT max(TimeStamp) FROM {}", quote_ident(table));
        let ts: Option<NaiveDateTime> = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(ts)
    }

    /// Runs a bucketed query whose first two columns are the epoch-second bucket and the device.
    pub fn query_bucketed<T>(
        &self,
        sql: &str,
        mut map: impl FnMut(NaiveDateTime, DeviceId, &duckdb::Row<'_>) -> duckdb::Result<T>,
    ) -> Result<Vec<T>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let bucket: i64 = row.get(0)?;
            let device_id: DeviceId = row.get(1)?;
            let Some(bucket) = from_epoch_seconds(bucket) else {
                continue;
            };
            out.push(map(bucket, device_id, row)?);
        }
        Ok(out)
    }

    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, err)| err)?;
        Ok(())
    }
}

pub(crate) fn escape_single_quotes(input: &str) -> String {
    input.replace('\'', "''")
}

pub(crate) fn quote_literal(input: &str) -> String {
    format!("'{}'", escape_single_quotes(input))
}

pub(crate) fn quote_ident(input: &str) -> String {
    format!("\"{}\"", input.replace('"', "\"\""))
}

/// Epoch-aligned bucket start (seconds) for a timestamp column.
pub(crate) fn bucket_sql(column: &str, bin_minutes: u32) -> String {
    let secs = i64::from(bin_minutes.max(1)) * 60;
    format!("CAST(floor(epoch({column}) / {secs}) * {secs} AS BIGINT)")
}
