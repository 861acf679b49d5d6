use crate::config::{OutputConfig, OutputFormat};
use crate::error::Result;
use crate::services::aggregation::types::{Cell, ColumnType, OutputTable};
use crate::services::loader::{DETECTOR_CONFIG, RAW_DATA};
use crate::services::session::{quote_ident, quote_literal};
use duckdb::types::Value;
use duckdb::{appender_params_from_iter, Connection};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Destination for finished aggregation tables.
pub trait TableSink {
    fn write_table(&mut self, table: &OutputTable) -> Result<()>;
}

/// Keeps tables in memory; used by tests and embedding callers.
#[derive(Debug, Default)]
pub struct MemorySink {
    tables: BTreeMap<String, OutputTable>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tables.keys().map(String::as_str).collect()
    }

    pub fn into_tables(self) -> BTreeMap<String, OutputTable> {
        self.tables
    }
}

impl TableSink for MemorySink {
    fn write_table(&mut self, table: &OutputTable) -> Result<()> {
        self.tables.insert(table.name.clone(), table.clone());
        Ok(())
    }
}

/// Writes each table to its own Parquet or CSV file under `dir`.
#[derive(Debug, Clone)]
pub struct FileSink {
    config: OutputConfig,
    written: Vec<PathBuf>,
}

impl FileSink {
    pub fn new(config: OutputConfig) -> Self {
        Self {
            config,
            written: Vec::new(),
        }
    }

    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }

    /// `{dir}/{table}/{prefix}.{ext}` with separate folders, `{dir}/{prefix}{table}.{ext}` otherwise.
    pub fn path_for(&self, table: &str) -> PathBuf {
        let ext = self.config.format.extension();
        let prefix = self.config.file_prefix.as_str();
        if self.config.separate_folders {
            let stem = if prefix.is_empty() { table } else { prefix };
            self.config.dir.join(table).join(format!("{stem}.{ext}"))
        } else {
            self.config.dir.join(format!("{prefix}{table}.{ext}"))
        }
    }
}

impl TableSink for FileSink {
    fn write_table(&mut self, table: &OutputTable) -> Result<()> {
        if table.name == RAW_DATA || table.name == DETECTOR_CONFIG {
            tracing::debug!(table = %table.name, "input tables are not written back");
            return Ok(());
        }
        let path = self.path_for(&table.name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        export_table(table, &path, self.config.format)?;
        tracing::info!(
            table = %table.name,
            rows = table.len(),
            path = %path.display(),
            "wrote aggregation output"
        );
        self.written.push(path);
        Ok(())
    }
}

fn staging_type(kind: ColumnType) -> &'static str {
    match kind {
        ColumnType::Integer | ColumnType::BigInt => "BIGINT",
        ColumnType::Timestamp => "VARCHAR",
        other => other.sql(),
    }
}

fn cell_value(cell: &Cell) -> Value {
    match cell {
        Cell::Int(Some(v)) => Value::BigInt(*v),
        Cell::Float(Some(v)) if v.is_finite() => Value::Double(*v),
        Cell::Bool(v) => Value::Boolean(*v),
        Cell::Text(Some(v)) => Value::Text(v.clone()),
        Cell::Timestamp(Some(v)) => Value::Text(v.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
        _ => Value::Null,
    }
}

/// Stages `table` in a scratch engine with its declared column types, then copies it out.
fn export_table(table: &OutputTable, path: &Path, format: OutputFormat) -> Result<()> {
    let conn = Connection::open_in_memory()?;
    let _ = conn.execute("PRAGMA enable_progress_bar=false", []);

    let staging_columns = table
        .columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(c.name), staging_type(c.kind)))
        .collect::<Vec<_>>()
        .join(", ");
    conn.execute_batch(&format!("CREATE TABLE staged ({staging_columns})"))?;
    {
        let mut appender = conn.appender("staged")?;
        for row in &table.rows {
            appender.append_row(appender_params_from_iter(row.iter().map(cell_value)))?;
        }
        appender.flush()?;
    }

    let projection = table
        .columns
        .iter()
        .map(|c| {
            let name = quote_ident(c.name);
            format!("CAST({name} AS {}) AS {name}", c.kind.sql())
        })
        .collect::<Vec<_>>()
        .join(", ");
    let options = match format {
        OutputFormat::Parquet => "FORMAT PARQUET",
        OutputFormat::Csv => "FORMAT CSV, HEADER",
    };
    conn.execute_batch(&format!(
        "COPY (SELECT {projection} FROM staged) TO {} ({options})",
        quote_literal(&path.display().to_string())
    ))?;
    conn.close().map_err(|(_, err)| err)?;
    Ok(())
}
