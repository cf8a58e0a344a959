//! # Timescale Sink
//!
//! Inserts one row per record into a TimescaleDB hypertable.
//!
//! The target table is `schema.table` when the record's destination is
//! dotted, otherwise `schema_name.hypertable_name` from the configuration.
//! Schema, table and hypertable are created on first use with idempotent
//! DDL. Columns come from `timescale.columns` when configured, otherwise
//! from the first record written: numbers become `DOUBLE PRECISION`,
//! everything else `VARCHAR`. Values with no matching column are skipped.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use deadpool_postgres::{Config as DeadpoolConfig, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use serde_json::Value;
use tokio_postgres::types::ToSql;
use tokio_postgres::NoTls;
use tracing::{debug, info, warn};

use crate::configs::{SinkKind, TimescaleConfig};
use crate::record::CanonicalRecord;
use crate::transport::{Shaped, SinkAdapter, SinkError};

/// Column storage class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Double,
    Text,
}

impl ColumnKind {
    /// Maps a configured type name (`int`, `float`, anything else).
    pub fn from_type_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "int" | "float" | "double" | "number" => ColumnKind::Double,
            _ => ColumnKind::Text,
        }
    }

    fn of(value: &Value) -> Self {
        if value.is_number() {
            ColumnKind::Double
        } else {
            ColumnKind::Text
        }
    }

    fn sql(&self) -> &'static str {
        match self {
            ColumnKind::Double => "DOUBLE PRECISION",
            ColumnKind::Text => "VARCHAR",
        }
    }
}

/// Quotes an SQL identifier.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Resolves the `(schema, table)` a record is written to.
pub fn target<'a>(config: &'a TimescaleConfig, record: &'a CanonicalRecord) -> (&'a str, &'a str) {
    record
        .schema_and_table()
        .unwrap_or((config.schema_name.as_str(), config.hypertable_name.as_str()))
}

/// Candidate column values of a record: tags first, fields win on clashes.
/// Nulls are dropped.
pub fn row_values(record: &CanonicalRecord) -> BTreeMap<String, Value> {
    let mut values: BTreeMap<String, Value> = record
        .tags
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    for (k, v) in &record.fields {
        if !v.is_null() {
            values.insert(k.clone(), v.clone());
        }
    }
    values
}

/// Column layout for a new table.
pub fn columns_for(config: &TimescaleConfig, record: &CanonicalRecord) -> BTreeMap<String, ColumnKind> {
    if !config.columns.is_empty() {
        return config
            .columns
            .iter()
            .filter(|(name, _)| **name != config.time_field)
            .map(|(name, ty)| (name.clone(), ColumnKind::from_type_name(ty)))
            .collect();
    }
    row_values(record)
        .iter()
        .filter(|(name, _)| **name != config.time_field)
        .map(|(name, value)| (name.clone(), ColumnKind::of(value)))
        .collect()
}

/// The idempotent DDL batch for one table.
pub fn ddl(schema: &str, table: &str, time_field: &str, columns: &BTreeMap<String, ColumnKind>) -> String {
    let mut defs = vec![format!("{} TIMESTAMPTZ NOT NULL", quote_ident(time_field))];
    defs.extend(
        columns
            .iter()
            .map(|(name, kind)| format!("{} {} NULL", quote_ident(name), kind.sql())),
    );
    format!(
        "CREATE SCHEMA IF NOT EXISTS {schema}; CREATE TABLE IF NOT EXISTS {schema}.{table} ({defs});",
        schema = quote_ident(schema),
        table = quote_ident(table),
        defs = defs.join(", ")
    )
}

/// Converts a table into a hypertable unless it already is one.
pub fn hypertable_sql(schema: &str, table: &str, time_field: &str) -> String {
    let qualified = format!("{}.{}", quote_ident(schema), quote_ident(table));
    format!(
        "SELECT create_hypertable('{}', '{}', if_not_exists => TRUE);",
        qualified.replace('\'', "''"),
        time_field.replace('\'', "''")
    )
}

fn bind(value: &Value, kind: ColumnKind) -> Result<Box<dyn ToSql + Sync + Send>, SinkError> {
    match kind {
        ColumnKind::Double => {
            let number = match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
                _ => None,
            };
            number
                .map(|n| Box::new(n) as Box<dyn ToSql + Sync + Send>)
                .ok_or_else(|| SinkError::Rejected(format!("value {} does not fit a numeric column", value)))
        }
        ColumnKind::Text => {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Ok(Box::new(text))
        }
    }
}

/// Policy for database errors: data exceptions (class `22`), unknown
/// columns and type mismatches are dropped, everything else is retried.
pub fn classify_sqlstate(code: &str) -> bool {
    code.starts_with("22") || code == "42703" || code == "42804"
}

/// Name of the column an undefined-column error complains about, as in
/// `column "humidity" of relation "boiler" does not exist`.
pub fn missing_column(message: &str) -> Option<&str> {
    let start = message.find("column \"")? + "column \"".len();
    message[start..].split('"').next().filter(|name| !name.is_empty())
}

/// Warns about a row rejected because the existing table lacks one of its
/// columns; the table was created earlier with a different column set.
fn report_undefined_column(table: &str, message: &str) {
    warn!(
        sink = "timescale",
        table = %table,
        column = %missing_column(message).unwrap_or("unknown"),
        "table has no such column, row dropped"
    );
}

fn classify_insert(error: tokio_postgres::Error, table: &str) -> SinkError {
    if let Some(db) = error.as_db_error() {
        if db.code().code() == "42703" {
            report_undefined_column(table, db.message());
        }
    }
    classify(error)
}

fn classify(error: tokio_postgres::Error) -> SinkError {
    match error.as_db_error() {
        Some(db) if classify_sqlstate(db.code().code()) => SinkError::Rejected(db.to_string()),
        _ => SinkError::Transport(error.to_string()),
    }
}

/// # Timescale Sink
pub struct TimescaleSink {
    pool: Pool,
    config: TimescaleConfig,
    tables: HashMap<String, BTreeMap<String, ColumnKind>>,
}

impl TimescaleSink {
    pub fn new(config: &TimescaleConfig) -> Result<Self, SinkError> {
        let mut pg = DeadpoolConfig::new();
        pg.host = Some(config.host.clone());
        pg.port = Some(config.port);
        pg.user = config.user.clone();
        pg.password = config.password.clone();
        pg.dbname = config.dbname.clone();
        pg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        pg.pool = Some(PoolConfig::new(config.pool_size.max(1)));
        let pool = pg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| SinkError::Connect(format!("failed to create database pool: {}", e)))?;
        Ok(Self {
            pool,
            config: config.clone(),
            tables: HashMap::new(),
        })
    }

    async fn ensure_table(
        &mut self,
        client: &deadpool_postgres::Object,
        schema: &str,
        table: &str,
        record: &CanonicalRecord,
    ) -> Result<BTreeMap<String, ColumnKind>, SinkError> {
        let key = format!("{}.{}", schema, table);
        if let Some(columns) = self.tables.get(&key) {
            return Ok(columns.clone());
        }
        let columns = columns_for(&self.config, record);
        client
            .batch_execute(&ddl(schema, table, &self.config.time_field, &columns))
            .await
            .map_err(classify)?;
        if let Err(e) = client
            .batch_execute(&hypertable_sql(schema, table, &self.config.time_field))
            .await
        {
            warn!(sink = "timescale", table = %key, error = %e, "hypertable conversion failed, writing to a plain table");
        }
        info!(sink = "timescale", table = %key, columns = columns.len(), "table ready");
        self.tables.insert(key, columns.clone());
        Ok(columns)
    }
}

#[async_trait]
impl SinkAdapter for TimescaleSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Relational
    }

    async fn send(&mut self, shaped: Shaped) -> Result<(), SinkError> {
        let Shaped::Row(record) = shaped else {
            return Err(SinkError::Shape("timescale sink expects a row".to_string()));
        };
        let time = record
            .unit
            .to_datetime(record.timestamp)
            .ok_or_else(|| SinkError::Rejected(format!("timestamp {} out of range", record.timestamp)))?;
        let client = self.pool.get().await.map_err(|e| SinkError::Connect(e.to_string()))?;
        let (schema, table) = target(&self.config, &record);
        let (schema, table) = (schema.to_string(), table.to_string());
        let columns = self.ensure_table(&client, &schema, &table, &record).await?;

        let mut names = vec![quote_ident(&self.config.time_field)];
        let mut params: Vec<Box<dyn ToSql + Sync + Send>> = vec![Box::new(time)];
        for (name, value) in row_values(&record) {
            match columns.get(&name) {
                Some(kind) => {
                    params.push(bind(&value, *kind)?);
                    names.push(quote_ident(&name));
                }
                None => debug!(sink = "timescale", column = %name, "no such column, value skipped"),
            }
        }
        let placeholders: Vec<String> = (1..=params.len()).map(|i| format!("${}", i)).collect();
        let sql = format!(
            "INSERT INTO {}.{} ({}) VALUES ({})",
            quote_ident(&schema),
            quote_ident(&table),
            names.join(", "),
            placeholders.join(", ")
        );
        let refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();
        client
            .execute(sql.as_str(), &refs)
            .await
            .map_err(|e| classify_insert(e, &format!("{}.{}", schema, table)))?;
        Ok(())
    }
}
