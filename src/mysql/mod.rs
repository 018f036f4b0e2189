//! Direct access to the emoncms MySQL store.

mod connector;
pub mod meta;

pub use connector::{ExecResult, SqlConnector, SqlValue, SqlxMysqlConnector};

use crate::backend::Backend;
use crate::bulk::BulkBatch;
use crate::config::MysqlConfig;
use crate::error::{EmoncmsError, Result};
use crate::model::{DataQuery, Feed, Input, NewFeed, Series};
use crate::time::{self, normalize, Resolution, TimeValue};
use chrono_tz::Tz;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const BACKEND: &str = "mysql";
/// Resolutions above this are summed into buckets client-side.
const RESAMPLE_THRESHOLD_SECS: u32 = 900;
const FEED_COLUMNS: [&str; 9] = [
    "id",
    "userid",
    "name",
    "tag",
    "datatype",
    "engine",
    "processList",
    "time",
    "value",
];

pub struct MysqlEmoncms {
    database_root: String,
    database_data: String,
    meta_dir: PathBuf,
    user_id: i64,
    timezone: Tz,
    connector: Mutex<Box<dyn SqlConnector>>,
    tables: Mutex<HashMap<i64, String>>,
}

impl MysqlEmoncms {
    pub fn connect(config: MysqlConfig) -> Result<Self> {
        tracing::info!(user = %config.user, host = %config.host, port = config.port, "opening connection to emoncms mysql server");
        let connector = SqlxMysqlConnector::connect(&config)?;
        Self::with_connector(config, Box::new(connector))
    }

    pub fn with_connector(config: MysqlConfig, connector: Box<dyn SqlConnector>) -> Result<Self> {
        identifier("database", &config.database_root)?;
        identifier("database", &config.database_data)?;
        Ok(Self {
            database_root: config.database_root,
            database_data: config.database_data,
            meta_dir: config.meta_dir,
            user_id: config.user_id,
            timezone: config.timezone,
            connector: Mutex::new(connector),
            tables: Mutex::new(HashMap::new()),
        })
    }

    pub fn meta_dir(&self) -> &Path {
        &self.meta_dir
    }

    fn connector(&self) -> MutexGuard<'_, Box<dyn SqlConnector>> {
        self.connector
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Data table of `feed`, read from its meta file on first use.
    pub fn table_name(&self, feed: &Feed) -> Result<String> {
        let mut tables = self
            .tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(table) = tables.get(&feed.id()) {
            return Ok(table.clone());
        }
        let meta = self.read_meta(feed.id())?;
        let table = meta.get(meta::TABLE_NAME).ok_or_else(|| {
            EmoncmsError::InvalidFeedDescriptor(format!("meta of feed {} has no table_name", feed.id()))
        })?;
        identifier("table", table)?;
        tables.insert(feed.id(), table.clone());
        Ok(table.clone())
    }

    pub fn read_meta(&self, feed_id: i64) -> Result<meta::Meta> {
        meta::read_meta(&self.meta_dir, feed_id)
    }

    pub fn create_meta(&self, feed_id: i64, table_name: &str) -> Result<()> {
        identifier("table", table_name)?;
        if meta::write_meta(&self.meta_dir, feed_id, &meta::table_meta(table_name))? {
            tracing::debug!(feed_id, table = table_name, "wrote feed meta file");
        }
        Ok(())
    }

    pub fn create_table(&self, table_name: &str) -> Result<()> {
        let table = identifier("table", table_name)?;
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {}.{table} (time INT UNSIGNED NOT NULL PRIMARY KEY, data FLOAT)",
            self.database_data
        );
        self.connector().execute(&sql, &[])?;
        Ok(())
    }

    pub fn get(&self, feed: &Feed, field: &str) -> Result<SqlValue> {
        let field = identifier("field", field)?;
        let sql = format!("SELECT {field} FROM {}.feeds WHERE id = ?", self.database_root);
        let row = self
            .connector()
            .fetch_one(&sql, &[SqlValue::Int(feed.id())])?
            .ok_or_else(|| {
                EmoncmsError::InvalidFeedDescriptor(format!("feed {} does not exist", feed.id()))
            })?;
        Ok(row.into_iter().next().unwrap_or(SqlValue::Null))
    }

    pub fn set(&self, feed: &Feed, field: &str, value: impl Into<SqlValue>) -> Result<()> {
        let field = identifier("field", field)?;
        let sql = format!("UPDATE {}.feeds SET {field} = ? WHERE id = ?", self.database_root);
        self.connector()
            .execute(&sql, &[value.into(), SqlValue::Int(feed.id())])?;
        Ok(())
    }

    fn upsert(&self, table: &str, rows: Vec<Vec<SqlValue>>) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "INSERT INTO {}.{table} (time, data) VALUES (?, ?) ON DUPLICATE KEY UPDATE data=VALUES(data)",
            self.database_data
        );
        let result = self.connector().execute_many(&sql, &rows)?;
        tracing::debug!(table, rows = rows.len(), affected = result.rows_affected, "upserted feed data");
        Ok(())
    }
}

/// Only plain identifiers are spliced into statements.
fn identifier<'a>(kind: &str, name: &'a str) -> Result<&'a str> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(name)
    } else {
        Err(EmoncmsError::Config(format!("invalid {kind} name \"{name}\"")))
    }
}

fn row_descriptor(row: &[SqlValue]) -> JsonValue {
    let map: Map<String, JsonValue> = FEED_COLUMNS
        .iter()
        .zip(row)
        .map(|(column, value)| (column.to_string(), value.to_json()))
        .collect();
    JsonValue::Object(map)
}

impl Backend for MysqlEmoncms {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn timezone(&self) -> Tz {
        self.timezone
    }

    fn feed(&self, id: i64) -> Result<Feed> {
        let feed = Feed::from_id(id)?;
        self.table_name(&feed)?;
        Ok(feed)
    }

    fn list_feeds(&self) -> Result<Vec<Feed>> {
        let sql = format!(
            "SELECT {} FROM {}.feeds ORDER BY id ASC",
            FEED_COLUMNS.join(", "),
            self.database_root
        );
        let rows = self.connector().fetch_all(&sql, &[])?;
        rows.iter()
            .map(|row| Feed::from_descriptor(&row_descriptor(row), &self.timezone))
            .collect()
    }

    fn create_feed(&self, feed: &NewFeed) -> Result<Feed> {
        let sql = format!(
            "INSERT INTO {}.feeds (userid, name, tag, datatype, engine) VALUES (?, ?, ?, ?, ?)",
            self.database_root
        );
        let result = self.connector().execute(
            &sql,
            &[
                SqlValue::Int(self.user_id),
                SqlValue::from(feed.name.as_str()),
                SqlValue::from(feed.tag.as_str()),
                SqlValue::Int(feed.datatype),
                SqlValue::Int(feed.engine),
            ],
        )?;
        let id = i64::try_from(result.last_insert_id).map_err(|_| {
            EmoncmsError::Response(format!("feed id {} out of range", result.last_insert_id))
        })?;
        let created = Feed::from_id(id)?;

        let table = format!("feed_{id}");
        self.create_table(&table)?;
        self.create_meta(id, &table)?;
        self.tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, table.clone());
        tracing::info!(feed_id = id, name = %feed.name, table = %table, "created emoncms mysql feed");
        Ok(created)
    }

    fn data(&self, feed: &Feed, query: &DataQuery) -> Result<Series> {
        let table = self.table_name(feed)?;
        let start = match &query.start {
            Some(start) => normalize(start, &self.timezone, Resolution::Seconds)?,
            None => 0,
        };
        let end = query
            .end
            .as_ref()
            .map(|end| normalize(end, &self.timezone, Resolution::Seconds))
            .transpose()?;

        let mut sql = format!(
            "SELECT time, data FROM {}.{table} WHERE time >= ?",
            self.database_data
        );
        let mut params = vec![SqlValue::Int(start)];
        if let Some(end) = end {
            sql.push_str(" AND time <= ?");
            params.push(SqlValue::Int(end));
        }
        sql.push_str(" ORDER BY time ASC");
        let rows = self.connector().fetch_all(&sql, &params)?;

        let tz = query.timezone.unwrap_or(chrono_tz::UTC);
        let mut series = Series::default();
        for row in &rows {
            let (Some(secs), Some(value)) = (
                row.first().and_then(SqlValue::as_i64),
                row.get(1).and_then(SqlValue::as_f64),
            ) else {
                continue;
            };
            series.push(time::from_epoch_seconds(secs, &tz)?, value);
        }
        tracing::debug!(feed_id = feed.id(), table = %table, count = series.len(), "selected feed data");

        match query.resolution {
            // Buckets start at the query start, i.e. at its offset from
            // local midnight modulo the step.
            Some(step) if step > RESAMPLE_THRESHOLD_SECS => Ok(series.resample_sum(step, start)),
            _ => Ok(series),
        }
    }

    fn update(&self, feed: &Feed, time: &TimeValue, value: f64) -> Result<()> {
        let table = self.table_name(feed)?;
        let timestamp = normalize(time, &self.timezone, Resolution::Seconds)?;
        self.upsert(&table, vec![vec![SqlValue::Int(timestamp), SqlValue::Float(value)]])
    }

    fn write(&self, feed: &Feed, series: &Series) -> Result<()> {
        let table = self.table_name(feed)?;
        let rows = series
            .iter()
            .map(|sample| {
                vec![
                    SqlValue::Int(sample.time.timestamp()),
                    SqlValue::Float(sample.value),
                ]
            })
            .collect();
        self.upsert(&table, rows)
    }

    fn post(&self, _input: &Input, _time: &TimeValue, _value: f64) -> Result<()> {
        Err(EmoncmsError::unsupported("input post", BACKEND))
    }

    fn post_bulk(&self, _batch: &BulkBatch, _reference: &TimeValue) -> Result<()> {
        Err(EmoncmsError::unsupported("bulk post", BACKEND))
    }
}
