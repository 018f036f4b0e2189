//! `{id}.meta` sidecar files: one `key=value` pair per line.

use crate::error::{EmoncmsError, Result};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub type Meta = BTreeMap<String, String>;

pub const TABLE_NAME: &str = "table_name";

pub fn meta_path(dir: &Path, feed_id: i64) -> PathBuf {
    dir.join(format!("{feed_id}.meta"))
}

pub fn read_meta(dir: &Path, feed_id: i64) -> Result<Meta> {
    let path = meta_path(dir, feed_id);
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(EmoncmsError::InvalidFeedDescriptor(format!(
                "feed {feed_id} has no meta file at {}",
                path.display()
            )))
        }
        Err(err) => return Err(err.into()),
    };
    Ok(parse_meta(&contents))
}

fn parse_meta(contents: &str) -> Meta {
    contents
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

/// Write `meta` unless a file for `feed_id` already exists. Returns whether
/// a file was written.
pub fn write_meta(dir: &Path, feed_id: i64, meta: &Meta) -> Result<bool> {
    let path = meta_path(dir, feed_id);
    if path.exists() {
        tracing::debug!(feed_id, path = %path.display(), "meta file already present");
        return Ok(false);
    }
    fs::create_dir_all(dir)?;
    let contents: String = meta
        .iter()
        .map(|(key, value)| format!("{key}={value}\n"))
        .collect();
    let tmp = path.with_extension("meta.tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, &path)?;
    Ok(true)
}

pub fn table_meta(table_name: &str) -> Meta {
    [
        (TABLE_NAME, table_name),
        ("value_type", "FLOAT"),
        ("value_empty", "false"),
        ("start_time", "0"),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_string(), value.to_string()))
    .collect()
}
