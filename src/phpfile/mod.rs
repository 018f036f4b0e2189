//! Direct access to the PHP timeseries engine's `.MYD` files.

pub mod decoder;

use crate::backend::Backend;
use crate::bulk::BulkBatch;
use crate::config::PhpConfig;
use crate::error::{EmoncmsError, Result};
use crate::model::{DataQuery, Feed, Input, NewFeed, Sample, Series};
use crate::time::{self, normalize, Resolution, TimeValue};
use chrono_tz::Tz;
use decoder::{decode_record, encode_record, DecodedSample, Decoder, RECORD_LEN};
use std::fs;
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const BACKEND: &str = "php-file";
const SUBDIR: &str = "phptimeseries";
const FILE_EXTENSION: &str = "MYD";

pub struct PhpEmoncms {
    data_dir: PathBuf,
    timezone: Tz,
}

impl PhpEmoncms {
    pub fn new(config: PhpConfig) -> Self {
        tracing::info!(data_dir = %config.data_dir.display(), "registering emoncms php timeseries directory");
        Self {
            data_dir: config.data_dir,
            timezone: config.timezone,
        }
    }

    fn series_dir(&self) -> PathBuf {
        self.data_dir.join(SUBDIR)
    }

    /// `{data_dir}/phptimeseries/{name}.MYD`, where the name defaults to
    /// `feed_{id}`.
    pub fn feed_file(&self, feed: &Feed) -> PathBuf {
        match feed.file_name() {
            Some(name) => self.named_file(name),
            None => self.named_file(&format!("feed_{}", feed.id())),
        }
    }

    pub fn named_file(&self, name: &str) -> PathBuf {
        self.series_dir().join(format!("{name}.{FILE_EXTENSION}"))
    }

    /// Whether the file covers `[start, end]`, judged from its first and
    /// last records only.
    pub fn contains(
        &self,
        feed: &Feed,
        start: Option<&TimeValue>,
        end: Option<&TimeValue>,
    ) -> Result<bool> {
        let start = self.epoch(start)?;
        let end = self.epoch(end)?;
        decoder::contains(&self.feed_file(feed), start, end)
    }

    fn epoch(&self, value: Option<&TimeValue>) -> Result<Option<i64>> {
        value
            .map(|value| normalize(value, &self.timezone, Resolution::Seconds))
            .transpose()
    }

    /// Decode any `.MYD` file, applying the same filtering as [`Backend::data`].
    pub fn read_series(&self, path: &Path, query: &DataQuery) -> Result<Series> {
        let start = self.epoch(query.start.as_ref())?;
        let end = self.epoch(query.end.as_ref())?;

        if query.strict && !decoder::contains(path, start, end)? {
            return Err(EmoncmsError::FeedDataUnavailable(format!(
                "{} does not cover {start:?}..={end:?}",
                path.display()
            )));
        }

        let file = match fs::File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(EmoncmsError::FeedDataUnavailable(format!(
                    "{} does not exist",
                    path.display()
                )))
            }
            Err(err) => return Err(err.into()),
        };
        let decoded = Decoder::new()
            .start(start)
            .end(end)
            .discard_epoch_year(true)
            .decode(std::io::BufReader::new(file), &path.display().to_string())?;
        tracing::debug!(path = %path.display(), count = decoded.len(), "decoded php timeseries samples");

        let tz = query.timezone.unwrap_or(chrono_tz::UTC);
        decoded
            .into_iter()
            .map(|sample| {
                Ok(Sample {
                    time: time::from_epoch_seconds(sample.timestamp, &tz)?,
                    value: f64::from(sample.value),
                })
            })
            .collect::<Result<Vec<_>>>()
            .map(Series::new)
    }

    fn write_point(&self, path: &Path, timestamp: i64, value: f64) -> Result<()> {
        let timestamp = u32::try_from(timestamp).map_err(|_| {
            EmoncmsError::InvalidTime(format!("{timestamp} does not fit a 32-bit feed timestamp"))
        })?;
        write_record(path, timestamp, value as f32)
    }
}

impl Backend for PhpEmoncms {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn timezone(&self) -> Tz {
        self.timezone
    }

    fn feed(&self, id: i64) -> Result<Feed> {
        Feed::from_id(id)
    }

    fn list_feeds(&self) -> Result<Vec<Feed>> {
        let dir = self.series_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if let Some(id) = feed_id_from_path(&path) {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        tracing::debug!(dir = %dir.display(), count = ids.len(), "listed php timeseries feeds");
        ids.into_iter().map(Feed::from_id).collect()
    }

    fn create_feed(&self, feed: &NewFeed) -> Result<Feed> {
        let next_id = self
            .list_feeds()?
            .iter()
            .map(Feed::id)
            .max()
            .unwrap_or(0)
            + 1;
        let created = Feed::from_id(next_id)?;
        let path = self.feed_file(&created);
        fs::create_dir_all(self.series_dir())?;
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        tracing::info!(feed_id = next_id, name = %feed.name, path = %path.display(), "created php timeseries feed");
        Ok(created)
    }

    fn data(&self, feed: &Feed, query: &DataQuery) -> Result<Series> {
        self.read_series(&self.feed_file(feed), query)
    }

    fn update(&self, feed: &Feed, time: &TimeValue, value: f64) -> Result<()> {
        let timestamp = normalize(time, &self.timezone, Resolution::Seconds)?;
        self.write_point(&self.feed_file(feed), timestamp, value)
    }

    fn write(&self, feed: &Feed, series: &Series) -> Result<()> {
        let path = self.feed_file(feed);
        for sample in series {
            self.write_point(&path, sample.time.timestamp(), sample.value)?;
        }
        tracing::debug!(feed_id = feed.id(), count = series.len(), "wrote php timeseries samples");
        Ok(())
    }

    fn post(&self, _input: &Input, _time: &TimeValue, _value: f64) -> Result<()> {
        Err(EmoncmsError::unsupported("input post", BACKEND))
    }

    fn post_bulk(&self, _batch: &BulkBatch, _reference: &TimeValue) -> Result<()> {
        Err(EmoncmsError::unsupported("bulk post", BACKEND))
    }
}

fn feed_id_from_path(path: &Path) -> Option<i64> {
    if path.extension()?.to_str()? != FILE_EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    stem.strip_prefix("feed_")?.parse::<i64>().ok().filter(|id| *id > 0)
}

/// Reads keep the last record per timestamp, so an existing timestamp is
/// overwritten at its last occurrence. A new timestamp is inserted in order
/// into a sorted file and appended to an unsorted one.
fn write_record(path: &Path, timestamp: u32, value: f32) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    let len = file.metadata()?.len();
    if len % RECORD_LEN as u64 != 0 {
        return Err(EmoncmsError::corrupt(
            path.display().to_string(),
            format!("length {len} is not a multiple of {RECORD_LEN}"),
        ));
    }
    let count = len / RECORD_LEN as u64;
    let record = encode_record(timestamp, value);
    let target = i64::from(timestamp);

    // A trailing record always wins.
    if count == 0 || read_at(&mut file, count - 1)?.timestamp < target {
        file.seek(SeekFrom::End(0))?;
        file.write_all(&record)?;
        return Ok(());
    }

    let mut bytes = Vec::with_capacity(len as usize);
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut bytes)?;
    let stamps: Vec<i64> = bytes
        .chunks_exact(RECORD_LEN)
        .map(|chunk| {
            let mut raw = [0u8; RECORD_LEN];
            raw.copy_from_slice(chunk);
            decode_record(&raw).timestamp
        })
        .collect();

    if let Some(index) = stamps.iter().rposition(|stamp| *stamp == target) {
        file.seek(SeekFrom::Start(index as u64 * RECORD_LEN as u64))?;
        file.write_all(&record)?;
        return Ok(());
    }

    if !stamps.windows(2).all(|pair| pair[0] <= pair[1]) {
        tracing::debug!(path = %path.display(), timestamp, "appending to unsorted feed file");
        file.seek(SeekFrom::End(0))?;
        file.write_all(&record)?;
        return Ok(());
    }

    drop(file);
    let index = stamps.partition_point(|stamp| *stamp < target);
    insert_at(path, bytes, index, &record)
}

fn read_at(file: &mut fs::File, index: u64) -> Result<DecodedSample> {
    let mut record = [0u8; RECORD_LEN];
    file.seek(SeekFrom::Start(index * RECORD_LEN as u64))?;
    file.read_exact(&mut record)?;
    Ok(decode_record(&record))
}

fn insert_at(path: &Path, mut bytes: Vec<u8>, index: usize, record: &[u8; RECORD_LEN]) -> Result<()> {
    let offset = index * RECORD_LEN;
    bytes.splice(offset..offset, record.iter().copied());
    let tmp = path.with_extension("MYD.tmp");
    fs::write(&tmp, &bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
