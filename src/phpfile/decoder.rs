//! Fixed 9-byte record format of the legacy PHP timeseries engine:
//! `[flag: u8][timestamp: u32 LE][value: f32 LE]`.

use crate::error::{EmoncmsError, Result};
use std::fs;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

pub const RECORD_LEN: usize = 9;
/// Flag byte the PHP engine writes in front of each record.
pub const RECORD_FLAG: u8 = 249;

/// Last second of 1970; anything at or below is a placeholder, not data.
const EPOCH_YEAR_END: i64 = 31_536_000 - 1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedSample {
    pub timestamp: i64,
    pub value: f32,
}

pub fn encode_record(timestamp: u32, value: f32) -> [u8; RECORD_LEN] {
    let mut record = [0u8; RECORD_LEN];
    record[0] = RECORD_FLAG;
    record[1..5].copy_from_slice(&timestamp.to_le_bytes());
    record[5..9].copy_from_slice(&value.to_le_bytes());
    record
}

pub(crate) fn decode_record(record: &[u8; RECORD_LEN]) -> DecodedSample {
    let timestamp = u32::from_le_bytes([record[1], record[2], record[3], record[4]]);
    let value = f32::from_le_bytes([record[5], record[6], record[7], record[8]]);
    DecodedSample {
        timestamp: i64::from(timestamp),
        value,
    }
}

/// Decoding options. Both range bounds are inclusive.
#[derive(Debug, Clone, Copy, Default)]
pub struct Decoder {
    start: Option<i64>,
    end: Option<i64>,
    discard_epoch_year: bool,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(mut self, start: Option<i64>) -> Self {
        self.start = start;
        self
    }

    pub fn end(mut self, end: Option<i64>) -> Self {
        self.end = end;
        self
    }

    pub fn discard_epoch_year(mut self, discard: bool) -> Self {
        self.discard_epoch_year = discard;
        self
    }

    fn keeps(&self, timestamp: i64) -> bool {
        if timestamp == 0 {
            return false;
        }
        if self.start.is_some_and(|start| timestamp < start) {
            return false;
        }
        if self.end.is_some_and(|end| timestamp > end) {
            return false;
        }
        !(self.discard_epoch_year && timestamp <= EPOCH_YEAR_END)
    }

    /// Decode every record from `reader`. `source` names the input in errors.
    pub fn decode<R: Read>(&self, mut reader: R, source: &str) -> Result<Vec<DecodedSample>> {
        let mut kept = Vec::new();
        let mut record = [0u8; RECORD_LEN];
        let mut offset = 0u64;
        loop {
            let filled = read_full(&mut reader, &mut record)?;
            if filled == 0 {
                break;
            }
            if filled < RECORD_LEN {
                return Err(EmoncmsError::corrupt(
                    source,
                    format!("truncated record at byte {offset}: {filled} of {RECORD_LEN} bytes"),
                ));
            }
            offset += RECORD_LEN as u64;

            let sample = decode_record(&record);
            if self.keeps(sample.timestamp) {
                kept.push(sample);
            }
        }
        Ok(dedup_keep_last(kept))
    }

    pub fn decode_bytes(&self, bytes: &[u8]) -> Result<Vec<DecodedSample>> {
        self.decode(bytes, "<memory>")
    }
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(filled)
}

/// Keep only the last record per timestamp, at that record's position.
fn dedup_keep_last(samples: Vec<DecodedSample>) -> Vec<DecodedSample> {
    let mut last_index = std::collections::HashMap::with_capacity(samples.len());
    for (idx, sample) in samples.iter().enumerate() {
        last_index.insert(sample.timestamp, idx);
    }
    samples
        .into_iter()
        .enumerate()
        .filter(|(idx, sample)| last_index.get(&sample.timestamp) == Some(idx))
        .map(|(_, sample)| sample)
        .collect()
}

/// First and last complete record of a feed file, or `None` when the file is
/// missing or holds no complete record.
pub fn bounds(path: &Path) -> Result<Option<(DecodedSample, DecodedSample)>> {
    let mut file = match fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let len = file.metadata()?.len();
    let records = len / RECORD_LEN as u64;
    if records == 0 {
        return Ok(None);
    }

    let mut record = [0u8; RECORD_LEN];
    file.read_exact(&mut record)?;
    let first = decode_record(&record);
    file.seek(SeekFrom::Start((records - 1) * RECORD_LEN as u64))?;
    file.read_exact(&mut record)?;
    let last = decode_record(&record);
    Ok(Some((first, last)))
}

/// Cheap coverage test using only the first and last records. Never fails
/// for a missing or empty file.
pub fn contains(path: &Path, start: Option<i64>, end: Option<i64>) -> Result<bool> {
    let Some((first, last)) = bounds(path)? else {
        return Ok(false);
    };
    if start.is_some_and(|start| start < first.timestamp) {
        return Ok(false);
    }
    if end.is_some_and(|end| end > last.timestamp) {
        return Ok(false);
    }
    Ok(true)
}
