use crate::error::{EmoncmsError, Result};
use crate::time::{self, TimeValue};
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, PartialEq)]
pub struct Feed {
    id: i64,
    meta: Option<FeedMeta>,
    file_name: Option<String>,
}

/// Descriptive fields only known when a feed came from a descriptor record.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedMeta {
    pub userid: i64,
    pub name: String,
    pub tag: String,
    pub datatype: i64,
    pub engine: i64,
    pub processes: String,
    pub latest: Option<FeedLatest>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedLatest {
    pub time: DateTime<Tz>,
    pub value: f64,
}

impl Feed {
    pub fn from_id(id: i64) -> Result<Self> {
        if id <= 0 {
            return Err(EmoncmsError::InvalidFeedDescriptor(format!(
                "feed id must be positive, got {id}"
            )));
        }
        Ok(Self {
            id,
            meta: None,
            file_name: None,
        })
    }

    /// Parse an id that may arrive wrapped in quotes, e.g. `"42"` from a
    /// create response body.
    pub fn from_id_str(raw: &str) -> Result<Self> {
        let stripped = raw
            .trim()
            .trim_matches(|c| c == '"' || c == '\'')
            .trim();
        let id = stripped.parse::<i64>().map_err(|_| {
            EmoncmsError::InvalidFeedDescriptor(format!("feed id \"{raw}\" is not an integer"))
        })?;
        Self::from_id(id)
    }

    /// Build a feed from a `feed/list.json`-style record. The latest sample is
    /// only set when the record carries a non-null `time`.
    pub fn from_descriptor(descriptor: &JsonValue, tz: &Tz) -> Result<Self> {
        let map = descriptor.as_object().ok_or_else(|| {
            EmoncmsError::InvalidFeedDescriptor(format!("expected an object, got {descriptor}"))
        })?;

        let id = required_int(map, "id")?;
        let userid = required_int(map, "userid")?;
        let name = required_text(map, "name")?;
        let tag = required_text(map, "tag")?;
        let datatype = required_int(map, "datatype")?;
        let engine = required_int(map, "engine")?;
        let processes = match map.get("processList") {
            None | Some(JsonValue::Null) => String::new(),
            Some(JsonValue::String(list)) => list.clone(),
            Some(other) => other.to_string(),
        };

        let latest = match map.get("time") {
            None | Some(JsonValue::Null) => None,
            Some(raw) => {
                let secs = json_int(raw).ok_or_else(|| {
                    EmoncmsError::InvalidFeedDescriptor(format!("feed {id} has invalid time {raw}"))
                })?;
                let value = map.get("value").and_then(json_float).unwrap_or(f64::NAN);
                Some(FeedLatest {
                    time: time::from_epoch_seconds(secs, tz)?,
                    value,
                })
            }
        };

        let mut feed = Self::from_id(id)?;
        feed.meta = Some(FeedMeta {
            userid,
            name,
            tag,
            datatype,
            engine,
            processes,
            latest,
        });
        Ok(feed)
    }

    pub fn from_json(value: &JsonValue, tz: &Tz) -> Result<Self> {
        match value {
            JsonValue::Number(number) => {
                let id = number.as_i64().ok_or_else(|| {
                    EmoncmsError::InvalidFeedDescriptor(format!("feed id {number} is not an integer"))
                })?;
                Self::from_id(id)
            }
            JsonValue::String(raw) => Self::from_id_str(raw),
            JsonValue::Object(_) => Self::from_descriptor(value, tz),
            other => Err(EmoncmsError::InvalidFeedDescriptor(format!(
                "unsupported feed shape: {other}"
            ))),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn meta(&self) -> Option<&FeedMeta> {
        self.meta.as_ref()
    }

    pub fn name(&self) -> Option<&str> {
        self.meta.as_ref().map(|meta| meta.name.as_str())
    }

    pub fn latest(&self) -> Option<&FeedLatest> {
        self.meta.as_ref().and_then(|meta| meta.latest.as_ref())
    }

    /// Store name for file-backed series; `feed_{id}` when unset.
    pub fn with_file_name(mut self, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let valid = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\']);
        if !valid {
            return Err(EmoncmsError::InvalidFeedDescriptor(format!(
                "invalid feed file name \"{name}\""
            )));
        }
        self.file_name = Some(name);
        Ok(self)
    }

    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }
}

fn required_int(map: &serde_json::Map<String, JsonValue>, key: &str) -> Result<i64> {
    let raw = map
        .get(key)
        .ok_or_else(|| EmoncmsError::InvalidFeedDescriptor(format!("missing field \"{key}\"")))?;
    json_int(raw).ok_or_else(|| {
        EmoncmsError::InvalidFeedDescriptor(format!("field \"{key}\" is not an integer: {raw}"))
    })
}

fn required_text(map: &serde_json::Map<String, JsonValue>, key: &str) -> Result<String> {
    match map.get(key) {
        Some(JsonValue::String(text)) => Ok(text.clone()),
        Some(JsonValue::Null) => Ok(String::new()),
        Some(JsonValue::Number(number)) => Ok(number.to_string()),
        Some(other) => Err(EmoncmsError::InvalidFeedDescriptor(format!(
            "field \"{key}\" is not text: {other}"
        ))),
        None => Err(EmoncmsError::InvalidFeedDescriptor(format!(
            "missing field \"{key}\""
        ))),
    }
}

/// emoncms returns numeric columns either as numbers or numeric strings.
pub(crate) fn json_int(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|v| v.trunc() as i64)),
        JsonValue::String(text) => {
            let trimmed = text.trim();
            trimmed
                .parse::<i64>()
                .ok()
                .or_else(|| trimmed.parse::<f64>().ok().map(|v| v.trunc() as i64))
        }
        _ => None,
    }
}

pub(crate) fn json_float(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(number) => number.as_f64(),
        JsonValue::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Input {
    pub node: String,
    pub name: String,
    pub id: Option<i64>,
}

impl Input {
    pub fn new(node: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            name: name.into(),
            id: None,
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewFeed {
    pub name: String,
    pub tag: String,
    pub datatype: i64,
    pub engine: i64,
    pub options: Option<JsonValue>,
}

impl NewFeed {
    pub fn new(name: impl Into<String>, datatype: i64, engine: i64) -> Self {
        Self {
            name: name.into(),
            tag: String::new(),
            datatype,
            engine,
            options: None,
        }
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn options(mut self, options: JsonValue) -> Self {
        self.options = Some(options);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct DataQuery {
    pub start: Option<TimeValue>,
    pub end: Option<TimeValue>,
    pub interval: Option<std::time::Duration>,
    /// Zone the returned samples are expressed in; the connection zone (HTTP)
    /// or UTC (MySQL, PHP-file) when unset.
    pub timezone: Option<Tz>,
    /// Sum-resample step in seconds, applied by the MySQL backend above 900 s.
    pub resolution: Option<u32>,
    /// Fail with `FeedDataUnavailable` if a PHP-file feed does not cover the range.
    pub strict: bool,
}

impl DataQuery {
    pub fn range(start: impl Into<TimeValue>, end: impl Into<TimeValue>) -> Self {
        Self {
            start: Some(start.into()),
            end: Some(end.into()),
            ..Self::default()
        }
    }

    pub fn since(start: impl Into<TimeValue>) -> Self {
        Self {
            start: Some(start.into()),
            ..Self::default()
        }
    }

    pub fn interval(mut self, interval: std::time::Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn timezone(mut self, tz: Tz) -> Self {
        self.timezone = Some(tz);
        self
    }

    pub fn resolution(mut self, seconds: u32) -> Self {
        self.resolution = Some(seconds);
        self
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub time: DateTime<Tz>,
    pub value: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Series {
    samples: Vec<Sample>,
}

impl Series {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Sample> {
        self.samples.iter()
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<Sample> {
        self.samples
    }

    pub fn push(&mut self, time: DateTime<Tz>, value: f64) {
        self.samples.push(Sample { time, value });
    }

    pub fn with_timezone(self, tz: &Tz) -> Self {
        let samples = self
            .samples
            .into_iter()
            .map(|sample| Sample {
                time: sample.time.with_timezone(tz),
                value: sample.value,
            })
            .collect();
        Self { samples }
    }

    /// Sum samples into `step_seconds` buckets. Bucket edges sit at
    /// `offset_seconds` past each multiple of the step; a bucket is labelled
    /// by its left edge. Empty buckets between populated ones are emitted as 0.
    pub fn resample_sum(&self, step_seconds: u32, offset_seconds: i64) -> Self {
        let Some(first) = self.samples.first() else {
            return Self::default();
        };
        let step = i64::from(step_seconds.max(1));
        let tz = first.time.timezone();
        let bucket_of = |secs: i64| (secs - offset_seconds).div_euclid(step) * step + offset_seconds;

        let stamps = self.samples.iter().map(|sample| sample.time.timestamp());
        let first_bucket = bucket_of(stamps.clone().min().unwrap_or_default());
        let last_bucket = bucket_of(stamps.max().unwrap_or_default());
        let count = ((last_bucket - first_bucket) / step + 1) as usize;
        let mut sums = vec![0.0f64; count];
        for sample in &self.samples {
            let idx = ((bucket_of(sample.time.timestamp()) - first_bucket) / step) as usize;
            sums[idx] += sample.value;
        }

        let samples = sums
            .into_iter()
            .enumerate()
            .filter_map(|(idx, value)| {
                let secs = first_bucket + idx as i64 * step;
                Utc.timestamp_opt(secs, 0).single().map(|utc| Sample {
                    time: utc.with_timezone(&tz),
                    value,
                })
            })
            .collect();
        Self { samples }
    }
}

impl IntoIterator for Series {
    type Item = Sample;
    type IntoIter = std::vec::IntoIter<Sample>;

    fn into_iter(self) -> Self::IntoIter {
        self.samples.into_iter()
    }
}

impl<'a> IntoIterator for &'a Series {
    type Item = &'a Sample;
    type IntoIter = std::slice::Iter<'a, Sample>;

    fn into_iter(self) -> Self::IntoIter {
        self.samples.iter()
    }
}

impl FromIterator<Sample> for Series {
    fn from_iter<I: IntoIterator<Item = Sample>>(iter: I) -> Self {
        Self {
            samples: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn all_id_shapes_resolve_to_the_same_feed() {
        let tz = chrono_tz::UTC;
        let from_int = Feed::from_id(42).expect("int");
        let from_str = Feed::from_id_str("42").expect("str");
        let from_quoted = Feed::from_id_str("\"42\"").expect("quoted");
        let from_json = Feed::from_json(&json!("\"42\""), &tz).expect("json");
        assert_eq!(from_int.id(), 42);
        assert_eq!(from_str.id(), 42);
        assert_eq!(from_quoted.id(), 42);
        assert_eq!(from_json.id(), 42);
        assert!(from_quoted.meta().is_none());
    }

    #[test]
    fn non_positive_or_non_numeric_ids_are_rejected() {
        assert!(matches!(
            Feed::from_id(0),
            Err(EmoncmsError::InvalidFeedDescriptor(_))
        ));
        assert!(matches!(
            Feed::from_id_str("\"abc\""),
            Err(EmoncmsError::InvalidFeedDescriptor(_))
        ));
    }

    #[test]
    fn file_names_must_stay_inside_the_series_directory() {
        let feed = Feed::from_id(4).unwrap();
        assert_eq!(feed.file_name(), None);
        let named = feed.clone().with_file_name("meter_a").expect("name");
        assert_eq!(named.file_name(), Some("meter_a"));
        for bad in ["", "..", "a/b", "a\\b"] {
            assert!(matches!(
                feed.clone().with_file_name(bad),
                Err(EmoncmsError::InvalidFeedDescriptor(_))
            ));
        }
    }

    #[test]
    fn unsupported_json_shapes_are_rejected() {
        let tz = chrono_tz::UTC;
        for value in [json!(null), json!([1, 2]), json!(true)] {
            assert!(matches!(
                Feed::from_json(&value, &tz),
                Err(EmoncmsError::InvalidFeedDescriptor(_))
            ));
        }
    }

    #[test]
    fn descriptor_without_time_has_no_latest_value() {
        let descriptor = json!({
            "id": "7", "userid": "1", "name": "house_power", "tag": "power",
            "datatype": "1", "engine": "5", "time": null, "value": null
        });
        let feed = Feed::from_descriptor(&descriptor, &chrono_tz::UTC).expect("feed");
        let meta = feed.meta().expect("meta");
        assert_eq!(feed.id(), 7);
        assert_eq!(meta.name, "house_power");
        assert_eq!(meta.engine, 5);
        assert_eq!(meta.processes, "");
        assert!(feed.latest().is_none());
    }

    #[test]
    fn descriptor_latest_is_localized_to_connection_timezone() {
        let tz = chrono_tz::Europe::Berlin;
        let descriptor = json!({
            "id": 3, "userid": 1, "name": "solar", "tag": "pv",
            "datatype": 1, "engine": 5, "processList": "1:2,2:3",
            "time": 1_700_000_000, "value": "512.5"
        });
        let feed = Feed::from_descriptor(&descriptor, &tz).expect("feed");
        let latest = feed.latest().expect("latest");
        assert_eq!(latest.time.timestamp(), 1_700_000_000);
        assert_eq!(latest.time.timezone(), tz);
        assert_eq!(latest.value, 512.5);
        assert_eq!(feed.meta().expect("meta").processes, "1:2,2:3");
    }

    #[test]
    fn descriptor_missing_required_field_is_rejected() {
        let descriptor = json!({ "id": 3, "name": "solar" });
        let err = Feed::from_descriptor(&descriptor, &chrono_tz::UTC).unwrap_err();
        assert!(err.to_string().contains("userid"));
    }

    #[test]
    fn resample_sums_into_aligned_buckets() {
        let tz = chrono_tz::UTC;
        let series: Series = [0i64, 600, 1800, 3600, 4500]
            .into_iter()
            .map(|secs| Sample {
                time: time::from_epoch_seconds(secs, &tz).expect("time"),
                value: 1.0,
            })
            .collect();
        let hourly = series.resample_sum(3600, 0);
        let values: Vec<f64> = hourly.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![3.0, 2.0]);
        assert_eq!(hourly.samples()[1].time.timestamp(), 3600);
    }
}
