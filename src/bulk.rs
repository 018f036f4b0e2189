//! Batching of named input values for a single `input/bulk` request.

use crate::error::Result;
use crate::time::{normalize, Resolution, TimeValue};
use chrono_tz::Tz;
use serde_json::{json, Map, Value as JsonValue};

/// All values posted for one node at one timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkRecord {
    pub timestamp: i64,
    pub node: String,
    values: Vec<(String, f64)>,
}

impl BulkRecord {
    fn new(timestamp: i64, node: String) -> Self {
        Self {
            timestamp,
            node,
            values: Vec::new(),
        }
    }

    fn set(&mut self, name: &str, value: f64) {
        match self.values.iter_mut().find(|(existing, _)| existing == name) {
            Some(slot) => slot.1 = value,
            None => self.values.push((name.to_string(), value)),
        }
    }

    /// Values in first-insertion order.
    pub fn values(&self) -> &[(String, f64)] {
        &self.values
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| *value)
    }
}

/// Records kept ascending by timestamp, one per (timestamp, node).
#[derive(Debug, Clone)]
pub struct BulkBatch {
    timezone: Tz,
    records: Vec<BulkRecord>,
}

impl BulkBatch {
    /// `timezone` is used to read naive times passed to [`add`](Self::add)
    /// and [`parse`](Self::parse).
    pub fn new(timezone: Tz) -> Self {
        Self {
            timezone,
            records: Vec::new(),
        }
    }

    pub fn add(
        &mut self,
        time: impl Into<TimeValue>,
        node: impl Into<String>,
        name: &str,
        value: f64,
    ) -> Result<()> {
        let timestamp = normalize(&time.into(), &self.timezone, Resolution::Seconds)?;
        let node = node.into();

        if let Some(record) = self
            .records
            .iter_mut()
            .find(|record| record.timestamp == timestamp && record.node == node)
        {
            record.set(name, value);
            return Ok(());
        }

        let mut record = BulkRecord::new(timestamp, node);
        record.set(name, value);
        // Insert after existing equal timestamps so the order stays stable.
        let idx = self
            .records
            .partition_point(|existing| existing.timestamp <= timestamp);
        self.records.insert(idx, record);
        Ok(())
    }

    /// Project the batch into the relative-time bulk encoding:
    /// `[[timestamp - reference, node, {name: value, ...}], ...]`.
    pub fn parse(&self, reference: impl Into<TimeValue>) -> Result<Vec<JsonValue>> {
        let reference = normalize(&reference.into(), &self.timezone, Resolution::Seconds)?;
        Ok(self
            .records
            .iter()
            .map(|record| {
                let values: Map<String, JsonValue> = record
                    .values
                    .iter()
                    .map(|(name, value)| (name.clone(), json!(value)))
                    .collect();
                json!([record.timestamp - reference, record.node, values])
            })
            .collect())
    }

    pub fn records(&self) -> &[BulkRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }
}
