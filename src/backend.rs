use crate::bulk::BulkBatch;
use crate::config::ConnectionConfig;
use crate::error::Result;
use crate::http::HttpEmoncms;
use crate::model::{DataQuery, Feed, Input, NewFeed, Series};
use crate::mysql::MysqlEmoncms;
use crate::phpfile::PhpEmoncms;
use crate::time::TimeValue;
use chrono_tz::Tz;
use std::ops::Deref;

pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Zone naive timestamps are read in.
    fn timezone(&self) -> Tz;

    fn feed(&self, id: i64) -> Result<Feed>;

    fn list_feeds(&self) -> Result<Vec<Feed>>;

    fn create_feed(&self, feed: &NewFeed) -> Result<Feed>;

    /// Samples of `feed` in the queried range. An empty range yields an
    /// empty series.
    fn data(&self, feed: &Feed, query: &DataQuery) -> Result<Series>;

    fn update(&self, feed: &Feed, time: &TimeValue, value: f64) -> Result<()>;

    fn write(&self, feed: &Feed, series: &Series) -> Result<()>;

    fn post(&self, input: &Input, time: &TimeValue, value: f64) -> Result<()>;

    fn post_bulk(&self, batch: &BulkBatch, reference: &TimeValue) -> Result<()>;
}

pub enum Emoncms {
    Http(HttpEmoncms),
    Mysql(MysqlEmoncms),
    PhpFile(PhpEmoncms),
}

impl Emoncms {
    pub fn connect(config: ConnectionConfig) -> Result<Self> {
        Ok(match config {
            ConnectionConfig::Http(config) => Emoncms::Http(HttpEmoncms::new(config)?),
            ConnectionConfig::Mysql(config) => Emoncms::Mysql(MysqlEmoncms::connect(config)?),
            ConnectionConfig::PhpFile(config) => Emoncms::PhpFile(PhpEmoncms::new(config)),
        })
    }

    pub fn backend(&self) -> &dyn Backend {
        match self {
            Emoncms::Http(backend) => backend,
            Emoncms::Mysql(backend) => backend,
            Emoncms::PhpFile(backend) => backend,
        }
    }

    pub fn timezone(&self) -> Tz {
        self.backend().timezone()
    }

    pub fn input(&self, node: impl Into<String>, name: impl Into<String>) -> InputRef<'_> {
        InputRef {
            backend: self.backend(),
            input: Input::new(node, name),
        }
    }

    pub fn feed(&self, id: i64) -> Result<FeedRef<'_>> {
        let feed = self.backend().feed(id)?;
        Ok(self.bind(feed))
    }

    /// Feed `id` read from the series file `name` instead of `feed_{id}`.
    /// Only the PHP-file backend stores series by name.
    pub fn feed_named(&self, id: i64, name: &str) -> Result<FeedRef<'_>> {
        let feed = self.backend().feed(id)?.with_file_name(name)?;
        Ok(self.bind(feed))
    }

    pub fn list_feeds(&self) -> Result<Vec<FeedRef<'_>>> {
        Ok(self
            .backend()
            .list_feeds()?
            .into_iter()
            .map(|feed| self.bind(feed))
            .collect())
    }

    pub fn create_feed(&self, feed: &NewFeed) -> Result<FeedRef<'_>> {
        let feed = self.backend().create_feed(feed)?;
        Ok(self.bind(feed))
    }

    /// Bulk-post `batch` with times relative to `reference`.
    pub fn post(&self, batch: &BulkBatch, reference: impl Into<TimeValue>) -> Result<()> {
        self.backend().post_bulk(batch, &reference.into())
    }

    pub fn bind(&self, feed: Feed) -> FeedRef<'_> {
        FeedRef {
            backend: self.backend(),
            feed,
        }
    }
}

pub struct FeedRef<'a> {
    backend: &'a dyn Backend,
    feed: Feed,
}

impl<'a> FeedRef<'a> {
    pub fn data(&self, query: &DataQuery) -> Result<Series> {
        self.backend.data(&self.feed, query)
    }

    pub fn update(&self, time: impl Into<TimeValue>, value: f64) -> Result<()> {
        self.backend.update(&self.feed, &time.into(), value)
    }

    pub fn write(&self, series: &Series) -> Result<()> {
        self.backend.write(&self.feed, series)
    }

    pub fn into_feed(self) -> Feed {
        self.feed
    }
}

impl Deref for FeedRef<'_> {
    type Target = Feed;

    fn deref(&self) -> &Feed {
        &self.feed
    }
}

pub struct InputRef<'a> {
    backend: &'a dyn Backend,
    input: Input,
}

impl<'a> InputRef<'a> {
    pub fn post(&self, time: impl Into<TimeValue>, value: f64) -> Result<()> {
        self.backend.post(&self.input, &time.into(), value)
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.input.id = Some(id);
        self
    }
}

impl Deref for InputRef<'_> {
    type Target = Input;

    fn deref(&self) -> &Input {
        &self.input
    }
}
