//! Client for emoncms energy-monitoring feeds over its web API, its MySQL
//! store, or the PHP timeseries files on disk.

pub mod backend;
pub mod bulk;
pub mod config;
pub mod error;
pub mod http;
pub mod model;
pub mod mysql;
pub mod phpfile;
pub mod time;

pub use backend::{Backend, Emoncms, FeedRef, InputRef};
pub use bulk::{BulkBatch, BulkRecord};
pub use config::{ConnectionConfig, HttpConfig, Method, MysqlConfig, PhpConfig};
pub use error::{EmoncmsError, Result};
pub use model::{DataQuery, Feed, FeedLatest, FeedMeta, Input, NewFeed, Sample, Series};
pub use time::{normalize, Resolution, TimeValue};
