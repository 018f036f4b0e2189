//! The emoncms web API.

use crate::backend::Backend;
use crate::bulk::BulkBatch;
use crate::config::HttpConfig;
use crate::error::{EmoncmsError, Result};
use crate::model::{json_float, DataQuery, Feed, Input, NewFeed, Series};
use crate::time::{self, normalize, Resolution, TimeValue};
use chrono_tz::Tz;
use reqwest::blocking::Client;
use serde_json::{json, Map, Value as JsonValue};
use url::Url;

const BACKEND: &str = "http";
const DEFAULT_INTERVAL_SECS: u64 = 60;

pub type Params = Vec<(&'static str, String)>;

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

pub trait HttpTransport: Send + Sync {
    fn get(&self, url: &Url, params: &Params) -> Result<HttpResponse>;

    /// Parameters travel as a form-encoded body.
    fn post(&self, url: &Url, params: &Params) -> Result<HttpResponse>;
}

pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: std::time::Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| EmoncmsError::Connection(format!("failed to build http client: {err}")))?;
        Ok(Self { client })
    }
}

impl HttpTransport for ReqwestTransport {
    fn get(&self, url: &Url, params: &Params) -> Result<HttpResponse> {
        let response = self.client.get(url.clone()).query(params).send()?;
        let status = response.status().as_u16();
        let body = response.text()?;
        Ok(HttpResponse { status, body })
    }

    fn post(&self, url: &Url, params: &Params) -> Result<HttpResponse> {
        let response = self.client.post(url.clone()).form(params).send()?;
        let status = response.status().as_u16();
        let body = response.text()?;
        Ok(HttpResponse { status, body })
    }
}

#[derive(Debug, Clone, Copy)]
enum Verb {
    Get,
    Post,
}

pub struct HttpEmoncms {
    base: Url,
    apikey: String,
    timezone: Tz,
    transport: Box<dyn HttpTransport>,
}

impl HttpEmoncms {
    pub fn new(config: HttpConfig) -> Result<Self> {
        let transport = ReqwestTransport::new(config.timeout())?;
        Self::with_transport(config, Box::new(transport))
    }

    pub fn with_transport(config: HttpConfig, transport: Box<dyn HttpTransport>) -> Result<Self> {
        let base = base_url(&config.address)?;
        tracing::info!(address = %base, "registering connection to emoncms webserver");
        Ok(Self {
            base,
            apikey: config.apikey,
            timezone: config.timezone,
            transport,
        })
    }

    pub fn address(&self) -> &Url {
        &self.base
    }

    /// Latest value of each feed, `None` where the server has none.
    pub fn fetch(&self, feeds: &[Feed]) -> Result<Vec<Option<f64>>> {
        let ids = feeds
            .iter()
            .map(|feed| feed.id().to_string())
            .collect::<Vec<_>>()
            .join(",");
        let value = self.request_json(Verb::Get, "feed/fetch.json", vec![("ids", ids)])?;
        let values = value
            .as_array()
            .ok_or_else(|| EmoncmsError::Response(format!("expected an array, got {value}")))?;
        Ok(values.iter().map(json_float).collect())
    }

    fn request(&self, verb: Verb, action: &str, mut params: Params) -> Result<String> {
        let url = self
            .base
            .join(action)
            .map_err(|err| EmoncmsError::Config(format!("invalid action \"{action}\": {err}")))?;
        params.push(("apikey", self.apikey.clone()));
        tracing::debug!(action, "requesting emoncms");

        let response = match verb {
            Verb::Get => self.transport.get(&url, &params)?,
            Verb::Post => self.transport.post(&url, &params)?,
        };
        if !(200..300).contains(&response.status) {
            return Err(EmoncmsError::Response(format!(
                "{action} returned status {}: {}",
                response.status,
                response.body.trim()
            )));
        }
        check_body(action, &response.body)?;
        Ok(response.body)
    }

    fn request_json(&self, verb: Verb, action: &str, params: Params) -> Result<JsonValue> {
        let body = self.request(verb, action, params)?;
        Ok(serde_json::from_str(&body)?)
    }
}

/// Reject the two failure shapes emoncms returns with a 200 status: a bare
/// `false` and a `{"success": false, "message": ...}` envelope.
fn check_body(action: &str, body: &str) -> Result<()> {
    let trimmed = body.trim();
    if trimmed == "false" {
        return Err(EmoncmsError::Response(format!("{action} returned false")));
    }
    if let Ok(JsonValue::Object(map)) = serde_json::from_str::<JsonValue>(trimmed) {
        if map.get("success") == Some(&JsonValue::Bool(false)) {
            let message = map
                .get("message")
                .and_then(JsonValue::as_str)
                .unwrap_or("unknown error");
            return Err(EmoncmsError::Response(format!("{action} failed: {message}")));
        }
    }
    Ok(())
}

fn base_url(address: &str) -> Result<Url> {
    let trimmed = address.trim();
    let with_slash = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    };
    Url::parse(&with_slash)
        .map_err(|err| EmoncmsError::Config(format!("invalid emoncms address \"{address}\": {err}")))
}

fn parse_data(value: &JsonValue, start_ms: i64, end_ms: i64, tz: &Tz) -> Result<Series> {
    let rows = value
        .as_array()
        .ok_or_else(|| EmoncmsError::Response(format!("expected a data array, got {value}")))?;

    let mut series = Series::default();
    for row in rows {
        let pair = row
            .as_array()
            .filter(|pair| pair.len() >= 2)
            .ok_or_else(|| EmoncmsError::Response(format!("malformed data point {row}")))?;
        let ms = pair[0]
            .as_i64()
            .or_else(|| pair[0].as_f64().map(|ms| ms as i64))
            .ok_or_else(|| EmoncmsError::Response(format!("malformed data time {}", pair[0])))?;
        // The server pads the range with its nearest neighbours.
        if ms < start_ms || ms > end_ms {
            continue;
        }
        let Some(value) = json_float(&pair[1]) else {
            continue;
        };
        series.push(time::from_epoch_millis(ms, tz)?, value);
    }
    Ok(series)
}

impl Backend for HttpEmoncms {
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
        let value = self.request_json(Verb::Get, "feed/list.json", Vec::new())?;
        let descriptors = value
            .as_array()
            .ok_or_else(|| EmoncmsError::Response(format!("expected a feed list, got {value}")))?;
        descriptors
            .iter()
            .map(|descriptor| Feed::from_descriptor(descriptor, &self.timezone))
            .collect()
    }

    fn create_feed(&self, feed: &NewFeed) -> Result<Feed> {
        let mut params: Params = vec![
            ("name", feed.name.clone()),
            ("tag", feed.tag.clone()),
            ("datatype", feed.datatype.to_string()),
            ("engine", feed.engine.to_string()),
        ];
        if let Some(options) = &feed.options {
            params.push(("options", options.to_string()));
        }
        let value = self.request_json(Verb::Get, "feed/create.json", params)?;
        let feedid = value
            .get("feedid")
            .ok_or_else(|| EmoncmsError::Response(format!("create returned no feedid: {value}")))?;
        let created = Feed::from_json(feedid, &self.timezone)?;
        tracing::info!(feed_id = created.id(), name = %feed.name, "created emoncms feed");
        Ok(created)
    }

    fn data(&self, feed: &Feed, query: &DataQuery) -> Result<Series> {
        let (Some(start), Some(end)) = (&query.start, &query.end) else {
            return Err(EmoncmsError::InvalidTime(
                "http data requests need both start and end".to_string(),
            ));
        };
        let start_ms = normalize(start, &self.timezone, Resolution::Millis)?;
        let end_ms = normalize(end, &self.timezone, Resolution::Millis)?;
        let interval = query
            .interval
            .map(|interval| interval.as_secs().max(1))
            .unwrap_or(DEFAULT_INTERVAL_SECS);

        tracing::debug!(feed_id = feed.id(), start_ms, end_ms, interval, "requesting feed data");
        let value = self.request_json(
            Verb::Get,
            "feed/data.json",
            vec![
                ("id", feed.id().to_string()),
                ("start", start_ms.to_string()),
                ("end", end_ms.to_string()),
                ("interval", interval.to_string()),
            ],
        )?;

        let tz = query.timezone.unwrap_or(self.timezone);
        let series = parse_data(&value, start_ms, end_ms, &tz)?;
        tracing::debug!(feed_id = feed.id(), count = series.len(), "received feed data");
        Ok(series)
    }

    fn update(&self, feed: &Feed, time: &TimeValue, value: f64) -> Result<()> {
        let timestamp = normalize(time, &self.timezone, Resolution::Seconds)?;
        self.request(
            Verb::Get,
            "feed/update.json",
            vec![
                ("id", feed.id().to_string()),
                ("time", timestamp.to_string()),
                ("value", value.to_string()),
            ],
        )?;
        Ok(())
    }

    fn write(&self, feed: &Feed, series: &Series) -> Result<()> {
        for sample in series {
            self.update(feed, &TimeValue::from(sample.time), sample.value)?;
        }
        Ok(())
    }

    fn post(&self, input: &Input, time: &TimeValue, value: f64) -> Result<()> {
        let timestamp = normalize(time, &self.timezone, Resolution::Seconds)?;
        let mut fulljson = Map::new();
        fulljson.insert(input.name.clone(), json!(value));
        let fulljson = JsonValue::Object(fulljson);
        self.request(
            Verb::Get,
            &format!("input/post/{}", input.node),
            vec![("time", timestamp.to_string()), ("fulljson", fulljson.to_string())],
        )?;
        Ok(())
    }

    fn post_bulk(&self, batch: &BulkBatch, reference: &TimeValue) -> Result<()> {
        if batch.is_empty() {
            tracing::debug!("skipping empty bulk post");
            return Ok(());
        }
        let timestamp = normalize(reference, &self.timezone, Resolution::Seconds)?;
        let data = JsonValue::Array(batch.parse(timestamp)?);
        self.request(
            Verb::Post,
            "input/bulk",
            vec![("data", data.to_string()), ("time", timestamp.to_string())],
        )?;
        tracing::debug!(records = batch.len(), "posted bulk input data");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone)]
    struct Call {
        post: bool,
        url: String,
        params: Vec<(String, String)>,
    }

    impl Call {
        fn param(&self, key: &str) -> Option<&str> {
            self.params
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        }
    }

    #[derive(Clone, Default)]
    struct FakeTransport {
        calls: Arc<Mutex<Vec<Call>>>,
        responses: Arc<Mutex<Vec<HttpResponse>>>,
    }

    impl FakeTransport {
        fn respond(&self, status: u16, body: &str) {
            self.responses.lock().unwrap().push(HttpResponse {
                status,
                body: body.to_string(),
            });
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, post: bool, url: &Url, params: &Params) -> Result<HttpResponse> {
            self.calls.lock().unwrap().push(Call {
                post,
                url: url.to_string(),
                params: params
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
            });
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(EmoncmsError::Connection("no scripted response".to_string()));
            }
            Ok(responses.remove(0))
        }
    }

    impl HttpTransport for FakeTransport {
        fn get(&self, url: &Url, params: &Params) -> Result<HttpResponse> {
            self.record(false, url, params)
        }

        fn post(&self, url: &Url, params: &Params) -> Result<HttpResponse> {
            self.record(true, url, params)
        }
    }

    fn connection(tz: Tz) -> (HttpEmoncms, FakeTransport) {
        let transport = FakeTransport::default();
        let config = HttpConfig::new("http://emon.local/emoncms", "secret").timezone(tz);
        let emoncms =
            HttpEmoncms::with_transport(config, Box::new(transport.clone())).expect("connect");
        (emoncms, transport)
    }

    #[test]
    fn every_request_carries_the_apikey() {
        let (emoncms, transport) = connection(chrono_tz::UTC);
        transport.respond(200, r#"{"success":true}"#);
        let feed = Feed::from_id(5).unwrap();
        emoncms
            .update(&feed, &TimeValue::from(1_700_000_000i64), 12.5)
            .expect("update");

        let call = &transport.calls()[0];
        assert_eq!(call.url, "http://emon.local/emoncms/feed/update.json");
        assert_eq!(call.param("apikey"), Some("secret"));
        assert_eq!(call.param("id"), Some("5"));
        assert_eq!(call.param("time"), Some("1700000000"));
        assert_eq!(call.param("value"), Some("12.5"));
    }

    #[test]
    fn failure_shapes_become_response_errors() {
        let (emoncms, transport) = connection(chrono_tz::UTC);
        let feed = Feed::from_id(5).unwrap();
        let time = TimeValue::from(1_700_000_000i64);

        transport.respond(200, "false");
        transport.respond(200, r#"{"success":false,"message":"Feed does not exist"}"#);
        transport.respond(500, "boom");

        for _ in 0..3 {
            let err = emoncms.update(&feed, &time, 1.0).unwrap_err();
            assert!(matches!(err, EmoncmsError::Response(_)), "{err}");
        }
        transport.respond(200, "not json");
        assert!(matches!(
            emoncms.list_feeds(),
            Err(EmoncmsError::Response(_))
        ));
    }

    #[test]
    fn data_drops_neighbours_outside_the_requested_range() {
        let (emoncms, transport) = connection(chrono_tz::Europe::Berlin);
        transport.respond(
            200,
            "[[1699999940000,1.0],[1700000000000,2.0],[1700000060000,null],[1700000120000,4.0],[1700000180000,5.0]]",
        );
        let feed = Feed::from_id(3).unwrap();
        let query = DataQuery::range(1_700_000_000i64, 1_700_000_120i64)
            .interval(std::time::Duration::from_secs(60))
            .timezone(chrono_tz::America::New_York);
        let series = emoncms.data(&feed, &query).expect("data");

        let values: Vec<f64> = series.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![2.0, 4.0]);
        assert_eq!(series.samples()[0].time.timestamp(), 1_700_000_000);
        assert_eq!(
            series.samples()[0].time.timezone(),
            chrono_tz::America::New_York
        );

        let call = &transport.calls()[0];
        assert_eq!(call.param("start"), Some("1700000000000"));
        assert_eq!(call.param("end"), Some("1700000120000"));
        assert_eq!(call.param("interval"), Some("60"));
    }

    #[test]
    fn data_without_bounds_is_rejected_before_any_request() {
        let (emoncms, transport) = connection(chrono_tz::UTC);
        let feed = Feed::from_id(3).unwrap();
        let err = emoncms
            .data(&feed, &DataQuery::since(1_700_000_000i64))
            .unwrap_err();
        assert!(matches!(err, EmoncmsError::InvalidTime(_)));
        assert!(transport.calls().is_empty());
    }

    #[test]
    fn empty_data_response_is_an_empty_series() {
        let (emoncms, transport) = connection(chrono_tz::UTC);
        transport.respond(200, "[]");
        let feed = Feed::from_id(3).unwrap();
        let series = emoncms
            .data(&feed, &DataQuery::range(1_700_000_000i64, 1_700_000_120i64))
            .expect("data");
        assert!(series.is_empty());
    }

    #[test]
    fn list_feeds_parses_descriptors() {
        let (emoncms, transport) = connection(chrono_tz::Europe::Berlin);
        transport.respond(
            200,
            r#"[{"id":"1","userid":"1","name":"power","tag":"house","datatype":"1","engine":"5","time":"1700000000","value":"230.5"},
                {"id":"2","userid":"1","name":"energy","tag":"house","datatype":"1","engine":"5","time":null,"value":null}]"#,
        );
        let feeds = emoncms.list_feeds().expect("list");
        assert_eq!(feeds.len(), 2);
        assert_eq!(feeds[0].latest().expect("latest").value, 230.5);
        assert!(feeds[1].latest().is_none());
    }

    #[test]
    fn create_feed_reads_feedid() {
        let (emoncms, transport) = connection(chrono_tz::UTC);
        transport.respond(200, r#"{"success":true,"feedid":"\"12\""}"#);
        let feed = emoncms
            .create_feed(&NewFeed::new("heat", 1, 5).tag("boiler").options(json!({"interval": 10})))
            .expect("create");
        assert_eq!(feed.id(), 12);

        let call = &transport.calls()[0];
        assert_eq!(call.param("name"), Some("heat"));
        assert_eq!(call.param("tag"), Some("boiler"));
        assert_eq!(call.param("options"), Some(r#"{"interval":10}"#));
    }

    #[test]
    fn input_post_uses_node_path_and_fulljson() {
        let (emoncms, transport) = connection(chrono_tz::UTC);
        transport.respond(200, "ok");
        let input = Input::new("emontx", "power1");
        emoncms
            .post(&input, &TimeValue::from(1_700_000_000i64), 100.0)
            .expect("post");

        let call = &transport.calls()[0];
        assert_eq!(call.url, "http://emon.local/emoncms/input/post/emontx");
        assert_eq!(call.param("fulljson"), Some(r#"{"power1":100.0}"#));
    }

    #[test]
    fn bulk_post_sends_relative_times() {
        let (emoncms, transport) = connection(chrono_tz::UTC);
        transport.respond(200, "ok");
        let mut batch = BulkBatch::new(chrono_tz::UTC);
        batch.add(1_699_999_940i64, "10", "a", 1.0).unwrap();
        batch.add(1_700_000_000i64, "10", "a", 2.0).unwrap();
        emoncms
            .post_bulk(&batch, &TimeValue::from(1_700_000_000i64))
            .expect("bulk");

        let call = &transport.calls()[0];
        assert!(call.post);
        assert_eq!(call.param("time"), Some("1700000000"));
        assert_eq!(
            call.param("data"),
            Some(r#"[[-60,"10",{"a":1.0}],[0,"10",{"a":2.0}]]"#)
        );
    }

    #[test]
    fn bulk_reference_is_read_in_connection_timezone() {
        let (emoncms, transport) = connection(chrono_tz::Europe::Berlin);
        transport.respond(200, "ok");
        let mut batch = BulkBatch::new(chrono_tz::UTC);
        batch.add(1_700_000_000i64, "10", "a", 1.0).unwrap();
        // 2023-11-14 22:13:20 UTC in Berlin wall time.
        emoncms
            .post_bulk(&batch, &TimeValue::from("2023-11-14 23:13:20"))
            .expect("bulk");

        let call = &transport.calls()[0];
        assert_eq!(call.param("time"), Some("1700000000"));
        assert_eq!(call.param("data"), Some(r#"[[0,"10",{"a":1.0}]]"#));
    }

    #[test]
    fn empty_bulk_post_sends_nothing() {
        let (emoncms, transport) = connection(chrono_tz::UTC);
        let batch = BulkBatch::new(chrono_tz::UTC);
        emoncms
            .post_bulk(&batch, &TimeValue::from(1_700_000_000i64))
            .expect("bulk");
        assert!(transport.calls().is_empty());
    }

    #[test]
    fn fetch_returns_latest_values() {
        let (emoncms, transport) = connection(chrono_tz::UTC);
        transport.respond(200, r#"[12.5,"7",null]"#);
        let feeds: Vec<Feed> = [1, 2, 3].into_iter().map(|id| Feed::from_id(id).unwrap()).collect();
        let values = emoncms.fetch(&feeds).expect("fetch");
        assert_eq!(values, vec![Some(12.5), Some(7.0), None]);
        assert_eq!(transport.calls()[0].param("ids"), Some("1,2,3"));
    }

    #[test]
    fn transport_failures_propagate_without_retry() {
        let (emoncms, transport) = connection(chrono_tz::UTC);
        let feed = Feed::from_id(1).unwrap();
        let err = emoncms
            .update(&feed, &TimeValue::from(1_700_000_000i64), 1.0)
            .unwrap_err();
        assert!(matches!(err, EmoncmsError::Connection(_)));
        assert_eq!(transport.calls().len(), 1);
    }
}
