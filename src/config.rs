use crate::error::{EmoncmsError, Result};
use crate::time::parse_timezone;
use chrono_tz::Tz;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_ADDRESS: &str = "http://localhost/emoncms/";
const DEFAULT_MYSQL_HOST: &str = "127.0.0.1";
const DEFAULT_MYSQL_PORT: u16 = 3306;
const DEFAULT_MYSQL_USER: &str = "emoncms";
const DEFAULT_DATABASE_ROOT: &str = "emoncms";
const DEFAULT_DATABASE_DATA: &str = "emondata";
const DEFAULT_META_DIR: &str = "/var/opt/emoncms/mysql";
const DEFAULT_DATA_DIR: &str = "/var/opt/emoncms";
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Http,
    Mysql,
    PhpFile,
}

impl FromStr for Method {
    type Err = EmoncmsError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "http" | "https" => Ok(Method::Http),
            "mysql" => Ok(Method::Mysql),
            "php-file" | "phpfile" | "php" | "phptimeseries" => Ok(Method::PhpFile),
            other => Err(EmoncmsError::Config(format!(
                "invalid emoncms connection method \"{other}\""
            ))),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Method::Http => "http",
            Method::Mysql => "mysql",
            Method::PhpFile => "php-file",
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(alias = "api_key")]
    pub apikey: String,
    #[serde(default = "default_timezone")]
    pub timezone: Tz,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

impl HttpConfig {
    pub fn new(address: impl Into<String>, apikey: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            apikey: apikey.into(),
            timezone: default_timezone(),
            timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
        }
    }

    pub fn timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MysqlConfig {
    #[serde(default = "default_mysql_host")]
    pub host: String,
    #[serde(default = "default_mysql_port")]
    pub port: u16,
    #[serde(default = "default_mysql_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_database_root")]
    pub database_root: String,
    #[serde(default = "default_database_data")]
    pub database_data: String,
    /// Directory holding the `{id}.meta` files.
    #[serde(default = "default_meta_dir", alias = "data_dir")]
    pub meta_dir: PathBuf,
    #[serde(default = "default_timezone")]
    pub timezone: Tz,
    /// Owner recorded for feeds created through this connection.
    #[serde(default = "default_user_id")]
    pub user_id: i64,
}

impl Default for MysqlConfig {
    fn default() -> Self {
        Self {
            host: default_mysql_host(),
            port: DEFAULT_MYSQL_PORT,
            user: default_mysql_user(),
            password: String::new(),
            database_root: default_database_root(),
            database_data: default_database_data(),
            meta_dir: default_meta_dir(),
            timezone: default_timezone(),
            user_id: default_user_id(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhpConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_timezone")]
    pub timezone: Tz,
}

impl PhpConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            timezone: default_timezone(),
        }
    }
}

impl Default for PhpConfig {
    fn default() -> Self {
        Self::new(default_data_dir())
    }
}

#[derive(Debug, Clone)]
pub enum ConnectionConfig {
    Http(HttpConfig),
    Mysql(MysqlConfig),
    PhpFile(PhpConfig),
}

impl ConnectionConfig {
    pub fn method(&self) -> Method {
        match self {
            ConnectionConfig::Http(_) => Method::Http,
            ConnectionConfig::Mysql(_) => Method::Mysql,
            ConnectionConfig::PhpFile(_) => Method::PhpFile,
        }
    }

    pub fn from_selector(selector: &str, params: JsonValue) -> Result<Self> {
        let params = match params {
            JsonValue::Null => JsonValue::Object(Default::default()),
            other => other,
        };
        let invalid =
            |err: serde_json::Error| EmoncmsError::Config(format!("invalid {selector} parameters: {err}"));
        Ok(match selector.parse::<Method>()? {
            Method::Http => ConnectionConfig::Http(serde_json::from_value(params).map_err(invalid)?),
            Method::Mysql => {
                ConnectionConfig::Mysql(serde_json::from_value(params).map_err(invalid)?)
            }
            Method::PhpFile => {
                ConnectionConfig::PhpFile(serde_json::from_value(params).map_err(invalid)?)
            }
        })
    }

    /// Load a JSON file of the form `{"method": "mysql", "host": ..., ...}`.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|err| {
            EmoncmsError::Config(format!("failed to read {}: {err}", path.display()))
        })?;
        let mut value: JsonValue = serde_json::from_str(&contents).map_err(|err| {
            EmoncmsError::Config(format!("failed to parse {}: {err}", path.display()))
        })?;
        let method = value
            .as_object_mut()
            .and_then(|map| map.remove("method"))
            .and_then(|method| method.as_str().map(str::to_string))
            .unwrap_or_else(|| Method::Http.to_string());
        Self::from_selector(&method, value)
    }

    /// Read `EMONCMS_*` variables, after loading a `.env` file if present.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };
        let method = env
            .optional("EMONCMS_METHOD")
            .unwrap_or_else(|| Method::Http.to_string());
        let timezone = match env.optional("EMONCMS_TIMEZONE") {
            Some(name) => parse_timezone(&name)?,
            None => default_timezone(),
        };

        Ok(match method.parse::<Method>()? {
            Method::Http => ConnectionConfig::Http(HttpConfig {
                address: env.string("EMONCMS_ADDRESS", Some(default_address()))?,
                apikey: env.string("EMONCMS_APIKEY", None)?,
                timezone,
                timeout_secs: env.u64("EMONCMS_HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS)?,
            }),
            Method::Mysql => ConnectionConfig::Mysql(MysqlConfig {
                host: env.string("EMONCMS_MYSQL_HOST", Some(default_mysql_host()))?,
                port: u16::try_from(env.u64("EMONCMS_MYSQL_PORT", u64::from(DEFAULT_MYSQL_PORT))?)
                    .map_err(|_| EmoncmsError::Config("invalid EMONCMS_MYSQL_PORT".to_string()))?,
                user: env.string("EMONCMS_MYSQL_USER", Some(default_mysql_user()))?,
                password: env.optional("EMONCMS_MYSQL_PASSWORD").unwrap_or_default(),
                database_root: env
                    .string("EMONCMS_DATABASE_ROOT", Some(default_database_root()))?,
                database_data: env
                    .string("EMONCMS_DATABASE_DATA", Some(default_database_data()))?,
                meta_dir: PathBuf::from(
                    env.string("EMONCMS_META_DIR", Some(DEFAULT_META_DIR.to_string()))?,
                ),
                timezone,
                user_id: i64::try_from(env.u64("EMONCMS_USER_ID", 1)?)
                    .map_err(|_| EmoncmsError::Config("invalid EMONCMS_USER_ID".to_string()))?,
            }),
            Method::PhpFile => ConnectionConfig::PhpFile(PhpConfig {
                data_dir: PathBuf::from(
                    env.string("EMONCMS_DATA_DIR", Some(DEFAULT_DATA_DIR.to_string()))?,
                ),
                timezone,
            }),
        })
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn string(&self, key: &str, default: Option<String>) -> Result<String> {
        match self.optional(key) {
            Some(value) => Ok(value),
            None => default.ok_or_else(|| EmoncmsError::Config(format!("missing env var {key}"))),
        }
    }

    fn u64(&self, key: &str, default: u64) -> Result<u64> {
        match self.optional(key) {
            Some(value) => value
                .parse::<u64>()
                .map_err(|_| EmoncmsError::Config(format!("invalid {key}: \"{value}\""))),
            None => Ok(default),
        }
    }
}

fn default_address() -> String {
    DEFAULT_ADDRESS.to_string()
}

fn default_timezone() -> Tz {
    chrono_tz::UTC
}

fn default_http_timeout_secs() -> u64 {
    DEFAULT_HTTP_TIMEOUT_SECS
}

fn default_mysql_host() -> String {
    DEFAULT_MYSQL_HOST.to_string()
}

fn default_mysql_port() -> u16 {
    DEFAULT_MYSQL_PORT
}

fn default_mysql_user() -> String {
    DEFAULT_MYSQL_USER.to_string()
}

fn default_database_root() -> String {
    DEFAULT_DATABASE_ROOT.to_string()
}

fn default_database_data() -> String {
    DEFAULT_DATABASE_DATA.to_string()
}

fn default_meta_dir() -> PathBuf {
    PathBuf::from(DEFAULT_META_DIR)
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(DEFAULT_DATA_DIR)
}

fn default_user_id() -> i64 {
    1
}
