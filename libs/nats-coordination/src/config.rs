//! `nats` configuration section.
//!
//! ```yaml
//! nats:
//!   servers: ["nats://127.0.0.1:4222"]
//!   bucket: leader_election
//!   security_mode: user_password
//!   username: leaderd
//!   password: secret
//!   connect_timeout: 5s
//!   connect_retry_max: 3
//!   request_timeout: 2s
//!   monitor_interval: 5s
//! ```

use std::{path::PathBuf, time::Duration};

use leader_election::config::{deserialize_duration, deserialize_optional_duration};
use serde::{Deserialize, Serialize};

use crate::error::{CoordinationError, CoordinationResult};

pub const DEFAULT_SERVER: &str = "nats://127.0.0.1:4222";
pub const DEFAULT_BUCKET: &str = "leader_election";
pub const DEFAULT_CONNECT_RETRY_MAX: u32 = 3;
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(5);

/// Authentication applied when connecting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NatsSecurityMode {
    #[default]
    None,
    UserPassword,
    Token,
    Nkey,
    Tls,
    CredsFile,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NatsConfig {
    #[serde(default = "default_servers")]
    pub servers: Vec<String>,
    /// JetStream KV bucket holding the claim keys.
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default)]
    pub security_mode: NatsSecurityMode,
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub nkey_seed_path: Option<PathBuf>,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    pub tls_ca_path: Option<PathBuf>,
    pub creds_file_path: Option<PathBuf>,
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub connect_timeout: Option<Duration>,
    #[serde(default = "default_connect_retry_max")]
    pub connect_retry_max: u32,
    /// Upper bound on a single KV operation.
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub request_timeout: Option<Duration>,
    /// How often the host checks the connection while an election runs.
    #[serde(
        default = "default_monitor_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub monitor_interval: Duration,
}

fn default_servers() -> Vec<String> {
    vec![DEFAULT_SERVER.to_owned()]
}

fn default_bucket() -> String {
    DEFAULT_BUCKET.to_owned()
}

pub const fn default_connect_retry_max() -> u32 {
    DEFAULT_CONNECT_RETRY_MAX
}

pub const fn default_monitor_interval() -> Duration {
    DEFAULT_MONITOR_INTERVAL
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            servers: default_servers(),
            bucket: default_bucket(),
            security_mode: NatsSecurityMode::None,
            username: None,
            password: None,
            token: None,
            nkey_seed_path: None,
            tls_cert_path: None,
            tls_key_path: None,
            tls_ca_path: None,
            creds_file_path: None,
            connect_timeout: None,
            connect_retry_max: DEFAULT_CONNECT_RETRY_MAX,
            request_timeout: None,
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
        }
    }
}

/// Credentials of the selected [`NatsSecurityMode`], checked to be present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    None,
    UserPassword { username: String, password: String },
    Token(String),
    /// Path of the file holding the nkey seed.
    Nkey(PathBuf),
    ClientCert { cert: PathBuf, key: PathBuf },
    CredsFile(PathBuf),
}

fn required<T: Clone>(value: &Option<T>, mode: &str, field: &str) -> CoordinationResult<T> {
    value.clone().ok_or_else(|| {
        CoordinationError::Config(format!("{mode} security mode requires '{field}'"))
    })
}

#[derive(Deserialize)]
struct Document {
    #[serde(default)]
    nats: NatsConfig,
}

impl NatsConfig {
    /// Decode the `nats` section of a document, first as JSON then as YAML.
    pub fn parse_str<S: AsRef<str>>(s: S) -> CoordinationResult<Self> {
        let s = s.as_ref();
        let doc: Document = match serde_json::from_str(s) {
            Ok(doc) => doc,
            Err(json_err) => serde_yaml::from_str(s).map_err(|yaml_err| {
                CoordinationError::Config(format!(
                    "nats configuration error: {yaml_err} (as json: {json_err})"
                ))
            })?,
        };
        doc.nats.validate()?;
        Ok(doc.nats)
    }

    /// Resolve the credentials for `security_mode`.
    pub fn auth(&self) -> CoordinationResult<Auth> {
        Ok(match self.security_mode {
            NatsSecurityMode::None => Auth::None,
            NatsSecurityMode::UserPassword => Auth::UserPassword {
                username: required(&self.username, "user_password", "username")?,
                password: required(&self.password, "user_password", "password")?,
            },
            NatsSecurityMode::Token => Auth::Token(required(&self.token, "token", "token")?),
            NatsSecurityMode::Nkey => {
                Auth::Nkey(required(&self.nkey_seed_path, "nkey", "nkey_seed_path")?)
            }
            NatsSecurityMode::Tls => Auth::ClientCert {
                cert: required(&self.tls_cert_path, "tls", "tls_cert_path")?,
                key: required(&self.tls_key_path, "tls", "tls_key_path")?,
            },
            NatsSecurityMode::CredsFile => {
                Auth::CredsFile(required(&self.creds_file_path, "creds_file", "creds_file_path")?)
            }
        })
    }

    /// Reject a config that could never connect: no server, no bucket, or
    /// missing credentials for the selected security mode.
    pub fn validate(&self) -> CoordinationResult<()> {
        if self.servers.iter().all(|s| s.trim().is_empty()) {
            return Err(CoordinationError::Config(
                "nats.servers must name at least one server".into(),
            ));
        }
        if self.bucket.trim().is_empty() {
            return Err(CoordinationError::Config("nats.bucket is empty".into()));
        }
        if self.monitor_interval.is_zero() {
            return Err(CoordinationError::Config(
                "nats.monitor_interval must be greater than zero".into(),
            ));
        }
        self.auth().map(|_| ())
    }
}
