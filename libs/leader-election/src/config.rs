//! `leader` configuration section.
//!
//! ```yaml
//! leader:
//!   backend: default
//!   session_ttl: 10s
//!   renew_interval: 3s
//!   retry_interval: 1s
//!   dispatch_timeout: 5s
//!   release_timeout: 5s
//!   recampaign: true
//! ```
//!
//! Durations accept a bare number of seconds or a string with a `ms`, `s`,
//! `m` or `h` unit.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, de};
use tracing::debug;

use crate::error::{ElectionError, ElectionResult};

pub const DEFAULT_BACKEND: &str = "default";
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(10);
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Leader election settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ElectionConfig {
    /// Name of the coordination connection used when no driver is injected.
    #[serde(default = "default_backend")]
    pub backend: String,
    /// How long the backend keeps a claim without renewal.
    #[serde(
        default = "default_session_ttl",
        deserialize_with = "deserialize_duration"
    )]
    pub session_ttl: Duration,
    /// How often the claim is renewed. Defaults to a third of `session_ttl`.
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub renew_interval: Option<Duration>,
    /// Delay between acquisition attempts while the claim is held elsewhere.
    #[serde(
        default = "default_retry_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub retry_interval: Duration,
    /// Upper bound for handing one event to the dispatcher.
    #[serde(
        default = "default_dispatch_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub dispatch_timeout: Duration,
    /// Upper bound for the best-effort release on shutdown.
    #[serde(
        default = "default_release_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub release_timeout: Duration,
    /// Campaign again after leadership is lost while the host keeps running.
    #[serde(default = "default_recampaign")]
    pub recampaign: bool,
}

fn default_backend() -> String {
    DEFAULT_BACKEND.to_owned()
}

pub const fn default_session_ttl() -> Duration {
    DEFAULT_SESSION_TTL
}

pub const fn default_retry_interval() -> Duration {
    DEFAULT_RETRY_INTERVAL
}

pub const fn default_dispatch_timeout() -> Duration {
    DEFAULT_DISPATCH_TIMEOUT
}

pub const fn default_release_timeout() -> Duration {
    DEFAULT_RELEASE_TIMEOUT
}

pub const fn default_recampaign() -> bool {
    true
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            session_ttl: DEFAULT_SESSION_TTL,
            renew_interval: None,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
            release_timeout: DEFAULT_RELEASE_TIMEOUT,
            recampaign: default_recampaign(),
        }
    }
}

#[derive(Deserialize)]
struct Document {
    #[serde(default)]
    leader: ElectionConfig,
}

impl ElectionConfig {
    /// Decode the `leader` section of a document, first as JSON then as YAML.
    /// A document without a `leader` section yields the defaults.
    pub fn parse_str<S: AsRef<str>>(s: S) -> ElectionResult<Self> {
        let s = s.as_ref();
        let doc: Document = match serde_json::from_str(s) {
            Ok(doc) => doc,
            Err(json_err) => serde_yaml::from_str(s).map_err(|yaml_err| {
                ElectionError::Config(format!(
                    "leader election configuration error: {yaml_err} (as json: {json_err})"
                ))
            })?,
        };
        let config = doc.leader;
        config.validate()?;
        debug!(?config, "parsed leader election config");
        Ok(config)
    }

    /// Effective renewal interval.
    pub fn renew_interval(&self) -> Duration {
        self.renew_interval.unwrap_or(self.session_ttl / 3)
    }

    /// Reject settings under which a claim could never be kept alive.
    pub fn validate(&self) -> ElectionResult<()> {
        if self.backend.trim().is_empty() {
            return Err(ElectionError::Config("leader.backend is empty".into()));
        }
        if self.session_ttl.is_zero() {
            return Err(ElectionError::Config(
                "leader.session_ttl must be greater than zero".into(),
            ));
        }
        let renew = self.renew_interval();
        if renew.is_zero() || renew >= self.session_ttl {
            return Err(ElectionError::Config(format!(
                "leader.renew_interval ({renew:?}) must be non-zero and shorter than leader.session_ttl ({:?})",
                self.session_ttl
            )));
        }
        if self.retry_interval.is_zero() {
            return Err(ElectionError::Config(
                "leader.retry_interval must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Parse a duration string with an optional unit.
/// Accepts: "10", "10s", "250ms", "5m", "1h". No unit means seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".into());
    }

    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num, unit) = s.split_at(end);
    let num = num
        .parse::<u64>()
        .map_err(|e| format!("invalid number in duration '{s}': {e}"))?;

    match unit.trim() {
        "ms" => Ok(Duration::from_millis(num)),
        "" | "s" => Ok(Duration::from_secs(num)),
        "m" => num
            .checked_mul(60)
            .map(Duration::from_secs)
            .ok_or_else(|| "duration value overflow".into()),
        "h" => num
            .checked_mul(3600)
            .map(Duration::from_secs)
            .ok_or_else(|| "duration value overflow".into()),
        other => Err(format!(
            "unknown time unit '{other}', only 'h', 'm', 's' or 'ms' are supported"
        )),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    String(String),
}

impl RawDuration {
    fn into_duration<E: de::Error>(self) -> Result<Duration, E> {
        match self {
            RawDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
            RawDuration::String(s) => parse_duration(&s).map_err(E::custom),
        }
    }
}

/// Deserialize a [`Duration`] written as whole seconds or a [`parse_duration`] string.
pub fn deserialize_duration<'de, D>(de: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    RawDuration::deserialize(de)?.into_duration()
}

pub fn deserialize_optional_duration<'de, D>(de: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<RawDuration>::deserialize(de)?
        .map(RawDuration::into_duration)
        .transpose()
}
