use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Collector the agent posts to. Edit per deployment.
pub const DEFAULT_COLLECTOR_ENDPOINT: &str = "https://collector.pagepulse.dev/track";
pub const DEFAULT_GEO_ENDPOINT: &str = "http://ip-api.com/json";
pub const DEFAULT_VISITOR_KEY: &str = "pagepulse_user_id";
pub const DEFAULT_SESSION_KEY: &str = "pagepulse_session_id";
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);
/// Longest the flush waits on geolocation before sending without it.
pub const DEFAULT_GEO_TIMEOUT: Duration = Duration::from_secs(3);

pub const DEFAULT_COLLECTOR_PORT: u16 = 5000;
pub const DEFAULT_DB_PATH: &str = "pagepulse.sqlite3";

/// Upper bound the collector accepts for `time_spent_seconds` (one day).
pub const MAX_TIME_SPENT_SECS: i64 = 86_400;

fn debug_from_env() -> bool {
    std::env::var("PAGEPULSE_DEBUG")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub collector_endpoint: String,
    pub geo_endpoint: String,
    pub visitor_key: String,
    pub session_key: String,
    #[serde(with = "duration_ms")]
    pub tick_interval: Duration,
    /// Bounds the geolocation lookup at flush time. A lookup still pending
    /// at the deadline counts as failed.
    #[serde(with = "duration_ms")]
    pub geo_timeout: Duration,
    /// Log every sampler tick.
    pub debug: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            collector_endpoint: DEFAULT_COLLECTOR_ENDPOINT.into(),
            geo_endpoint: DEFAULT_GEO_ENDPOINT.into(),
            visitor_key: DEFAULT_VISITOR_KEY.into(),
            session_key: DEFAULT_SESSION_KEY.into(),
            tick_interval: DEFAULT_TICK_INTERVAL,
            geo_timeout: DEFAULT_GEO_TIMEOUT,
            debug: debug_from_env(),
        }
    }
}

impl AgentConfig {
    pub fn with_collector_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.collector_endpoint = endpoint.into();
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_geo_timeout(mut self, timeout: Duration) -> Self {
        self.geo_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub bind_addr: SocketAddr,
    pub db_path: PathBuf,
}

impl CollectorConfig {
    /// Reads `PORT`, `PAGEPULSE_BIND` and `PAGEPULSE_DB`.
    pub fn from_env() -> Result<Self> {
        let port = match std::env::var("PORT") {
            Ok(raw) => raw
                .parse::<u16>()
                .with_context(|| format!("invalid PORT '{raw}'"))?,
            Err(_) => DEFAULT_COLLECTOR_PORT,
        };
        let host = std::env::var("PAGEPULSE_BIND").unwrap_or_else(|_| "0.0.0.0".into());
        let bind_addr = format!("{host}:{port}")
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid bind address {host}:{port}"))?;
        let db_path = std::env::var("PAGEPULSE_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_DB_PATH));

        Ok(Self { bind_addr, db_path })
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
