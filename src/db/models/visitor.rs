use std::str::FromStr;

use anyhow::bail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One row per browsing session, keyed by `session_id`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VisitorRecord {
    pub session_id: String,
    pub user_id: Option<String>,
    pub public_ip: Option<String>,
    pub country: Option<String>,
    pub country_code: Option<String>,
    pub city: Option<String>,
    pub page_visited: Option<String>,
    pub previous_page: Option<String>,
    pub user_agent: Option<String>,
    pub device_type: Option<String>,
    pub browser: Option<String>,
    pub operating_system: Option<String>,
    pub os_version: Option<String>,
    pub first_seen: Option<DateTime<Utc>>,
    pub time_spent_seconds: Option<i64>,
}

/// A visitor is returning once their `user_id` has more than one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisitorType {
    New,
    Returning,
}

impl FromStr for VisitorType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> anyhow::Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "new" => Ok(VisitorType::New),
            "returning" | "repeat" | "repeated" => Ok(VisitorType::Returning),
            other => bail!("unknown visitor type '{other}'"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalyticsFilter {
    pub country: Option<String>,
    pub device_type: Option<String>,
    pub browser: Option<String>,
    /// Substring of `page_visited`.
    pub url: Option<String>,
    pub public_ip: Option<String>,
    pub visitor_type: Option<VisitorType>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VisitorStats {
    pub total_visitors: i64,
    pub unique_visitors: i64,
    pub repeated_visitors: i64,
    pub avg_time_spent_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakdownEntry {
    pub label: String,
    pub visitors: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalyticsReport {
    pub stats: VisitorStats,
    pub countries: Vec<BreakdownEntry>,
    pub devices: Vec<BreakdownEntry>,
    pub browsers: Vec<BreakdownEntry>,
}
