use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{geo::GeoFragment, identity::Identities};

/// What the host knows about the page at load time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageContext {
    pub url: String,
    pub referrer: Option<String>,
    pub user_agent: String,
}

impl PageContext {
    pub fn new(url: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            referrer: None,
            user_agent: user_agent.into(),
        }
    }

    /// An empty referrer (direct navigation) is the same as none.
    pub fn with_referrer(mut self, referrer: impl Into<String>) -> Self {
        let referrer = referrer.into();
        self.referrer = (!referrer.is_empty()).then_some(referrer);
        self
    }
}

/// The exit beacon body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub user_id: String,
    pub session_id: String,
    pub page_visited: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_page: Option<String>,
    pub time_spent_seconds: u64,
    pub user_agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Payload {
    pub fn assemble(
        identities: &Identities,
        page: &PageContext,
        time_spent_seconds: u64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: identities.user_id.clone(),
            session_id: identities.session_id.clone(),
            page_visited: page.url.clone(),
            previous_page: page.referrer.clone(),
            time_spent_seconds,
            user_agent: page.user_agent.clone(),
            ip: None,
            country: None,
            city: None,
            country_code: None,
            timestamp,
        }
    }

    pub fn with_geo(mut self, geo: GeoFragment) -> Self {
        self.ip = geo.ip;
        self.country = geo.country;
        self.city = geo.city;
        self.country_code = geo.country_code;
        self
    }

    pub fn to_json_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}
