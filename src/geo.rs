//! Best-effort IP geolocation, looked up once at flush time.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::AgentConfig;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoFragment {
    pub ip: Option<String>,
    pub country: Option<String>,
    pub city: Option<String>,
    pub country_code: Option<String>,
}

#[async_trait]
pub trait GeoLookup: Send + Sync {
    async fn lookup(&self) -> Result<GeoFragment>;
}

/// ip-api.com style JSON response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpApiResponse {
    status: Option<String>,
    message: Option<String>,
    query: Option<String>,
    country: Option<String>,
    country_code: Option<String>,
    city: Option<String>,
}

pub fn parse_ip_api(body: &str) -> Result<GeoFragment> {
    let response: IpApiResponse =
        serde_json::from_str(body).context("malformed geolocation response")?;

    if let Some(status) = response.status.as_deref() {
        if status != "success" {
            bail!(
                "geolocation lookup failed: {}",
                response.message.as_deref().unwrap_or(status)
            );
        }
    }

    Ok(GeoFragment {
        ip: non_empty(response.query),
        country: non_empty(response.country),
        city: non_empty(response.city),
        country_code: non_empty(response.country_code),
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

pub struct IpApiLookup {
    client: reqwest::Client,
    endpoint: String,
    timeout: Option<Duration>,
}

impl IpApiLookup {
    pub fn new(endpoint: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            timeout,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.geo_endpoint.clone(), Some(config.geo_timeout))
    }
}

#[async_trait]
impl GeoLookup for IpApiLookup {
    async fn lookup(&self) -> Result<GeoFragment> {
        let mut request = self.client.get(&self.endpoint);
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("geolocation request to {} failed", self.endpoint))?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "geolocation service returned {}",
                response.status()
            ));
        }
        let body = response
            .text()
            .await
            .context("failed to read geolocation response")?;
        parse_ip_api(&body)
    }
}
