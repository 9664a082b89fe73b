use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use log::{error, info};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    config::MAX_TIME_SPENT_SECS,
    db::{helpers::parse_date_bound, AnalyticsFilter, AnalyticsReport, VisitorRecord},
};

use super::{country::code_for_name, useragent, CollectorState};

pub enum ApiError {
    BadRequest(String),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
            }
            ApiError::Internal(err) => {
                error!("collector request failed: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": err.to_string() })),
                )
                    .into_response()
            }
        }
    }
}

/// Exit beacon as posted by the agent. Every field is optional on the wire
/// so a partial beacon still lands.
#[derive(Debug, Default, Deserialize)]
pub struct TrackRequest {
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub page_visited: Option<String>,
    pub previous_page: Option<String>,
    pub user_agent: Option<String>,
    pub ip: Option<String>,
    pub country: Option<String>,
    pub city: Option<String>,
    pub country_code: Option<String>,
    pub time_spent_seconds: Option<Value>,
    pub timestamp: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogTimeRequest {
    pub session_id: Option<String>,
    pub time_spent_seconds: Option<Value>,
}

/// Dashboard filters. The `*_filter` spellings are what the bundled
/// dashboard sends.
#[derive(Debug, Default, Deserialize)]
pub struct AnalyticsQuery {
    #[serde(alias = "country_filter")]
    pub country: Option<String>,
    #[serde(alias = "device_filter")]
    pub device: Option<String>,
    #[serde(alias = "browser_filter")]
    pub browser: Option<String>,
    #[serde(alias = "url_filter")]
    pub url: Option<String>,
    #[serde(alias = "ip_filter")]
    pub ip: Option<String>,
    #[serde(alias = "visitor_type_filter")]
    pub visitor_type: Option<String>,
    #[serde(alias = "start_date_filter")]
    pub start_date: Option<String>,
    #[serde(alias = "end_date_filter")]
    pub end_date: Option<String>,
}

/// Empty strings and the literal "unknown" carry no information.
pub fn normalize(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("unknown"))
}

/// Whole seconds clamped to a day. Accepts numbers and numeric strings.
pub fn clamp_time_spent(value: &Value) -> Option<i64> {
    let seconds = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?,
        Value::String(s) => s.trim().parse::<f64>().ok()? as i64,
        _ => return None,
    };
    Some(seconds.clamp(0, MAX_TIME_SPENT_SECS))
}

/// RFC 3339 strings, or epoch numbers in seconds or milliseconds.
pub fn parse_first_seen(value: &Value) -> Option<DateTime<Utc>> {
    let epoch = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) => {
            s.parse::<i64>().ok()
        }
        Value::String(s) => {
            return DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc));
        }
        _ => None,
    }?;

    if epoch > 100_000_000_000 {
        DateTime::from_timestamp_millis(epoch)
    } else {
        DateTime::from_timestamp(epoch, 0)
    }
}

fn parse_body<T: for<'de> Deserialize<'de>>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|err| ApiError::BadRequest(format!("Invalid JSON: {err}")))
}

fn require_session(session_id: Option<String>) -> Result<String, ApiError> {
    session_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Missing session_id".into()))
}

impl TrackRequest {
    pub fn into_record(self) -> Result<VisitorRecord, ApiError> {
        let session_id = require_session(self.session_id)?;
        let user_agent = self
            .user_agent
            .map(|ua| ua.trim().to_string())
            .filter(|ua| !ua.is_empty());
        // No agent string means nothing to classify; the stored values stand.
        let ua = user_agent.as_deref().map(useragent::classify);
        let country = normalize(self.country);
        let country_code = normalize(self.country_code)
            .map(|code| code.to_ascii_uppercase())
            .or_else(|| country.as_deref().and_then(code_for_name));

        Ok(VisitorRecord {
            session_id,
            user_id: normalize(self.user_id),
            public_ip: normalize(self.ip),
            country,
            country_code,
            city: normalize(self.city),
            page_visited: normalize(self.page_visited),
            previous_page: normalize(self.previous_page),
            device_type: ua.as_ref().map(|ua| ua.device_type.as_str().to_string()),
            browser: ua.as_ref().map(|ua| ua.browser.clone()),
            operating_system: ua.as_ref().map(|ua| ua.operating_system.clone()),
            os_version: ua.and_then(|ua| ua.os_version),
            user_agent,
            first_seen: self.timestamp.as_ref().and_then(parse_first_seen),
            time_spent_seconds: self.time_spent_seconds.as_ref().and_then(clamp_time_spent),
        })
    }
}

/// `POST /track`
pub async fn track(
    State(state): State<CollectorState>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let request: TrackRequest = parse_body(&body)?;
    let record = request.into_record()?;

    state.db.upsert_visitor(&record).await?;
    info!(
        "tracked session {} ({}s on {})",
        record.session_id,
        record.time_spent_seconds.unwrap_or(0),
        record.page_visited.as_deref().unwrap_or("-")
    );

    Ok((StatusCode::CREATED, Json(json!({ "success": true }))))
}

/// `POST /log/time`
pub async fn log_time(
    State(state): State<CollectorState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let request: LogTimeRequest = parse_body(&body)?;
    let session_id = require_session(request.session_id)?;
    let seconds = request
        .time_spent_seconds
        .as_ref()
        .and_then(clamp_time_spent)
        .unwrap_or(0);

    if !state.db.update_time_spent(&session_id, seconds).await? {
        info!("time logged for unknown session {session_id}");
    }

    Ok(Json(json!({ "success": true, "time_logged": seconds })))
}

impl AnalyticsQuery {
    pub fn into_filter(self) -> AnalyticsFilter {
        AnalyticsFilter {
            country: normalize(self.country),
            device_type: normalize(self.device),
            browser: normalize(self.browser),
            url: normalize(self.url),
            public_ip: normalize(self.ip),
            visitor_type: normalize(self.visitor_type).and_then(|v| v.parse().ok()),
            start: normalize(self.start_date).and_then(|v| parse_date_bound(&v, false)),
            end: normalize(self.end_date).and_then(|v| parse_date_bound(&v, true)),
        }
    }
}

/// `GET /api/analytics`
pub async fn analytics(
    State(state): State<CollectorState>,
    Query(query): Query<AnalyticsQuery>,
) -> Result<Json<AnalyticsReport>, ApiError> {
    let report = state.db.analytics(&query.into_filter()).await?;
    Ok(Json(report))
}
