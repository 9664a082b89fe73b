use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::db::{
    connection::Database,
    helpers::{format_timestamp, parse_optional_datetime},
    models::{
        AnalyticsFilter, AnalyticsReport, BreakdownEntry, VisitorRecord, VisitorStats, VisitorType,
    },
};

const BREAKDOWN_LIMIT: i64 = 10;

fn row_to_visitor(row: &Row) -> Result<VisitorRecord> {
    let first_seen: Option<String> = row.get("first_seen")?;

    Ok(VisitorRecord {
        session_id: row.get("session_id")?,
        user_id: row.get("user_id")?,
        public_ip: row.get("public_ip")?,
        country: row.get("country")?,
        country_code: row.get("country_code")?,
        city: row.get("city")?,
        page_visited: row.get("page_visited")?,
        previous_page: row.get("previous_page")?,
        user_agent: row.get("user_agent")?,
        device_type: row.get("device_type")?,
        browser: row.get("browser")?,
        operating_system: row.get("operating_system")?,
        os_version: row.get("os_version")?,
        first_seen: parse_optional_datetime(first_seen, "first_seen")?,
        time_spent_seconds: row.get("time_spent_seconds")?,
    })
}

/// `%` and `_` in user input match literally.
fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// WHERE clause plus positional parameters for an analytics filter.
fn filter_clause(filter: &AnalyticsFilter) -> (String, Vec<String>) {
    let mut clauses = Vec::new();
    let mut values = Vec::new();

    if let Some(country) = &filter.country {
        values.push(country.clone());
        clauses.push(format!("country = ?{}", values.len()));
    }
    if let Some(device) = &filter.device_type {
        values.push(device.clone());
        clauses.push(format!("device_type = ?{}", values.len()));
    }
    if let Some(browser) = &filter.browser {
        values.push(browser.clone());
        clauses.push(format!("browser = ?{}", values.len()));
    }
    if let Some(url) = &filter.url {
        values.push(format!("%{}%", escape_like(url)));
        clauses.push(format!("page_visited LIKE ?{} ESCAPE '\\'", values.len()));
    }
    if let Some(ip) = &filter.public_ip {
        values.push(ip.clone());
        clauses.push(format!("public_ip = ?{}", values.len()));
    }
    if let Some(visitor_type) = filter.visitor_type {
        let membership = match visitor_type {
            VisitorType::New => "NOT IN",
            VisitorType::Returning => "IN",
        };
        clauses.push(format!(
            "COALESCE(user_id, session_id) {membership} (
                SELECT COALESCE(user_id, session_id) FROM visitors
                GROUP BY 1 HAVING COUNT(*) > 1)"
        ));
    }
    if let Some(start) = &filter.start {
        values.push(format_timestamp(start));
        clauses.push(format!("COALESCE(first_seen, created_at) >= ?{}", values.len()));
    }
    if let Some(end) = &filter.end {
        values.push(format_timestamp(end));
        clauses.push(format!("COALESCE(first_seen, created_at) <= ?{}", values.len()));
    }

    if clauses.is_empty() {
        (String::new(), values)
    } else {
        (format!("WHERE {}", clauses.join(" AND ")), values)
    }
}

fn breakdown(
    conn: &Connection,
    column: &str,
    where_sql: &str,
    values: &[String],
) -> Result<Vec<BreakdownEntry>> {
    let sql = format!(
        "SELECT COALESCE({column}, 'Unknown') AS label, COUNT(*) AS visitors
         FROM visitors {where_sql}
         GROUP BY label
         ORDER BY visitors DESC, label ASC
         LIMIT {BREAKDOWN_LIMIT}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
        Ok(BreakdownEntry {
            label: row.get(0)?,
            visitors: row.get(1)?,
        })
    })?;

    rows.collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to aggregate visitors by {column}"))
}

impl Database {
    /// Inserts or merges by `session_id`. Fields that are `None` keep
    /// whatever the stored row already has.
    pub async fn upsert_visitor(&self, visitor: &VisitorRecord) -> Result<()> {
        let record = visitor.clone();
        self.execute(move |conn| {
            let now = format_timestamp(&Utc::now());
            conn.execute(
                "INSERT INTO visitors (
                    session_id, user_id, public_ip, country, country_code, city,
                    page_visited, previous_page, user_agent, device_type, browser,
                    operating_system, os_version, first_seen, time_spent_seconds,
                    created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?16)
                 ON CONFLICT(session_id) DO UPDATE SET
                    user_id = COALESCE(excluded.user_id, visitors.user_id),
                    public_ip = COALESCE(excluded.public_ip, visitors.public_ip),
                    country = COALESCE(excluded.country, visitors.country),
                    country_code = COALESCE(excluded.country_code, visitors.country_code),
                    city = COALESCE(excluded.city, visitors.city),
                    page_visited = COALESCE(excluded.page_visited, visitors.page_visited),
                    previous_page = COALESCE(excluded.previous_page, visitors.previous_page),
                    user_agent = COALESCE(excluded.user_agent, visitors.user_agent),
                    device_type = COALESCE(excluded.device_type, visitors.device_type),
                    browser = COALESCE(excluded.browser, visitors.browser),
                    operating_system = COALESCE(excluded.operating_system, visitors.operating_system),
                    os_version = COALESCE(excluded.os_version, visitors.os_version),
                    first_seen = COALESCE(visitors.first_seen, excluded.first_seen),
                    time_spent_seconds = COALESCE(excluded.time_spent_seconds, visitors.time_spent_seconds),
                    updated_at = excluded.updated_at",
                params![
                    record.session_id,
                    record.user_id,
                    record.public_ip,
                    record.country,
                    record.country_code,
                    record.city,
                    record.page_visited,
                    record.previous_page,
                    record.user_agent,
                    record.device_type,
                    record.browser,
                    record.operating_system,
                    record.os_version,
                    record.first_seen.as_ref().map(format_timestamp),
                    record.time_spent_seconds,
                    now,
                ],
            )
            .with_context(|| "failed to upsert visitor")?;
            Ok(())
        })
        .await
    }

    /// Returns whether a row for the session existed.
    pub async fn update_time_spent(&self, session_id: &str, seconds: i64) -> Result<bool> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE visitors
                     SET time_spent_seconds = ?1,
                         updated_at = ?2
                     WHERE session_id = ?3",
                    params![seconds, format_timestamp(&Utc::now()), session_id],
                )
                .with_context(|| "failed to update time spent")?;
            Ok(updated > 0)
        })
        .await
    }

    pub async fn get_visitor(&self, session_id: &str) -> Result<Option<VisitorRecord>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare("SELECT * FROM visitors WHERE session_id = ?1")?;
            let row = stmt
                .query_row(params![session_id], |row| {
                    row_to_visitor(row).map_err(|err| {
                        rusqlite::Error::FromSqlConversionFailure(
                            0,
                            rusqlite::types::Type::Text,
                            err.into(),
                        )
                    })
                })
                .optional()?;
            Ok(row)
        })
        .await
    }

    pub async fn analytics(&self, filter: &AnalyticsFilter) -> Result<AnalyticsReport> {
        let filter = filter.clone();
        self.execute(move |conn| {
            let (where_sql, values) = filter_clause(&filter);

            let (total_visitors, unique_visitors, avg_time): (i64, i64, Option<f64>) = conn
                .query_row(
                    &format!(
                        "SELECT COUNT(*),
                                COUNT(DISTINCT COALESCE(user_id, session_id)),
                                AVG(time_spent_seconds)
                         FROM visitors {where_sql}"
                    ),
                    params_from_iter(values.iter()),
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .with_context(|| "failed to compute visitor stats")?;

            let stats = VisitorStats {
                total_visitors,
                unique_visitors,
                repeated_visitors: (total_visitors - unique_visitors).max(0),
                avg_time_spent_seconds: avg_time.unwrap_or(0.0),
            };

            Ok(AnalyticsReport {
                stats,
                countries: breakdown(conn, "country", &where_sql, &values)?,
                devices: breakdown(conn, "device_type", &where_sql, &values)?,
                browsers: breakdown(conn, "browser", &where_sql, &values)?,
            })
        })
        .await
    }
}
