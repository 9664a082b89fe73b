pub mod connection;
pub mod helpers;
pub mod migrations;
pub mod models;
pub mod repositories;

pub use connection::Database;
pub use models::{
    AnalyticsFilter, AnalyticsReport, BreakdownEntry, VisitorRecord, VisitorStats,
    VisitorType,
};
