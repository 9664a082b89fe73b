pub mod visitor;

pub use visitor::{
    AnalyticsFilter, AnalyticsReport, BreakdownEntry, VisitorRecord, VisitorStats,
    VisitorType,
};
