use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::article::{ArticleRecord, Severity};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DashboardOverview {
    #[serde(default)]
    pub total_articles: u64,
    #[serde(default)]
    pub disaster_articles: u64,
    #[serde(default)]
    pub disaster_ratio: f64,
    #[serde(default)]
    pub today_articles: u64,
    #[serde(default)]
    pub active_sources: u64,
    #[serde(default)]
    pub severity_high: u64,
    #[serde(default)]
    pub severity_medium: u64,
    #[serde(default)]
    pub severity_low: u64,
    #[serde(default)]
    pub last_updated: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HourlyStats {
    #[serde(default)]
    pub hour: String,
    #[serde(default)]
    pub articles: u64,
    #[serde(default)]
    pub disaster_articles: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WeeklyStats {
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub disaster_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategoryStats {
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub percentage: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrawlTimelineItem {
    #[serde(default)]
    pub hour: String,
    #[serde(default)]
    pub articles: u64,
    #[serde(default)]
    pub disaster_articles: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DisasterTypeDistribution {
    #[serde(default)]
    pub weather: u64,
    #[serde(default)]
    pub flood: u64,
    #[serde(default)]
    pub drought: u64,
    #[serde(default)]
    pub earthquake: u64,
    #[serde(default)]
    pub fire: u64,
    #[serde(default)]
    pub general: u64,
    #[serde(default)]
    pub other: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeverityBreakdown {
    #[serde(default)]
    pub high: u64,
    #[serde(default)]
    pub medium: u64,
    #[serde(default)]
    pub low: u64,
    #[serde(default)]
    pub none: u64,
    #[serde(default)]
    pub total: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeverityCounts {
    #[serde(default)]
    pub high: u64,
    #[serde(default)]
    pub medium: u64,
    #[serde(default)]
    pub low: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RealtimeStats {
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub today_disasters: u64,
    #[serde(default)]
    pub by_severity: SeverityCounts,
    #[serde(default)]
    pub by_type: BTreeMap<String, u64>,
    #[serde(default)]
    pub active_connections: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemStatus {
    #[serde(default)]
    pub system_status: String,
    #[serde(default)]
    pub realtime_ingestion: bool,
    #[serde(default)]
    pub active_sources: u64,
    #[serde(default)]
    pub total_sources: u64,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub server_time: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemHealth {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub crawler: String,
    #[serde(default)]
    pub websocket: String,
    #[serde(default)]
    pub uptime: f64,
}

/// Derived counters over the current article collection. Always
/// recomputed from scratch, never maintained incrementally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregateSnapshot {
    pub total_articles: u64,
    pub disaster_articles: u64,
    pub by_source: BTreeMap<String, u64>,
    /// Severity distribution over disaster articles only.
    pub by_severity: BTreeMap<Severity, u64>,
}

impl AggregateSnapshot {
    pub fn compute(articles: &[ArticleRecord]) -> Self {
        let mut by_source = BTreeMap::new();
        let mut by_severity = BTreeMap::new();
        let mut disaster_articles = 0u64;
        for article in articles {
            *by_source.entry(article.source.clone()).or_insert(0) += 1;
            if article.is_disaster() {
                disaster_articles += 1;
                *by_severity.entry(article.severity).or_insert(0) += 1;
            }
        }
        Self {
            total_articles: articles.len() as u64,
            disaster_articles,
            by_source,
            by_severity,
        }
    }
}
