use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    High,
    Medium,
    Low,
    #[default]
    None,
}

impl Severity {
    // Unknown or absent input means "no assessed severity", not "low".
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some("high") => Severity::High,
            Some("medium") => Severity::Medium,
            Some("low") => Severity::Low,
            _ => Severity::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::None => "none",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Article as the backend serializes it; every field the server may omit
/// is optional here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiArticle {
    #[serde(default, alias = "_id")]
    pub id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub publish_date: Option<String>,
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default)]
    pub collected_at: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub is_disaster: Option<bool>,
    #[serde(default)]
    pub disaster_type: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub region: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArticlesResponse {
    #[serde(default)]
    pub articles: Vec<ApiArticle>,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub page: Option<u64>,
    #[serde(default)]
    pub limit: Option<u64>,
}

impl ArticlesResponse {
    pub fn records(&self) -> Vec<ArticleRecord> {
        self.articles
            .iter()
            .filter_map(|payload| ArticleRecord::from_payload(payload.clone()))
            .collect()
    }
}

/// A fully-resolved article, built once from a server payload and never
/// mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArticleRecord {
    /// Server id when present, else the article URL. Never empty.
    pub id: String,
    pub title: String,
    pub source: String,
    pub category: String,
    pub disaster_type: Option<String>,
    pub severity: Severity,
    /// `None` means the publish time is unknown, not "now".
    pub published_at: Option<DateTime<Utc>>,
    pub summary: String,
    pub url: String,
    pub keywords: Vec<String>,
    pub region: Option<String>,
}

impl ArticleRecord {
    // A record without a stable identifier is dropped; a bad record
    // never fails the batch it arrived in.
    pub fn from_payload(payload: ApiArticle) -> Option<Self> {
        let url = payload.url.clone().unwrap_or_default();
        let id = payload
            .id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .or_else(|| Some(url.clone()).filter(|u| !u.trim().is_empty()));
        let Some(id) = id else {
            warn!(title = ?payload.title, "skipping article without id or url");
            return None;
        };

        let published_at = parse_timestamp(payload.publish_date.as_deref())
            .or_else(|| parse_timestamp(payload.published_at.as_deref()))
            .or_else(|| parse_timestamp(payload.collected_at.as_deref()));

        let summary = payload
            .summary
            .clone()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| payload.text.as_deref().map(summarize))
            .unwrap_or_else(|| "No summary".to_string());

        let category = payload
            .disaster_type
            .clone()
            .or_else(|| payload.category.clone())
            .unwrap_or_else(|| "General".to_string());

        Some(Self {
            id,
            title: payload.title.unwrap_or_else(|| "No title".to_string()),
            source: payload.source.unwrap_or_else(|| "Unknown".to_string()),
            category,
            disaster_type: payload.disaster_type,
            severity: Severity::parse(payload.severity.as_deref()),
            published_at,
            summary,
            url,
            keywords: payload.keywords,
            region: payload.region,
        })
    }

    pub fn is_disaster(&self) -> bool {
        self.disaster_type.is_some()
            || matches!(self.severity, Severity::High | Severity::Medium)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DisasterEvent {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub disaster_type: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub matched_keywords: Vec<String>,
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default)]
    pub processed_at: Option<String>,
}

fn parse_timestamp(value: Option<&str>) -> Option<DateTime<Utc>> {
    let value = value?.trim();
    if value.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        // The backend also emits naive ISO timestamps without an offset.
        .or_else(|| {
            NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

fn summarize(text: &str) -> String {
    let mut summary: String = text.chars().take(200).collect();
    if summary.len() < text.len() {
        summary.push_str("...");
    }
    summary
}
