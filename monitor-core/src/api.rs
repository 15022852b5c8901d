use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::article::{ApiArticle, ArticlesResponse, Severity};
use crate::error::RequestError;
use crate::stats::{
    CategoryStats, CrawlTimelineItem, DashboardOverview, DisasterTypeDistribution, HourlyStats,
    RealtimeStats, SeverityBreakdown, SystemHealth, SystemStatus, WeeklyStats,
};
use crate::store::QueryKey;

pub mod endpoints {
    pub const ARTICLES: &str = "/api/v1/articles/";
    pub const ARTICLE_SEARCH: &str = "/api/v1/articles/search";
    pub const DASHBOARD_OVERVIEW: &str = "/api/v1/dashboard/overview";
    pub const DASHBOARD_HOURLY: &str = "/api/v1/dashboard/hourly";
    pub const DASHBOARD_WEEKLY: &str = "/api/v1/dashboard/weekly";
    pub const DASHBOARD_CATEGORIES: &str = "/api/v1/dashboard/categories";
    pub const DASHBOARD_CRAWL_TIMELINE: &str = "/api/v1/dashboard/crawl-timeline";
    pub const DASHBOARD_DISASTER_TYPES: &str = "/api/v1/dashboard/disaster-types";
    pub const DASHBOARD_SEVERITY: &str = "/api/v1/dashboard/severity";
    pub const REALTIME_RECENT: &str = "/api/v1/realtime/recent";
    pub const REALTIME_STATS: &str = "/api/v1/realtime/stats";
    pub const SYSTEM_STATUS: &str = "/api/v1/system/status";
    pub const SYSTEM_HEALTH: &str = "/api/v1/system/health";
    // Relative to the ws(s):// base url.
    pub const WS_DISASTERS: &str = "/realtime/ws/disasters";

    pub fn article_detail(id: &str) -> String {
        format!("/api/v1/articles/{id}")
    }
}

/// Filters for the article listing endpoint; unset fields are omitted
/// from the request entirely.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArticleListQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub source: Option<String>,
    pub severity: Option<Severity>,
    pub disaster_type: Option<String>,
    pub region: Option<String>,
    pub is_disaster: Option<bool>,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
}

impl ArticleListQuery {
    pub fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(limit) = self.limit {
            params.push(("limit", limit.to_string()));
        }
        if let Some(offset) = self.offset {
            params.push(("offset", offset.to_string()));
        }
        if let Some(source) = &self.source {
            params.push(("source", source.clone()));
        }
        if let Some(severity) = self.severity {
            params.push(("severity", severity.to_string()));
        }
        if let Some(disaster_type) = &self.disaster_type {
            params.push(("disaster_type", disaster_type.clone()));
        }
        if let Some(region) = &self.region {
            params.push(("region", region.clone()));
        }
        if let Some(is_disaster) = self.is_disaster {
            params.push(("is_disaster", is_disaster.to_string()));
        }
        if let Some(sort_by) = &self.sort_by {
            params.push(("sort_by", sort_by.clone()));
        }
        if let Some(sort_order) = &self.sort_order {
            params.push(("sort_order", sort_order.clone()));
        }
        params
    }

    pub fn cache_key(&self) -> QueryKey {
        QueryKey::new(endpoints::ARTICLES, self.params())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArticleSearchQuery {
    pub q: Option<String>,
    pub source: Option<String>,
    pub severity: Option<Severity>,
    pub disaster_type: Option<String>,
    pub region: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

impl ArticleSearchQuery {
    pub fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(q) = &self.q {
            params.push(("q", q.clone()));
        }
        if let Some(source) = &self.source {
            params.push(("source", source.clone()));
        }
        if let Some(severity) = self.severity {
            params.push(("severity", severity.to_string()));
        }
        if let Some(disaster_type) = &self.disaster_type {
            params.push(("disaster_type", disaster_type.clone()));
        }
        if let Some(region) = &self.region {
            params.push(("region", region.clone()));
        }
        if let Some(limit) = self.limit {
            params.push(("limit", limit.to_string()));
        }
        if let Some(offset) = self.offset {
            params.push(("offset", offset.to_string()));
        }
        if let Some(start_date) = &self.start_date {
            params.push(("start_date", start_date.clone()));
        }
        if let Some(end_date) = &self.end_date {
            params.push(("end_date", end_date.clone()));
        }
        params
    }

    pub fn cache_key(&self) -> QueryKey {
        QueryKey::new(endpoints::ARTICLE_SEARCH, self.params())
    }
}

/// HTTP client for the monitor backend. Does not retry; retry policy
/// belongs to the polling layer.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{base}/{path}")
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, RequestError> {
        let url = self.url(path);
        debug!(%url, "GET");
        let mut request = self.client.get(&url);
        if !params.is_empty() {
            request = request.query(params);
        }
        self.execute(request).await
    }

    pub async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> Result<T, RequestError> {
        let url = self.url(path);
        debug!(%url, "POST");
        self.execute(self.client.post(&url).json(body)).await
    }

    pub async fn put<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> Result<T, RequestError> {
        let url = self.url(path);
        debug!(%url, "PUT");
        self.execute(self.client.put(&url).json(body)).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, RequestError> {
        let url = self.url(path);
        debug!(%url, "DELETE");
        self.execute(self.client.delete(&url)).await
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, RequestError> {
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            let body: Option<serde_json::Value> = serde_json::from_str(&text).ok();
            let message = body
                .as_ref()
                .and_then(|value| value.get("detail"))
                .and_then(|detail| detail.as_str())
                .map(ToOwned::to_owned)
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
            return Err(RequestError::Http {
                status: status.as_u16(),
                message,
                body,
            });
        }
        Ok(serde_json::from_str(&text)?)
    }

    pub async fn list_articles(
        &self,
        query: &ArticleListQuery,
    ) -> Result<ArticlesResponse, RequestError> {
        self.get(endpoints::ARTICLES, &query.params()).await
    }

    pub async fn search_articles(
        &self,
        query: &ArticleSearchQuery,
    ) -> Result<ArticlesResponse, RequestError> {
        self.get(endpoints::ARTICLE_SEARCH, &query.params()).await
    }

    pub async fn article(&self, id: &str) -> Result<ApiArticle, RequestError> {
        self.get(&endpoints::article_detail(id), &[]).await
    }

    pub async fn dashboard_overview(&self) -> Result<DashboardOverview, RequestError> {
        self.get(endpoints::DASHBOARD_OVERVIEW, &[]).await
    }

    pub async fn hourly_stats(&self, hours: u32) -> Result<Vec<HourlyStats>, RequestError> {
        self.get(endpoints::DASHBOARD_HOURLY, &[("hours", hours.to_string())])
            .await
    }

    pub async fn weekly_stats(&self, days: u32) -> Result<Vec<WeeklyStats>, RequestError> {
        self.get(endpoints::DASHBOARD_WEEKLY, &[("days", days.to_string())])
            .await
    }

    pub async fn category_stats(&self) -> Result<Vec<CategoryStats>, RequestError> {
        self.get(endpoints::DASHBOARD_CATEGORIES, &[]).await
    }

    pub async fn crawl_timeline(&self, hours: u32) -> Result<Vec<CrawlTimelineItem>, RequestError> {
        self.get(
            endpoints::DASHBOARD_CRAWL_TIMELINE,
            &[("hours", hours.to_string())],
        )
        .await
    }

    pub async fn disaster_type_distribution(
        &self,
    ) -> Result<DisasterTypeDistribution, RequestError> {
        self.get(endpoints::DASHBOARD_DISASTER_TYPES, &[]).await
    }

    pub async fn severity_breakdown(&self) -> Result<SeverityBreakdown, RequestError> {
        self.get(endpoints::DASHBOARD_SEVERITY, &[]).await
    }

    pub async fn recent_disasters(&self, limit: u32) -> Result<ArticlesResponse, RequestError> {
        self.get(endpoints::REALTIME_RECENT, &[("limit", limit.to_string())])
            .await
    }

    pub async fn realtime_stats(&self) -> Result<RealtimeStats, RequestError> {
        self.get(endpoints::REALTIME_STATS, &[]).await
    }

    pub async fn system_status(&self) -> Result<SystemStatus, RequestError> {
        self.get(endpoints::SYSTEM_STATUS, &[]).await
    }

    pub async fn system_health(&self) -> Result<SystemHealth, RequestError> {
        self.get(endpoints::SYSTEM_HEALTH, &[]).await
    }

    pub async fn check_health(&self) -> bool {
        self.system_health().await.is_ok()
    }
}
