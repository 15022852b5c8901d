use std::time::Duration;

use monitor_core::{
    ApiClient, DashboardView, DisasterChannel, MonitorConfig, RealtimeAggregator, ReconnectPolicy,
};
use reqwest::{redirect, ClientBuilder};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    init_tracing();

    let config = MonitorConfig::load();
    let client = ClientBuilder::new()
        .redirect(redirect::Policy::limited(5))
        .user_agent("disaster-monitor/0.1")
        .timeout(Duration::from_secs(30))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .expect("failed to build HTTP client");

    let api = ApiClient::new(client, config.api_base_url.clone());
    if api.check_health().await {
        info!(url = %config.api_base_url, "backend reachable");
    } else {
        warn!(url = %config.api_base_url, "backend health check failed; showing data as it becomes available");
    }

    let channel = DisasterChannel::new(config.ws_disasters_url());
    let aggregator =
        RealtimeAggregator::new(api, channel, ReconnectPolicy::default(), config.poll.clone());
    let mut view = aggregator.subscribe();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = view.borrow().clone();
                render(&snapshot);
            }
        }
    }

    info!("shutting down");
    if let Err(err) = aggregator.stop().await {
        warn!(%err, "shutdown did not complete cleanly");
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn render(view: &DashboardView) {
    println!("── disaster monitor [{}] ──", view.connection_mode);
    println!(
        "articles: {}  disasters: {}",
        view.stats.total_articles, view.stats.disaster_articles
    );
    if let Some(error) = &view.last_error {
        println!("! stale data: {error}");
    }
    if !view.stats.by_severity.is_empty() {
        let severities: Vec<String> = view
            .stats
            .by_severity
            .iter()
            .map(|(severity, count)| format!("{severity}: {count}"))
            .collect();
        println!("severity: {}", severities.join("  "));
    }
    for article in view.disaster_articles.iter().take(5) {
        let published = article
            .published_at
            .map(|ts| ts.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "unknown".to_string());
        println!(
            "  [{}] {} — {} ({})",
            article.severity, article.title, article.source, published
        );
    }
    if let Some(event) = view.recent_events.first() {
        println!("latest push: {} ({})", event.title, event.source);
    }
    println!();
}
