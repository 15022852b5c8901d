use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::api::{endpoints, ApiClient, ArticleListQuery};
use crate::article::{ArticleRecord, ArticlesResponse, DisasterEvent};
use crate::channel::{ChannelEvent, ConnectionState, DisasterChannel, PushMessage};
use crate::config::PollConfig;
use crate::error::TransportError;
use crate::reconnect::{spawn_supervisor, ReconnectPolicy, SupervisorHandle};
use crate::stats::{AggregateSnapshot, DashboardOverview, RealtimeStats};
use crate::store::{PollingStore, QueryKey, QueryOptions, QuerySubscription};

/// How many push events the aggregator retains, newest first.
pub const EVENT_LOG_CAPACITY: usize = 100;

/// Display-only: polling proceeds in either mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionMode {
    Realtime,
    #[default]
    Polling,
}

impl ConnectionMode {
    pub fn from_state(state: ConnectionState) -> Self {
        if state.is_open() {
            ConnectionMode::Realtime
        } else {
            ConnectionMode::Polling
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionMode::Realtime => "realtime",
            ConnectionMode::Polling => "polling",
        }
    }
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bounded log of push events, newest first.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    entries: VecDeque<DisasterEvent>,
}

impl EventLog {
    pub fn record(&mut self, event: DisasterEvent) {
        self.entries.push_front(event);
        self.entries.truncate(EVENT_LOG_CAPACITY);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_vec(&self) -> Vec<DisasterEvent> {
        self.entries.iter().cloned().collect()
    }
}

/// Deduplicates records by id (the most recently applied payload wins),
/// then orders by publish timestamp, newest first. The sort is stable,
/// so records without distinct timestamps keep their server order.
pub fn dedupe_latest(records: Vec<ArticleRecord>) -> Vec<ArticleRecord> {
    let mut index_by_id: HashMap<String, usize> = HashMap::new();
    let mut deduped: Vec<ArticleRecord> = Vec::new();
    for record in records {
        match index_by_id.get(&record.id) {
            Some(&slot) => deduped[slot] = record,
            None => {
                index_by_id.insert(record.id.clone(), deduped.len());
                deduped.push(record);
            }
        }
    }
    deduped.sort_by(|a, b| b.published_at.cmp(&a.published_at));
    deduped
}

/// The consistent view consumers render from.
#[derive(Debug, Clone, Default)]
pub struct DashboardView {
    pub articles: Vec<ArticleRecord>,
    pub disaster_articles: Vec<ArticleRecord>,
    pub stats: AggregateSnapshot,
    pub overview: Option<DashboardOverview>,
    pub realtime: Option<RealtimeStats>,
    /// Push events, newest first, capped at [`EVENT_LOG_CAPACITY`].
    pub recent_events: Vec<DisasterEvent>,
    pub connection_mode: ConnectionMode,
    /// Set while the article list is stale because its last refresh
    /// failed; the cached articles above remain renderable throughout.
    pub last_error: Option<String>,
}

struct ViewSources {
    articles_store: PollingStore<ArticlesResponse>,
    overview_store: PollingStore<DashboardOverview>,
    recent_store: PollingStore<ArticlesResponse>,
    stats_store: PollingStore<RealtimeStats>,
    articles_key: QueryKey,
    overview_key: QueryKey,
    recent_key: QueryKey,
    stats_key: QueryKey,
}

impl ViewSources {
    async fn build_view(&self, log: &EventLog, state: ConnectionState) -> DashboardView {
        let list = self.articles_store.latest(&self.articles_key).await;
        let recent = self.recent_store.latest(&self.recent_key).await;
        let overview = self.overview_store.latest(&self.overview_key).await;
        let live = self.stats_store.latest(&self.stats_key).await;
        let error = self.articles_store.last_error(&self.articles_key).await;

        let mut records = Vec::new();
        if let Some(list) = &list {
            records.extend(list.records());
        }
        if let Some(recent) = &recent {
            records.extend(recent.records());
        }
        let articles = dedupe_latest(records);
        let disaster_articles: Vec<ArticleRecord> = articles
            .iter()
            .filter(|article| article.is_disaster())
            .cloned()
            .collect();

        // Derived counters are always recomputed from the full
        // collection; the overview endpoint supplies the fleet-wide
        // totals the local window cannot know.
        let mut stats = AggregateSnapshot::compute(&articles);
        if let Some(overview) = &overview {
            stats.total_articles = overview.total_articles;
            stats.disaster_articles = overview.disaster_articles;
        }

        DashboardView {
            articles,
            disaster_articles,
            stats,
            overview: overview.map(|o| (*o).clone()),
            realtime: live.map(|s| (*s).clone()),
            recent_events: log.to_vec(),
            connection_mode: ConnectionMode::from_state(state),
            last_error: error.map(|err| err.to_string()),
        }
    }
}

// Some(true) means rebuild the view, None means the store side is gone.
fn refresh_signal(
    update: Result<QueryKey, broadcast::error::RecvError>,
) -> Option<bool> {
    match update {
        Ok(_) => Some(true),
        Err(broadcast::error::RecvError::Lagged(_)) => Some(true),
        Err(broadcast::error::RecvError::Closed) => None,
    }
}

/// Merges push events with polled data into one [`DashboardView`],
/// invalidating the dependent cache entries on each disaster event.
pub struct RealtimeAggregator {
    channel: Arc<DisasterChannel>,
    supervisor: SupervisorHandle,
    subscriptions: Vec<QuerySubscription>,
    merge_cancel: broadcast::Sender<()>,
    merge_task: JoinHandle<()>,
    view_rx: watch::Receiver<DashboardView>,
}

impl RealtimeAggregator {
    pub fn new(
        api: ApiClient,
        channel: DisasterChannel,
        policy: ReconnectPolicy,
        poll: PollConfig,
    ) -> Self {
        let channel = Arc::new(channel);
        // Subscribe before the supervisor connects so no early push
        // event or close can slip past the merge loop.
        let mut events_rx = channel.subscribe();
        let mut state_rx = channel.state_watch();
        let supervisor = spawn_supervisor(channel.clone(), policy);

        let articles_store: PollingStore<ArticlesResponse> = PollingStore::new();
        let overview_store: PollingStore<DashboardOverview> = PollingStore::new();
        let recent_store: PollingStore<ArticlesResponse> = PollingStore::new();
        let stats_store: PollingStore<RealtimeStats> = PollingStore::new();

        let list_query = ArticleListQuery {
            limit: Some(poll.article_limit),
            offset: Some(0),
            sort_by: Some("collected_at".to_string()),
            sort_order: Some("desc".to_string()),
            ..Default::default()
        };
        let articles_key = list_query.cache_key();
        let overview_key = QueryKey::bare(endpoints::DASHBOARD_OVERVIEW);
        let recent_key = QueryKey::new(
            endpoints::REALTIME_RECENT,
            [("limit", poll.recent_limit.to_string())],
        );
        let stats_key = QueryKey::bare(endpoints::REALTIME_STATS);

        let retry_delay = Duration::from_millis(poll.retry_delay_ms);
        let mut subscriptions = Vec::new();

        subscriptions.push({
            let api = api.clone();
            let query = list_query.clone();
            articles_store.subscribe(
                articles_key.clone(),
                move || {
                    let api = api.clone();
                    let query = query.clone();
                    async move { api.list_articles(&query).await }
                },
                QueryOptions {
                    refresh_interval: Some(Duration::from_secs(poll.articles_interval_secs)),
                    stale_time: Duration::from_secs(poll.articles_stale_secs),
                    retry: poll.retry_attempts,
                    retry_delay,
                },
            )
        });

        subscriptions.push({
            let api = api.clone();
            overview_store.subscribe(
                overview_key.clone(),
                move || {
                    let api = api.clone();
                    async move { api.dashboard_overview().await }
                },
                QueryOptions {
                    refresh_interval: Some(Duration::from_secs(poll.overview_interval_secs)),
                    stale_time: Duration::from_secs(poll.articles_stale_secs),
                    retry: poll.retry_attempts,
                    retry_delay,
                },
            )
        });

        subscriptions.push({
            let api = api.clone();
            let limit = poll.recent_limit;
            recent_store.subscribe(
                recent_key.clone(),
                move || {
                    let api = api.clone();
                    async move { api.recent_disasters(limit).await }
                },
                QueryOptions {
                    refresh_interval: Some(Duration::from_secs(poll.recent_interval_secs)),
                    stale_time: Duration::from_secs(poll.recent_stale_secs),
                    retry: poll.retry_attempts,
                    retry_delay,
                },
            )
        });

        subscriptions.push({
            let api = api.clone();
            stats_store.subscribe(
                stats_key.clone(),
                move || {
                    let api = api.clone();
                    async move { api.realtime_stats().await }
                },
                QueryOptions {
                    refresh_interval: Some(Duration::from_secs(poll.stats_interval_secs)),
                    stale_time: Duration::ZERO,
                    retry: poll.stats_retry_attempts,
                    retry_delay,
                },
            )
        });

        let sources = ViewSources {
            articles_store: articles_store.clone(),
            overview_store: overview_store.clone(),
            recent_store: recent_store.clone(),
            stats_store: stats_store.clone(),
            articles_key: articles_key.clone(),
            overview_key: overview_key.clone(),
            recent_key,
            stats_key,
        };

        let (view_tx, view_rx) = watch::channel(DashboardView::default());
        let (merge_cancel, mut cancel_rx) = broadcast::channel::<()>(1);
        let mut articles_updates = articles_store.updates();
        let mut overview_updates = overview_store.updates();
        let mut recent_updates = recent_store.updates();
        let mut stats_updates = stats_store.updates();

        let merge_task = tokio::spawn(async move {
            let mut log = EventLog::default();
            loop {
                let rebuild = tokio::select! {
                    _ = cancel_rx.recv() => break,
                    event = events_rx.recv() => match event {
                        Ok(ChannelEvent::Message(PushMessage::NewDisaster { data, .. })) => {
                            info!(title = %data.title, source = %data.source, "disaster push event received");
                            log.record(data);
                            sources.articles_store.invalidate(&sources.articles_key).await;
                            sources.overview_store.invalidate(&sources.overview_key).await;
                            true
                        }
                        Ok(ChannelEvent::Message(_)) => false,
                        Ok(ChannelEvent::Connected) => true,
                        Ok(ChannelEvent::Closed { .. }) => true,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "aggregator lagged behind channel events");
                            true
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    changed = state_rx.changed() => match changed {
                        Ok(()) => true,
                        Err(_) => break,
                    },
                    update = articles_updates.recv() => match refresh_signal(update) {
                        Some(rebuild) => rebuild,
                        None => break,
                    },
                    update = overview_updates.recv() => match refresh_signal(update) {
                        Some(rebuild) => rebuild,
                        None => break,
                    },
                    update = recent_updates.recv() => match refresh_signal(update) {
                        Some(rebuild) => rebuild,
                        None => break,
                    },
                    update = stats_updates.recv() => match refresh_signal(update) {
                        Some(rebuild) => rebuild,
                        None => break,
                    },
                };
                if rebuild {
                    let state = *state_rx.borrow();
                    let view = sources.build_view(&log, state).await;
                    let _ = view_tx.send(view);
                }
            }
        });

        Self {
            channel,
            supervisor,
            subscriptions,
            merge_cancel,
            merge_task,
            view_rx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<DashboardView> {
        self.view_rx.clone()
    }

    pub fn view(&self) -> DashboardView {
        self.view_rx.borrow().clone()
    }

    pub fn connection_mode(&self) -> ConnectionMode {
        ConnectionMode::from_state(self.channel.state())
    }

    pub fn channel(&self) -> &DisasterChannel {
        &self.channel
    }

    // Supervisor first so no retry can reopen the socket mid-teardown.
    pub async fn stop(self) -> Result<(), TransportError> {
        self.supervisor.stop().await?;
        self.channel.disconnect().await;
        let _ = self.merge_cancel.send(());
        self.merge_task.await?;
        for subscription in self.subscriptions {
            if let Err(err) = subscription.stop().await {
                warn!(%err, "polling subscription did not stop cleanly");
            }
        }
        Ok(())
    }
}
