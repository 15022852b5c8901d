pub mod aggregator;
pub mod api;
pub mod article;
pub mod channel;
pub mod config;
pub mod error;
pub mod reconnect;
pub mod stats;
pub mod store;

pub use aggregator::{
    dedupe_latest, ConnectionMode, DashboardView, EventLog, RealtimeAggregator,
    EVENT_LOG_CAPACITY,
};
pub use api::{endpoints, ApiClient, ArticleListQuery, ArticleSearchQuery};
pub use article::{ApiArticle, ArticleRecord, ArticlesResponse, DisasterEvent, Severity};
pub use channel::{
    ChannelEvent, ConnectionState, DisasterChannel, PushMessage, CONNECT_TIMEOUT,
};
pub use config::{MonitorConfig, PollConfig};
pub use error::{RequestError, TransportError};
pub use reconnect::{
    spawn_supervisor, ReconnectMachine, ReconnectPolicy, ReconnectState, SupervisorHandle,
};
pub use stats::{AggregateSnapshot, DashboardOverview, RealtimeStats, SystemHealth, SystemStatus};
pub use store::{FetchResult, PollingStore, QueryKey, QueryOptions, QuerySubscription};
