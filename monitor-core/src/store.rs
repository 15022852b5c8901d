use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::RequestError;

/// One cache slot: a resource path plus its query parameters, kept
/// sorted so insertion order never affects equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey {
    resource: String,
    params: BTreeMap<String, String>,
}

impl QueryKey {
    pub fn new<I, K, V>(resource: impl Into<String>, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            resource: resource.into(),
            params: params
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }

    pub fn bare(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.resource)?;
        for (i, (key, value)) in self.params.iter().enumerate() {
            f.write_str(if i == 0 { "?" } else { "&" })?;
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Periodic background refetch cadence for active subscriptions.
    pub refresh_interval: Option<Duration>,
    /// A fetch younger than this is served from cache without a request.
    pub stale_time: Duration,
    pub retry: u32,
    pub retry_delay: Duration,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            refresh_interval: None,
            stale_time: Duration::from_secs(30),
            retry: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

pub type FetchResult<T> = Result<Arc<T>, Arc<RequestError>>;

struct CacheSlot<T> {
    data: Option<Arc<T>>,
    error: Option<Arc<RequestError>>,
    // Staleness-window stamp; cleared by invalidation.
    fetched_at: Option<Instant>,
    // Ordering stamp; survives invalidation so a superseded fetch can
    // still be recognized as old.
    applied_stamp: Option<Instant>,
    // Newest in-flight fetch for this key; queries coalesce onto it.
    inflight: Option<(Instant, watch::Receiver<Option<FetchResult<T>>>)>,
    subscribers: usize,
}

impl<T> Default for CacheSlot<T> {
    fn default() -> Self {
        Self {
            data: None,
            error: None,
            fetched_at: None,
            applied_stamp: None,
            inflight: None,
            subscribers: 0,
        }
    }
}

enum Plan<T> {
    Attach(watch::Receiver<Option<FetchResult<T>>>),
    Fetch(Instant, watch::Sender<Option<FetchResult<T>>>),
}

/// Shared refresh cache for one resource type; failed refreshes keep
/// the last-known-good value in place next to the surfaced error.
pub struct PollingStore<T> {
    slots: Arc<Mutex<HashMap<QueryKey, CacheSlot<T>>>>,
    invalidations: broadcast::Sender<QueryKey>,
    updates: broadcast::Sender<QueryKey>,
}

impl<T> Clone for PollingStore<T> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
            invalidations: self.invalidations.clone(),
            updates: self.updates.clone(),
        }
    }
}

impl<T> Default for PollingStore<T>
where
    T: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PollingStore<T>
where
    T: Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (invalidations, _) = broadcast::channel(32);
        let (updates, _) = broadcast::channel(32);
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            invalidations,
            updates,
        }
    }

    /// Resolves the current value for `key`: from cache when fresh, from
    /// an in-flight fetch when one exists, by fetching otherwise.
    pub async fn query<F, Fut>(
        &self,
        key: &QueryKey,
        fetcher: F,
        options: &QueryOptions,
    ) -> FetchResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, RequestError>>,
    {
        let plan = {
            let mut slots = self.slots.lock().await;
            let slot = slots.entry(key.clone()).or_default();
            if let (Some(data), Some(fetched_at)) = (&slot.data, slot.fetched_at) {
                if fetched_at.elapsed() < options.stale_time {
                    return Ok(data.clone());
                }
            }
            if let Some((_, rx)) = &slot.inflight {
                Plan::Attach(rx.clone())
            } else {
                let (tx, rx) = watch::channel(None);
                let stamp = Instant::now();
                slot.inflight = Some((stamp, rx));
                Plan::Fetch(stamp, tx)
            }
        };

        match plan {
            Plan::Attach(mut rx) => loop {
                if let Some(result) = rx.borrow_and_update().clone() {
                    return result;
                }
                if rx.changed().await.is_err() {
                    return Err(Arc::new(RequestError::Interrupted));
                }
            },
            Plan::Fetch(stamp, tx) => {
                let result = self.run_fetch(key, stamp, &fetcher, options, false).await;
                let _ = tx.send(Some(result.clone()));
                result
            }
        }
    }

    /// Forces a fetch for `key`, bypassing the staleness window and
    /// superseding any in-flight fetch.
    pub async fn refresh<F, Fut>(
        &self,
        key: &QueryKey,
        fetcher: F,
        options: &QueryOptions,
    ) -> FetchResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, RequestError>>,
    {
        self.refresh_inner(key, fetcher, options, false).await
    }

    async fn refresh_inner<F, Fut>(
        &self,
        key: &QueryKey,
        fetcher: F,
        options: &QueryOptions,
        only_if_watched: bool,
    ) -> FetchResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, RequestError>>,
    {
        let (stamp, tx) = {
            let mut slots = self.slots.lock().await;
            let slot = slots.entry(key.clone()).or_default();
            let (tx, rx) = watch::channel(None);
            let stamp = Instant::now();
            slot.inflight = Some((stamp, rx));
            (stamp, tx)
        };
        let result = self
            .run_fetch(key, stamp, &fetcher, options, only_if_watched)
            .await;
        let _ = tx.send(Some(result.clone()));
        result
    }

    async fn run_fetch<F, Fut>(
        &self,
        key: &QueryKey,
        stamp: Instant,
        fetcher: &F,
        options: &QueryOptions,
        only_if_watched: bool,
    ) -> FetchResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, RequestError>>,
    {
        let mut attempt = 0u32;
        let outcome = loop {
            match fetcher().await {
                Ok(value) => break Ok(Arc::new(value)),
                Err(err) if attempt < options.retry => {
                    attempt += 1;
                    debug!(key = %key, attempt, %err, "fetch failed; retrying");
                    tokio::time::sleep(options.retry_delay).await;
                }
                Err(err) => break Err(Arc::new(err)),
            }
        };

        let mut applied = false;
        {
            let mut slots = self.slots.lock().await;
            let slot = slots.entry(key.clone()).or_default();
            if slot
                .inflight
                .as_ref()
                .map(|(s, _)| *s == stamp)
                .unwrap_or(false)
            {
                slot.inflight = None;
            }
            if only_if_watched && slot.subscribers == 0 {
                debug!(key = %key, "discarding refresh result with no subscribers");
                return outcome;
            }
            match &outcome {
                Ok(value) => {
                    // Last-fetch-wins: a fetch issued earlier must not
                    // overwrite a newer applied result.
                    if slot.applied_stamp.map_or(true, |prev| stamp > prev) {
                        slot.data = Some(value.clone());
                        slot.error = None;
                        slot.fetched_at = Some(stamp);
                        slot.applied_stamp = Some(stamp);
                        applied = true;
                    } else {
                        debug!(key = %key, "discarding fetch result superseded by a newer one");
                    }
                }
                Err(err) => {
                    warn!(key = %key, error = %err, retries = options.retry, "fetch failed; keeping cached value");
                    slot.error = Some(err.clone());
                }
            }
        }
        if applied {
            let _ = self.updates.send(key.clone());
        }
        outcome
    }

    /// Marks `key` stale and nudges its subscriptions into a refetch.
    pub async fn invalidate(&self, key: &QueryKey) {
        {
            let mut slots = self.slots.lock().await;
            if let Some(slot) = slots.get_mut(key) {
                slot.fetched_at = None;
            }
        }
        debug!(key = %key, "cache entry invalidated");
        let _ = self.invalidations.send(key.clone());
    }

    /// Last-known-good value for `key`; never fetches.
    pub async fn latest(&self, key: &QueryKey) -> Option<Arc<T>> {
        self.slots
            .lock()
            .await
            .get(key)
            .and_then(|slot| slot.data.clone())
    }

    pub async fn last_error(&self, key: &QueryKey) -> Option<Arc<RequestError>> {
        self.slots
            .lock()
            .await
            .get(key)
            .and_then(|slot| slot.error.clone())
    }

    pub fn updates(&self) -> broadcast::Receiver<QueryKey> {
        self.updates.subscribe()
    }

    /// Fetches once right away, then refetches on `refresh_interval` and
    /// on invalidation, until the subscription is dropped or stopped.
    pub fn subscribe<F, Fut>(
        &self,
        key: QueryKey,
        fetcher: F,
        options: QueryOptions,
    ) -> QuerySubscription
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, RequestError>> + Send + 'static,
    {
        let store = self.clone();
        let (cancel_tx, mut cancel_rx) = broadcast::channel(1);
        let mut invalidations = self.invalidations.subscribe();
        let join = tokio::spawn(async move {
            {
                let mut slots = store.slots.lock().await;
                slots.entry(key.clone()).or_default().subscribers += 1;
            }
            let fetcher = Arc::new(fetcher);
            store.spawn_refresh(&key, &fetcher, &options);

            let mut ticker = options.refresh_interval.map(|period| {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                ticker
            });
            loop {
                tokio::select! {
                    _ = cancel_rx.recv() => break,
                    _ = next_tick(&mut ticker) => {
                        store.spawn_refresh(&key, &fetcher, &options);
                    }
                    invalidated = invalidations.recv() => match invalidated {
                        Ok(other) if other == key => {
                            store.spawn_refresh(&key, &fetcher, &options);
                            // The immediate refetch stands in for this
                            // cycle's periodic one.
                            if let Some(ticker) = &mut ticker {
                                ticker.reset();
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, key = %key, "subscription lagged behind invalidations");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            let mut slots = store.slots.lock().await;
            if let Some(slot) = slots.get_mut(&key) {
                slot.subscribers = slot.subscribers.saturating_sub(1);
            }
        });
        QuerySubscription {
            cancel_tx,
            join: Some(join),
        }
    }

    fn spawn_refresh<F, Fut>(&self, key: &QueryKey, fetcher: &Arc<F>, options: &QueryOptions)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, RequestError>> + Send + 'static,
    {
        let store = self.clone();
        let key = key.clone();
        let fetcher = fetcher.clone();
        let options = options.clone();
        tokio::spawn(async move {
            let _ = store
                .refresh_inner(&key, move || fetcher(), &options, true)
                .await;
        });
    }
}

async fn next_tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Handle to an active periodic query; dropping it cancels the refresh
/// timer immediately.
pub struct QuerySubscription {
    cancel_tx: broadcast::Sender<()>,
    join: Option<JoinHandle<()>>,
}

impl QuerySubscription {
    pub async fn stop(mut self) -> Result<(), RequestError> {
        let _ = self.cancel_tx.send(());
        if let Some(join) = self.join.take() {
            join.await?;
        }
        Ok(())
    }
}

impl Drop for QuerySubscription {
    fn drop(&mut self) {
        let _ = self.cancel_tx.send(());
    }
}
