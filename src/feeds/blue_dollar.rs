//! Shared blue-dollar sell-rate store.
//!
//! Several unrelated consumers need the blue-dollar sell rate; this store
//! exists so they share one result instead of issuing redundant fetches. It
//! keeps its own 30 minute TTL on top of the request cache's 10 minute TTL
//! (the feed is far less volatile than the 5 minute general cadence), and
//! guards against concurrent refreshes with an in-flight flag.

use crate::cancel::CancelToken;
use crate::client::{FetchOutcome, RateClient};
use crate::models::parse_house_quote;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Store-level staleness bound.
pub const BLUE_FEED_TTL: Duration = Duration::from_secs(1800);
/// Request-cache TTL, shorter than the feed TTL so a manual refresh can
/// still reach the network.
const BLUE_REQUEST_CACHE_TTL: Duration = Duration::from_secs(600);
const FETCH_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Default)]
struct BlueState {
    sell: Option<f64>,
    last_update: Option<Instant>,
    error: Option<String>,
}

/// Snapshot exposed to consumers: `{sellRate, isLoading, error}`.
#[derive(Debug, Clone)]
pub struct BlueDollarSnapshot {
    pub sell_rate: Option<f64>,
    pub is_loading: bool,
    pub error: Option<String>,
}

pub struct BlueDollarStore {
    client: RateClient,
    url: String,
    state: RwLock<BlueState>,
    in_flight: AtomicBool,
}

impl BlueDollarStore {
    pub fn new(client: RateClient, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            state: RwLock::new(BlueState::default()),
            in_flight: AtomicBool::new(false),
        }
    }

    fn should_fetch(&self) -> bool {
        let state = self.state.read();
        match (state.sell, state.last_update) {
            (Some(_), Some(at)) => at.elapsed() > BLUE_FEED_TTL,
            _ => true,
        }
    }

    /// Refresh the shared value. A refresh already in flight wins; callers
    /// simply keep the current value.
    pub async fn refresh(&self, cancel: &CancelToken) {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("blue-dollar refresh already in flight");
            return;
        }

        let result = self
            .client
            .fetch_cached(&self.url, BLUE_REQUEST_CACHE_TTL, FETCH_ATTEMPTS, cancel)
            .await;

        match result {
            Ok(FetchOutcome::Aborted) => {
                debug!("blue-dollar fetch aborted, keeping current value");
            }
            Ok(FetchOutcome::Cached(payload)) | Ok(FetchOutcome::Fresh(payload)) => {
                match parse_house_quote(&payload) {
                    Ok(rate) => {
                        let mut state = self.state.write();
                        state.sell = rate.sell;
                        state.last_update = Some(Instant::now());
                        state.error = None;
                    }
                    Err(e) => {
                        warn!(error = %e, "blue-dollar payload invalid");
                        self.state.write().error = Some(e.to_string());
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "blue-dollar fetch failed");
                self.state.write().error = Some(e.to_string());
            }
        }

        self.in_flight.store(false, Ordering::Release);
    }

    /// Current sell rate, refreshing first if the stored value is stale.
    pub async fn sell_rate(&self, cancel: &CancelToken) -> Option<f64> {
        if self.should_fetch() {
            self.refresh(cancel).await;
        }
        self.state.read().sell
    }

    pub fn snapshot(&self) -> BlueDollarSnapshot {
        let state = self.state.read();
        BlueDollarSnapshot {
            sell_rate: state.sell,
            is_loading: self.in_flight.load(Ordering::Acquire),
            error: state.error.clone(),
        }
    }

    /// Periodic refresh loop honoring the store TTL.
    pub fn spawn_auto_refresh(self: &Arc<Self>, shutdown: CancelToken) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(BLUE_FEED_TTL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if store.should_fetch() {
                            store.refresh(&shutdown).await;
                        }
                    }
                }
            }
        })
    }
}

static GLOBAL_BLUE_DOLLAR: OnceLock<Arc<BlueDollarStore>> = OnceLock::new();

/// Process-wide store shared by every consumer of the blue-dollar rate.
pub fn global_blue_dollar(client: &RateClient, url: &str) -> Arc<BlueDollarStore> {
    Arc::clone(
        GLOBAL_BLUE_DOLLAR
            .get_or_init(|| Arc::new(BlueDollarStore::new(client.clone(), url))),
    )
}
