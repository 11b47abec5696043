//! Exchange-rate house list feed (`/dolares`).

use crate::cancel::CancelToken;
use crate::client::{FetchOutcome, RateClient};
use crate::config::Config;
use crate::feeds::{next_deadline, secs_until, CycleGuard};
use crate::models::{parse_house_quotes, Rate};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Default)]
struct FeedState {
    rates: Vec<Rate>,
    loading: bool,
    error: Option<String>,
    last_update: Option<DateTime<Utc>>,
    next_refresh_at: Option<Instant>,
}

/// Snapshot exposed to consumers.
#[derive(Debug, Clone)]
pub struct RatesSnapshot {
    pub rates: Vec<Rate>,
    pub loading: bool,
    pub error: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
    pub next_update_secs: u64,
}

pub struct ExchangeRatesFeed {
    client: RateClient,
    url: String,
    refresh_interval: Duration,
    attempts: u32,
    state: RwLock<FeedState>,
    cycle: CycleGuard,
}

impl ExchangeRatesFeed {
    pub fn new(client: RateClient, config: &Config) -> Self {
        Self {
            client,
            url: config.exchange_api_url.clone(),
            refresh_interval: config.refresh_interval,
            attempts: config.fetch_attempts,
            state: RwLock::new(FeedState::default()),
            cycle: CycleGuard::default(),
        }
    }

    /// Refresh the house list. Any previous in-flight cycle is cancelled
    /// first so a stale response can never overwrite a fresher one.
    pub async fn refresh(&self) {
        let cancel = self.cycle.begin();
        {
            let mut state = self.state.write();
            state.loading = true;
            state.error = None;
        }

        let result = self
            .client
            .fetch_cached(&self.url, CACHE_TTL, self.attempts, &cancel)
            .await;

        match result {
            Ok(FetchOutcome::Aborted) => {
                // A newer cycle owns the state now; leave it alone.
                debug!("exchange-rate refresh aborted");
            }
            Ok(FetchOutcome::Cached(payload)) | Ok(FetchOutcome::Fresh(payload)) => {
                match parse_house_quotes(&payload) {
                    Ok(rates) => {
                        info!(houses = rates.len(), "exchange rates updated");
                        let mut state = self.state.write();
                        state.rates = rates;
                        state.loading = false;
                        state.last_update = Some(Utc::now());
                        state.next_refresh_at = Some(next_deadline(self.refresh_interval));
                    }
                    Err(e) => {
                        // Structurally invalid payload: terminal for this
                        // cycle, previous rates retained.
                        error!(error = %e, "exchange-rate payload invalid");
                        let mut state = self.state.write();
                        state.loading = false;
                        state.error = Some("exchange rates are currently unavailable".into());
                    }
                }
            }
            Err(e) => {
                if cancel.is_cancelled() {
                    debug!("exchange-rate refresh cancelled");
                    return;
                }
                warn!(error = %e, "exchange-rate fetch failed");
                let mut state = self.state.write();
                state.loading = false;
                state.error = Some("exchange rates are currently unavailable".into());
            }
        }
    }

    /// Buy quote of one house, by key (e.g. "blue").
    pub fn house_buy(&self, house: &str) -> Option<f64> {
        self.state
            .read()
            .rates
            .iter()
            .find(|r| r.house == house)
            .and_then(|r| r.buy)
    }

    pub fn snapshot(&self) -> RatesSnapshot {
        let state = self.state.read();
        RatesSnapshot {
            rates: state.rates.clone(),
            loading: state.loading,
            error: state.error.clone(),
            last_updated: state.last_update,
            next_update_secs: secs_until(state.next_refresh_at),
        }
    }

    pub fn spawn_auto_refresh(self: &Arc<Self>, shutdown: CancelToken) -> JoinHandle<()> {
        let feed = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(feed.refresh_interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        feed.cycle.cancel_current();
                        break;
                    }
                    _ = ticker.tick() => feed.refresh().await,
                }
            }
        })
    }
}
