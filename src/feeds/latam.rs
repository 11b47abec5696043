//! Latam display rates: Venezuela paralelo + Colombia TRM, anchored on the
//! blue dollar.
//!
//! Three independent upstream feeds are batch-fetched under one cancellation
//! token per cycle. Derived values:
//! - Venezuela buy  = paralelo price (VES per USD)
//! - Venezuela sell = `paralelo * 0.93 / blue_sell` (remittance price in ARS)
//! - Colombia buy/sell = TRM * 0.97 / TRM * 1.01

use crate::cancel::CancelToken;
use crate::client::RateClient;
use crate::config::Config;
use crate::feeds::{next_deadline, secs_until, CycleGuard};
use crate::models::{parse_house_quote, Rate, RetailQuote};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const CACHE_TTL: Duration = Duration::from_secs(300);

const VENEZUELA_REMITTANCE_DISCOUNT: f64 = 0.93;
const COLOMBIA_BUY_FACTOR: f64 = 0.97;
const COLOMBIA_SELL_FACTOR: f64 = 1.01;

/// Paralelo monitor payload (`{"price": ...}`).
#[derive(Debug, Deserialize)]
struct VenezuelaMonitor {
    price: f64,
}

/// TRM rows arrive with the value as a string.
#[derive(Debug, Deserialize)]
struct TrmRow {
    valor: String,
}

#[derive(Debug, Clone, Default)]
struct LatamState {
    rates: Vec<Rate>,
    loading: bool,
    error: Option<String>,
    last_update: Option<DateTime<Utc>>,
    next_refresh_at: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct LatamSnapshot {
    pub rates: Vec<Rate>,
    pub loading: bool,
    pub error: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
    pub next_update_secs: u64,
}

pub struct LatamRatesFeed {
    client: RateClient,
    venezuela_url: String,
    colombia_trm_url: String,
    blue_url: String,
    refresh_interval: Duration,
    attempts: u32,
    state: RwLock<LatamState>,
    cycle: CycleGuard,
}

impl LatamRatesFeed {
    pub fn new(client: RateClient, config: &Config) -> Self {
        Self {
            client,
            venezuela_url: config.venezuela_url.clone(),
            colombia_trm_url: config.colombia_trm_url.clone(),
            blue_url: config.blue_dollar_url.clone(),
            refresh_interval: config.refresh_interval,
            attempts: config.fetch_attempts,
            state: RwLock::new(LatamState::default()),
            cycle: CycleGuard::default(),
        }
    }

    pub async fn refresh(&self) {
        let cancel = self.cycle.begin();
        {
            let mut state = self.state.write();
            state.loading = true;
            state.error = None;
        }

        match self.fetch_cycle(&cancel).await {
            Ok(Some(rates)) => {
                info!(rates = rates.len(), "latam rates updated");
                let mut state = self.state.write();
                state.rates = rates;
                state.loading = false;
                state.last_update = Some(Utc::now());
                state.next_refresh_at = Some(next_deadline(self.refresh_interval));
            }
            Ok(None) => {
                debug!("latam refresh aborted");
            }
            Err(e) => {
                if cancel.is_cancelled() {
                    debug!("latam refresh cancelled");
                    return;
                }
                warn!(error = %e, "latam refresh failed");
                // Last known good rates are retained.
                let mut state = self.state.write();
                state.loading = false;
                state.error = Some("latam rates are currently unavailable".into());
            }
        }
    }

    /// One batch cycle. `Ok(None)` means the cycle was aborted.
    async fn fetch_cycle(&self, cancel: &CancelToken) -> Result<Option<Vec<Rate>>> {
        let (venezuela, colombia, blue) = tokio::join!(
            self.client
                .fetch_cached(&self.venezuela_url, CACHE_TTL, self.attempts, cancel),
            self.client
                .fetch_cached(&self.colombia_trm_url, CACHE_TTL, self.attempts, cancel),
            self.client
                .fetch_cached(&self.blue_url, CACHE_TTL, self.attempts, cancel),
        );
        let (venezuela, colombia, blue) = (venezuela?, colombia?, blue?);

        if venezuela.is_aborted() || colombia.is_aborted() || blue.is_aborted() {
            return Ok(None);
        }

        let rates = derive_latam_rates(
            venezuela.payload().context("missing venezuela payload")?,
            colombia.payload().context("missing colombia payload")?,
            blue.payload().context("missing blue payload")?,
        )?;
        Ok(Some(rates))
    }

    /// Venezuela quote in retail shape, for the remittance feed.
    pub fn venezuela_quote(&self) -> Option<RetailQuote> {
        self.state
            .read()
            .rates
            .iter()
            .find(|r| r.house == "venezuela")
            .map(|r| RetailQuote {
                buy: r.buy,
                sell: r.sell,
            })
    }

    pub fn snapshot(&self) -> LatamSnapshot {
        let state = self.state.read();
        LatamSnapshot {
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

/// Derive the two display rows from the three raw payloads. Fails on a
/// structurally incomplete payload (terminal for the cycle, not retried).
fn derive_latam_rates(venezuela: &Value, colombia: &Value, blue: &Value) -> Result<Vec<Rate>> {
    let monitor: VenezuelaMonitor = serde_json::from_value(venezuela.clone())
        .context("invalid venezuela monitor payload")?;
    let trm_rows: Vec<TrmRow> =
        serde_json::from_value(colombia.clone()).context("invalid colombia TRM payload")?;
    let blue_rate = parse_house_quote(blue)?;

    let trm: f64 = match trm_rows.first() {
        Some(row) => row
            .valor
            .parse()
            .with_context(|| format!("non-numeric TRM value: {}", row.valor))?,
        None => bail!("colombia TRM payload contained no rows"),
    };

    let paralelo = monitor.price;
    // Absent or zero blue sell leaves the remittance price absent.
    let remittance_price = blue_rate
        .sell
        .filter(|v| *v != 0.0)
        .map(|blue_sell| paralelo * VENEZUELA_REMITTANCE_DISCOUNT / blue_sell);

    let now = Utc::now().to_rfc3339();
    Ok(vec![
        Rate {
            house: "venezuela".into(),
            label: "Venezuela".into(),
            buy: Some(paralelo),
            sell: remittance_price,
            as_of: now.clone(),
            buy_change_pct: None,
            sell_change_pct: None,
        },
        Rate {
            house: "colombia".into(),
            label: "Colombia".into(),
            buy: Some(trm * COLOMBIA_BUY_FACTOR),
            sell: Some(trm * COLOMBIA_SELL_FACTOR),
            as_of: now,
            buy_change_pct: None,
            sell_change_pct: None,
        },
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn blue_payload(venta: Option<f64>) -> Value {
        json!({
            "casa": "blue",
            "nombre": "Blue",
            "compra": 1200.0,
            "venta": venta,
            "fechaActualizacion": "2024-05-01T12:00:00.000Z",
        })
    }

    #[test]
    fn derives_both_display_rows() {
        let rates = derive_latam_rates(
            &json!({"price": 36.5}),
            &json!([{"valor": "4000.0"}]),
            &blue_payload(Some(1250.0)),
        )
        .unwrap();

        assert_eq!(rates.len(), 2);
        assert_eq!(rates[0].house, "venezuela");
        assert_eq!(rates[0].buy, Some(36.5));
        assert_eq!(rates[0].sell, Some(36.5 * 0.93 / 1250.0));
        assert_eq!(rates[1].house, "colombia");
        assert_eq!(rates[1].buy, Some(4000.0 * 0.97));
        assert_eq!(rates[1].sell, Some(4000.0 * 1.01));
    }

    #[test]
    fn missing_blue_sell_leaves_remittance_price_absent() {
        let rates = derive_latam_rates(
            &json!({"price": 36.5}),
            &json!([{"valor": "4000.0"}]),
            &blue_payload(None),
        )
        .unwrap();
        assert_eq!(rates[0].sell, None);
    }

    #[test]
    fn empty_trm_rows_is_terminal() {
        let result = derive_latam_rates(
            &json!({"price": 36.5}),
            &json!([]),
            &blue_payload(Some(1250.0)),
        );
        assert!(result.is_err());
    }

    #[test]
    fn non_numeric_trm_is_terminal() {
        let result = derive_latam_rates(
            &json!({"price": 36.5}),
            &json!([{"valor": "N/A"}]),
            &blue_payload(Some(1250.0)),
        );
        assert!(result.is_err());
    }
}
