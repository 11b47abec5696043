//! Progressive remittance rates feed.
//!
//! A staged source over the whole stack: the critical stage needs the
//! Venezuela quote (latam feed), the blue-dollar buy quote (exchange feed)
//! and the four main USDT fiat quotes; the secondary stage adds the six
//! remaining corridors. Derivation runs on the calc worker with a
//! numerically identical in-process fallback, and the combine step appends
//! the payment-service rows.

use crate::cancel::CancelToken;
use crate::client::{FetchOutcome, RateClient};
use crate::config::Config;
use crate::derive::{derive_remittance_rates, DeriveRequest, DeriveResponse};
use crate::feeds::exchange_rates::ExchangeRatesFeed;
use crate::feeds::latam::LatamRatesFeed;
use crate::feeds::{next_deadline, secs_until, CycleGuard};
use crate::models::{Destination, HomeQuote, MarketRateSet, PairQuote, RemittanceRate};
use crate::staged::{CycleOutcome, StagedConfig, StagedLoader, StagedSource};
use crate::worker::CalcWorker;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

const QUOTE_CACHE_TTL: Duration = Duration::from_secs(600);

const CRITICAL_DESTINATIONS: &[Destination] = &[
    Destination::Colombia,
    Destination::Peru,
    Destination::Ecuador,
];

const SECONDARY_DESTINATIONS: &[Destination] = &[
    Destination::Chile,
    Destination::Brasil,
    Destination::Paraguay,
    Destination::Bolivia,
    Destination::Mexico,
    Destination::Uruguay,
];

/// Critical-stage result: prerequisites plus the first four corridors.
#[derive(Debug, Clone)]
pub struct CriticalRates {
    pub market: MarketRateSet,
    pub blue_buy: f64,
    pub peso_bid: f64,
    pub derived: DeriveResponse,
    pub rates: Vec<RemittanceRate>,
}

#[derive(Debug, Clone)]
pub struct SecondaryRates {
    pub market: MarketRateSet,
    pub rates: Vec<RemittanceRate>,
}

/// Merged view consumed by the presentation layer.
#[derive(Debug, Clone)]
pub struct CombinedRates {
    pub rates: Vec<RemittanceRate>,
    pub market: MarketRateSet,
    pub payment_services: Vec<RemittanceRate>,
}

pub struct RemittanceSource {
    client: RateClient,
    worker: Arc<CalcWorker>,
    latam: Arc<LatamRatesFeed>,
    exchange: Arc<ExchangeRatesFeed>,
    config: Config,
}

impl RemittanceSource {
    pub fn new(
        client: RateClient,
        worker: Arc<CalcWorker>,
        latam: Arc<LatamRatesFeed>,
        exchange: Arc<ExchangeRatesFeed>,
        config: Config,
    ) -> Self {
        Self {
            client,
            worker,
            latam,
            exchange,
            config,
        }
    }

    async fn quote(&self, fiat: &str, cancel: &CancelToken) -> Result<PairQuote> {
        let url = self.config.remittance_quote_url(fiat);
        let outcome = self
            .client
            .fetch_cached(&url, QUOTE_CACHE_TTL, self.config.fetch_attempts, cancel)
            .await?;
        match outcome {
            FetchOutcome::Aborted => bail!("fetch cancelled"),
            FetchOutcome::Cached(payload) | FetchOutcome::Fresh(payload) => {
                crate::models::parse_pair_quote(&payload)
                    .with_context(|| format!("bad quote for {}", fiat))
            }
        }
    }

    /// Derive through the worker; on any worker fault, fall back to the
    /// same formulas run in-process.
    async fn derive(&self, request: &DeriveRequest) -> DeriveResponse {
        match self.worker.invoke(request.clone()).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "calc worker failed, deriving in-process");
                derive_remittance_rates(request)
            }
        }
    }
}

fn destination_row(dest: Destination, derived: &DeriveResponse) -> RemittanceRate {
    RemittanceRate {
        country: dest.display_name().to_string(),
        send_rate: derived.send_rates.get(&dest).copied().flatten(),
        receive_rate: derived.receive_rates.get(&dest).copied().flatten(),
        flag_asset: dest.flag_asset().to_string(),
    }
}

#[async_trait]
impl StagedSource for RemittanceSource {
    type Critical = CriticalRates;
    type Secondary = SecondaryRates;
    type Combined = CombinedRates;

    async fn load_critical(&self, cancel: &CancelToken) -> Result<CriticalRates> {
        // Prerequisite base rates; missing data is fatal for the cycle and
        // must never be treated as zero.
        let venezuela = self
            .latam
            .venezuela_quote()
            .filter(|q| q.buy.is_some() && q.sell.is_some())
            .context("venezuelan exchange rate data is missing or incomplete")?;
        let blue_buy = self
            .exchange
            .house_buy("blue")
            .context("blue dollar quote is missing or incomplete")?;

        let (colombia, peru, argentina, ecuador) = tokio::join!(
            self.quote("COP", cancel),
            self.quote("PEN", cancel),
            self.quote("ARS", cancel),
            self.quote("USD", cancel),
        );
        let argentina = argentina?;

        let mut market = MarketRateSet {
            venezuela: Some(venezuela),
            home: Some(HomeQuote {
                bid: argentina.bid,
            }),
            ..Default::default()
        };
        market.set_pair(Destination::Colombia, colombia?);
        market.set_pair(Destination::Peru, peru?);
        market.set_pair(Destination::Ecuador, ecuador?);

        let request = DeriveRequest {
            blue_buy: Some(blue_buy),
            peso_bid: Some(argentina.bid),
            market: market.clone(),
        };
        let derived = self.derive(&request).await;

        let mut rates = vec![RemittanceRate {
            country: Destination::Venezuela.display_name().to_string(),
            // Venezuela's send rate is quoted directly by its feed.
            send_rate: venezuela.sell,
            receive_rate: derived
                .receive_rates
                .get(&Destination::Venezuela)
                .copied()
                .flatten(),
            flag_asset: Destination::Venezuela.flag_asset().to_string(),
        }];
        rates.extend(
            CRITICAL_DESTINATIONS
                .iter()
                .map(|&dest| destination_row(dest, &derived)),
        );

        Ok(CriticalRates {
            market,
            blue_buy,
            peso_bid: argentina.bid,
            derived,
            rates,
        })
    }

    async fn load_secondary(
        &self,
        critical: &CriticalRates,
        cancel: &CancelToken,
    ) -> Result<SecondaryRates> {
        let (chile, brasil, paraguay, bolivia, mexico, uruguay) = tokio::join!(
            self.quote("CLP", cancel),
            self.quote("BRL", cancel),
            self.quote("PYG", cancel),
            self.quote("BOB", cancel),
            self.quote("MXN", cancel),
            self.quote("UYU", cancel),
        );

        let mut market = MarketRateSet::default();
        market.set_pair(Destination::Chile, chile?);
        market.set_pair(Destination::Brasil, brasil?);
        market.set_pair(Destination::Paraguay, paraguay?);
        market.set_pair(Destination::Bolivia, bolivia?);
        market.set_pair(Destination::Mexico, mexico?);
        market.set_pair(Destination::Uruguay, uruguay?);

        let request = DeriveRequest {
            blue_buy: Some(critical.blue_buy),
            peso_bid: Some(critical.peso_bid),
            market: critical.market.merged_with(&market),
        };
        let derived = self.derive(&request).await;

        let rates = SECONDARY_DESTINATIONS
            .iter()
            .map(|&dest| destination_row(dest, &derived))
            .collect();

        Ok(SecondaryRates { market, rates })
    }

    fn combine(&self, critical: &CriticalRates, secondary: &SecondaryRates) -> CombinedRates {
        let market = critical.market.merged_with(&secondary.market);

        // Service rates come from the canonical derivation, not a second
        // copy of the formula. Receive is genuinely zero for these: nothing
        // can be received through them.
        let payment_services: Vec<RemittanceRate> = [Destination::Paypal, Destination::Zelle]
            .iter()
            .map(|&dest| RemittanceRate {
                country: dest.display_name().to_string(),
                send_rate: critical.derived.send_rates.get(&dest).copied().flatten(),
                receive_rate: Some(0.0),
                flag_asset: dest.flag_asset().to_string(),
            })
            .collect();

        let mut rates = critical.rates.clone();
        rates.extend(secondary.rates.iter().cloned());
        rates.extend(payment_services.iter().cloned());

        CombinedRates {
            rates,
            market,
            payment_services,
        }
    }
}

/// Snapshot exposed to the presentation layer.
#[derive(Debug, Clone)]
pub struct RemittanceSnapshot {
    pub rates: Vec<RemittanceRate>,
    pub loading: bool,
    pub secondary_loading: bool,
    pub error: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
    pub next_update_secs: u64,
}

pub struct RemittanceFeed {
    loader: Arc<StagedLoader<RemittanceSource>>,
    cycle: CycleGuard,
    refresh_interval: Duration,
    next_refresh_at: RwLock<Option<Instant>>,
}

impl RemittanceFeed {
    pub fn new(source: RemittanceSource, config: &Config) -> Self {
        let loader = Arc::new(StagedLoader::new(
            Arc::new(source),
            StagedConfig {
                delay: config.staged_delay,
                refresh_interval: None,
            },
        ));
        Self {
            loader,
            cycle: CycleGuard::default(),
            refresh_interval: config.refresh_interval,
            next_refresh_at: RwLock::new(None),
        }
    }

    /// Run one staged cycle, cancelling any cycle still in flight.
    pub async fn refresh(&self) -> CycleOutcome {
        let cancel = self.cycle.begin();
        let outcome = self.loader.load_all(&cancel).await;
        if outcome != CycleOutcome::Cancelled {
            *self.next_refresh_at.write() = Some(next_deadline(self.refresh_interval));
        } else {
            debug!("remittance refresh superseded");
        }
        outcome
    }

    pub fn snapshot(&self) -> RemittanceSnapshot {
        let state = self.loader.state();
        // Combined view when both halves have landed, critical rows while
        // the secondary burst is still out, nothing before first load.
        let rates = state
            .combined
            .as_ref()
            .map(|c| c.rates.clone())
            .or_else(|| state.critical.as_ref().map(|c| c.rates.clone()))
            .unwrap_or_default();

        RemittanceSnapshot {
            rates,
            loading: state.critical_loading,
            secondary_loading: state.secondary_loading,
            error: state.critical_error,
            last_updated: state.last_update,
            next_update_secs: secs_until(*self.next_refresh_at.read()),
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
                    _ = ticker.tick() => {
                        feed.refresh().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResponseCache;
    use crate::client::{HttpTransport, TransportResponse};
    use async_trait::async_trait;

    /// Routes stubbed quotes by URL fragment.
    struct RouteStub;

    #[async_trait]
    impl HttpTransport for RouteStub {
        async fn get(&self, url: &str) -> Result<TransportResponse> {
            let body = if url.contains("/USDT/COP/") {
                r#"{"bid": 4000.0, "ask": 4100.0}"#
            } else if url.contains("/USDT/PEN/") {
                r#"{"bid": 3.7, "ask": 3.8}"#
            } else if url.contains("/USDT/ARS/") {
                r#"{"bid": 1000.0, "ask": 1015.0}"#
            } else if url.contains("/USDT/USD/") {
                r#"{"bid": 1.0, "ask": 1.02}"#
            } else if url.contains("/USDT/CLP/") {
                r#"{"bid": 950.0, "ask": 980.0}"#
            } else if url.contains("/USDT/BRL/") {
                r#"{"bid": 5.1, "ask": 5.3}"#
            } else if url.contains("/USDT/PYG/") {
                r#"{"bid": 7300.0, "ask": 7450.0}"#
            } else if url.contains("/USDT/BOB/") {
                r#"{"bid": 6.9, "ask": 7.1}"#
            } else if url.contains("/USDT/MXN/") {
                r#"{"bid": 17.0, "ask": 17.4}"#
            } else if url.contains("/USDT/UYU/") {
                r#"{"bid": 39.0, "ask": 40.0}"#
            } else if url.contains("pydolarve") {
                r#"{"price": 36.5}"#
            } else if url.contains("datos.gov.co") {
                r#"[{"valor": "4000.0"}]"#
            } else if url.ends_with("/blue") {
                r#"{"casa":"blue","nombre":"Blue","compra":1200.0,"venta":1250.0,
                    "fechaActualizacion":"2024-05-01T12:00:00.000Z"}"#
            } else {
                r#"[{"casa":"blue","nombre":"Blue","compra":1200.0,"venta":1250.0,
                     "fechaActualizacion":"2024-05-01T12:00:00.000Z"}]"#
            };
            Ok(TransportResponse {
                status: 200,
                body: body.to_string(),
            })
        }
    }

    async fn source_with_data(worker: Arc<CalcWorker>) -> RemittanceSource {
        let client = RateClient::with_transport(Arc::new(RouteStub), Arc::new(ResponseCache::new()));
        let config = Config::default();
        let latam = Arc::new(LatamRatesFeed::new(client.clone(), &config));
        let exchange = Arc::new(ExchangeRatesFeed::new(client.clone(), &config));
        latam.refresh().await;
        exchange.refresh().await;
        RemittanceSource::new(client, worker, latam, exchange, config)
    }

    #[tokio::test(start_paused = true)]
    async fn critical_fails_without_prerequisites() {
        let client =
            RateClient::with_transport(Arc::new(RouteStub), Arc::new(ResponseCache::new()));
        let config = Config::default();
        // Feeds never refreshed: no Venezuela quote, no blue buy.
        let latam = Arc::new(LatamRatesFeed::new(client.clone(), &config));
        let exchange = Arc::new(ExchangeRatesFeed::new(client.clone(), &config));
        let source = RemittanceSource::new(client, CalcWorker::spawn(), latam, exchange, config);

        let err = source
            .load_critical(&CancelToken::new())
            .await
            .expect_err("missing prerequisites must be fatal");
        assert!(err.to_string().contains("missing or incomplete"));
    }

    #[tokio::test(start_paused = true)]
    async fn full_staged_cycle_produces_all_rows() {
        let worker = CalcWorker::spawn();
        let source = source_with_data(Arc::clone(&worker)).await;
        let feed = RemittanceFeed::new(source, &Config::default());

        assert_eq!(feed.refresh().await, CycleOutcome::Loaded);

        let snapshot = feed.snapshot();
        // Venezuela + 3 critical + 6 secondary + PayPal + Zelle.
        assert_eq!(snapshot.rates.len(), 12);
        assert!(snapshot.error.is_none());

        let colombia = snapshot
            .rates
            .iter()
            .find(|r| r.country == "Colombia")
            .unwrap();
        // bid 4000, fee 3.3%, blue buy 1200.
        assert_eq!(colombia.send_rate, Some(4000.0 * (1.0 - 0.033) / 1200.0));
        // peso bid 1000, ask 4100, spread 5%.
        assert_eq!(colombia.receive_rate, Some(1000.0 * 4100.0 * 0.95));

        let paypal = snapshot.rates.iter().find(|r| r.country == "PayPal").unwrap();
        assert_eq!(paypal.send_rate, Some(1200.0 * 0.88));
        assert_eq!(paypal.receive_rate, Some(0.0));
        worker.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn worker_fault_falls_back_to_identical_in_process_result() {
        let healthy = CalcWorker::spawn();
        let source = source_with_data(Arc::clone(&healthy)).await;
        let feed = RemittanceFeed::new(source, &Config::default());
        assert_eq!(feed.refresh().await, CycleOutcome::Loaded);
        let with_worker = feed.snapshot();
        healthy.shutdown();

        let broken = CalcWorker::spawn();
        broken.shutdown();
        tokio::task::yield_now().await;
        let source = source_with_data(Arc::clone(&broken)).await;
        let feed = RemittanceFeed::new(source, &Config::default());
        assert_eq!(feed.refresh().await, CycleOutcome::Loaded);
        let with_fallback = feed.snapshot();

        assert_eq!(with_worker.rates, with_fallback.rates);
    }
}
