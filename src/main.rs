//! DolarCambio rates runner.
//!
//! Boots the shared fetch stack, spawns the calc worker and the four live
//! feeds, then logs snapshots on a fixed cadence until Ctrl-C.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dolarcambio_core::{
    cache::ResponseCache,
    cancel::CancelToken,
    client::RateClient,
    config::Config,
    feeds::{
        blue_dollar::{global_blue_dollar, BlueDollarStore},
        exchange_rates::ExchangeRatesFeed,
        latam::LatamRatesFeed,
        remittance::{RemittanceFeed, RemittanceSource},
    },
    worker::CalcWorker,
};

#[derive(Parser, Debug)]
#[command(name = "dolarcambio")]
#[command(about = "DolarCambio rates core - fetch, derive and report exchange rates")]
struct Args {
    /// Seconds between snapshot reports
    #[arg(long, env = "REPORT_INTERVAL_SECS", default_value = "60")]
    report_interval_secs: u64,

    /// Run one full refresh cycle and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    let config = Config::from_env();

    info!(
        exchange_api = %config.exchange_api_url,
        remittance_api = %config.remittance_api_url,
        refresh_secs = config.refresh_interval.as_secs(),
        "starting rates core"
    );

    let cache = Arc::new(ResponseCache::new());
    let client = RateClient::new(cache);
    let worker = CalcWorker::spawn();

    let blue = global_blue_dollar(&client, &config.blue_dollar_url);
    let exchange = Arc::new(ExchangeRatesFeed::new(client.clone(), &config));
    let latam = Arc::new(LatamRatesFeed::new(client.clone(), &config));
    let remittance = Arc::new(RemittanceFeed::new(
        RemittanceSource::new(
            client.clone(),
            Arc::clone(&worker),
            Arc::clone(&latam),
            Arc::clone(&exchange),
            config.clone(),
        ),
        &config,
    ));

    // Prime everything once before the refresh loops take over. The
    // remittance feed needs the other two populated first.
    exchange.refresh().await;
    latam.refresh().await;
    blue.refresh(&CancelToken::new()).await;
    remittance.refresh().await;
    report(&blue, &exchange, &latam, &remittance);

    if args.once {
        worker.shutdown();
        return Ok(());
    }

    let shutdown = CancelToken::new();
    let mut tasks = vec![
        blue.spawn_auto_refresh(shutdown.clone()),
        exchange.spawn_auto_refresh(shutdown.clone()),
        latam.spawn_auto_refresh(shutdown.clone()),
        remittance.spawn_auto_refresh(shutdown.clone()),
    ];

    let reporter = {
        let blue = Arc::clone(&blue);
        let exchange = Arc::clone(&exchange);
        let latam = Arc::clone(&latam);
        let remittance = Arc::clone(&remittance);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(args.report_interval_secs.max(1)));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => report(&blue, &exchange, &latam, &remittance),
                }
            }
        })
    };
    tasks.push(reporter);

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    shutdown.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "background task ended abnormally");
        }
    }
    worker.shutdown();

    Ok(())
}

fn report(
    blue: &BlueDollarStore,
    exchange: &ExchangeRatesFeed,
    latam: &LatamRatesFeed,
    remittance: &RemittanceFeed,
) {
    let shared_blue = blue.snapshot();
    info!(
        sell = ?shared_blue.sell_rate,
        loading = shared_blue.is_loading,
        error = shared_blue.error.as_deref().unwrap_or("none"),
        "blue dollar (shared store)"
    );

    let rates = exchange.snapshot();
    info!(
        houses = rates.rates.len(),
        error = rates.error.as_deref().unwrap_or("none"),
        next_update_secs = rates.next_update_secs,
        "exchange rates"
    );
    for rate in &rates.rates {
        info!(
            house = %rate.house,
            buy = ?rate.buy,
            sell = ?rate.sell,
            "house quote"
        );
    }

    let latam = latam.snapshot();
    for rate in &latam.rates {
        info!(house = %rate.house, buy = ?rate.buy, sell = ?rate.sell, "latam quote");
    }

    let remesas = remittance.snapshot();
    info!(
        destinations = remesas.rates.len(),
        secondary_loading = remesas.secondary_loading,
        error = remesas.error.as_deref().unwrap_or("none"),
        "remittance rates"
    );
    for rate in &remesas.rates {
        info!(
            country = %rate.country,
            send = ?rate.send_rate,
            receive = ?rate.receive_rate,
            "remittance"
        );
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dolarcambio_core=debug,dolarcambio=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
