//! Environment-driven configuration.

use std::time::Duration;

const DEFAULT_EXCHANGE_API_URL: &str = "https://dolarapi.com/v1/dolares";
const DEFAULT_BLUE_DOLLAR_URL: &str = "https://dolarapi.com/v1/dolares/blue";
const DEFAULT_VENEZUELA_URL: &str = "https://pydolarve.org/api/v1/dollar?monitor=enparalelovzla";
const DEFAULT_COLOMBIA_TRM_URL: &str =
    "https://www.datos.gov.co/resource/32sa-8pi3.json?$limit=1&$order=vigenciadesde DESC";
const DEFAULT_REMITTANCE_API_URL: &str = "https://criptoya.com/api/binancep2p";

#[derive(Debug, Clone)]
pub struct Config {
    pub exchange_api_url: String,
    pub blue_dollar_url: String,
    pub venezuela_url: String,
    pub colombia_trm_url: String,
    /// Base URL; per-currency quotes live at `{base}/USDT/{fiat}/0.1`.
    pub remittance_api_url: String,
    /// General feed refresh cadence (5 minutes).
    pub refresh_interval: Duration,
    /// Blue-dollar shared store refresh cadence (30 minutes; that feed is
    /// less volatile than the rest).
    pub blue_refresh_interval: Duration,
    /// Wait between the critical and secondary remittance bursts.
    pub staged_delay: Duration,
    /// Attempt budget per fetch.
    pub fetch_attempts: u32,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        Self {
            exchange_api_url: env_or("EXCHANGE_API_URL", DEFAULT_EXCHANGE_API_URL),
            blue_dollar_url: env_or("BLUE_DOLLAR_URL", DEFAULT_BLUE_DOLLAR_URL),
            venezuela_url: env_or("VENEZUELA_API_URL", DEFAULT_VENEZUELA_URL),
            colombia_trm_url: env_or("COLOMBIA_TRM_URL", DEFAULT_COLOMBIA_TRM_URL),
            remittance_api_url: env_or("REMITTANCE_API_URL", DEFAULT_REMITTANCE_API_URL),
            refresh_interval: Duration::from_secs(env_parsed("REFRESH_INTERVAL_SECS", 300)),
            blue_refresh_interval: Duration::from_secs(env_parsed(
                "BLUE_REFRESH_INTERVAL_SECS",
                1800,
            )),
            staged_delay: Duration::from_millis(env_parsed("STAGED_DELAY_MS", 500)),
            fetch_attempts: env_parsed("FETCH_ATTEMPTS", 3) as u32,
        }
    }

    /// Remittance-feed quote URL for one fiat currency.
    pub fn remittance_quote_url(&self, fiat: &str) -> String {
        format!("{}/USDT/{}/0.1", self.remittance_api_url, fiat)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exchange_api_url: DEFAULT_EXCHANGE_API_URL.to_string(),
            blue_dollar_url: DEFAULT_BLUE_DOLLAR_URL.to_string(),
            venezuela_url: DEFAULT_VENEZUELA_URL.to_string(),
            colombia_trm_url: DEFAULT_COLOMBIA_TRM_URL.to_string(),
            remittance_api_url: DEFAULT_REMITTANCE_API_URL.to_string(),
            refresh_interval: Duration::from_secs(300),
            blue_refresh_interval: Duration::from_secs(1800),
            staged_delay: Duration::from_millis(500),
            fetch_attempts: 3,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
