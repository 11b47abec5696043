//! Core data model: quoted rates, remittance records, market rate sets,
//! and upstream payload validation.
//!
//! Invariant held throughout: an absent quote is `None`, never `0.0`. Zero is
//! a valid price for some instruments and must not be conflated with missing
//! data.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// A quoted price pair for one currency house (e.g. "blue", "oficial").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rate {
    pub house: String,
    pub label: String,
    pub buy: Option<f64>,
    pub sell: Option<f64>,
    /// ISO 8601 timestamp of the quote.
    pub as_of: String,
    pub buy_change_pct: Option<f64>,
    pub sell_change_pct: Option<f64>,
}

/// Derived cross-border transfer record for one destination.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemittanceRate {
    pub country: String,
    pub send_rate: Option<f64>,
    pub receive_rate: Option<f64>,
    /// Opaque reference to a visual asset; the core never interprets it.
    pub flag_asset: String,
}

/// Market-maker quote: price to buy (bid) and sell (ask) a unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PairQuote {
    pub bid: f64,
    pub ask: f64,
}

/// Retail-facing quote direction (compra/venta). Venezuela quotes arrive in
/// this shape instead of bid/ask.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RetailQuote {
    pub buy: Option<f64>,
    pub sell: Option<f64>,
}

/// Home-currency upstream quote carries only a bid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HomeQuote {
    pub bid: f64,
}

/// Remittance destination key. Ordered so derived mappings iterate
/// deterministically.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    Venezuela,
    Colombia,
    Peru,
    Ecuador,
    Brasil,
    Chile,
    Paraguay,
    Bolivia,
    Mexico,
    Uruguay,
    Paypal,
    Zelle,
}

impl Destination {
    /// Destinations with a sendable rate (everything but Venezuela, which is
    /// quoted directly by its own feed).
    pub const SEND: &'static [Destination] = &[
        Destination::Colombia,
        Destination::Peru,
        Destination::Ecuador,
        Destination::Brasil,
        Destination::Chile,
        Destination::Paraguay,
        Destination::Bolivia,
        Destination::Mexico,
        Destination::Uruguay,
        Destination::Paypal,
        Destination::Zelle,
    ];

    /// Destinations with a receivable rate (payment services excluded).
    pub const RECEIVE: &'static [Destination] = &[
        Destination::Venezuela,
        Destination::Colombia,
        Destination::Peru,
        Destination::Ecuador,
        Destination::Brasil,
        Destination::Chile,
        Destination::Paraguay,
        Destination::Bolivia,
        Destination::Mexico,
        Destination::Uruguay,
    ];

    pub fn display_name(&self) -> &'static str {
        match self {
            Destination::Venezuela => "Venezuela",
            Destination::Colombia => "Colombia",
            Destination::Peru => "Perú",
            Destination::Ecuador => "Ecuador",
            Destination::Brasil => "Brasil",
            Destination::Chile => "Chile",
            Destination::Paraguay => "Paraguay",
            Destination::Bolivia => "Bolivia",
            Destination::Mexico => "México",
            Destination::Uruguay => "Uruguay",
            Destination::Paypal => "PayPal",
            Destination::Zelle => "Zelle",
        }
    }

    pub fn flag_asset(&self) -> &'static str {
        match self {
            Destination::Venezuela => "/flags/venezuela.svg",
            Destination::Colombia => "/flags/colombia.svg",
            Destination::Peru => "/flags/peru.svg",
            Destination::Ecuador => "/flags/ecuador.svg",
            Destination::Brasil => "/flags/brasil.svg",
            Destination::Chile => "/flags/chile.svg",
            Destination::Paraguay => "/flags/paraguay.svg",
            Destination::Bolivia => "/flags/bolivia.svg",
            Destination::Mexico => "/flags/mexico.svg",
            Destination::Uruguay => "/flags/uruguay.svg",
            Destination::Paypal => "/flags/paypal.svg",
            Destination::Zelle => "/flags/zelle.svg",
        }
    }
}

/// Quotes collected from the independent upstream feeds. Any field may be
/// absent: feeds fail and refresh independently of each other.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketRateSet {
    pub venezuela: Option<RetailQuote>,
    pub colombia: Option<PairQuote>,
    pub peru: Option<PairQuote>,
    pub ecuador: Option<PairQuote>,
    pub brasil: Option<PairQuote>,
    pub chile: Option<PairQuote>,
    pub paraguay: Option<PairQuote>,
    pub bolivia: Option<PairQuote>,
    pub mexico: Option<PairQuote>,
    pub uruguay: Option<PairQuote>,
    /// Home-currency (ARS per USDT) quote from the remittance feed.
    pub home: Option<HomeQuote>,
}

impl MarketRateSet {
    /// Bid/ask quote for a pair-quoted destination. `None` both when the
    /// quote has not arrived and when the destination has no pair quote
    /// (Venezuela, payment services).
    pub fn pair(&self, dest: Destination) -> Option<PairQuote> {
        match dest {
            Destination::Colombia => self.colombia,
            Destination::Peru => self.peru,
            Destination::Ecuador => self.ecuador,
            Destination::Brasil => self.brasil,
            Destination::Chile => self.chile,
            Destination::Paraguay => self.paraguay,
            Destination::Bolivia => self.bolivia,
            Destination::Mexico => self.mexico,
            Destination::Uruguay => self.uruguay,
            _ => None,
        }
    }

    pub fn set_pair(&mut self, dest: Destination, quote: PairQuote) {
        match dest {
            Destination::Colombia => self.colombia = Some(quote),
            Destination::Peru => self.peru = Some(quote),
            Destination::Ecuador => self.ecuador = Some(quote),
            Destination::Brasil => self.brasil = Some(quote),
            Destination::Chile => self.chile = Some(quote),
            Destination::Paraguay => self.paraguay = Some(quote),
            Destination::Bolivia => self.bolivia = Some(quote),
            Destination::Mexico => self.mexico = Some(quote),
            Destination::Uruguay => self.uruguay = Some(quote),
            _ => {}
        }
    }

    /// Overlay `other` onto `self`, keeping existing quotes where `other`
    /// has none. Used to merge the secondary batch over the critical one.
    pub fn merged_with(&self, other: &MarketRateSet) -> MarketRateSet {
        MarketRateSet {
            venezuela: other.venezuela.or(self.venezuela),
            colombia: other.colombia.or(self.colombia),
            peru: other.peru.or(self.peru),
            ecuador: other.ecuador.or(self.ecuador),
            brasil: other.brasil.or(self.brasil),
            chile: other.chile.or(self.chile),
            paraguay: other.paraguay.or(self.paraguay),
            bolivia: other.bolivia.or(self.bolivia),
            mexico: other.mexico.or(self.mexico),
            uruguay: other.uruguay.or(self.uruguay),
            home: other.home.or(self.home),
        }
    }
}

// ============================================================================
// Upstream payload shapes
// ============================================================================

/// One house entry as returned by the exchange-rate API
/// (`casa`/`nombre`/`compra`/`venta` wire names).
#[derive(Debug, Clone, Deserialize)]
pub struct HouseQuote {
    pub casa: String,
    pub nombre: String,
    pub compra: Option<f64>,
    pub venta: Option<f64>,
    #[serde(rename = "fechaActualizacion")]
    pub fecha_actualizacion: String,
    #[serde(rename = "variacionCompra", default)]
    pub variacion_compra: Option<f64>,
    #[serde(rename = "variacionVenta", default)]
    pub variacion_venta: Option<f64>,
}

impl From<HouseQuote> for Rate {
    fn from(q: HouseQuote) -> Self {
        Rate {
            house: q.casa,
            label: q.nombre,
            buy: q.compra,
            sell: q.venta,
            as_of: q.fecha_actualizacion,
            buy_change_pct: q.variacion_compra,
            sell_change_pct: q.variacion_venta,
        }
    }
}

/// Parse and validate a house-quote list payload.
///
/// A payload that is not an array is structurally invalid and a terminal
/// failure for the fetch cycle (retrying will not fix the shape). Individual
/// malformed entries are filtered out with a warning, matching the tolerance
/// upstream consumers need for partially degraded feeds.
pub fn parse_house_quotes(payload: &Value) -> Result<Vec<Rate>> {
    let entries = match payload.as_array() {
        Some(entries) => entries,
        None => bail!("invalid exchange-rate payload: expected an array of house quotes"),
    };

    let mut rates = Vec::with_capacity(entries.len());
    let mut dropped = 0usize;
    for entry in entries {
        match serde_json::from_value::<HouseQuote>(entry.clone()) {
            Ok(quote) => rates.push(Rate::from(quote)),
            Err(e) => {
                dropped += 1;
                warn!(error = %e, "dropping malformed house quote");
            }
        }
    }

    if rates.is_empty() && dropped > 0 {
        bail!("invalid exchange-rate payload: every entry was malformed");
    }
    Ok(rates)
}

/// Parse a single house quote object (e.g. the blue-dollar endpoint).
pub fn parse_house_quote(payload: &Value) -> Result<Rate> {
    let quote: HouseQuote =
        serde_json::from_value(payload.clone()).context("invalid house-quote payload")?;
    Ok(Rate::from(quote))
}

/// Parse a `{bid, ask}` remittance-feed quote.
pub fn parse_pair_quote(payload: &Value) -> Result<PairQuote> {
    let quote: PairQuote = serde_json::from_value(payload.clone())
        .context("invalid bid/ask payload from remittance feed")?;
    Ok(quote)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn house(casa: &str, compra: Option<f64>, venta: Option<f64>) -> Value {
        json!({
            "casa": casa,
            "nombre": casa,
            "compra": compra,
            "venta": venta,
            "fechaActualizacion": "2024-05-01T12:00:00.000Z",
        })
    }

    #[test]
    fn parses_valid_house_list() {
        let payload = json!([house("blue", Some(1200.0), Some(1250.0))]);
        let rates = parse_house_quotes(&payload).unwrap();
        assert_eq!(rates.len(), 1);
        assert_eq!(rates[0].house, "blue");
        assert_eq!(rates[0].buy, Some(1200.0));
        assert_eq!(rates[0].sell, Some(1250.0));
    }

    #[test]
    fn null_quote_stays_absent_not_zero() {
        let payload = json!([house("oficial", None, Some(900.0))]);
        let rates = parse_house_quotes(&payload).unwrap();
        assert_eq!(rates[0].buy, None);
        assert_eq!(rates[0].sell, Some(900.0));
    }

    #[test]
    fn non_array_payload_is_terminal() {
        assert!(parse_house_quotes(&json!({"error": "oops"})).is_err());
    }

    #[test]
    fn malformed_entries_are_filtered() {
        let payload = json!([
            house("blue", Some(1200.0), Some(1250.0)),
            {"casa": 42}
        ]);
        let rates = parse_house_quotes(&payload).unwrap();
        assert_eq!(rates.len(), 1);
    }

    #[test]
    fn all_malformed_entries_is_terminal() {
        let payload = json!([{"casa": 42}, {"nope": true}]);
        assert!(parse_house_quotes(&payload).is_err());
    }

    #[test]
    fn merged_with_prefers_newer_batch() {
        let critical = MarketRateSet {
            colombia: Some(PairQuote { bid: 4000.0, ask: 4100.0 }),
            ..Default::default()
        };
        let secondary = MarketRateSet {
            chile: Some(PairQuote { bid: 950.0, ask: 980.0 }),
            ..Default::default()
        };

        let merged = critical.merged_with(&secondary);
        assert_eq!(merged.colombia, Some(PairQuote { bid: 4000.0, ask: 4100.0 }));
        assert_eq!(merged.chile, Some(PairQuote { bid: 950.0, ask: 980.0 }));
    }
}
