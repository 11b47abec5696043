//! Remittance rate derivation engine.
//!
//! Pure functions deriving send and receive cross-rates from a handful of
//! base quotes. This module is the single canonical copy of the formulas:
//! the calc worker runs it off the orchestration thread and the in-process
//! fallback path calls it directly, so the two can never drift.
//!
//! Formulas:
//! - send:    `market.bid * (1 - fee) / blue_buy` (per-destination fee)
//! - PayPal:  `blue_buy * (1 - 0.12)`, Zelle: `blue_buy * (1 - 0.07)`
//! - receive: `peso_bid * market.ask * (1 - 0.05)` (uniform 5% spread)
//! - Venezuela receive uses its retail `buy` quote instead of an ask.
//!
//! Every derived mapping carries all of its destination keys; a missing
//! input or a zero divisor yields `None` for that key, never zero and never
//! a non-finite value.

use crate::models::{Destination, MarketRateSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Uniform spread applied to every receive rate.
pub const RECEIVE_SPREAD: f64 = 0.05;
pub const PAYPAL_FEE: f64 = 0.12;
pub const ZELLE_FEE: f64 = 0.07;

/// Fixed transfer fee for pair-quoted destinations. `None` for destinations
/// whose send rate is not fee-based.
pub fn transfer_fee(dest: Destination) -> Option<f64> {
    match dest {
        Destination::Colombia => Some(0.033),
        Destination::Peru => Some(0.033),
        Destination::Brasil => Some(0.030),
        Destination::Chile => Some(0.031),
        Destination::Ecuador => Some(0.031),
        Destination::Paraguay => Some(0.033),
        Destination::Bolivia => Some(0.033),
        Destination::Mexico => Some(0.033),
        Destination::Uruguay => Some(0.033),
        _ => None,
    }
}

/// Inputs to one derivation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeriveRequest {
    /// Blue-dollar retail buy quote; divisor for send rates and basis for
    /// the payment-service rates.
    pub blue_buy: Option<f64>,
    /// ARS-per-USDT bid from the remittance feed; multiplier for receive
    /// rates.
    pub peso_bid: Option<f64>,
    pub market: MarketRateSet,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeriveResponse {
    pub send_rates: BTreeMap<Destination, Option<f64>>,
    pub receive_rates: BTreeMap<Destination, Option<f64>>,
}

/// Send rates: home currency out to each destination. A zero `blue_buy`
/// makes every rate absent (division by zero is "no value", not infinity).
pub fn send_rates(
    blue_buy: Option<f64>,
    market: &MarketRateSet,
) -> BTreeMap<Destination, Option<f64>> {
    let base = blue_buy.filter(|b| *b != 0.0 && b.is_finite());

    Destination::SEND
        .iter()
        .map(|&dest| {
            let value = match dest {
                Destination::Paypal => base.map(|b| b * (1.0 - PAYPAL_FEE)),
                Destination::Zelle => base.map(|b| b * (1.0 - ZELLE_FEE)),
                _ => match (market.pair(dest), transfer_fee(dest), base) {
                    (Some(quote), Some(fee), Some(b)) => Some(quote.bid * (1.0 - fee) / b),
                    _ => None,
                },
            };
            (dest, value)
        })
        .collect()
}

/// Receive rates: each destination's currency back into home currency.
pub fn receive_rates(
    peso_bid: Option<f64>,
    market: &MarketRateSet,
) -> BTreeMap<Destination, Option<f64>> {
    let base = peso_bid.filter(|b| b.is_finite());

    Destination::RECEIVE
        .iter()
        .map(|&dest| {
            let value = match dest {
                Destination::Venezuela => match (market.venezuela.and_then(|q| q.buy), base) {
                    (Some(buy), Some(b)) => Some(b * buy * (1.0 - RECEIVE_SPREAD)),
                    _ => None,
                },
                _ => match (market.pair(dest), base) {
                    (Some(quote), Some(b)) => Some(b * quote.ask * (1.0 - RECEIVE_SPREAD)),
                    _ => None,
                },
            };
            (dest, value)
        })
        .collect()
}

/// One derivation pass over both directions. Used verbatim by the calc
/// worker and by the synchronous fallback path.
pub fn derive_remittance_rates(request: &DeriveRequest) -> DeriveResponse {
    DeriveResponse {
        send_rates: send_rates(request.blue_buy, &request.market),
        receive_rates: receive_rates(request.peso_bid, &request.market),
    }
}
