//! DolarCambio core - rate acquisition and remittance derivation.
//!
//! Exposes the fetch/cache/cancel plumbing, the derivation formulas, the
//! calc worker and the live feeds for use by the runner binary and tests.

pub mod cache;
pub mod cancel;
pub mod client;
pub mod config;
pub mod derive;
pub mod feeds;
pub mod models;
pub mod staged;
pub mod worker;
