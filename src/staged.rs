//! Staged (critical-then-secondary) loading orchestrator.
//!
//! Generic two-phase loader: the critical stage runs first and gates the
//! secondary stage, which receives the critical result as input. A pure
//! `combine` step produces the externally consumed merged view whenever both
//! halves are present. Critical failure is terminal for the cycle and never
//! clears previously combined data; secondary failure is reported
//! independently. Overlapping refreshes are not prevented here — callers
//! cancel their prior cycle before starting a new one.

use crate::cancel::CancelToken;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[async_trait]
pub trait StagedSource: Send + Sync + 'static {
    type Critical: Clone + Send + Sync;
    type Secondary: Clone + Send + Sync;
    type Combined: Clone + Send + Sync;

    async fn load_critical(&self, cancel: &CancelToken) -> Result<Self::Critical>;

    async fn load_secondary(
        &self,
        critical: &Self::Critical,
        cancel: &CancelToken,
    ) -> Result<Self::Secondary>;

    /// Must be pure and idempotent: identical inputs produce identical
    /// output on every call.
    fn combine(&self, critical: &Self::Critical, secondary: &Self::Secondary) -> Self::Combined;
}

#[derive(Debug, Clone)]
pub struct StagedConfig {
    /// Wait between the critical and secondary bursts.
    pub delay: Duration,
    /// Auto-refresh cadence; `None` disables auto-refresh.
    pub refresh_interval: Option<Duration>,
}

impl Default for StagedConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(300),
            refresh_interval: None,
        }
    }
}

pub struct StagedLoadState<S: StagedSource> {
    pub critical: Option<S::Critical>,
    pub secondary: Option<S::Secondary>,
    pub combined: Option<S::Combined>,
    pub critical_error: Option<String>,
    pub secondary_error: Option<String>,
    pub critical_loading: bool,
    pub secondary_loading: bool,
    pub last_update: Option<DateTime<Utc>>,
}

impl<S: StagedSource> Default for StagedLoadState<S> {
    fn default() -> Self {
        Self {
            critical: None,
            secondary: None,
            combined: None,
            critical_error: None,
            secondary_error: None,
            critical_loading: false,
            secondary_loading: false,
            last_update: None,
        }
    }
}

impl<S: StagedSource> Clone for StagedLoadState<S> {
    fn clone(&self) -> Self {
        Self {
            critical: self.critical.clone(),
            secondary: self.secondary.clone(),
            combined: self.combined.clone(),
            critical_error: self.critical_error.clone(),
            secondary_error: self.secondary_error.clone(),
            critical_loading: self.critical_loading,
            secondary_loading: self.secondary_loading,
            last_update: self.last_update,
        }
    }
}

/// Outcome of one `load_all` cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Loaded,
    CriticalFailed,
    SecondaryFailed,
    Cancelled,
}

pub struct StagedLoader<S: StagedSource> {
    source: Arc<S>,
    config: StagedConfig,
    state: RwLock<StagedLoadState<S>>,
}

impl<S: StagedSource> StagedLoader<S> {
    pub fn new(source: Arc<S>, config: StagedConfig) -> Self {
        Self {
            source,
            config,
            state: RwLock::new(StagedLoadState::default()),
        }
    }

    pub fn state(&self) -> StagedLoadState<S> {
        self.state.read().clone()
    }

    /// Run one full cycle: critical, delay, secondary, combine.
    pub async fn load_all(&self, cancel: &CancelToken) -> CycleOutcome {
        {
            let mut state = self.state.write();
            state.critical_loading = true;
            state.critical_error = None;
        }

        let critical = match self.source.load_critical(cancel).await {
            Ok(critical) => {
                let mut state = self.state.write();
                state.critical = Some(critical.clone());
                state.critical_loading = false;
                state.last_update = Some(Utc::now());
                critical
            }
            Err(e) => {
                let mut state = self.state.write();
                state.critical_loading = false;
                if cancel.is_cancelled() {
                    debug!("critical load cancelled");
                    return CycleOutcome::Cancelled;
                }
                warn!(error = %e, "critical load failed");
                // Previously combined data is retained: stale-but-present
                // beats a blank state.
                state.critical_error = Some(e.to_string());
                return CycleOutcome::CriticalFailed;
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => return CycleOutcome::Cancelled,
            _ = tokio::time::sleep(self.config.delay) => {}
        }

        {
            let mut state = self.state.write();
            state.secondary_loading = true;
            state.secondary_error = None;
        }

        match self.source.load_secondary(&critical, cancel).await {
            Ok(secondary) => {
                let combined = self.source.combine(&critical, &secondary);
                let mut state = self.state.write();
                state.secondary = Some(secondary);
                state.combined = Some(combined);
                state.secondary_loading = false;
                state.last_update = Some(Utc::now());
                CycleOutcome::Loaded
            }
            Err(e) => {
                let mut state = self.state.write();
                state.secondary_loading = false;
                if cancel.is_cancelled() {
                    debug!("secondary load cancelled");
                    return CycleOutcome::Cancelled;
                }
                warn!(error = %e, "secondary load failed");
                state.secondary_error = Some(e.to_string());
                CycleOutcome::SecondaryFailed
            }
        }
    }

    /// Spawn the auto-refresh loop if a cadence is configured. The loop
    /// runs until `shutdown` fires.
    pub fn spawn_auto_refresh(
        self: &Arc<Self>,
        shutdown: CancelToken,
    ) -> Option<JoinHandle<()>> {
        let interval = self.config.refresh_interval?;
        let loader = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        loader.load_all(&shutdown).await;
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[derive(Default)]
    struct CountingSource {
        critical_calls: AtomicU32,
        secondary_calls: AtomicU32,
        fail_critical: AtomicBool,
        fail_secondary: AtomicBool,
    }

    #[async_trait]
    impl StagedSource for CountingSource {
        type Critical = u32;
        type Secondary = u32;
        type Combined = u32;

        async fn load_critical(&self, _cancel: &CancelToken) -> Result<u32> {
            let n = self.critical_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_critical.load(Ordering::SeqCst) {
                bail!("critical feed down");
            }
            Ok(n)
        }

        async fn load_secondary(&self, critical: &u32, _cancel: &CancelToken) -> Result<u32> {
            self.secondary_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_secondary.load(Ordering::SeqCst) {
                bail!("secondary feed down");
            }
            Ok(critical * 10)
        }

        fn combine(&self, critical: &u32, secondary: &u32) -> u32 {
            critical + secondary
        }
    }

    fn loader(source: Arc<CountingSource>) -> StagedLoader<CountingSource> {
        StagedLoader::new(
            source,
            StagedConfig {
                delay: Duration::from_millis(10),
                refresh_interval: None,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn full_cycle_combines_both_halves() {
        let source = Arc::new(CountingSource::default());
        let loader = loader(source.clone());

        let outcome = loader.load_all(&CancelToken::new()).await;
        assert_eq!(outcome, CycleOutcome::Loaded);

        let state = loader.state();
        assert_eq!(state.critical, Some(1));
        assert_eq!(state.secondary, Some(10));
        assert_eq!(state.combined, Some(11));
        assert!(state.last_update.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn critical_failure_skips_secondary() {
        let source = Arc::new(CountingSource::default());
        source.fail_critical.store(true, Ordering::SeqCst);
        let loader = loader(source.clone());

        let outcome = loader.load_all(&CancelToken::new()).await;
        assert_eq!(outcome, CycleOutcome::CriticalFailed);
        assert_eq!(source.secondary_calls.load(Ordering::SeqCst), 0);

        let state = loader.state();
        assert!(state.critical.is_none());
        assert!(state.secondary.is_none());
        assert!(state.critical_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn critical_failure_retains_previous_combined_data() {
        let source = Arc::new(CountingSource::default());
        let loader = loader(source.clone());

        assert_eq!(loader.load_all(&CancelToken::new()).await, CycleOutcome::Loaded);
        source.fail_critical.store(true, Ordering::SeqCst);
        assert_eq!(
            loader.load_all(&CancelToken::new()).await,
            CycleOutcome::CriticalFailed
        );

        let state = loader.state();
        assert_eq!(state.combined, Some(11));
        assert!(state.critical_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn secondary_failure_keeps_critical_data() {
        let source = Arc::new(CountingSource::default());
        source.fail_secondary.store(true, Ordering::SeqCst);
        let loader = loader(source.clone());

        let outcome = loader.load_all(&CancelToken::new()).await;
        assert_eq!(outcome, CycleOutcome::SecondaryFailed);

        let state = loader.state();
        assert_eq!(state.critical, Some(1));
        assert!(state.secondary.is_none());
        assert!(state.secondary_error.is_some());
        assert!(state.critical_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn combine_recomputed_on_refresh() {
        let source = Arc::new(CountingSource::default());
        let loader = loader(source.clone());

        assert_eq!(loader.load_all(&CancelToken::new()).await, CycleOutcome::Loaded);
        assert_eq!(loader.state().combined, Some(11));
        assert_eq!(loader.load_all(&CancelToken::new()).await, CycleOutcome::Loaded);
        assert_eq!(loader.state().combined, Some(22));
    }

    #[tokio::test(start_paused = true)]
    async fn auto_refresh_cycles_until_shutdown() {
        let source = Arc::new(CountingSource::default());
        let loader = Arc::new(StagedLoader::new(
            source.clone(),
            StagedConfig {
                delay: Duration::from_millis(10),
                refresh_interval: Some(Duration::from_secs(60)),
            },
        ));

        let shutdown = CancelToken::new();
        let handle = loader
            .spawn_auto_refresh(shutdown.clone())
            .expect("cadence configured");

        // First tick fires immediately; step through two more.
        tokio::time::advance(Duration::from_secs(121)).await;
        shutdown.cancel();
        handle.await.unwrap();
        assert!(source.critical_calls.load(Ordering::SeqCst) >= 2);

        let disabled = Arc::new(StagedLoader::new(
            source,
            StagedConfig {
                delay: Duration::from_millis(10),
                refresh_interval: None,
            },
        ));
        assert!(disabled.spawn_auto_refresh(shutdown).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_delay_reports_cancelled_not_error() {
        let source = Arc::new(CountingSource::default());
        let loader = Arc::new(StagedLoader::new(
            source.clone(),
            StagedConfig {
                delay: Duration::from_secs(10),
                refresh_interval: None,
            },
        ));

        let cancel = CancelToken::new();
        let cycle = {
            let loader = Arc::clone(&loader);
            let cancel = cancel.clone();
            tokio::spawn(async move { loader.load_all(&cancel).await })
        };

        tokio::task::yield_now().await;
        cancel.cancel();

        assert_eq!(cycle.await.unwrap(), CycleOutcome::Cancelled);
        assert_eq!(source.secondary_calls.load(Ordering::SeqCst), 0);
        assert!(loader.state().critical_error.is_none());
    }
}
