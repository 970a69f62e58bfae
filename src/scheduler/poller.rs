//! Poll Scheduler
//!
//! Fires one round ("tick") immediately on start and then once per source
//! interval. Every tick fans out one task per currency pair; a failing pair
//! never stops the others, the tick, or the scheduler.
//!
//! ```text
//!  interval ──tick──▶ JoinSet ─┬─ fetch USD/EUR ─┐
//!                              ├─ fetch GBP/JPY ─┼─▶ ForexMetrics
//!                              └─ fetch EUR/CHF ─┘
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::{CurrencyPair, RateSource};
use crate::error::{Error, Result};
use crate::metrics::ForexMetrics;

// =============================================================================
// Tick Report
// =============================================================================

/// Outcome of one polling round
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    /// Tick number, starting at 1
    pub tick: u64,

    /// Pairs whose rate was fetched and stored, in completion order
    pub succeeded: Vec<CurrencyPair>,

    /// Pairs that failed, with the reason
    pub failed: Vec<(CurrencyPair, String)>,
}

impl TickReport {
    fn new(tick: u64) -> Self {
        Self {
            tick,
            ..Default::default()
        }
    }

    /// True if every pair was fetched
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

// =============================================================================
// Poll Scheduler
// =============================================================================

/// Periodically polls a [`RateSource`] for every configured pair.
pub struct PollScheduler {
    pairs: Vec<CurrencyPair>,
    metrics: Arc<ForexMetrics>,
    grace_period: Duration,
}

impl PollScheduler {
    /// Create a scheduler for the given pairs.
    ///
    /// `grace_period` bounds how long a tick in flight at shutdown may keep
    /// running before its fetches are cancelled.
    pub fn new(pairs: Vec<CurrencyPair>, metrics: Arc<ForexMetrics>, grace_period: Duration) -> Self {
        Self {
            pairs,
            metrics,
            grace_period,
        }
    }

    /// Initialize `source` and start polling in the background.
    ///
    /// Fails without spawning anything if there are no pairs, if the source
    /// fails to initialize, or if it reports a zero interval.
    pub async fn start(
        self,
        mut source: Box<dyn RateSource>,
        shutdown: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        if self.pairs.is_empty() {
            return Err(Error::Config(
                "No currency pairs configured for polling".to_string(),
            ));
        }

        if let Err(e) = source.initialize(&self.pairs).await {
            error!(source = source.name(), error = %e, "Error initialising rate source");
            return Err(e);
        }

        let period = source.poll_interval();
        if period.is_zero() {
            return Err(Error::Config(format!(
                "Rate source {} reported a zero poll interval",
                source.name()
            )));
        }

        info!(
            source = source.name(),
            pairs = self.pairs.len(),
            interval_secs = period.as_secs_f64(),
            "Starting poll scheduler"
        );

        let source: Arc<dyn RateSource> = Arc::from(source);
        Ok(tokio::spawn(self.run(source, period, shutdown)))
    }

    async fn run(self, source: Arc<dyn RateSource>, period: Duration, shutdown: CancellationToken) {
        // The first tick of a tokio interval completes immediately.
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut tick = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tick += 1;
            let report = self.run_tick(tick, &source, &shutdown).await;
            debug!(
                tick,
                succeeded = report.succeeded.len(),
                failed = report.failed.len(),
                "Tick complete"
            );
        }

        info!(source = source.name(), "Shutting down poll scheduler");
    }

    /// Run one polling round across every pair and wait for all of them.
    ///
    /// Successful fetches are written to the registry as they complete.
    /// Failures are logged and counted once the whole round is done; they
    /// leave the previously stored value untouched.
    pub async fn run_tick(
        &self,
        tick: u64,
        source: &Arc<dyn RateSource>,
        shutdown: &CancellationToken,
    ) -> TickReport {
        let provider = source.name().to_string();

        // Each tick gets its own token. Shutdown does not cancel it directly:
        // in-flight fetches get the grace period to finish first.
        let tick_token = CancellationToken::new();
        let watchdog = tokio::spawn({
            let shutdown = shutdown.clone();
            let tick_token = tick_token.clone();
            let grace = self.grace_period;
            async move {
                shutdown.cancelled().await;
                tokio::time::sleep(grace).await;
                tick_token.cancel();
            }
        });

        let mut tasks = JoinSet::new();
        for pair in self.pairs.iter().cloned() {
            let source = Arc::clone(source);
            let metrics = Arc::clone(&self.metrics);
            let token = tick_token.clone();

            debug!(tick, pair = %pair, source = %provider, "Retrieving rate");
            tasks.spawn(async move {
                let result = tokio::select! {
                    _ = token.cancelled() => {
                        Err(Error::fetch(&pair, source.name(), "cancelled during shutdown"))
                    }
                    fetched = source.fetch_one(&pair) => fetched,
                };

                if let Ok(rate) = &result {
                    debug!(pair = %pair, rate = rate.rate, "Registering forex rate");
                    metrics.record(&pair, source.name(), rate);
                }
                (pair, result)
            });
        }

        let mut report = TickReport::new(tick);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((pair, Ok(_))) => report.succeeded.push(pair),
                Ok((pair, Err(e))) => report.failed.push((pair, e.to_string())),
                Err(e) => warn!(tick, error = %e, "Fetch task did not complete"),
            }
        }
        watchdog.abort();

        // A task that panicked reported nothing; charge it to its pair.
        let reported: HashSet<&CurrencyPair> = report
            .succeeded
            .iter()
            .chain(report.failed.iter().map(|(p, _)| p))
            .collect();
        let missing: Vec<CurrencyPair> = self
            .pairs
            .iter()
            .filter(|p| !reported.contains(p))
            .cloned()
            .collect();
        for pair in missing {
            report.failed.push((pair, "fetch task panicked".to_string()));
        }

        for (pair, reason) in &report.failed {
            self.metrics.record_fetch_error(pair, &provider);
            let last_known = self.metrics.latest(pair, &provider);
            warn!(
                tick,
                pair = %pair,
                source = %provider,
                error = %reason,
                stale_since = last_known.map(|r| r.observed_at),
                "Error retrieving rate, retrying next tick"
            );
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ExchangeRate;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::time::Instant;

    /// Source that answers from a script: pairs in `failing` error out,
    /// every call is logged with the (tokio) time it started.
    struct ScriptedSource {
        interval: Duration,
        delay: Duration,
        failing: HashSet<String>,
        panicking: HashSet<String>,
        fail_init: bool,
        calls: Arc<Mutex<Vec<(String, Instant)>>>,
    }

    impl ScriptedSource {
        fn new(interval: Duration) -> Self {
            Self {
                interval,
                delay: Duration::ZERO,
                failing: HashSet::new(),
                panicking: HashSet::new(),
                fail_init: false,
                calls: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn failing(mut self, pair: &str) -> Self {
            self.failing.insert(pair.to_string());
            self
        }

        fn panicking(mut self, pair: &str) -> Self {
            self.panicking.insert(pair.to_string());
            self
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl RateSource for ScriptedSource {
        async fn initialize(&mut self, _pairs: &[CurrencyPair]) -> Result<()> {
            if self.fail_init {
                return Err(Error::Config("missing credential".into()));
            }
            Ok(())
        }

        fn poll_interval(&self) -> Duration {
            self.interval
        }

        fn name(&self) -> &str {
            "scripted"
        }

        async fn fetch_one(&self, pair: &CurrencyPair) -> Result<ExchangeRate> {
            let key = pair.to_string();
            self.calls.lock().push((key.clone(), Instant::now()));

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.panicking.contains(&key) {
                panic!("scripted panic for {key}");
            }
            if self.failing.contains(&key) {
                return Err(Error::fetch(pair, "scripted", "provider unavailable"));
            }
            Ok(ExchangeRate::new(1.25, 1_700_000_000))
        }
    }

    fn pairs(raw: &[&str]) -> Vec<CurrencyPair> {
        raw.iter().map(|p| p.parse().unwrap()).collect()
    }

    fn scheduler(raw: &[&str], metrics: &Arc<ForexMetrics>) -> PollScheduler {
        PollScheduler::new(pairs(raw), Arc::clone(metrics), Duration::from_secs(10))
    }

    // =========================================================================
    // Start Tests
    // =========================================================================

    #[tokio::test]
    async fn test_start_fails_without_pairs() {
        let metrics = Arc::new(ForexMetrics::new().unwrap());
        let source = ScriptedSource::new(Duration::from_secs(60));
        let calls = Arc::clone(&source.calls);

        let result = scheduler(&[], &metrics)
            .start(Box::new(source), CancellationToken::new())
            .await;

        assert_matches!(result, Err(Error::Config(_)));
        assert!(calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_start_fails_when_source_init_fails() {
        let metrics = Arc::new(ForexMetrics::new().unwrap());
        let mut source = ScriptedSource::new(Duration::from_secs(60));
        source.fail_init = true;
        let calls = Arc::clone(&source.calls);

        let result = scheduler(&["USD/EUR"], &metrics)
            .start(Box::new(source), CancellationToken::new())
            .await;

        assert_matches!(result, Err(Error::Config(_)));
        tokio::task::yield_now().await;
        assert!(calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_start_rejects_zero_interval() {
        let metrics = Arc::new(ForexMetrics::new().unwrap());
        let source = ScriptedSource::new(Duration::ZERO);

        let result = scheduler(&["USD/EUR"], &metrics)
            .start(Box::new(source), CancellationToken::new())
            .await;

        assert_matches!(result, Err(Error::Config(_)));
    }

    // =========================================================================
    // Timing Tests
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_is_immediate_then_fixed_interval() {
        let metrics = Arc::new(ForexMetrics::new().unwrap());
        let source = ScriptedSource::new(Duration::from_secs(60));
        let calls = Arc::clone(&source.calls);
        let shutdown = CancellationToken::new();
        let started = Instant::now();

        let handle = scheduler(&["USD/EUR", "GBP/JPY"], &metrics)
            .start(Box::new(source), shutdown.clone())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(150)).await;
        shutdown.cancel();
        handle.await.unwrap();

        let calls = calls.lock();
        // Ticks at 0s, 60s and 120s, two pairs each
        assert_eq!(calls.len(), 6);
        let mut offsets: Vec<u64> = calls
            .iter()
            .map(|(_, at)| at.duration_since(started).as_secs())
            .collect();
        offsets.sort_unstable();
        assert_eq!(offsets, vec![0, 0, 60, 60, 120, 120]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_keeps_running_when_every_fetch_fails() {
        let metrics = Arc::new(ForexMetrics::new().unwrap());
        let source = ScriptedSource::new(Duration::from_secs(30)).failing("USD/EUR");
        let calls = Arc::clone(&source.calls);
        let shutdown = CancellationToken::new();

        let handle = scheduler(&["USD/EUR"], &metrics)
            .start(Box::new(source), shutdown.clone())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(100)).await;
        assert!(!handle.is_finished());
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(calls.lock().len(), 4);
        assert!(metrics.is_empty());
        assert!(metrics
            .render()
            .unwrap()
            .contains(r#"forex_exporter_fetch_errors_total{provider="scripted",source_currency="USD",target_currency="EUR"} 4"#));
    }

    // =========================================================================
    // Failure Isolation Tests
    // =========================================================================

    #[tokio::test]
    async fn test_one_failing_pair_does_not_block_others() {
        let metrics = Arc::new(ForexMetrics::new().unwrap());
        let scheduler = scheduler(&["USD/EUR", "GBP/JPY", "EUR/CHF"], &metrics);
        let source: Arc<dyn RateSource> =
            Arc::new(ScriptedSource::new(Duration::from_secs(60)).failing("GBP/JPY"));

        let report = scheduler.run_tick(1, &source, &CancellationToken::new()).await;

        assert_eq!(report.tick, 1);
        assert_eq!(report.succeeded.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0.to_string(), "GBP/JPY");
        assert!(!report.is_clean());

        assert!(metrics.latest(&"USD/EUR".parse().unwrap(), "scripted").is_some());
        assert!(metrics.latest(&"EUR/CHF".parse().unwrap(), "scripted").is_some());
        assert!(metrics.latest(&"GBP/JPY".parse().unwrap(), "scripted").is_none());
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_last_known_value() {
        let metrics = Arc::new(ForexMetrics::new().unwrap());
        let usd_eur: CurrencyPair = "USD/EUR".parse().unwrap();
        metrics.record(&usd_eur, "scripted", &ExchangeRate::new(0.9, 100));

        let scheduler = scheduler(&["USD/EUR"], &metrics);
        let source: Arc<dyn RateSource> =
            Arc::new(ScriptedSource::new(Duration::from_secs(60)).failing("USD/EUR"));

        let report = scheduler.run_tick(2, &source, &CancellationToken::new()).await;

        assert_eq!(report.failed.len(), 1);
        assert_eq!(
            metrics.latest(&usd_eur, "scripted"),
            Some(ExchangeRate::new(0.9, 100))
        );
    }

    #[tokio::test]
    async fn test_panicking_fetch_is_isolated() {
        let metrics = Arc::new(ForexMetrics::new().unwrap());
        let scheduler = scheduler(&["USD/EUR", "GBP/JPY"], &metrics);
        let source: Arc<dyn RateSource> =
            Arc::new(ScriptedSource::new(Duration::from_secs(60)).panicking("USD/EUR"));

        let report = scheduler.run_tick(1, &source, &CancellationToken::new()).await;

        assert_eq!(report.succeeded, pairs(&["GBP/JPY"]));
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0.to_string(), "USD/EUR");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pairs_fetch_concurrently() {
        let metrics = Arc::new(ForexMetrics::new().unwrap());
        let scheduler = scheduler(&["USD/EUR", "GBP/JPY", "EUR/CHF"], &metrics);
        let source: Arc<dyn RateSource> = Arc::new(
            ScriptedSource::new(Duration::from_secs(60)).with_delay(Duration::from_secs(5)),
        );
        let started = Instant::now();

        let report = scheduler.run_tick(1, &source, &CancellationToken::new()).await;

        assert!(report.is_clean());
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    // =========================================================================
    // Shutdown Tests
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_lets_in_flight_fetch_finish() {
        let metrics = Arc::new(ForexMetrics::new().unwrap());
        let source = ScriptedSource::new(Duration::from_secs(60)).with_delay(Duration::from_secs(3));
        let shutdown = CancellationToken::new();

        let handle = scheduler(&["USD/EUR"], &metrics)
            .start(Box::new(source), shutdown.clone())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert!(metrics.latest(&"USD/EUR".parse().unwrap(), "scripted").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_fetch_after_grace_period() {
        let metrics = Arc::new(ForexMetrics::new().unwrap());
        let source =
            ScriptedSource::new(Duration::from_secs(600)).with_delay(Duration::from_secs(300));
        let shutdown = CancellationToken::new();
        let started = Instant::now();

        let handle = scheduler(&["USD/EUR"], &metrics)
            .start(Box::new(source), shutdown.clone())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.cancel();
        handle.await.unwrap();

        // Cancelled one second in, plus the ten second grace period
        assert_eq!(started.elapsed(), Duration::from_secs(11));
        assert!(metrics.is_empty());
    }
}
