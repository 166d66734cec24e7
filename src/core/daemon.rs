// src/core/daemon.rs

//! The main polling loop: discover, filter, group, detect changes,
//! reconcile, sleep. Handles shutdown signals, SIGHUP state resets, and
//! exponential backoff after failed cycles.

use crate::config::{Config, PollingConfig};
use crate::core::discovery::change_detector::ChangeDetector;
use crate::core::discovery::tag_filter::TagFilter;
use crate::core::discovery::{self, DiscoveryClient};
use crate::core::errors::DiscoveryError;
use crate::core::haproxy::reconciler::Reconciler;
use crate::core::metrics;
use crate::core::models::group_instances;
use anyhow::Result;
use rand::Rng;
use std::time::{Duration, Instant};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// How many polling intervals a single cycle may take before it is abandoned
/// and counted as a failure.
const CYCLE_WATCHDOG_FACTOR: u64 = 5;

/// Polling daemon: discover -> filter -> group -> detect changes ->
/// reconcile -> sleep.
pub struct Daemon {
    config: Config,
    client: Box<dyn DiscoveryClient>,
    tag_filter: TagFilter,
    change_detector: ChangeDetector,
    reconciler: Reconciler,
    consecutive_failures: u32,
}

impl Daemon {
    /// Construct a daemon with the discovery client selected by the
    /// validated configuration.
    pub async fn new(config: Config) -> Result<Self, DiscoveryError> {
        let client = discovery::build_client(&config).await?;
        Self::with_client(config, client)
    }

    /// Construct a daemon around an explicit discovery client.
    pub fn with_client(
        config: Config,
        client: Box<dyn DiscoveryClient>,
    ) -> Result<Self, DiscoveryError> {
        let tag_filter = TagFilter::new(&config.tags);
        let reconciler = Reconciler::new(&config.haproxy)?;
        Ok(Self {
            config,
            client,
            tag_filter,
            change_detector: ChangeDetector::new(),
            reconciler,
            consecutive_failures: 0,
        })
    }

    /// Execute a single discovery + reconciliation cycle.
    pub async fn run_once(&mut self) -> Result<(), DiscoveryError> {
        self.cycle().await
    }

    /// Run the polling loop until SIGINT or SIGTERM.
    ///
    /// The current cycle always runs to completion; signals interrupt only
    /// the inter-cycle sleep. SIGHUP resets the change detector so the next
    /// cycle re-reconciles everything.
    pub async fn run(mut self) -> Result<()> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        let (shutdown_tx, _) = broadcast::channel(1);
        if self.config.metrics.enabled {
            tokio::spawn(metrics::run_metrics_server(
                self.config.metrics.port,
                shutdown_tx.subscribe(),
            ));
        }

        info!(
            provider = self.client.provider(),
            interval = self.config.polling.interval_seconds,
            "Daemon started"
        );

        let watchdog = Duration::from_secs(
            self.config.polling.interval_seconds * CYCLE_WATCHDOG_FACTOR,
        );

        loop {
            let cycle_start = Instant::now();
            match tokio::time::timeout(watchdog, self.cycle()).await {
                Ok(Ok(())) => {
                    self.consecutive_failures = 0;
                }
                Ok(Err(e)) => {
                    self.consecutive_failures += 1;
                    metrics::CYCLE_FAILURES_TOTAL.inc();
                    error!(
                        error = %e,
                        consecutive_failures = self.consecutive_failures,
                        "Cycle failed"
                    );
                }
                Err(_) => {
                    self.consecutive_failures += 1;
                    metrics::CYCLE_FAILURES_TOTAL.inc();
                    error!(
                        watchdog_seconds = watchdog.as_secs(),
                        consecutive_failures = self.consecutive_failures,
                        "Cycle exceeded watchdog timeout, abandoned"
                    );
                }
            }

            let sleep_for = calculate_sleep(
                cycle_start.elapsed(),
                &self.config.polling,
                self.consecutive_failures,
            );
            debug!(
                seconds = sleep_for.as_secs_f64(),
                "Sleeping before next cycle"
            );

            tokio::select! {
                biased;

                _ = sigint.recv() => {
                    info!("SIGINT received, shutting down");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("SIGTERM received, shutting down");
                    break;
                }
                _ = sighup.recv() => {
                    info!("SIGHUP received, resetting change detector state");
                    self.change_detector.reset();
                }
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }

        let _ = shutdown_tx.send(());
        info!("Daemon stopped");
        Ok(())
    }

    /// One full discovery-to-reconciliation cycle.
    async fn cycle(&mut self) -> Result<(), DiscoveryError> {
        let start = Instant::now();
        metrics::CYCLES_TOTAL.inc();

        let instances = self.client.discover_all().await?;
        metrics::INSTANCES_DISCOVERED.set(instances.len() as f64);

        let instances = self.tag_filter.apply(instances);
        let services = group_instances(instances);
        let (changed, removed) = self.change_detector.detect(&services);
        metrics::SERVICES_CHANGED_TOTAL.inc_by(changed.len() as f64);
        metrics::SERVICES_REMOVED_TOTAL.inc_by(removed.len() as f64);

        if !changed.is_empty() || !removed.is_empty() {
            self.reconciler.reconcile(&changed, &removed).await?;
        }

        let elapsed = start.elapsed();
        metrics::CYCLE_DURATION_SECONDS.observe(elapsed.as_secs_f64());
        info!(elapsed_seconds = elapsed.as_secs_f64(), "Cycle complete");
        Ok(())
    }
}

/// The sleep base: the polling interval while healthy, exponential from
/// `backoff_base_seconds` (capped at `max_backoff_seconds`) after
/// consecutive failures.
pub fn backoff_base(polling: &PollingConfig, consecutive_failures: u32) -> Duration {
    if consecutive_failures == 0 {
        return Duration::from_secs(polling.interval_seconds);
    }
    let exponent = consecutive_failures.saturating_sub(1).min(16);
    let backoff = polling
        .backoff_base_seconds
        .saturating_mul(2u64.saturating_pow(exponent));
    Duration::from_secs(backoff.min(polling.max_backoff_seconds))
}

/// Determine how long to sleep before the next cycle: the backoff base minus
/// the time the cycle already consumed, plus uniform jitter, floored at
/// zero.
pub fn calculate_sleep(
    elapsed: Duration,
    polling: &PollingConfig,
    consecutive_failures: u32,
) -> Duration {
    let base = backoff_base(polling, consecutive_failures).as_secs_f64();
    let jitter = rand::thread_rng().gen_range(0.0..=polling.jitter_seconds as f64);
    Duration::from_secs_f64((base - elapsed.as_secs_f64() + jitter).max(0.0))
}
