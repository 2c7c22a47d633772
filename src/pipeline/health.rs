//! Provider Health Manager
//!
//! Combines live circuit breaker state with cached results of lightweight
//! active probes. Probe results live in an immutable map that the refresh
//! task swaps in whole, so `snapshot()` never blocks on network I/O and
//! never observes a partial update.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::ai::provider::{CircuitBreakerRegistry, CircuitState, SharedAdapter};
use crate::ai::timeout::with_call_timeout;
use crate::config::HealthSettings;

/// Result of the most recent active probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProbeStatus {
    /// No probe has completed yet
    Unknown,
    Passed,
    Failed { reason: String },
}

/// Health of one provider at snapshot time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderHealthRecord {
    pub provider: String,
    pub healthy: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub breaker_state: CircuitState,
    pub consecutive_failures: u32,
    pub probe: ProbeStatus,
}

/// Immutable provider → health map
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub records: BTreeMap<String, ProviderHealthRecord>,
}

impl HealthSnapshot {
    /// Providers missing from the snapshot are unhealthy
    pub fn is_healthy(&self, provider: &str) -> bool {
        self.records.get(provider).is_some_and(|r| r.healthy)
    }

    pub fn healthy_count(&self) -> usize {
        self.records.values().filter(|r| r.healthy).count()
    }

    pub fn get(&self, provider: &str) -> Option<&ProviderHealthRecord> {
        self.records.get(provider)
    }

    /// Snapshot with every listed provider healthy and breakers closed
    pub fn all_healthy<I, S>(providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let records = providers
            .into_iter()
            .map(|p| {
                let provider = p.into();
                (
                    provider.clone(),
                    ProviderHealthRecord {
                        provider,
                        healthy: true,
                        last_checked_at: None,
                        breaker_state: CircuitState::Closed,
                        consecutive_failures: 0,
                        probe: ProbeStatus::Unknown,
                    },
                )
            })
            .collect();
        Self { records }
    }
}

#[derive(Debug, Clone)]
struct ProbeRecord {
    status: ProbeStatus,
    checked_at: DateTime<Utc>,
}

/// Periodically probes providers and reports their health
pub struct ProviderHealthManager {
    breakers: Arc<CircuitBreakerRegistry>,
    /// One adapter per provider
    targets: BTreeMap<String, SharedAdapter>,
    probes: RwLock<Arc<BTreeMap<String, ProbeRecord>>>,
    refresh_interval: Duration,
    probe_timeout: Duration,
    probe_enabled: bool,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ProviderHealthManager {
    pub fn new(
        breakers: Arc<CircuitBreakerRegistry>,
        targets: BTreeMap<String, SharedAdapter>,
        settings: &HealthSettings,
    ) -> Self {
        Self {
            breakers,
            targets,
            probes: RwLock::new(Arc::new(BTreeMap::new())),
            refresh_interval: Duration::from_secs(settings.refresh_interval_secs),
            probe_timeout: Duration::from_secs(settings.probe_timeout_secs),
            probe_enabled: settings.probe_enabled,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Current health. Reads cached probe results and live breaker state only.
    pub fn snapshot(&self) -> HealthSnapshot {
        let probes = Arc::clone(
            &self
                .probes
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );

        let records = self
            .targets
            .keys()
            .map(|provider| {
                let breaker = self.breakers.breaker(provider);
                let status = breaker.status();
                let probe = probes.get(provider);
                let probe_status = probe
                    .map(|p| p.status.clone())
                    .unwrap_or(ProbeStatus::Unknown);
                let probe_ok = !matches!(probe_status, ProbeStatus::Failed { .. });

                (
                    provider.clone(),
                    ProviderHealthRecord {
                        provider: provider.clone(),
                        healthy: probe_ok && breaker.would_allow(),
                        last_checked_at: probe.map(|p| p.checked_at),
                        breaker_state: status.state,
                        consecutive_failures: status.consecutive_failures,
                        probe: probe_status,
                    },
                )
            })
            .collect();

        HealthSnapshot { records }
    }

    /// Probe every provider now and publish the results.
    ///
    /// Probes run concurrently, each bounded by the probe timeout. With
    /// probing disabled this only returns the current snapshot.
    #[instrument(skip(self), fields(providers = self.targets.len()))]
    pub async fn force_refresh(&self) -> HealthSnapshot {
        if !self.probe_enabled {
            return self.snapshot();
        }

        let timeout = self.probe_timeout;
        let probes = self.targets.iter().map(|(provider, adapter)| {
            let adapter = Arc::clone(adapter);
            async move {
                let result = with_call_timeout(timeout, adapter.probe(), provider).await;
                let status = match result {
                    Ok(()) => ProbeStatus::Passed,
                    Err(e) => {
                        warn!(provider = %provider, "Health probe failed: {}", e);
                        ProbeStatus::Failed {
                            reason: e.to_string(),
                        }
                    }
                };
                (
                    provider.clone(),
                    ProbeRecord {
                        status,
                        checked_at: Utc::now(),
                    },
                )
            }
        });

        let fresh: BTreeMap<_, _> = join_all(probes).await.into_iter().collect();
        let passed = fresh
            .values()
            .filter(|r| r.status == ProbeStatus::Passed)
            .count();

        *self
            .probes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(fresh);

        info!(
            passed,
            total = self.targets.len(),
            "Health snapshot refreshed"
        );

        self.snapshot()
    }

    /// Spawn the periodic refresh task. Does nothing if already running.
    pub fn start(self: &Arc<Self>) {
        if !self.probe_enabled {
            debug!("Health probes disabled, refresh task not started");
            return;
        }

        let mut task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if task.is_some() {
            return;
        }

        let manager = Arc::clone(self);
        let cancel = self.cancel.clone();
        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.refresh_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        manager.force_refresh().await;
                    }
                }
            }
            debug!("Health refresh task stopped");
        }));
    }

    /// Stop the refresh task
    pub fn close(&self) {
        self.cancel.cancel();
        if let Some(handle) = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for ProviderHealthManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
