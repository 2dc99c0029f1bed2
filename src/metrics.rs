//! Periodic resource sampling for running services

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::MetricsConfig;
use crate::db::{Database, MetricRecord, ServiceRecord, ServiceStatus};
use crate::events::{AlertLevel, Event, EventBus};
use crate::lifecycle::{ContainerStats, LifecycleManager};

const PRUNE_EVERY: Duration = Duration::from_secs(24 * 60 * 60);

/// Alert messages for every threshold `stats` exceeds
pub fn threshold_alerts(stats: &ContainerStats, config: &MetricsConfig) -> Vec<String> {
    let mut alerts = Vec::new();
    if stats.memory_percent > config.alert_memory_percent {
        alerts.push(format!(
            "Memory usage at {:.1}% (threshold {:.0}%)",
            stats.memory_percent, config.alert_memory_percent
        ));
    }
    if stats.cpu_percent > config.alert_cpu_percent {
        alerts.push(format!(
            "CPU usage at {:.1}% (threshold {:.0}%)",
            stats.cpu_percent, config.alert_cpu_percent
        ));
    }
    alerts
}

fn to_record(service_id: &str, stats: &ContainerStats) -> MetricRecord {
    MetricRecord {
        id: 0,
        service_id: service_id.to_string(),
        cpu_percent: stats.cpu_percent,
        memory_used_bytes: stats.memory_used_bytes as i64,
        memory_limit_bytes: stats.memory_limit_bytes as i64,
        net_rx_bytes: stats.net_rx_bytes as i64,
        net_tx_bytes: stats.net_tx_bytes as i64,
        pid_count: stats.pid_count as i64,
        created_at: crate::db::now(),
    }
}

/// Samples container stats on a fixed interval, records them and raises
/// threshold alerts on the event bus.
pub struct MetricsSampler {
    db: Arc<Database>,
    lifecycle: Arc<LifecycleManager>,
    events: EventBus,
    config: MetricsConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl MetricsSampler {
    pub fn new(
        db: Arc<Database>,
        lifecycle: Arc<LifecycleManager>,
        events: EventBus,
        config: MetricsConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            db,
            lifecycle,
            events,
            config,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        let interval = Duration::from_secs(self.config.interval_secs.max(1));
        info!(interval_secs = interval.as_secs(), "Metrics sampler started");

        let mut last_prune: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.tick().await;
                    if last_prune.map_or(true, |at| at.elapsed() >= PRUNE_EVERY) {
                        self.prune();
                        last_prune = Some(Instant::now());
                    }
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("Metrics sampler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Probe the engine, then sample every running service.
    /// Returns how many services were sampled.
    pub async fn tick(&self) -> usize {
        if !self.lifecycle.refresh_engine_status().await {
            return 0;
        }

        let services = match self.db.list_services_by_status(ServiceStatus::Running) {
            Ok(services) => services,
            Err(e) => {
                warn!(error = %e, "Failed to list running services");
                return 0;
            }
        };

        let mut sampled = 0;
        for service in services {
            if self.sample(&service).await {
                sampled += 1;
            }
        }
        debug!(sampled, "Metrics sampled");
        sampled
    }

    async fn sample(&self, service: &ServiceRecord) -> bool {
        let Some(handle) = self.lifecycle.handle_for(service) else {
            return false;
        };
        let stats = match self.lifecycle.stats(&handle).await {
            Ok(stats) => stats,
            Err(e) => {
                debug!(service = %service.name, error = %e, "Stats unavailable");
                return false;
            }
        };

        if let Err(e) = self.db.insert_metric(&to_record(&service.id, &stats)) {
            warn!(service = %service.name, error = %e, "Failed to record metrics");
        }

        for message in threshold_alerts(&stats, &self.config) {
            warn!(service = %service.name, %message, "Resource alert");
            self.events.publish(Event::Alert {
                service_id: service.id.clone(),
                message,
                level: AlertLevel::Warning,
            });
        }

        self.events.publish(Event::Metrics {
            service_id: service.id.clone(),
            stats,
        });
        true
    }

    fn prune(&self) {
        match self.db.prune_metrics(self.config.retention_days) {
            Ok(0) => {}
            Ok(removed) => info!(removed, "Pruned old metric samples"),
            Err(e) => warn!(error = %e, "Failed to prune metrics"),
        }
    }
}
