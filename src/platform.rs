//! Wiring of the platform's long-lived components

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::api::PlatformApi;
use crate::config::Config;
use crate::control::ServiceControl;
use crate::db::{Database, ResourceLimits};
use crate::engine::ContainerEngine;
use crate::events::EventBus;
use crate::lifecycle::{LifecycleManager, ServiceLocks};
use crate::metrics::MetricsSampler;
use crate::pipeline::{DeployQueue, Pipeline};
use crate::plan::{BuildPlanResolver, MarkerResolver};
use crate::pool::PoolConfig;
use crate::ports::PortAllocator;
use crate::proxy::{DomainCache, Proxy, ProxyServer, RouteResolver, BASE_DOMAIN_KEY};
use crate::source::Workspace;
use crate::ws::EventStream;

/// Every shared component, built once at startup
pub struct Platform {
    pub config: Config,
    pub db: Arc<Database>,
    pub events: EventBus,
    pub lifecycle: Arc<LifecycleManager>,
    pub control: Arc<ServiceControl>,
    pub queue: DeployQueue,
    pub domains: Arc<DomainCache>,
    pub api: Arc<PlatformApi>,
    pub proxy: Arc<Proxy>,
    /// The deploy worker; finishes after shutdown is signalled
    pub worker: JoinHandle<()>,
}

impl Platform {
    /// Build the component graph and start the deploy worker.
    /// Must run inside a tokio runtime.
    pub fn assemble(
        config: Config,
        db: Arc<Database>,
        engine: Arc<dyn ContainerEngine>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        seed_base_domain(&db, &config)?;

        let events = EventBus::new();
        let locks = ServiceLocks::new();
        let workspace = Workspace::new(config.services_dir());
        let lifecycle = Arc::new(LifecycleManager::new(engine, db.clone(), config.engine.clone()));
        let ports = Arc::new(PortAllocator::new(db.clone(), config.ports.base).with_host_probe());
        let resolver: Arc<dyn BuildPlanResolver> =
            Arc::new(MarkerResolver::new(&config.pipeline.node_version));

        let pipeline = Arc::new(Pipeline::new(
            db.clone(),
            lifecycle.clone(),
            ports.clone(),
            resolver,
            workspace.clone(),
            events.clone(),
            locks.clone(),
            config.pipeline.clone(),
        ));
        let (queue, worker) = DeployQueue::start(pipeline, shutdown_rx);

        let default_limits = ResourceLimits {
            cpu: config.limits.cpu,
            memory: config.limits.memory,
        };
        let control = Arc::new(ServiceControl::new(
            db.clone(),
            lifecycle.clone(),
            ports,
            locks,
            events.clone(),
            workspace,
            queue.clone(),
            default_limits,
        ));

        let domains = Arc::new(DomainCache::new(
            db.clone(),
            Duration::from_secs(config.proxy.domain_cache_ttl_secs),
        ));
        let stream = Arc::new(EventStream::new(db.clone(), lifecycle.clone(), events.clone()));
        let api = Arc::new(PlatformApi::new(
            control.clone(),
            db.clone(),
            lifecycle.clone(),
            domains.clone(),
            stream,
            config.uploads_dir(),
        ));

        let proxy = Arc::new(Proxy::new(
            RouteResolver::new(db.clone(), domains.clone()),
            PoolConfig {
                max_idle_per_host: config.proxy.max_idle_per_host,
                idle_timeout: Duration::from_secs(config.proxy.idle_timeout_secs),
            },
            Duration::from_secs(config.proxy.upstream_timeout_secs),
        ));

        Ok(Self {
            config,
            db,
            events,
            lifecycle,
            control,
            queue,
            domains,
            api,
            proxy,
            worker,
        })
    }

    /// The listener serving both the platform API and service subdomains
    pub fn server(&self, shutdown_rx: watch::Receiver<bool>) -> ProxyServer {
        ProxyServer::new(self.proxy.clone(), self.api.clone(), shutdown_rx)
            .with_header_timeout(Duration::from_secs(self.config.server.request_timeout_secs))
    }

    pub fn sampler(&self, shutdown_rx: watch::Receiver<bool>) -> MetricsSampler {
        MetricsSampler::new(
            self.db.clone(),
            self.lifecycle.clone(),
            self.events.clone(),
            self.config.metrics.clone(),
            shutdown_rx,
        )
    }
}

/// Store the configured base domain unless one was already set at runtime
fn seed_base_domain(db: &Database, config: &Config) -> anyhow::Result<()> {
    if let Some(domain) = &config.proxy.base_domain {
        if db.get_setting(BASE_DOMAIN_KEY)?.is_none() {
            db.set_setting(BASE_DOMAIN_KEY, domain)?;
            info!(domain = %domain, "Seeded base domain from configuration");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_does_not_override_runtime_setting() {
        let db = Database::open_in_memory().unwrap();
        let mut config = Config::default();
        config.proxy.base_domain = Some("seed.test".to_string());

        seed_base_domain(&db, &config).unwrap();
        assert_eq!(db.get_setting(BASE_DOMAIN_KEY).unwrap().as_deref(), Some("seed.test"));

        db.set_setting(BASE_DOMAIN_KEY, "runtime.test").unwrap();
        seed_base_domain(&db, &config).unwrap();
        assert_eq!(db.get_setting(BASE_DOMAIN_KEY).unwrap().as_deref(), Some("runtime.test"));
    }
}
