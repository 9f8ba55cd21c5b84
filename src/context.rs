//! Constructed engine context: owns the store, tier clients, resolver and
//! importer, plus the background import scheduler and its shutdown.

use crate::bulk_import::{BulkImporter, ImportError};
use crate::card_store::SqliteCardStore;
use crate::config::EngineConfig;
use crate::metrics::ResolverMetrics;
use crate::resolver::{
    AcceleratorClient, AcceleratorTier, CardResolver, UpstreamApi, UpstreamClient,
};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub struct EngineContext {
    config: EngineConfig,
    store: Arc<SqliteCardStore>,
    metrics: Arc<ResolverMetrics>,
    resolver: Arc<CardResolver>,
    importer: Arc<BulkImporter>,
    shutdown: CancellationToken,
    scheduler_handle: Option<JoinHandle<()>>,
}

impl EngineContext {
    /// Open the store and wire up all components. No network traffic happens
    /// until a lookup or import is issued.
    pub fn init(config: EngineConfig) -> Result<Self> {
        info!("Opening card database at {:?}...", config.db_path);
        let store = Arc::new(SqliteCardStore::open(&config.db_path)?);
        let metrics = Arc::new(ResolverMetrics::new());

        let upstream: Arc<dyn UpstreamApi> = Arc::new(UpstreamClient::new(
            config.upstream_url.clone(),
            config.min_call_spacing,
            config.request_timeout,
            Some(Arc::clone(&store)),
            config.response_cache_ttl,
        ));

        let accelerator: Option<Arc<dyn AcceleratorTier>> =
            config.accelerator_url.clone().map(|url| {
                info!("Accelerator service configured at {}", url);
                Arc::new(AcceleratorClient::new(
                    url,
                    config.probe_timeout,
                    config.request_timeout,
                )) as Arc<dyn AcceleratorTier>
            });

        let resolver = Arc::new(CardResolver::new(
            Arc::clone(&store),
            accelerator,
            Arc::clone(&upstream),
            Arc::clone(&metrics),
        ));
        let importer = Arc::new(BulkImporter::with_batch_size(
            Arc::clone(&store),
            upstream,
            config.import_batch_size,
        ));

        Ok(Self {
            config,
            store,
            metrics,
            resolver,
            importer,
            shutdown: CancellationToken::new(),
            scheduler_handle: None,
        })
    }

    pub fn resolver(&self) -> Arc<CardResolver> {
        Arc::clone(&self.resolver)
    }

    pub fn importer(&self) -> Arc<BulkImporter> {
        Arc::clone(&self.importer)
    }

    pub fn store(&self) -> Arc<SqliteCardStore> {
        Arc::clone(&self.store)
    }

    pub fn metrics(&self) -> Arc<ResolverMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Background task that re-checks import freshness on an interval. The
    /// first tick fires immediately, which covers the cold-start trigger.
    pub fn spawn_import_scheduler(&mut self) {
        if self.scheduler_handle.is_some() {
            return;
        }
        let importer = Arc::clone(&self.importer);
        let token = self.shutdown.clone();
        let check_interval = self.config.import_check_interval;

        info!(
            "Import scheduler running, checking freshness every {:?}",
            check_interval
        );
        self.scheduler_handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !importer.needs_refresh() {
                            continue;
                        }
                        match importer.run(&token).await {
                            Ok(stats) => {
                                info!(
                                    "Scheduled bulk import done: {} records in {} batches",
                                    stats.records, stats.batches
                                );
                            }
                            Err(ImportError::Cancelled) => {
                                info!("Scheduled bulk import cancelled");
                            }
                            Err(e) => {
                                error!("Scheduled bulk import failed: {e}");
                            }
                        }
                    }
                    _ = token.cancelled() => break,
                }
            }
        }));
    }

    /// Cancel in-flight work and wait for the scheduler to stop.
    pub async fn shutdown(mut self) {
        info!("Shutting down engine context...");
        self.shutdown.cancel();
        if let Some(handle) = self.scheduler_handle.take() {
            let _ = tokio::time::timeout(Duration::from_secs(30), handle).await;
        }
        info!("Engine context shutdown complete");
    }
}
