//! Shared application state and background task wiring.

use crate::config::HubConfig;
use crate::detector::ChangeDetector;
use crate::history::{HistoryProvider, InMemoryHistory};
use crate::registry::ConnectionRegistry;
use crate::sampler::HubSampler;
use crate::scheduler::BroadcastScheduler;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<HubConfig>,
    pub registry: Arc<ConnectionRegistry>,
    pub scheduler: Arc<BroadcastScheduler>,
    pub detector: Arc<ChangeDetector>,
    pub history: Arc<InMemoryHistory>,
    pub history_provider: Arc<dyn HistoryProvider>,
    /// Inbound frames handled since startup; feeds the stats sampler.
    pub request_counter: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(config: HubConfig) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(ConnectionRegistry::new(
            config.limits.max_total_connections,
            config.limits.max_connections_per_user,
        ));
        let history = Arc::new(InMemoryHistory::new(config.history.capacity));
        let scheduler = Arc::new(BroadcastScheduler::new(
            registry.clone(),
            history.clone(),
            config.limits.max_queue_size,
            config.broadcast.batch_size,
            config.flush_interval(),
            config.limits.max_message_size,
        ));
        let request_counter = Arc::new(AtomicU64::new(0));
        let sampler = Arc::new(HubSampler::new(request_counter.clone()));
        let detector = Arc::new(ChangeDetector::new(
            registry.clone(),
            scheduler.clone(),
            sampler,
            config.detector.clone(),
        ));
        Self {
            config,
            registry,
            scheduler,
            detector,
            history_provider: history.clone(),
            history,
            request_counter,
        }
    }

    /// Spawn the three independent tickers: broadcast flush, heartbeat sweep,
    /// and change detection. Each watches the shutdown channel on its own.
    pub fn spawn_background(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let flush = self.scheduler.start(shutdown.clone());
        let detect = self.detector.start(shutdown.clone());
        let sweep = self.spawn_sweeper(shutdown);
        vec![flush, detect, sweep]
    }

    fn spawn_sweeper(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let timeout = self.config.heartbeat_timeout();
        let cadence = std::time::Duration::from_millis(self.config.heartbeat.sweep_interval_ms);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(cadence);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let swept = registry.sweep_timed_out(timeout).await;
                        if !swept.is_empty() {
                            info!(count = swept.len(), "swept timed-out connections");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}
