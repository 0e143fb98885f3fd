//! Change detector: periodic sampling, diffing, threshold evaluation.
//!
//! Runs on one logical timer. Owns the last emitted samples and the per
//! component health levels; its only output is broadcast tasks handed to the
//! scheduler.

use crate::config::DetectorConfig;
use crate::registry::ConnectionRegistry;
use crate::sampler::{RequestStats, SystemSampler};
use crate::scheduler::BroadcastScheduler;
use pulse_protocol::{MessageType, Priority, ServerEvent};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// The snapshot the detector diffs tick over tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
    pub active_connections: usize,
    pub online: bool,
}

/// One changed field in a `status_update`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub field: &'static str,
    pub old_value: Value,
    pub new_value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthComponent {
    Cpu,
    Memory,
    Disk,
}

impl HealthComponent {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthComponent::Cpu => "cpu",
            HealthComponent::Memory => "memory",
            HealthComponent::Disk => "disk",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthLevel {
    #[default]
    Info,
    Warning,
    Critical,
}

impl HealthLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthLevel::Info => "info",
            HealthLevel::Warning => "warning",
            HealthLevel::Critical => "critical",
        }
    }
}

/// Level function: `value > T+15` is critical, `value > T` is warning.
pub fn level_for(value: f64, threshold: f64) -> HealthLevel {
    if value > threshold + 15.0 {
        HealthLevel::Critical
    } else if value > threshold {
        HealthLevel::Warning
    } else {
        HealthLevel::Info
    }
}

enum HealthEmission {
    Urgent { event: ServerEvent, data: Value },
    Queued { event: ServerEvent, data: Value, priority: Priority },
}

pub struct ChangeDetector {
    registry: Arc<ConnectionRegistry>,
    scheduler: Arc<BroadcastScheduler>,
    sampler: Arc<dyn SystemSampler>,
    config: DetectorConfig,
    last_status: Mutex<Option<SystemStatus>>,
    last_stats: Mutex<Option<RequestStats>>,
    levels: Mutex<HashMap<HealthComponent, HealthLevel>>,
}

impl ChangeDetector {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        scheduler: Arc<BroadcastScheduler>,
        sampler: Arc<dyn SystemSampler>,
        config: DetectorConfig,
    ) -> Self {
        Self {
            registry,
            scheduler,
            sampler,
            config,
            last_status: Mutex::new(None),
            last_stats: Mutex::new(None),
            levels: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn the sampling loop on its own timer.
    pub fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let detector = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(std::time::Duration::from_millis(detector.config.sample_interval_ms));
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => detector.tick().await,
                    _ = shutdown.changed() => break,
                }
            }
            debug!("change detector stopped");
        })
    }

    /// Drop the last status sample so the next tick re-emits unconditionally.
    pub fn force_status_broadcast(&self) {
        *self.last_status.lock().expect("status lock poisoned") = None;
    }

    /// Drop the last stats sample so the next tick re-emits unconditionally.
    pub fn force_stats_broadcast(&self) {
        *self.last_stats.lock().expect("stats lock poisoned") = None;
    }

    /// One sampling pass. A missing sample is no change, not a stall.
    pub async fn tick(&self) {
        if let Some(host) = self.sampler.host() {
            let current = SystemStatus {
                cpu: host.cpu,
                memory: host.memory,
                disk: host.disk,
                active_connections: self.registry.total().await,
                online: host.online,
            };
            self.detect_status(&current);
            let emissions = self.evaluate_health(&current);
            for emission in emissions {
                match emission {
                    HealthEmission::Urgent { event, data } => {
                        self.scheduler
                            .broadcast_urgent(MessageType::Health, event, data)
                            .await;
                    }
                    HealthEmission::Queued { event, data, priority } => {
                        self.scheduler
                            .broadcast(MessageType::Health, event, data, priority);
                    }
                }
            }
        }
        self.detect_stats();
    }

    fn detect_status(&self, current: &SystemStatus) {
        let emission = {
            let mut last = self.last_status.lock().expect("status lock poisoned");
            match last.as_ref() {
                None => {
                    let changes = vec![Change {
                        field: "all",
                        old_value: Value::Null,
                        new_value: serde_json::to_value(current).unwrap_or(Value::Null),
                        delta: None,
                    }];
                    *last = Some(current.clone());
                    Some((changes, Priority::Normal))
                }
                Some(previous) => {
                    let changes = diff_status(previous, current);
                    if changes.is_empty() {
                        None
                    } else {
                        let priority = status_priority(previous, current, &changes, &self.config);
                        *last = Some(current.clone());
                        Some((changes, priority))
                    }
                }
            }
        };
        if let Some((changes, priority)) = emission {
            let data = json!({
                "status": current,
                "changes": changes,
            });
            self.scheduler
                .broadcast(MessageType::Status, ServerEvent::StatusUpdate, data, priority);
        }
    }

    fn evaluate_health(&self, current: &SystemStatus) -> Vec<HealthEmission> {
        let gauges = [
            (HealthComponent::Cpu, current.cpu, self.config.cpu_threshold),
            (HealthComponent::Memory, current.memory, self.config.memory_threshold),
            (HealthComponent::Disk, current.disk, self.config.disk_threshold),
        ];
        let mut emissions = Vec::new();
        let mut levels = self.levels.lock().expect("levels lock poisoned");
        for (component, value, threshold) in gauges {
            let new_level = level_for(value, threshold);
            let previous = levels.get(&component).copied().unwrap_or_default();
            if new_level == previous {
                continue;
            }
            levels.insert(component, new_level);
            let data = json!({
                "component": component.as_str(),
                "level": new_level.as_str(),
                "value": value,
                "threshold": threshold,
            });
            let emission = match new_level {
                HealthLevel::Critical => HealthEmission::Urgent {
                    event: ServerEvent::HealthAlert,
                    data,
                },
                HealthLevel::Warning => HealthEmission::Queued {
                    event: ServerEvent::HealthAlert,
                    data,
                    priority: Priority::Normal,
                },
                HealthLevel::Info => HealthEmission::Queued {
                    event: ServerEvent::HealthRecovery,
                    data,
                    priority: Priority::Normal,
                },
            };
            emissions.push(emission);
        }
        emissions
    }

    fn detect_stats(&self) {
        let Some(current) = self.sampler.requests() else {
            return;
        };
        let emit = {
            let mut last = self.last_stats.lock().expect("stats lock poisoned");
            let changed = match last.as_ref() {
                None => true,
                Some(previous) => {
                    (current.per_second - previous.per_second).abs() > 5.0
                        || current.total != previous.total
                }
            };
            if changed {
                *last = Some(current);
            }
            changed
        };
        if emit {
            let data = json!({ "requests": current });
            self.scheduler.broadcast(
                MessageType::Stats,
                ServerEvent::StatsUpdate,
                data,
                Priority::Normal,
            );
        }
    }
}

fn diff_status(previous: &SystemStatus, current: &SystemStatus) -> Vec<Change> {
    let mut changes = Vec::new();
    let mut gauge = |field: &'static str, old: f64, new: f64| {
        if (old - new).abs() > f64::EPSILON {
            changes.push(Change {
                field,
                old_value: json!(old),
                new_value: json!(new),
                delta: Some(new - old),
            });
        }
    };
    gauge("cpu", previous.cpu, current.cpu);
    gauge("memory", previous.memory, current.memory);
    gauge("disk", previous.disk, current.disk);
    if previous.active_connections != current.active_connections {
        #[allow(clippy::cast_precision_loss)]
        changes.push(Change {
            field: "activeConnections",
            old_value: json!(previous.active_connections),
            new_value: json!(current.active_connections),
            delta: Some(current.active_connections as f64 - previous.active_connections as f64),
        });
    }
    if previous.online != current.online {
        changes.push(Change {
            field: "online",
            old_value: json!(previous.online),
            new_value: json!(current.online),
            delta: None,
        });
    }
    changes
}

/// Severity of a status diff: threshold crossings on the critical gauges win,
/// then breadth of change.
fn status_priority(
    previous: &SystemStatus,
    current: &SystemStatus,
    changes: &[Change],
    config: &DetectorConfig,
) -> Priority {
    let cpu_crossed = current.cpu > config.cpu_threshold && previous.cpu <= config.cpu_threshold;
    let memory_crossed =
        current.memory > config.memory_threshold && previous.memory <= config.memory_threshold;
    if cpu_crossed || memory_crossed {
        Priority::High
    } else if changes.len() > 3 {
        Priority::Normal
    } else {
        Priority::Low
    }
}
