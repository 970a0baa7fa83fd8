// ABOUTME: Health reconciliation loop comparing recorded box status with live provider state
// ABOUTME: Runs on a fixed interval, checks each box independently and moves drifted boxes to error

use crate::error::{DeployError, Result};
use boxyard_compute::ProviderRegistry;
use boxyard_storage::{BoxRecord, BoxStatus, BoxStorage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

/// Counts from one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub checked: usize,
    pub healthy: usize,
    pub drifted: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckOutcome {
    Healthy,
    Drifted,
    Skipped,
}

pub struct HealthReconciler {
    boxes: BoxStorage,
    providers: ProviderRegistry,
    interval: Duration,
    running: Arc<RwLock<bool>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthReconciler {
    pub fn new(boxes: BoxStorage, providers: ProviderRegistry, interval: Duration) -> Self {
        Self {
            boxes,
            providers,
            interval,
            running: Arc::new(RwLock::new(false)),
            task: Mutex::new(None),
        }
    }

    /// Start the periodic sweep. Calling it again while running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut running = self.running.write().await;
        if *running {
            return;
        }
        *running = true;
        drop(running);

        let reconciler = self.clone();
        let handle = tokio::spawn(async move {
            info!(
                "Health reconciler started (interval: {:?})",
                reconciler.interval
            );
            let mut ticker = time::interval(reconciler.interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if !*reconciler.running.read().await {
                    break;
                }
                match reconciler.run_sweep().await {
                    Ok(report) if report.drifted > 0 || report.failed > 0 => {
                        warn!("Reconciliation sweep: {:?}", report)
                    }
                    Ok(report) => debug!("Reconciliation sweep: {:?}", report),
                    Err(e) => error!("Reconciliation sweep failed: {}", e),
                }
            }
            info!("Health reconciler stopped");
        });

        *self.task.lock().await = Some(handle);
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Check every box that should have a live instance. A failure on one box is logged and counted, never fatal.
    pub async fn run_sweep(&self) -> Result<SweepReport> {
        let watched: Vec<BoxStatus> = BoxStatus::ALL
            .into_iter()
            .filter(BoxStatus::expects_live_instance)
            .collect();
        let boxes = self.boxes.list_boxes(&watched).await?;

        let mut report = SweepReport::default();
        for record in boxes {
            report.checked += 1;
            match self.check_box(&record).await {
                Ok(CheckOutcome::Healthy) => report.healthy += 1,
                Ok(CheckOutcome::Drifted) => report.drifted += 1,
                Ok(CheckOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!("Failed to reconcile box {}: {}", record.id, e);
                }
            }
        }

        Ok(report)
    }

    async fn check_box(&self, record: &BoxRecord) -> Result<CheckOutcome> {
        let deploying = record.status == BoxStatus::Deploying;

        // A deploying box only has an instance to check once the current attempt recorded one
        let instance_id = match record.instance_id.as_deref() {
            Some(id) if !deploying || record.instance_attempt == Some(record.current_attempt) => id,
            _ if deploying => return Ok(CheckOutcome::Skipped),
            _ => return self.drift(record, "instance not found: none recorded").await,
        };

        let provider = self
            .providers
            .get(&record.provider)
            .ok_or_else(|| DeployError::ProviderNotRegistered(record.provider.clone()))?;

        match provider.inspect(instance_id).await {
            Ok(health) if health.is_live_and_healthy() => {
                self.boxes.touch_health_check(&record.id).await?;
                Ok(CheckOutcome::Healthy)
            }
            // Not healthy yet; the health-check step owns that while deploying
            Ok(health) if deploying && health.running => Ok(CheckOutcome::Skipped),
            Ok(health) if health.running => {
                self.drift(record, &format!("instance {} is unhealthy", instance_id))
                    .await
            }
            Ok(_) => {
                self.drift(record, &format!("instance {} is not running", instance_id))
                    .await
            }
            Err(e) if e.is_not_found() => {
                self.drift(record, &format!("instance not found: {}", instance_id))
                    .await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn drift(&self, record: &BoxRecord, message: &str) -> Result<CheckOutcome> {
        let changed = match record.status {
            BoxStatus::Running => self.boxes.mark_running_box_error(&record.id, message).await?,
            BoxStatus::Deploying => {
                self.boxes
                    .fail_deployment(&record.id, record.current_attempt, message)
                    .await?
            }
            _ => false,
        };

        if changed {
            warn!("Box {} drifted: {}", record.id, message);
            Ok(CheckOutcome::Drifted)
        } else {
            // Status moved on since the box was listed
            Ok(CheckOutcome::Skipped)
        }
    }
}
