//! Background task driving a [`MessageProcessor`] on its poll interval.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use super::{MessageProcessor, TickReport};
use crate::store::MessageStore;

/// Processor runtime statistics, cumulative since spawn.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ProcessorStats {
    pub ticks: u64,
    pub failed_ticks: u64,
    pub claimed: u64,
    pub processed: u64,
    pub retried: u64,
    pub failed: u64,
    pub skipped: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
}

impl ProcessorStats {
    fn absorb(&mut self, report: &TickReport) {
        self.ticks += 1;
        self.claimed += report.claimed as u64;
        self.processed += report.processed as u64;
        self.retried += report.retried as u64;
        self.failed += report.failed as u64;
        self.skipped += report.skipped as u64;
        self.last_tick_at = Some(Utc::now());
    }
}

fn lock_stats(stats: &Mutex<ProcessorStats>) -> MutexGuard<'_, ProcessorStats> {
    match stats.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Handle to control a running processor.
#[derive(Debug)]
pub struct ProcessorHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<ProcessorStats>>,
}

impl ProcessorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `false` when the processor was disabled by configuration.
    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|j| !j.is_finished())
    }

    /// Request graceful shutdown. A tick in progress runs to completion first.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                error!(processor = %self.name, error = %err, "processor task ended abnormally");
            }
        }
    }

    /// Get current processor statistics.
    pub fn stats(&self) -> ProcessorStats {
        lock_stats(&self.stats).clone()
    }
}

impl<S: MessageStore> MessageProcessor<S> {
    /// Run [`tick`](Self::tick) every `poll_interval` on a tokio task until shut down.
    ///
    /// A disabled processor spawns nothing; its handle reports `is_running() == false`.
    pub fn spawn(self) -> ProcessorHandle {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(ProcessorStats::default()));
        let name = self.name.clone();

        if !self.config.enabled {
            info!(processor = %name, "processor disabled by configuration");
            return ProcessorHandle {
                name,
                shutdown,
                join: None,
                stats,
            };
        }

        let task_stats = Arc::clone(&stats);
        let join = tokio::spawn(async move {
            info!(
                processor = %self.name,
                table = %self.table,
                poll_interval_ms = self.config.poll_interval.as_millis() as u64,
                batch_size = self.config.batch_size,
                "processor started"
            );

            let mut interval = tokio::time::interval(self.config.poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        match self.tick().await {
                            Ok(report) => {
                                lock_stats(&task_stats).absorb(&report);
                            }
                            Err(err) => {
                                lock_stats(&task_stats).failed_ticks += 1;
                                error!(processor = %self.name, error = %err, "tick failed");
                            }
                        }
                    }
                }
            }

            info!(processor = %self.name, "processor stopped");
        });

        ProcessorHandle {
            name,
            shutdown,
            join: Some(join),
            stats,
        }
    }
}
