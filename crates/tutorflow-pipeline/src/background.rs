//! Supervised background side effects.
//!
//! Work that must not delay a turn (turn-log appends, offline-review records)
//! runs here instead of as detached tasks. Every task has a name, its failure
//! is logged and counted, and its outcome is reported on an optional channel.

use std::future::Future;

use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Outcome of one background task.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub name: &'static str,
    pub session_id: String,
    pub result: Result<(), String>,
}

#[derive(Clone)]
pub struct BackgroundTasks {
    tracker: TaskTracker,
    reports: Option<mpsc::UnboundedSender<TaskReport>>,
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::new()
    }
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self {
            tracker: TaskTracker::new(),
            reports: None,
        }
    }

    /// Supervisor that also reports every outcome on the returned channel.
    pub fn with_reports() -> (Self, mpsc::UnboundedReceiver<TaskReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tracker: TaskTracker::new(),
                reports: Some(tx),
            },
            rx,
        )
    }

    pub fn spawn<F>(&self, name: &'static str, session_id: &str, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let reports = self.reports.clone();
        let session_id = session_id.to_string();
        self.tracker.spawn(async move {
            let result = task.await.map_err(|e| format!("{e:#}"));
            match &result {
                Ok(()) => debug!(task = name, session_id = %session_id, "Background task done"),
                Err(e) => {
                    warn!(task = name, session_id = %session_id, error = %e, "Background task failed");
                    crate::metrics::record_background_failure(name);
                }
            }
            if let Some(tx) = reports {
                let _ = tx.send(TaskReport {
                    name,
                    session_id,
                    result,
                });
            }
        });
    }

    /// Number of tasks still running.
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Wait until every task spawned so far has finished.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_outcomes_are_reported() {
        let (tasks, mut reports) = BackgroundTasks::with_reports();
        tasks.spawn("ok_task", "s1", async { Ok(()) });
        tasks.spawn("bad_task", "s1", async { anyhow::bail!("disk full") });
        tasks.wait_idle().await;

        let mut seen = Vec::new();
        while let Ok(report) = reports.try_recv() {
            seen.push(report);
        }
        seen.sort_by_key(|r| r.name);
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].name, "bad_task");
        assert_eq!(seen[0].result, Err("disk full".to_string()));
        assert!(seen[1].result.is_ok());
        assert_eq!(tasks.pending(), 0);
    }

    #[tokio::test]
    async fn test_spawn_after_wait_idle() {
        let (tasks, mut reports) = BackgroundTasks::with_reports();
        tasks.wait_idle().await;
        tasks.spawn("late", "s2", async { Ok(()) });
        tasks.wait_idle().await;
        assert_eq!(reports.try_recv().map(|r| r.name).ok(), Some("late"));
    }
}
