//! Periodic overdue sweep.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::orchestrator::WorkflowOrchestrator;

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    /// Open or overdue instances looked at.
    pub scanned: usize,
    /// Instances that went from `OPEN` to `OVERDUE`.
    pub marked_overdue: usize,
    /// Applicant stages closed as `EXPIRED`.
    pub expired: usize,
    pub notifications_sent: usize,
    /// One message per instance that could not be processed.
    pub errors: Vec<String>,
}

impl SweepSummary {
    pub fn is_quiet(&self) -> bool {
        self.marked_overdue == 0
            && self.expired == 0
            && self.notifications_sent == 0
            && self.errors.is_empty()
    }
}

pub async fn sweep_loop(orchestrator: Arc<WorkflowOrchestrator>, every: Duration) {
    let mut interval = interval(every);

    loop {
        interval.tick().await;

        let now = orchestrator.now();
        match orchestrator.sweep_overdue(now).await {
            Ok(summary) if summary.is_quiet() => {
                info!("Overdue sweep: {} open stage(s), nothing due", summary.scanned)
            }
            Ok(summary) => {
                info!(
                    "Overdue sweep: {} scanned, {} marked overdue, {} expired, {} notified",
                    summary.scanned,
                    summary.marked_overdue,
                    summary.expired,
                    summary.notifications_sent
                );
                for e in &summary.errors {
                    warn!("Overdue sweep error: {}", e);
                }
            }
            Err(e) => error!("Overdue sweep failed: {}", e),
        }
    }
}
