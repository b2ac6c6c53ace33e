//! Best-effort delivery of workflow notifications.
//!
//! Delivery mechanics (email, in-app inbox) live outside this service. The
//! orchestrator hands each `Notification` to a `Notifier` and only logs when
//! that fails.

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{error, info};
use uuid::Uuid;

use ipflow_core::Notification;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifierError(pub String);

impl std::fmt::Display for NotifierError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "notification delivery failed: {}", self.0)
    }
}

impl std::error::Error for NotifierError {}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotifierError>;
}

/// Writes each notification to the log. The default when no outbox is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifierError> {
        info!(
            recipient = %notification.recipient_id,
            submission = %notification.submission_id,
            kind = notification.kind.as_str(),
            "{}",
            notification.title
        );
        Ok(())
    }
}

/// One line of the outbox file.
#[derive(Debug, Serialize)]
struct OutboxRecord {
    id: Uuid,
    queued_at: DateTime<Utc>,
    #[serde(flatten)]
    notification: Notification,
}

/// Appends notifications as JSON lines for a mailer to pick up.
///
/// Writes happen on a background task; `send` only fails once that task has
/// gone away.
pub struct OutboxNotifier {
    sender: mpsc::UnboundedSender<OutboxRecord>,
}

impl OutboxNotifier {
    /// Must be called from inside a Tokio runtime.
    pub fn new(path: PathBuf) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            if let Err(e) = Self::writer_task(path, &mut receiver).await {
                error!("Notification outbox writer failed: {}", e);
            }
        });

        Self { sender }
    }

    async fn writer_task(
        path: PathBuf,
        receiver: &mut mpsc::UnboundedReceiver<OutboxRecord>,
    ) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        info!("Writing notifications to: {:?}", path);

        while let Some(record) = receiver.recv().await {
            match serde_json::to_string(&record) {
                Ok(line) => {
                    if let Err(e) = file.write_all(format!("{}\n", line).as_bytes()).await {
                        error!("Failed to write notification {}: {}", record.id, e);
                        continue;
                    }
                    if let Err(e) = file.flush().await {
                        error!("Failed to flush notification outbox: {}", e);
                    }
                }
                Err(e) => error!("Failed to serialize notification {}: {}", record.id, e),
            }
        }

        info!("Notification outbox writer shutting down");
        Ok(())
    }
}

#[async_trait]
impl Notifier for OutboxNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifierError> {
        let record = OutboxRecord {
            id: Uuid::new_v4(),
            queued_at: Utc::now(),
            notification: notification.clone(),
        };
        self.sender
            .send(record)
            .map_err(|_| NotifierError("outbox writer has shut down".to_string()))
    }
}

/// Keeps every notification in memory. Can be told to fail.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Notification>>,
    failing: Mutex<bool>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut flag) = self.failing.lock() {
            *flag = failing;
        }
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifierError> {
        if self.failing.lock().map(|f| *f).unwrap_or(false) {
            return Err(NotifierError("memory notifier set to fail".to_string()));
        }
        self.sent
            .lock()
            .map_err(|_| NotifierError("notification list poisoned".to_string()))?
            .push(notification.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipflow_core::{NotificationKind, SubmissionId, UserId};
    use std::time::Duration;

    fn notification(title: &str) -> Notification {
        Notification::new(
            UserId::from("applicant-1"),
            NotificationKind::Submitted,
            SubmissionId::from("s1"),
            title,
            "body",
        )
    }

    #[tokio::test]
    async fn test_memory_notifier_collects_and_fails_on_demand() {
        let notifier = MemoryNotifier::new();
        notifier.send(&notification("one")).await.unwrap();

        notifier.set_failing(true);
        assert!(notifier.send(&notification("two")).await.is_err());

        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].title, "one");
    }

    #[tokio::test]
    async fn test_outbox_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox").join("notifications.jsonl");
        let notifier = OutboxNotifier::new(path.clone());

        notifier.send(&notification("first")).await.unwrap();
        notifier.send(&notification("second")).await.unwrap();

        // The writer runs on its own task; poll until both lines land.
        let mut lines = Vec::new();
        for _ in 0..100 {
            if let Ok(contents) = tokio::fs::read_to_string(&path).await {
                lines = contents.lines().map(str::to_string).collect();
                if lines.len() == 2 {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(first["title"], "first");
        assert_eq!(first["kind"], "submitted");
        assert_eq!(first["recipient_id"], "applicant-1");
        assert!(first["id"].is_string());
    }
}
