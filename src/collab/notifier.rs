//! Notification fan-out collaborator
//!
//! The orchestrator raises one notification per detected remote change; who
//! actually delivers it (timeline, email, push) is outside the engine.

use super::UserProfile;
use crate::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};

/// What changed on a ticket during a pull cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketChangeKind {
    StatusChanged,
    NewComments,
    NewAttachments,
}

impl TicketChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketChangeKind::StatusChanged => "status_changed",
            TicketChangeKind::NewComments => "new_comments",
            TicketChangeKind::NewAttachments => "new_attachments",
        }
    }
}

/// One detected change on one ticket
#[derive(Debug, Clone)]
pub struct TicketChange {
    pub ticket_id: i64,
    pub kind: TicketChangeKind,
    pub detail: String,
}

/// Notification contract
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, recipients: &[UserProfile], change: &TicketChange) -> Result<()>;
}

/// Notifier that only logs, used when no delivery channel is wired up
#[derive(Default)]
pub struct LogNotifier {
    delivered: AtomicUsize,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of notifications emitted so far
    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, recipients: &[UserProfile], change: &TicketChange) -> Result<()> {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            ticket_id = change.ticket_id,
            kind = change.kind.as_str(),
            recipients = recipients.len(),
            detail = %change.detail,
            "Ticket change notification"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_notifier_counts() {
        let notifier = LogNotifier::new();
        let change = TicketChange {
            ticket_id: 12,
            kind: TicketChangeKind::StatusChanged,
            detail: "OPENED -> CLOSED".to_string(),
        };
        notifier.notify(&[], &change).await.unwrap();
        notifier.notify(&[], &change).await.unwrap();
        assert_eq!(notifier.delivered(), 2);
    }
}
