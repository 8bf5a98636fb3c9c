//! Bug tracker backends
//!
//! Adapters for Redmine, Zendesk, and the asynchronous Pivot exchange, behind
//! one contract. The orchestrator and scheduler are generic over the
//! [`BugTracker`] trait and never over concrete adapters.
//!
//! # Sync Flow
//!
//! 1. **Escalation** (local → remote): upload all attachments, create the
//!    remote issue, push one aggregated comment.
//! 2. **Pull**: list remote issues changed since the watermark, page by page.
//! 3. **Reconcile**: diff the remote state against the locally known issue
//!    and apply only the new items (see `reconcile`).

pub mod pivot;
pub mod redmine;
pub mod retry;
pub mod zendesk;

pub use pivot::{InboundUpdate, PivotAdapter};
pub use redmine::RedmineAdapter;
pub use zendesk::ZendeskAdapter;

use crate::collab::{Structure, UserProfile};
use crate::model::{Comment, Issue, RemoteId, Ticket, TicketStatus};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Bytes and metadata for one local attachment to push outward
#[derive(Debug, Clone)]
pub struct AttachmentPayload {
    /// Workspace document id of the local file
    pub document_id: String,
    pub name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Everything an adapter needs to escalate one ticket
#[derive(Debug, Clone)]
pub struct EscalationRequest {
    pub ticket: Ticket,
    pub comments: Vec<Comment>,
    pub attachments: Vec<AttachmentPayload>,
    pub structure: Structure,
    pub reporter: UserProfile,
}

/// Result of an escalation call
#[derive(Debug, Clone)]
pub enum EscalationReceipt {
    /// The remote issue exists; synchronous backends return it fully formed
    Created(Issue),
    /// The message was posted; completion will be observed through later
    /// inbound messages (asynchronous backends)
    Pending,
}

/// Result of a fetch call
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Issue(Issue),
    /// The backend never answers synchronously (Pivot)
    Unsupported,
}

/// One page of a "changed since" listing
#[derive(Debug, Clone, Default)]
pub struct PullPage {
    pub issues: Vec<Issue>,
    /// More pages remain at the same watermark
    pub has_more: bool,
}

/// The synchronization contract every backend adapter implements
#[async_trait]
pub trait BugTracker: Send + Sync {
    /// Backend name used for storage keys and metrics labels
    fn name(&self) -> &'static str;

    /// Whether the backend assigns stable attachment ids
    ///
    /// Backends without stable ids require the duplicate-by-filename check
    /// during reconciliation.
    fn stable_attachment_ids(&self) -> bool;

    /// Map a remote status token onto the canonical ticket status
    ///
    /// Pure; unknown tokens degrade to [`TicketStatus::New`] rather than fail.
    fn map_remote_status(&self, token: &str) -> TicketStatus;

    /// Escalate a ticket: upload all attachments (concurrently; any failure
    /// aborts before a remote issue exists), create the issue, then push one
    /// aggregated comment when the ticket already has comments
    async fn escalate(&self, request: &EscalationRequest) -> Result<EscalationReceipt>;

    /// Fetch the current remote state of an issue, comments and attachments
    /// included
    async fn fetch_issue(&self, remote_id: &RemoteId) -> Result<FetchOutcome>;

    /// Append one comment to an existing issue
    async fn comment_issue(&self, remote_id: &RemoteId, comment: &Comment) -> Result<()>;

    /// Upload local attachments the remote issue does not know yet
    async fn sync_attachments(
        &self,
        ticket_id: i64,
        remote_id: &RemoteId,
        locals: &[AttachmentPayload],
    ) -> Result<RemoteId>;

    /// List remote issues changed since the watermark; `has_more` asks the
    /// scheduler to pull again at the same watermark
    async fn pull(&self, since: DateTime<Utc>) -> Result<PullPage>;

    /// Download the bytes of a remote attachment by its tracker-assigned id
    async fn download_attachment(&self, remote_id: &str) -> Result<Vec<u8>>;
}

/// Rebuild the attachment list of a freshly created issue from the uploaded
/// payloads, taking the tracker-assigned ids from the fetched remote state
/// (matched by filename). Keeping the workspace source plus the remote id is
/// what lets later pulls recognize our own uploads instead of re-ingesting
/// them.
pub(crate) fn reconcile_uploaded(
    uploaded: &[AttachmentPayload],
    remote: &[crate::model::Attachment],
) -> Vec<crate::model::Attachment> {
    uploaded
        .iter()
        .map(|payload| {
            let mut attachment =
                crate::model::Attachment::from_workspace(&payload.document_id, &payload.name)
                    .with_content_type(&payload.content_type)
                    .with_size(payload.bytes.len() as u64);
            if let Some(matched) = remote.iter().find(|r| r.name == payload.name) {
                attachment.remote_id = matched.remote_id.clone();
            }
            attachment
        })
        .collect()
}

/// Collapse a mapped remote status into the small set the orchestrator is
/// willing to write back to a local ticket
///
/// Remote vocabularies are richer than the local one; anything that is not a
/// terminal state comes back as Opened to avoid ticket-status churn.
pub fn collapse_status(status: TicketStatus) -> TicketStatus {
    match status {
        TicketStatus::Resolved => TicketStatus::Resolved,
        TicketStatus::Closed => TicketStatus::Closed,
        _ => TicketStatus::Opened,
    }
}
