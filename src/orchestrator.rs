//! Escalation and synchronization orchestrator
//!
//! Glues the local store, the object store, the directory and the configured
//! tracker adapter together. Two entry points matter: `escalate` pushes one
//! ticket out to the tracker, `pull_cycle` drains "changed since watermark"
//! pages and applies each remote update. Refusals and unknown tickets are
//! values, not errors.

use crate::backend::retry::{with_retry, RetryConfig};
use crate::backend::{
    collapse_status, AttachmentPayload, BugTracker, EscalationReceipt, EscalationRequest,
    FetchOutcome, PullPage,
};
use crate::collab::{Directory, Notifier, ObjectStore, TicketChange, TicketChangeKind, UserProfile};
use crate::metrics;
use crate::model::{Attachment, Comment, EscalationStatus, Issue, RemoteId, Ticket, TicketStatus};
use crate::reconcile;
use crate::store::TicketStore;
use crate::{BridgeError, Result};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Forward skew applied to the watermark after a fully successful pull pass,
/// absorbing clock precision drift between us and the tracker
const WATERMARK_SKEW_SECS: i64 = 2;

/// Terminal state of one escalation attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscalationOutcome {
    /// Remote issue exists, local bookkeeping committed
    Escalated(RemoteId),
    /// Message accepted by an asynchronous backend; the remote id arrives
    /// later in an inbound update
    Pending,
    /// Another escalation is in flight or already succeeded, or the ticket
    /// is no longer escalatable
    Refused,
    /// No such ticket locally
    NotFound,
}

/// Summary of one pull pass
#[derive(Debug, Default, Clone)]
pub struct PullStats {
    pub issues_seen: usize,
    pub changes: usize,
}

pub struct Orchestrator {
    store: Arc<Mutex<TicketStore>>,
    tracker: Arc<dyn BugTracker>,
    objects: Arc<dyn ObjectStore>,
    directory: Arc<dyn Directory>,
    notifier: Arc<dyn Notifier>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<Mutex<TicketStore>>,
        tracker: Arc<dyn BugTracker>,
        objects: Arc<dyn ObjectStore>,
        directory: Arc<dyn Directory>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            tracker,
            objects,
            directory,
            notifier,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.tracker.name()
    }

    // ============ Escalation ============

    /// Escalate one ticket to the configured tracker
    ///
    /// The conditional escalation-start update is the sole concurrency guard:
    /// of two concurrent calls for the same ticket, exactly one proceeds and
    /// the other observes `Refused`. Any failure after the guard flips the
    /// ticket to `Failed` so a later attempt can retry.
    ///
    /// A crash between remote success and the local commit leaves a remote
    /// issue the store does not know about; the next attempt would then
    /// create a duplicate. Accepted gap, see DESIGN.md.
    pub async fn escalate(&self, ticket_id: i64) -> Result<EscalationOutcome> {
        let backend = self.tracker.name();

        let (ticket, comments, attachments) = {
            let store = self.store.lock().await;
            let Some(ticket) = store.get_ticket(ticket_id)? else {
                debug!(ticket_id, "Escalation requested for unknown ticket");
                return Ok(EscalationOutcome::NotFound);
            };

            if !store.begin_escalation(ticket_id, Utc::now())? {
                info!(ticket_id, "Escalation refused, already in flight or done");
                metrics::record_escalation(backend, "refused");
                return Ok(EscalationOutcome::Refused);
            }

            let comments = store.comments_for(ticket_id)?;
            let attachments = store.attachments_for(ticket_id)?;
            (ticket, comments, attachments)
        };

        match self.run_escalation(&ticket, comments, attachments).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                warn!(ticket_id, error = %err, "Escalation failed");
                self.store
                    .lock()
                    .await
                    .finish_escalation(ticket_id, EscalationStatus::Failed)?;
                metrics::record_escalation(backend, "failed");
                metrics::record_api_error("escalate", backend);
                Err(err)
            }
        }
    }

    /// The fallible part of an escalation, run after the guard is held
    async fn run_escalation(
        &self,
        ticket: &Ticket,
        comments: Vec<Comment>,
        attachments: Vec<Attachment>,
    ) -> Result<EscalationOutcome> {
        let backend = self.tracker.name();

        let mut payloads = Vec::with_capacity(attachments.len());
        for attachment in &attachments {
            let (bytes, meta) = self.objects.read(attachment.source.local_id()).await?;
            payloads.push(AttachmentPayload {
                document_id: attachment.source.local_id().to_string(),
                name: attachment.name.clone(),
                content_type: meta.content_type,
                bytes,
            });
        }

        let structure = self.directory.structure(&ticket.structure_id).await?;
        let reporter = self.directory.user(&ticket.owner_id).await?;

        let request = EscalationRequest {
            ticket: ticket.clone(),
            comments,
            attachments: payloads,
            structure,
            reporter,
        };

        match self.tracker.escalate(&request).await? {
            EscalationReceipt::Created(issue) => {
                let remote_id = issue.remote_id.clone();
                self.store.lock().await.commit_escalation_success(&issue)?;
                metrics::record_escalation(backend, "created");
                info!(ticket_id = ticket.id, remote_id = %remote_id, "Ticket escalated");
                Ok(EscalationOutcome::Escalated(remote_id))
            }
            EscalationReceipt::Pending => {
                // Asynchronous backend: record a provisional issue under the
                // ticket's own id; the real remote id arrives inbound and the
                // upsert will land on the same ticket.
                let mut issue = Issue::new(RemoteId::Number(ticket.id), ticket.id, backend);
                issue.content = serde_json::json!({"state": "pending"});
                issue.attachments = request
                    .attachments
                    .iter()
                    .map(|p| {
                        Attachment::from_workspace(&p.document_id, &p.name)
                            .with_content_type(&p.content_type)
                            .with_size(p.bytes.len() as u64)
                    })
                    .collect();
                self.store.lock().await.commit_escalation_success(&issue)?;
                metrics::record_escalation(backend, "pending");
                info!(ticket_id = ticket.id, "Ticket escalation message accepted");
                Ok(EscalationOutcome::Pending)
            }
        }
    }

    // ============ Outward push ============

    /// Add a comment to a ticket and mirror it to the remote issue
    ///
    /// The comment is stored locally first. When the ticket has an escalated
    /// issue, the encoded wire form goes out so the echo coming back in a
    /// later pull carries its identity and is not re-ingested.
    pub async fn push_comment(&self, ticket_id: i64, comment: &Comment) -> Result<()> {
        let issue = {
            let store = self.store.lock().await;
            if store.get_ticket(ticket_id)?.is_none() {
                return Err(BridgeError::NotFound(format!("ticket {}", ticket_id)));
            }
            store.add_comment(ticket_id, comment)?;
            store.get_issue_for_ticket(ticket_id, self.tracker.name())?
        };

        if let Some(issue) = issue {
            let wire = Comment::new(
                crate::codec::encode(comment),
                comment.author.clone(),
                comment.created_at,
            );
            self.tracker.comment_issue(&issue.remote_id, &wire).await?;
            info!(ticket_id, remote_id = %issue.remote_id, "Comment mirrored to tracker");
        }

        Ok(())
    }

    /// Push workspace attachments the remote issue does not know yet
    ///
    /// Pending means workspace-sourced with no remote id. After the upload,
    /// the tracker-assigned ids are read back (by re-fetch where the backend
    /// supports it, by filename convention otherwise) and recorded, which is
    /// what keeps the next pull from re-ingesting our own files.
    pub async fn push_attachments(&self, ticket_id: i64) -> Result<usize> {
        let backend = self.tracker.name();

        let (issue, pending) = {
            let store = self.store.lock().await;
            let Some(issue) = store.get_issue_for_ticket(ticket_id, backend)? else {
                return Err(BridgeError::NotFound(format!(
                    "ticket {} has no escalated issue on {}",
                    ticket_id, backend
                )));
            };
            let locals = store.attachments_for(ticket_id)?;
            let acknowledged: Vec<Attachment> = locals
                .iter()
                .filter(|a| a.remote_id.is_some())
                .cloned()
                .collect();
            let pending: Vec<Attachment> =
                reconcile::new_local_attachments(&locals, &acknowledged)
                    .into_iter()
                    .filter(|a| {
                        matches!(a.source, crate::model::AttachmentSource::Workspace { .. })
                    })
                    .collect();
            (issue, pending)
        };

        if pending.is_empty() {
            return Ok(0);
        }

        let mut payloads = Vec::with_capacity(pending.len());
        for attachment in &pending {
            let (bytes, meta) = self.objects.read(attachment.source.local_id()).await?;
            payloads.push(AttachmentPayload {
                document_id: attachment.source.local_id().to_string(),
                name: attachment.name.clone(),
                content_type: meta.content_type,
                bytes,
            });
        }

        self.tracker
            .sync_attachments(ticket_id, &issue.remote_id, &payloads)
            .await?;

        // Learn the assigned ids; fall back to the filename convention for
        // backends that cannot answer a fetch
        let remote_attachments = match self.tracker.fetch_issue(&issue.remote_id).await? {
            FetchOutcome::Issue(remote) => remote.attachments,
            FetchOutcome::Unsupported => Vec::new(),
        };

        let count = pending.len();
        let store = self.store.lock().await;
        for attachment in pending {
            let remote_id = remote_attachments
                .iter()
                .find(|r| r.name == attachment.name)
                .and_then(|r| r.remote_id.clone())
                .unwrap_or_else(|| attachment.name.clone());
            store.merge_attachment(ticket_id, &attachment.with_remote_id(remote_id))?;
        }

        info!(ticket_id, count, "Pushed local attachments to tracker");
        Ok(count)
    }

    // ============ Remote updates ============

    /// Apply one remote issue snapshot to the local ticket
    ///
    /// `inline_bytes` short-circuits attachment downloads for backends that
    /// ship attachment content inline (keyed by attachment remote id).
    ///
    /// Only deltas act: comments and attachments already known locally are
    /// ignored, a status write happens only when the collapsed remote status
    /// moves the ticket to Resolved or Closed, and exactly one history record
    /// plus one notification goes out per detected change kind.
    pub async fn apply_remote_update(
        &self,
        remote: &Issue,
        inline_bytes: Option<&HashMap<String, Vec<u8>>>,
    ) -> Result<usize> {
        let backend = self.tracker.name();

        let (ticket, local_comments, local_attachments) = {
            let store = self.store.lock().await;

            let ticket_id = if remote.ticket_id != 0 {
                remote.ticket_id
            } else {
                match store.get_issue_by_remote(&remote.remote_id, backend)? {
                    Some(known) => known.ticket_id,
                    None => {
                        debug!(remote_id = %remote.remote_id, "Remote issue has no local ticket, skipping");
                        return Ok(0);
                    }
                }
            };

            let Some(ticket) = store.get_ticket(ticket_id)? else {
                debug!(ticket_id, "Remote update for unknown ticket, skipping");
                return Ok(0);
            };

            let comments = store.comments_for(ticket_id)?;
            let attachments = store.attachments_for(ticket_id)?;
            (ticket, comments, attachments)
        };

        let fresh_comments = reconcile::new_remote_comments(&local_comments, &remote.comments);
        let fresh_attachments = reconcile::new_remote_attachments(
            &local_attachments,
            &remote.attachments,
            self.tracker.stable_attachment_ids(),
        );

        // Ingest attachment bytes before touching the database
        let mut ingested = Vec::with_capacity(fresh_attachments.len());
        for attachment in &fresh_attachments {
            let Some(remote_id) = attachment.remote_id.as_deref() else {
                continue;
            };
            let bytes = match inline_bytes.and_then(|m| m.get(remote_id)) {
                Some(bytes) => bytes.clone(),
                None => self.tracker.download_attachment(remote_id).await?,
            };
            let stored = self
                .objects
                .write(bytes, &attachment.content_type, &attachment.name)
                .await?;
            ingested.push(
                Attachment::from_object_store(stored.id, &attachment.name)
                    .with_remote_id(remote_id)
                    .with_content_type(&attachment.content_type)
                    .with_size(stored.meta.size),
            );
        }

        let new_status = self.status_transition(&ticket, remote);

        let mut changes: Vec<TicketChange> = Vec::new();
        {
            let store = self.store.lock().await;

            for attachment in &ingested {
                store.merge_attachment(ticket.id, attachment)?;
            }
            if !ingested.is_empty() {
                changes.push(TicketChange {
                    ticket_id: ticket.id,
                    kind: TicketChangeKind::NewAttachments,
                    detail: ingested
                        .iter()
                        .map(|a| a.name.as_str())
                        .collect::<Vec<_>>()
                        .join(", "),
                });
            }

            for comment in &fresh_comments {
                let normalized = reconcile::normalize_for_storage(comment);
                store.add_comment(ticket.id, &normalized)?;
            }
            if !fresh_comments.is_empty() {
                changes.push(TicketChange {
                    ticket_id: ticket.id,
                    kind: TicketChangeKind::NewComments,
                    detail: format!("{} new comment(s)", fresh_comments.len()),
                });
            }

            if let Some(status) = new_status {
                let remote_update = remote.last_remote_update.unwrap_or_else(Utc::now);
                store.apply_remote_status(ticket.id, status, remote_update)?;
                changes.push(TicketChange {
                    ticket_id: ticket.id,
                    kind: TicketChangeKind::StatusChanged,
                    detail: format!("{} -> {}", ticket.status.as_str(), status.as_str()),
                });
            }

            // Keep the opaque issue snapshot current under the right ticket;
            // a provisional row from a pending escalation gives way to the
            // real remote id
            let mut snapshot = remote.clone();
            snapshot.ticket_id = ticket.id;
            store.supersede_issue(ticket.id, backend, &snapshot.remote_id)?;
            store.upsert_issue(&snapshot)?;

            for change in &changes {
                store.append_history(ticket.id, change.kind.as_str(), &change.detail)?;
            }
        }

        if !changes.is_empty() {
            let recipients = self.recipients(&ticket).await?;
            for change in &changes {
                self.notifier.notify(&recipients, change).await?;
            }
            info!(
                ticket_id = ticket.id,
                changes = changes.len(),
                "Applied remote update"
            );
        }

        Ok(changes.len())
    }

    /// Decide whether a remote status snapshot moves the local ticket
    ///
    /// Remote vocabularies collapse to {Opened, Resolved, Closed}; only the
    /// two terminal states are allowed to act on the local ticket, so a
    /// tracker-side reopen never silently reopens a ticket here.
    fn status_transition(&self, ticket: &Ticket, remote: &Issue) -> Option<TicketStatus> {
        let token = remote.remote_status.as_deref()?;
        let collapsed = collapse_status(self.tracker.map_remote_status(token));
        if collapsed == ticket.status {
            return None;
        }
        matches!(collapsed, TicketStatus::Resolved | TicketStatus::Closed).then_some(collapsed)
    }

    /// Owner plus the local administrators of the owning structure, deduplicated
    async fn recipients(&self, ticket: &Ticket) -> Result<Vec<UserProfile>> {
        let mut recipients = vec![self.directory.user(&ticket.owner_id).await?];
        for admin in self.directory.local_admins(&ticket.structure_id).await? {
            if recipients.iter().all(|r| r.id != admin.id) {
                recipients.push(admin);
            }
        }
        Ok(recipients)
    }

    // ============ Pull ============

    /// One full pull pass: drain every page at the current watermark, apply
    /// each remote issue, then advance the watermark once
    ///
    /// The watermark moves to `pull_start + 2s` only after every page has been
    /// applied; any failure leaves it untouched so the next pass re-covers the
    /// same window. The advance itself is clamped in SQL and never moves
    /// backward.
    pub async fn pull_cycle(&self) -> Result<PullStats> {
        let backend = self.tracker.name();
        let pull_start = Utc::now();
        let since = self.store.lock().await.watermark(backend)?;

        info!(backend, since = %since, "Pull pass starting");
        let started = std::time::Instant::now();

        // Transient tracker failures on the read path are retried with
        // backoff; escalations never are
        let retry = RetryConfig::quick();

        let mut stats = PullStats::default();
        loop {
            let page: PullPage =
                match with_retry(&retry, "pull", || self.tracker.pull(since)).await {
                    Ok(page) => page,
                    Err(err) => {
                        metrics::record_api_error("pull", backend);
                        metrics::record_pull_cycle("error");
                        return Err(err);
                    }
                };

            stats.issues_seen += page.issues.len();
            for issue in &page.issues {
                stats.changes += self.apply_remote_update(issue, None).await?;
            }

            if !page.has_more {
                break;
            }
            debug!(backend, "More pages at the same watermark");
        }

        let next = pull_start + ChronoDuration::seconds(WATERMARK_SKEW_SECS);
        self.store.lock().await.advance_watermark(backend, next)?;

        metrics::record_pull_duration(backend, started.elapsed().as_secs_f64());
        metrics::record_pull_cycle("success");
        metrics::set_watermark_age(backend, 0.0);

        info!(
            backend,
            issues = stats.issues_seen,
            changes = stats.changes,
            "Pull pass complete"
        );

        Ok(stats)
    }

    /// One-shot remote state check for a single ticket
    pub async fn refresh_ticket(&self, ticket_id: i64) -> Result<usize> {
        let backend = self.tracker.name();
        let issue = {
            let store = self.store.lock().await;
            store.get_issue_for_ticket(ticket_id, backend)?
        };
        let Some(issue) = issue else {
            return Err(BridgeError::NotFound(format!(
                "ticket {} has no escalated issue on {}",
                ticket_id, backend
            )));
        };

        match self.tracker.fetch_issue(&issue.remote_id).await? {
            FetchOutcome::Issue(remote) => self.apply_remote_update(&remote, None).await,
            FetchOutcome::Unsupported => {
                debug!(backend, "Backend cannot fetch, nothing to refresh");
                Ok(0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{LogNotifier, MemoryObjectStore, StaticDirectory, Structure};
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Adapter double: records calls, can be told to fail escalation, and
    /// serves queued pull pages followed by empty ones
    struct FakeTracker {
        fail_escalate: bool,
        pending: bool,
        escalations: AtomicUsize,
        pulls: AtomicUsize,
        pull_pages: std::sync::Mutex<Vec<PullPage>>,
        remote_issue: std::sync::Mutex<Option<Issue>>,
    }

    impl FakeTracker {
        fn new() -> Self {
            Self {
                fail_escalate: false,
                pending: false,
                escalations: AtomicUsize::new(0),
                pulls: AtomicUsize::new(0),
                pull_pages: std::sync::Mutex::new(Vec::new()),
                remote_issue: std::sync::Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl BugTracker for FakeTracker {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn stable_attachment_ids(&self) -> bool {
            true
        }

        fn map_remote_status(&self, token: &str) -> TicketStatus {
            match token {
                "closed" => TicketStatus::Closed,
                "solved" => TicketStatus::Resolved,
                _ => TicketStatus::Opened,
            }
        }

        async fn escalate(&self, request: &EscalationRequest) -> Result<EscalationReceipt> {
            self.escalations.fetch_add(1, Ordering::SeqCst);
            if self.fail_escalate {
                return Err(BridgeError::Tracker("upload 2 of 2 failed".to_string()));
            }
            if self.pending {
                return Ok(EscalationReceipt::Pending);
            }
            let mut issue = Issue::new(RemoteId::Number(500), request.ticket.id, "fake");
            issue.attachments = request
                .attachments
                .iter()
                .map(|p| {
                    Attachment::from_workspace(&p.document_id, &p.name)
                        .with_remote_id(format!("r-{}", p.name))
                })
                .collect();
            Ok(EscalationReceipt::Created(issue))
        }

        async fn fetch_issue(&self, _remote_id: &RemoteId) -> Result<FetchOutcome> {
            match self.remote_issue.lock().unwrap().clone() {
                Some(issue) => Ok(FetchOutcome::Issue(issue)),
                None => Ok(FetchOutcome::Unsupported),
            }
        }

        async fn comment_issue(&self, _remote_id: &RemoteId, _comment: &Comment) -> Result<()> {
            Ok(())
        }

        async fn sync_attachments(
            &self,
            _ticket_id: i64,
            remote_id: &RemoteId,
            _locals: &[AttachmentPayload],
        ) -> Result<RemoteId> {
            Ok(remote_id.clone())
        }

        async fn pull(&self, _since: DateTime<Utc>) -> Result<PullPage> {
            self.pulls.fetch_add(1, Ordering::SeqCst);
            let mut pages = self.pull_pages.lock().unwrap();
            if pages.is_empty() {
                Ok(PullPage {
                    issues: Vec::new(),
                    has_more: false,
                })
            } else {
                Ok(pages.remove(0))
            }
        }

        async fn download_attachment(&self, _remote_id: &str) -> Result<Vec<u8>> {
            Ok(b"remote bytes".to_vec())
        }
    }

    fn directory() -> StaticDirectory {
        let mut dir = StaticDirectory::new();
        dir.add_structure(Structure {
            id: "school-1".to_string(),
            name: "Lycée Exemple".to_string(),
            uai: "0750001A".to_string(),
            academy: "ACADEMY-01".to_string(),
        });
        dir.add_user(UserProfile {
            id: "owner-1".to_string(),
            display_name: "Jean Dupont".to_string(),
            email: None,
            phone: None,
        });
        dir.add_user(UserProfile {
            id: "admin-1".to_string(),
            display_name: "Admin".to_string(),
            email: None,
            phone: None,
        });
        dir.add_admin("school-1", "admin-1");
        dir
    }

    fn orchestrator_with(tracker: FakeTracker) -> (Orchestrator, Arc<Mutex<TicketStore>>, Arc<LogNotifier>) {
        let store = Arc::new(Mutex::new(TicketStore::open_in_memory().unwrap()));
        let notifier = Arc::new(LogNotifier::new());
        let orchestrator = Orchestrator::new(
            store.clone(),
            Arc::new(tracker),
            Arc::new(MemoryObjectStore::new()),
            Arc::new(directory()),
            notifier.clone(),
        );
        (orchestrator, store, notifier)
    }

    fn sample_ticket(id: i64) -> Ticket {
        Ticket::new(id, "Printer broken", "owner-1")
            .with_status(TicketStatus::Opened)
            .with_structure("school-1")
            .with_description("It jams on every page")
    }

    #[tokio::test]
    async fn test_escalate_unknown_ticket_is_a_value() {
        let (orchestrator, _, _) = orchestrator_with(FakeTracker::new());
        let outcome = orchestrator.escalate(99).await.unwrap();
        assert_eq!(outcome, EscalationOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_escalate_success_commits_issue() {
        let (orchestrator, store, _) = orchestrator_with(FakeTracker::new());
        store.lock().await.upsert_ticket(&sample_ticket(1)).unwrap();

        let outcome = orchestrator.escalate(1).await.unwrap();
        assert_eq!(outcome, EscalationOutcome::Escalated(RemoteId::Number(500)));

        let store = store.lock().await;
        let ticket = store.get_ticket(1).unwrap().unwrap();
        assert_eq!(ticket.escalation_status, EscalationStatus::Successful);
        assert!(store.get_issue_for_ticket(1, "fake").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_second_escalation_refused() {
        let (orchestrator, store, _) = orchestrator_with(FakeTracker::new());
        store.lock().await.upsert_ticket(&sample_ticket(2)).unwrap();

        assert_eq!(
            orchestrator.escalate(2).await.unwrap(),
            EscalationOutcome::Escalated(RemoteId::Number(500))
        );
        assert_eq!(
            orchestrator.escalate(2).await.unwrap(),
            EscalationOutcome::Refused
        );
    }

    #[tokio::test]
    async fn test_failed_escalation_flips_to_failed_and_retries() {
        let mut tracker = FakeTracker::new();
        tracker.fail_escalate = true;
        let (orchestrator, store, _) = orchestrator_with(tracker);
        store.lock().await.upsert_ticket(&sample_ticket(3)).unwrap();

        assert!(orchestrator.escalate(3).await.is_err());
        {
            let store = store.lock().await;
            let ticket = store.get_ticket(3).unwrap().unwrap();
            assert_eq!(ticket.escalation_status, EscalationStatus::Failed);
            // No issue was committed
            assert!(store.get_issue_for_ticket(3, "fake").unwrap().is_none());
        }

        // Failed is not a terminal guard state, a retry may proceed
        assert!(store.lock().await.begin_escalation(3, Utc::now()).unwrap());
    }

    #[tokio::test]
    async fn test_pending_receipt_records_provisional_issue() {
        let mut tracker = FakeTracker::new();
        tracker.pending = true;
        let (orchestrator, store, _) = orchestrator_with(tracker);
        store.lock().await.upsert_ticket(&sample_ticket(4)).unwrap();

        assert_eq!(
            orchestrator.escalate(4).await.unwrap(),
            EscalationOutcome::Pending
        );
        let store = store.lock().await;
        let issue = store.get_issue_for_ticket(4, "fake").unwrap().unwrap();
        assert_eq!(issue.remote_id, RemoteId::Number(4));
    }

    #[tokio::test]
    async fn test_remote_close_updates_history_and_notifies_once() {
        let (orchestrator, store, notifier) = orchestrator_with(FakeTracker::new());
        store.lock().await.upsert_ticket(&sample_ticket(5)).unwrap();
        orchestrator.escalate(5).await.unwrap();

        let mut remote = Issue::new(RemoteId::Number(500), 5, "fake");
        remote.remote_status = Some("closed".to_string());
        remote.last_remote_update = Some(Utc::now());

        let changes = orchestrator.apply_remote_update(&remote, None).await.unwrap();
        assert_eq!(changes, 1);
        assert_eq!(notifier.delivered(), 1);

        let store = store.lock().await;
        let ticket = store.get_ticket(5).unwrap().unwrap();
        assert_eq!(ticket.status, TicketStatus::Closed);
        let history = store.history_for(5).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, "status_changed");
    }

    #[tokio::test]
    async fn test_remote_reopen_does_not_touch_local_status() {
        let (orchestrator, store, _) = orchestrator_with(FakeTracker::new());
        store
            .lock()
            .await
            .upsert_ticket(&sample_ticket(6).with_status(TicketStatus::Resolved))
            .unwrap();
        store
            .lock()
            .await
            .upsert_issue(&Issue::new(RemoteId::Number(500), 6, "fake"))
            .unwrap();

        let mut remote = Issue::new(RemoteId::Number(500), 6, "fake");
        remote.remote_status = Some("open".to_string());

        orchestrator.apply_remote_update(&remote, None).await.unwrap();
        let ticket = store.lock().await.get_ticket(6).unwrap().unwrap();
        assert_eq!(ticket.status, TicketStatus::Resolved);
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let (orchestrator, store, notifier) = orchestrator_with(FakeTracker::new());
        store.lock().await.upsert_ticket(&sample_ticket(7)).unwrap();
        orchestrator.escalate(7).await.unwrap();

        let mut remote = Issue::new(RemoteId::Number(500), 7, "fake");
        remote.comments =
            vec![Comment::new("remote note", "agent", Utc::now()).with_remote_id("c-1")];
        remote.attachments = vec![
            Attachment::from_object_store("pending-1", "dump.log").with_remote_id("att-1"),
        ];

        let first = orchestrator.apply_remote_update(&remote, None).await.unwrap();
        assert_eq!(first, 2);
        let second = orchestrator.apply_remote_update(&remote, None).await.unwrap();
        assert_eq!(second, 0);
        assert_eq!(notifier.delivered(), 2);

        let store = store.lock().await;
        assert_eq!(store.comments_for(7).unwrap().len(), 1);
        assert_eq!(store.history_for(7).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_remote_issue_skipped() {
        let (orchestrator, _, notifier) = orchestrator_with(FakeTracker::new());
        let remote = Issue::new(RemoteId::Number(12345), 0, "fake");
        let changes = orchestrator.apply_remote_update(&remote, None).await.unwrap();
        assert_eq!(changes, 0);
        assert_eq!(notifier.delivered(), 0);
    }

    #[tokio::test]
    async fn test_push_comment_mirrors_when_escalated() {
        let (orchestrator, store, _) = orchestrator_with(FakeTracker::new());
        store.lock().await.upsert_ticket(&sample_ticket(8)).unwrap();
        orchestrator.escalate(8).await.unwrap();

        let comment = Comment::new("any news?", "Jean Dupont", Utc::now());
        orchestrator.push_comment(8, &comment).await.unwrap();

        assert_eq!(store.lock().await.comments_for(8).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_push_comment_unknown_ticket() {
        let (orchestrator, _, _) = orchestrator_with(FakeTracker::new());
        let comment = Comment::new("hello", "a", Utc::now());
        assert!(orchestrator.push_comment(42, &comment).await.is_err());
    }

    #[tokio::test]
    async fn test_push_attachments_marks_pending_as_acknowledged() {
        let (orchestrator, store, _) = orchestrator_with(FakeTracker::new());
        store.lock().await.upsert_ticket(&sample_ticket(9)).unwrap();
        orchestrator.escalate(9).await.unwrap();

        // A file attached after escalation
        let stored = orchestrator
            .objects
            .write(b"bytes".to_vec(), "text/plain", "late.txt")
            .await
            .unwrap();
        store
            .lock()
            .await
            .merge_attachment(9, &Attachment::from_workspace(stored.id, "late.txt"))
            .unwrap();

        assert_eq!(orchestrator.push_attachments(9).await.unwrap(), 1);
        // Second push finds nothing pending
        assert_eq!(orchestrator.push_attachments(9).await.unwrap(), 0);

        let attachments = store.lock().await.attachments_for(9).unwrap();
        assert_eq!(attachments.len(), 1);
        assert!(attachments[0].remote_id.is_some());
    }

    #[tokio::test]
    async fn test_pull_cycle_drains_pages_at_same_watermark() {
        let tracker = Arc::new(FakeTracker::new());
        let mut first = Issue::new(RemoteId::Number(600), 10, "fake");
        first.remote_status = Some("solved".to_string());
        first.last_remote_update = Some(Utc::now());
        let mut second = Issue::new(RemoteId::Number(601), 11, "fake");
        second.remote_status = Some("solved".to_string());
        second.last_remote_update = Some(Utc::now());
        *tracker.pull_pages.lock().unwrap() = vec![
            PullPage {
                issues: vec![first],
                has_more: true,
            },
            PullPage {
                issues: vec![second],
                has_more: false,
            },
        ];

        let store = Arc::new(Mutex::new(TicketStore::open_in_memory().unwrap()));
        let orchestrator = Orchestrator::new(
            store.clone(),
            tracker.clone(),
            Arc::new(MemoryObjectStore::new()),
            Arc::new(directory()),
            Arc::new(LogNotifier::new()),
        );
        store.lock().await.upsert_ticket(&sample_ticket(10)).unwrap();
        store.lock().await.upsert_ticket(&sample_ticket(11)).unwrap();
        let before = store.lock().await.watermark("fake").unwrap();

        let stats = orchestrator.pull_cycle().await.unwrap();

        // Both pages drained in one pass, then the pass stopped
        assert_eq!(tracker.pulls.load(Ordering::SeqCst), 2);
        assert_eq!(stats.issues_seen, 2);
        assert_eq!(stats.changes, 2);

        let store = store.lock().await;
        assert_eq!(
            store.get_ticket(10).unwrap().unwrap().status,
            TicketStatus::Resolved
        );
        assert_eq!(
            store.get_ticket(11).unwrap().unwrap().status,
            TicketStatus::Resolved
        );
        assert!(store.watermark("fake").unwrap() > before);
    }

    #[tokio::test]
    async fn test_refresh_ticket_applies_remote_state() {
        let tracker = FakeTracker::new();
        let mut remote = Issue::new(RemoteId::Number(500), 12, "fake");
        remote.remote_status = Some("closed".to_string());
        remote.last_remote_update = Some(Utc::now());
        *tracker.remote_issue.lock().unwrap() = Some(remote);

        let (orchestrator, store, _) = orchestrator_with(tracker);
        store.lock().await.upsert_ticket(&sample_ticket(12)).unwrap();
        orchestrator.escalate(12).await.unwrap();

        assert_eq!(orchestrator.refresh_ticket(12).await.unwrap(), 1);
        let ticket = store.lock().await.get_ticket(12).unwrap().unwrap();
        assert_eq!(ticket.status, TicketStatus::Closed);

        assert!(orchestrator.refresh_ticket(99).await.is_err());
    }

    #[tokio::test]
    async fn test_pull_cycle_advances_watermark() {
        let (orchestrator, store, _) = orchestrator_with(FakeTracker::new());
        let before = store.lock().await.watermark("fake").unwrap();

        orchestrator.pull_cycle().await.unwrap();

        let after = store.lock().await.watermark("fake").unwrap();
        assert!(after > before);
    }
}
