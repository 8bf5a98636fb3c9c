//! Redmine adapter
//!
//! Synchronous REST backend. Issues live in one configured project; listing
//! uses offset/limit pagination over an `updated_on` filter; comments are
//! Redmine journals with native ids; attachment uploads return a token that
//! the issue-creation call references.

use super::{
    reconcile_uploaded, AttachmentPayload, BugTracker, EscalationReceipt, EscalationRequest,
    FetchOutcome, PullPage,
};
use crate::codec;
use crate::config::RedmineConfig;
use crate::model::{Comment, Issue, RemoteId, TicketStatus};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Per-request timeout for listing operations (large result sets)
const LIST_TIMEOUT: Duration = Duration::from_secs(30);
/// Per-request timeout for single issue fetches
const GET_TIMEOUT: Duration = Duration::from_secs(10);
/// Per-request timeout for create/update/upload operations
const WRITE_TIMEOUT: Duration = Duration::from_secs(15);

/// Redmine API client
pub struct RedmineAdapter {
    client: Client,
    config: RedmineConfig,
    base_url: String,
    api_key: Option<String>,
    // Listing offset, carried between pages of one pull pass
    offset: Mutex<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct UploadResponse {
    upload: UploadToken,
}

#[derive(Debug, Clone, Deserialize)]
struct UploadToken {
    token: String,
}

#[derive(Debug, Clone, Serialize)]
struct UploadRef {
    token: String,
    filename: String,
    content_type: String,
}

#[derive(Debug, Clone, Deserialize)]
struct IssueEnvelope {
    issue: RedmineIssue,
}

#[derive(Debug, Clone, Deserialize)]
struct IssueListResponse {
    issues: Vec<RedmineIssue>,
    total_count: u64,
    offset: u64,
    limit: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct RedmineIssue {
    id: i64,
    subject: String,
    #[serde(default)]
    status: Option<NamedField>,
    #[serde(default)]
    updated_on: Option<String>,
    #[serde(default)]
    journals: Vec<RedmineJournal>,
    #[serde(default)]
    attachments: Vec<RedmineAttachment>,
}

#[derive(Debug, Clone, Deserialize)]
struct NamedField {
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RedmineJournal {
    id: i64,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    user: Option<NamedField>,
    #[serde(default)]
    created_on: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RedmineAttachment {
    id: i64,
    filename: String,
    #[serde(default)]
    filesize: u64,
    #[serde(default)]
    content_type: Option<String>,
}

impl RedmineAdapter {
    /// Create a new Redmine adapter
    ///
    /// Returns a configuration error when the host or project is missing, or
    /// when the HTTP client cannot be created.
    pub fn new(config: RedmineConfig) -> Result<Self> {
        if config.url.trim().is_empty() || config.project_id.trim().is_empty() {
            return Err(crate::BridgeError::Config(
                "Redmine adapter requires url and project_id".to_string(),
            ));
        }

        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        let base_url = config.url.trim_end_matches('/').to_string();
        let api_key = crate::config::resolve_env_credential(&config.api_key_env);

        if api_key.is_none() {
            warn!("Redmine adapter created without an API key");
        }

        Ok(Self {
            client,
            config,
            base_url,
            api_key,
            offset: Mutex::new(0),
        })
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    fn auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("X-Redmine-API-Key", key),
            None => request,
        }
    }

    /// Upload one attachment, returning the token the issue payload references
    async fn upload(&self, payload: &AttachmentPayload) -> Result<UploadRef> {
        let url = format!("{}/uploads.json", self.base_url);

        debug!(filename = %payload.name, size = payload.bytes.len(), "Uploading attachment to Redmine");

        let request = self
            .auth(self.client.post(&url))
            .query(&[("filename", payload.name.as_str())])
            .header("Content-Type", "application/octet-stream")
            .body(payload.bytes.clone());

        let response = request.timeout(WRITE_TIMEOUT).send().await?;

        match response.status() {
            StatusCode::CREATED | StatusCode::OK => {
                let parsed: UploadResponse = response.json().await?;
                Ok(UploadRef {
                    token: parsed.upload.token,
                    filename: payload.name.clone(),
                    content_type: payload.content_type.clone(),
                })
            }
            status => {
                let error_body = response.text().await.unwrap_or_default();
                Err(crate::BridgeError::Tracker(format!(
                    "Redmine upload failed: HTTP {}: {}",
                    status, error_body
                )))
            }
        }
    }

    /// Translate a Redmine issue payload into the engine's issue model
    fn to_issue(&self, remote: &RedmineIssue, raw: serde_json::Value) -> Issue {
        let comments = remote
            .journals
            .iter()
            .filter_map(|journal| {
                let notes = journal.notes.as_deref()?.trim();
                if notes.is_empty() {
                    return None;
                }
                let created = journal
                    .created_on
                    .as_deref()
                    .and_then(parse_remote_ts)
                    .unwrap_or_else(Utc::now);
                let author = journal
                    .user
                    .as_ref()
                    .map(|u| u.name.clone())
                    .unwrap_or_else(|| "redmine".to_string());
                Some(Comment::new(notes, author, created).with_remote_id(journal.id.to_string()))
            })
            .collect();

        let attachments = remote
            .attachments
            .iter()
            .map(|a| {
                crate::model::Attachment::from_object_store(format!("pending-{}", a.id), &a.filename)
                    .with_remote_id(a.id.to_string())
                    .with_content_type(a.content_type.clone().unwrap_or_default())
                    .with_size(a.filesize)
            })
            .collect();

        let mut issue = Issue::new(RemoteId::Number(remote.id), 0, self.name());
        issue.content = raw;
        issue.comments = comments;
        issue.attachments = attachments;
        issue.remote_status = remote.status.as_ref().map(|s| s.name.to_lowercase());
        issue.last_remote_update = remote.updated_on.as_deref().and_then(parse_remote_ts);
        issue
    }

    /// One page of the "changed since" listing
    async fn list_page(&self, since: DateTime<Utc>, offset: u64) -> Result<IssueListResponse> {
        let url = format!("{}/issues.json", self.base_url);
        let since_filter = format!(">={}", since.format("%Y-%m-%dT%H:%M:%SZ"));

        let request = self.auth(self.client.get(&url)).query(&[
            ("project_id", self.config.project_id.as_str()),
            ("updated_on", since_filter.as_str()),
            ("status_id", "*"),
            ("sort", "updated_on"),
            ("offset", &offset.to_string()),
            ("limit", &self.config.page_limit.to_string()),
        ]);

        let response = request.timeout(LIST_TIMEOUT).send().await?;

        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            StatusCode::UNAUTHORIZED => Err(crate::BridgeError::Tracker(
                "Redmine authentication failed".to_string(),
            )),
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60);
                Err(crate::BridgeError::RateLimited(retry_after))
            }
            status => {
                let error_body = response.text().await.unwrap_or_default();
                Err(crate::BridgeError::Tracker(format!(
                    "Redmine list failed: HTTP {}: {}",
                    status, error_body
                )))
            }
        }
    }

    /// One pull step at a given offset
    ///
    /// The list response carries neither journals nor attachments, so every
    /// listed issue is fetched in full before it reaches the apply path.
    /// Returns the page plus the offset the next call should start from.
    async fn pull_from(&self, since: DateTime<Utc>, offset: u64) -> Result<(PullPage, u64)> {
        let page = self.list_page(since, offset).await?;
        let has_more = page.offset + page.limit < page.total_count;

        debug!(
            since = %since,
            offset = page.offset,
            returned = page.issues.len(),
            total = page.total_count,
            has_more,
            "Redmine pull page"
        );

        let mut issues = Vec::with_capacity(page.issues.len());
        for remote in &page.issues {
            match self.fetch_issue(&RemoteId::Number(remote.id)).await? {
                FetchOutcome::Issue(issue) => issues.push(issue),
                FetchOutcome::Unsupported => {}
            }
        }

        let next_offset = if has_more { page.offset + page.limit } else { 0 };
        Ok((PullPage { issues, has_more }, next_offset))
    }
}

#[async_trait]
impl BugTracker for RedmineAdapter {
    fn name(&self) -> &'static str {
        "redmine"
    }

    fn stable_attachment_ids(&self) -> bool {
        true
    }

    fn map_remote_status(&self, token: &str) -> TicketStatus {
        match token.to_lowercase().as_str() {
            "new" | "nouveau" => TicketStatus::New,
            "in progress" | "assigned" | "open" | "ouvert" => TicketStatus::Opened,
            "resolved" | "resolu" | "résolu" => TicketStatus::Resolved,
            "closed" | "rejected" | "clos" | "ferme" | "fermé" => TicketStatus::Closed,
            "feedback" | "waiting" | "en attente" => TicketStatus::Waiting,
            _ => TicketStatus::New,
        }
    }

    async fn escalate(&self, request: &EscalationRequest) -> Result<EscalationReceipt> {
        // Fan-out: all uploads must succeed before any remote issue exists.
        // try_join_all aborts on the first failure and discards sibling results.
        let uploads: Vec<UploadRef> =
            try_join_all(request.attachments.iter().map(|a| self.upload(a))).await?;

        let description = format!(
            "{}\n\n---\nSchool: {} (UAI {}, {})\nReported by: {}\nCategory: {}",
            request.ticket.description,
            request.structure.name,
            request.structure.uai,
            request.structure.academy,
            request.reporter.display_name,
            request.ticket.category,
        );

        let body = serde_json::json!({
            "issue": {
                "project_id": self.config.project_id,
                "subject": request.ticket.subject,
                "description": description,
                "uploads": uploads,
            }
        });

        info!(ticket_id = request.ticket.id, "Creating Redmine issue");

        let url = format!("{}/issues.json", self.base_url);
        let response = self
            .auth(self.client.post(&url).json(&body))
            .timeout(WRITE_TIMEOUT)
            .send()
            .await?;

        let created: IssueEnvelope = match response.status() {
            StatusCode::CREATED | StatusCode::OK => response.json().await?,
            status => {
                let error_body = response.text().await.unwrap_or_default();
                return Err(crate::BridgeError::Tracker(format!(
                    "Redmine create failed: HTTP {}: {}",
                    status, error_body
                )));
            }
        };

        let remote_id = RemoteId::Number(created.issue.id);

        // Existing ticket comments go out as one aggregated journal note.
        if !request.comments.is_empty() {
            let aggregated = request
                .comments
                .iter()
                .map(codec::encode)
                .collect::<Vec<_>>()
                .join("\n\n");
            let note = Comment::new(aggregated, request.reporter.display_name.clone(), Utc::now());
            self.comment_issue(&remote_id, &note).await?;
        }

        // Re-fetch to learn the attachment ids Redmine assigned; the create
        // response does not carry them
        let mut issue = match self.fetch_issue(&remote_id).await? {
            FetchOutcome::Issue(issue) => issue,
            FetchOutcome::Unsupported => {
                let raw = serde_json::json!({"id": created.issue.id});
                self.to_issue(&created.issue, raw)
            }
        };
        issue.ticket_id = request.ticket.id;
        issue.attachments = reconcile_uploaded(&request.attachments, &issue.attachments);

        info!(ticket_id = request.ticket.id, remote_id = %issue.remote_id, "Redmine issue created");

        Ok(EscalationReceipt::Created(issue))
    }

    async fn fetch_issue(&self, remote_id: &RemoteId) -> Result<FetchOutcome> {
        let url = format!("{}/issues/{}.json", self.base_url, remote_id);

        debug!(remote_id = %remote_id, "Fetching Redmine issue");

        let response = self
            .auth(
                self.client
                    .get(&url)
                    .query(&[("include", "journals,attachments")]),
            )
            .timeout(GET_TIMEOUT)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let raw: serde_json::Value = response.json().await?;
                let envelope: IssueEnvelope = serde_json::from_value(raw.clone())?;
                Ok(FetchOutcome::Issue(self.to_issue(&envelope.issue, raw)))
            }
            StatusCode::NOT_FOUND => Err(crate::BridgeError::Tracker(format!(
                "Redmine issue not found: {}",
                remote_id
            ))),
            status => {
                let error_body = response.text().await.unwrap_or_default();
                Err(crate::BridgeError::Tracker(format!(
                    "Redmine fetch failed: HTTP {}: {}",
                    status, error_body
                )))
            }
        }
    }

    async fn comment_issue(&self, remote_id: &RemoteId, comment: &Comment) -> Result<()> {
        let url = format!("{}/issues/{}.json", self.base_url, remote_id);

        let body = serde_json::json!({
            "issue": { "notes": comment.content }
        });

        info!(remote_id = %remote_id, "Adding note to Redmine issue");

        let response = self
            .auth(self.client.put(&url).json(&body))
            .timeout(WRITE_TIMEOUT)
            .send()
            .await?;

        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::OK => Ok(()),
            status => {
                let error_body = response.text().await.unwrap_or_default();
                Err(crate::BridgeError::Tracker(format!(
                    "Redmine comment failed: HTTP {}: {}",
                    status, error_body
                )))
            }
        }
    }

    async fn sync_attachments(
        &self,
        ticket_id: i64,
        remote_id: &RemoteId,
        locals: &[AttachmentPayload],
    ) -> Result<RemoteId> {
        if locals.is_empty() {
            return Ok(remote_id.clone());
        }

        let uploads: Vec<UploadRef> =
            try_join_all(locals.iter().map(|a| self.upload(a))).await?;

        let url = format!("{}/issues/{}.json", self.base_url, remote_id);
        let body = serde_json::json!({
            "issue": { "uploads": uploads }
        });

        info!(
            ticket_id,
            remote_id = %remote_id,
            count = locals.len(),
            "Attaching new files to Redmine issue"
        );

        let response = self
            .auth(self.client.put(&url).json(&body))
            .timeout(WRITE_TIMEOUT)
            .send()
            .await?;

        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::OK => Ok(remote_id.clone()),
            status => {
                let error_body = response.text().await.unwrap_or_default();
                Err(crate::BridgeError::Tracker(format!(
                    "Redmine attachment sync failed: HTTP {}: {}",
                    status, error_body
                )))
            }
        }
    }

    async fn pull(&self, since: DateTime<Utc>) -> Result<PullPage> {
        let mut offset = self.offset.lock().await;
        match self.pull_from(since, *offset).await {
            Ok((page, next_offset)) => {
                *offset = next_offset;
                Ok(page)
            }
            Err(err) => {
                // A failed pass restarts at the (un-advanced) watermark
                *offset = 0;
                Err(err)
            }
        }
    }

    async fn download_attachment(&self, remote_id: &str) -> Result<Vec<u8>> {
        let url = format!("{}/attachments/{}.json", self.base_url, remote_id);

        let response = self
            .auth(self.client.get(&url))
            .timeout(GET_TIMEOUT)
            .send()
            .await?;

        let meta: serde_json::Value = match response.status() {
            StatusCode::OK => response.json().await?,
            status => {
                let error_body = response.text().await.unwrap_or_default();
                return Err(crate::BridgeError::Tracker(format!(
                    "Redmine attachment lookup failed: HTTP {}: {}",
                    status, error_body
                )));
            }
        };

        let content_url = meta
            .pointer("/attachment/content_url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                crate::BridgeError::Tracker(format!(
                    "Redmine attachment {} has no content_url",
                    remote_id
                ))
            })?;

        let bytes = self
            .auth(self.client.get(content_url))
            .timeout(LIST_TIMEOUT)
            .send()
            .await?
            .error_for_status()
            .map_err(crate::BridgeError::Http)?
            .bytes()
            .await?;

        Ok(bytes.to_vec())
    }
}

fn parse_remote_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> RedmineConfig {
        RedmineConfig {
            url: "https://redmine.example.com".to_string(),
            api_key_env: None,
            project_id: "helpdesk".to_string(),
            page_limit: 25,
        }
    }

    #[test]
    fn test_adapter_creation() {
        let adapter = RedmineAdapter::new(test_config()).expect("Failed to create adapter");
        assert_eq!(adapter.name(), "redmine");
        assert!(adapter.stable_attachment_ids());
        assert!(adapter.base_url.contains("redmine.example.com"));
    }

    #[test]
    fn test_missing_url_refused() {
        let mut config = test_config();
        config.url = String::new();
        assert!(RedmineAdapter::new(config).is_err());
    }

    #[test]
    fn test_status_mapping() {
        let adapter = RedmineAdapter::new(test_config()).unwrap();
        assert_eq!(adapter.map_remote_status("New"), TicketStatus::New);
        assert_eq!(adapter.map_remote_status("In Progress"), TicketStatus::Opened);
        assert_eq!(adapter.map_remote_status("Resolved"), TicketStatus::Resolved);
        assert_eq!(adapter.map_remote_status("Closed"), TicketStatus::Closed);
        assert_eq!(adapter.map_remote_status("Feedback"), TicketStatus::Waiting);
        // Unknown tokens degrade, never fail
        assert_eq!(adapter.map_remote_status("Triage"), TicketStatus::New);
    }

    #[test]
    fn test_issue_translation() {
        let adapter = RedmineAdapter::new(test_config()).unwrap();
        let remote: RedmineIssue = serde_json::from_value(serde_json::json!({
            "id": 42,
            "subject": "Printer broken",
            "status": {"name": "Resolved"},
            "updated_on": "2024-03-15T09:30:45Z",
            "journals": [
                {"id": 7, "notes": "Looking into it", "user": {"name": "Agent"}, "created_on": "2024-03-15T09:00:00Z"},
                {"id": 8, "notes": "", "user": {"name": "Agent"}}
            ],
            "attachments": [
                {"id": 3, "filename": "log.txt", "filesize": 120, "content_type": "text/plain"}
            ]
        }))
        .unwrap();

        let issue = adapter.to_issue(&remote, serde_json::Value::Null);
        assert_eq!(issue.remote_id, RemoteId::Number(42));
        assert_eq!(issue.remote_status.as_deref(), Some("resolved"));
        // Empty journal notes are not comments
        assert_eq!(issue.comments.len(), 1);
        assert_eq!(issue.comments[0].remote_id.as_deref(), Some("7"));
        assert_eq!(issue.attachments.len(), 1);
        assert_eq!(issue.attachments[0].remote_id.as_deref(), Some("3"));
    }
}
