//! Zendesk adapter
//!
//! Synchronous REST backend. Attachments are uploaded first for a token,
//! then referenced from a comment; the incremental export API drives pulls
//! with an opaque cursor instead of offset arithmetic. The local ticket id
//! travels in the remote ticket's `external_id` field.

use super::{
    reconcile_uploaded, AttachmentPayload, BugTracker, EscalationReceipt, EscalationRequest,
    FetchOutcome, PullPage,
};
use crate::codec;
use crate::config::ZendeskConfig;
use crate::model::{Attachment, Comment, Issue, RemoteId, TicketStatus};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const LIST_TIMEOUT: Duration = Duration::from_secs(30);
const GET_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(15);

/// Zendesk API client
pub struct ZendeskAdapter {
    client: Client,
    config: ZendeskConfig,
    base_url: String,
    token: Option<String>,
    // Incremental-export cursor, carried between pages of one pull pass
    cursor: Mutex<Option<String>>,
}

#[derive(Debug, Clone, Deserialize)]
struct UploadResponse {
    upload: UploadBody,
}

#[derive(Debug, Clone, Deserialize)]
struct UploadBody {
    token: String,
}

#[derive(Debug, Clone, Deserialize)]
struct TicketEnvelope {
    ticket: ZendeskTicket,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ZendeskTicket {
    id: i64,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    external_id: Option<String>,
    #[serde(default)]
    updated_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct CommentListResponse {
    comments: Vec<ZendeskComment>,
}

#[derive(Debug, Clone, Deserialize)]
struct ZendeskComment {
    id: i64,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    author_id: Option<i64>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    attachments: Vec<ZendeskAttachment>,
}

#[derive(Debug, Clone, Deserialize)]
struct ZendeskAttachment {
    id: i64,
    file_name: String,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    size: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct IncrementalResponse {
    tickets: Vec<ZendeskTicket>,
    #[serde(default)]
    after_cursor: Option<String>,
    #[serde(default)]
    end_of_stream: bool,
}

impl ZendeskAdapter {
    pub fn new(config: ZendeskConfig) -> Result<Self> {
        if config.url.trim().is_empty() {
            return Err(crate::BridgeError::Config(
                "Zendesk adapter requires a url".to_string(),
            ));
        }

        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        let base_url = config.url.trim_end_matches('/').to_string();
        let token = crate::config::resolve_env_credential(&config.token_env);

        if token.is_none() {
            warn!("Zendesk adapter created without an API token");
        }

        Ok(Self {
            client,
            config,
            base_url,
            token,
            cursor: Mutex::new(None),
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Upload one file, returning the token a comment can reference
    async fn upload(&self, payload: &AttachmentPayload) -> Result<String> {
        let url = format!("{}/api/v2/uploads.json", self.base_url);

        debug!(filename = %payload.name, size = payload.bytes.len(), "Uploading attachment to Zendesk");

        let response = self
            .auth(self.client.post(&url))
            .query(&[("filename", payload.name.as_str())])
            .header("Content-Type", "application/binary")
            .body(payload.bytes.clone())
            .timeout(WRITE_TIMEOUT)
            .send()
            .await?;

        match response.status() {
            StatusCode::CREATED | StatusCode::OK => {
                let parsed: UploadResponse = response.json().await?;
                Ok(parsed.upload.token)
            }
            status => {
                let error_body = response.text().await.unwrap_or_default();
                Err(crate::BridgeError::Tracker(format!(
                    "Zendesk upload failed: HTTP {}: {}",
                    status, error_body
                )))
            }
        }
    }

    async fn put_ticket(&self, remote_id: &RemoteId, body: serde_json::Value) -> Result<()> {
        let url = format!("{}/api/v2/tickets/{}.json", self.base_url, remote_id);

        let response = self
            .auth(self.client.put(&url).json(&body))
            .timeout(WRITE_TIMEOUT)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
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
                    "Zendesk update failed: HTTP {}: {}",
                    status, error_body
                )))
            }
        }
    }

    async fn fetch_comments(&self, remote_id: &RemoteId) -> Result<Vec<ZendeskComment>> {
        let url = format!("{}/api/v2/tickets/{}/comments.json", self.base_url, remote_id);

        let response = self
            .auth(self.client.get(&url))
            .timeout(GET_TIMEOUT)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let parsed: CommentListResponse = response.json().await?;
                Ok(parsed.comments)
            }
            status => {
                let error_body = response.text().await.unwrap_or_default();
                Err(crate::BridgeError::Tracker(format!(
                    "Zendesk comment fetch failed: HTTP {}: {}",
                    status, error_body
                )))
            }
        }
    }

    fn to_issue(&self, remote: &ZendeskTicket, comments: &[ZendeskComment]) -> Issue {
        let ticket_id = remote
            .external_id
            .as_deref()
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0);

        // The first comment of a Zendesk ticket is the ticket body, not a
        // journal entry; its attachments still count below.
        let mapped_comments = comments
            .iter()
            .skip(1)
            .filter_map(|c| {
                let body = c.body.as_deref()?.trim();
                if body.is_empty() {
                    return None;
                }
                let created = c
                    .created_at
                    .as_deref()
                    .and_then(parse_remote_ts)
                    .unwrap_or_else(Utc::now);
                let author = c
                    .author_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "zendesk".to_string());
                Some(Comment::new(body, author, created).with_remote_id(c.id.to_string()))
            })
            .collect();

        let attachments = comments
            .iter()
            .flat_map(|c| c.attachments.iter())
            .map(|a| {
                Attachment::from_object_store(format!("pending-{}", a.id), &a.file_name)
                    .with_remote_id(a.id.to_string())
                    .with_content_type(a.content_type.clone().unwrap_or_default())
                    .with_size(a.size)
            })
            .collect();

        let mut issue = Issue::new(RemoteId::Number(remote.id), ticket_id, self.name());
        issue.content = serde_json::to_value(remote).unwrap_or(serde_json::Value::Null);
        issue.comments = mapped_comments;
        issue.attachments = attachments;
        issue.remote_status = remote.status.clone();
        issue.last_remote_update = remote.updated_at.as_deref().and_then(parse_remote_ts);
        issue
    }

    /// One pull step of the incremental export
    ///
    /// The export carries bare tickets only, so each hit is hydrated with its
    /// comment list before it reaches the apply path. Returns the page plus
    /// the cursor the next call should resume from.
    async fn pull_from(
        &self,
        since: DateTime<Utc>,
        cursor: Option<&str>,
    ) -> Result<(PullPage, Option<String>)> {
        let url = format!("{}/api/v2/incremental/tickets/cursor.json", self.base_url);

        let request = match cursor {
            Some(token) => self
                .auth(self.client.get(&url))
                .query(&[("cursor", token)]),
            None => self
                .auth(self.client.get(&url))
                .query(&[("start_time", &since.timestamp().to_string())]),
        };

        let response = request.timeout(LIST_TIMEOUT).send().await?;

        let parsed: IncrementalResponse = match response.status() {
            StatusCode::OK => response.json().await?,
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60);
                return Err(crate::BridgeError::RateLimited(retry_after));
            }
            status => {
                let error_body = response.text().await.unwrap_or_default();
                return Err(crate::BridgeError::Tracker(format!(
                    "Zendesk incremental export failed: HTTP {}: {}",
                    status, error_body
                )));
            }
        };

        let has_more = !parsed.end_of_stream;
        let next_cursor = if has_more { parsed.after_cursor.clone() } else { None };

        debug!(
            since = %since,
            returned = parsed.tickets.len(),
            has_more,
            "Zendesk pull page"
        );

        let mut issues = Vec::with_capacity(parsed.tickets.len());
        for ticket in &parsed.tickets {
            let comments = self.fetch_comments(&RemoteId::Number(ticket.id)).await?;
            issues.push(self.to_issue(ticket, &comments));
        }

        Ok((PullPage { issues, has_more }, next_cursor))
    }
}

#[async_trait]
impl BugTracker for ZendeskAdapter {
    fn name(&self) -> &'static str {
        "zendesk"
    }

    fn stable_attachment_ids(&self) -> bool {
        true
    }

    fn map_remote_status(&self, token: &str) -> TicketStatus {
        match token.to_lowercase().as_str() {
            "new" => TicketStatus::New,
            "open" => TicketStatus::Opened,
            "pending" | "hold" => TicketStatus::Waiting,
            "solved" => TicketStatus::Resolved,
            "closed" => TicketStatus::Closed,
            _ => TicketStatus::New,
        }
    }

    async fn escalate(&self, request: &EscalationRequest) -> Result<EscalationReceipt> {
        // All uploads must land before the ticket references their tokens
        let tokens: Vec<String> =
            try_join_all(request.attachments.iter().map(|a| self.upload(a))).await?;

        let body = format!(
            "{}\n\n---\nSchool: {} (UAI {}, {})\nReported by: {}\nCategory: {}",
            request.ticket.description,
            request.structure.name,
            request.structure.uai,
            request.structure.academy,
            request.reporter.display_name,
            request.ticket.category,
        );

        let ticket = serde_json::json!({
            "subject": request.ticket.subject,
            "external_id": request.ticket.id.to_string(),
            "group_id": self.config.group_id,
            "comment": { "body": body, "uploads": tokens },
        });

        info!(ticket_id = request.ticket.id, "Creating Zendesk ticket");

        let url = format!("{}/api/v2/tickets.json", self.base_url);
        let response = self
            .auth(self.client.post(&url).json(&serde_json::json!({"ticket": ticket})))
            .timeout(WRITE_TIMEOUT)
            .send()
            .await?;

        let created: TicketEnvelope = match response.status() {
            StatusCode::CREATED | StatusCode::OK => response.json().await?,
            status => {
                let error_body = response.text().await.unwrap_or_default();
                return Err(crate::BridgeError::Tracker(format!(
                    "Zendesk create failed: HTTP {}: {}",
                    status, error_body
                )));
            }
        };

        let remote_id = RemoteId::Number(created.ticket.id);

        // Existing ticket comments go out as one aggregated comment,
        // separate from the ticket body.
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

        // The creation comment carries the uploads; fetch the comments back
        // to learn the attachment ids Zendesk bound to them
        let comments = self.fetch_comments(&remote_id).await?;
        let mut issue = self.to_issue(&created.ticket, &comments);
        issue.ticket_id = request.ticket.id;
        issue.attachments = reconcile_uploaded(&request.attachments, &issue.attachments);

        info!(ticket_id = request.ticket.id, remote_id = %issue.remote_id, "Zendesk ticket created");

        Ok(EscalationReceipt::Created(issue))
    }

    async fn fetch_issue(&self, remote_id: &RemoteId) -> Result<FetchOutcome> {
        let url = format!("{}/api/v2/tickets/{}.json", self.base_url, remote_id);

        debug!(remote_id = %remote_id, "Fetching Zendesk ticket");

        let response = self
            .auth(self.client.get(&url))
            .timeout(GET_TIMEOUT)
            .send()
            .await?;

        let envelope: TicketEnvelope = match response.status() {
            StatusCode::OK => response.json().await?,
            StatusCode::NOT_FOUND => {
                return Err(crate::BridgeError::Tracker(format!(
                    "Zendesk ticket not found: {}",
                    remote_id
                )))
            }
            status => {
                let error_body = response.text().await.unwrap_or_default();
                return Err(crate::BridgeError::Tracker(format!(
                    "Zendesk fetch failed: HTTP {}: {}",
                    status, error_body
                )));
            }
        };

        let comments = self.fetch_comments(remote_id).await?;
        Ok(FetchOutcome::Issue(self.to_issue(&envelope.ticket, &comments)))
    }

    async fn comment_issue(&self, remote_id: &RemoteId, comment: &Comment) -> Result<()> {
        info!(remote_id = %remote_id, "Adding comment to Zendesk ticket");

        let body = serde_json::json!({
            "ticket": {
                "group_id": self.config.group_id,
                "comment": { "body": comment.content, "public": true },
            }
        });

        self.put_ticket(remote_id, body).await
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

        let tokens: Vec<String> = try_join_all(locals.iter().map(|a| self.upload(a))).await?;

        info!(
            ticket_id,
            remote_id = %remote_id,
            count = locals.len(),
            "Attaching new files to Zendesk ticket"
        );

        // Upload tokens only bind through a comment
        let names: Vec<&str> = locals.iter().map(|a| a.name.as_str()).collect();
        let body = serde_json::json!({
            "ticket": {
                "comment": {
                    "body": format!("New files: {}", names.join(", ")),
                    "uploads": tokens,
                    "public": true,
                }
            }
        });

        self.put_ticket(remote_id, body).await?;
        Ok(remote_id.clone())
    }

    async fn pull(&self, since: DateTime<Utc>) -> Result<PullPage> {
        let mut cursor = self.cursor.lock().await;
        match self.pull_from(since, cursor.as_deref()).await {
            Ok((page, next_cursor)) => {
                *cursor = next_cursor;
                Ok(page)
            }
            Err(err) => {
                // A stale cursor would resume mid-stream; restart at the
                // (un-advanced) watermark instead
                *cursor = None;
                Err(err)
            }
        }
    }

    async fn download_attachment(&self, remote_id: &str) -> Result<Vec<u8>> {
        let url = format!("{}/api/v2/attachments/{}.json", self.base_url, remote_id);

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
                    "Zendesk attachment lookup failed: HTTP {}: {}",
                    status, error_body
                )));
            }
        };

        let content_url = meta
            .pointer("/attachment/content_url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                crate::BridgeError::Tracker(format!(
                    "Zendesk attachment {} has no content_url",
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

    fn test_config() -> ZendeskConfig {
        ZendeskConfig {
            url: "https://support.example.com".to_string(),
            token_env: None,
            group_id: "42".to_string(),
        }
    }

    #[test]
    fn test_adapter_creation() {
        let adapter = ZendeskAdapter::new(test_config()).expect("Failed to create adapter");
        assert_eq!(adapter.name(), "zendesk");
        assert!(adapter.stable_attachment_ids());
    }

    #[test]
    fn test_status_mapping() {
        let adapter = ZendeskAdapter::new(test_config()).unwrap();
        assert_eq!(adapter.map_remote_status("new"), TicketStatus::New);
        assert_eq!(adapter.map_remote_status("open"), TicketStatus::Opened);
        assert_eq!(adapter.map_remote_status("pending"), TicketStatus::Waiting);
        assert_eq!(adapter.map_remote_status("hold"), TicketStatus::Waiting);
        assert_eq!(adapter.map_remote_status("solved"), TicketStatus::Resolved);
        assert_eq!(adapter.map_remote_status("closed"), TicketStatus::Closed);
        assert_eq!(adapter.map_remote_status("weird"), TicketStatus::New);
    }

    #[test]
    fn test_external_id_correlation() {
        let adapter = ZendeskAdapter::new(test_config()).unwrap();
        let remote = ZendeskTicket {
            id: 900,
            status: Some("open".to_string()),
            external_id: Some("17".to_string()),
            updated_at: Some("2024-05-01T10:00:00Z".to_string()),
        };
        let issue = adapter.to_issue(&remote, &[]);
        assert_eq!(issue.remote_id, RemoteId::Number(900));
        assert_eq!(issue.ticket_id, 17);
        assert_eq!(issue.remote_status.as_deref(), Some("open"));
    }

    #[test]
    fn test_creation_comment_is_body_not_journal() {
        let adapter = ZendeskAdapter::new(test_config()).unwrap();
        let remote = ZendeskTicket {
            id: 901,
            status: None,
            external_id: None,
            updated_at: None,
        };
        let comments = vec![
            // First comment = ticket body; never a journal entry, but its
            // attachments still count
            ZendeskComment {
                id: 4,
                body: Some("Projector dead\n\n---\nSchool: X".to_string()),
                author_id: Some(1),
                created_at: Some("2024-05-01T09:00:00Z".to_string()),
                attachments: vec![ZendeskAttachment {
                    id: 299,
                    file_name: "photo.jpg".to_string(),
                    content_type: Some("image/jpeg".to_string()),
                    size: 512,
                }],
            },
            ZendeskComment {
                id: 5,
                body: Some("see attached".to_string()),
                author_id: Some(77),
                created_at: Some("2024-05-01T10:00:00Z".to_string()),
                attachments: vec![ZendeskAttachment {
                    id: 300,
                    file_name: "screen.png".to_string(),
                    content_type: Some("image/png".to_string()),
                    size: 2048,
                }],
            },
        ];
        let issue = adapter.to_issue(&remote, &comments);
        assert_eq!(issue.comments.len(), 1);
        assert_eq!(issue.comments[0].remote_id.as_deref(), Some("5"));
        let ids: Vec<_> = issue
            .attachments
            .iter()
            .filter_map(|a| a.remote_id.as_deref())
            .collect();
        assert_eq!(ids, vec!["299", "300"]);
    }
}
