//! Pivot adapter
//!
//! Asynchronous backend: escalation posts an `action: "create"` message to
//! an exchange endpoint and the remote id arrives later in an inbound
//! message, so `escalate` returns a pending receipt and `fetch_issue` is
//! unsupported. Attachments travel inline as base64, in both directions.

use super::{
    AttachmentPayload, BugTracker, EscalationReceipt, EscalationRequest, FetchOutcome, PullPage,
};
use crate::codec;
use crate::config::PivotConfig;
use crate::model::{Attachment, Comment, Issue, RemoteId, TicketStatus};
use crate::Result;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

const WRITE_TIMEOUT: Duration = Duration::from_secs(15);

/// Routing token stamped on outbound updates so the remote side knows who
/// currently holds the ticket
const ATTRIBUTION_SUPPORT: &str = "SUPPORT";

/// Pivot exchange client
pub struct PivotAdapter {
    client: Client,
    config: PivotConfig,
    exchange_url: String,
    token: Option<String>,
}

/// One remote update decoded from an inbound exchange message
#[derive(Debug)]
pub struct InboundUpdate {
    pub issue: Issue,
    /// Inline attachment bytes keyed by the attachment's remote id
    pub attachment_bytes: HashMap<String, Vec<u8>>,
}

#[derive(Debug, Deserialize)]
struct InboundMessage {
    #[serde(default)]
    action: Option<String>,
    issue: InboundIssue,
}

#[derive(Debug, Deserialize)]
struct InboundIssue {
    id_ent: i64,
    #[serde(default)]
    id_externe: Option<String>,
    #[serde(default)]
    statut: Option<String>,
    #[serde(default)]
    date_modification: Option<String>,
    #[serde(default)]
    commentaires: Vec<String>,
    #[serde(default)]
    pieces_jointes: Vec<InboundAttachment>,
}

#[derive(Debug, Deserialize)]
struct InboundAttachment {
    nom: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    type_mime: Option<String>,
    #[serde(default)]
    contenu: Option<String>,
}

impl PivotAdapter {
    pub fn new(config: PivotConfig) -> Result<Self> {
        if config.exchange_url.trim().is_empty() {
            return Err(crate::BridgeError::Config(
                "Pivot adapter requires an exchange_url".to_string(),
            ));
        }

        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        let exchange_url = config.exchange_url.trim_end_matches('/').to_string();
        let token = crate::config::resolve_env_credential(&config.token_env);

        if token.is_none() {
            warn!("Pivot adapter created without an exchange token");
        }

        Ok(Self {
            client,
            config,
            exchange_url,
            token,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Post one message to the exchange endpoint
    async fn post_message(&self, message: serde_json::Value) -> Result<()> {
        let mut request = self.client.post(&self.exchange_url).json(&message);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.timeout(WRITE_TIMEOUT).send().await?;

        match response.status() {
            status if status.is_success() => Ok(()),
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
                    "Pivot exchange refused message: HTTP {}: {}",
                    status, error_body
                )))
            }
        }
    }

    fn inline_attachments(payloads: &[AttachmentPayload]) -> Vec<serde_json::Value> {
        payloads
            .iter()
            .map(|a| {
                serde_json::json!({
                    "nom": a.name,
                    "type_mime": a.content_type,
                    "contenu": BASE64.encode(&a.bytes),
                })
            })
            .collect()
    }

    /// Decode an inbound exchange message into a remote update
    ///
    /// Inline attachment bytes are pulled out of the payload so the apply
    /// path never needs a download round-trip for this backend. Attachments
    /// whose base64 body does not decode are dropped with a warning.
    pub fn parse_inbound(&self, payload: &serde_json::Value) -> Result<InboundUpdate> {
        let message: InboundMessage = serde_json::from_value(payload.clone())?;

        debug!(
            ticket_id = message.issue.id_ent,
            action = message.action.as_deref().unwrap_or("update"),
            "Decoding inbound Pivot message"
        );

        let remote_id = match &message.issue.id_externe {
            Some(id) if !id.trim().is_empty() => RemoteId::Text(id.clone()),
            _ => RemoteId::Number(message.issue.id_ent),
        };

        let comments = message
            .issue
            .commentaires
            .iter()
            .filter(|text| !text.trim().is_empty())
            .map(|text| Comment::new(text.clone(), "pivot", Utc::now()))
            .collect();

        let mut attachment_bytes = HashMap::new();
        let attachments = message
            .issue
            .pieces_jointes
            .iter()
            .filter_map(|a| {
                // Inline attachments have no durable remote id; the name is
                // the only identity the exchange guarantees
                let remote_id = a.id.clone().unwrap_or_else(|| a.nom.clone());
                if let Some(encoded) = &a.contenu {
                    match BASE64.decode(encoded.trim()) {
                        Ok(bytes) => {
                            attachment_bytes.insert(remote_id.clone(), bytes);
                        }
                        Err(err) => {
                            warn!(name = %a.nom, error = %err, "Skipping undecodable Pivot attachment");
                            return None;
                        }
                    }
                }
                let size = attachment_bytes
                    .get(&remote_id)
                    .map(|b| b.len() as u64)
                    .unwrap_or(0);
                Some(
                    Attachment::from_object_store(format!("pending-{}", remote_id), &a.nom)
                        .with_remote_id(remote_id)
                        .with_content_type(a.type_mime.clone().unwrap_or_default())
                        .with_size(size),
                )
            })
            .collect();

        let mut issue = Issue::new(remote_id, message.issue.id_ent, self.name());
        issue.content = payload.clone();
        issue.comments = comments;
        issue.attachments = attachments;
        issue.remote_status = message.issue.statut.clone();
        issue.last_remote_update = message
            .issue
            .date_modification
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc));

        Ok(InboundUpdate {
            issue,
            attachment_bytes,
        })
    }
}

#[async_trait]
impl BugTracker for PivotAdapter {
    fn name(&self) -> &'static str {
        "pivot"
    }

    fn stable_attachment_ids(&self) -> bool {
        false
    }

    fn map_remote_status(&self, token: &str) -> TicketStatus {
        match token.to_lowercase().as_str() {
            "nouveau" => TicketStatus::New,
            "ouvert" | "en cours" => TicketStatus::Opened,
            "resolu" | "résolu" => TicketStatus::Resolved,
            "clos" | "ferme" | "fermé" => TicketStatus::Closed,
            "en attente" | "attente" => TicketStatus::Waiting,
            _ => TicketStatus::New,
        }
    }

    async fn escalate(&self, request: &EscalationRequest) -> Result<EscalationReceipt> {
        let comments: Vec<String> = request.comments.iter().map(codec::encode).collect();

        let message = serde_json::json!({
            "action": "create",
            "issue": {
                "id_ent": request.ticket.id,
                "titre": request.ticket.subject,
                "description": request.ticket.description,
                "statut_ent": request.ticket.status.as_str(),
                "date_creation": request.ticket.created_at.to_rfc3339(),
                "attribution": ATTRIBUTION_SUPPORT,
                "uai": request.structure.uai,
                "academie": self.config.academy,
                "demandeur": request.reporter.display_name,
                "categorie": request.ticket.category,
                "commentaires": comments,
                "pieces_jointes": Self::inline_attachments(&request.attachments),
            }
        });

        info!(ticket_id = request.ticket.id, "Posting Pivot escalation message");

        self.post_message(message).await?;

        // The exchange acknowledges transport only; the remote id arrives
        // later in an inbound message
        Ok(EscalationReceipt::Pending)
    }

    async fn fetch_issue(&self, remote_id: &RemoteId) -> Result<FetchOutcome> {
        debug!(remote_id = %remote_id, "Pivot has no fetch endpoint");
        Ok(FetchOutcome::Unsupported)
    }

    async fn comment_issue(&self, remote_id: &RemoteId, comment: &Comment) -> Result<()> {
        let message = serde_json::json!({
            "action": "update",
            "issue": {
                "id_externe": remote_id.as_string(),
                "attribution": ATTRIBUTION_SUPPORT,
                "commentaires": [comment.content],
            }
        });

        info!(remote_id = %remote_id, "Posting Pivot comment message");

        self.post_message(message).await
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

        let message = serde_json::json!({
            "action": "update",
            "issue": {
                "id_ent": ticket_id,
                "id_externe": remote_id.as_string(),
                "attribution": ATTRIBUTION_SUPPORT,
                "pieces_jointes": Self::inline_attachments(locals),
            }
        });

        info!(
            ticket_id,
            remote_id = %remote_id,
            count = locals.len(),
            "Posting Pivot attachment message"
        );

        self.post_message(message).await?;
        Ok(remote_id.clone())
    }

    async fn pull(&self, _since: DateTime<Utc>) -> Result<PullPage> {
        // Updates arrive by inbound message, never by polling
        Ok(PullPage {
            issues: Vec::new(),
            has_more: false,
        })
    }

    async fn download_attachment(&self, remote_id: &str) -> Result<Vec<u8>> {
        Err(crate::BridgeError::Tracker(format!(
            "Pivot attachments are inline only, cannot download {}",
            remote_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> PivotConfig {
        PivotConfig {
            exchange_url: "https://pivot.example.com/exchange".to_string(),
            token_env: None,
            academy: "ACADEMY-01".to_string(),
        }
    }

    #[test]
    fn test_adapter_creation() {
        let adapter = PivotAdapter::new(test_config()).expect("Failed to create adapter");
        assert_eq!(adapter.name(), "pivot");
        assert!(!adapter.stable_attachment_ids());
    }

    #[test]
    fn test_status_mapping() {
        let adapter = PivotAdapter::new(test_config()).unwrap();
        assert_eq!(adapter.map_remote_status("Nouveau"), TicketStatus::New);
        assert_eq!(adapter.map_remote_status("Ouvert"), TicketStatus::Opened);
        assert_eq!(adapter.map_remote_status("Resolu"), TicketStatus::Resolved);
        assert_eq!(adapter.map_remote_status("Clos"), TicketStatus::Closed);
        assert_eq!(adapter.map_remote_status("En attente"), TicketStatus::Waiting);
    }

    #[tokio::test]
    async fn test_fetch_unsupported() {
        let adapter = PivotAdapter::new(test_config()).unwrap();
        let outcome = adapter.fetch_issue(&RemoteId::Text("EXT-1".into())).await.unwrap();
        assert!(matches!(outcome, FetchOutcome::Unsupported));
    }

    #[tokio::test]
    async fn test_pull_is_empty() {
        let adapter = PivotAdapter::new(test_config()).unwrap();
        let page = adapter.pull(Utc::now()).await.unwrap();
        assert!(page.issues.is_empty());
        assert!(!page.has_more);
    }

    #[test]
    fn test_parse_inbound_with_inline_attachment() {
        let adapter = PivotAdapter::new(test_config()).unwrap();
        let payload = serde_json::json!({
            "action": "update",
            "issue": {
                "id_ent": 12,
                "id_externe": "EXT-88",
                "statut": "Resolu",
                "date_modification": "2024-06-01T08:00:00Z",
                "commentaires": ["20240601080000 | Agent | 01/06/2024 08:00 | Fixed"],
                "pieces_jointes": [
                    {"nom": "report.txt", "type_mime": "text/plain", "contenu": "aGVsbG8="}
                ]
            }
        });

        let update = adapter.parse_inbound(&payload).unwrap();
        assert_eq!(update.issue.ticket_id, 12);
        assert_eq!(update.issue.remote_id, RemoteId::Text("EXT-88".to_string()));
        assert_eq!(update.issue.remote_status.as_deref(), Some("Resolu"));
        assert_eq!(update.issue.comments.len(), 1);
        assert_eq!(update.issue.attachments.len(), 1);
        assert_eq!(
            update.attachment_bytes.get("report.txt").map(Vec::as_slice),
            Some(b"hello".as_slice())
        );
    }

    #[test]
    fn test_parse_inbound_bad_base64_skipped() {
        let adapter = PivotAdapter::new(test_config()).unwrap();
        let payload = serde_json::json!({
            "issue": {
                "id_ent": 13,
                "pieces_jointes": [
                    {"nom": "broken.bin", "contenu": "!!!not-base64!!!"}
                ]
            }
        });

        let update = adapter.parse_inbound(&payload).unwrap();
        assert!(update.issue.attachments.is_empty());
        assert!(update.attachment_bytes.is_empty());
    }

    #[test]
    fn test_parse_inbound_without_remote_id_uses_ticket_id() {
        let adapter = PivotAdapter::new(test_config()).unwrap();
        let payload = serde_json::json!({
            "issue": { "id_ent": 14 }
        });

        let update = adapter.parse_inbound(&payload).unwrap();
        assert_eq!(update.issue.remote_id, RemoteId::Number(14));
    }
}
