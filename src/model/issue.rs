//! Remote tracker issue

use super::{Attachment, Comment};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Backend-assigned issue identifier
///
/// Redmine assigns numeric ids, Zendesk and Pivot use strings; the engine
/// treats both uniformly and only the matching adapter interprets them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RemoteId {
    Number(i64),
    Text(String),
}

impl RemoteId {
    pub fn as_string(&self) -> String {
        match self {
            RemoteId::Number(n) => n.to_string(),
            RemoteId::Text(s) => s.clone(),
        }
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteId::Number(n) => write!(f, "{}", n),
            RemoteId::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for RemoteId {
    fn from(n: i64) -> Self {
        RemoteId::Number(n)
    }
}

impl From<&str> for RemoteId {
    fn from(s: &str) -> Self {
        RemoteId::Text(s.to_string())
    }
}

/// Remote tracker representation of an escalated ticket
///
/// `content` is the raw backend-native payload; it is opaque to every
/// component except the adapter that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub remote_id: RemoteId,
    pub ticket_id: i64,
    /// Name of the backend the issue lives in ("redmine", "zendesk", "pivot")
    pub backend: String,
    pub content: serde_json::Value,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub comments: Vec<Comment>,
    /// Status token in the backend's own vocabulary
    #[serde(default)]
    pub remote_status: Option<String>,
    pub last_remote_update: Option<DateTime<Utc>>,
}

impl Issue {
    pub fn new(remote_id: impl Into<RemoteId>, ticket_id: i64, backend: impl Into<String>) -> Self {
        Self {
            remote_id: remote_id.into(),
            ticket_id,
            backend: backend.into(),
            content: serde_json::Value::Null,
            attachments: Vec::new(),
            comments: Vec::new(),
            remote_status: None,
            last_remote_update: None,
        }
    }

    pub fn with_content(mut self, content: serde_json::Value) -> Self {
        self.content = content;
        self
    }

    pub fn with_remote_status(mut self, status: impl Into<String>) -> Self {
        self.remote_status = Some(status.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_id_display() {
        assert_eq!(RemoteId::Number(42).to_string(), "42");
        assert_eq!(RemoteId::Text("ZD-17".into()).to_string(), "ZD-17");
    }

    #[test]
    fn test_remote_id_untagged_serde() {
        let n: RemoteId = serde_json::from_str("42").unwrap();
        assert_eq!(n, RemoteId::Number(42));
        let s: RemoteId = serde_json::from_str("\"ZD-17\"").unwrap();
        assert_eq!(s, RemoteId::Text("ZD-17".into()));
    }

    #[test]
    fn test_issue_builder() {
        let issue = Issue::new(7i64, 12, "redmine").with_remote_status("resolved");
        assert_eq!(issue.remote_id, RemoteId::Number(7));
        assert_eq!(issue.ticket_id, 12);
        assert_eq!(issue.remote_status.as_deref(), Some("resolved"));
    }
}
