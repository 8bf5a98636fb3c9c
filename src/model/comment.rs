//! Ticket comments

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One comment on a ticket or remote issue
///
/// `id` is the local row id, null until persisted. `remote_id` is the
/// backend-native comment id for trackers that have one; trackers without
/// native comment identity rely on the codec's 14-digit embedded identity
/// instead (see `codec`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub remote_id: Option<String>,
    pub content: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
}

impl Comment {
    pub fn new(
        content: impl Into<String>,
        author: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            remote_id: None,
            content: content.into(),
            author: author.into(),
            created_at,
        }
    }

    pub fn with_remote_id(mut self, id: impl Into<String>) -> Self {
        self.remote_id = Some(id.into());
        self
    }

    pub fn with_local_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comment_builder() {
        let c = Comment::new("hello", "alice", Utc::now()).with_remote_id("42");
        assert_eq!(c.content, "hello");
        assert_eq!(c.remote_id.as_deref(), Some("42"));
        assert!(c.id.is_none());
    }
}
