//! Attachments shared between the local workspace and remote trackers

use serde::{Deserialize, Serialize};

/// Where an attachment's bytes live locally
///
/// Exactly one local identity exists per attachment: `Workspace` for files
/// that originate from the local document workspace, `Ingested` for files
/// downloaded from a remote tracker into the object store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentSource {
    Workspace { document_id: String },
    Ingested { object_id: String },
}

impl AttachmentSource {
    pub fn local_id(&self) -> &str {
        match self {
            AttachmentSource::Workspace { document_id } => document_id,
            AttachmentSource::Ingested { object_id } => object_id,
        }
    }
}

/// One file shared between the local and remote worlds
///
/// `remote_id` is the tracker-assigned id or upload token, populated once the
/// file has been uploaded or discovered remotely. Some backends do not assign
/// stable attachment ids, which is why equality falls back to the local source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub source: AttachmentSource,
    #[serde(default)]
    pub remote_id: Option<String>,
    pub name: String,
    pub content_type: String,
    pub size: u64,
}

impl Attachment {
    /// An attachment originating from the local document workspace
    pub fn from_workspace(document_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            source: AttachmentSource::Workspace {
                document_id: document_id.into(),
            },
            remote_id: None,
            name: name.into(),
            content_type: "application/octet-stream".to_string(),
            size: 0,
        }
    }

    /// An attachment ingested from a remote download into the object store
    pub fn from_object_store(object_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            source: AttachmentSource::Ingested {
                object_id: object_id.into(),
            },
            remote_id: None,
            name: name.into(),
            content_type: "application/octet-stream".to_string(),
            size: 0,
        }
    }

    pub fn with_remote_id(mut self, id: impl Into<String>) -> Self {
        self.remote_id = Some(id.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }
}

/// Asymmetric equality: the tracker-assigned id decides when both sides carry
/// one; otherwise the local identities must match. A workspace attachment
/// never equals an ingested one unless their remote ids match.
impl PartialEq for Attachment {
    fn eq(&self, other: &Self) -> bool {
        match (&self.remote_id, &other.remote_id) {
            (Some(a), Some(b)) => a == b,
            _ => self.source == other.source,
        }
    }
}

impl Eq for Attachment {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_id_equality_wins() {
        let a = Attachment::from_workspace("doc-1", "a.pdf").with_remote_id("r-9");
        let b = Attachment::from_object_store("obj-2", "b.pdf").with_remote_id("r-9");
        assert_eq!(a, b);
    }

    #[test]
    fn test_workspace_never_equals_ingested_without_remote_ids() {
        let a = Attachment::from_workspace("same-id", "a.pdf");
        let b = Attachment::from_object_store("same-id", "a.pdf");
        assert_ne!(a, b);
    }

    #[test]
    fn test_local_source_fallback() {
        let a = Attachment::from_workspace("doc-1", "a.pdf");
        let b = Attachment::from_workspace("doc-1", "renamed.pdf").with_remote_id("r-1");
        // Only one side has a remote id: fall back to local identity
        assert_eq!(a, b);

        let c = Attachment::from_workspace("doc-2", "a.pdf");
        assert_ne!(a, c);
    }

    #[test]
    fn test_differing_remote_ids_not_equal() {
        let a = Attachment::from_workspace("doc-1", "a.pdf").with_remote_id("r-1");
        let b = Attachment::from_workspace("doc-1", "a.pdf").with_remote_id("r-2");
        assert_ne!(a, b);
    }
}
