//! Comment wire codec
//!
//! Backends without native comment identity (Pivot in particular) carry
//! comments as free text. The codec serializes a structured comment into a
//! pipe-delimited record whose first field is a 14-digit identity derived from
//! the creation timestamp, and parses such records back.
//!
//! Text that does not look like an encoded record (fewer than four fields, or
//! a first field that is not a valid 14-digit timestamp) is classified as
//! human-authored and left untouched. The distinguishing signal is content
//! shape, not a tag carried by the data.

use crate::model::Comment;
use chrono::{DateTime, NaiveDateTime, Utc};

/// Field delimiter of the encoded wire form
pub const DELIMITER: &str = " | ";

/// Timestamp layout behind the 14-digit identity
const IDENTITY_FORMAT: &str = "%Y%m%d%H%M%S";

/// Human-readable date shown in the rendered header
const DISPLAY_FORMAT: &str = "%d/%m/%Y %H:%M";

/// A successfully parsed encoded comment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedComment {
    /// 14-digit identity (first field of the record)
    pub identity: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub content: String,
}

/// Derive the 14-digit identity for a creation timestamp
pub fn identity_from_timestamp(created_at: &DateTime<Utc>) -> String {
    created_at.format(IDENTITY_FORMAT).to_string()
}

/// Serialize a comment into its wire form:
/// `identity | author | display-date | content`
pub fn encode(comment: &Comment) -> String {
    format!(
        "{}{}{}{}{}{}{}",
        identity_from_timestamp(&comment.created_at),
        DELIMITER,
        comment.author,
        DELIMITER,
        comment.created_at.format(DISPLAY_FORMAT),
        DELIMITER,
        comment.content
    )
}

/// Attempt to parse an encoded comment back out of free text
///
/// Returns `None` for anything that does not match the encoded shape; callers
/// treat such text as already human-authored. Never panics on malformed input.
pub fn decode(text: &str) -> Option<EncodedComment> {
    // The content itself may contain the delimiter: split off the first three
    // fields only and keep the remainder intact.
    let parts: Vec<&str> = text.splitn(4, DELIMITER).collect();
    if parts.len() < 4 {
        return None;
    }

    let identity = parts[0].trim();
    let created_at = parse_identity(identity)?;

    Some(EncodedComment {
        identity: identity.to_string(),
        author: parts[1].trim().to_string(),
        created_at,
        content: parts[3].to_string(),
    })
}

/// Parse a 14-digit identity field into its timestamp, rejecting anything
/// that is not exactly 14 ASCII digits forming a valid date
fn parse_identity(field: &str) -> Option<DateTime<Utc>> {
    if field.len() != 14 || !field.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDateTime::parse_from_str(field, IDENTITY_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Derive the reconciliation identity of a comment: native id when the
/// backend assigned one, the embedded identity when the content is an encoded
/// record, and the timestamp-derived identity otherwise.
pub fn identity_for(comment: &Comment) -> String {
    if let Some(ref remote_id) = comment.remote_id {
        return remote_id.clone();
    }
    if let Some(encoded) = decode(&comment.content) {
        return encoded.identity;
    }
    identity_from_timestamp(&comment.created_at)
}
