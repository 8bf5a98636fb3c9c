//! SQLite-backed ticket store
//!
//! All writes to shared rows go through single guarded SQL statements or one
//! transaction; the database serializes statement execution per row, so no
//! in-process locks are needed.

use crate::model::{
    Attachment, AttachmentSource, Comment, EscalationStatus, Issue, RemoteId, Ticket, TicketStatus,
};
use crate::Result;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

/// One append-only history record for a ticket
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub id: i64,
    pub ticket_id: i64,
    pub kind: String,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

/// SQLite store for tickets, issues and sync bookkeeping
pub struct TicketStore {
    conn: Connection,
    path: PathBuf,
}

impl TicketStore {
    /// Open or create the store database
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %path.display(), "Opening ticket store");

        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", &"WAL")?;

        let store = Self { conn, path };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory store for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn,
            path: PathBuf::from(":memory:"),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tickets (
                id INTEGER PRIMARY KEY,
                status TEXT NOT NULL,
                subject TEXT NOT NULL,
                description TEXT NOT NULL,
                category TEXT NOT NULL,
                structure_id TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                owner_name TEXT NOT NULL,
                created_at TEXT NOT NULL,
                modified_at TEXT NOT NULL,
                escalation_status TEXT NOT NULL,
                escalation_date TEXT,
                last_remote_update TEXT,
                locale TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS issues (
                remote_id TEXT NOT NULL,
                backend TEXT NOT NULL,
                ticket_id INTEGER NOT NULL,
                content TEXT NOT NULL,
                remote_status TEXT,
                last_remote_update TEXT,
                PRIMARY KEY (remote_id, backend)
            );

            CREATE TABLE IF NOT EXISTS comments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ticket_id INTEGER NOT NULL,
                remote_id TEXT,
                content TEXT NOT NULL,
                author TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS attachments (
                ticket_id INTEGER NOT NULL,
                source_kind TEXT NOT NULL,
                local_id TEXT NOT NULL,
                remote_id TEXT,
                name TEXT NOT NULL,
                content_type TEXT NOT NULL,
                size INTEGER NOT NULL,
                PRIMARY KEY (ticket_id, local_id)
            );

            CREATE TABLE IF NOT EXISTS history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ticket_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                detail TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS watermarks (
                backend TEXT PRIMARY KEY,
                watermark_ms INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_issues_ticket ON issues(ticket_id);
            CREATE INDEX IF NOT EXISTS idx_comments_ticket ON comments(ticket_id);
            CREATE INDEX IF NOT EXISTS idx_history_ticket ON history(ticket_id);
            "#,
        )?;
        Ok(())
    }

    // ============ Tickets ============

    /// Insert or replace a ticket row
    pub fn upsert_ticket(&self, ticket: &Ticket) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO tickets (
                id, status, subject, description, category, structure_id,
                owner_id, owner_name, created_at, modified_at,
                escalation_status, escalation_date, last_remote_update, locale
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                ticket.id,
                ticket.status.as_str(),
                &ticket.subject,
                &ticket.description,
                &ticket.category,
                &ticket.structure_id,
                &ticket.owner_id,
                &ticket.owner_name,
                ticket.created_at.to_rfc3339(),
                ticket.modified_at.to_rfc3339(),
                ticket.escalation_status.as_str(),
                ticket.escalation_date.map(|d| d.to_rfc3339()),
                ticket.last_remote_update.map(|d| d.to_rfc3339()),
                &ticket.locale,
            ],
        )?;
        Ok(())
    }

    pub fn get_ticket(&self, id: i64) -> Result<Option<Ticket>> {
        let ticket = self
            .conn
            .query_row(
                r#"
                SELECT id, status, subject, description, category, structure_id,
                       owner_id, owner_name, created_at, modified_at,
                       escalation_status, escalation_date, last_remote_update, locale
                FROM tickets WHERE id = ?
                "#,
                [id],
                |row| {
                    Ok(Ticket {
                        id: row.get(0)?,
                        status: TicketStatus::from_str_or_new(row.get::<_, String>(1)?.as_str()),
                        subject: row.get(2)?,
                        description: row.get(3)?,
                        category: row.get(4)?,
                        structure_id: row.get(5)?,
                        owner_id: row.get(6)?,
                        owner_name: row.get(7)?,
                        created_at: parse_ts(row.get::<_, String>(8)?),
                        modified_at: parse_ts(row.get::<_, String>(9)?),
                        escalation_status: EscalationStatus::from_str_or_not_done(
                            row.get::<_, String>(10)?.as_str(),
                        ),
                        escalation_date: row.get::<_, Option<String>>(11)?.map(parse_ts),
                        last_remote_update: row.get::<_, Option<String>>(12)?.map(parse_ts),
                        locale: row.get(13)?,
                    })
                },
            )
            .optional()?;
        Ok(ticket)
    }

    /// Conditional escalation start: the sole concurrency guard
    ///
    /// Flips escalation status to IN_PROGRESS only when no other escalation is
    /// in flight or already successful and the ticket is still open. Returns
    /// false when zero rows were affected (escalation refused).
    pub fn begin_escalation(&self, ticket_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let affected = self.conn.execute(
            r#"
            UPDATE tickets
            SET escalation_status = 'IN_PROGRESS', escalation_date = ?
            WHERE id = ?
              AND escalation_status NOT IN ('IN_PROGRESS', 'SUCCESSFUL')
              AND status NOT IN ('RESOLVED', 'CLOSED')
            "#,
            params![now.to_rfc3339(), ticket_id],
        )?;
        Ok(affected > 0)
    }

    /// Unconditional escalation status flip (used for FAILED)
    pub fn finish_escalation(&self, ticket_id: i64, status: EscalationStatus) -> Result<()> {
        self.conn.execute(
            "UPDATE tickets SET escalation_status = ? WHERE id = ?",
            params![status.as_str(), ticket_id],
        )?;
        Ok(())
    }

    /// Persist the remote issue and mark the escalation successful in one
    /// transaction, so remote success and local bookkeeping commit together
    pub fn commit_escalation_success(&self, issue: &Issue) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;

        upsert_issue_tx(&tx, issue)?;
        for attachment in &issue.attachments {
            merge_attachment_tx(&tx, issue.ticket_id, attachment)?;
        }
        tx.execute(
            "UPDATE tickets SET escalation_status = 'SUCCESSFUL' WHERE id = ?",
            [issue.ticket_id],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Update the ticket's canonical status and remote watermark together,
    /// as seen from a remote change
    pub fn apply_remote_status(
        &self,
        ticket_id: i64,
        status: TicketStatus,
        remote_update: DateTime<Utc>,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE tickets SET status = ?, last_remote_update = ?, modified_at = ? WHERE id = ?",
            params![
                status.as_str(),
                remote_update.to_rfc3339(),
                Utc::now().to_rfc3339(),
                ticket_id
            ],
        )?;
        Ok(())
    }

    // ============ Issues ============

    /// Upsert the opaque issue content keyed by (remote id, backend)
    pub fn upsert_issue(&self, issue: &Issue) -> Result<()> {
        upsert_issue_tx(&self.conn, issue)
    }

    /// Drop stale issue rows for a ticket that carry a different remote id
    ///
    /// Asynchronous backends record a provisional issue under the ticket's
    /// own id at escalation time; once the real external id arrives, the
    /// provisional row gives way to it.
    pub fn supersede_issue(&self, ticket_id: i64, backend: &str, keep: &RemoteId) -> Result<()> {
        self.conn.execute(
            "DELETE FROM issues WHERE ticket_id = ? AND backend = ? AND remote_id != ?",
            params![ticket_id, backend, keep.as_string()],
        )?;
        Ok(())
    }

    pub fn get_issue_for_ticket(&self, ticket_id: i64, backend: &str) -> Result<Option<Issue>> {
        let found = self
            .conn
            .query_row(
                r#"
                SELECT remote_id, backend, ticket_id, content, remote_status, last_remote_update
                FROM issues WHERE ticket_id = ? AND backend = ?
                "#,
                params![ticket_id, backend],
                map_issue_row,
            )
            .optional()?;
        self.hydrate_issue(found)
    }

    pub fn get_issue_by_remote(&self, remote_id: &RemoteId, backend: &str) -> Result<Option<Issue>> {
        let found = self
            .conn
            .query_row(
                r#"
                SELECT remote_id, backend, ticket_id, content, remote_status, last_remote_update
                FROM issues WHERE remote_id = ? AND backend = ?
                "#,
                params![remote_id.as_string(), backend],
                map_issue_row,
            )
            .optional()?;
        self.hydrate_issue(found)
    }

    /// Attach the locally known comments and attachments to a loaded issue
    fn hydrate_issue(&self, issue: Option<Issue>) -> Result<Option<Issue>> {
        let Some(mut issue) = issue else {
            return Ok(None);
        };
        issue.comments = self.comments_for(issue.ticket_id)?;
        issue.attachments = self.attachments_for(issue.ticket_id)?;
        Ok(Some(issue))
    }

    // ============ Comments ============

    pub fn add_comment(&self, ticket_id: i64, comment: &Comment) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO comments (ticket_id, remote_id, content, author, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
            params![
                ticket_id,
                comment.remote_id.as_deref(),
                &comment.content,
                &comment.author,
                comment.created_at.to_rfc3339(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn comments_for(&self, ticket_id: i64) -> Result<Vec<Comment>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, remote_id, content, author, created_at
            FROM comments WHERE ticket_id = ? ORDER BY created_at, id
            "#,
        )?;
        let rows = stmt.query_map([ticket_id], |row| {
            Ok(Comment {
                id: Some(row.get(0)?),
                remote_id: row.get(1)?,
                content: row.get(2)?,
                author: row.get(3)?,
                created_at: parse_ts(row.get::<_, String>(4)?),
            })
        })?;
        let mut comments = Vec::new();
        for row in rows {
            comments.push(row?);
        }
        Ok(comments)
    }

    // ============ Attachments ============

    /// Idempotent merge keyed by (ticket, local id): calling twice with the
    /// same identity updates the remote id and metadata in place
    pub fn merge_attachment(&self, ticket_id: i64, attachment: &Attachment) -> Result<()> {
        merge_attachment_tx(&self.conn, ticket_id, attachment)
    }

    pub fn attachments_for(&self, ticket_id: i64) -> Result<Vec<Attachment>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT source_kind, local_id, remote_id, name, content_type, size
            FROM attachments WHERE ticket_id = ?
            "#,
        )?;
        let rows = stmt.query_map([ticket_id], |row| {
            let kind: String = row.get(0)?;
            let local_id: String = row.get(1)?;
            let source = if kind == "workspace" {
                AttachmentSource::Workspace {
                    document_id: local_id,
                }
            } else {
                AttachmentSource::Ingested {
                    object_id: local_id,
                }
            };
            Ok(Attachment {
                source,
                remote_id: row.get(2)?,
                name: row.get(3)?,
                content_type: row.get(4)?,
                size: row.get::<_, i64>(5)? as u64,
            })
        })?;
        let mut attachments = Vec::new();
        for row in rows {
            attachments.push(row?);
        }
        Ok(attachments)
    }

    // ============ History ============

    /// Append-only history record for a ticket
    pub fn append_history(&self, ticket_id: i64, kind: &str, detail: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO history (ticket_id, kind, detail, created_at) VALUES (?, ?, ?, ?)",
            params![ticket_id, kind, detail, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn history_for(&self, ticket_id: i64) -> Result<Vec<HistoryEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, ticket_id, kind, detail, created_at FROM history WHERE ticket_id = ? ORDER BY id",
        )?;
        let rows = stmt.query_map([ticket_id], |row| {
            Ok(HistoryEntry {
                id: row.get(0)?,
                ticket_id: row.get(1)?,
                kind: row.get(2)?,
                detail: row.get(3)?,
                created_at: parse_ts(row.get::<_, String>(4)?),
            })
        })?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    // ============ Watermarks ============

    /// Current pull watermark for a backend (epoch start when never pulled)
    pub fn watermark(&self, backend: &str) -> Result<DateTime<Utc>> {
        let ms: Option<i64> = self
            .conn
            .query_row(
                "SELECT watermark_ms FROM watermarks WHERE backend = ?",
                [backend],
                |row| row.get(0),
            )
            .optional()?;
        Ok(ms
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap()))
    }

    /// Advance the watermark, never moving it backward (monotonic guard in SQL)
    pub fn advance_watermark(&self, backend: &str, to: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO watermarks (backend, watermark_ms) VALUES (?, ?)
            ON CONFLICT(backend) DO UPDATE
                SET watermark_ms = MAX(watermark_ms, excluded.watermark_ms)
            "#,
            params![backend, to.timestamp_millis()],
        )?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn upsert_issue_tx(conn: &Connection, issue: &Issue) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO issues (remote_id, backend, ticket_id, content, remote_status, last_remote_update)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(remote_id, backend) DO UPDATE SET
            content = excluded.content,
            remote_status = excluded.remote_status,
            last_remote_update = excluded.last_remote_update
        "#,
        params![
            issue.remote_id.as_string(),
            &issue.backend,
            issue.ticket_id,
            serde_json::to_string(&issue.content)?,
            issue.remote_status.as_deref(),
            issue.last_remote_update.map(|d| d.to_rfc3339()),
        ],
    )?;
    Ok(())
}

fn merge_attachment_tx(conn: &Connection, ticket_id: i64, attachment: &Attachment) -> Result<()> {
    let (kind, local_id) = match &attachment.source {
        AttachmentSource::Workspace { document_id } => ("workspace", document_id.as_str()),
        AttachmentSource::Ingested { object_id } => ("ingested", object_id.as_str()),
    };
    conn.execute(
        r#"
        INSERT INTO attachments (ticket_id, source_kind, local_id, remote_id, name, content_type, size)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(ticket_id, local_id) DO UPDATE SET
            remote_id = COALESCE(excluded.remote_id, attachments.remote_id),
            name = excluded.name,
            content_type = excluded.content_type,
            size = excluded.size
        "#,
        params![
            ticket_id,
            kind,
            local_id,
            attachment.remote_id.as_deref(),
            &attachment.name,
            &attachment.content_type,
            attachment.size as i64,
        ],
    )?;
    Ok(())
}

fn map_issue_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Issue> {
    let remote_id: String = row.get(0)?;
    // Numeric ids round-trip through their text form
    let remote_id = match remote_id.parse::<i64>() {
        Ok(n) => RemoteId::Number(n),
        Err(_) => RemoteId::Text(remote_id),
    };
    let content: String = row.get(3)?;
    Ok(Issue {
        remote_id,
        backend: row.get(1)?,
        ticket_id: row.get(2)?,
        content: serde_json::from_str(&content).unwrap_or(serde_json::Value::Null),
        attachments: Vec::new(),
        comments: Vec::new(),
        remote_status: row.get(4)?,
        last_remote_update: row.get::<_, Option<String>>(5)?.map(parse_ts),
    })
}

fn parse_ts(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc.timestamp_millis_opt(0).unwrap())
}
