//! Local helpdesk ticket

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Canonical ticket status shared by all backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    New,
    Opened,
    Resolved,
    Closed,
    Waiting,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::New => "NEW",
            TicketStatus::Opened => "OPENED",
            TicketStatus::Resolved => "RESOLVED",
            TicketStatus::Closed => "CLOSED",
            TicketStatus::Waiting => "WAITING",
        }
    }

    pub fn from_str_or_new(s: &str) -> Self {
        match s {
            "OPENED" => TicketStatus::Opened,
            "RESOLVED" => TicketStatus::Resolved,
            "CLOSED" => TicketStatus::Closed,
            "WAITING" => TicketStatus::Waiting,
            _ => TicketStatus::New,
        }
    }

    /// Whether a ticket in this status may still be escalated
    pub fn escalatable(&self) -> bool {
        !matches!(self, TicketStatus::Resolved | TicketStatus::Closed)
    }
}

/// Escalation lifecycle of a ticket
///
/// Legal transitions: NotDone/Failed -> InProgress -> {Successful, Failed}.
/// The transition into InProgress is guarded by a conditional update in the
/// local store; it is the sole concurrency guard for escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscalationStatus {
    NotDone,
    InProgress,
    Successful,
    Failed,
}

impl EscalationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationStatus::NotDone => "NOT_DONE",
            EscalationStatus::InProgress => "IN_PROGRESS",
            EscalationStatus::Successful => "SUCCESSFUL",
            EscalationStatus::Failed => "FAILED",
        }
    }

    pub fn from_str_or_not_done(s: &str) -> Self {
        match s {
            "IN_PROGRESS" => EscalationStatus::InProgress,
            "SUCCESSFUL" => EscalationStatus::Successful,
            "FAILED" => EscalationStatus::Failed,
            _ => EscalationStatus::NotDone,
        }
    }
}

/// Local helpdesk ticket record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: i64,
    pub status: TicketStatus,
    pub subject: String,
    pub description: String,
    pub category: String,
    /// Owning structure (school) id
    pub structure_id: String,
    pub owner_id: String,
    pub owner_name: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub escalation_status: EscalationStatus,
    pub escalation_date: Option<DateTime<Utc>>,
    /// Last change seen from the remote tracker for this ticket
    pub last_remote_update: Option<DateTime<Utc>>,
    pub locale: String,
}

impl Ticket {
    /// Create a new unescalated ticket
    pub fn new(id: i64, subject: impl Into<String>, owner_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: TicketStatus::New,
            subject: subject.into(),
            description: String::new(),
            category: String::new(),
            structure_id: String::new(),
            owner_id: owner_id.into(),
            owner_name: String::new(),
            created_at: now,
            modified_at: now,
            escalation_status: EscalationStatus::NotDone,
            escalation_date: None,
            last_remote_update: None,
            locale: "fr".to_string(),
        }
    }

    pub fn with_status(mut self, status: TicketStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_structure(mut self, structure_id: impl Into<String>) -> Self {
        self.structure_id = structure_id.into();
        self
    }

    pub fn with_owner_name(mut self, name: impl Into<String>) -> Self {
        self.owner_name = name.into();
        self
    }
}
