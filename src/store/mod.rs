//! Local persistence
//!
//! The relational store the engine owns: tickets, escalated issues, comments,
//! attachments, the per-ticket history log and the per-backend pull watermark.

mod sqlite;

pub use sqlite::{HistoryEntry, TicketStore};
