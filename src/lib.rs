//! deskbridge - Helpdesk-to-bugtracker synchronization engine
//!
//! deskbridge escalates helpdesk tickets into an external bug tracker and
//! keeps both sides in sync afterwards: remote comments, attachments and
//! terminal status changes flow back to the local ticket, local files flow
//! out. Three backends are supported behind one adapter contract: Redmine
//! and Zendesk over their synchronous REST APIs, and Pivot over an
//! asynchronous message exchange.
//!
//! # Architecture
//!
//! - **model**: Core data structures (Ticket, Issue, Comment, Attachment)
//! - **codec**: Pipe-delimited comment wire format with embedded identities
//! - **backend**: The `BugTracker` contract and its three adapters
//! - **reconcile**: Pure comment/attachment delta computation
//! - **orchestrator**: Escalation and remote-update application
//! - **scheduler**: Periodic pull loop with command and event channels
//! - **store**: SQLite persistence (tickets, issues, watermarks)
//! - **collab**: Object store, directory and notifier seams

pub mod backend;
pub mod codec;
pub mod collab;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod reconcile;
pub mod scheduler;
pub mod store;

pub use error::{BridgeError, Result};
