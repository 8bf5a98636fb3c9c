//! Core data structures for deskbridge
//!
//! Local tickets, remote issues, and the attachment/comment records shared
//! between both worlds.

pub mod attachment;
pub mod comment;
pub mod issue;
pub mod ticket;

pub use attachment::{Attachment, AttachmentSource};
pub use comment::Comment;
pub use issue::{Issue, RemoteId};
pub use ticket::{EscalationStatus, Ticket, TicketStatus};
