//! External collaborators
//!
//! The engine depends on three services it does not own: an object store for
//! attachment bytes, a directory for structure/user lookups, and a
//! notification fan-out. Each is a trait at the seam; the implementations
//! shipped here are thin (filesystem object store, static directory, tracing
//! notifier) and test doubles live alongside them.

mod directory;
mod notifier;
mod object_store;

pub use directory::{Directory, StaticDirectory, Structure, UserProfile};
pub use notifier::{LogNotifier, Notifier, TicketChange, TicketChangeKind};
pub use object_store::{FsObjectStore, MemoryObjectStore, ObjectMeta, ObjectStore, StoredObject};
