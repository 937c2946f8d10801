//! The remote store holding the notes of every device
//!
//! A hosted relational store with change notifications. The coordinator only talks to it through
//! the [`RemoteStore`] trait, every call is wrapped in a timeout by the caller.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::notes::EntityKey;
use crate::notes::LOCAL_ID_PREFIX;
use crate::notes::NewNote;
use crate::notes::Note;
use crate::notes::NoteId;
use crate::notes::NotePatch;

pub use memory::Memory;
#[cfg(feature = "postgres")]
pub use postgres::Postgres;

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

/// Remote store errors
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Network error, timeout or the service is down
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// The store answered but refused the request
    #[error("Rejected: {message}")]
    Rejected {
        message: String,
        code: Option<String>,
    },

    /// No record with the given ID
    #[error("Record not found")]
    NotFound,
}

impl RemoteError {
    /// Did the store answer at all?
    ///
    /// Used to decide if the failure counts against the circuit breaker
    pub fn is_reachable(&self) -> bool {
        !matches!(self, RemoteError::Unavailable(_))
    }
}

/// Result type for all remote store interactions
pub type Result<T> = core::result::Result<T, RemoteError>;

/// Accept an ID issued by the remote store
///
/// The local-origin prefix is reserved for notes that never reached the store, a record carrying
/// it would be treated as unconfirmed forever.
pub(crate) fn issued_id(id: String) -> Result<NoteId> {
    if id.starts_with(LOCAL_ID_PREFIX) {
        return Err(RemoteError::Rejected {
            message: format!("Remote record uses a local-origin ID: {id}"),
            code: None,
        });
    }

    Ok(NoteId::remote(id))
}

/// Identifier of an open change-notification channel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChannelHandle(pub u64);

/// Kind of change on the remote store
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A change on the remote store, made by any device
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Change {
    pub kind: ChangeKind,
    pub entity: EntityKey,
    pub note_id: NoteId,
}

/// Events delivered on a channel
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A note of the entity changed
    Change(Change),

    /// The channel broke, no further events follow
    Error(String),
}

/// An open change-notification channel filtered to a single entity
#[derive(Debug)]
pub struct Channel {
    pub handle: ChannelHandle,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// Remote store with all supported operations
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// Insert a note, the store issues its ID
    async fn insert(&self, note: &NewNote) -> Result<Note>;

    /// Update a note
    async fn update(&self, id: &NoteId, patch: &NotePatch) -> Result<Note>;

    /// Hard-delete a note
    async fn delete(&self, id: &NoteId) -> Result<()>;

    /// All notes of an entity, ordered by creation time
    async fn select(&self, entity: &EntityKey) -> Result<Vec<Note>>;

    /// Open a change-notification channel for an entity
    async fn subscribe(&self, entity: &EntityKey) -> Result<Channel>;

    /// Close a change-notification channel
    async fn unsubscribe(&self, handle: ChannelHandle);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issued_id() {
        let id = issued_id("3f1c2a".to_string()).unwrap();
        assert_eq!("3f1c2a", id.as_str());
        assert!(!id.is_local());

        let err = issued_id(format!("{LOCAL_ID_PREFIX}1700000000000_abcdefghi")).unwrap_err();
        assert!(matches!(err, RemoteError::Rejected { .. }));
        assert!(err.is_reachable());
    }
}
