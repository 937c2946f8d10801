//! Durable local mirror of the notes of every entity
//!
//! Keeps one serialized, ordered note list per entity key (`entityType:entityId`) in a key-value
//! store that survives restarts. Every write rewrites the whole list of the entity.
//!
//! Next to the lists the mirror keeps:
//! - an index from note ID to entity key, to find a note when only its ID is known
//! - a version per entity, bumped on every write, carried into the cache
//! - reconciliation tickets per entity, so a slow fetch can not overwrite a newer one
//! - the ticket of the last local write per note, so a fetch that started before a write can not
//!   undo it

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use thiserror::Error;

use crate::merge::merge;
use crate::notes::EntityKey;
use crate::notes::EntityType;
use crate::notes::Note;
use crate::notes::NoteId;
use crate::notes::sort_notes;

pub use file::File;
pub use memory::Memory;

mod file;
mod memory;

/// Key-value store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Key-value store with all supported operations
///
/// Synchronous, calls never suspend
pub trait KeyValueStore: Send + Sync + 'static {
    /// Get the value of a key
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Set the value of a key
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Remove a key, removing a missing key is fine
    fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// All keys starting with the prefix
    fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// The notes of an entity at a given version
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub notes: Vec<Note>,
    pub version: u64,
}

/// Ticket handed out when a reconciliation starts
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Ticket(u64);

#[derive(Default)]
struct State {
    /// Note ID to the entity it is stored under
    index: HashMap<NoteId, EntityKey>,

    /// Current version per entity
    versions: HashMap<EntityKey, u64>,

    /// Last issued ticket, shared by all entities
    last_ticket: u64,

    /// Ticket of the last applied reconciliation per entity
    committed: HashMap<EntityKey, Ticket>,

    /// Ticket of the last local write per note, until a later reconciliation saw it
    written: HashMap<EntityKey, HashMap<NoteId, Ticket>>,

    /// Version clock, shared by all entities
    clock: u64,
}

/// The durable local mirror
pub struct LocalMirror {
    store: Arc<dyn KeyValueStore>,
    state: Mutex<State>,
}

impl LocalMirror {
    /// Create the mirror on top of a key-value store
    ///
    /// Builds the note index from what is already stored
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        let mirror = Self {
            store,
            state: Mutex::new(State::default()),
        };

        let mut state = mirror.state();
        for key in mirror.keys_locked() {
            for note in mirror.read_locked(&key) {
                state.index.insert(note.id, key.clone());
            }
        }
        tracing::debug!("Mirror holds {} notes", state.index.len());
        drop(state);

        mirror
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Current notes of an entity
    pub fn load(&self, key: &EntityKey) -> Snapshot {
        let state = self.state();
        let notes = self.read_locked(key);

        Snapshot {
            notes,
            version: state.versions.get(key).copied().unwrap_or_default(),
        }
    }

    /// Does the entity hold a note with this ID?
    pub fn contains(&self, key: &EntityKey, id: &NoteId) -> bool {
        let _state = self.state();

        self.read_locked(key).iter().any(|note| &note.id == id)
    }

    /// All entities with notes
    pub fn keys(&self) -> Vec<EntityKey> {
        let _state = self.state();

        self.keys_locked()
    }

    /// Read-modify-write the notes of an entity
    ///
    /// The notes are sorted and persisted after `change` ran
    pub fn update<F, R>(&self, key: &EntityKey, change: F) -> Result<(R, Snapshot), StoreError>
    where
        F: FnOnce(&mut Vec<Note>) -> R,
    {
        let mut state = self.state();

        let before = self.read_locked(key);
        let mut notes = before.clone();
        let result = change(&mut notes);
        sort_notes(&mut notes);

        mark_written(&mut state, key, &before, &notes);
        let snapshot = self.write_locked(&mut state, key, notes)?;

        Ok((result, snapshot))
    }

    /// Find a note by ID, wherever it is stored
    pub fn find(&self, id: &NoteId) -> Option<Note> {
        let mut state = self.state();

        let key = self.locate_locked(&mut state, id)?;

        self.read_locked(&key).into_iter().find(|note| &note.id == id)
    }

    /// Change a single note in place
    ///
    /// Returns `None` when no entity holds the note
    pub fn modify_note<F>(
        &self,
        id: &NoteId,
        change: F,
    ) -> Result<Option<(Note, Snapshot)>, StoreError>
    where
        F: FnOnce(&mut Note),
    {
        let mut state = self.state();

        let Some(key) = self.locate_locked(&mut state, id) else {
            return Ok(None);
        };

        let mut notes = self.read_locked(&key);
        let Some(note) = notes.iter_mut().find(|note| &note.id == id) else {
            return Ok(None);
        };

        change(note);
        let note = note.clone();
        sort_notes(&mut notes);

        mark_note(&mut state, &key, id);
        let snapshot = self.write_locked(&mut state, &key, notes)?;

        Ok(Some((note, snapshot)))
    }

    /// Remove a single note
    ///
    /// Returns `None` when no entity holds the note
    pub fn remove_note(&self, id: &NoteId) -> Result<Option<(EntityKey, Snapshot)>, StoreError> {
        let mut state = self.state();

        let Some(key) = self.locate_locked(&mut state, id) else {
            return Ok(None);
        };

        let mut notes = self.read_locked(&key);
        let count = notes.len();
        notes.retain(|note| &note.id != id);

        if notes.len() == count {
            return Ok(None);
        }

        mark_note(&mut state, &key, id);
        let snapshot = self.write_locked(&mut state, &key, notes)?;

        Ok(Some((key, snapshot)))
    }

    /// Start a reconciliation of an entity
    pub fn begin_reconcile(&self) -> Ticket {
        let mut state = self.state();

        state.last_ticket += 1;

        Ticket(state.last_ticket)
    }

    /// Merge a fetched remote list into the latest local list
    ///
    /// Notes written locally after the reconciliation started keep their local state, the fetched
    /// list may predate them. Returns `None` when a reconciliation that started later was already
    /// applied, the fetched list is older than what is stored.
    pub fn commit_reconcile(
        &self,
        key: &EntityKey,
        ticket: Ticket,
        remote: &[Note],
    ) -> Result<Option<Snapshot>, StoreError> {
        let mut state = self.state();

        if state.committed.get(key).is_some_and(|committed| *committed > ticket) {
            tracing::debug!("Discarding stale reconciliation of {key}");
            return Ok(None);
        }

        let local = self.read_locked(key);
        let mut merged = merge(remote, &local);

        if let Some(written) = state.written.get_mut(key) {
            for (id, _) in written.iter().filter(|(_, written)| **written > ticket) {
                merged.retain(|note| &note.id != id);
                merged.extend(local.iter().find(|note| &note.id == id).cloned());
            }
            sort_notes(&mut merged);

            // reconciliations older than this one are discarded from now on
            written.retain(|_, written| *written > ticket);
        }

        if state.written.get(key).is_some_and(HashMap::is_empty) {
            state.written.remove(key);
        }

        let snapshot = if merged == local {
            Snapshot {
                notes: local,
                version: state.versions.get(key).copied().unwrap_or_default(),
            }
        } else {
            self.write_locked(&mut state, key, merged)?
        };

        state.committed.insert(key.clone(), ticket);

        Ok(Some(snapshot))
    }

    fn keys_locked(&self) -> Vec<EntityKey> {
        let mut keys = Vec::new();

        for entity_type in EntityType::ALL {
            let prefix = format!("{entity_type}:");

            match self.store.list_keys(&prefix) {
                Ok(found) => keys.extend(found.iter().filter_map(|key| key.parse().ok())),
                Err(err) => tracing::warn!("Could not list mirror keys: {err}"),
            }
        }

        keys
    }

    /// Read the notes of an entity
    ///
    /// Missing or corrupt entries are an empty list
    fn read_locked(&self, key: &EntityKey) -> Vec<Note> {
        let value = match self.store.get(&key.to_string()) {
            Ok(Some(value)) => value,
            Ok(None) => return Vec::new(),
            Err(err) => {
                tracing::warn!("Could not read notes of {key}: {err}");
                return Vec::new();
            }
        };

        match serde_json::from_str::<Vec<Note>>(&value) {
            Ok(mut notes) => {
                sort_notes(&mut notes);
                notes
            }
            Err(err) => {
                tracing::warn!("Corrupt notes of {key}, treating as empty: {err}");
                Vec::new()
            }
        }
    }

    fn write_locked(
        &self,
        state: &mut State,
        key: &EntityKey,
        notes: Vec<Note>,
    ) -> Result<Snapshot, StoreError> {
        let storage_key = key.to_string();

        if notes.is_empty() {
            self.store.remove(&storage_key)?;
        } else {
            let value = serde_json::to_string(&notes)?;
            self.store.set(&storage_key, &value)?;
        }

        state.index.retain(|_, indexed| indexed != key);
        for note in &notes {
            state.index.insert(note.id.clone(), key.clone());
        }

        state.clock += 1;
        let version = state.clock;
        state.versions.insert(key.clone(), version);

        Ok(Snapshot { notes, version })
    }

    /// Find the entity of a note, scanning every entity when the index misses
    fn locate_locked(&self, state: &mut State, id: &NoteId) -> Option<EntityKey> {
        if let Some(key) = state.index.get(id) {
            if self.read_locked(key).iter().any(|note| &note.id == id) {
                return Some(key.clone());
            }
        }

        let key = self
            .keys_locked()
            .into_iter()
            .find(|key| self.read_locked(key).iter().any(|note| &note.id == id));

        match &key {
            Some(key) => {
                state.index.insert(id.clone(), key.clone());
            }
            None => {
                state.index.remove(id);
            }
        }

        key
    }
}

/// Record the notes that differ between two versions of an entity's list
fn mark_written(state: &mut State, key: &EntityKey, before: &[Note], after: &[Note]) {
    let added_or_changed = after.iter().filter(|note| !before.contains(note));
    let removed = before
        .iter()
        .filter(|note| !after.iter().any(|kept| kept.id == note.id));

    let ids = added_or_changed
        .chain(removed)
        .map(|note| note.id.clone())
        .collect::<Vec<NoteId>>();

    for id in &ids {
        mark_note(state, key, id);
    }
}

fn mark_note(state: &mut State, key: &EntityKey, id: &NoteId) {
    state.last_ticket += 1;
    let ticket = Ticket(state.last_ticket);

    state
        .written
        .entry(key.clone())
        .or_default()
        .insert(id.clone(), ticket);
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use chrono::Utc;

    use super::*;
    use crate::notes::Author;
    use crate::notes::ContentFormat;
    use crate::notes::CreateNoteValues;

    fn key(id: &str) -> EntityKey {
        EntityKey::new(EntityType::Call, id).unwrap()
    }

    fn note(key: &EntityKey, content: &str) -> Note {
        Note::provisional(&CreateNoteValues {
            entity: key.clone(),
            content: content.into(),
            content_format: ContentFormat::Plain,
            author: Author {
                id: "u1".into(),
                name: None,
                email: None,
            },
        })
    }

    fn mirror() -> (Arc<Memory>, LocalMirror) {
        let store = Arc::new(Memory::new());

        (store.clone(), LocalMirror::new(store))
    }

    #[test]
    fn test_update_persists_sorted_list() {
        let (store, mirror) = mirror();
        let c1 = key("c1");

        let mut late = note(&c1, "late");
        late.created_at = Utc::now() + Duration::minutes(5);
        let early = note(&c1, "early");

        let (_, snapshot) = mirror
            .update(&c1, |notes| {
                notes.push(late.clone());
                notes.push(early.clone());
            })
            .unwrap();

        assert_eq!(vec![early.clone(), late.clone()], snapshot.notes);
        assert!(store.get("call:c1").unwrap().is_some());
        assert_eq!(snapshot, mirror.load(&c1));
    }

    #[test]
    fn test_versions_increase() {
        let (_, mirror) = mirror();
        let c1 = key("c1");

        let (_, first) = mirror.update(&c1, |notes| notes.push(note(&c1, "a"))).unwrap();
        let (_, second) = mirror.update(&c1, |notes| notes.push(note(&c1, "b"))).unwrap();

        assert!(second.version > first.version);
    }

    #[test]
    fn test_corrupt_entry_is_empty() {
        let (store, mirror) = mirror();
        store.set("call:c1", "{not json").unwrap();

        assert!(mirror.load(&key("c1")).notes.is_empty());
    }

    #[test]
    fn test_find_modify_and_remove_by_id() {
        let (store, mirror) = mirror();
        let c1 = key("c1");
        let c2 = key("c2");
        let one = note(&c1, "one");
        let two = note(&c2, "two");

        mirror.update(&c1, |notes| notes.push(one.clone())).unwrap();
        mirror.update(&c2, |notes| notes.push(two.clone())).unwrap();

        assert_eq!(Some(two.clone()), mirror.find(&two.id));

        let (edited, _) = mirror
            .modify_note(&two.id, |note| note.content = "edited".into())
            .unwrap()
            .unwrap();
        assert_eq!("edited", edited.content);
        assert_eq!("edited", mirror.load(&c2).notes[0].content);

        let (removed_from, snapshot) = mirror.remove_note(&two.id).unwrap().unwrap();
        assert_eq!(c2, removed_from);
        assert!(snapshot.notes.is_empty());
        assert!(store.get("call:c2").unwrap().is_none());

        assert!(mirror.find(&two.id).is_none());
        assert!(mirror.remove_note(&two.id).unwrap().is_none());
        assert_eq!(vec![one], mirror.load(&c1).notes);
    }

    #[test]
    fn test_index_is_rebuilt_on_start() {
        let store = Arc::new(Memory::new());
        let c1 = key("c1");
        let one = note(&c1, "one");

        LocalMirror::new(store.clone())
            .update(&c1, |notes| notes.push(one.clone()))
            .unwrap();

        let mirror = LocalMirror::new(store);

        assert_eq!(Some(one.clone()), mirror.find(&one.id));
        assert_eq!(vec![c1], mirror.keys());
    }

    #[test]
    fn test_stale_reconciliation_is_discarded() {
        let (_, mirror) = mirror();
        let c1 = key("c1");

        let mut newer = note(&c1, "newer");
        newer.id = NoteId::remote("r1");
        let mut older = newer.clone();
        older.content = "older".into();

        let slow = mirror.begin_reconcile();
        let fast = mirror.begin_reconcile();

        let applied = mirror
            .commit_reconcile(&c1, fast, &[newer.clone()])
            .unwrap()
            .unwrap();
        assert_eq!(vec![newer.clone()], applied.notes);

        assert!(mirror.commit_reconcile(&c1, slow, &[older]).unwrap().is_none());
        assert_eq!(vec![newer], mirror.load(&c1).notes);
    }

    #[test]
    fn test_reconciliation_keeps_local_writes() {
        let (_, mirror) = mirror();
        let c1 = key("c1");

        let ticket = mirror.begin_reconcile();

        // written while the fetch was in flight
        let local = note(&c1, "written offline");
        mirror.update(&c1, |notes| notes.push(local.clone())).unwrap();

        let mut remote = note(&c1, "from remote");
        remote.id = NoteId::remote("r1");

        let snapshot = mirror
            .commit_reconcile(&c1, ticket, &[remote])
            .unwrap()
            .unwrap();

        assert_eq!(2, snapshot.notes.len());
        assert!(snapshot.notes.contains(&local));
    }

    #[test]
    fn test_reconciliation_keeps_notes_confirmed_meanwhile() {
        let (_, mirror) = mirror();
        let c1 = key("c1");

        let placeholder = note(&c1, "hello");
        mirror
            .update(&c1, |notes| notes.push(placeholder.clone()))
            .unwrap();

        // fetched before the insert
        let ticket = mirror.begin_reconcile();

        let mut confirmed = placeholder.clone();
        confirmed.id = NoteId::remote("r1");
        mirror
            .update(&c1, |notes| {
                crate::merge::replace_placeholder(notes, &placeholder.id, confirmed.clone())
            })
            .unwrap();

        let snapshot = mirror.commit_reconcile(&c1, ticket, &[]).unwrap().unwrap();
        assert_eq!(vec![confirmed.clone()], snapshot.notes);
        assert_eq!(vec![confirmed.clone()], mirror.load(&c1).notes);

        // a fetch that started after the insert is authoritative again
        let ticket = mirror.begin_reconcile();
        let snapshot = mirror.commit_reconcile(&c1, ticket, &[]).unwrap().unwrap();
        assert!(snapshot.notes.is_empty());
    }

    #[test]
    fn test_reconciliation_keeps_edits_and_removals_made_meanwhile() {
        let (_, mirror) = mirror();
        let c1 = key("c1");

        let mut kept = note(&c1, "kept");
        kept.id = NoteId::remote("r1");
        let mut removed = note(&c1, "removed");
        removed.id = NoteId::remote("r2");

        let ticket = mirror.begin_reconcile();
        mirror
            .commit_reconcile(&c1, ticket, &[kept.clone(), removed.clone()])
            .unwrap();

        let ticket = mirror.begin_reconcile();

        let (edited, _) = mirror
            .modify_note(&kept.id, |note| note.content = "edited".into())
            .unwrap()
            .unwrap();
        mirror.remove_note(&removed.id).unwrap();

        let snapshot = mirror
            .commit_reconcile(&c1, ticket, &[kept, removed])
            .unwrap()
            .unwrap();
        assert_eq!(vec![edited], snapshot.notes);
    }
}
