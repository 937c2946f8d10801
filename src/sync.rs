//! The sync coordinator, single entry point for all note operations
//!
//! Callers always get an immediate answer from local state. The remote store is reconciled in the
//! background and listeners of an entity receive the merged list once it is known.
//!
//! Remote unavailability never reaches the caller: when the remote store fails the local mirror
//! is the answer, and the circuit breaker keeps futile remote calls from being made.

use std::collections::HashMap;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde::Serialize;
use tokio::time::timeout;
use tokio_util::task::TaskTracker;

use crate::breaker::BreakerStatus;
use crate::breaker::CircuitBreaker;
use crate::cache::NoteCache;
use crate::error::Error;
use crate::error::Result;
use crate::merge::replace_placeholder;
use crate::mirror::LocalMirror;
use crate::mirror::Snapshot;
use crate::notes::CreateNoteValues;
use crate::notes::EntityKey;
use crate::notes::Note;
use crate::notes::NoteId;
use crate::notes::NotePatch;
use crate::notes::UpdateNoteValues;
use crate::notes::validate_note_id;
use crate::remote::RemoteError;
use crate::remote::RemoteStore;

/// Timings of the coordinator
#[derive(Clone, Debug)]
pub struct SyncSettings {
    /// How long a cached note list is served
    pub cache_ttl: Duration,

    /// Timeout of fetching the remote note list
    pub read_timeout: Duration,

    /// Timeout of inserting, updating and deleting remotely
    pub write_timeout: Duration,

    /// How long remote calls are skipped after the remote store failed
    pub breaker_cooldown: Duration,

    /// Consecutive failures before remote calls are skipped
    pub breaker_failure_threshold: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(30),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(8),
            breaker_cooldown: Duration::from_secs(30),
            breaker_failure_threshold: 1,
        }
    }
}

/// Callback receiving the full, ordered note list of an entity
pub type NotesCallback = Arc<dyn Fn(&EntityKey, Vec<Note>) + Send + Sync>;

/// Identifier of a registered listener
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

/// Callbacks per entity
#[derive(Default)]
struct Listeners {
    next_id: AtomicU64,
    callbacks: Mutex<HashMap<EntityKey, Vec<(ListenerId, NotesCallback)>>>,
}

impl Listeners {
    fn callbacks(&self) -> MutexGuard<'_, HashMap<EntityKey, Vec<(ListenerId, NotesCallback)>>> {
        self.callbacks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn add(&self, key: &EntityKey, callback: NotesCallback) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));

        self.callbacks()
            .entry(key.clone())
            .or_default()
            .push((id, callback));

        id
    }

    fn remove(&self, key: &EntityKey, id: ListenerId) -> bool {
        let mut callbacks = self.callbacks();

        let Some(listeners) = callbacks.get_mut(key) else {
            return false;
        };

        let count = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        let removed = listeners.len() != count;

        if listeners.is_empty() {
            callbacks.remove(key);
        }

        removed
    }

    fn notify(&self, key: &EntityKey, notes: &[Note]) {
        // call outside of the lock, a callback may (un)register
        let callbacks = self
            .callbacks()
            .get(key)
            .map(|listeners| {
                listeners
                    .iter()
                    .map(|(_, callback)| callback.clone())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        for callback in callbacks {
            callback(key, notes.to_vec());
        }
    }
}

/// Outcome of a sync pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// Local notes confirmed by the remote store
    pub pushed: usize,

    /// Local notes that could not be pushed
    pub failed: usize,
}

/// Outcome of pushing a single local note
#[derive(Debug, PartialEq, Eq)]
enum PushOutcome {
    Pushed,
    Skipped,
    Failed,
}

/// The sync coordinator
///
/// Cheap to clone, all clones share the same state
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    remote: Arc<dyn RemoteStore>,
    mirror: LocalMirror,
    cache: NoteCache,
    breaker: CircuitBreaker,
    listeners: Listeners,
    settings: SyncSettings,

    /// Local notes currently being pushed
    in_flight: Mutex<HashSet<NoteId>>,

    /// Background sync work
    tasks: TaskTracker,
}

impl SyncCoordinator {
    /// Create the coordinator
    pub fn new(remote: Arc<dyn RemoteStore>, mirror: LocalMirror, settings: SyncSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                remote,
                mirror,
                cache: NoteCache::new(settings.cache_ttl),
                breaker: CircuitBreaker::new(
                    settings.breaker_cooldown,
                    settings.breaker_failure_threshold,
                ),
                listeners: Listeners::default(),
                settings,
                in_flight: Mutex::new(HashSet::new()),
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// The remote store
    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.inner.remote
    }

    /// The circuit breaker guarding the remote store
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.inner.settings
    }

    pub fn breaker_status(&self) -> BreakerStatus {
        self.inner.breaker.status()
    }

    /// Create a note
    ///
    /// The note is stored locally and returned right away with a local-origin ID, the remote
    /// store is updated in the background.
    pub async fn create(&self, values: &CreateNoteValues) -> Result<Note> {
        values.validate()?;

        let note = Note::provisional(values);
        let key = note.entity();

        let ((), snapshot) = self
            .inner
            .mirror
            .update(&key, |notes| notes.push(note.clone()))?;

        tracing::debug!("Created note {} on {key}", note.id);

        self.publish(&key, snapshot).await;

        let coordinator = self.clone();
        let pending = note.clone();
        self.spawn(async move {
            coordinator.push(&pending).await;
        });

        Ok(note)
    }

    /// All notes of an entity, ordered by creation time
    ///
    /// Served from the cache or the local mirror, a reconciliation with the remote store is
    /// started in the background.
    pub async fn read(&self, key: &EntityKey) -> Result<Vec<Note>> {
        let notes = self.read_local(key).await?;

        self.spawn_reconcile(key);

        Ok(notes)
    }

    /// All notes of an entity from local state only
    pub async fn read_local(&self, key: &EntityKey) -> Result<Vec<Note>> {
        key.validate()?;

        if let Some(notes) = self.inner.cache.get(key).await {
            tracing::debug!("Cache hit for {key}");
            return Ok(notes);
        }

        let snapshot = self.inner.mirror.load(key);
        let notes = snapshot.notes.clone();
        self.inner.cache.put(key, snapshot).await;

        Ok(notes)
    }

    /// Update a note
    ///
    /// The remote store is tried first, when it is unavailable the local copy is updated and a
    /// single background attempt to sync it is made.
    pub async fn update(&self, id: &NoteId, values: &UpdateNoteValues) -> Result<Note> {
        validate_note_id(id)?;
        values.validate()?;

        let patch = values.to_patch();

        if !id.is_local() {
            match self.remote_update(id, &patch).await {
                Ok(note) => {
                    self.store_confirmed(&note).await?;
                    return Ok(note);
                }
                Err(Error::NotFound) => {
                    tracing::debug!("Note {id} unknown remotely, updating locally");
                }
                Err(err) => {
                    tracing::debug!("Remote update of {id} failed, updating locally: {err}");
                }
            }
        }

        let (note, snapshot) = self
            .inner
            .mirror
            .modify_note(id, |note| note.apply(&patch))?
            .ok_or(Error::NotFound)?;

        let key = note.entity();
        self.publish(&key, snapshot).await;

        let coordinator = self.clone();
        let pending = note.clone();
        self.spawn(async move {
            if pending.id.is_local() {
                coordinator.push(&pending).await;
            } else if let Err(err) = coordinator.remote_update(&pending.id, &patch).await {
                tracing::debug!("Background update of {} failed: {err}", pending.id);
            }
        });

        Ok(note)
    }

    /// Delete a note
    ///
    /// Removed from the remote store and the local mirror, fails only when neither had it
    pub async fn delete(&self, id: &NoteId) -> Result<()> {
        validate_note_id(id)?;

        let mut remote_failed = false;
        let deleted_remotely = if id.is_local() {
            false
        } else {
            match self.remote_delete(id).await {
                Ok(()) => true,
                Err(Error::NotFound) => false,
                Err(err) => {
                    tracing::debug!("Remote delete of {id} failed, deleting locally: {err}");
                    remote_failed = true;
                    false
                }
            }
        };

        let deleted_locally = match self.inner.mirror.remove_note(id)? {
            Some((key, snapshot)) => {
                self.publish(&key, snapshot).await;
                true
            }
            None => false,
        };

        if remote_failed {
            let coordinator = self.clone();
            let id = id.clone();
            self.spawn(async move {
                if let Err(err) = coordinator.remote_delete(&id).await {
                    tracing::debug!("Background delete of {id} failed: {err}");
                }
            });
        }

        if deleted_remotely || deleted_locally {
            tracing::debug!("Deleted note {id}");
            Ok(())
        } else {
            Err(Error::NotFound)
        }
    }

    /// Push every local note that is not confirmed by the remote store yet
    pub async fn sync_pending(&self) -> SyncReport {
        let mut report = SyncReport::default();

        for key in self.inner.mirror.keys() {
            let pending = self
                .inner
                .mirror
                .load(&key)
                .notes
                .into_iter()
                .filter(|note| note.id.is_local());

            for note in pending {
                match self.push(&note).await {
                    PushOutcome::Pushed => report.pushed += 1,
                    PushOutcome::Failed => report.failed += 1,
                    PushOutcome::Skipped => {}
                }
            }
        }

        if report != SyncReport::default() {
            tracing::info!(
                "Sync pass pushed {} notes, {} failed",
                report.pushed,
                report.failed
            );
        }

        report
    }

    /// Fetch the remote notes of an entity and merge them into the local ones
    ///
    /// Returns the merged list, or `None` when the remote store was skipped or failed, or a
    /// newer reconciliation was already applied.
    pub async fn reconcile(&self, key: &EntityKey) -> Option<Vec<Note>> {
        if !self.inner.breaker.allow() {
            tracing::debug!("Remote store unavailable, not reconciling {key}");
            return None;
        }

        let ticket = self.inner.mirror.begin_reconcile();

        let remote = self
            .remote_call(self.inner.settings.read_timeout, self.inner.remote.select(key))
            .await;

        let remote = match remote {
            Ok(remote) => remote,
            Err(err) => {
                tracing::debug!("Could not reconcile {key}: {err}");
                return None;
            }
        };

        let snapshot = match self.inner.mirror.commit_reconcile(key, ticket, &remote) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return None,
            Err(err) => {
                tracing::warn!("Could not store reconciled notes of {key}: {err}");
                return None;
            }
        };

        let notes = snapshot.notes.clone();
        self.publish(key, snapshot).await;

        Some(notes)
    }

    /// Reconcile an entity in the background
    pub fn spawn_reconcile(&self, key: &EntityKey) {
        let coordinator = self.clone();
        let key = key.clone();

        self.spawn(async move {
            coordinator.reconcile(&key).await;
        });
    }

    /// Forget the cached notes of an entity
    pub async fn invalidate(&self, key: &EntityKey) {
        self.inner.cache.invalidate(key).await;
    }

    /// Register a callback for every new note list of an entity
    pub fn add_listener(&self, key: &EntityKey, callback: NotesCallback) -> ListenerId {
        self.inner.listeners.add(key, callback)
    }

    /// Remove a callback, returns `false` when it was not registered
    pub fn remove_listener(&self, key: &EntityKey, id: ListenerId) -> bool {
        self.inner.listeners.remove(key, id)
    }

    /// Wait for all background sync work started so far
    pub async fn settle(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.tasks.reopen();
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.tasks.spawn(task);
    }

    /// Write a new note list of an entity to the cache and tell the listeners
    async fn publish(&self, key: &EntityKey, snapshot: Snapshot) {
        let notes = snapshot.notes.clone();

        self.inner.cache.put(key, snapshot).await;
        self.inner.listeners.notify(key, &notes);
    }

    /// Insert a local note remotely and replace the placeholder with the confirmed note
    async fn push(&self, note: &Note) -> PushOutcome {
        let key = note.entity();

        if !self.claim(&note.id) {
            return PushOutcome::Skipped;
        }

        let outcome = self.push_claimed(&key, note).await;

        self.release(&note.id);

        outcome
    }

    async fn push_claimed(&self, key: &EntityKey, note: &Note) -> PushOutcome {
        // confirmed or deleted since this push was scheduled
        if !self.inner.mirror.contains(key, &note.id) {
            return PushOutcome::Skipped;
        }

        // the latest local version, it may have been edited meanwhile
        let Some(latest) = self.inner.mirror.find(&note.id) else {
            return PushOutcome::Skipped;
        };

        if !self.inner.breaker.allow() {
            tracing::debug!("Remote store unavailable, not pushing note {}", note.id);
            return PushOutcome::Failed;
        }

        let confirmed = match self
            .remote_call(
                self.inner.settings.write_timeout,
                self.inner.remote.insert(&latest.to_new_note()),
            )
            .await
        {
            Ok(confirmed) => confirmed,
            Err(err) => {
                tracing::debug!("Could not push note {}: {err}", note.id);
                return PushOutcome::Failed;
            }
        };

        let replaced = self.inner.mirror.update(key, |notes| {
            replace_placeholder(notes, &note.id, confirmed.clone())
        });

        match replaced {
            Ok((true, snapshot)) => {
                tracing::debug!("Note {} confirmed as {}", note.id, confirmed.id);
                self.publish(key, snapshot).await;
                PushOutcome::Pushed
            }
            Ok((false, _)) => {
                tracing::debug!(
                    "Note {} was deleted while syncing, deleting {}",
                    note.id,
                    confirmed.id
                );
                if let Err(err) = self.remote_delete(&confirmed.id).await {
                    tracing::warn!("Could not delete {} remotely: {err}", confirmed.id);
                }
                PushOutcome::Skipped
            }
            Err(err) => {
                tracing::warn!("Could not store confirmed note {}: {err}", confirmed.id);
                PushOutcome::Failed
            }
        }
    }

    fn in_flight(&self) -> MutexGuard<'_, HashSet<NoteId>> {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn claim(&self, id: &NoteId) -> bool {
        self.in_flight().insert(id.clone())
    }

    fn release(&self, id: &NoteId) {
        self.in_flight().remove(id);
    }

    /// Store a note confirmed by the remote store in the mirror
    ///
    /// Only entities already held locally are updated, others are fetched on the next read
    async fn store_confirmed(&self, note: &Note) -> Result<()> {
        let key = note.entity();

        let (found, snapshot) = self.inner.mirror.update(&key, |notes| {
            match notes.iter_mut().find(|local| local.id == note.id) {
                Some(local) => {
                    *local = note.clone();
                    true
                }
                None => false,
            }
        })?;

        if found {
            self.publish(&key, snapshot).await;
        } else {
            self.inner.cache.invalidate(&key).await;
        }

        Ok(())
    }

    async fn remote_update(&self, id: &NoteId, patch: &NotePatch) -> Result<Note> {
        if !self.inner.breaker.allow() {
            return Err(Error::RemoteUnavailable("Circuit open".into()));
        }

        self.remote_call(
            self.inner.settings.write_timeout,
            self.inner.remote.update(id, patch),
        )
        .await
    }

    async fn remote_delete(&self, id: &NoteId) -> Result<()> {
        if !self.inner.breaker.allow() {
            return Err(Error::RemoteUnavailable("Circuit open".into()));
        }

        self.remote_call(self.inner.settings.write_timeout, self.inner.remote.delete(id))
            .await
    }

    /// Run a remote call with a timeout and report the outcome to the breaker
    ///
    /// The caller must have been allowed by the breaker
    async fn remote_call<T, F>(&self, limit: Duration, call: F) -> Result<T>
    where
        F: Future<Output = core::result::Result<T, RemoteError>>,
    {
        match timeout(limit, call).await {
            Ok(Ok(value)) => {
                self.inner.breaker.record_success();
                Ok(value)
            }
            Ok(Err(err)) => {
                if err.is_reachable() {
                    self.inner.breaker.record_success();
                } else {
                    self.inner.breaker.record_failure();
                }
                Err(err.into())
            }
            Err(_) => {
                self.inner.breaker.record_failure();
                Err(Error::RemoteUnavailable(format!("Timed out after {limit:?}")))
            }
        }
    }
}
