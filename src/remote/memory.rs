//! Memory remote store
//!
//! An in-process stand-in for the hosted store, shared by every coordinator that gets a clone.
//! Can be made unreachable or slow to exercise the offline paths.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::notes::EntityKey;
use crate::notes::NewNote;
use crate::notes::Note;
use crate::notes::NoteId;
use crate::notes::NotePatch;
use crate::notes::sort_notes;

use super::Change;
use super::ChangeKind;
use super::Channel;
use super::ChannelEvent;
use super::ChannelHandle;
use super::RemoteError;
use super::RemoteStore;
use super::Result;
use super::issued_id;

/// An in-memory remote store
///
/// Will be destroyed on system shutdown
#[derive(Clone, Debug)]
pub struct Memory {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    /// All notes in storage
    notes: Mutex<HashMap<NoteId, Note>>,

    /// Every change, fanned out to the open channels
    changes: broadcast::Sender<Change>,

    /// Open channels and the task forwarding their events
    channels: Mutex<HashMap<ChannelHandle, (mpsc::UnboundedSender<ChannelEvent>, JoinHandle<()>)>>,

    next_channel: AtomicU64,

    reachable: AtomicBool,

    /// Simulated latency in milliseconds
    delay_ms: AtomicU64,
}

impl Memory {
    /// Create a new empty, reachable Memory store
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);

        Self {
            inner: Arc::new(Inner {
                notes: Mutex::new(HashMap::new()),
                changes,
                channels: Mutex::new(HashMap::new()),
                next_channel: AtomicU64::new(1),
                reachable: AtomicBool::new(true),
                delay_ms: AtomicU64::new(0),
            }),
        }
    }

    /// Make the store (un)reachable for every following call
    #[cfg(test)]
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Delay every following call, to run into the caller's timeouts
    #[cfg(test)]
    pub fn set_delay(&self, delay: Duration) {
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.inner.delay_ms.store(delay_ms, Ordering::SeqCst);
    }

    /// Break every open channel
    #[cfg(test)]
    pub async fn fail_channels(&self, message: &str) {
        for (sender, _) in self.inner.channels.lock().await.values() {
            let _ = sender.send(ChannelEvent::Error(message.to_string()));
        }
    }

    /// Number of notes in the store
    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.inner.notes.lock().await.len()
    }

    /// Number of open channels
    #[cfg(test)]
    pub async fn channel_count(&self) -> usize {
        self.inner.channels.lock().await.len()
    }

    /// Simulate the network: wait, then fail when unreachable
    async fn round_trip(&self) -> Result<()> {
        let delay_ms = self.inner.delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }

        if self.inner.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::Unavailable("Connection refused".into()))
        }
    }

    fn publish(&self, kind: ChangeKind, note: &Note) {
        // no receivers is fine
        let _ = self.inner.changes.send(Change {
            kind,
            entity: note.entity(),
            note_id: note.id.clone(),
        });
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for Memory {
    async fn insert(&self, note: &NewNote) -> Result<Note> {
        self.round_trip().await?;

        let note = note
            .clone()
            .into_note(issued_id(Uuid::new_v4().to_string())?);

        self.inner
            .notes
            .lock()
            .await
            .insert(note.id.clone(), note.clone());

        self.publish(ChangeKind::Insert, &note);

        Ok(note)
    }

    async fn update(&self, id: &NoteId, patch: &NotePatch) -> Result<Note> {
        self.round_trip().await?;

        let note = self
            .inner
            .notes
            .lock()
            .await
            .get_mut(id)
            .map(|note| {
                note.apply(patch);

                note.clone()
            })
            .ok_or(RemoteError::NotFound)?;

        self.publish(ChangeKind::Update, &note);

        Ok(note)
    }

    async fn delete(&self, id: &NoteId) -> Result<()> {
        self.round_trip().await?;

        let note = self
            .inner
            .notes
            .lock()
            .await
            .remove(id)
            .ok_or(RemoteError::NotFound)?;

        self.publish(ChangeKind::Delete, &note);

        Ok(())
    }

    async fn select(&self, entity: &EntityKey) -> Result<Vec<Note>> {
        self.round_trip().await?;

        let mut notes = self
            .inner
            .notes
            .lock()
            .await
            .values()
            .filter(|note| &note.entity() == entity)
            .cloned()
            .collect::<Vec<Note>>();

        sort_notes(&mut notes);

        Ok(notes)
    }

    async fn subscribe(&self, entity: &EntityKey) -> Result<Channel> {
        self.round_trip().await?;

        let handle = ChannelHandle(self.inner.next_channel.fetch_add(1, Ordering::SeqCst));
        let (sender, events) = mpsc::unbounded_channel();

        let mut changes = self.inner.changes.subscribe();
        let forward = sender.clone();
        let entity = entity.clone();
        let task = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        if change.entity == entity
                            && forward.send(ChannelEvent::Change(change)).is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!("Channel for {entity} skipped {skipped} changes");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.inner
            .channels
            .lock()
            .await
            .insert(handle, (sender, task));

        Ok(Channel { handle, events })
    }

    async fn unsubscribe(&self, handle: ChannelHandle) {
        if let Some((_, task)) = self.inner.channels.lock().await.remove(&handle) {
            task.abort();
        }
    }
}
