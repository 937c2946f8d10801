//! Subscriptions of views to the notes of an entity
//!
//! A subscription gets the local notes right away, then the merged notes every time the
//! remote store reports a change on the entity. Changes are never applied incrementally, every
//! change triggers a full reconciliation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::error::Result;
use crate::notes::EntityKey;
use crate::remote::ChannelEvent;
use crate::remote::ChannelHandle;
use crate::sync::ListenerId;
use crate::sync::NotesCallback;
use crate::sync::SyncCoordinator;

/// Identifier of a subscription
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Lifecycle of a subscription
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubscriptionState {
    /// Not (or no longer) subscribed
    Unsubscribed,

    /// Waiting for the remote channel
    Subscribing,

    /// Receiving remote changes
    Active,

    /// The remote channel failed, only local changes are delivered
    Error,
}

struct Entry {
    key: EntityKey,
    listener: ListenerId,
    state: SubscriptionState,
    channel: Option<ChannelHandle>,
    task: Option<JoinHandle<()>>,
}

/// Owner of all subscriptions and their remote channels
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<Inner>,
}

struct Inner {
    coordinator: SyncCoordinator,
    next_id: AtomicU64,
    subscriptions: Mutex<HashMap<SubscriptionId, Entry>>,
}

/// Handle of a single subscription
pub struct Subscription {
    id: SubscriptionId,
    manager: SubscriptionManager,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn state(&self) -> SubscriptionState {
        self.manager.state(self.id)
    }

    /// Stop receiving notes, safe to call more than once
    pub async fn unsubscribe(&self) {
        self.manager.unsubscribe(self.id).await;
    }
}

impl SubscriptionManager {
    pub fn new(coordinator: SyncCoordinator) -> Self {
        Self {
            inner: Arc::new(Inner {
                coordinator,
                next_id: AtomicU64::new(1),
                subscriptions: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn subscriptions(&self) -> MutexGuard<'_, HashMap<SubscriptionId, Entry>> {
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Subscribe to the notes of an entity
    ///
    /// The callback receives the local notes before this returns
    pub async fn subscribe(&self, key: &EntityKey, callback: NotesCallback) -> Result<Subscription> {
        key.validate()?;

        let coordinator = &self.inner.coordinator;
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let listener = coordinator.add_listener(key, callback.clone());

        self.subscriptions().insert(
            id,
            Entry {
                key: key.clone(),
                listener,
                state: SubscriptionState::Subscribing,
                channel: None,
                task: None,
            },
        );

        match coordinator.read_local(key).await {
            Ok(notes) => callback(key, notes),
            Err(err) => {
                self.unsubscribe(id).await;
                return Err(err);
            }
        }

        self.open_channel(id, key).await;

        coordinator.spawn_reconcile(key);

        tracing::debug!("Subscribed to {key}");

        Ok(Subscription {
            id,
            manager: self.clone(),
        })
    }

    /// Tear down a subscription, returns `false` when it was already gone
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let entry = self.subscriptions().remove(&id);

        let Some(entry) = entry else {
            return false;
        };

        self.inner
            .coordinator
            .remove_listener(&entry.key, entry.listener);

        if let Some(task) = entry.task {
            task.abort();
        }

        if let Some(handle) = entry.channel {
            self.inner.coordinator.remote().unsubscribe(handle).await;
        }

        tracing::debug!("Unsubscribed from {}", entry.key);

        true
    }

    /// Tear down every subscription
    pub async fn unsubscribe_all(&self) {
        let ids = self.subscriptions().keys().copied().collect::<Vec<_>>();

        for id in ids {
            self.unsubscribe(id).await;
        }
    }

    pub fn state(&self, id: SubscriptionId) -> SubscriptionState {
        self.subscriptions()
            .get(&id)
            .map_or(SubscriptionState::Unsubscribed, |entry| entry.state)
    }

    /// Number of live subscriptions
    pub fn count(&self) -> usize {
        self.subscriptions().len()
    }

    async fn open_channel(&self, id: SubscriptionId, key: &EntityKey) {
        let coordinator = &self.inner.coordinator;

        if !coordinator.breaker().allow() {
            tracing::debug!("Remote store unavailable, {key} only receives local changes");
            self.set_state(id, SubscriptionState::Error);
            return;
        }

        let opened = timeout(
            coordinator.settings().read_timeout,
            coordinator.remote().subscribe(key),
        )
        .await;

        let channel = match opened {
            Ok(Ok(channel)) => {
                coordinator.breaker().record_success();
                channel
            }
            Ok(Err(err)) => {
                self.fail(id, &err.to_string());
                return;
            }
            Err(_) => {
                self.fail(id, "Timed out opening channel");
                return;
            }
        };

        let handle = channel.handle;
        let unsubscribed = {
            let mut subscriptions = self.subscriptions();

            match subscriptions.get_mut(&id) {
                Some(entry) => {
                    entry.state = SubscriptionState::Active;
                    entry.channel = Some(handle);
                    entry.task = Some(tokio::spawn(self.clone().listen(
                        id,
                        key.clone(),
                        channel.events,
                    )));
                    false
                }
                None => true,
            }
        };

        // unsubscribed while the channel was opening
        if unsubscribed {
            coordinator.remote().unsubscribe(handle).await;
        }
    }

    async fn listen(
        self,
        id: SubscriptionId,
        key: EntityKey,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) {
        let coordinator = &self.inner.coordinator;

        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Change(change) => {
                    tracing::debug!("{:?} of note {} on {key}", change.kind, change.note_id);

                    coordinator.breaker().record_success();
                    coordinator.invalidate(&key).await;
                    coordinator.spawn_reconcile(&key);
                }
                ChannelEvent::Error(message) => {
                    self.fail(id, &message);
                    return;
                }
            }
        }

        self.fail(id, "Channel closed");
    }

    /// The channel broke: mark the subscription and the remote store as failed
    fn fail(&self, id: SubscriptionId, message: &str) {
        let failed = match self.subscriptions().get_mut(&id) {
            Some(entry) if entry.state != SubscriptionState::Error => {
                tracing::warn!("Subscription to {} failed: {message}", entry.key);
                entry.state = SubscriptionState::Error;
                entry.task = None;
                true
            }
            _ => false,
        };

        if failed {
            self.inner.coordinator.breaker().trip();
        }
    }

    fn set_state(&self, id: SubscriptionId, state: SubscriptionState) {
        if let Some(entry) = self.subscriptions().get_mut(&id) {
            entry.state = state;
        }
    }
}
