use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;

use axum::Extension;
use axum::response::sse::Event;
use axum::response::sse::KeepAlive;
use axum::response::sse::KeepAliveStream;
use axum::response::sse::Sse;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::Stream;

use crate::notes::Author;
use crate::notes::ContentFormat;
use crate::notes::CreateNoteValues;
use crate::notes::EntityKey;
use crate::notes::EntityType;
use crate::notes::Note;
use crate::notes::NoteId;
use crate::notes::UpdateNoteValues;
use crate::subscriptions::Subscription;
use crate::subscriptions::SubscriptionManager;
use crate::sync::SyncCoordinator;

use super::Error;
use super::Form;
use super::PathParameters;
use super::Success;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteResponse {
    #[serde(flatten)]
    pub note: Note,

    /// The remote store confirmed the note
    pub is_synced: bool,
}

impl NoteResponse {
    fn from_note(note: Note) -> Self {
        Self {
            is_synced: !note.id.is_local(),
            note,
        }
    }

    fn from_note_multiple(notes: Vec<Note>) -> Vec<Self> {
        notes.into_iter().map(Self::from_note).collect::<Vec<Self>>()
    }
}

pub async fn list(
    Extension(coordinator): Extension<SyncCoordinator>,
    PathParameters((entity_type, entity_id)): PathParameters<(EntityType, String)>,
) -> Result<Success<Vec<NoteResponse>>, Error> {
    let key = EntityKey::new(entity_type, entity_id)?;

    let notes = coordinator.read(&key).await?;

    Ok(Success::ok(NoteResponse::from_note_multiple(notes)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNoteForm {
    content: String,
    #[serde(default)]
    content_format: ContentFormat,
    created_by: String,
    created_by_name: Option<String>,
    created_by_email: Option<String>,
}

pub async fn create(
    Extension(coordinator): Extension<SyncCoordinator>,
    PathParameters((entity_type, entity_id)): PathParameters<(EntityType, String)>,
    Form(form): Form<CreateNoteForm>,
) -> Result<Success<NoteResponse>, Error> {
    let values = CreateNoteValues {
        entity: EntityKey::new(entity_type, entity_id)?,
        content: form.content,
        content_format: form.content_format,
        author: Author {
            id: form.created_by,
            name: form.created_by_name,
            email: form.created_by_email,
        },
    };

    let note = coordinator.create(&values).await?;

    Ok(Success::created(NoteResponse::from_note(note)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateNoteForm {
    content: String,
    #[serde(default)]
    content_format: ContentFormat,
    edited_by: String,
    edited_by_name: Option<String>,
}

pub async fn update(
    Extension(coordinator): Extension<SyncCoordinator>,
    PathParameters(note_id): PathParameters<NoteId>,
    Form(form): Form<UpdateNoteForm>,
) -> Result<Success<NoteResponse>, Error> {
    let values = UpdateNoteValues {
        content: form.content,
        content_format: form.content_format,
        editor: Author {
            id: form.edited_by,
            name: form.edited_by_name,
            email: None,
        },
    };

    let note = coordinator.update(&note_id, &values).await?;

    Ok(Success::ok(NoteResponse::from_note(note)))
}

pub async fn delete(
    Extension(coordinator): Extension<SyncCoordinator>,
    PathParameters(note_id): PathParameters<NoteId>,
) -> Result<Success<&'static str>, Error> {
    coordinator.delete(&note_id).await?;

    Ok(Success::<&'static str>::no_content())
}

/// Stream every new note list of an entity as server-sent events
pub async fn events(
    Extension(subscriptions): Extension<SubscriptionManager>,
    PathParameters((entity_type, entity_id)): PathParameters<(EntityType, String)>,
) -> Result<Sse<KeepAliveStream<NoteEvents>>, Error> {
    let key = EntityKey::new(entity_type, entity_id)?;

    let (sender, receiver) = mpsc::unbounded_channel();
    let subscription = subscriptions
        .subscribe(
            &key,
            Arc::new(move |_key: &EntityKey, notes: Vec<Note>| {
                // the stream is gone, it unsubscribes itself
                let _ = sender.send(notes);
            }),
        )
        .await?;

    Ok(Sse::new(NoteEvents {
        receiver,
        subscription: Some(subscription),
    })
    .keep_alive(KeepAlive::default()))
}

/// Note lists of a subscription as events, unsubscribes when dropped
pub struct NoteEvents {
    receiver: mpsc::UnboundedReceiver<Vec<Note>>,
    subscription: Option<Subscription>,
}

impl Stream for NoteEvents {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver
            .poll_recv(cx)
            .map(|notes| notes.map(|notes| Ok(notes_event(notes))))
    }
}

impl Drop for NoteEvents {
    fn drop(&mut self) {
        let Some(subscription) = self.subscription.take() else {
            return;
        };

        tracing::debug!("Event stream of subscription {:?} closed", subscription.id());

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                subscription.unsubscribe().await;
            });
        }
    }
}

fn notes_event(notes: Vec<Note>) -> Event {
    let notes = NoteResponse::from_note_multiple(notes);

    Event::default()
        .event("notes")
        .json_data(&notes)
        .unwrap_or_else(|err| Event::default().event("error").data(err.to_string()))
}
