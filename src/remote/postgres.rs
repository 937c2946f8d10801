//! Postgres remote store
//!
//! Change notifications are delivered with `LISTEN/NOTIFY`, a trigger on the notes table
//! publishes every change on the `notes_changes` channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use sqlx::PgPool;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgListener;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::notes::EntityKey;
use crate::notes::EntityType;
use crate::notes::NewNote;
use crate::notes::Note;
use crate::notes::NoteId;
use crate::notes::NotePatch;

use super::Change;
use super::ChangeKind;
use super::Channel;
use super::ChannelEvent;
use super::ChannelHandle;
use super::RemoteError;
use super::RemoteStore;
use super::Result;
use super::issued_id;

/// Migrator to run migrations on startup
static MIGRATOR: Migrator = sqlx::migrate!();

/// Postgres channel the notes trigger notifies on
const NOTIFY_CHANNEL: &str = "notes_changes";

const NOTE_COLUMNS: &str = r"
    id,
    reference_id,
    reference_type,
    content,
    content_format,
    created_by,
    created_by_name,
    created_by_email,
    last_edited_by,
    last_edited_by_name,
    last_edited_at,
    is_edited,
    created_at,
    updated_at
";

/// Postgres version of a note
#[derive(sqlx::FromRow)]
struct NoteRow {
    id: String,
    reference_id: String,
    reference_type: String,
    content: String,
    content_format: String,
    created_by: String,
    created_by_name: Option<String>,
    created_by_email: Option<String>,
    last_edited_by: Option<String>,
    last_edited_by_name: Option<String>,
    last_edited_at: Option<DateTime<Utc>>,
    is_edited: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl NoteRow {
    fn into_note(self) -> Result<Note> {
        Ok(Note {
            id: issued_id(self.id)?,
            reference_id: self.reference_id,
            reference_type: self.reference_type.parse().map_err(rejected)?,
            content: self.content,
            content_format: self.content_format.parse().map_err(rejected)?,
            created_by: self.created_by,
            created_by_name: self.created_by_name,
            created_by_email: self.created_by_email,
            last_edited_by: self.last_edited_by,
            last_edited_by_name: self.last_edited_by_name,
            last_edited_at: self.last_edited_at,
            is_edited: self.is_edited,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Payload of a `notes_changes` notification
#[derive(Deserialize)]
struct NotifyPayload {
    op: String,
    id: String,
    reference_type: String,
    reference_id: String,
}

impl NotifyPayload {
    fn into_change(self) -> Option<Change> {
        let kind = match self.op.as_str() {
            "INSERT" => ChangeKind::Insert,
            "UPDATE" => ChangeKind::Update,
            "DELETE" => ChangeKind::Delete,
            _ => return None,
        };

        let entity_type = self.reference_type.parse::<EntityType>().ok()?;

        let note_id = match issued_id(self.id) {
            Ok(note_id) => note_id,
            Err(err) => {
                tracing::warn!("Ignoring change notification: {err}");
                return None;
            }
        };

        Some(Change {
            kind,
            entity: EntityKey {
                entity_type,
                entity_id: self.reference_id,
            },
            note_id,
        })
    }
}

/// Postgres remote store
#[derive(Clone)]
pub struct Postgres {
    /// Pool of connections
    connection_pool: PgPool,

    /// Listener tasks of the open channels
    channels: Arc<Mutex<HashMap<ChannelHandle, JoinHandle<()>>>>,

    next_channel: Arc<AtomicU64>,
}

impl Postgres {
    /// Create Postgres remote store
    ///
    /// Use the given connection string, migrations will be run
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let connection_pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(3))
            .connect(database_url)
            .await?;

        MIGRATOR.run(&connection_pool).await?;

        Ok(Self {
            connection_pool,
            channels: Arc::new(Mutex::new(HashMap::new())),
            next_channel: Arc::new(AtomicU64::new(1)),
        })
    }
}

#[async_trait]
impl RemoteStore for Postgres {
    async fn insert(&self, note: &NewNote) -> Result<Note> {
        let row = sqlx::query_as::<_, NoteRow>(&format!(
            r"
            INSERT INTO notes (
                reference_id,
                reference_type,
                content,
                content_format,
                created_by,
                created_by_name,
                created_by_email,
                last_edited_by,
                last_edited_by_name,
                last_edited_at,
                is_edited,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING {NOTE_COLUMNS}
            "
        ))
        .bind(&note.reference_id)
        .bind(note.reference_type.as_str())
        .bind(&note.content)
        .bind(note.content_format.as_str())
        .bind(&note.created_by)
        .bind(&note.created_by_name)
        .bind(&note.created_by_email)
        .bind(&note.last_edited_by)
        .bind(&note.last_edited_by_name)
        .bind(note.last_edited_at)
        .bind(note.is_edited)
        .bind(note.created_at)
        .bind(note.updated_at)
        .fetch_one(&self.connection_pool)
        .await
        .map_err(database_error)?;

        row.into_note()
    }

    async fn update(&self, id: &NoteId, patch: &NotePatch) -> Result<Note> {
        let row = sqlx::query_as::<_, NoteRow>(&format!(
            r"
            UPDATE notes
            SET content = $1,
                content_format = $2,
                last_edited_by = $3,
                last_edited_by_name = $4,
                last_edited_at = $5,
                is_edited = TRUE,
                updated_at = $5
            WHERE id = $6
            RETURNING {NOTE_COLUMNS}
            "
        ))
        .bind(&patch.content)
        .bind(patch.content_format.as_str())
        .bind(&patch.editor.id)
        .bind(&patch.editor.name)
        .bind(patch.edited_at)
        .bind(id.as_str())
        .fetch_optional(&self.connection_pool)
        .await
        .map_err(database_error)?
        .ok_or(RemoteError::NotFound)?;

        row.into_note()
    }

    async fn delete(&self, id: &NoteId) -> Result<()> {
        let result = sqlx::query(
            r"
            DELETE FROM notes
            WHERE id = $1
            ",
        )
        .bind(id.as_str())
        .execute(&self.connection_pool)
        .await
        .map_err(database_error)?;

        if result.rows_affected() == 0 {
            return Err(RemoteError::NotFound);
        }

        Ok(())
    }

    async fn select(&self, entity: &EntityKey) -> Result<Vec<Note>> {
        let rows = sqlx::query_as::<_, NoteRow>(&format!(
            r"
            SELECT {NOTE_COLUMNS}
            FROM notes
            WHERE reference_type = $1 AND reference_id = $2
            ORDER BY created_at ASC, id ASC
            "
        ))
        .bind(entity.entity_type.as_str())
        .bind(&entity.entity_id)
        .fetch_all(&self.connection_pool)
        .await
        .map_err(database_error)?;

        rows.into_iter().map(NoteRow::into_note).collect()
    }

    async fn subscribe(&self, entity: &EntityKey) -> Result<Channel> {
        let mut listener = PgListener::connect_with(&self.connection_pool)
            .await
            .map_err(database_error)?;

        listener
            .listen(NOTIFY_CHANNEL)
            .await
            .map_err(database_error)?;

        let handle = ChannelHandle(self.next_channel.fetch_add(1, Ordering::SeqCst));
        let (sender, events) = mpsc::unbounded_channel();

        let entity = entity.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        let change = serde_json::from_str::<NotifyPayload>(notification.payload())
                            .ok()
                            .and_then(NotifyPayload::into_change);

                        let Some(change) = change else {
                            tracing::warn!(
                                "Ignoring malformed notification: {}",
                                notification.payload()
                            );
                            continue;
                        };

                        if change.entity == entity
                            && sender.send(ChannelEvent::Change(change)).is_err()
                        {
                            break;
                        }
                    }
                    Err(err) => {
                        let _ = sender.send(ChannelEvent::Error(err.to_string()));
                        break;
                    }
                }
            }
        });

        self.channels.lock().await.insert(handle, task);

        Ok(Channel { handle, events })
    }

    async fn unsubscribe(&self, handle: ChannelHandle) {
        if let Some(task) = self.channels.lock().await.remove(&handle) {
            task.abort();
        }
    }
}

/// Convert `SQLx` errors to remote store errors
fn database_error(err: sqlx::Error) -> RemoteError {
    match err {
        sqlx::Error::Database(err) => RemoteError::Rejected {
            message: err.message().to_string(),
            code: err.code().map(|code| code.to_string()),
        },
        sqlx::Error::RowNotFound => RemoteError::NotFound,
        err => RemoteError::Unavailable(err.to_string()),
    }
}

fn rejected<E>(err: E) -> RemoteError
where
    E: std::error::Error,
{
    RemoteError::Rejected {
        message: err.to_string(),
        code: None,
    }
}
