use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::body::Bytes;
use axum::http::Method;
use axum::http::Request;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use http_body_util::BodyExt;
use serde_json::Map;
use serde_json::Value;
use tokio::sync::mpsc;
use tower::Service;

use crate::create_router;
use crate::mirror;
use crate::mirror::KeyValueStore;
use crate::mirror::LocalMirror;
use crate::notes;
use crate::notes::Author;
use crate::notes::ContentFormat;
use crate::notes::CreateNoteValues;
use crate::notes::EntityKey;
use crate::notes::EntityType;
use crate::notes::UpdateNoteValues;
use crate::remote;
use crate::subscriptions::SubscriptionManager;
use crate::sync::NotesCallback;
use crate::sync::SyncCoordinator;
use crate::sync::SyncSettings;

/// Cooldown of the circuit breaker in tests
pub const COOLDOWN: Duration = Duration::from_millis(50);

/// Test helper version of Note struct
#[derive(Debug, PartialEq, Eq)]
pub struct Note {
    pub id: String,
    pub content: String,
    pub is_edited: bool,
    pub is_synced: bool,
}

/// Error response
#[derive(Debug, PartialEq, Eq)]
pub struct Error {
    pub error: String,
    pub description: Option<String>,
}

/// A device: coordinator, subscriptions and router on top of a shared remote store
pub struct TestApp {
    pub router: Router,
    pub coordinator: SyncCoordinator,
    pub subscriptions: SubscriptionManager,
    pub remote: remote::Memory,
    pub store: Arc<dyn KeyValueStore>,
}

/// Short timings so failures show up quickly
pub fn test_settings() -> SyncSettings {
    SyncSettings {
        cache_ttl: Duration::from_secs(30),
        read_timeout: Duration::from_millis(200),
        write_timeout: Duration::from_millis(100),
        breaker_cooldown: COOLDOWN,
        breaker_failure_threshold: 1,
    }
}

/// Setup the notesync app with its own remote store
pub fn setup_test_app() -> TestApp {
    setup_test_app_with(remote::Memory::new(), test_settings())
}

/// Setup the notesync app on an existing remote store, like a second device
pub fn setup_test_app_with(remote: remote::Memory, settings: SyncSettings) -> TestApp {
    let store: Arc<dyn KeyValueStore> = Arc::new(mirror::Memory::new());

    let coordinator = SyncCoordinator::new(
        Arc::new(remote.clone()),
        LocalMirror::new(store.clone()),
        settings,
    );
    let subscriptions = SubscriptionManager::new(coordinator.clone());

    TestApp {
        router: create_router(coordinator.clone(), subscriptions.clone()),
        coordinator,
        subscriptions,
        remote,
        store,
    }
}

pub fn call(entity_id: &str) -> EntityKey {
    EntityKey::new(EntityType::Call, entity_id).unwrap()
}

pub fn author() -> Author {
    Author {
        id: "user-1".to_string(),
        name: Some("Ada".to_string()),
        email: Some("ada@example.com".to_string()),
    }
}

pub fn create_values(key: &EntityKey, content: &str) -> CreateNoteValues {
    CreateNoteValues {
        entity: key.clone(),
        content: content.to_string(),
        content_format: ContentFormat::Plain,
        author: author(),
    }
}

pub fn update_values(content: &str) -> UpdateNoteValues {
    UpdateNoteValues {
        content: content.to_string(),
        content_format: ContentFormat::Markdown,
        editor: Author {
            id: "user-2".to_string(),
            name: Some("Grace".to_string()),
            email: None,
        },
    }
}

/// Callback sending every note list into a channel
pub fn collector() -> (NotesCallback, mpsc::UnboundedReceiver<Vec<notes::Note>>) {
    let (sender, receiver) = mpsc::unbounded_channel();

    let callback: NotesCallback = Arc::new(move |_key: &EntityKey, notes: Vec<notes::Note>| {
        let _ = sender.send(notes);
    });

    (callback, receiver)
}

/// Wait for a note list matching `done`, panics after a second
pub async fn wait_for<F>(
    receiver: &mut mpsc::UnboundedReceiver<Vec<notes::Note>>,
    done: F,
) -> Vec<notes::Note>
where
    F: Fn(&[notes::Note]) -> bool,
{
    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            let notes = receiver.recv().await.unwrap();
            if done(&notes) {
                return notes;
            }
        }
    })
    .await
    .expect("no matching note list received")
}

/// Wait until the circuit breaker lets a probe through
pub async fn wait_for_cooldown() {
    tokio::time::sleep(COOLDOWN + Duration::from_millis(20)).await;
}

pub async fn list_notes(
    app: &mut Router,
    entity_type: &str,
    entity_id: &str,
) -> (StatusCode, Option<Vec<Note>>, Option<Error>) {
    let request = Request::builder()
        .method(Method::GET)
        .uri(format!("/api/entities/{entity_type}/{entity_id}/notes"))
        .body(Body::empty())
        .unwrap();

    let response = app.call(request).await.unwrap();
    let status_code = response.status();

    let body = response.into_body().collect().await.unwrap().to_bytes();

    (
        status_code,
        if status_code == StatusCode::OK {
            Some(get_notes(&body))
        } else {
            None
        },
        if status_code == StatusCode::BAD_REQUEST {
            Some(get_error(&body))
        } else {
            None
        },
    )
}

pub async fn maybe_create_note(
    app: &mut Router,
    entity_type: &str,
    entity_id: &str,
    content: &str,
) -> (StatusCode, Option<Note>, Option<Error>) {
    let mut payload = Map::new();
    payload.insert("content".to_string(), Value::String(content.to_string()));
    payload.insert("createdBy".to_string(), Value::String("user-1".to_string()));
    payload.insert("createdByName".to_string(), Value::String("Ada".to_string()));

    let request = Request::builder()
        .method(Method::POST)
        .uri(format!("/api/entities/{entity_type}/{entity_id}/notes"))
        .header(CONTENT_TYPE, mime::APPLICATION_JSON.as_ref())
        .body(Body::from(serde_json::to_vec(&payload).unwrap()))
        .unwrap();

    let response = app.call(request).await.unwrap();
    let status_code = response.status();

    let body = response.into_body().collect().await.unwrap().to_bytes();

    (
        status_code,
        if status_code == StatusCode::CREATED {
            Some(get_note(&body))
        } else {
            None
        },
        if status_code == StatusCode::BAD_REQUEST {
            Some(get_error(&body))
        } else {
            None
        },
    )
}

pub async fn maybe_create_note_with_raw_body(
    app: &mut Router,
    body: &str,
    with_content_type: bool,
) -> (StatusCode, Option<Error>) {
    let mut request = Request::builder()
        .method(Method::POST)
        .uri("/api/entities/call/c1/notes");

    if with_content_type {
        request = request.header(CONTENT_TYPE, mime::APPLICATION_JSON.as_ref());
    }

    let request = request.body(Body::from(body.to_string())).unwrap();

    let response = app.call(request).await.unwrap();
    let status_code = response.status();

    let body = response.into_body().collect().await.unwrap().to_bytes();

    (
        status_code,
        if status_code == StatusCode::BAD_REQUEST {
            Some(get_error(&body))
        } else {
            None
        },
    )
}

pub async fn maybe_update_note(
    app: &mut Router,
    note_id: &str,
    content: &str,
) -> (StatusCode, Option<Note>, Option<Error>) {
    let mut payload = Map::new();
    payload.insert("content".to_string(), Value::String(content.to_string()));
    payload.insert("editedBy".to_string(), Value::String("user-2".to_string()));

    let request = Request::builder()
        .method(Method::PATCH)
        .uri(format!("/api/notes/{note_id}"))
        .header(CONTENT_TYPE, mime::APPLICATION_JSON.as_ref())
        .body(Body::from(serde_json::to_vec(&payload).unwrap()))
        .unwrap();

    let response = app.call(request).await.unwrap();
    let status_code = response.status();

    let body = response.into_body().collect().await.unwrap().to_bytes();

    (
        status_code,
        if status_code == StatusCode::OK {
            Some(get_note(&body))
        } else {
            None
        },
        if status_code == StatusCode::BAD_REQUEST || status_code == StatusCode::NOT_FOUND {
            Some(get_error(&body))
        } else {
            None
        },
    )
}

pub async fn maybe_delete_note(app: &mut Router, note_id: &str) -> (StatusCode, Option<Error>) {
    let request = Request::builder()
        .method(Method::DELETE)
        .uri(format!("/api/notes/{note_id}"))
        .body(Body::empty())
        .unwrap();

    let response = app.call(request).await.unwrap();
    let status_code = response.status();

    let body = response.into_body().collect().await.unwrap().to_bytes();

    (
        status_code,
        if status_code == StatusCode::BAD_REQUEST || status_code == StatusCode::NOT_FOUND {
            Some(get_error(&body))
        } else {
            None
        },
    )
}

pub async fn sync(app: &mut Router) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/sync")
        .body(Body::empty())
        .unwrap();

    let response = app.call(request).await.unwrap();
    let status_code = response.status();

    let body = response.into_body().collect().await.unwrap().to_bytes();

    (status_code, get_data(&body))
}

pub async fn health(app: &mut Router) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(Method::GET)
        .uri("/api/health")
        .body(Body::empty())
        .unwrap();

    let response = app.call(request).await.unwrap();
    let status_code = response.status();

    let body = response.into_body().collect().await.unwrap().to_bytes();

    (status_code, get_data(&body))
}

fn value_to_note(note: &Map<String, Value>) -> Note {
    Note {
        id: note["id"].as_str().map(ToString::to_string).unwrap(),
        content: note["content"].as_str().map(ToString::to_string).unwrap(),
        is_edited: note["isEdited"].as_bool().unwrap(),
        is_synced: note["isSynced"].as_bool().unwrap(),
    }
}

fn get_data(body: &Bytes) -> Value {
    serde_json::from_slice::<Value>(&body[..]).unwrap()["data"].clone()
}

fn get_note(body: &Bytes) -> Note {
    serde_json::from_slice::<Value>(&body[..]).unwrap()["data"]
        .as_object()
        .map(value_to_note)
        .unwrap()
}

fn get_notes(body: &Bytes) -> Vec<Note> {
    serde_json::from_slice::<Value>(&body[..]).unwrap()["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f.as_object().unwrap())
        .map(value_to_note)
        .collect()
}

fn value_to_error(error: &Map<String, Value>) -> Error {
    Error {
        error: error["error"].as_str().map(ToString::to_string).unwrap(),
        description: error
            .get("description")
            .and_then(Value::as_str)
            .map(ToString::to_string),
    }
}

fn get_error(body: &Bytes) -> Error {
    serde_json::from_slice::<Value>(&body[..])
        .unwrap()
        .as_object()
        .map(value_to_error)
        .unwrap()
}
