use axum::http::StatusCode;

use crate::tests::helper;

#[tokio::test]
async fn test_notes() {
    let helper::TestApp {
        router: mut app,
        coordinator,
        remote,
        ..
    } = helper::setup_test_app();

    let content_one = "Customer wants a callback";
    let content_two = "Customer called back";

    // verify empty note list
    let (status_code, notes, _) = helper::list_notes(&mut app, "call", "c1").await;
    assert_eq!(StatusCode::OK, status_code);
    assert_eq!(Some(Vec::<helper::Note>::new()), notes);

    // create note, answered before the remote store confirms it
    let (status_code, note, _) = helper::maybe_create_note(&mut app, "call", "c1", content_one).await;
    assert_eq!(StatusCode::CREATED, status_code);
    let note = note.unwrap();
    assert_eq!(content_one.to_string(), note.content);
    assert!(note.id.starts_with("local_"));
    assert!(!note.is_synced);

    coordinator.settle().await;
    assert_eq!(1, remote.len().await);

    // the placeholder is replaced by the confirmed note
    let (status_code, notes, _) = helper::list_notes(&mut app, "call", "c1").await;
    assert_eq!(StatusCode::OK, status_code);
    let notes = notes.unwrap();
    assert_eq!(1, notes.len());
    let note = &notes[0];
    assert!(!note.id.starts_with("local_"));
    assert!(note.is_synced);
    assert_eq!(content_one.to_string(), note.content);

    // update note
    let (status_code, note, _) = helper::maybe_update_note(&mut app, &note.id, content_two).await;
    assert_eq!(StatusCode::OK, status_code);
    let note = note.unwrap();
    assert_eq!(content_two.to_string(), note.content);
    assert!(note.is_edited);

    // other entities are not affected
    let (status_code, notes, _) = helper::list_notes(&mut app, "sms", "c1").await;
    assert_eq!(StatusCode::OK, status_code);
    assert_eq!(Some(Vec::<helper::Note>::new()), notes);

    // delete note
    let (status_code, _) = helper::maybe_delete_note(&mut app, &note.id).await;
    assert_eq!(StatusCode::NO_CONTENT, status_code);

    coordinator.settle().await;
    assert_eq!(0, remote.len().await);

    let (status_code, notes, _) = helper::list_notes(&mut app, "call", "c1").await;
    assert_eq!(StatusCode::OK, status_code);
    assert_eq!(Some(Vec::<helper::Note>::new()), notes);

    // delete it again
    let (status_code, error) = helper::maybe_delete_note(&mut app, &note.id).await;
    assert_eq!(StatusCode::NOT_FOUND, status_code);
    assert_eq!("Note not found".to_string(), error.unwrap().error);
}

#[tokio::test]
async fn test_notes_validation() {
    let mut app = helper::setup_test_app().router;

    let (status_code, _, error) = helper::list_notes(&mut app, "fax", "c1").await;
    assert_eq!(StatusCode::BAD_REQUEST, status_code);
    assert_eq!("Invalid path parameter".to_string(), error.unwrap().error);

    let (status_code, _, error) = helper::maybe_create_note(&mut app, "call", "c1", "  ").await;
    assert_eq!(StatusCode::BAD_REQUEST, status_code);
    let error = error.unwrap();
    assert_eq!("Invalid note".to_string(), error.error);
    assert_eq!(
        Some("Content can not be empty".to_string()),
        error.description
    );

    let (status_code, _, error) = helper::maybe_create_note(&mut app, "call", "a:b", "Hi").await;
    assert_eq!(StatusCode::BAD_REQUEST, status_code);
    assert_eq!("Invalid note".to_string(), error.unwrap().error);

    let (status_code, _, error) = helper::maybe_update_note(&mut app, "nope", "Hi").await;
    assert_eq!(StatusCode::NOT_FOUND, status_code);
    assert_eq!("Note not found".to_string(), error.unwrap().error);
}

#[tokio::test]
async fn test_sync_and_health() {
    let helper::TestApp {
        router: mut app,
        coordinator,
        remote,
        ..
    } = helper::setup_test_app();

    remote.set_reachable(false);

    let (status_code, note, _) = helper::maybe_create_note(&mut app, "sms", "s1", "Offline").await;
    assert_eq!(StatusCode::CREATED, status_code);
    assert!(!note.unwrap().is_synced);

    coordinator.settle().await;

    let (status_code, health) = helper::health(&mut app).await;
    assert_eq!(StatusCode::OK, status_code);
    assert_ne!("closed", health["remote"]);
    assert_eq!(0, health["subscriptions"]);

    remote.set_reachable(true);
    helper::wait_for_cooldown().await;

    let (status_code, report) = helper::sync(&mut app).await;
    assert_eq!(StatusCode::OK, status_code);
    assert_eq!(1, report["pushed"]);
    assert_eq!(0, report["failed"]);

    let (_, health) = helper::health(&mut app).await;
    assert_eq!("closed", health["remote"]);

    let (_, notes, _) = helper::list_notes(&mut app, "sms", "s1").await;
    let notes = notes.unwrap();
    assert_eq!(1, notes.len());
    assert!(notes[0].is_synced);
}
