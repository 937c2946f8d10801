//! All API endpoint setup

use axum::Router;
use axum::routing::get;
use axum::routing::patch;
use axum::routing::post;

pub use request::Form;
pub use request::PathParameters;
pub use response::Error;
pub use response::Success;

mod notes;
mod request;
mod response;
mod sync;

/// Get the Axum router for all API routes
pub fn router() -> Router {
    let notes = Router::new()
        .route("/", get(notes::list).post(notes::create))
        .route("/events", get(notes::events));

    Router::new()
        .nest("/entities/{entity_type}/{entity_id}/notes", notes)
        .route("/notes/{note}", patch(notes::update).delete(notes::delete))
        .route("/sync", post(sync::sync))
        .route("/health", get(sync::health))
}
