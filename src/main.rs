#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]
// easier to use when using the functions as callback of foreign functions
#![allow(clippy::needless_pass_by_value)]

use std::sync::Arc;

use anyhow::Result;
use axum::Extension;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::prelude::*;

use crate::api::router;
use crate::config::Config;
use crate::config::MirrorConfig;
use crate::config::RemoteConfig;
use crate::mirror::KeyValueStore;
use crate::mirror::LocalMirror;
use crate::remote::RemoteStore;
use crate::subscriptions::SubscriptionManager;
use crate::sync::SyncCoordinator;

mod api;
mod breaker;
mod cache;
mod config;
mod error;
mod graceful_shutdown;
mod merge;
mod mirror;
mod notes;
mod remote;
mod subscriptions;
mod sync;
#[cfg(test)]
mod tests;
mod utils;

const DEFAULT_RUST_LOG: &str = "notesync=debug,tower_http=debug";

#[tokio::main]
async fn main() -> Result<()> {
    setup_environment();
    setup_tracing();

    let config = Config::from_env()?;

    let (coordinator, subscriptions) = setup_services(&config).await?;

    // notes left behind by a previous run
    tokio::spawn({
        let coordinator = coordinator.clone();
        async move {
            coordinator.sync_pending().await;
        }
    });

    let app = create_router(coordinator.clone(), subscriptions.clone());

    let listener = TcpListener::bind(config.address).await?;
    tracing::info!("Listening on {}", config.address);

    let shutdown = CancellationToken::new();

    // open event streams end with their subscription
    tokio::spawn({
        let shutdown = shutdown.clone();
        let subscriptions = subscriptions.clone();
        async move {
            shutdown.cancelled().await;
            subscriptions.unsubscribe_all().await;
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(graceful_shutdown::handler(shutdown))
        .await?;

    subscriptions.unsubscribe_all().await;
    coordinator.settle().await;

    tracing::info!("Background sync finished, bye");

    Ok(())
}

/// Create the sync coordinator and subscription manager
///
/// # Errors
///
/// Will return `Err` if any of its dependencies fail to load:
/// - Local mirror directory
/// - Database connection
pub async fn setup_services(config: &Config) -> Result<(SyncCoordinator, SubscriptionManager)> {
    let store: Arc<dyn KeyValueStore> = match &config.mirror {
        MirrorConfig::Memory => {
            tracing::info!("Using an in-memory local mirror, notes are lost on shutdown");
            Arc::new(mirror::Memory::new())
        }
        MirrorConfig::Directory(directory) => {
            tracing::info!("Using local mirror in {}", directory.display());
            Arc::new(mirror::File::open(directory)?)
        }
    };

    let remote: Arc<dyn RemoteStore> = match &config.remote {
        RemoteConfig::Memory => Arc::new(remote::Memory::new()),
        #[cfg(feature = "postgres")]
        RemoteConfig::Postgres(database_url) => {
            Arc::new(remote::Postgres::connect(database_url).await?)
        }
    };

    let coordinator = SyncCoordinator::new(remote, LocalMirror::new(store), config.sync.clone());
    let subscriptions = SubscriptionManager::new(coordinator.clone());

    Ok((coordinator, subscriptions))
}

/// Create the router for notesync
fn create_router(coordinator: SyncCoordinator, subscriptions: SubscriptionManager) -> Router {
    Router::new()
        .nest("/api", router())
        .layer(TraceLayer::new_for_http())
        .layer(Extension(coordinator))
        .layer(Extension(subscriptions))
}

fn setup_environment() {
    dotenvy::dotenv().ok();
}

fn setup_tracing() {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::registry;

    registry()
        .with(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_RUST_LOG.into()),
        ))
        .with(fmt::layer())
        .init();
}
