use axum::Extension;
use serde::Serialize;

use crate::breaker::BreakerStatus;
use crate::subscriptions::SubscriptionManager;
use crate::sync::SyncCoordinator;
use crate::sync::SyncReport;

use super::Success;

/// Push all notes that only exist locally
pub async fn sync(
    Extension(coordinator): Extension<SyncCoordinator>,
) -> Success<SyncReport> {
    let report = coordinator.sync_pending().await;

    Success::ok(report)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    remote: BreakerStatus,
    subscriptions: usize,
}

pub async fn health(
    Extension(coordinator): Extension<SyncCoordinator>,
    Extension(subscriptions): Extension<SubscriptionManager>,
) -> Success<HealthResponse> {
    Success::ok(HealthResponse {
        remote: coordinator.breaker_status(),
        subscriptions: subscriptions.count(),
    })
}
