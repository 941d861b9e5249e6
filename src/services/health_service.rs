use tracing::warn;

use crate::{dto::health::HealthResponse, state::SharedState};

/// Ping the key/value store and report live connection counts.
pub async fn health_status(state: &SharedState) -> HealthResponse {
    let store_healthy = match state.store().health_check().await {
        Ok(()) => true,
        Err(err) => {
            warn!(error = %err, "storage health check failed");
            false
        }
    };

    let connections = state.connections();
    HealthResponse::new(
        store_healthy,
        connections.list_online().len(),
        connections.channel_count(),
    )
}
