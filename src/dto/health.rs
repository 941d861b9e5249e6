use serde::Serialize;
use utoipa::ToSchema;

/// Health response returned by the `/healthcheck` route.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Health status ("ok" or "degraded").
    pub status: String,
    /// Users with at least one live channel.
    pub online_users: usize,
    /// Live WebSocket channels across all users.
    pub open_channels: usize,
}

impl HealthResponse {
    /// Build the response from the store ping and connection counts.
    pub fn new(store_healthy: bool, online_users: usize, open_channels: usize) -> Self {
        Self {
            status: if store_healthy { "ok" } else { "degraded" }.to_string(),
            online_users,
            open_channels,
        }
    }
}
