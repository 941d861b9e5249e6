use axum::{Json, Router, extract::State, routing::get};

use crate::{dto::room::PresenceResponse, services::room_service, state::SharedState};

#[utoipa::path(
    get,
    path = "/presence",
    tag = "presence",
    responses((status = 200, description = "Users with at least one live channel", body = PresenceResponse))
)]
/// List every online user once, however many channels they hold.
pub async fn list_online(State(state): State<SharedState>) -> Json<PresenceResponse> {
    Json(PresenceResponse {
        online: room_service::list_online(&state),
    })
}

/// Configure the presence route.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new().route("/presence", get(list_online))
}
