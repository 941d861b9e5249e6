use axum::{
    Extension, Json, Router,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, Request},
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post},
};
use validator::Validate;

use crate::{
    dto::{
        room::{
            ActionResponse, CreateRoomRequest, EliminateRequest, JoinRoomRequest, PlayerInfo,
            RoomCreatedResponse, RoomView, VoteRequest,
        },
        validation::validate_user_id,
    },
    error::AppError,
    services::room_service::{self, Actor},
    state::SharedState,
};

const USER_ID_HEADER: &str = "x-user-id";
const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Room management and gameplay endpoints. Every request carries an [`Actor`].
pub fn router(state: SharedState) -> Router<SharedState> {
    Router::new()
        .route("/rooms", post(create_room))
        .route("/rooms/active", get(get_active_room))
        .route("/rooms/{id}", delete(delete_room))
        .route("/rooms/{id}/join", post(join_room))
        .route("/rooms/{id}/start", post(start_game))
        .route("/rooms/{id}/end", post(end_game))
        .route("/rooms/{id}/eliminate", post(eliminate_player))
        .route("/rooms/{id}/vote", post(cast_vote))
        .route("/rooms/{id}/players/{user_id}", get(get_player_info))
        .route_layer(middleware::from_fn_with_state(state, resolve_actor))
}

/// Open a new room; requires admin rights.
#[utoipa::path(
    post,
    path = "/rooms",
    tag = "rooms",
    params(("X-Admin-Token" = String, Header, description = "Admin token")),
    request_body = CreateRoomRequest,
    responses(
        (status = 200, description = "Room created", body = RoomCreatedResponse),
        (status = 409, description = "Another room is still active")
    )
)]
pub async fn create_room(
    State(state): State<SharedState>,
    Extension(actor): Extension<Actor>,
    Json(payload): Json<CreateRoomRequest>,
) -> Result<Json<RoomCreatedResponse>, AppError> {
    payload.validate()?;
    Ok(Json(
        room_service::create_room(&state, &actor, payload).await?,
    ))
}

/// Public view of the currently active room, or `null` when there is none.
#[utoipa::path(
    get,
    path = "/rooms/active",
    tag = "rooms",
    responses((status = 200, description = "Active room", body = Option<RoomView>))
)]
pub async fn get_active_room(
    State(state): State<SharedState>,
) -> Result<Json<Option<RoomView>>, AppError> {
    Ok(Json(room_service::get_active_room(&state).await?))
}

/// Join a waiting room, or add another user when acting as admin.
#[utoipa::path(
    post,
    path = "/rooms/{id}/join",
    tag = "rooms",
    params(
        ("id" = String, Path, description = "Room identifier"),
        ("X-User-Id" = String, Header, description = "Acting user")
    ),
    request_body = JoinRoomRequest,
    responses(
        (status = 200, description = "Join processed", body = ActionResponse),
        (status = 409, description = "Room already started or ended")
    )
)]
pub async fn join_room(
    State(state): State<SharedState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
    Json(payload): Json<JoinRoomRequest>,
) -> Result<Json<ActionResponse>, AppError> {
    payload.validate()?;
    let joined = room_service::join_room(&state, &actor, &id, payload).await?;
    let message = if joined { "joined" } else { "already joined" };
    Ok(Json(ActionResponse::new(joined, message)))
}

/// Assign roles and start the timed phases; creator or admin only.
#[utoipa::path(
    post,
    path = "/rooms/{id}/start",
    tag = "rooms",
    params(("id" = String, Path, description = "Room identifier")),
    responses(
        (status = 200, description = "Game started", body = ActionResponse),
        (status = 409, description = "Not enough players or already started")
    )
)]
pub async fn start_game(
    State(state): State<SharedState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
) -> Result<Json<ActionResponse>, AppError> {
    let started = room_service::start_game(&state, &actor, &id).await?;
    Ok(Json(ActionResponse::new(started, "started")))
}

/// End a room immediately; creator or admin only.
#[utoipa::path(
    post,
    path = "/rooms/{id}/end",
    tag = "rooms",
    params(("id" = String, Path, description = "Room identifier")),
    responses((status = 200, description = "Game ended", body = ActionResponse))
)]
pub async fn end_game(
    State(state): State<SharedState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
) -> Result<Json<ActionResponse>, AppError> {
    let ended = room_service::end_game(&state, &actor, &id).await?;
    Ok(Json(ActionResponse::new(ended, "ended")))
}

/// Force a participant out of the game; creator or admin only.
#[utoipa::path(
    post,
    path = "/rooms/{id}/eliminate",
    tag = "rooms",
    params(("id" = String, Path, description = "Room identifier")),
    request_body = EliminateRequest,
    responses((status = 200, description = "Player eliminated", body = ActionResponse))
)]
pub async fn eliminate_player(
    State(state): State<SharedState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
    Json(payload): Json<EliminateRequest>,
) -> Result<Json<ActionResponse>, AppError> {
    payload.validate()?;
    let eliminated =
        room_service::eliminate_player(&state, &actor, &id, &payload.user_id).await?;
    Ok(Json(ActionResponse::new(eliminated, "eliminated")))
}

/// Cast the acting user's ballot for the open voting window.
#[utoipa::path(
    post,
    path = "/rooms/{id}/vote",
    tag = "rooms",
    params(
        ("id" = String, Path, description = "Room identifier"),
        ("X-User-Id" = String, Header, description = "Voting user")
    ),
    request_body = VoteRequest,
    responses(
        (status = 200, description = "Vote recorded", body = ActionResponse),
        (status = 409, description = "Voting closed or already voted")
    )
)]
pub async fn cast_vote(
    State(state): State<SharedState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
    Json(payload): Json<VoteRequest>,
) -> Result<Json<ActionResponse>, AppError> {
    payload.validate()?;
    let voter = actor.require_user()?;
    room_service::cast_vote(&state, voter, &id, &payload.target_id).await?;
    Ok(Json(ActionResponse::new(true, "vote recorded")))
}

/// Delete a room and everything tied to it; creator or admin only.
#[utoipa::path(
    delete,
    path = "/rooms/{id}",
    tag = "rooms",
    params(("id" = String, Path, description = "Room identifier")),
    responses(
        (status = 200, description = "Room deleted", body = ActionResponse),
        (status = 404, description = "Room not found")
    )
)]
pub async fn delete_room(
    State(state): State<SharedState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
) -> Result<Json<ActionResponse>, AppError> {
    let deleted = room_service::delete_room(&state, &actor, &id).await?;
    Ok(Json(ActionResponse::new(deleted, "deleted")))
}

/// Role, word and elimination status of a participant.
#[utoipa::path(
    get,
    path = "/rooms/{id}/players/{user_id}",
    tag = "rooms",
    params(
        ("id" = String, Path, description = "Room identifier"),
        ("user_id" = String, Path, description = "Participant")
    ),
    responses(
        (status = 200, description = "Player information", body = PlayerInfo),
        (status = 404, description = "Room or participant not found")
    )
)]
pub async fn get_player_info(
    State(state): State<SharedState>,
    Extension(actor): Extension<Actor>,
    Path((id, user_id)): Path<(String, String)>,
) -> Result<Json<PlayerInfo>, AppError> {
    Ok(Json(
        room_service::get_player_info(&state, &actor, &id, &user_id).await?,
    ))
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

/// Build the [`Actor`] of a request from its identity headers.
///
/// A matching admin token, or a directory profile with the admin role, grants admin rights.
async fn resolve_actor(
    State(state): State<SharedState>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let user_id = header_value(req.headers(), USER_ID_HEADER);
    if let Some(user_id) = &user_id {
        validate_user_id(user_id)
            .map_err(|_| AppError::BadRequest("invalid `X-User-Id` header".into()))?;
    }

    let token_admin = match header_value(req.headers(), ADMIN_TOKEN_HEADER) {
        None => false,
        Some(provided) => {
            let config = state.config();
            match config.admin_token() {
                Some(expected) if expected == provided => true,
                Some(_) => return Err(AppError::Unauthorized("invalid admin token".into())),
                None => {
                    return Err(AppError::Unauthorized(
                        "admin token is not configured".into(),
                    ));
                }
            }
        }
    };
    let directory_admin = match &user_id {
        Some(user_id) => state.profile(user_id).await.is_admin(),
        None => false,
    };

    req.extensions_mut().insert(Actor {
        user_id,
        is_admin: token_admin || directory_admin,
    });
    Ok(next.run(req).await)
}
