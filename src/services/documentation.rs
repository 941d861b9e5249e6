use utoipa::OpenApi;

#[derive(OpenApi)]
/// Aggregated OpenAPI specification for Undercover Back.
#[openapi(
    paths(
        crate::routes::health::healthcheck,
        crate::routes::websocket::ws_handler,
        crate::routes::presence::list_online,
        crate::routes::rooms::create_room,
        crate::routes::rooms::get_active_room,
        crate::routes::rooms::join_room,
        crate::routes::rooms::start_game,
        crate::routes::rooms::end_game,
        crate::routes::rooms::eliminate_player,
        crate::routes::rooms::cast_vote,
        crate::routes::rooms::delete_room,
        crate::routes::rooms::get_player_info,
    ),
    components(
        schemas(
            crate::dto::health::HealthResponse,
            crate::dto::ws::PlayerInboundMessage,
            crate::dto::ws::SpeakingTurnNotice,
            crate::dto::ws::SpeakingAnnouncement,
            crate::dto::ws::CountdownHint,
            crate::dto::ws::VotingOpenAnnouncement,
            crate::dto::ws::RoundResultAnnouncement,
            crate::dto::ws::ErrorNotice,
            crate::dto::room::CreateRoomRequest,
            crate::dto::room::JoinRoomRequest,
            crate::dto::room::EliminateRequest,
            crate::dto::room::VoteRequest,
            crate::dto::room::RoomCreatedResponse,
            crate::dto::room::ActionResponse,
            crate::dto::room::RoomView,
            crate::dto::room::PlayerInfo,
            crate::dto::room::PresenceResponse,
            crate::dao::users::UserProfile,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "rooms", description = "Undercover room management and play"),
        (name = "presence", description = "Online users"),
        (name = "players", description = "WebSocket channel for players"),
    )
)]
/// OpenAPI document of the whole service.
pub struct ApiDoc;
