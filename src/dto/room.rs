//! DTO definitions used by the room REST API and documentation layer.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use crate::{
    dao::users::UserProfile,
    dto::validation::{validate_user_id, validate_word},
    state::room::{RemainingRoles, Role, RoomStatus, RoundPhase},
};

/// Payload used to open a new room.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct CreateRoomRequest {
    /// Word handed to civilians.
    #[validate(custom(function = "validate_word"))]
    pub civilian_word: String,
    /// Word handed to the undercover; must differ from the civilian word.
    #[validate(custom(function = "validate_word"))]
    pub undercover_word: String,
    /// Total game length in seconds.
    #[validate(range(min = 60, max = 14_400))]
    pub duration: u64,
}

/// Join request. Without `user_id` the acting user joins; naming someone else requires admin.
#[derive(Debug, Default, Deserialize, ToSchema, Validate)]
pub struct JoinRoomRequest {
    /// User to enrol instead of the caller.
    #[serde(default)]
    #[validate(custom(function = "validate_user_id"))]
    pub user_id: Option<String>,
}

/// Admin request to take a participant out of play.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct EliminateRequest {
    /// Participant to eliminate.
    #[validate(custom(function = "validate_user_id"))]
    pub user_id: String,
}

/// Ballot cast by the acting user.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct VoteRequest {
    /// Participant the caller votes against.
    #[validate(custom(function = "validate_user_id"))]
    pub target_id: String,
}

/// Identifier of a freshly created room.
#[derive(Debug, Serialize, ToSchema)]
pub struct RoomCreatedResponse {
    /// Opaque id of the new room.
    pub room_id: String,
}

/// Generic action acknowledgement used by room endpoints.
#[derive(Debug, Serialize, ToSchema)]
pub struct ActionResponse {
    /// Whether the action changed anything.
    pub success: bool,
    /// Human readable outcome.
    pub message: String,
}

impl ActionResponse {
    /// Acknowledgement with the given outcome.
    pub fn new(success: bool, message: impl Into<String>) -> Self {
        Self {
            success,
            message: message.into(),
        }
    }
}

/// Public projection of a room. Secret words never appear here.
#[derive(Debug, Serialize, ToSchema)]
pub struct RoomView {
    /// Room identifier.
    pub id: String,
    /// Lifecycle status.
    pub status: RoomStatus,
    /// User who created the room.
    pub creator: ParticipantView,
    /// Joined users, in join order.
    pub participants: Vec<ParticipantView>,
    /// Participants out of play.
    pub eliminated_ids: Vec<String>,
    /// Current round; zero before the first one.
    pub round: u32,
    /// Open part of the current round.
    pub phase: PhaseView,
    /// Maximum game length in seconds.
    pub duration_secs: u64,
    /// Creation time, RFC 3339.
    pub created_at: String,
    /// Start time, RFC 3339, once the game started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    /// Only present once roles have been handed out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<RemainingRoles>,
}

/// Public face of a participant.
#[derive(Debug, Serialize, ToSchema)]
pub struct ParticipantView {
    /// User identifier.
    pub user_id: String,
    /// Name shown to other players.
    pub display_name: String,
    /// Avatar URL, when the user has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    /// Whether the participant is out of play.
    pub eliminated: bool,
}

impl ParticipantView {
    /// Project `profile` with its elimination flag.
    pub fn new(profile: UserProfile, eliminated: bool) -> Self {
        Self {
            user_id: profile.user_id,
            display_name: profile.display_name,
            avatar: profile.avatar,
            eliminated,
        }
    }
}

/// Part of the current round that is open.
#[derive(Debug, Serialize, ToSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PhaseView {
    /// Between rounds, or before the first one.
    Idle,
    /// A speaker holds the floor.
    Speaking {
        /// User holding the floor.
        speaker_id: String,
        /// Unix milliseconds at which the slot closes.
        ends_at_ms: u64,
    },
    /// Ballots are being collected.
    Voting {
        /// Unix milliseconds at which voting closes.
        ends_at_ms: u64,
    },
}

impl From<&RoundPhase> for PhaseView {
    fn from(phase: &RoundPhase) -> Self {
        match phase {
            RoundPhase::Idle => PhaseView::Idle,
            RoundPhase::Speaking {
                speaker_id,
                ends_at_ms,
            } => PhaseView::Speaking {
                speaker_id: speaker_id.clone(),
                ends_at_ms: *ends_at_ms,
            },
            RoundPhase::Voting { ends_at_ms } => PhaseView::Voting {
                ends_at_ms: *ends_at_ms,
            },
        }
    }
}

/// What a single participant is allowed to know about themselves.
#[derive(Debug, Serialize, ToSchema)]
pub struct PlayerInfo {
    /// Room the player belongs to.
    pub room_id: String,
    /// Player identifier.
    pub user_id: String,
    /// Absent until the game starts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    /// Word matching the player's role.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_word: Option<String>,
    /// Whether the player is out of play.
    pub eliminated: bool,
}

/// Users with at least one live channel.
#[derive(Debug, Serialize, ToSchema)]
pub struct PresenceResponse {
    /// Profiles of the online users.
    pub online: Vec<UserProfile>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_request_rejects_blank_words_and_silly_durations() {
        let ok = CreateRoomRequest {
            civilian_word: "apple".into(),
            undercover_word: "pear".into(),
            duration: 300,
        };
        assert!(ok.validate().is_ok());

        let blank = CreateRoomRequest {
            civilian_word: "   ".into(),
            ..ok
        };
        assert!(blank.validate().is_err());

        let short = CreateRoomRequest {
            civilian_word: "apple".into(),
            undercover_word: "pear".into(),
            duration: 5,
        };
        assert!(short.validate().is_err());
    }

    #[test]
    fn phase_view_is_tagged_by_kind() {
        let view = PhaseView::from(&RoundPhase::Voting { ends_at_ms: 42 });
        let json = serde_json::to_value(view).unwrap();
        assert_eq!(json, serde_json::json!({ "kind": "voting", "ends_at_ms": 42 }));
    }
}
