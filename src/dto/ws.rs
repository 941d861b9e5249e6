use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{
    dao::users::UserProfile,
    state::{room::RemainingRoles, state_machine::RoundOutcome},
};

/// Messages accepted from player WebSocket clients.
#[derive(Debug, Deserialize, Serialize, ToSchema)]
#[serde(tag = "type")]
pub enum PlayerInboundMessage {
    /// Binds the socket to a user; must be the first frame.
    #[serde(rename = "identification")]
    Identification {
        /// User the socket speaks for.
        user_id: String,
    },
    /// Ballot against `target_id` in the current round of `room_id`.
    #[serde(rename = "vote")]
    Vote {
        /// Room the ballot is meant for.
        room_id: String,
        /// Participant voted against.
        target_id: String,
    },
    /// Anything else; ignored.
    #[serde(other)]
    Unknown,
}

impl PlayerInboundMessage {
    /// Decode one text frame.
    pub fn from_json_str(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

/// Every message pushed to player channels, tagged by `type` with the body under `payload`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Sent only to the player whose turn it is.
    SpeakingTurn(SpeakingTurnNotice),
    /// Sent to everyone when a player starts speaking.
    SpeakingAnnouncement(SpeakingAnnouncement),
    /// Timer hint for a single player.
    Countdown(CountdownHint),
    /// Voting started; lists the candidates.
    VotingOpen(VotingOpenAnnouncement),
    /// Outcome of a resolved round.
    RoundResult(RoundResultAnnouncement),
    /// Tells clients to re-fetch room state; carries no payload.
    RoomRefresh,
    /// A user opened their first channel.
    Online(UserProfile),
    /// A user closed their last channel.
    Offline(UserProfile),
    /// Acknowledges the identification frame.
    Identified(IdentifiedAck),
    /// A request sent over the socket was rejected.
    Error(ErrorNotice),
}

impl OutboundMessage {
    /// Tag used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::SpeakingTurn(_) => "speaking_turn",
            OutboundMessage::SpeakingAnnouncement(_) => "speaking_announcement",
            OutboundMessage::Countdown(_) => "countdown",
            OutboundMessage::VotingOpen(_) => "voting_open",
            OutboundMessage::RoundResult(_) => "round_result",
            OutboundMessage::RoomRefresh => "room_refresh",
            OutboundMessage::Online(_) => "online",
            OutboundMessage::Offline(_) => "offline",
            OutboundMessage::Identified(_) => "identified",
            OutboundMessage::Error(_) => "error",
        }
    }
}

/// Private notice that the recipient holds the floor.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SpeakingTurnNotice {
    /// Room being played.
    pub room_id: String,
    /// Current round.
    pub round: u32,
    /// Speaking time left.
    pub seconds: u64,
}

/// Public notice of who speaks now.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SpeakingAnnouncement {
    /// Room being played.
    pub room_id: String,
    /// Current round.
    pub round: u32,
    /// User holding the floor.
    pub speaker_id: String,
    /// Display name of the speaker.
    pub speaker_name: String,
    /// 1-based position of the speaker in this round.
    pub position: usize,
    /// Speakers scheduled this round.
    pub speakers: usize,
}

/// Remaining time of the open phase.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CountdownHint {
    /// Room being played.
    pub room_id: String,
    /// `speaking` or `voting`.
    pub phase: String,
    /// Whole seconds left.
    pub remaining_seconds: u64,
}

/// Public notice that ballots are accepted.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct VotingOpenAnnouncement {
    /// Room being played.
    pub room_id: String,
    /// Current round.
    pub round: u32,
    /// Voting time left.
    pub seconds: u64,
    /// Players that can receive ballots.
    pub candidates: Vec<CandidateSummary>,
}

/// Player that can be voted against.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CandidateSummary {
    /// User identifier.
    pub user_id: String,
    /// Name shown on the ballot.
    pub display_name: String,
}

/// Public outcome of a resolved round.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RoundResultAnnouncement {
    /// Room being played.
    pub room_id: String,
    /// Round that was resolved.
    pub round: u32,
    /// Whether the game goes on or who won.
    pub outcome: RoundOutcome,
    /// Player voted out, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eliminated_id: Option<String>,
    /// Display name of the eliminated player.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eliminated_name: Option<String>,
    /// Active players per role after the round.
    pub remaining: RemainingRoles,
    /// Secret words, revealed only once the game is over.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub words: Option<RevealedWords>,
}

/// Both secret words.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RevealedWords {
    /// Word the civilians held.
    pub civilian_word: String,
    /// Word the undercover held.
    pub undercover_word: String,
}

/// Identity bound to the socket.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct IdentifiedAck {
    /// User identifier.
    pub user_id: String,
    /// Name from the directory.
    pub display_name: String,
}

/// Reason a socket request was refused.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ErrorNotice {
    /// Human readable reason.
    pub message: String,
}
