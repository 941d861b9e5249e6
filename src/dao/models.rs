use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::state::{
    room::{Room, RoomStatus, RoundPhase},
    state_machine::VoteCount,
};

/// Version written into every stored room blob; anything else is rejected on load.
pub const ROOM_SCHEMA_VERSION: u32 = 1;
/// Version written into every stored vote counter.
pub const VOTE_SCHEMA_VERSION: u32 = 1;

/// Persisted representation of a [`Room`] under `room:{id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomEntity {
    /// Layout version, checked against `ROOM_SCHEMA_VERSION` on load.
    pub schema_version: u32,
    /// Room identifier.
    pub id: String,
    /// Lifecycle status.
    pub status: RoomStatus,
    /// User who created the room.
    pub creator_id: String,
    /// Joined users, in join order.
    pub participant_ids: Vec<String>,
    /// Participants holding the undercover word.
    pub undercover_ids: Vec<String>,
    /// Participants holding the civilian word.
    pub civilian_ids: Vec<String>,
    /// Participants voted or kicked out of play.
    pub eliminated_ids: Vec<String>,
    /// Word handed to civilians.
    pub civilian_word: String,
    /// Word handed to the undercover.
    pub undercover_word: String,
    /// Maximum game length in seconds.
    pub duration_secs: u64,
    /// Creation instant.
    pub created_at: SystemTime,
    /// Instant the game started, once it has.
    pub start_time: Option<SystemTime>,
    /// Current round number; zero before the first round.
    pub round: u32,
    /// Phase of the current round.
    pub phase: PhaseEntity,
    /// Voters who already cast a ballot this round.
    pub voted_ids: Vec<String>,
}

/// Persisted round phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PhaseEntity {
    /// No timed phase is running.
    Idle,
    /// A speaker holds the floor until `ends_at_ms`.
    Speaking {
        /// User holding the floor.
        speaker_id: String,
        /// Unix milliseconds at which the slot closes.
        ends_at_ms: u64,
    },
    /// Ballots are accepted until `ends_at_ms`.
    Voting {
        /// Unix milliseconds at which voting closes.
        ends_at_ms: u64,
    },
}

/// Persisted per-target counter under `room:{id}:votes:{user_id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoteCounterEntity {
    /// Layout version, checked against `VOTE_SCHEMA_VERSION` on load.
    pub schema_version: u32,
    /// Ballots received this round.
    pub votes: u32,
    /// Ballot ordinal at which the current count was reached.
    pub reached_at: u64,
}

impl From<&Room> for RoomEntity {
    fn from(value: &Room) -> Self {
        Self {
            schema_version: ROOM_SCHEMA_VERSION,
            id: value.id.clone(),
            status: value.status,
            creator_id: value.creator_id.clone(),
            participant_ids: value.participant_ids.iter().cloned().collect(),
            undercover_ids: value.undercover_ids.iter().cloned().collect(),
            civilian_ids: value.civilian_ids.iter().cloned().collect(),
            eliminated_ids: value.eliminated_ids.iter().cloned().collect(),
            civilian_word: value.civilian_word.clone(),
            undercover_word: value.undercover_word.clone(),
            duration_secs: value.duration.as_secs(),
            created_at: value.created_at,
            start_time: value.start_time,
            round: value.round,
            phase: (&value.phase).into(),
            voted_ids: value.voted_ids.iter().cloned().collect(),
        }
    }
}

impl TryFrom<RoomEntity> for Room {
    type Error = String;

    fn try_from(value: RoomEntity) -> Result<Self, Self::Error> {
        if value.schema_version != ROOM_SCHEMA_VERSION {
            return Err(format!(
                "unsupported room schema version {} (expected {ROOM_SCHEMA_VERSION})",
                value.schema_version
            ));
        }

        let room = Room {
            id: value.id,
            status: value.status,
            creator_id: value.creator_id,
            participant_ids: value.participant_ids.into_iter().collect(),
            undercover_ids: value.undercover_ids.into_iter().collect(),
            civilian_ids: value.civilian_ids.into_iter().collect(),
            eliminated_ids: value.eliminated_ids.into_iter().collect(),
            civilian_word: value.civilian_word,
            undercover_word: value.undercover_word,
            duration: Duration::from_secs(value.duration_secs),
            created_at: value.created_at,
            start_time: value.start_time,
            round: value.round,
            phase: value.phase.into(),
            voted_ids: value.voted_ids.into_iter().collect(),
        };

        if !room.undercover_ids.is_disjoint(&room.civilian_ids) {
            return Err("undercover and civilian sets overlap".into());
        }
        let outsider = room
            .undercover_ids
            .iter()
            .chain(&room.civilian_ids)
            .chain(&room.eliminated_ids)
            .find(|id| !room.participant_ids.contains(*id));
        if let Some(outsider) = outsider {
            return Err(format!("`{outsider}` is not a participant"));
        }
        if room.status != RoomStatus::Waiting
            && room.undercover_ids.len() + room.civilian_ids.len() != room.participant_ids.len()
        {
            return Err("roles do not cover every participant".into());
        }

        Ok(room)
    }
}

impl From<&RoundPhase> for PhaseEntity {
    fn from(value: &RoundPhase) -> Self {
        match value {
            RoundPhase::Idle => PhaseEntity::Idle,
            RoundPhase::Speaking {
                speaker_id,
                ends_at_ms,
            } => PhaseEntity::Speaking {
                speaker_id: speaker_id.clone(),
                ends_at_ms: *ends_at_ms,
            },
            RoundPhase::Voting { ends_at_ms } => PhaseEntity::Voting {
                ends_at_ms: *ends_at_ms,
            },
        }
    }
}

impl From<PhaseEntity> for RoundPhase {
    fn from(value: PhaseEntity) -> Self {
        match value {
            PhaseEntity::Idle => RoundPhase::Idle,
            PhaseEntity::Speaking {
                speaker_id,
                ends_at_ms,
            } => RoundPhase::Speaking {
                speaker_id,
                ends_at_ms,
            },
            PhaseEntity::Voting { ends_at_ms } => RoundPhase::Voting { ends_at_ms },
        }
    }
}

impl From<VoteCount> for VoteCounterEntity {
    fn from(value: VoteCount) -> Self {
        Self {
            schema_version: VOTE_SCHEMA_VERSION,
            votes: value.votes,
            reached_at: value.reached_at,
        }
    }
}

impl TryFrom<VoteCounterEntity> for VoteCount {
    type Error = String;

    fn try_from(value: VoteCounterEntity) -> Result<Self, Self::Error> {
        if value.schema_version != VOTE_SCHEMA_VERSION {
            return Err(format!(
                "unsupported vote schema version {} (expected {VOTE_SCHEMA_VERSION})",
                value.schema_version
            ));
        }
        Ok(VoteCount {
            votes: value.votes,
            reached_at: value.reached_at,
        })
    }
}
