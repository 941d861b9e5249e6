use std::time::{Duration, SystemTime};

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Minimum number of participants required to start a game.
pub const MIN_PLAYERS: usize = 3;

/// Lifecycle of a room. Transitions only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomStatus {
    /// Accepting participants.
    Waiting,
    /// Roles assigned, rounds in progress.
    Playing,
    /// Terminal; the room only lingers until its TTL runs out.
    Ended,
}

/// Secret role handed to a participant at game start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Holds the odd word out.
    Undercover,
    /// Holds the shared word.
    Civilian,
}

impl Role {
    /// Stored and wire spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Undercover => "undercover",
            Role::Civilian => "civilian",
        }
    }

    /// Inverse of [`Role::as_str`].
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "undercover" => Some(Role::Undercover),
            "civilian" => Some(Role::Civilian),
            _ => None,
        }
    }
}

/// Which part of the current round is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundPhase {
    /// Between rounds, or before the first one.
    Idle,
    /// `speaker_id` holds the floor until `ends_at_ms` (unix milliseconds).
    Speaking {
        /// User holding the floor.
        speaker_id: String,
        /// Unix milliseconds at which the slot closes.
        ends_at_ms: u64,
    },
    /// Ballots are accepted until `ends_at_ms` (unix milliseconds).
    Voting {
        /// Unix milliseconds at which voting closes.
        ends_at_ms: u64,
    },
}

/// Remaining, non-eliminated players per side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct RemainingRoles {
    /// Undercover players still in.
    pub undercover: usize,
    /// Civilians still in.
    pub civilians: usize,
}

/// Domain-rule violations raised before any mutation is applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleViolation {
    /// Joining or starting a room that is already playing.
    #[error("room already started")]
    AlreadyStarted,
    /// Any mutation of an ended room.
    #[error("room has ended")]
    RoomEnded,
    /// A game operation on a room that has not started.
    #[error("game is not in progress")]
    NotPlaying,
    /// Starting with fewer than the minimum participants.
    #[error("at least {MIN_PLAYERS} participants are required, room has {0}")]
    NotEnoughPlayers(usize),
    /// The user never joined this room.
    #[error("user `{0}` is not a participant of this room")]
    NotParticipant(String),
    /// The user is already out of play.
    #[error("user `{0}` is already eliminated")]
    AlreadyEliminated(String),
    /// A ballot outside the voting window.
    #[error("voting is not open")]
    VotingClosed,
    /// A second ballot from the same voter in one round.
    #[error("user `{0}` has already voted this round")]
    AlreadyVoted(String),
    /// A ballot against oneself.
    #[error("players cannot vote for themselves")]
    SelfVote,
    /// Both secret words are the same.
    #[error("civilian and undercover words must differ")]
    IdenticalWords,
}

/// Aggregate root for one Undercover game session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    /// Opaque room identifier.
    pub id: String,
    /// Lifecycle status.
    pub status: RoomStatus,
    /// User who created the room.
    pub creator_id: String,
    /// Unique participants in join order.
    pub participant_ids: IndexSet<String>,
    /// Participants holding the undercover word.
    pub undercover_ids: IndexSet<String>,
    /// Participants holding the civilian word.
    pub civilian_ids: IndexSet<String>,
    /// Grows monotonically while the game is running.
    pub eliminated_ids: IndexSet<String>,
    /// Word handed to civilians.
    pub civilian_word: String,
    /// Word handed to the undercover.
    pub undercover_word: String,
    /// Maximum game length.
    pub duration: Duration,
    /// Creation instant.
    pub created_at: SystemTime,
    /// Instant the game started, once it has.
    pub start_time: Option<SystemTime>,
    /// Current round number, zero before the first round begins.
    pub round: u32,
    /// Open part of the current round.
    pub phase: RoundPhase,
    /// Voters that already cast a ballot in the current round, in ballot order.
    pub voted_ids: IndexSet<String>,
}

impl Room {
    /// Build a waiting room. The identifier is assigned when the room store persists it.
    pub fn new(
        creator_id: impl Into<String>,
        civilian_word: impl Into<String>,
        undercover_word: impl Into<String>,
        duration: Duration,
    ) -> Result<Self, RuleViolation> {
        let civilian_word = civilian_word.into().trim().to_string();
        let undercover_word = undercover_word.into().trim().to_string();
        if civilian_word.eq_ignore_ascii_case(&undercover_word) {
            return Err(RuleViolation::IdenticalWords);
        }

        Ok(Self {
            id: String::new(),
            status: RoomStatus::Waiting,
            creator_id: creator_id.into(),
            participant_ids: IndexSet::new(),
            undercover_ids: IndexSet::new(),
            civilian_ids: IndexSet::new(),
            eliminated_ids: IndexSet::new(),
            civilian_word,
            undercover_word,
            duration,
            created_at: SystemTime::now(),
            start_time: None,
            round: 0,
            phase: RoundPhase::Idle,
            voted_ids: IndexSet::new(),
        })
    }

    /// Add `user_id` to a waiting room. Returns `false` when they had already joined.
    pub fn join(&mut self, user_id: &str) -> Result<bool, RuleViolation> {
        match self.status {
            RoomStatus::Waiting => Ok(self.participant_ids.insert(user_id.to_string())),
            RoomStatus::Playing => Err(RuleViolation::AlreadyStarted),
            RoomStatus::Ended => Err(RuleViolation::RoomEnded),
        }
    }

    /// Reject anything but a playing room.
    pub fn ensure_playing(&self) -> Result<(), RuleViolation> {
        match self.status {
            RoomStatus::Playing => Ok(()),
            RoomStatus::Ended => Err(RuleViolation::RoomEnded),
            RoomStatus::Waiting => Err(RuleViolation::NotPlaying),
        }
    }

    /// Whether `user_id` joined, eliminated or not.
    pub fn is_participant(&self, user_id: &str) -> bool {
        self.participant_ids.contains(user_id)
    }

    /// Whether `user_id` is out of play.
    pub fn is_eliminated(&self, user_id: &str) -> bool {
        self.eliminated_ids.contains(user_id)
    }

    /// Participant that is still in the game.
    pub fn is_active(&self, user_id: &str) -> bool {
        self.is_participant(user_id) && !self.is_eliminated(user_id)
    }

    /// Participants minus eliminated ones, preserving join order.
    pub fn active_participants(&self) -> Vec<String> {
        self.participant_ids
            .iter()
            .filter(|id| !self.eliminated_ids.contains(*id))
            .cloned()
            .collect()
    }

    /// Role handed to `user_id`, once roles exist.
    pub fn role_of(&self, user_id: &str) -> Option<Role> {
        if self.undercover_ids.contains(user_id) {
            Some(Role::Undercover)
        } else if self.civilian_ids.contains(user_id) {
            Some(Role::Civilian)
        } else {
            None
        }
    }

    /// Secret word of `role`.
    pub fn word_for(&self, role: Role) -> &str {
        match role {
            Role::Undercover => &self.undercover_word,
            Role::Civilian => &self.civilian_word,
        }
    }

    /// Active players per side.
    pub fn remaining(&self) -> RemainingRoles {
        let alive = |ids: &IndexSet<String>| {
            ids.iter()
                .filter(|id| !self.eliminated_ids.contains(*id))
                .count()
        };
        RemainingRoles {
            undercover: alive(&self.undercover_ids),
            civilians: alive(&self.civilian_ids),
        }
    }

    /// Terminate the room. Ending twice is rejected so an ended room never changes again.
    pub fn end(&mut self) -> Result<(), RuleViolation> {
        if self.status == RoomStatus::Ended {
            return Err(RuleViolation::RoomEnded);
        }
        self.status = RoomStatus::Ended;
        self.phase = RoundPhase::Idle;
        Ok(())
    }

    /// Start a fresh round: bump the counter and forget last round's ballots.
    pub fn begin_round(&mut self) -> Result<u32, RuleViolation> {
        self.ensure_playing()?;
        self.round += 1;
        self.phase = RoundPhase::Idle;
        self.voted_ids.clear();
        Ok(self.round)
    }

    /// Give the floor to an active participant until `ends_at_ms`.
    pub fn open_speaking(&mut self, speaker_id: &str, ends_at_ms: u64) -> Result<(), RuleViolation> {
        self.ensure_playing()?;
        if !self.is_participant(speaker_id) {
            return Err(RuleViolation::NotParticipant(speaker_id.to_string()));
        }
        if self.is_eliminated(speaker_id) {
            return Err(RuleViolation::AlreadyEliminated(speaker_id.to_string()));
        }
        self.phase = RoundPhase::Speaking {
            speaker_id: speaker_id.to_string(),
            ends_at_ms,
        };
        Ok(())
    }

    /// Open the ballot box until `ends_at_ms`, forgetting earlier voters.
    pub fn open_voting(&mut self, ends_at_ms: u64) -> Result<(), RuleViolation> {
        self.ensure_playing()?;
        self.phase = RoundPhase::Voting { ends_at_ms };
        self.voted_ids.clear();
        Ok(())
    }

    /// Whether ballots are accepted right now.
    pub fn is_voting_open(&self) -> bool {
        self.status == RoomStatus::Playing && matches!(self.phase, RoundPhase::Voting { .. })
    }

    /// Check that `voter_id` may vote for `target_id` in the open voting window.
    pub fn check_ballot(&self, voter_id: &str, target_id: &str) -> Result<(), RuleViolation> {
        self.ensure_playing()?;
        if !self.is_voting_open() {
            return Err(RuleViolation::VotingClosed);
        }
        for user_id in [voter_id, target_id] {
            if !self.is_participant(user_id) {
                return Err(RuleViolation::NotParticipant(user_id.to_string()));
            }
            if self.is_eliminated(user_id) {
                return Err(RuleViolation::AlreadyEliminated(user_id.to_string()));
            }
        }
        if voter_id == target_id {
            return Err(RuleViolation::SelfVote);
        }
        if self.voted_ids.contains(voter_id) {
            return Err(RuleViolation::AlreadyVoted(voter_id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn waiting_room(players: &[&str]) -> Room {
        let mut room = Room::new("admin", "apple", "pear", Duration::from_secs(300)).unwrap();
        for player in players {
            room.join(player).unwrap();
        }
        room
    }

    #[test]
    fn identical_words_are_rejected() {
        let err = Room::new("admin", "Apple ", "apple", Duration::from_secs(60)).unwrap_err();
        assert_eq!(err, RuleViolation::IdenticalWords);
    }

    #[test]
    fn join_is_idempotent_and_keeps_order() {
        let mut room = waiting_room(&["c", "a"]);
        assert!(room.join("b").unwrap());
        assert!(!room.join("a").unwrap());
        assert_eq!(
            room.participant_ids.iter().collect::<Vec<_>>(),
            vec!["c", "a", "b"]
        );
    }

    #[test]
    fn join_rejected_once_started_or_ended() {
        let mut room = waiting_room(&["a", "b", "c"]);
        room.status = RoomStatus::Playing;
        assert_eq!(room.join("d").unwrap_err(), RuleViolation::AlreadyStarted);
        room.end().unwrap();
        assert_eq!(room.join("d").unwrap_err(), RuleViolation::RoomEnded);
        assert_eq!(room.end().unwrap_err(), RuleViolation::RoomEnded);
    }

    #[test]
    fn active_participants_skip_eliminated_in_join_order() {
        let mut room = waiting_room(&["a", "b", "c", "d"]);
        room.eliminated_ids.insert("b".into());
        assert_eq!(room.active_participants(), vec!["a", "c", "d"]);
        assert!(!room.is_active("b"));
        assert!(!room.is_active("zed"));
    }

    #[test]
    fn ballots_require_open_voting_and_active_players() {
        let mut room = waiting_room(&["a", "b", "c"]);
        room.status = RoomStatus::Playing;
        room.begin_round().unwrap();
        assert_eq!(
            room.check_ballot("a", "b").unwrap_err(),
            RuleViolation::VotingClosed
        );

        room.open_voting(0).unwrap();
        room.eliminated_ids.insert("c".into());
        assert!(room.check_ballot("a", "b").is_ok());
        assert_eq!(room.check_ballot("a", "a").unwrap_err(), RuleViolation::SelfVote);
        assert_eq!(
            room.check_ballot("a", "c").unwrap_err(),
            RuleViolation::AlreadyEliminated("c".into())
        );
        assert_eq!(
            room.check_ballot("x", "a").unwrap_err(),
            RuleViolation::NotParticipant("x".into())
        );

        room.voted_ids.insert("a".into());
        assert_eq!(
            room.check_ballot("a", "b").unwrap_err(),
            RuleViolation::AlreadyVoted("a".into())
        );
    }

    #[test]
    fn speaking_slot_refuses_eliminated_speaker() {
        let mut room = waiting_room(&["a", "b", "c"]);
        room.status = RoomStatus::Playing;
        room.eliminated_ids.insert("b".into());
        assert_eq!(
            room.open_speaking("b", 0).unwrap_err(),
            RuleViolation::AlreadyEliminated("b".into())
        );
        room.open_speaking("a", 42).unwrap();
        assert_eq!(
            room.phase,
            RoundPhase::Speaking {
                speaker_id: "a".into(),
                ends_at_ms: 42
            }
        );
    }
}
