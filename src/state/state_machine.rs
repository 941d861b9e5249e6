//! Pure game rules for an Undercover room: role assignment, ballots, round resolution and
//! win evaluation. Nothing here performs I/O; callers load the room, apply a rule and save.
//!
//! Room status only moves forward:
//!
//! ```text
//! WAITING --start (>= 3 participants)--> PLAYING --round decides a winner--> ENDED
//! ```

use std::time::SystemTime;

use indexmap::IndexMap;
use rand::{Rng, seq::SliceRandom};
use serde::Serialize;
use utoipa::ToSchema;

use crate::state::room::{MIN_PLAYERS, RemainingRoles, Room, RoomStatus, RoundPhase, RuleViolation};

/// Result of checking the remaining players of a running game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WinCondition {
    /// Both sides still have players in.
    Ongoing,
    /// Every undercover player is out.
    CiviliansWin,
    /// The undercover side caught up with the civilians.
    UndercoverWin,
}

impl WinCondition {
    /// Whether the game is over.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WinCondition::Ongoing)
    }
}

/// Outcome of a voting round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(tag = "kind", content = "condition", rename_all = "snake_case")]
pub enum RoundOutcome {
    /// Nobody received a vote; nobody is eliminated and the game continues.
    Voided,
    /// Somebody was eliminated and the win condition was evaluated.
    Decided(WinCondition),
}

impl RoundOutcome {
    /// Whether this outcome ends the game.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RoundOutcome::Decided(condition) if condition.is_terminal())
    }
}

/// What happened when a round was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundResolution {
    /// Player voted out, if anyone was.
    pub eliminated: Option<String>,
    /// Effect of the round on the game.
    pub outcome: RoundOutcome,
}

/// Number of votes a player received and the ballot ordinal that brought them there.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VoteCount {
    /// Ballots received.
    pub votes: u32,
    /// Ordinal of the ballot that produced `votes`.
    pub reached_at: u64,
}

/// Running per-target count of ballots for one round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoteTally {
    entries: IndexMap<String, VoteCount>,
    ballots: u64,
}

impl VoteTally {
    /// Empty tally.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a tally from stored counts. Entries are ordered by the ballot that last touched
    /// them; `ballots` is the number of ballots already cast this round.
    pub fn from_counts(counts: impl IntoIterator<Item = (String, VoteCount)>, ballots: u64) -> Self {
        let mut counts = counts.into_iter().collect::<Vec<_>>();
        counts.sort_by_key(|(_, count)| count.reached_at);
        let highest = counts.iter().map(|(_, c)| c.reached_at).max().unwrap_or(0);
        Self {
            entries: counts.into_iter().collect(),
            ballots: ballots.max(highest),
        }
    }

    /// Ballots against `user_id`.
    pub fn votes_for(&self, user_id: &str) -> u32 {
        self.entries.get(user_id).map_or(0, |count| count.votes)
    }

    /// Counter of `user_id`, if they received any ballot.
    pub fn count(&self, user_id: &str) -> Option<VoteCount> {
        self.entries.get(user_id).copied()
    }

    /// Ballots cast so far this round.
    pub fn ballots(&self) -> u64 {
        self.ballots
    }

    /// Whether nobody received a ballot.
    pub fn is_empty(&self) -> bool {
        self.entries.values().all(|count| count.votes == 0)
    }

    /// Counters in the order ballots last touched them.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &VoteCount)> {
        self.entries.iter()
    }

    /// Target with the most votes. Ties go to whoever reached that count first; entries with
    /// equal ordinals keep their insertion order.
    pub fn leader(&self) -> Option<(&str, u32)> {
        let mut best: Option<(&str, VoteCount)> = None;
        for (user_id, count) in &self.entries {
            if count.votes == 0 {
                continue;
            }
            let better = match best {
                None => true,
                Some((_, current)) => {
                    count.votes > current.votes
                        || (count.votes == current.votes && count.reached_at < current.reached_at)
                }
            };
            if better {
                best = Some((user_id.as_str(), *count));
            }
        }
        best.map(|(user_id, count)| (user_id, count.votes))
    }
}

/// Undercover seats for a room of `participants` players.
pub fn undercover_quota(participants: usize) -> usize {
    (participants / 3).max(1)
}

/// Shuffle the participants and split them into undercover and civilian seats.
pub fn assign_roles<R: Rng + ?Sized>(room: &mut Room, rng: &mut R) {
    let mut seats = room.participant_ids.iter().cloned().collect::<Vec<_>>();
    seats.shuffle(rng);
    let quota = undercover_quota(seats.len()).min(seats.len());
    let civilians = seats.split_off(quota);

    room.undercover_ids = seats.into_iter().collect();
    room.civilian_ids = civilians.into_iter().collect();
}

/// Move a waiting room to PLAYING and hand out roles.
pub fn start_game<R: Rng + ?Sized>(
    room: &mut Room,
    rng: &mut R,
    now: SystemTime,
) -> Result<(), RuleViolation> {
    match room.status {
        RoomStatus::Waiting => {}
        RoomStatus::Playing => return Err(RuleViolation::AlreadyStarted),
        RoomStatus::Ended => return Err(RuleViolation::RoomEnded),
    }
    if room.participant_ids.len() < MIN_PLAYERS {
        return Err(RuleViolation::NotEnoughPlayers(room.participant_ids.len()));
    }

    assign_roles(room, rng);
    room.status = RoomStatus::Playing;
    room.start_time = Some(now);
    room.round = 0;
    room.phase = RoundPhase::Idle;
    Ok(())
}

/// Count a ballot against `target_id`. Ballots for anyone outside the active players are
/// ignored and reported as `false`.
pub fn record_vote(room: &Room, tally: &mut VoteTally, target_id: &str) -> bool {
    if !room.is_active(target_id) {
        return false;
    }
    tally.ballots += 1;
    let ordinal = tally.ballots;
    let entry = tally.entries.entry(target_id.to_string()).or_default();
    entry.votes += 1;
    entry.reached_at = ordinal;
    true
}

/// Win evaluation over the remaining counts. No undercover left always wins for civilians;
/// otherwise undercover win as soon as they are at least as many as civilians.
pub fn evaluate_win_condition(remaining_undercover: usize, remaining_civilians: usize) -> WinCondition {
    if remaining_undercover == 0 {
        WinCondition::CiviliansWin
    } else if remaining_undercover >= remaining_civilians {
        WinCondition::UndercoverWin
    } else {
        WinCondition::Ongoing
    }
}

/// Win condition of the room's remaining players.
pub fn evaluate_room(room: &Room) -> WinCondition {
    let RemainingRoles {
        undercover,
        civilians,
    } = room.remaining();
    evaluate_win_condition(undercover, civilians)
}

/// Remove `user_id` from play and end the room when a side has won.
pub fn eliminate(room: &mut Room, user_id: &str) -> Result<WinCondition, RuleViolation> {
    room.ensure_playing()?;
    if !room.is_participant(user_id) {
        return Err(RuleViolation::NotParticipant(user_id.to_string()));
    }
    if !room.eliminated_ids.insert(user_id.to_string()) {
        return Err(RuleViolation::AlreadyEliminated(user_id.to_string()));
    }

    let condition = evaluate_room(room);
    if condition.is_terminal() {
        room.status = RoomStatus::Ended;
        room.phase = RoundPhase::Idle;
    }
    Ok(condition)
}

/// Close the voting window of a running room and apply the tally.
pub fn resolve_round(room: &mut Room, tally: &VoteTally) -> Result<RoundResolution, RuleViolation> {
    room.ensure_playing()?;
    room.phase = RoundPhase::Idle;

    let leader = tally
        .iter()
        .filter(|(user_id, _)| room.is_active(user_id))
        .fold(VoteTally::new(), |mut active, (user_id, count)| {
            active.entries.insert(user_id.clone(), *count);
            active
        })
        .leader()
        .map(|(user_id, _)| user_id.to_string());

    let Some(target) = leader else {
        return Ok(RoundResolution {
            eliminated: None,
            outcome: RoundOutcome::Voided,
        });
    };

    let condition = eliminate(room, &target)?;
    Ok(RoundResolution {
        eliminated: Some(target),
        outcome: RoundOutcome::Decided(condition),
    })
}
