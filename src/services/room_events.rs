use std::time::Duration;

use tracing::debug;

use crate::{
    dao::users::UserProfile,
    dto::ws::{
        CandidateSummary, CountdownHint, OutboundMessage, RevealedWords, RoundResultAnnouncement,
        SpeakingAnnouncement, SpeakingTurnNotice, VotingOpenAnnouncement,
    },
    state::{SharedState, room::Room, state_machine::RoundOutcome},
};

const PHASE_SPEAKING: &str = "speaking";
const PHASE_VOTING: &str = "voting";

/// Tell every client to re-fetch room state.
pub fn broadcast_room_refresh(state: &SharedState) {
    state
        .notifier()
        .broadcast_all(&OutboundMessage::RoomRefresh, None);
}

/// Announce a user's first live channel to everyone else.
pub fn broadcast_online(state: &SharedState, profile: UserProfile) {
    let user_id = profile.user_id.clone();
    state
        .notifier()
        .broadcast_all(&OutboundMessage::Online(profile), Some(&user_id));
}

/// Announce that a user's last channel went away.
pub fn broadcast_offline(state: &SharedState, profile: UserProfile) {
    let user_id = profile.user_id.clone();
    state
        .notifier()
        .broadcast_all(&OutboundMessage::Offline(profile), Some(&user_id));
}

/// Hand the floor to `speaker`: a targeted turn notice and countdown, then a public announcement.
pub fn announce_speaker(
    state: &SharedState,
    room_id: &str,
    round: u32,
    speaker: &UserProfile,
    position: usize,
    speakers: usize,
    window: Duration,
) {
    let notifier = state.notifier();
    notifier.send_to_user(
        &speaker.user_id,
        &OutboundMessage::SpeakingTurn(SpeakingTurnNotice {
            room_id: room_id.to_string(),
            round,
            seconds: window.as_secs(),
        }),
    );
    notifier.send_to_user(
        &speaker.user_id,
        &countdown(room_id, PHASE_SPEAKING, window),
    );
    notifier.broadcast_all(
        &OutboundMessage::SpeakingAnnouncement(SpeakingAnnouncement {
            room_id: room_id.to_string(),
            round,
            speaker_id: speaker.user_id.clone(),
            speaker_name: speaker.display_name.clone(),
            position,
            speakers,
        }),
        None,
    );
}

/// Open the ballot box publicly and start a countdown for every player still in the game.
pub fn announce_voting_open(
    state: &SharedState,
    room_id: &str,
    round: u32,
    candidates: Vec<UserProfile>,
    window: Duration,
) {
    let notifier = state.notifier();
    let voters = candidates
        .iter()
        .map(|profile| profile.user_id.clone())
        .collect::<Vec<_>>();
    notifier.broadcast_all(
        &OutboundMessage::VotingOpen(VotingOpenAnnouncement {
            room_id: room_id.to_string(),
            round,
            seconds: window.as_secs(),
            candidates: candidates
                .into_iter()
                .map(|profile| CandidateSummary {
                    user_id: profile.user_id,
                    display_name: profile.display_name,
                })
                .collect(),
        }),
        None,
    );

    let hint = countdown(room_id, PHASE_VOTING, window);
    let reached: usize = voters
        .iter()
        .map(|user_id| notifier.send_to_user(user_id, &hint))
        .sum();
    debug!(room_id, round, voters = voters.len(), reached, "voting countdown sent");
}

/// Publish how a round (or a forced elimination) ended. Words are revealed only when the game
/// is over.
pub fn broadcast_round_result(
    state: &SharedState,
    room: &Room,
    outcome: RoundOutcome,
    eliminated: Option<&UserProfile>,
) {
    let words = outcome.is_terminal().then(|| RevealedWords {
        civilian_word: room.civilian_word.clone(),
        undercover_word: room.undercover_word.clone(),
    });
    let payload = RoundResultAnnouncement {
        room_id: room.id.clone(),
        round: room.round,
        outcome,
        eliminated_id: eliminated.map(|profile| profile.user_id.clone()),
        eliminated_name: eliminated.map(|profile| profile.display_name.clone()),
        remaining: room.remaining(),
        words,
    };
    state
        .notifier()
        .broadcast_all(&OutboundMessage::RoundResult(payload), None);
}

fn countdown(room_id: &str, phase: &str, remaining: Duration) -> OutboundMessage {
    OutboundMessage::Countdown(CountdownHint {
        room_id: room_id.to_string(),
        phase: phase.to_string(),
        remaining_seconds: remaining.as_secs(),
    })
}
