//! Background flow that drives one playing room through its rounds.
//!
//! Each round opens one speaking slot per active participant, in join order, then a voting
//! window, then resolves the round. Deadlines are computed from the instant the round began,
//! so time spent waiting on the room lock does not stretch the schedule. Every suspension
//! selects on the flow's cancellation token, and every step after a suspension reloads the
//! room under its lock, so a room that was ended, deleted or expired meanwhile stops the flow
//! without being written again.

use std::{
    future::Future,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tokio::{
    task::JoinHandle,
    time::{Instant, sleep, sleep_until},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::ServiceError,
    services::{
        room_events,
        room_service::{self, RoundStart, SlotOpen},
    },
    state::{SharedState, room::RoomStatus},
};

const STEP_RETRY_PAUSE: Duration = Duration::from_millis(100);
const STEP_RETRY_PAUSE_MAX: Duration = Duration::from_secs(1);

/// Why a flow stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowExit {
    /// A round decided the winner.
    Finished,
    /// The configured game duration elapsed.
    TimeUp,
    /// The room was deleted, expired or ended while a step was running.
    RoomGone,
    /// The room was ended or deleted through the API, or the server is shutting down.
    Cancelled,
}

/// Spawn the phase flow of `room_id` on the phase lane, replacing any flow already running.
pub fn launch(state: &SharedState, room_id: &str) -> JoinHandle<()> {
    let (flow_id, token) = state.register_phase_flow(room_id);
    let flow_state = state.clone();
    let room_id = room_id.to_string();

    state.spawn_phase(async move {
        info!(room_id = %room_id, flow = %flow_id, "phase flow started");
        match run(&flow_state, &room_id, &token).await {
            Ok(exit) => info!(room_id = %room_id, flow = %flow_id, ?exit, "phase flow stopped"),
            Err(err) => {
                error!(room_id = %room_id, flow = %flow_id, error = %err, "phase flow aborted");
                if !token.is_cancelled() {
                    abandon(&flow_state, &room_id).await;
                }
            }
        }
        flow_state.release_phase_flow(&room_id, flow_id);
    })
}

/// Drive rounds until the game is decided or the flow has to stop.
pub async fn run(
    state: &SharedState,
    room_id: &str,
    token: &CancellationToken,
) -> Result<FlowExit, ServiceError> {
    let timings = state.config().phase_timings();
    let budget = lease_budget(state);

    loop {
        let started =
            retry_step(token, budget, || room_service::begin_round(state, room_id)).await?;
        let (round, speakers) = match started {
            Some(RoundStart::Started { round, speakers }) => (round, speakers),
            Some(RoundStart::TimeUp) => {
                room_events::broadcast_room_refresh(state);
                return Ok(FlowExit::TimeUp);
            }
            Some(RoundStart::Stopped) => return Ok(FlowExit::RoomGone),
            None => return Ok(FlowExit::Cancelled),
        };

        let round_start = Instant::now();
        let mut slots = 0u32;
        debug!(room_id, round, speakers = speakers.len(), "round started");

        for (index, speaker_id) in speakers.iter().enumerate() {
            let deadline = round_start + timings.speaking_window * (slots + 1);
            let opened = retry_step(token, budget, || {
                room_service::open_speaking_slot(
                    state,
                    room_id,
                    round,
                    speaker_id,
                    wall_clock_ms(deadline),
                )
            })
            .await?;
            match opened {
                Some(SlotOpen::Opened) => {}
                Some(SlotOpen::Skipped) => {
                    debug!(room_id, round, speaker_id = %speaker_id, "skipping eliminated speaker");
                    continue;
                }
                Some(SlotOpen::Stopped) => return Ok(FlowExit::RoomGone),
                None => return Ok(FlowExit::Cancelled),
            }
            slots += 1;

            let speaker = state.profile(speaker_id).await;
            room_events::announce_speaker(
                state,
                room_id,
                round,
                &speaker,
                index + 1,
                speakers.len(),
                deadline.saturating_duration_since(Instant::now()),
            );
            if !suspend_until(token, deadline).await {
                return Ok(FlowExit::Cancelled);
            }
        }

        let voting_deadline =
            round_start + timings.speaking_window * slots + timings.voting_window;
        let candidates = retry_step(token, budget, || {
            room_service::open_voting(state, room_id, round, wall_clock_ms(voting_deadline))
        })
        .await?;
        let candidates = match candidates {
            Some(Some(candidates)) => candidates,
            Some(None) => return Ok(FlowExit::RoomGone),
            None => return Ok(FlowExit::Cancelled),
        };

        let mut profiles = Vec::with_capacity(candidates.len());
        for user_id in &candidates {
            profiles.push(state.profile(user_id).await);
        }
        room_events::announce_voting_open(
            state,
            room_id,
            round,
            profiles,
            voting_deadline.saturating_duration_since(Instant::now()),
        );
        if !suspend_until(token, voting_deadline).await {
            return Ok(FlowExit::Cancelled);
        }

        let report = retry_step(token, budget, || {
            room_service::resolve_round(state, room_id, round)
        })
        .await?;
        match report {
            Some(Some(report)) if report.resolution.outcome.is_terminal() => {
                return Ok(FlowExit::Finished);
            }
            Some(Some(_)) => {}
            Some(None) => {
                // Somebody else resolved this round; keep going only if the game did not end.
                match state.rooms().load(room_id).await? {
                    Some(room) if room.status == RoomStatus::Playing && room.round == round => {
                        debug!(room_id, round, "round resolved elsewhere; moving on");
                    }
                    _ => return Ok(FlowExit::RoomGone),
                }
            }
            None => return Ok(FlowExit::Cancelled),
        }
    }
}

/// Wait for `deadline`. Returns `false` when the flow was cancelled first.
async fn suspend_until(token: &CancellationToken, deadline: Instant) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = sleep_until(deadline) => true,
    }
}

/// Longest a step keeps retrying a busy room: enough for any other holder's lease to run out.
fn lease_budget(state: &SharedState) -> Duration {
    let lock = state.config().lock_settings();
    lock.hold + lock.wait
}

fn retry_pause(attempt: u32) -> Duration {
    (STEP_RETRY_PAUSE * attempt).min(STEP_RETRY_PAUSE_MAX)
}

/// Run a locked step, retrying while the room is busy or storage hiccups, for at most `budget`
/// after the first failure. Returns `Ok(None)` when the flow is cancelled while waiting.
async fn retry_step<F, Fut, T>(
    token: &CancellationToken,
    budget: Duration,
    mut step: F,
) -> Result<Option<T>, ServiceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    let mut attempt = 0;
    let mut first_failure: Option<Instant> = None;
    loop {
        if token.is_cancelled() {
            return Ok(None);
        }
        match step().await {
            Ok(value) => return Ok(Some(value)),
            Err(err) if err.is_retryable() => {
                let since = *first_failure.get_or_insert_with(Instant::now);
                if since.elapsed() >= budget {
                    return Err(err);
                }
                attempt += 1;
                warn!(error = %err, attempt, "phase step failed; retrying");
                tokio::select! {
                    _ = token.cancelled() => return Ok(None),
                    _ = sleep(retry_pause(attempt)) => {}
                }
            }
            Err(err) => return Err(err),
        }
    }
}

/// Shut down a room whose flow failed: end it under its lock, or failing that drop its
/// ephemeral keys and the active pointer directly.
async fn abandon(state: &SharedState, room_id: &str) {
    let budget = lease_budget(state);
    let started = Instant::now();
    let mut attempt = 0;
    loop {
        match room_service::abandon_game(state, room_id).await {
            Ok(ended) => {
                info!(room_id, ended, "abandoned room cleaned up");
                break;
            }
            Err(err) if err.is_retryable() && started.elapsed() < budget => {
                attempt += 1;
                sleep(retry_pause(attempt)).await;
            }
            Err(err) => {
                warn!(room_id, error = %err, "could not end abandoned room; clearing its keys");
                let rooms = state.rooms();
                if let Err(err) = rooms.clear_ephemeral(room_id).await {
                    warn!(room_id, error = %err, "failed to clear ephemeral keys");
                }
                if let Err(err) = rooms.clear_active_room(room_id).await {
                    warn!(room_id, error = %err, "failed to clear active room pointer");
                }
                break;
            }
        }
    }
    room_events::broadcast_room_refresh(state);
}

/// Unix milliseconds at which the monotonic `deadline` falls.
fn wall_clock_ms(deadline: Instant) -> u64 {
    let remaining = deadline.saturating_duration_since(Instant::now());
    (SystemTime::now() + remaining)
        .duration_since(UNIX_EPOCH)
        .map(|since| since.as_millis() as u64)
        .unwrap_or_default()
}
