//! Business logic behind the room routes and the phase orchestrator.
//!
//! Every mutation follows the same protocol: take the room lock, load, check preconditions,
//! mutate, save, release. Broadcasts go out only after the lock has been released.

use std::time::{Duration, SystemTime};

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::{
    dao::{room_store::RoomStore, storage::StorageError, users::UserProfile},
    dto::{
        format_system_time,
        room::{
            CreateRoomRequest, JoinRoomRequest, ParticipantView, PhaseView, PlayerInfo,
            RoomCreatedResponse, RoomView,
        },
    },
    error::ServiceError,
    services::{phase_orchestrator, room_events},
    state::{
        SharedState,
        room::{Room, RoomStatus},
        state_machine::{self, RoundOutcome, RoundResolution},
    },
};

/// Creator recorded for rooms opened with the admin token alone.
pub const ADMIN_CREATOR_ID: &str = "admin";

/// Who is performing an operation, as asserted by the transport layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Actor {
    /// Acting user, when one is known.
    pub user_id: Option<String>,
    /// Whether the actor holds admin rights.
    pub is_admin: bool,
}

impl Actor {
    /// Plain user without admin rights.
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            is_admin: false,
        }
    }

    /// Admin acting through the token alone.
    pub fn admin() -> Self {
        Self {
            user_id: None,
            is_admin: true,
        }
    }

    /// Attach the acting user id.
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Acting user id, or `Unauthorized` when there is none.
    pub fn require_user(&self) -> Result<&str, ServiceError> {
        self.user_id
            .as_deref()
            .ok_or_else(|| ServiceError::Unauthorized("missing acting user id".into()))
    }

    fn is(&self, user_id: &str) -> bool {
        self.user_id.as_deref() == Some(user_id)
    }

    /// Admins manage every room; otherwise only the creator does.
    pub fn manages(&self, room: &Room) -> bool {
        self.is_admin || self.is(&room.creator_id)
    }
}

/// A resolved round together with the room state it produced.
#[derive(Debug, Clone)]
pub struct RoundReport {
    /// Room after the round was applied.
    pub room: Room,
    /// What the round decided.
    pub resolution: RoundResolution,
}

/// How an attempt to begin a new round went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundStart {
    /// A new round began.
    Started {
        /// Number of the new round.
        round: u32,
        /// Active participants in speaking order.
        speakers: Vec<String>,
    },
    /// The game outlived its configured duration and was ended.
    TimeUp,
    /// The room is gone or no longer playing.
    Stopped,
}

/// How an attempt to open a speaking slot went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOpen {
    /// The slot is open.
    Opened,
    /// The speaker was eliminated since the round began.
    Skipped,
    /// The room is gone or no longer playing.
    Stopped,
}

fn authorize_manage(actor: &Actor, room: &Room) -> Result<(), ServiceError> {
    if actor.manages(room) {
        Ok(())
    } else {
        Err(ServiceError::Unauthorized(format!(
            "only the creator or an admin can manage room `{}`",
            room.id
        )))
    }
}

async fn load_existing(rooms: &RoomStore, room_id: &str) -> Result<Room, ServiceError> {
    rooms
        .load(room_id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("room `{room_id}` not found")))
}

/// Drop the ephemeral keys of a room that just reached ENDED and release the active pointer.
async fn finish_room(rooms: &RoomStore, room_id: &str) -> Result<(), ServiceError> {
    rooms.clear_ephemeral(room_id).await?;
    rooms.clear_active_room(room_id).await?;
    Ok(())
}

fn game_time_elapsed(room: &Room, now: SystemTime) -> bool {
    room.start_time
        .and_then(|start| now.duration_since(start).ok())
        .is_some_and(|elapsed| elapsed >= room.duration)
}

/// Refuse to open a room while another one is still live; clear a pointer to a finished one.
async fn release_stale_active_room(rooms: &RoomStore) -> Result<(), ServiceError> {
    let Some(active_id) = rooms.active_room_id().await? else {
        return Ok(());
    };
    match rooms.load(&active_id).await? {
        Some(room) if room.status != RoomStatus::Ended => Err(ServiceError::InvalidState(
            format!("room `{active_id}` is still active"),
        )),
        _ => {
            debug!(room_id = %active_id, "clearing stale active room pointer");
            rooms.clear_active_room(&active_id).await?;
            Ok(())
        }
    }
}

/// Open a new waiting room and make it the active one.
pub async fn create_room(
    state: &SharedState,
    actor: &Actor,
    request: CreateRoomRequest,
) -> Result<RoomCreatedResponse, ServiceError> {
    if !actor.is_admin {
        return Err(ServiceError::Unauthorized(
            "only admins can create rooms".into(),
        ));
    }
    let creator_id = actor
        .user_id
        .clone()
        .unwrap_or_else(|| ADMIN_CREATOR_ID.to_string());

    let rooms = state.rooms();
    release_stale_active_room(rooms).await?;

    let room = Room::new(
        creator_id.clone(),
        request.civilian_word,
        request.undercover_word,
        Duration::from_secs(request.duration),
    )?;
    let room_id = rooms.create(room).await?;
    if !rooms.claim_active_room(&room_id).await? {
        rooms.delete(&room_id).await?;
        return Err(ServiceError::InvalidState(
            "another room became active concurrently".into(),
        ));
    }

    info!(room_id = %room_id, creator_id = %creator_id, "room created");
    room_events::broadcast_room_refresh(state);
    Ok(RoomCreatedResponse { room_id })
}

/// Add a participant to a waiting room. Returns `false` when they had already joined.
pub async fn join_room(
    state: &SharedState,
    actor: &Actor,
    room_id: &str,
    request: JoinRoomRequest,
) -> Result<bool, ServiceError> {
    let user_id = match request.user_id {
        Some(user_id) if actor.is(&user_id) || actor.is_admin => user_id,
        Some(_) => {
            return Err(ServiceError::Unauthorized(
                "only admins can add other users".into(),
            ));
        }
        None => actor.require_user()?.to_string(),
    };

    let rooms = state.rooms();
    let joining = user_id.as_str();
    let joined = state
        .with_room_lock(room_id, move || async move {
            let mut room = load_existing(rooms, room_id).await?;
            let joined = room.join(joining)?;
            if joined {
                rooms.save(&room).await?;
                rooms.bind_player(joining, room_id).await?;
            }
            Ok(joined)
        })
        .await?;

    if joined {
        info!(room_id, user_id = %user_id, "player joined room");
        room_events::broadcast_room_refresh(state);
    } else {
        debug!(room_id, user_id = %user_id, "player already in room");
    }
    Ok(joined)
}

/// Hand out roles, move the room to PLAYING and launch its phase flow.
pub async fn start_game(
    state: &SharedState,
    actor: &Actor,
    room_id: &str,
) -> Result<bool, ServiceError> {
    let rooms = state.rooms();
    let room = state
        .with_room_lock(room_id, move || async move {
            let mut room = load_existing(rooms, room_id).await?;
            authorize_manage(actor, &room)?;
            state_machine::start_game(&mut room, &mut rand::rng(), SystemTime::now())?;
            rooms.save(&room).await?;
            rooms.write_player_roles(&room).await?;
            rooms.refresh_active_room().await?;
            Ok(room)
        })
        .await?;

    info!(
        room_id,
        participants = room.participant_ids.len(),
        undercover = room.undercover_ids.len(),
        "game started"
    );
    phase_orchestrator::launch(state, room_id);
    room_events::broadcast_room_refresh(state);
    Ok(true)
}

/// Terminate a room from any non-terminal status.
pub async fn end_game(
    state: &SharedState,
    actor: &Actor,
    room_id: &str,
) -> Result<bool, ServiceError> {
    let rooms = state.rooms();
    state
        .with_room_lock(room_id, move || async move {
            let mut room = load_existing(rooms, room_id).await?;
            authorize_manage(actor, &room)?;
            room.end()?;
            rooms.save(&room).await?;
            finish_room(rooms, room_id).await
        })
        .await?;

    state.cancel_phase_flow(room_id);
    info!(room_id, "game ended");
    room_events::broadcast_room_refresh(state);
    Ok(true)
}

/// Close a room whose phase flow cannot go on. Returns whether a playing room was ended.
///
/// An unreadable room blob is left in place, but its ephemeral keys and the active pointer are
/// still dropped so a new room can be opened.
pub async fn abandon_game(state: &SharedState, room_id: &str) -> Result<bool, ServiceError> {
    let rooms = state.rooms();
    state
        .with_room_lock(room_id, move || async move {
            let ended = match rooms.load(room_id).await {
                Ok(Some(mut room)) if room.status == RoomStatus::Playing => {
                    room.end()?;
                    rooms.save(&room).await?;
                    true
                }
                Ok(_) => false,
                Err(err @ StorageError::Serialization { .. }) => {
                    warn!(room_id, error = %err, "cleaning up unreadable room");
                    false
                }
                Err(err) => return Err(err.into()),
            };
            finish_room(rooms, room_id).await?;
            Ok(ended)
        })
        .await
}

/// Force a participant out of a running game, ending it when a side has won.
pub async fn eliminate_player(
    state: &SharedState,
    actor: &Actor,
    room_id: &str,
    user_id: &str,
) -> Result<bool, ServiceError> {
    let rooms = state.rooms();
    let (room, condition) = state
        .with_room_lock(room_id, move || async move {
            let mut room = load_existing(rooms, room_id).await?;
            authorize_manage(actor, &room)?;
            let condition = state_machine::eliminate(&mut room, user_id)?;
            rooms.save(&room).await?;
            if condition.is_terminal() {
                finish_room(rooms, room_id).await?;
            }
            Ok((room, condition))
        })
        .await?;

    info!(room_id, user_id, outcome = ?condition, "player eliminated");
    let eliminated = state.profile(user_id).await;
    room_events::broadcast_round_result(
        state,
        &room,
        RoundOutcome::Decided(condition),
        Some(&eliminated),
    );
    if condition.is_terminal() {
        state.cancel_phase_flow(room_id);
    }
    room_events::broadcast_room_refresh(state);
    Ok(true)
}

/// Count one ballot from `voter_id` against `target_id` in the open voting window.
pub async fn cast_vote(
    state: &SharedState,
    voter_id: &str,
    room_id: &str,
    target_id: &str,
) -> Result<(), ServiceError> {
    let rooms = state.rooms();
    let count = state
        .with_room_lock(room_id, move || async move {
            let mut room = load_existing(rooms, room_id).await?;
            room.check_ballot(voter_id, target_id)?;

            let mut tally = rooms.load_tally(&room).await?;
            if !state_machine::record_vote(&room, &mut tally, target_id) {
                return Err(ServiceError::InvalidInput(format!(
                    "`{target_id}` cannot receive votes"
                )));
            }
            room.voted_ids.insert(voter_id.to_string());
            let count = tally.count(target_id).unwrap_or_default();

            // The ballot is recorded on the room first so a voter can never vote twice.
            rooms.save(&room).await?;
            rooms.save_vote_count(room_id, target_id, count).await?;
            Ok(count)
        })
        .await?;

    debug!(room_id, voter_id, target_id, votes = count.votes, ballot = count.reached_at, "vote recorded");
    Ok(())
}

/// Close the voting window of `round` and apply the tally.
///
/// Returns `Ok(None)` when the room is gone or the round was already resolved, so concurrent
/// callers never resolve the same round twice.
pub async fn resolve_round(
    state: &SharedState,
    room_id: &str,
    round: u32,
) -> Result<Option<RoundReport>, ServiceError> {
    let rooms = state.rooms();
    let report = state
        .with_room_lock(room_id, move || async move {
            let Some(mut room) = rooms.load(room_id).await? else {
                return Ok(None);
            };
            if room.round != round || !room.is_voting_open() {
                debug!(room_id, round, current_round = room.round, "round already resolved");
                return Ok(None);
            }

            let tally = rooms.load_tally(&room).await?;
            let resolution = state_machine::resolve_round(&mut room, &tally)?;
            rooms.save(&room).await?;
            rooms.clear_votes(room_id).await?;
            if resolution.outcome.is_terminal() {
                finish_room(rooms, room_id).await?;
            }
            Ok(Some(RoundReport { room, resolution }))
        })
        .await?;

    let Some(report) = report else {
        return Ok(None);
    };

    let eliminated = match report.resolution.eliminated.as_deref() {
        Some(user_id) => Some(state.profile(user_id).await),
        None => None,
    };
    info!(
        room_id,
        round,
        eliminated = ?report.resolution.eliminated,
        outcome = ?report.resolution.outcome,
        "round resolved"
    );
    room_events::broadcast_round_result(
        state,
        &report.room,
        report.resolution.outcome,
        eliminated.as_ref(),
    );
    if report.resolution.outcome.is_terminal() {
        room_events::broadcast_room_refresh(state);
    }
    Ok(Some(report))
}

/// Start the next round of a playing room, or end it once its duration has run out.
pub async fn begin_round(state: &SharedState, room_id: &str) -> Result<RoundStart, ServiceError> {
    let rooms = state.rooms();
    state
        .with_room_lock(room_id, move || async move {
            let Some(mut room) = rooms.load(room_id).await? else {
                return Ok(RoundStart::Stopped);
            };
            if room.status != RoomStatus::Playing {
                return Ok(RoundStart::Stopped);
            }
            if game_time_elapsed(&room, SystemTime::now()) {
                room.end()?;
                rooms.save(&room).await?;
                finish_room(rooms, room_id).await?;
                return Ok(RoundStart::TimeUp);
            }

            let round = room.begin_round()?;
            rooms.clear_votes(room_id).await?;
            rooms.save(&room).await?;
            rooms.refresh_active_room().await?;
            Ok(RoundStart::Started {
                round,
                speakers: room.active_participants(),
            })
        })
        .await
}

/// Give the floor to `speaker_id` until `ends_at_ms` (unix milliseconds).
pub async fn open_speaking_slot(
    state: &SharedState,
    room_id: &str,
    round: u32,
    speaker_id: &str,
    ends_at_ms: u64,
) -> Result<SlotOpen, ServiceError> {
    let rooms = state.rooms();
    state
        .with_room_lock(room_id, move || async move {
            let Some(mut room) = rooms.load(room_id).await? else {
                return Ok(SlotOpen::Stopped);
            };
            if room.status != RoomStatus::Playing || room.round != round {
                return Ok(SlotOpen::Stopped);
            }
            if !room.is_active(speaker_id) {
                return Ok(SlotOpen::Skipped);
            }
            room.open_speaking(speaker_id, ends_at_ms)?;
            rooms.save(&room).await?;
            Ok(SlotOpen::Opened)
        })
        .await
}

/// Open the ballot box of `round`. Returns the players that can vote and be voted for, or
/// `None` when the room stopped in the meantime.
pub async fn open_voting(
    state: &SharedState,
    room_id: &str,
    round: u32,
    ends_at_ms: u64,
) -> Result<Option<Vec<String>>, ServiceError> {
    let rooms = state.rooms();
    state
        .with_room_lock(room_id, move || async move {
            let Some(mut room) = rooms.load(room_id).await? else {
                return Ok(None);
            };
            if room.status != RoomStatus::Playing || room.round != round {
                return Ok(None);
            }
            room.open_voting(ends_at_ms)?;
            rooms.clear_votes(room_id).await?;
            rooms.save(&room).await?;
            Ok(Some(room.active_participants()))
        })
        .await
}

/// Remove a room and every key tied to it.
pub async fn delete_room(
    state: &SharedState,
    actor: &Actor,
    room_id: &str,
) -> Result<bool, ServiceError> {
    let rooms = state.rooms();
    state
        .with_room_lock(room_id, move || async move {
            match rooms.load(room_id).await {
                Ok(Some(room)) => authorize_manage(actor, &room)?,
                Ok(None) => {
                    return Err(ServiceError::NotFound(format!("room `{room_id}` not found")));
                }
                Err(err @ StorageError::Serialization { .. }) if actor.is_admin => {
                    warn!(room_id, error = %err, "deleting unreadable room");
                }
                Err(err) => return Err(err.into()),
            }
            rooms.delete(room_id).await?;
            Ok(())
        })
        .await?;

    state.cancel_phase_flow(room_id);
    info!(room_id, "room deleted");
    room_events::broadcast_room_refresh(state);
    Ok(true)
}

/// Public view of the room `activeRoom` points at, if it still exists.
pub async fn get_active_room(state: &SharedState) -> Result<Option<RoomView>, ServiceError> {
    let rooms = state.rooms();
    let Some(room_id) = rooms.active_room_id().await? else {
        return Ok(None);
    };
    match rooms.load(&room_id).await? {
        Some(room) => Ok(Some(room_view(state, &room).await)),
        None => {
            debug!(room_id = %room_id, "active room pointer refers to a missing room");
            Ok(None)
        }
    }
}

/// Role, word and elimination status of one participant. Visible to that participant and to
/// whoever manages the room.
pub async fn get_player_info(
    state: &SharedState,
    actor: &Actor,
    room_id: &str,
    user_id: &str,
) -> Result<PlayerInfo, ServiceError> {
    let rooms = state.rooms();
    let room = load_existing(rooms, room_id).await?;
    if !actor.is(user_id) && !actor.manages(&room) {
        return Err(ServiceError::Unauthorized(
            "players can only inspect themselves".into(),
        ));
    }
    if !room.is_participant(user_id) {
        return Err(ServiceError::NotFound(format!(
            "user `{user_id}` is not in room `{room_id}`"
        )));
    }

    let role = match rooms.player_room(user_id).await? {
        Some(bound) if bound == room_id => rooms.player_role(user_id).await?,
        _ => None,
    };
    Ok(PlayerInfo {
        room_id: room.id.clone(),
        user_id: user_id.to_string(),
        role,
        assigned_word: role.map(|role| room.word_for(role).to_string()),
        eliminated: room.is_eliminated(user_id),
    })
}

/// De-duplicated list of users with at least one live channel.
pub fn list_online(state: &SharedState) -> Vec<UserProfile> {
    state.connections().list_online()
}

/// Project a room into its public view, resolving display names through the user directory.
pub async fn room_view(state: &SharedState, room: &Room) -> RoomView {
    let participants = join_all(room.participant_ids.iter().map(|user_id| async move {
        ParticipantView::new(state.profile(user_id).await, room.is_eliminated(user_id))
    }))
    .await;
    let creator = ParticipantView::new(state.profile(&room.creator_id).await, false);

    RoomView {
        id: room.id.clone(),
        status: room.status,
        creator,
        participants,
        eliminated_ids: room.eliminated_ids.iter().cloned().collect(),
        round: room.round,
        phase: PhaseView::from(&room.phase),
        duration_secs: room.duration.as_secs(),
        created_at: format_system_time(room.created_at),
        start_time: room.start_time.map(format_system_time),
        remaining: (room.status != RoomStatus::Waiting).then(|| room.remaining()),
    }
}
