//! Typed load/save of the [`Room`] aggregate and its satellite keys.
//!
//! Every write refreshes the TTL so an abandoned room and its ephemeral keys expire together.
//! The store itself is last-writer-wins; callers serialize writers with the per-room lock.

use std::{sync::Arc, time::Duration};

use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, error};
use uuid::Uuid;

use crate::{
    dao::{
        keys,
        kv_store::KeyValueStore,
        models::{RoomEntity, VoteCounterEntity},
        storage::{StorageError, StorageResult},
    },
    state::{
        room::{Role, Room},
        state_machine::{VoteCount, VoteTally},
    },
};

/// Typed access to rooms and their satellite keys.
#[derive(Clone)]
pub struct RoomStore {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl RoomStore {
    /// Store over `store`; every write expires after `ttl`.
    pub fn new(store: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Expiry applied to every room key.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Persist a new room under a freshly generated opaque id and return that id.
    pub async fn create(&self, room: Room) -> StorageResult<String> {
        loop {
            let id = Uuid::new_v4().simple().to_string();
            let room = Room {
                id: id.clone(),
                ..room.clone()
            };
            let payload = encode(&keys::room_key(&id), &RoomEntity::from(&room))?;
            if self
                .store
                .set_if_absent(&keys::room_key(&id), payload, self.ttl)
                .await?
            {
                return Ok(id);
            }
            debug!(room_id = %id, "room id collision; generating another");
        }
    }

    /// Load a room. A missing or expired room is `Ok(None)`; a blob that does not decode is a
    /// [`StorageError::Serialization`].
    pub async fn load(&self, room_id: &str) -> StorageResult<Option<Room>> {
        let key = keys::room_key(room_id);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let entity: RoomEntity = decode(&key, &raw)?;
        let room = Room::try_from(entity).map_err(|reason| {
            error!(room_id, %reason, "stored room violates its schema");
            StorageError::serialization(&key, reason)
        })?;
        Ok(Some(room))
    }

    /// Whether the room blob is still live.
    pub async fn exists(&self, room_id: &str) -> StorageResult<bool> {
        self.store.exists(&keys::room_key(room_id)).await
    }

    /// Overwrite the room blob and refresh the TTL of every key tied to it.
    pub async fn save(&self, room: &Room) -> StorageResult<()> {
        let key = keys::room_key(&room.id);
        let payload = encode(&key, &RoomEntity::from(room))?;
        self.store.set(&key, payload, Some(self.ttl)).await?;

        for user_id in &room.participant_ids {
            self.store
                .expire(&keys::player_room_key(user_id), self.ttl)
                .await?;
            self.store
                .expire(&keys::player_role_key(user_id), self.ttl)
                .await?;
        }
        Ok(())
    }

    /// Remove a room together with every satellite key that references it.
    pub async fn delete(&self, room_id: &str) -> StorageResult<()> {
        self.clear_ephemeral(room_id).await?;
        self.store.delete(&keys::room_key(room_id)).await?;
        self.clear_active_room(room_id).await?;
        Ok(())
    }

    /// Drop vote counters and per-player keys of a room, leaving the room blob in place.
    pub async fn clear_ephemeral(&self, room_id: &str) -> StorageResult<()> {
        let cleared_votes = self.clear_votes(room_id).await?;

        let mut released_players = 0usize;
        for (key, value) in self.store.scan_prefix("player:").await? {
            let Some(user_id) = keys::user_from_player_room_key(&key) else {
                continue;
            };
            if value != room_id {
                continue;
            }
            self.store.delete(&keys::player_role_key(user_id)).await?;
            self.store.delete_if_equals(&key, room_id).await?;
            released_players += 1;
        }

        debug!(room_id, cleared_votes, released_players, "cleared ephemeral room keys");
        Ok(())
    }

    /// Record that `user_id` belongs to `room_id`.
    pub async fn bind_player(&self, user_id: &str, room_id: &str) -> StorageResult<()> {
        self.store
            .set(
                &keys::player_room_key(user_id),
                room_id.to_string(),
                Some(self.ttl),
            )
            .await
    }

    /// Room `user_id` is currently bound to.
    pub async fn player_room(&self, user_id: &str) -> StorageResult<Option<String>> {
        self.store.get(&keys::player_room_key(user_id)).await
    }

    /// Store the role of every participant so it can be looked up by user id alone.
    pub async fn write_player_roles(&self, room: &Room) -> StorageResult<()> {
        for user_id in &room.participant_ids {
            let Some(role) = room.role_of(user_id) else {
                continue;
            };
            self.store
                .set(
                    &keys::player_role_key(user_id),
                    role.as_str().to_string(),
                    Some(self.ttl),
                )
                .await?;
            self.bind_player(user_id, &room.id).await?;
        }
        Ok(())
    }

    /// Role stored for `user_id` in their current room.
    pub async fn player_role(&self, user_id: &str) -> StorageResult<Option<Role>> {
        let key = keys::player_role_key(user_id);
        match self.store.get(&key).await? {
            Some(raw) => Role::parse(&raw)
                .map(Some)
                .ok_or_else(|| StorageError::serialization(&key, format!("unknown role `{raw}`"))),
            None => Ok(None),
        }
    }

    /// Rebuild the current round's tally from the per-target counters of active players.
    pub async fn load_tally(&self, room: &Room) -> StorageResult<VoteTally> {
        let mut counts = Vec::new();
        for user_id in room.active_participants() {
            let key = keys::votes_key(&room.id, &user_id);
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            let entity: VoteCounterEntity = decode(&key, &raw)?;
            let count =
                VoteCount::try_from(entity).map_err(|reason| StorageError::serialization(&key, reason))?;
            counts.push((user_id, count));
        }
        Ok(VoteTally::from_counts(counts, room.voted_ids.len() as u64))
    }

    /// Persist the counter of `target_id` for the current round.
    pub async fn save_vote_count(
        &self,
        room_id: &str,
        target_id: &str,
        count: VoteCount,
    ) -> StorageResult<()> {
        let key = keys::votes_key(room_id, target_id);
        let payload = encode(&key, &VoteCounterEntity::from(count))?;
        self.store.set(&key, payload, Some(self.ttl)).await
    }

    /// Delete every vote counter of a room; returns how many were removed.
    pub async fn clear_votes(&self, room_id: &str) -> StorageResult<usize> {
        let mut removed = 0;
        for (key, _) in self.store.scan_prefix(&keys::votes_prefix(room_id)).await? {
            if self.store.delete(&key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Id the `activeRoom` pointer holds.
    pub async fn active_room_id(&self) -> StorageResult<Option<String>> {
        self.store.get(keys::ACTIVE_ROOM_KEY).await
    }

    /// Point `activeRoom` at `room_id` unless another room already holds it.
    pub async fn claim_active_room(&self, room_id: &str) -> StorageResult<bool> {
        self.store
            .set_if_absent(keys::ACTIVE_ROOM_KEY, room_id.to_string(), self.ttl)
            .await
    }

    /// Push back the expiry of the `activeRoom` pointer.
    pub async fn refresh_active_room(&self) -> StorageResult<bool> {
        self.store.expire(keys::ACTIVE_ROOM_KEY, self.ttl).await
    }

    /// Clear `activeRoom` when it still points at `room_id`.
    pub async fn clear_active_room(&self, room_id: &str) -> StorageResult<bool> {
        self.store
            .delete_if_equals(keys::ACTIVE_ROOM_KEY, room_id)
            .await
    }
}

fn encode<T: Serialize>(key: &str, value: &T) -> StorageResult<String> {
    serde_json::to_string(value).map_err(|err| StorageError::serialization(key, err))
}

fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> StorageResult<T> {
    serde_json::from_str(raw).map_err(|err| {
        error!(key, error = %err, "failed to decode stored value");
        StorageError::serialization(key, err)
    })
}
