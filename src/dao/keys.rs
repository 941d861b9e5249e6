//! Logical key layout shared by every store backend.

/// Singleton pointer to the one room currently open for play.
pub const ACTIVE_ROOM_KEY: &str = "activeRoom";

/// Key of the room blob.
pub fn room_key(room_id: &str) -> String {
    format!("room:{room_id}")
}

/// Prefix shared by every vote counter of a room.
pub fn votes_prefix(room_id: &str) -> String {
    format!("room:{room_id}:votes:")
}

/// Vote counter of `user_id` in a room.
pub fn votes_key(room_id: &str, user_id: &str) -> String {
    format!("{}{user_id}", votes_prefix(room_id))
}

/// Secret role of a player in their current room.
pub fn player_role_key(user_id: &str) -> String {
    format!("player:{user_id}:role")
}

/// Room a player currently belongs to.
pub fn player_room_key(user_id: &str) -> String {
    format!("player:{user_id}:room")
}

/// Lock name guarding every read-modify-write of a room.
pub fn room_lock_name(room_id: &str) -> String {
    format!("room:{room_id}")
}

/// Extract the user id from a `player:{user_id}:room` key.
pub fn user_from_player_room_key(key: &str) -> Option<&str> {
    key.strip_prefix("player:")?.strip_suffix(":room")
}
