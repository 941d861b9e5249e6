//! Registry of live transport channels and the logical users behind them.
//!
//! One user may hold several channels (tabs, devices). Presence transitions are reported only
//! on the first channel of a user and on the removal of their last one. The per-user channel
//! set is modified under the map's entry lock so concurrent register/unregister calls cannot
//! both observe the same transition.

use axum::extract::ws::Message;
use dashmap::{DashMap, mapref::entry::Entry};
use indexmap::IndexSet;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::dao::users::UserProfile;

/// Identity of one live transport connection.
pub type ChannelId = Uuid;

/// Outbound queue of a channel; a dedicated writer task drains it in order.
pub type ChannelSender = mpsc::UnboundedSender<Message>;

struct ChannelEntry {
    user_id: String,
    tx: ChannelSender,
}

struct Presence {
    profile: UserProfile,
    channels: IndexSet<ChannelId>,
}

/// Presence transitions caused by [`ConnectionRegistry::register`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registration {
    /// The channel is the user's first live one; an online event should be broadcast.
    pub first_channel: bool,
    /// Previous owner of a reused channel id, when that was their last channel.
    pub displaced: Option<UserProfile>,
}

/// Live channels keyed by id, and the users behind them.
#[derive(Default)]
pub struct ConnectionRegistry {
    channels: DashMap<ChannelId, ChannelEntry>,
    users: DashMap<String, Presence>,
}

impl ConnectionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `channel` to the profile's user.
    pub fn register(
        &self,
        channel: ChannelId,
        tx: ChannelSender,
        profile: UserProfile,
    ) -> Registration {
        let user_id = profile.user_id.clone();
        let mut presence = self.users.entry(user_id.clone()).or_insert_with(|| Presence {
            profile: profile.clone(),
            channels: IndexSet::new(),
        });
        let first = presence.channels.is_empty();
        let added = presence.channels.insert(channel);
        presence.profile = profile;
        // Published while the user entry is held: a concurrent unregister sees both or neither.
        let previous = self.channels.insert(
            channel,
            ChannelEntry {
                user_id: user_id.clone(),
                tx,
            },
        );
        let channel_count = presence.channels.len();
        drop(presence);

        let displaced = match previous {
            Some(previous) if previous.user_id != user_id => {
                debug!(%channel, from = %previous.user_id, to = %user_id, "channel reassigned");
                self.detach(&previous.user_id, channel)
            }
            _ => None,
        };

        debug!(%channel, user_id = %user_id, channel_count, "channel registered");
        let first_channel = first && added;
        if first_channel {
            info!(user_id = %user_id, "user online");
        }
        Registration {
            first_channel,
            displaced,
        }
    }

    /// Detach `channel`. Returns the user's profile when that was their last channel, i.e. when
    /// an offline event should be broadcast. Unknown channels are ignored.
    pub fn unregister(&self, channel: ChannelId) -> Option<UserProfile> {
        let (_, entry) = self.channels.remove(&channel)?;
        debug!(%channel, user_id = %entry.user_id, "channel unregistered");
        let offline = self.detach(&entry.user_id, channel);
        if offline.is_some() {
            info!(user_id = %entry.user_id, "user offline");
        }
        offline
    }

    fn detach(&self, user_id: &str, channel: ChannelId) -> Option<UserProfile> {
        match self.users.entry(user_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                occupied.get_mut().channels.shift_remove(&channel);
                if occupied.get().channels.is_empty() {
                    Some(occupied.remove().profile)
                } else {
                    None
                }
            }
            Entry::Vacant(_) => None,
        }
    }

    /// De-duplicated snapshot of every online user.
    pub fn list_online(&self) -> Vec<UserProfile> {
        self.users
            .iter()
            .map(|presence| presence.profile.clone())
            .collect()
    }

    /// Whether `user_id` holds at least one channel.
    pub fn is_online(&self, user_id: &str) -> bool {
        self.users.contains_key(user_id)
    }

    /// Live channels of `user_id`; empty when the user is offline.
    pub fn channels_for(&self, user_id: &str) -> Vec<(ChannelId, ChannelSender)> {
        let ids = self
            .users
            .get(user_id)
            .map(|presence| presence.channels.iter().copied().collect::<Vec<_>>())
            .unwrap_or_default();
        ids.into_iter()
            .filter_map(|id| self.channels.get(&id).map(|entry| (id, entry.tx.clone())))
            .collect()
    }

    /// Every live channel except those owned by `exclude_user`.
    pub fn channels_except(&self, exclude_user: Option<&str>) -> Vec<(ChannelId, ChannelSender)> {
        self.channels
            .iter()
            .filter(|entry| exclude_user != Some(entry.user_id.as_str()))
            .map(|entry| (*entry.key(), entry.tx.clone()))
            .collect()
    }

    /// User owning `channel`.
    pub fn user_of(&self, channel: ChannelId) -> Option<String> {
        self.channels.get(&channel).map(|entry| entry.user_id.clone())
    }

    /// Live channels across all users.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn profile(user_id: &str) -> UserProfile {
        UserProfile {
            user_id: user_id.into(),
            display_name: user_id.to_uppercase(),
            avatar: None,
            role: "player".into(),
        }
    }

    fn sender() -> ChannelSender {
        mpsc::unbounded_channel().0
    }

    #[test]
    fn three_channels_yield_one_online_and_one_offline() {
        let registry = ConnectionRegistry::new();
        let channels = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];

        let online = channels
            .iter()
            .filter(|channel| {
                registry
                    .register(**channel, sender(), profile("alice"))
                    .first_channel
            })
            .count();
        assert_eq!(online, 1);
        assert_eq!(registry.list_online().len(), 1);
        assert_eq!(registry.channels_for("alice").len(), 3);

        let offline = [channels[1], channels[2], channels[0]]
            .into_iter()
            .filter_map(|channel| registry.unregister(channel))
            .collect::<Vec<_>>();
        assert_eq!(offline.len(), 1);
        assert_eq!(offline[0].user_id, "alice");
        assert!(registry.list_online().is_empty());
        assert_eq!(registry.channel_count(), 0);
    }

    #[test]
    fn registering_same_channel_twice_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let channel = Uuid::new_v4();
        assert!(registry.register(channel, sender(), profile("bob")).first_channel);
        assert!(!registry.register(channel, sender(), profile("bob")).first_channel);
        assert_eq!(registry.channels_for("bob").len(), 1);
        assert!(registry.unregister(channel).is_some());
    }

    #[test]
    fn unknown_channels_and_users_are_noops() {
        let registry = ConnectionRegistry::new();
        assert!(registry.unregister(Uuid::new_v4()).is_none());
        assert!(registry.channels_for("ghost").is_empty());
        assert!(!registry.is_online("ghost"));
    }

    #[test]
    fn reassigned_channel_moves_to_new_user() {
        let registry = ConnectionRegistry::new();
        let channel = Uuid::new_v4();
        registry.register(channel, sender(), profile("a"));
        let registration = registry.register(channel, sender(), profile("b"));
        assert!(registration.first_channel);
        assert_eq!(registration.displaced.map(|p| p.user_id).as_deref(), Some("a"));

        assert!(!registry.is_online("a"));
        assert_eq!(registry.user_of(channel).as_deref(), Some("b"));
    }

    #[test]
    fn channels_except_skips_excluded_user() {
        let registry = ConnectionRegistry::new();
        registry.register(Uuid::new_v4(), sender(), profile("a"));
        registry.register(Uuid::new_v4(), sender(), profile("a"));
        registry.register(Uuid::new_v4(), sender(), profile("b"));

        assert_eq!(registry.channels_except(None).len(), 3);
        assert_eq!(registry.channels_except(Some("a")).len(), 1);
    }

    #[test]
    fn concurrent_churn_leaves_no_leaked_channels() {
        let registry = Arc::new(ConnectionRegistry::new());
        let handles = (0..8)
            .map(|worker| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let mut transitions = 0i32;
                    for _ in 0..200 {
                        let channel = Uuid::new_v4();
                        let user = format!("user{}", worker % 2);
                        if registry.register(channel, sender(), profile(&user)).first_channel {
                            transitions += 1;
                        }
                        if registry.unregister(channel).is_some() {
                            transitions -= 1;
                        }
                    }
                    transitions
                })
            })
            .collect::<Vec<_>>();

        let balance: i32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(balance, 0);
        assert_eq!(registry.channel_count(), 0);
        assert!(registry.list_online().is_empty());
    }

    #[test]
    fn racing_register_and_unregister_of_one_channel_never_leaks() {
        let registry = Arc::new(ConnectionRegistry::new());
        for _ in 0..200 {
            let channel = Uuid::new_v4();
            let registering = {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    registry.register(channel, sender(), profile("racer"));
                })
            };
            let unregistering = {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    registry.unregister(channel);
                })
            };
            registering.join().unwrap();
            unregistering.join().unwrap();

            // Whichever order the threads ran in, a final unregister leaves nothing behind.
            registry.unregister(channel);
            assert!(!registry.is_online("racer"));
            assert_eq!(registry.channel_count(), 0);
        }
    }
}
