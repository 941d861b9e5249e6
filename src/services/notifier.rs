//! Fan-out of outbound messages to live channels.
//!
//! Delivery only enqueues onto each channel's writer queue, so one slow or dead channel never
//! holds up the others. Channels whose writer has gone away are pruned from the registry as
//! they are discovered; when that removes a user's last channel an offline event goes out.

use std::sync::Arc;

use axum::extract::ws::Message;
use tracing::{debug, warn};

use crate::{
    dto::ws::OutboundMessage,
    state::connections::{ChannelId, ChannelSender, ConnectionRegistry},
};

/// Delivers outbound messages to the channels of the registry.
pub struct Notifier {
    connections: Arc<ConnectionRegistry>,
}

impl Notifier {
    /// Notifier over `connections`.
    pub fn new(connections: Arc<ConnectionRegistry>) -> Self {
        Self { connections }
    }

    /// Deliver `message` to every channel except those owned by `exclude_user`.
    /// Returns how many channels accepted it.
    pub fn broadcast_all(&self, message: &OutboundMessage, exclude_user: Option<&str>) -> usize {
        let Some(frame) = encode(message) else {
            return 0;
        };
        let targets = self.connections.channels_except(exclude_user);
        let delivered = self.deliver(&targets, &frame);
        debug!(kind = message.kind(), delivered, "broadcast delivered");
        delivered
    }

    /// Deliver `message` to every channel of `user_id`. A user without channels is not an error.
    pub fn send_to_user(&self, user_id: &str, message: &OutboundMessage) -> usize {
        let targets = self.connections.channels_for(user_id);
        if targets.is_empty() {
            debug!(user_id, kind = message.kind(), "user has no live channel; message dropped");
            return 0;
        }
        let Some(frame) = encode(message) else {
            return 0;
        };
        self.deliver(&targets, &frame)
    }

    fn deliver(&self, targets: &[(ChannelId, ChannelSender)], frame: &Message) -> usize {
        let mut dead = Vec::new();
        let mut delivered = 0;
        for (channel, tx) in targets {
            if tx.send(frame.clone()).is_ok() {
                delivered += 1;
            } else {
                dead.push(*channel);
            }
        }
        if !dead.is_empty() {
            self.prune(dead);
        }
        delivered
    }

    fn prune(&self, mut dead: Vec<ChannelId>) {
        while let Some(channel) = dead.pop() {
            warn!(%channel, "channel writer closed; unregistering");
            let Some(profile) = self.connections.unregister(channel) else {
                continue;
            };
            let user_id = profile.user_id.clone();
            let Some(frame) = encode(&OutboundMessage::Offline(profile)) else {
                continue;
            };
            for (other, tx) in self.connections.channels_except(Some(&user_id)) {
                if tx.send(frame.clone()).is_err() {
                    dead.push(other);
                }
            }
        }
    }
}

fn encode(message: &OutboundMessage) -> Option<Message> {
    match serde_json::to_string(message) {
        Ok(payload) => Some(Message::Text(payload.into())),
        Err(err) => {
            warn!(kind = message.kind(), error = %err, "failed to serialize outbound message");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::*;
    use crate::dao::users::UserProfile;

    fn profile(user_id: &str) -> UserProfile {
        UserProfile::placeholder(user_id)
    }

    fn connect(
        registry: &ConnectionRegistry,
        user_id: &str,
    ) -> (ChannelId, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Uuid::new_v4();
        registry.register(channel, tx, profile(user_id));
        (channel, rx)
    }

    fn kinds(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<String> {
        let mut kinds = Vec::new();
        while let Ok(Message::Text(text)) = rx.try_recv() {
            let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
            kinds.push(value["type"].as_str().unwrap().to_string());
        }
        kinds
    }

    #[test]
    fn broadcast_skips_excluded_user_on_every_channel() {
        let registry = Arc::new(ConnectionRegistry::new());
        let notifier = Notifier::new(registry.clone());
        let (_, mut a1) = connect(&registry, "a");
        let (_, mut a2) = connect(&registry, "a");
        let (_, mut b) = connect(&registry, "b");

        assert_eq!(notifier.broadcast_all(&OutboundMessage::RoomRefresh, Some("a")), 1);
        assert!(kinds(&mut a1).is_empty());
        assert!(kinds(&mut a2).is_empty());
        assert_eq!(kinds(&mut b), vec!["room_refresh"]);
    }

    #[test]
    fn send_to_user_reaches_all_of_their_channels() {
        let registry = Arc::new(ConnectionRegistry::new());
        let notifier = Notifier::new(registry.clone());
        let (_, mut a1) = connect(&registry, "a");
        let (_, mut a2) = connect(&registry, "a");

        assert_eq!(notifier.send_to_user("a", &OutboundMessage::RoomRefresh), 2);
        assert_eq!(notifier.send_to_user("nobody", &OutboundMessage::RoomRefresh), 0);
        assert_eq!(kinds(&mut a1).len(), 1);
        assert_eq!(kinds(&mut a2).len(), 1);
    }

    #[test]
    fn dead_channels_are_pruned_and_announced_offline() {
        let registry = Arc::new(ConnectionRegistry::new());
        let notifier = Notifier::new(registry.clone());
        let (dead_channel, dead_rx) = connect(&registry, "gone");
        let (_, mut alive) = connect(&registry, "alive");
        drop(dead_rx);

        assert_eq!(notifier.broadcast_all(&OutboundMessage::RoomRefresh, None), 1);
        assert!(registry.user_of(dead_channel).is_none());
        assert!(!registry.is_online("gone"));
        assert_eq!(kinds(&mut alive), vec!["room_refresh", "offline"]);
    }
}
