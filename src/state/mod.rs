/// Live channels and presence.
pub mod connections;
/// Room aggregate.
pub mod room;
/// Pure game rules.
pub mod state_machine;

use std::{future::Future, sync::Arc};

use dashmap::DashMap;
use tokio::{runtime::Handle, task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    config::AppConfig,
    dao::{
        keys,
        kv_store::KeyValueStore,
        lock::DistributedLock,
        room_store::RoomStore,
        users::{UserDirectory, UserProfile, resolve_profile},
    },
    error::ServiceError,
    services::notifier::Notifier,
};

pub use self::connections::ConnectionRegistry;

/// Handle to the application state shared by every request and flow.
pub type SharedState = Arc<AppState>;

/// Handle on the background flow currently driving a room.
struct PhaseFlow {
    id: Uuid,
    token: CancellationToken,
}

/// Central application state: storage handles, live connections and running phase flows.
pub struct AppState {
    config: Arc<AppConfig>,
    store: Arc<dyn KeyValueStore>,
    rooms: RoomStore,
    lock: DistributedLock,
    users: Arc<dyn UserDirectory>,
    connections: Arc<ConnectionRegistry>,
    notifier: Notifier,
    phases: DashMap<String, PhaseFlow>,
    phase_lane: Handle,
}

impl AppState {
    /// Construct a new [`AppState`] wrapped in an [`Arc`] so it can be cloned cheaply.
    ///
    /// Phase flows are spawned on `phase_lane`, which should be a runtime separate from the one
    /// serving requests.
    pub fn new(
        config: AppConfig,
        store: Arc<dyn KeyValueStore>,
        users: Arc<dyn UserDirectory>,
        phase_lane: Handle,
    ) -> SharedState {
        let connections = Arc::new(ConnectionRegistry::new());
        Arc::new(Self {
            rooms: RoomStore::new(store.clone(), config.room_ttl()),
            lock: DistributedLock::new(store.clone(), config.lock_settings()),
            config: Arc::new(config),
            store,
            users,
            notifier: Notifier::new(connections.clone()),
            connections,
            phases: DashMap::new(),
            phase_lane,
        })
    }

    /// Active configuration.
    pub fn config(&self) -> Arc<AppConfig> {
        self.config.clone()
    }

    /// Raw key/value backend, used for health checks.
    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// Typed room persistence.
    pub fn rooms(&self) -> &RoomStore {
        &self.rooms
    }

    /// Live channel registry.
    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    /// Outbound fan-out.
    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Resolve a user's public profile, falling back to a placeholder.
    pub async fn profile(&self, user_id: &str) -> UserProfile {
        resolve_profile(self.users.as_ref(), user_id).await
    }

    /// Run `work` while holding the lock of `room_id`.
    ///
    /// Fails fast with [`ServiceError::Busy`] when the lock cannot be taken within the wait
    /// budget. Once started, `work` always runs to completion; a section that outlives the
    /// lease is only reported.
    pub async fn with_room_lock<F, Fut, T>(&self, room_id: &str, work: F) -> Result<T, ServiceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let Some(guard) = self.lock.try_acquire(&keys::room_lock_name(room_id)).await? else {
            warn!(room_id, "room lock contended; rejecting as busy");
            return Err(ServiceError::Busy(room_id.to_string()));
        };

        let hold = self.lock.settings().hold;
        let work = work();
        tokio::pin!(work);
        let finished = tokio::select! {
            result = &mut work => Some(result),
            _ = sleep(hold) => None,
        };
        let outcome = match finished {
            Some(result) => result,
            None => {
                warn!(
                    room_id,
                    hold_ms = hold.as_millis() as u64,
                    "room critical section outlived its lock lease; letting it finish"
                );
                work.await
            }
        };

        let held_ms = guard.held_for().as_millis() as u64;
        match guard.release().await {
            Ok(true) => debug!(room_id, held_ms, "room lock released"),
            Ok(false) => warn!(room_id, held_ms, "room lock lease expired before release"),
            Err(err) => warn!(room_id, error = %err, "failed to release room lock"),
        }
        outcome
    }

    /// Register a new phase flow for `room_id`, cancelling any flow already bound to it.
    pub fn register_phase_flow(&self, room_id: &str) -> (Uuid, CancellationToken) {
        let id = Uuid::new_v4();
        let token = CancellationToken::new();
        let previous = self.phases.insert(
            room_id.to_string(),
            PhaseFlow {
                id,
                token: token.clone(),
            },
        );
        if let Some(previous) = previous {
            debug!(room_id, flow = %previous.id, "replacing running phase flow");
            previous.token.cancel();
        }
        (id, token)
    }

    /// Cancel the flow driving `room_id`. Returns `false` when none was running.
    pub fn cancel_phase_flow(&self, room_id: &str) -> bool {
        match self.phases.remove(room_id) {
            Some((_, flow)) => {
                debug!(room_id, flow = %flow.id, "cancelling phase flow");
                flow.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Forget the registration of flow `id` once it has finished on its own.
    pub fn release_phase_flow(&self, room_id: &str, id: Uuid) {
        self.phases.remove_if(room_id, |_, flow| flow.id == id);
    }

    /// Whether a phase flow is registered for `room_id`.
    pub fn has_phase_flow(&self, room_id: &str) -> bool {
        self.phases.contains_key(room_id)
    }

    /// Cancel every running flow, used on shutdown.
    pub fn cancel_all_phase_flows(&self) -> usize {
        let room_ids = self
            .phases
            .iter()
            .map(|entry| entry.key().clone())
            .collect::<Vec<_>>();
        room_ids
            .iter()
            .filter(|room_id| self.cancel_phase_flow(room_id))
            .count()
    }

    /// Spawn a future on the phase lane.
    pub fn spawn_phase<F>(&self, flow: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.phase_lane.spawn(flow)
    }
}
