use std::{sync::Arc, time::Duration};

use axum::extract::ws::Message;
use futures::{FutureExt, future::BoxFuture};
use serde_json::{Value, json};
use tokio::{runtime::Handle, sync::mpsc, time::sleep};
use undercover_back::{
    config::AppConfig,
    dao::{
        keys,
        kv_store::{KeyValueStore, memory::MemoryStore},
        storage::StorageResult,
        users::{MemoryUserDirectory, UserProfile},
    },
    dto::room::{CreateRoomRequest, JoinRoomRequest},
    error::ServiceError,
    services::{
        room_events,
        room_service::{self, Actor},
    },
    state::{
        AppState, SharedState,
        room::{Role, Room, RoomStatus},
    },
};
use uuid::Uuid;

const PLAYERS: [&str; 5] = ["p1", "p2", "p3", "p4", "p5"];

fn profile(user_id: &str) -> UserProfile {
    UserProfile {
        user_id: user_id.into(),
        display_name: format!("Player {user_id}"),
        avatar: None,
        role: "player".into(),
    }
}

fn state_on(config: AppConfig, store: Arc<dyn KeyValueStore>) -> SharedState {
    let users = MemoryUserDirectory::new(PLAYERS.iter().map(|user_id| profile(user_id)));
    AppState::new(config, store, Arc::new(users), Handle::current())
}

fn state_with(config: AppConfig) -> SharedState {
    state_on(config, Arc::new(MemoryStore::new()))
}

fn state() -> SharedState {
    state_with(AppConfig::default())
}

async fn open_room(state: &SharedState, players: &[&str]) -> String {
    let created = room_service::create_room(
        state,
        &Actor::admin(),
        CreateRoomRequest {
            civilian_word: "apple".into(),
            undercover_word: "pear".into(),
            duration: 3600,
        },
    )
    .await
    .unwrap();
    for player in players {
        let joined = room_service::join_room(
            state,
            &Actor::user(*player),
            &created.room_id,
            JoinRoomRequest::default(),
        )
        .await
        .unwrap();
        assert!(joined);
    }
    created.room_id
}

async fn load(state: &SharedState, room_id: &str) -> Room {
    state.rooms().load(room_id).await.unwrap().expect("room exists")
}

fn listen(state: &SharedState, user_id: &str) -> mpsc::UnboundedReceiver<Message> {
    let (tx, rx) = mpsc::unbounded_channel();
    state.connections().register(Uuid::new_v4(), tx, profile(user_id));
    rx
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Value> {
    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        if let Message::Text(text) = message {
            messages.push(serde_json::from_str(text.as_str()).unwrap());
        }
    }
    messages
}

fn of_type<'a>(messages: &'a [Value], kind: &str) -> Vec<&'a Value> {
    messages.iter().filter(|message| message["type"] == kind).collect()
}

#[tokio::test(start_paused = true)]
async fn five_player_game_ends_when_the_undercover_is_voted_out() {
    let state = state();
    let room_id = open_room(&state, &PLAYERS).await;
    let mut inbox = listen(&state, "p1");

    assert!(room_service::start_game(&state, &Actor::admin(), &room_id).await.unwrap());
    let room = load(&state, &room_id).await;
    assert_eq!(room.status, RoomStatus::Playing);
    assert_eq!(room.undercover_ids.len(), 1);
    assert_eq!(room.civilian_ids.len(), 4);
    let undercover = room.undercover_ids[0].clone();
    let civilians = room.civilian_ids.iter().cloned().collect::<Vec<_>>();

    // Five speaking slots of 20s each, then the ballot box opens.
    sleep(Duration::from_secs(101)).await;
    let room = load(&state, &room_id).await;
    assert_eq!(room.round, 1);
    assert!(room.is_voting_open());

    for voter in civilians.iter().take(3) {
        room_service::cast_vote(&state, voter, &room_id, &undercover)
            .await
            .unwrap();
    }

    sleep(Duration::from_secs(30)).await;
    let room = load(&state, &room_id).await;
    assert_eq!(room.status, RoomStatus::Ended);
    assert_eq!(room.eliminated_ids.iter().collect::<Vec<_>>(), vec![&undercover]);
    assert!(!state.has_phase_flow(&room_id));
    assert!(state.rooms().active_room_id().await.unwrap().is_none());
    for player in PLAYERS {
        assert!(state.rooms().player_role(player).await.unwrap().is_none());
    }

    let messages = drain(&mut inbox);
    assert_eq!(of_type(&messages, "speaking_announcement").len(), 5);
    assert_eq!(of_type(&messages, "voting_open").len(), 1);
    let results = of_type(&messages, "round_result");
    assert_eq!(results.len(), 1);
    let payload = &results[0]["payload"];
    assert_eq!(
        payload["outcome"],
        json!({ "kind": "decided", "condition": "CIVILIANS_WIN" })
    );
    assert_eq!(payload["eliminated_id"], undercover.as_str());
    assert_eq!(payload["words"]["civilian_word"], "apple");
    assert_eq!(payload["words"]["undercover_word"], "pear");
}

#[tokio::test(start_paused = true)]
async fn round_without_ballots_is_voided_and_the_game_goes_on() {
    let state = state();
    let room_id = open_room(&state, &PLAYERS).await;
    let mut inbox = listen(&state, "p2");
    room_service::start_game(&state, &Actor::admin(), &room_id)
        .await
        .unwrap();

    sleep(Duration::from_secs(131)).await;
    let room = load(&state, &room_id).await;
    assert_eq!(room.status, RoomStatus::Playing);
    assert_eq!(room.round, 2);
    assert!(room.eliminated_ids.is_empty());

    let messages = drain(&mut inbox);
    let results = of_type(&messages, "round_result");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["payload"]["outcome"], json!({ "kind": "voided" }));
    assert!(results[0]["payload"].get("words").is_none());

    room_service::end_game(&state, &Actor::admin(), &room_id)
        .await
        .unwrap();
    assert!(!state.has_phase_flow(&room_id));
    assert_eq!(load(&state, &room_id).await.status, RoomStatus::Ended);
}

#[tokio::test(start_paused = true)]
async fn concurrent_resolution_applies_the_round_once() {
    let state = state();
    let room_id = open_room(&state, &PLAYERS).await;
    room_service::start_game(&state, &Actor::admin(), &room_id)
        .await
        .unwrap();
    sleep(Duration::from_secs(101)).await;

    // p4 is named first but p5 reaches two votes first.
    for (voter, target) in [("p1", "p4"), ("p2", "p5"), ("p3", "p5"), ("p5", "p4")] {
        room_service::cast_vote(&state, voter, &room_id, target)
            .await
            .unwrap();
    }

    let (first, second) = tokio::join!(
        room_service::resolve_round(&state, &room_id, 1),
        room_service::resolve_round(&state, &room_id, 1),
    );
    let reports = [first.unwrap(), second.unwrap()]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].resolution.eliminated.as_deref(), Some("p5"));

    let room = load(&state, &room_id).await;
    assert_eq!(room.eliminated_ids.len(), 1);
    assert!(room_service::resolve_round(&state, &room_id, 1)
        .await
        .unwrap()
        .is_none());

    // The flow's own resolution finds nothing left to do.
    sleep(Duration::from_secs(30)).await;
    let room = load(&state, &room_id).await;
    assert_eq!(room.eliminated_ids.len(), 1);
    if room.status == RoomStatus::Playing {
        assert_eq!(room.round, 2);
        room_service::end_game(&state, &Actor::admin(), &room_id)
            .await
            .unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn ended_rooms_reject_every_mutation() {
    let state = state();
    let room_id = open_room(&state, &PLAYERS[..3]).await;
    room_service::end_game(&state, &Actor::admin(), &room_id)
        .await
        .unwrap();
    let before = load(&state, &room_id).await;
    assert_eq!(before.status, RoomStatus::Ended);

    let admin = Actor::admin();
    let results = [
        room_service::join_room(&state, &Actor::user("p4"), &room_id, JoinRoomRequest::default())
            .await
            .map(|_| ()),
        room_service::start_game(&state, &admin, &room_id)
            .await
            .map(|_| ()),
        room_service::end_game(&state, &admin, &room_id)
            .await
            .map(|_| ()),
        room_service::eliminate_player(&state, &admin, &room_id, "p1")
            .await
            .map(|_| ()),
        room_service::cast_vote(&state, "p1", &room_id, "p2").await,
    ];
    for result in results {
        assert!(matches!(result, Err(ServiceError::InvalidState(_))), "{result:?}");
    }
    assert_eq!(load(&state, &room_id).await, before);

    // The finished room no longer blocks a new one.
    open_room(&state, &[]).await;
}

#[tokio::test(start_paused = true)]
async fn expired_room_stops_its_flow() {
    let state = state_with(AppConfig::default().with_room_ttl(Duration::from_secs(10)));
    let room_id = open_room(&state, &PLAYERS[..3]).await;
    room_service::start_game(&state, &Actor::admin(), &room_id)
        .await
        .unwrap();
    assert!(state.has_phase_flow(&room_id));

    sleep(Duration::from_secs(25)).await;
    assert!(state.rooms().load(&room_id).await.unwrap().is_none());
    assert!(!state.has_phase_flow(&room_id));
}

#[tokio::test(start_paused = true)]
async fn deleting_a_playing_room_cancels_its_flow() {
    let state = state();
    let room_id = open_room(&state, &PLAYERS[..3]).await;
    room_service::start_game(&state, &Actor::admin(), &room_id)
        .await
        .unwrap();
    sleep(Duration::from_secs(5)).await;

    assert!(room_service::delete_room(&state, &Actor::admin(), &room_id).await.unwrap());
    assert!(!state.has_phase_flow(&room_id));

    sleep(Duration::from_secs(120)).await;
    let rooms = state.rooms();
    assert!(rooms.load(&room_id).await.unwrap().is_none());
    assert!(rooms.active_room_id().await.unwrap().is_none());
    assert!(rooms.player_room("p1").await.unwrap().is_none());
    assert!(rooms.player_role("p1").await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn room_management_is_restricted() {
    let state = state();
    let request = || CreateRoomRequest {
        civilian_word: "apple".into(),
        undercover_word: "pear".into(),
        duration: 600,
    };
    assert!(matches!(
        room_service::create_room(&state, &Actor::user("p1"), request()).await,
        Err(ServiceError::Unauthorized(_))
    ));

    let room_id = open_room(&state, &PLAYERS[..2]).await;
    assert!(matches!(
        room_service::create_room(&state, &Actor::admin(), request()).await,
        Err(ServiceError::InvalidState(_))
    ));
    assert!(matches!(
        room_service::start_game(&state, &Actor::user("p1"), &room_id).await,
        Err(ServiceError::Unauthorized(_))
    ));
    assert!(matches!(
        room_service::start_game(&state, &Actor::admin(), &room_id).await,
        Err(ServiceError::InvalidState(_))
    ));
    assert!(matches!(
        room_service::join_room(
            &state,
            &Actor::user("p1"),
            &room_id,
            JoinRoomRequest {
                user_id: Some("p3".into())
            },
        )
        .await,
        Err(ServiceError::Unauthorized(_))
    ));
    assert!(!room_service::join_room(&state, &Actor::user("p1"), &room_id, JoinRoomRequest::default())
        .await
        .unwrap());
}

#[tokio::test(start_paused = true)]
async fn players_only_see_their_own_word() {
    let state = state();
    let room_id = open_room(&state, &PLAYERS).await;
    room_service::start_game(&state, &Actor::admin(), &room_id)
        .await
        .unwrap();

    let info = room_service::get_player_info(&state, &Actor::user("p1"), &room_id, "p1")
        .await
        .unwrap();
    let expected = match info.role {
        Some(Role::Undercover) => "pear",
        Some(Role::Civilian) => "apple",
        None => panic!("role missing"),
    };
    assert_eq!(info.assigned_word.as_deref(), Some(expected));
    assert!(!info.eliminated);

    assert!(matches!(
        room_service::get_player_info(&state, &Actor::user("p2"), &room_id, "p1").await,
        Err(ServiceError::Unauthorized(_))
    ));
    assert!(room_service::get_player_info(&state, &Actor::admin(), &room_id, "p1")
        .await
        .is_ok());

    let view = room_service::get_active_room(&state)
        .await
        .unwrap()
        .expect("active room");
    assert_eq!(view.participants.len(), 5);
    let body = serde_json::to_string(&view).unwrap();
    assert!(!body.contains("apple") && !body.contains("pear"));
}

#[tokio::test(start_paused = true)]
async fn ballots_are_validated() {
    let state = state();
    let room_id = open_room(&state, &PLAYERS[..3]).await;
    room_service::start_game(&state, &Actor::admin(), &room_id)
        .await
        .unwrap();

    assert!(matches!(
        room_service::cast_vote(&state, "p1", &room_id, "p2").await,
        Err(ServiceError::InvalidState(_))
    ));

    sleep(Duration::from_secs(61)).await;
    assert!(load(&state, &room_id).await.is_voting_open());
    assert!(matches!(
        room_service::cast_vote(&state, "p1", &room_id, "p1").await,
        Err(ServiceError::InvalidInput(_))
    ));
    assert!(matches!(
        room_service::cast_vote(&state, "p1", &room_id, "stranger").await,
        Err(ServiceError::InvalidInput(_))
    ));
    room_service::cast_vote(&state, "p1", &room_id, "p2")
        .await
        .unwrap();
    assert!(matches!(
        room_service::cast_vote(&state, "p1", &room_id, "p3").await,
        Err(ServiceError::InvalidState(_))
    ));
}

#[tokio::test]
async fn presence_is_announced_once_per_user() {
    let state = state();
    let mut observer = listen(&state, "bob");
    drain(&mut observer);

    let channels = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
    let mut tabs = Vec::new();
    for channel in channels {
        let (tx, rx) = mpsc::unbounded_channel();
        tabs.push(rx);
        if state
            .connections()
            .register(channel, tx, profile("alice"))
            .first_channel
        {
            room_events::broadcast_online(&state, profile("alice"));
        }
    }
    assert_eq!(room_service::list_online(&state).len(), 2);

    for channel in [channels[2], channels[0], channels[1]] {
        if let Some(profile) = state.connections().unregister(channel) {
            room_events::broadcast_offline(&state, profile);
        }
    }

    let messages = drain(&mut observer);
    assert_eq!(of_type(&messages, "online").len(), 1);
    assert_eq!(of_type(&messages, "offline").len(), 1);
    assert_eq!(room_service::list_online(&state).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn unreadable_room_is_cleaned_up_when_its_flow_fails() {
    let state = state();
    let room_id = open_room(&state, &PLAYERS).await;
    room_service::start_game(&state, &Actor::admin(), &room_id)
        .await
        .unwrap();

    sleep(Duration::from_secs(1)).await;
    state
        .store()
        .set(&keys::room_key(&room_id), "{corrupt".into(), None)
        .await
        .unwrap();
    sleep(Duration::from_secs(25)).await;

    assert!(!state.has_phase_flow(&room_id));
    let rooms = state.rooms();
    assert!(rooms.active_room_id().await.unwrap().is_none());
    for player in PLAYERS {
        assert!(rooms.player_role(player).await.unwrap().is_none());
        assert!(rooms.player_room(player).await.unwrap().is_none());
    }

    // Nothing is left pointing at the broken room.
    open_room(&state, &[]).await;
}

fn foreign_lock_key(room_id: &str) -> String {
    format!("lock:{}", keys::room_lock_name(room_id))
}

#[tokio::test(start_paused = true)]
async fn flow_waits_out_a_foreign_lock_lease() {
    let state = state();
    let room_id = open_room(&state, &PLAYERS).await;
    room_service::start_game(&state, &Actor::admin(), &room_id)
        .await
        .unwrap();

    sleep(Duration::from_secs(19)).await;
    let hold = state.config().lock_settings().hold;
    assert!(
        state
            .store()
            .set_if_absent(&foreign_lock_key(&room_id), "other".into(), hold)
            .await
            .unwrap()
    );

    sleep(Duration::from_secs(82)).await;
    let room = load(&state, &room_id).await;
    assert_eq!(room.status, RoomStatus::Playing);
    assert_eq!(room.round, 1);
    assert!(room.is_voting_open());
    assert!(state.has_phase_flow(&room_id));

    room_service::end_game(&state, &Actor::admin(), &room_id)
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn flow_that_never_gets_the_lock_releases_the_room() {
    let state = state();
    let room_id = open_room(&state, &PLAYERS[..3]).await;
    room_service::start_game(&state, &Actor::admin(), &room_id)
        .await
        .unwrap();

    sleep(Duration::from_secs(19)).await;
    state
        .store()
        .set_if_absent(&foreign_lock_key(&room_id), "other".into(), Duration::from_secs(600))
        .await
        .unwrap();
    sleep(Duration::from_secs(60)).await;

    assert!(!state.has_phase_flow(&room_id));
    let rooms = state.rooms();
    assert!(rooms.active_room_id().await.unwrap().is_none());
    assert!(rooms.player_role("p1").await.unwrap().is_none());
    open_room(&state, &[]).await;
}

/// Memory store whose deletes of player keys take longer than a lock lease.
#[derive(Clone)]
struct StallingStore {
    inner: MemoryStore,
    stall: Duration,
}

impl KeyValueStore for StallingStore {
    fn get(&self, key: &str) -> BoxFuture<'static, StorageResult<Option<String>>> {
        self.inner.get(key)
    }

    fn set(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> BoxFuture<'static, StorageResult<()>> {
        self.inner.set(key, value, ttl)
    }

    fn set_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        self.inner.set_if_absent(key, value, ttl)
    }

    fn delete(&self, key: &str) -> BoxFuture<'static, StorageResult<bool>> {
        let inner = self.inner.clone();
        let key = key.to_string();
        let stall = self.stall;
        async move {
            if key.starts_with("player:") {
                sleep(stall).await;
            }
            inner.delete(&key).await
        }
        .boxed()
    }

    fn delete_if_equals(
        &self,
        key: &str,
        expected: &str,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        self.inner.delete_if_equals(key, expected)
    }

    fn expire(&self, key: &str, ttl: Duration) -> BoxFuture<'static, StorageResult<bool>> {
        self.inner.expire(key, ttl)
    }

    fn exists(&self, key: &str) -> BoxFuture<'static, StorageResult<bool>> {
        self.inner.exists(key)
    }

    fn scan_prefix(&self, prefix: &str) -> BoxFuture<'static, StorageResult<Vec<(String, String)>>> {
        self.inner.scan_prefix(prefix)
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        self.inner.health_check()
    }
}

#[tokio::test(start_paused = true)]
async fn slow_cleanup_still_completes_after_the_lease_runs_out() {
    let config = AppConfig::default();
    let store = StallingStore {
        inner: MemoryStore::new(),
        stall: config.lock_settings().hold + Duration::from_secs(2),
    };
    let state = state_on(config, Arc::new(store));
    let room_id = open_room(&state, &PLAYERS[..3]).await;

    assert!(room_service::end_game(&state, &Actor::admin(), &room_id).await.unwrap());

    let rooms = state.rooms();
    assert_eq!(load(&state, &room_id).await.status, RoomStatus::Ended);
    assert!(rooms.active_room_id().await.unwrap().is_none());
    for player in &PLAYERS[..3] {
        assert!(rooms.player_room(player).await.unwrap().is_none());
    }
}
