//! Application-level configuration loading: room lifetime, phase windows, lock budgets and
//! the seed data for the in-memory user directory.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use serde_with::{DurationMilliSeconds, DurationSeconds, serde_as};
use tracing::{info, warn};

use crate::dao::users::UserProfile;

/// Default location on disk where the server looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/app.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "UNDERCOVER_BACK_CONFIG_PATH";
/// Environment variable that overrides the configured admin token.
const ADMIN_TOKEN_ENV: &str = "UNDERCOVER_ADMIN_TOKEN";

const DEFAULT_ROOM_TTL: Duration = Duration::from_secs(2 * 60 * 60);
const DEFAULT_SPEAKING_WINDOW: Duration = Duration::from_secs(20);
const DEFAULT_VOTING_WINDOW: Duration = Duration::from_secs(30);
const DEFAULT_LOCK_WAIT: Duration = Duration::from_millis(1_500);
const DEFAULT_LOCK_HOLD: Duration = Duration::from_secs(10);
const DEFAULT_LOCK_ATTEMPTS: u32 = 5;
const DEFAULT_LOCK_BACKOFF: Duration = Duration::from_millis(50);
const DEFAULT_PHASE_WORKERS: usize = 2;

/// Retry budget applied when acquiring a per-room lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSettings {
    /// Total time a caller is willing to wait before giving up with a busy error.
    pub wait: Duration,
    /// Expiry of a held lock, protecting against a crashed holder.
    pub hold: Duration,
    /// Maximum number of acquisition attempts inside the wait budget.
    pub attempts: u32,
    /// First pause between attempts; each further pause grows by the same step.
    pub backoff: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            wait: DEFAULT_LOCK_WAIT,
            hold: DEFAULT_LOCK_HOLD,
            attempts: DEFAULT_LOCK_ATTEMPTS,
            backoff: DEFAULT_LOCK_BACKOFF,
        }
    }
}

/// Durations driving the speaking and voting phases of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTimings {
    /// Time given to each active participant to describe their word.
    pub speaking_window: Duration,
    /// Time during which ballots are accepted once every participant has spoken.
    pub voting_window: Duration,
}

impl Default for PhaseTimings {
    fn default() -> Self {
        Self {
            speaking_window: DEFAULT_SPEAKING_WINDOW,
            voting_window: DEFAULT_VOTING_WINDOW,
        }
    }
}

#[derive(Debug, Clone)]
/// Immutable runtime configuration shared across the application.
pub struct AppConfig {
    room_ttl: Duration,
    phases: PhaseTimings,
    lock: LockSettings,
    phase_workers: usize,
    admin_token: Option<String>,
    users: Vec<UserProfile>,
}

impl AppConfig {
    /// Load the application configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        let config = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<RawConfig>(&contents) {
                Ok(raw) => {
                    let app_config: Self = raw.into();
                    info!(
                        path = %path.display(),
                        users = app_config.users.len(),
                        "loaded configuration"
                    );
                    app_config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        };

        match env::var(ADMIN_TOKEN_ENV) {
            Ok(token) if !token.is_empty() => config.with_admin_token(token),
            _ => config,
        }
    }

    /// Lifetime of a room and of every satellite key, refreshed on each mutation.
    pub fn room_ttl(&self) -> Duration {
        self.room_ttl
    }

    /// Speaking and voting windows.
    pub fn phase_timings(&self) -> PhaseTimings {
        self.phases
    }

    /// Per-room lock acquisition budget.
    pub fn lock_settings(&self) -> LockSettings {
        self.lock
    }

    /// Number of threads reserved for the phase lane runtime.
    pub fn phase_workers(&self) -> usize {
        self.phase_workers.max(1)
    }

    /// Shared secret granting admin rights, when configured.
    pub fn admin_token(&self) -> Option<&str> {
        self.admin_token.as_deref()
    }

    /// Profiles used to seed the in-memory user directory.
    pub fn users(&self) -> &[UserProfile] {
        &self.users
    }

    /// Replace the room TTL.
    pub fn with_room_ttl(mut self, ttl: Duration) -> Self {
        self.room_ttl = ttl;
        self
    }

    /// Replace the phase windows.
    pub fn with_phase_timings(mut self, phases: PhaseTimings) -> Self {
        self.phases = phases;
        self
    }

    /// Replace the lock budget.
    pub fn with_lock_settings(mut self, lock: LockSettings) -> Self {
        self.lock = lock;
        self
    }

    /// Replace the admin token.
    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        self.admin_token = Some(token.into());
        self
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            room_ttl: DEFAULT_ROOM_TTL,
            phases: PhaseTimings::default(),
            lock: LockSettings::default(),
            phase_workers: DEFAULT_PHASE_WORKERS,
            admin_token: None,
            users: Vec::new(),
        }
    }
}

#[serde_as]
#[derive(Debug, Deserialize)]
/// JSON representation of the configuration file located at [`DEFAULT_CONFIG_PATH`].
struct RawConfig {
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    #[serde(default)]
    room_ttl_secs: Option<Duration>,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    #[serde(default)]
    speaking_window_secs: Option<Duration>,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    #[serde(default)]
    voting_window_secs: Option<Duration>,
    #[serde(default)]
    lock: Option<RawLock>,
    #[serde(default)]
    phase_workers: Option<usize>,
    #[serde(default)]
    admin_token: Option<String>,
    #[serde(default)]
    users: Vec<RawUser>,
}

#[serde_as]
#[derive(Debug, Deserialize)]
/// Lock budget section of the configuration file.
struct RawLock {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    wait_ms: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    hold_ms: Duration,
    attempts: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    backoff_ms: Duration,
}

#[derive(Debug, Deserialize)]
/// Seed entry for the user directory.
struct RawUser {
    id: String,
    display_name: String,
    #[serde(default)]
    avatar: Option<String>,
    #[serde(default = "default_user_role")]
    role: String,
}

fn default_user_role() -> String {
    "player".into()
}

impl From<RawConfig> for AppConfig {
    fn from(value: RawConfig) -> Self {
        let defaults = AppConfig::default();
        Self {
            room_ttl: value.room_ttl_secs.unwrap_or(defaults.room_ttl),
            phases: PhaseTimings {
                speaking_window: value
                    .speaking_window_secs
                    .unwrap_or(defaults.phases.speaking_window),
                voting_window: value
                    .voting_window_secs
                    .unwrap_or(defaults.phases.voting_window),
            },
            lock: value.lock.map(Into::into).unwrap_or(defaults.lock),
            phase_workers: value.phase_workers.unwrap_or(defaults.phase_workers),
            admin_token: value.admin_token.filter(|token| !token.is_empty()),
            users: value.users.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<RawLock> for LockSettings {
    fn from(value: RawLock) -> Self {
        Self {
            wait: value.wait_ms,
            hold: value.hold_ms,
            attempts: value.attempts.max(1),
            backoff: value.backoff_ms,
        }
    }
}

impl From<RawUser> for UserProfile {
    fn from(value: RawUser) -> Self {
        Self {
            user_id: value.id,
            display_name: value.display_name,
            avatar: value.avatar,
            role: value.role,
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_config_overrides_only_present_fields() {
        let raw: RawConfig = serde_json::from_str(
            r#"{
                "speaking_window_secs": 5,
                "lock": { "wait_ms": 200, "hold_ms": 3000, "attempts": 0, "backoff_ms": 10 },
                "users": [{ "id": "u1", "display_name": "Alice" }]
            }"#,
        )
        .unwrap();
        let config: AppConfig = raw.into();

        assert_eq!(config.room_ttl(), DEFAULT_ROOM_TTL);
        assert_eq!(config.phase_timings().speaking_window, Duration::from_secs(5));
        assert_eq!(config.phase_timings().voting_window, DEFAULT_VOTING_WINDOW);
        assert_eq!(config.lock_settings().wait, Duration::from_millis(200));
        assert_eq!(config.lock_settings().attempts, 1);
        assert_eq!(config.users().len(), 1);
        assert_eq!(config.users()[0].role, "player");
        assert!(config.admin_token().is_none());
    }

    #[test]
    fn empty_admin_token_is_ignored() {
        let raw: RawConfig = serde_json::from_str(r#"{ "admin_token": "" }"#).unwrap();
        let config: AppConfig = raw.into();
        assert!(config.admin_token().is_none());
    }
}
