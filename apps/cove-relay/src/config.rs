use std::env;

/// Which room-membership backend to run. Selected explicitly; with the
/// redis backend an unreachable server is a startup error, never a fallback
/// to per-process state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomBackend {
    Memory,
    Redis,
}

impl RoomBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomBackend::Memory => "memory",
            RoomBackend::Redis => "redis",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub backend: RoomBackend,
    pub redis_url: String,
    /// TTL on Redis membership keys; refreshed on activity. Rooms are
    /// ephemeral, this only garbage-collects keys a crashed process left
    /// behind.
    pub room_ttl_seconds: u64,
    pub chat_ttl_seconds: u64,
    pub chat_history_limit: usize,
    /// Upper bound on any single round-trip to the shared store.
    pub store_timeout_ms: u64,
}

impl Config {
    pub fn from_env() -> Self {
        let backend = match env::var("ROOM_BACKEND").ok().as_deref() {
            Some("redis") => RoomBackend::Redis,
            Some("memory") | None => RoomBackend::Memory,
            Some(other) => {
                tracing::warn!("unknown ROOM_BACKEND {:?}, using memory", other);
                RoomBackend::Memory
            }
        };

        Self {
            port: env::var("COVE_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            backend,
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            room_ttl_seconds: env::var("ROOM_TTL")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(86_400),
            chat_ttl_seconds: env::var("CHAT_TTL")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(86_400),
            chat_history_limit: env::var("CHAT_HISTORY_LIMIT")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(100),
            store_timeout_ms: env::var("STORE_TIMEOUT_MS")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(3_000),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            backend: RoomBackend::Memory,
            redis_url: "redis://localhost:6379".to_string(),
            room_ttl_seconds: 86_400,
            chat_ttl_seconds: 86_400,
            chat_history_limit: 100,
            store_timeout_ms: 3_000,
        }
    }
}
