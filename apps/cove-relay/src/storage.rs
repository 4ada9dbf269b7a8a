use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store request timed out")]
    Timeout,
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Result of removing a connection from whatever room it was in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedMember {
    pub room: String,
    pub room_now_empty: bool,
}

/// Room membership, queryable locally or across relay processes. Rooms are
/// pure membership sets: created on first add, deleted when the last member
/// is removed.
#[async_trait]
pub trait RoomStore: Send + Sync {
    /// Record membership. Adding an already-present member is a no-op.
    async fn add_member(&self, room: &str, conn: &str) -> Result<(), StoreError>;
    /// Remove the member from whatever room it was recorded in. Deletes the
    /// room record when it empties.
    async fn remove_member(&self, conn: &str) -> Result<Option<RemovedMember>, StoreError>;
    /// Current member set; empty when the room is unknown.
    async fn members_of(&self, room: &str) -> Result<Vec<String>, StoreError>;
    async fn room_of(&self, conn: &str) -> Result<Option<String>, StoreError>;
    /// Backend liveness, for the status endpoint.
    async fn ping(&self) -> bool;
    fn backend_name(&self) -> &'static str;
}

/// Single-process variant. Membership lives for the process lifetime; peers
/// re-join on reconnect.
#[derive(Default)]
pub struct MemoryRoomStore {
    inner: parking_lot::Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    rooms: HashMap<String, Vec<String>>,
    conn_room: HashMap<String, String>,
}

impl MemoryRoomStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemoryInner {
    fn detach(&mut self, conn: &str) -> Option<RemovedMember> {
        let room = self.conn_room.remove(conn)?;
        let mut now_empty = false;
        if let Some(members) = self.rooms.get_mut(&room) {
            members.retain(|m| m != conn);
            if members.is_empty() {
                self.rooms.remove(&room);
                now_empty = true;
            }
        }
        Some(RemovedMember {
            room,
            room_now_empty: now_empty,
        })
    }
}

#[async_trait]
impl RoomStore for MemoryRoomStore {
    async fn add_member(&self, room: &str, conn: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        // A member can be in one room at a time; detach from any stale one.
        if inner.conn_room.get(conn).is_some_and(|r| r != room) {
            inner.detach(conn);
        }
        let members = inner.rooms.entry(room.to_string()).or_default();
        if !members.iter().any(|m| m == conn) {
            members.push(conn.to_string());
        }
        inner.conn_room.insert(conn.to_string(), room.to_string());
        Ok(())
    }

    async fn remove_member(&self, conn: &str) -> Result<Option<RemovedMember>, StoreError> {
        Ok(self.inner.lock().detach(conn))
    }

    async fn members_of(&self, room: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.inner.lock().rooms.get(room).cloned().unwrap_or_default())
    }

    async fn room_of(&self, conn: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner.lock().conn_room.get(conn).cloned())
    }

    async fn ping(&self) -> bool {
        true
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

/// Shared variant over Redis set operations; relay processes behind a load
/// balancer see one membership view. Keys carry a TTL refreshed on writes;
/// membership is ephemeral and the TTL only reclaims keys left by a crashed
/// process.
#[derive(Clone)]
pub struct RedisRoomStore {
    redis: ConnectionManager,
    ttl_seconds: u64,
    op_timeout: Duration,
}

impl RedisRoomStore {
    pub async fn new(
        redis_url: &str,
        ttl_seconds: u64,
        op_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self {
            redis,
            ttl_seconds,
            op_timeout,
        })
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, redis::RedisError>>,
    {
        match timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(StoreError::Unavailable(err.to_string())),
            Err(_) => Err(StoreError::Timeout),
        }
    }
}

fn room_key(room: &str) -> String {
    format!("room:{}", room)
}

fn conn_key(conn: &str) -> String {
    format!("conn:{}", conn)
}

#[async_trait]
impl RoomStore for RedisRoomStore {
    async fn add_member(&self, room: &str, conn: &str) -> Result<(), StoreError> {
        let mut redis = self.redis.clone();
        let ttl = self.ttl_seconds;
        let room = room.to_string();
        let conn = conn.to_string();
        self.bounded(async move {
            // Same one-room-at-a-time rule as the local variant.
            let previous: Option<String> = redis.get(conn_key(&conn)).await?;
            if let Some(previous) = previous.filter(|p| *p != room) {
                let remaining: i64 = {
                    redis.srem::<_, _, ()>(room_key(&previous), &conn).await?;
                    redis.scard(room_key(&previous)).await?
                };
                if remaining == 0 {
                    redis.del::<_, ()>(room_key(&previous)).await?;
                }
            }
            redis::pipe()
                .cmd("SADD")
                .arg(room_key(&room))
                .arg(&conn)
                .ignore()
                .cmd("EXPIRE")
                .arg(room_key(&room))
                .arg(ttl)
                .ignore()
                .cmd("SET")
                .arg(conn_key(&conn))
                .arg(&room)
                .arg("EX")
                .arg(ttl)
                .ignore()
                .query_async::<()>(&mut redis)
                .await
        })
        .await
    }

    async fn remove_member(&self, conn: &str) -> Result<Option<RemovedMember>, StoreError> {
        let mut redis = self.redis.clone();
        let conn = conn.to_string();
        self.bounded(async move {
            let room: Option<String> = redis.get(conn_key(&conn)).await?;
            let Some(room) = room else {
                return Ok(None);
            };
            redis.srem::<_, _, ()>(room_key(&room), &conn).await?;
            redis.del::<_, ()>(conn_key(&conn)).await?;
            let remaining: i64 = redis.scard(room_key(&room)).await?;
            let room_now_empty = remaining == 0;
            if room_now_empty {
                redis.del::<_, ()>(room_key(&room)).await?;
            }
            Ok(Some(RemovedMember {
                room,
                room_now_empty,
            }))
        })
        .await
    }

    async fn members_of(&self, room: &str) -> Result<Vec<String>, StoreError> {
        let mut redis = self.redis.clone();
        let key = room_key(room);
        self.bounded(async move { redis.smembers(&key).await }).await
    }

    async fn room_of(&self, conn: &str) -> Result<Option<String>, StoreError> {
        let mut redis = self.redis.clone();
        let key = conn_key(conn);
        self.bounded(async move { redis.get(&key).await }).await
    }

    async fn ping(&self) -> bool {
        let mut redis = self.redis.clone();
        self.bounded(async move {
            redis::cmd("PING")
                .query_async::<String>(&mut redis)
                .await
        })
        .await
        .is_ok()
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
