use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

use crate::protocol::StoredChatMessage;
use crate::storage::StoreError;

/// Durable chat history, owned by a collaborator service. The relay only
/// appends and reads a bounded tail; both are best-effort and callers are
/// expected to degrade on error rather than fail delivery.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn save(&self, message: &StoredChatMessage) -> Result<(), StoreError>;
    /// The most recent `limit` messages of a room, oldest first.
    async fn fetch(&self, room: &str, limit: usize) -> Result<Vec<StoredChatMessage>, StoreError>;
}

#[derive(Default)]
pub struct MemoryChatStore {
    rooms: parking_lot::Mutex<HashMap<String, Vec<StoredChatMessage>>>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn save(&self, message: &StoredChatMessage) -> Result<(), StoreError> {
        self.rooms
            .lock()
            .entry(message.room_id.clone())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn fetch(&self, room: &str, limit: usize) -> Result<Vec<StoredChatMessage>, StoreError> {
        let rooms = self.rooms.lock();
        let Some(messages) = rooms.get(room) else {
            return Ok(Vec::new());
        };
        let start = messages.len().saturating_sub(limit);
        Ok(messages[start..].to_vec())
    }
}

#[derive(Clone)]
pub struct RedisChatStore {
    redis: ConnectionManager,
    ttl_seconds: u64,
    op_timeout: Duration,
}

impl RedisChatStore {
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

fn chat_key(room: &str) -> String {
    format!("chat:{}", room)
}

#[async_trait]
impl ChatStore for RedisChatStore {
    async fn save(&self, message: &StoredChatMessage) -> Result<(), StoreError> {
        let mut redis = self.redis.clone();
        let key = chat_key(&message.room_id);
        let ttl = self.ttl_seconds;
        let serialized =
            serde_json::to_string(message).map_err(|err| StoreError::Unavailable(err.to_string()))?;
        self.bounded(async move {
            redis::pipe()
                .cmd("RPUSH")
                .arg(&key)
                .arg(&serialized)
                .ignore()
                .cmd("EXPIRE")
                .arg(&key)
                .arg(ttl)
                .ignore()
                .query_async::<()>(&mut redis)
                .await
        })
        .await
    }

    async fn fetch(&self, room: &str, limit: usize) -> Result<Vec<StoredChatMessage>, StoreError> {
        let mut redis = self.redis.clone();
        let key = chat_key(room);
        let raw: Vec<String> = self
            .bounded(async move { redis.lrange(&key, -(limit as isize), -1).await })
            .await?;
        let mut messages = Vec::with_capacity(raw.len());
        for entry in raw {
            match serde_json::from_str::<StoredChatMessage>(&entry) {
                Ok(message) => messages.push(message),
                Err(err) => debug!("skipping undecodable chat entry in {}: {}", room, err),
            }
        }
        Ok(messages)
    }
}
