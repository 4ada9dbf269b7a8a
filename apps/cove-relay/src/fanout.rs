use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use signal_bus::{Bus, BusError, BusMessage, BusResult, LocalBus};

use crate::protocol::ServerMessage;
use crate::registry::ConnectionRegistry;

/// The one channel every relay process subscribes to. A process that does
/// not host the target connection ignores the envelope; the one that does
/// delivers it.
pub const FANOUT_TOPIC: &str = "cove.fanout";

/// Table of live local connections and their outbound channels.
pub type SenderTable = Arc<DashMap<String, UnboundedSender<ServerMessage>>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum Target {
    Conn {
        id: String,
    },
    Room {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exclude: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub target: Target,
    pub event: ServerMessage,
}

/// Publish side of the fan-out transport.
#[derive(Clone)]
pub struct Fanout {
    bus: Arc<dyn Bus>,
}

impl Fanout {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self { bus }
    }

    /// Deliver to one connection, wherever it is hosted.
    pub async fn to_conn(&self, conn: &str, event: ServerMessage) -> BusResult<()> {
        self.publish(Envelope {
            target: Target::Conn {
                id: conn.to_string(),
            },
            event,
        })
        .await
    }

    /// Deliver to every room member except `sender`.
    pub async fn to_room_except(
        &self,
        room: &str,
        sender: &str,
        event: ServerMessage,
    ) -> BusResult<()> {
        self.publish(Envelope {
            target: Target::Room {
                key: room.to_string(),
                exclude: Some(sender.to_string()),
            },
            event,
        })
        .await
    }

    /// Deliver to every room member.
    pub async fn to_room(&self, room: &str, event: ServerMessage) -> BusResult<()> {
        self.publish(Envelope {
            target: Target::Room {
                key: room.to_string(),
                exclude: None,
            },
            event,
        })
        .await
    }

    async fn publish(&self, envelope: Envelope) -> BusResult<()> {
        let payload =
            serde_json::to_vec(&envelope).map_err(|err| BusError::Transport(err.to_string()))?;
        self.bus.publish(FANOUT_TOPIC, Bytes::from(payload)).await
    }
}

/// Per-process delivery loop: resolves envelopes against the local sender
/// table and registry. Must be running before the first publish.
pub fn spawn_dispatcher(
    bus: Arc<dyn Bus>,
    registry: Arc<ConnectionRegistry>,
    senders: SenderTable,
) -> JoinHandle<()> {
    let mut rx = bus.subscribe(FANOUT_TOPIC);
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(msg) => deliver(&registry, &senders, msg),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("fanout dispatcher lagged, dropped {} envelopes", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("fanout dispatcher stopped");
    })
}

fn deliver(registry: &ConnectionRegistry, senders: &SenderTable, msg: BusMessage) {
    let envelope: Envelope = match serde_json::from_slice(&msg.payload) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!("dropping undecodable fanout envelope: {}", err);
            return;
        }
    };

    match envelope.target {
        Target::Conn { id } => {
            if let Some(tx) = senders.get(&id) {
                let _ = tx.send(envelope.event);
            } else {
                // Connections are ephemeral; a vanished target is not an error.
                debug!("dropping event for unknown connection {}", id);
            }
        }
        Target::Room { key, exclude } => {
            for conn in registry.local_members(&key) {
                if exclude.as_deref() == Some(conn.as_str()) {
                    continue;
                }
                if let Some(tx) = senders.get(&conn) {
                    let _ = tx.send(envelope.event.clone());
                }
            }
        }
    }
}

/// Redis-backed bus: publishes on the shared channel through a managed
/// connection and pumps the process-wide subscription into a local
/// broadcast, reconnecting with a short delay when the subscription drops.
pub struct RedisBus {
    publisher: ConnectionManager,
    incoming: Arc<LocalBus>,
}

impl RedisBus {
    pub async fn connect(redis_url: &str) -> Result<Self, BusError> {
        let client =
            Client::open(redis_url).map_err(|err| BusError::Transport(err.to_string()))?;
        let publisher = ConnectionManager::new(client.clone())
            .await
            .map_err(|err| BusError::Transport(err.to_string()))?;
        let incoming = Arc::new(LocalBus::new());
        spawn_subscription_pump(client, incoming.clone());
        Ok(Self {
            publisher,
            incoming,
        })
    }
}

fn spawn_subscription_pump(client: Client, incoming: Arc<LocalBus>) {
    tokio::spawn(async move {
        loop {
            match client.get_async_pubsub().await {
                Ok(mut pubsub) => match pubsub.subscribe(FANOUT_TOPIC).await {
                    Ok(()) => {
                        let mut stream = pubsub.on_message();
                        while let Some(msg) = stream.next().await {
                            let topic = msg.get_channel_name().to_string();
                            let payload = Bytes::copy_from_slice(msg.get_payload_bytes());
                            let _ = incoming.publish(&topic, payload).await;
                        }
                        warn!("fanout subscription ended, reconnecting");
                    }
                    Err(err) => warn!("fanout subscribe failed: {}", err),
                },
                Err(err) => warn!("fanout pubsub connect failed: {}", err),
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    });
}

#[async_trait]
impl Bus for RedisBus {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        self.incoming.subscribe(topic)
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        let mut conn = self.publisher.clone();
        conn.publish::<_, _, ()>(topic, payload.as_ref())
            .await
            .map_err(|err| BusError::Transport(err.to_string()))
    }
}
