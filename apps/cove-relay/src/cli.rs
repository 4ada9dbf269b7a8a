use anyhow::Result;
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use crate::protocol::{ClientMessage, ServerMessage};

#[derive(Parser, Debug)]
#[command(name = "cove-relay")]
#[command(about = "Video-call signaling relay and probe client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Join a room as a throwaway connection and print relay events
    Probe {
        /// Relay URL (e.g., ws://localhost:8080)
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,

        /// Room key to join
        #[arg(short, long)]
        room: String,

        /// Announce chat presence under this display name
        #[arg(short, long)]
        name: Option<String>,

        /// Send one chat message after joining (requires --name)
        #[arg(short, long)]
        message: Option<String>,

        /// Seconds to keep listening before disconnecting
        #[arg(long, default_value_t = 10)]
        watch: u64,
    },
}

pub async fn run_probe(
    url: String,
    room: String,
    name: Option<String>,
    message: Option<String>,
    watch: u64,
) -> Result<()> {
    let ws_url = format!("{}/ws", url.trim_end_matches('/'));
    debug!("connecting to {}", ws_url);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => {
            return Err(anyhow::anyhow!("connection failed: {}", err));
        }
        Err(_) => {
            return Err(anyhow::anyhow!(
                "connection timeout - is the relay running at {}?",
                url
            ));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let join = ClientMessage::JoinRoom {
        room_id: room.clone(),
    };
    write
        .send(Message::Text(serde_json::to_string(&join)?.into()))
        .await?;

    // The snapshot is the first thing the relay sends back.
    let occupants = timeout(Duration::from_secs(5), async {
        while let Some(msg) = read.next().await {
            if let Message::Text(text) = msg? {
                match serde_json::from_str::<ServerMessage>(&text)? {
                    ServerMessage::AllUsers(users) => return Ok(users),
                    ServerMessage::Error { message } => {
                        return Err(anyhow::anyhow!("relay rejected join: {}", message));
                    }
                    other => debug!("ignoring pre-join event: {:?}", other),
                }
            }
        }
        Err(anyhow::anyhow!("connection closed before join completed"))
    })
    .await
    .map_err(|_| anyhow::anyhow!("timed out waiting for the occupant snapshot"))??;

    println!("joined room {} ({} other occupant(s))", room, occupants.len());
    for occupant in &occupants {
        println!("  {}", occupant);
    }

    if let Some(name) = &name {
        let chat_join = ClientMessage::ChatJoin {
            room_id: room.clone(),
            user_name: name.clone(),
        };
        write
            .send(Message::Text(serde_json::to_string(&chat_join)?.into()))
            .await?;

        if let Some(text) = message {
            let chat = ClientMessage::ChatMessage {
                room_id: room.clone(),
                sender_name: name.clone(),
                text,
                timestamp: None,
                kind: None,
            };
            write
                .send(Message::Text(serde_json::to_string(&chat)?.into()))
                .await?;
        }
    }

    let deadline = Instant::now() + Duration::from_secs(watch);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining, read.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(event) => println!("{:?}", event),
                    Err(err) => debug!("undecodable event: {}", err),
                }
            }
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(err))) => return Err(anyhow::anyhow!("websocket error: {}", err)),
            Ok(None) => break,
            Err(_) => break,
        }
    }

    let _ = write.send(Message::Close(None)).await;
    Ok(())
}
