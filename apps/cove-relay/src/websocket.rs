use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, error, info, warn};

use signal_bus::Bus;

use crate::chat::ChatStore;
use crate::fanout::{self, Fanout, SenderTable};
use crate::protocol::{
    generate_conn_id, now_millis, valid_room_key, ClientMessage, ServerMessage, StoredChatMessage,
};
use crate::registry::ConnectionRegistry;

/// Shared state behind every WebSocket connection.
#[derive(Clone)]
pub struct SignalingState {
    registry: Arc<ConnectionRegistry>,
    chat: Arc<dyn ChatStore>,
    fanout: Fanout,
    senders: SenderTable,
    chat_history_limit: usize,
}

impl SignalingState {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        chat: Arc<dyn ChatStore>,
        bus: Arc<dyn Bus>,
        chat_history_limit: usize,
    ) -> Self {
        let senders: SenderTable = Arc::new(Default::default());
        fanout::spawn_dispatcher(bus.clone(), registry.clone(), senders.clone());
        Self {
            registry,
            chat,
            fanout: Fanout::new(bus),
            senders,
            chat_history_limit,
        }
    }

    /// Occupants of a room excluding one connection. Store trouble degrades
    /// to an empty list; the caller still gets a usable reply.
    async fn occupants_excluding(&self, room: &str, conn: &str) -> Vec<String> {
        match self.registry.members_of(room).await {
            Ok(members) => members.into_iter().filter(|m| m != conn).collect(),
            Err(err) => {
                warn!("occupant lookup failed for room {}: {}", room, err);
                Vec::new()
            }
        }
    }
}

/// WebSocket upgrade handler.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<SignalingState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// One task per connection: a writer forwarding the outbound channel into
/// the socket, and this reader loop handling inbound frames until the
/// transport drops.
async fn handle_socket(socket: WebSocket, state: SignalingState) {
    let conn_id = generate_conn_id();
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let writer_conn = conn_id.clone();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(err) => error!("failed to serialize event for {}: {}", writer_conn, err),
            }
        }
        debug!("writer ended for {}", writer_conn);
    });

    state.registry.register(&conn_id);
    state.senders.insert(conn_id.clone(), tx.clone());
    info!("connection opened: {}", conn_id);

    while let Some(frame) = receiver.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(err) => {
                warn!("websocket error from {}: {}", conn_id, err);
                break;
            }
        };

        match msg {
            Message::Text(text) => handle_frame(&state, &conn_id, &tx, &text).await,
            // Some clients send JSON in binary frames; accept those too.
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => handle_frame(&state, &conn_id, &tx, &text).await,
                Err(_) => debug!("ignoring non-utf8 binary frame from {}", conn_id),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    disconnect(&state, &conn_id).await;
}

async fn handle_frame(
    state: &SignalingState,
    conn_id: &str,
    tx: &UnboundedSender<ServerMessage>,
    text: &str,
) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => handle_client_message(state, conn_id, tx, msg).await,
        Err(err) => warn!("dropping unparseable frame from {}: {}", conn_id, err),
    }
}

async fn handle_client_message(
    state: &SignalingState,
    conn_id: &str,
    tx: &UnboundedSender<ServerMessage>,
    message: ClientMessage,
) {
    match message {
        ClientMessage::JoinRoom { room_id } => {
            if !valid_room_key(&room_id) {
                let _ = tx.send(ServerMessage::Error {
                    message: "Invalid room ID".to_string(),
                });
                return;
            }

            let previous = state.registry.current_room(conn_id);
            if previous.as_deref() == Some(room_id.as_str()) {
                // Same-room rejoin: just refresh the snapshot.
                let others = state.occupants_excluding(&room_id, conn_id).await;
                let _ = tx.send(ServerMessage::AllUsers(others));
                return;
            }
            if previous.is_some() {
                // Switching rooms; the old room sees a normal departure.
                if let Some(departure) = state.registry.leave_room(conn_id).await {
                    if let Some(old_room) = departure.room {
                        publish_or_log(
                            state
                                .fanout
                                .to_room_except(
                                    &old_room,
                                    conn_id,
                                    ServerMessage::UserDisconnected(conn_id.to_string()),
                                )
                                .await,
                            conn_id,
                        );
                    }
                }
            }

            info!("{} joining room {}", conn_id, room_id);
            // Membership is recorded before the snapshot is taken; peers
            // never observe the joiner as absent after its reply.
            if let Err(err) = state.registry.join(conn_id, &room_id).await {
                warn!("membership store unavailable for {}: {}", conn_id, err);
                let _ = tx.send(ServerMessage::AllUsers(Vec::new()));
            } else {
                let others = state.occupants_excluding(&room_id, conn_id).await;
                let _ = tx.send(ServerMessage::AllUsers(others));
            }

            publish_or_log(
                state
                    .fanout
                    .to_room_except(
                        &room_id,
                        conn_id,
                        ServerMessage::UserJoined(conn_id.to_string()),
                    )
                    .await,
                conn_id,
            );
        }

        ClientMessage::Offer { user_to_call, sdp } => {
            if user_to_call.is_empty() || sdp.is_null() {
                warn!("dropping malformed offer from {}", conn_id);
                return;
            }
            debug!("offer relayed {} -> {}", conn_id, user_to_call);
            publish_or_log(
                state
                    .fanout
                    .to_conn(
                        &user_to_call,
                        ServerMessage::Offer {
                            sdp,
                            caller_id: conn_id.to_string(),
                        },
                    )
                    .await,
                conn_id,
            );
        }

        ClientMessage::Answer { caller_id, sdp } => {
            if caller_id.is_empty() || sdp.is_null() {
                warn!("dropping malformed answer from {}", conn_id);
                return;
            }
            debug!("answer relayed {} -> {}", conn_id, caller_id);
            publish_or_log(
                state
                    .fanout
                    .to_conn(
                        &caller_id,
                        ServerMessage::Answer {
                            sdp,
                            id: conn_id.to_string(),
                        },
                    )
                    .await,
                conn_id,
            );
        }

        ClientMessage::IceCandidate { target, candidate } => {
            if target.is_empty() || candidate.is_null() {
                warn!("dropping malformed ice candidate from {}", conn_id);
                return;
            }
            publish_or_log(
                state
                    .fanout
                    .to_conn(
                        &target,
                        ServerMessage::IceCandidate {
                            candidate,
                            caller_id: conn_id.to_string(),
                        },
                    )
                    .await,
                conn_id,
            );
        }

        ClientMessage::ChatJoin { room_id, user_name } => {
            info!("{} joined chat in room {} as {}", conn_id, room_id, user_name);
            state.registry.set_display_name(conn_id, &user_name);
            publish_or_log(
                state
                    .fanout
                    .to_room_except(
                        &room_id,
                        conn_id,
                        ServerMessage::UserJoinedChat {
                            user_name,
                            socket_id: conn_id.to_string(),
                        },
                    )
                    .await,
                conn_id,
            );

            // History is best-effort; a broken collaborator degrades to an
            // empty reply and never blocks the join.
            let history = match state.chat.fetch(&room_id, state.chat_history_limit).await {
                Ok(history) => history,
                Err(err) => {
                    warn!("chat history fetch failed for {}: {}", room_id, err);
                    Vec::new()
                }
            };
            let _ = tx.send(ServerMessage::ChatHistory(history));
        }

        ClientMessage::ChatMessage {
            room_id,
            sender_name,
            text,
            timestamp,
            kind,
        } => {
            let timestamp = timestamp.unwrap_or_else(now_millis);
            let kind = kind.unwrap_or_else(|| "text".to_string());

            let stored = StoredChatMessage {
                room_id: room_id.clone(),
                sender_name: sender_name.clone(),
                text: text.clone(),
                timestamp,
                kind: kind.clone(),
            };
            let chat = state.chat.clone();
            tokio::spawn(async move {
                if let Err(err) = chat.save(&stored).await {
                    warn!("chat persistence failed for room {}: {}", stored.room_id, err);
                }
            });

            publish_or_log(
                state
                    .fanout
                    .to_room_except(
                        &room_id,
                        conn_id,
                        ServerMessage::ChatMessage {
                            sender_id: conn_id.to_string(),
                            sender_name,
                            text,
                            timestamp,
                            kind,
                        },
                    )
                    .await,
                conn_id,
            );
        }

        ClientMessage::ChatLeave { room_id, user_name } => {
            publish_or_log(
                state
                    .fanout
                    .to_room_except(
                        &room_id,
                        conn_id,
                        ServerMessage::UserLeftChat {
                            user_name,
                            socket_id: conn_id.to_string(),
                        },
                    )
                    .await,
                conn_id,
            );
        }
    }
}

/// Terminal transition. Safe to hit more than once: the registry's forget
/// is idempotent and only the first call produces departure notifications.
async fn disconnect(state: &SignalingState, conn_id: &str) {
    state.senders.remove(conn_id);

    let Some(departure) = state.registry.forget(conn_id).await else {
        return;
    };

    let Some(room) = departure.room else {
        debug!("{} disconnected", conn_id);
        return;
    };

    publish_or_log(
        state
            .fanout
            .to_room_except(
                &room,
                conn_id,
                ServerMessage::UserDisconnected(conn_id.to_string()),
            )
            .await,
        conn_id,
    );
    if let Some(user_name) = departure.display_name {
        publish_or_log(
            state
                .fanout
                .to_room_except(
                    &room,
                    conn_id,
                    ServerMessage::UserLeftChat {
                        user_name,
                        socket_id: conn_id.to_string(),
                    },
                )
                .await,
            conn_id,
        );
    }
    info!("{} disconnected from room {}", conn_id, room);
}

fn publish_or_log(result: Result<(), signal_bus::BusError>, conn_id: &str) {
    if let Err(err) = result {
        warn!("fanout publish failed for {}: {}", conn_id, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::MemoryChatStore;
    use crate::storage::{MemoryRoomStore, RoomStore};
    use serde_json::json;
    use signal_bus::LocalBus;
    use std::time::Duration;
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
    use tokio::time::timeout;

    struct TestConn {
        id: String,
        tx: UnboundedSender<ServerMessage>,
        rx: UnboundedReceiver<ServerMessage>,
    }

    fn test_state() -> SignalingState {
        let store: Arc<dyn RoomStore> = Arc::new(MemoryRoomStore::new());
        let registry = Arc::new(ConnectionRegistry::new(store));
        let chat: Arc<dyn ChatStore> = Arc::new(MemoryChatStore::new());
        SignalingState::new(registry, chat, Arc::new(LocalBus::new()), 100)
    }

    fn open(state: &SignalingState, id: &str) -> TestConn {
        let (tx, rx) = mpsc::unbounded_channel();
        state.registry.register(id);
        state.senders.insert(id.to_string(), tx.clone());
        TestConn {
            id: id.to_string(),
            tx,
            rx,
        }
    }

    async fn send(state: &SignalingState, conn: &TestConn, message: ClientMessage) {
        handle_client_message(state, &conn.id, &conn.tx, message).await;
    }

    async fn recv(conn: &mut TestConn) -> ServerMessage {
        timeout(Duration::from_secs(1), conn.rx.recv())
            .await
            .expect("event timed out")
            .expect("channel open")
    }

    async fn assert_idle(conn: &mut TestConn) {
        assert!(
            timeout(Duration::from_millis(100), conn.rx.recv())
                .await
                .is_err(),
            "expected no event for {}",
            conn.id
        );
    }

    fn join(room: &str) -> ClientMessage {
        ClientMessage::JoinRoom {
            room_id: room.to_string(),
        }
    }

    #[tokio::test]
    async fn join_snapshot_excludes_self_and_notifies_peers() {
        let state = test_state();
        let mut x = open(&state, "x");
        let mut y = open(&state, "y");

        send(&state, &x, join("ABC123")).await;
        assert_eq!(recv(&mut x).await, ServerMessage::AllUsers(vec![]));

        send(&state, &y, join("ABC123")).await;
        assert_eq!(
            recv(&mut y).await,
            ServerMessage::AllUsers(vec!["x".to_string()])
        );
        assert_eq!(recv(&mut x).await, ServerMessage::UserJoined("y".to_string()));
    }

    #[tokio::test]
    async fn invalid_room_key_gets_an_error_reply_only() {
        let state = test_state();
        let mut x = open(&state, "x");

        send(&state, &x, join("")).await;
        assert_eq!(
            recv(&mut x).await,
            ServerMessage::Error {
                message: "Invalid room ID".to_string()
            }
        );

        send(&state, &x, join(&"r".repeat(21))).await;
        assert_eq!(
            recv(&mut x).await,
            ServerMessage::Error {
                message: "Invalid room ID".to_string()
            }
        );
        assert_eq!(state.registry.current_room("x"), None);
    }

    #[tokio::test]
    async fn offer_reaches_only_its_target() {
        let state = test_state();
        let mut x = open(&state, "x");
        let mut y = open(&state, "y");
        let mut z = open(&state, "z");
        for conn in [&x, &y, &z] {
            send(&state, conn, join("ABC123")).await;
        }
        // Drain join traffic before the interesting part.
        while timeout(Duration::from_millis(100), x.rx.recv()).await.is_ok() {}
        while timeout(Duration::from_millis(100), y.rx.recv()).await.is_ok() {}
        while timeout(Duration::from_millis(100), z.rx.recv()).await.is_ok() {}

        send(
            &state,
            &x,
            ClientMessage::Offer {
                user_to_call: "y".to_string(),
                sdp: json!({"type": "offer", "sdp": "v=0"}),
            },
        )
        .await;

        assert_eq!(
            recv(&mut y).await,
            ServerMessage::Offer {
                sdp: json!({"type": "offer", "sdp": "v=0"}),
                caller_id: "x".to_string(),
            }
        );
        assert_idle(&mut x).await;
        assert_idle(&mut z).await;
    }

    #[tokio::test]
    async fn answer_carries_the_answering_identity() {
        let state = test_state();
        let x = open(&state, "x");
        let mut y = open(&state, "y");

        send(
            &state,
            &x,
            ClientMessage::Answer {
                caller_id: "y".to_string(),
                sdp: json!("v=0"),
            },
        )
        .await;

        assert_eq!(
            recv(&mut y).await,
            ServerMessage::Answer {
                sdp: json!("v=0"),
                id: "x".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn malformed_offer_is_dropped_without_delivery() {
        let state = test_state();
        let x = open(&state, "x");
        let mut y = open(&state, "y");

        send(
            &state,
            &x,
            ClientMessage::Offer {
                user_to_call: "y".to_string(),
                sdp: serde_json::Value::Null,
            },
        )
        .await;
        send(
            &state,
            &x,
            ClientMessage::Offer {
                user_to_call: String::new(),
                sdp: json!("v=0"),
            },
        )
        .await;

        assert_idle(&mut y).await;
    }

    #[tokio::test]
    async fn offer_to_vanished_target_is_silently_dropped() {
        let state = test_state();
        let mut x = open(&state, "x");

        send(
            &state,
            &x,
            ClientMessage::Offer {
                user_to_call: "ghost".to_string(),
                sdp: json!("v=0"),
            },
        )
        .await;

        assert_idle(&mut x).await;
    }

    #[tokio::test]
    async fn disconnect_notifies_room_once_and_empties_it() {
        let state = test_state();
        let mut x = open(&state, "x");
        let mut y = open(&state, "y");
        send(&state, &x, join("ABC123")).await;
        send(&state, &y, join("ABC123")).await;
        while timeout(Duration::from_millis(100), x.rx.recv()).await.is_ok() {}
        while timeout(Duration::from_millis(100), y.rx.recv()).await.is_ok() {}

        disconnect(&state, "x").await;
        assert_eq!(
            recv(&mut y).await,
            ServerMessage::UserDisconnected("x".to_string())
        );

        // A transport can deliver the disconnect signal twice.
        disconnect(&state, "x").await;
        assert_idle(&mut y).await;

        disconnect(&state, "y").await;
        assert!(state.registry.members_of("ABC123").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn disconnect_with_display_name_also_leaves_chat() {
        let state = test_state();
        let mut x = open(&state, "x");
        let mut y = open(&state, "y");
        send(&state, &x, join("ABC123")).await;
        send(&state, &y, join("ABC123")).await;
        send(
            &state,
            &y,
            ClientMessage::ChatJoin {
                room_id: "ABC123".to_string(),
                user_name: "Ann".to_string(),
            },
        )
        .await;
        while timeout(Duration::from_millis(100), x.rx.recv()).await.is_ok() {}
        while timeout(Duration::from_millis(100), y.rx.recv()).await.is_ok() {}

        disconnect(&state, "y").await;
        assert_eq!(
            recv(&mut x).await,
            ServerMessage::UserDisconnected("y".to_string())
        );
        assert_eq!(
            recv(&mut x).await,
            ServerMessage::UserLeftChat {
                user_name: "Ann".to_string(),
                socket_id: "y".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn chat_message_reaches_peers_and_persistence() {
        let state = test_state();
        let mut x = open(&state, "x");
        let mut y = open(&state, "y");
        let mut z = open(&state, "z");
        send(&state, &x, join("ABC123")).await;
        send(&state, &y, join("ABC123")).await;
        send(&state, &z, join("XYZ999")).await;
        while timeout(Duration::from_millis(100), x.rx.recv()).await.is_ok() {}
        while timeout(Duration::from_millis(100), y.rx.recv()).await.is_ok() {}
        while timeout(Duration::from_millis(100), z.rx.recv()).await.is_ok() {}

        send(
            &state,
            &x,
            ClientMessage::ChatMessage {
                room_id: "ABC123".to_string(),
                sender_name: "Ann".to_string(),
                text: "hi".to_string(),
                timestamp: Some(42),
                kind: None,
            },
        )
        .await;

        assert_eq!(
            recv(&mut y).await,
            ServerMessage::ChatMessage {
                sender_id: "x".to_string(),
                sender_name: "Ann".to_string(),
                text: "hi".to_string(),
                timestamp: 42,
                kind: "text".to_string(),
            }
        );
        assert_idle(&mut x).await;
        assert_idle(&mut z).await;

        // Persistence is spawned; poll until the collaborator has it.
        let mut saved = Vec::new();
        for _ in 0..50 {
            saved = state.chat.fetch("ABC123", 100).await.unwrap();
            if !saved.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].text, "hi");
        assert_eq!(saved[0].room_id, "ABC123");
    }

    #[tokio::test]
    async fn chat_join_announces_presence_and_replies_with_history() {
        let state = test_state();
        let mut x = open(&state, "x");
        let mut y = open(&state, "y");
        send(&state, &x, join("ABC123")).await;
        send(&state, &y, join("ABC123")).await;
        while timeout(Duration::from_millis(100), x.rx.recv()).await.is_ok() {}
        while timeout(Duration::from_millis(100), y.rx.recv()).await.is_ok() {}

        let earlier = StoredChatMessage {
            room_id: "ABC123".to_string(),
            sender_name: "Bea".to_string(),
            text: "earlier".to_string(),
            timestamp: 1,
            kind: "text".to_string(),
        };
        state.chat.save(&earlier).await.unwrap();

        send(
            &state,
            &y,
            ClientMessage::ChatJoin {
                room_id: "ABC123".to_string(),
                user_name: "Ann".to_string(),
            },
        )
        .await;

        assert_eq!(
            recv(&mut x).await,
            ServerMessage::UserJoinedChat {
                user_name: "Ann".to_string(),
                socket_id: "y".to_string(),
            }
        );
        assert_eq!(recv(&mut y).await, ServerMessage::ChatHistory(vec![earlier]));
    }

    #[tokio::test]
    async fn rejoin_switches_rooms_and_tears_down_the_old_one() {
        let state = test_state();
        let mut x = open(&state, "x");

        send(&state, &x, join("ABC123")).await;
        assert_eq!(recv(&mut x).await, ServerMessage::AllUsers(vec![]));

        send(&state, &x, join("XYZ999")).await;
        assert_eq!(recv(&mut x).await, ServerMessage::AllUsers(vec![]));

        assert!(state.registry.members_of("ABC123").await.unwrap().is_empty());
        assert_eq!(
            state.registry.members_of("XYZ999").await.unwrap(),
            vec!["x".to_string()]
        );
        assert_eq!(state.registry.current_room("x").as_deref(), Some("XYZ999"));
    }

    #[tokio::test]
    async fn rejoin_notifies_the_old_room_of_departure() {
        let state = test_state();
        let mut x = open(&state, "x");
        let mut y = open(&state, "y");
        send(&state, &x, join("ABC123")).await;
        send(&state, &y, join("ABC123")).await;
        while timeout(Duration::from_millis(100), x.rx.recv()).await.is_ok() {}
        while timeout(Duration::from_millis(100), y.rx.recv()).await.is_ok() {}

        send(&state, &x, join("XYZ999")).await;

        assert_eq!(
            recv(&mut y).await,
            ServerMessage::UserDisconnected("x".to_string())
        );
        assert_eq!(
            state.registry.members_of("ABC123").await.unwrap(),
            vec!["y".to_string()]
        );
    }

    #[tokio::test]
    async fn rejoining_the_same_room_only_refreshes_the_snapshot() {
        let state = test_state();
        let mut x = open(&state, "x");
        let mut y = open(&state, "y");
        send(&state, &x, join("ABC123")).await;
        send(&state, &y, join("ABC123")).await;
        while timeout(Duration::from_millis(100), x.rx.recv()).await.is_ok() {}
        while timeout(Duration::from_millis(100), y.rx.recv()).await.is_ok() {}

        send(&state, &x, join("ABC123")).await;
        assert_eq!(
            recv(&mut x).await,
            ServerMessage::AllUsers(vec!["y".to_string()])
        );
        assert_idle(&mut y).await;
    }

    #[tokio::test]
    async fn chat_leave_keeps_call_membership() {
        let state = test_state();
        let mut x = open(&state, "x");
        let mut y = open(&state, "y");
        send(&state, &x, join("ABC123")).await;
        send(&state, &y, join("ABC123")).await;
        while timeout(Duration::from_millis(100), x.rx.recv()).await.is_ok() {}
        while timeout(Duration::from_millis(100), y.rx.recv()).await.is_ok() {}

        send(
            &state,
            &y,
            ClientMessage::ChatLeave {
                room_id: "ABC123".to_string(),
                user_name: "Ann".to_string(),
            },
        )
        .await;

        assert_eq!(
            recv(&mut x).await,
            ServerMessage::UserLeftChat {
                user_name: "Ann".to_string(),
                socket_id: "y".to_string(),
            }
        );
        assert_eq!(
            state.registry.current_room("y").as_deref(),
            Some("ABC123"),
            "chat-leave must not remove call membership"
        );
    }
}
