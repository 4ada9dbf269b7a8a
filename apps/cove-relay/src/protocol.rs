use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Room keys are caller-supplied; anything longer than this is rejected.
pub const MAX_ROOM_KEY_LEN: usize = 20;

/// Messages sent from a client to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Join (or switch to) a room for call signaling.
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: String },
    /// SDP offer for a specific peer. The relay never inspects the SDP.
    #[serde(rename_all = "camelCase")]
    Offer {
        user_to_call: String,
        sdp: serde_json::Value,
    },
    /// SDP answer back to the peer that sent the offer.
    Answer {
        #[serde(rename = "callerID")]
        caller_id: String,
        sdp: serde_json::Value,
    },
    /// ICE candidate for a specific peer.
    IceCandidate {
        target: String,
        candidate: serde_json::Value,
    },
    /// Announce a display name for chat presence in a room.
    #[serde(rename_all = "camelCase")]
    ChatJoin { room_id: String, user_name: String },
    /// Room-scoped chat text or reaction.
    #[serde(rename_all = "camelCase")]
    ChatMessage {
        room_id: String,
        sender_name: String,
        text: String,
        #[serde(default)]
        timestamp: Option<i64>,
        #[serde(default, rename = "type")]
        kind: Option<String>,
    },
    /// Leave chat presence without leaving the call.
    #[serde(rename_all = "camelCase")]
    ChatLeave { room_id: String, user_name: String },
}

/// Messages sent from the relay to a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Occupants already in the room, excluding the recipient.
    AllUsers(Vec<String>),
    /// A new connection joined the recipient's room.
    UserJoined(String),
    /// A connection left the recipient's room.
    UserDisconnected(String),
    /// Forwarded SDP offer, tagged with the calling connection.
    Offer {
        sdp: serde_json::Value,
        #[serde(rename = "callerID")]
        caller_id: String,
    },
    /// Forwarded SDP answer, tagged with the answering connection.
    Answer {
        sdp: serde_json::Value,
        id: String,
    },
    /// Forwarded ICE candidate, tagged with the sending connection.
    IceCandidate {
        candidate: serde_json::Value,
        #[serde(rename = "callerID")]
        caller_id: String,
    },
    /// Stored chat history, oldest first.
    ChatHistory(Vec<StoredChatMessage>),
    /// Forwarded chat message; never echoed back to its sender.
    #[serde(rename_all = "camelCase")]
    ChatMessage {
        sender_id: String,
        sender_name: String,
        text: String,
        timestamp: i64,
        #[serde(rename = "type")]
        kind: String,
    },
    #[serde(rename_all = "camelCase")]
    UserJoinedChat { user_name: String, socket_id: String },
    #[serde(rename_all = "camelCase")]
    UserLeftChat { user_name: String, socket_id: String },
    Error { message: String },
}

/// A chat message as the history collaborator stores it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredChatMessage {
    pub room_id: String,
    pub sender_name: String,
    pub text: String,
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Generate a unique connection ID.
pub fn generate_conn_id() -> String {
    Uuid::new_v4().to_string()
}

/// Server clock in milliseconds, the chat timestamp default.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Format check only; any well-formed key names a joinable room.
pub fn valid_room_key(key: &str) -> bool {
    !key.is_empty() && key.len() <= MAX_ROOM_KEY_LEN
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_room_parses_from_wire_shape() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"event":"join-room","data":{"roomId":"ABC123"}}"#)
                .expect("valid join-room");
        match msg {
            ClientMessage::JoinRoom { room_id } => assert_eq!(room_id, "ABC123"),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn offer_requires_sdp() {
        let missing =
            serde_json::from_str::<ClientMessage>(r#"{"event":"offer","data":{"userToCall":"x"}}"#);
        assert!(missing.is_err());
    }

    #[test]
    fn forwarded_offer_uses_caller_id_field() {
        let msg = ServerMessage::Offer {
            sdp: json!({"type": "offer", "sdp": "v=0"}),
            caller_id: "conn-1".into(),
        };
        let wire = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(wire["event"], "offer");
        assert_eq!(wire["data"]["callerID"], "conn-1");
        assert_eq!(wire["data"]["sdp"]["sdp"], "v=0");
    }

    #[test]
    fn forwarded_answer_carries_answering_id() {
        let msg = ServerMessage::Answer {
            sdp: json!("v=0"),
            id: "conn-2".into(),
        };
        let wire = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(wire["event"], "answer");
        assert_eq!(wire["data"]["id"], "conn-2");
    }

    #[test]
    fn all_users_is_a_plain_array() {
        let msg = ServerMessage::AllUsers(vec!["a".into(), "b".into()]);
        let wire = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(wire, json!({"event": "all-users", "data": ["a", "b"]}));
    }

    #[test]
    fn chat_message_timestamp_and_kind_are_optional() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"event":"chat-message","data":{"roomId":"r","senderName":"Ann","text":"hi"}}"#,
        )
        .expect("valid chat-message");
        match msg {
            ClientMessage::ChatMessage {
                timestamp, kind, ..
            } => {
                assert!(timestamp.is_none());
                assert!(kind.is_none());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn chat_events_use_camel_case_fields() {
        let msg = ServerMessage::UserJoinedChat {
            user_name: "Ann".into(),
            socket_id: "conn-1".into(),
        };
        let wire = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(wire["event"], "user-joined-chat");
        assert_eq!(wire["data"]["userName"], "Ann");
        assert_eq!(wire["data"]["socketId"], "conn-1");
    }

    #[test]
    fn stored_chat_message_round_trips() {
        let stored = StoredChatMessage {
            room_id: "r".into(),
            sender_name: "Ann".into(),
            text: "hi".into(),
            timestamp: 1_700_000_000_000,
            kind: "text".into(),
        };
        let wire = serde_json::to_value(&stored).expect("serialize");
        assert_eq!(wire["roomId"], "r");
        assert_eq!(wire["type"], "text");
        let back: StoredChatMessage = serde_json::from_value(wire).expect("deserialize");
        assert_eq!(back, stored);
    }

    #[test]
    fn room_key_format_bounds() {
        assert!(valid_room_key("ABC123"));
        assert!(!valid_room_key(""));
        assert!(valid_room_key(&"x".repeat(MAX_ROOM_KEY_LEN)));
        assert!(!valid_room_key(&"x".repeat(MAX_ROOM_KEY_LEN + 1)));
    }

    #[test]
    fn conn_ids_are_unique() {
        assert_ne!(generate_conn_id(), generate_conn_id());
    }
}
