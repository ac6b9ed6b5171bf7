//! Live-channel events.
//!
//! Frames are JSON text of the form `{"event": <name>, "data": <payload>}`.

use serde::{Deserialize, Serialize};

use crate::api::{ConversationView, ErrorBody, MessageView};
use crate::ids::ConversationId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRef {
    pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub conversation_id: ConversationId,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// Client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    JoinConversation(ConversationRef),
    LeaveConversation(ConversationRef),
    SendMessage(SendMessage),
}

/// Server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Subscription to a conversation channel is active.
    Joined(ConversationRef),
    MessageReceived(MessageView),
    /// Pushed on both participants' personal channels.
    ConversationCreated(ConversationView),
    Error(ErrorBody),
}

impl ClientEvent {
    pub fn join(conversation_id: ConversationId) -> Self {
        ClientEvent::JoinConversation(ConversationRef { conversation_id })
    }

    pub fn leave(conversation_id: ConversationId) -> Self {
        ClientEvent::LeaveConversation(ConversationRef { conversation_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_frame_shape() {
        let id: ConversationId = "0b8f3c1d-52a4-4f0e-8d3c-7a9e5b2f1c6d".parse().unwrap();
        let json = serde_json::to_value(ClientEvent::join(id)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "event": "joinConversation",
                "data": { "conversationId": "0b8f3c1d-52a4-4f0e-8d3c-7a9e5b2f1c6d" }
            })
        );
    }

    #[test]
    fn send_message_frame_parses() {
        let frame = r#"{"event":"sendMessage","data":{
            "conversationId":"0b8f3c1d-52a4-4f0e-8d3c-7a9e5b2f1c6d",
            "nonce":[1,2,3],"ciphertext":[4,5]}}"#;
        match serde_json::from_str::<ClientEvent>(frame).unwrap() {
            ClientEvent::SendMessage(m) => {
                assert_eq!(m.nonce, vec![1, 2, 3]);
                assert_eq!(m.ciphertext, vec![4, 5]);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn unknown_event_is_rejected() {
        assert!(serde_json::from_str::<ClientEvent>(r#"{"event":"typing","data":{}}"#).is_err());
    }
}
