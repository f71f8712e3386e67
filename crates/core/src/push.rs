use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event name for the acknowledgement frame sent right after a socket is
/// accepted.
pub const STATUS_EVENT: &str = "status";
/// Event name for a pushed chat message.
pub const PUSH_CHAT_EVENT: &str = "push_chat";

/// A named event pushed to a connected client. Every server-to-client
/// frame on the chat socket is one of these, serialized as a single JSON
/// text message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushFrame {
    pub event: String,
    pub data: Value,
}

impl PushFrame {
    pub fn status(message: &str) -> Self {
        Self {
            event: STATUS_EVENT.to_owned(),
            data: serde_json::json!({ "message": message }),
        }
    }

    /// Wraps an already-persisted chat message. The payload is the stored
    /// record as-is, so clients see exactly what a later history fetch
    /// would return.
    pub fn chat<T: Serialize>(message: &T) -> Self {
        Self {
            event: PUSH_CHAT_EVENT.to_owned(),
            data: serde_json::to_value(message).unwrap_or_default(),
        }
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde::Serialize;
    use uuid::Uuid;

    #[derive(Serialize)]
    struct SampleMessage {
        id: Uuid,
        sender: Uuid,
        recipient: Uuid,
        text: String,
    }

    #[test]
    fn status_frame_matches_ack_shape() {
        let frame = PushFrame::status("Connected!");
        let json: Value = serde_json::from_str(&frame.to_text()).unwrap();
        assert_eq!(json["event"], "status");
        assert_eq!(json["data"]["message"], "Connected!");
    }

    proptest! {
        #[test]
        fn chat_frame_carries_payload_verbatim(
            sender_bytes in any::<[u8; 16]>(),
            recipient_bytes in any::<[u8; 16]>(),
            text in ".*",
        ) {
            let message = SampleMessage {
                id: Uuid::new_v4(),
                sender: Uuid::from_bytes(sender_bytes),
                recipient: Uuid::from_bytes(recipient_bytes),
                text,
            };
            let frame = PushFrame::chat(&message);
            prop_assert_eq!(frame.event.as_str(), PUSH_CHAT_EVENT);

            let decoded: PushFrame = serde_json::from_str(&frame.to_text()).unwrap();
            prop_assert_eq!(decoded.data["text"].as_str(), Some(message.text.as_str()));
            prop_assert_eq!(frame.data, serde_json::to_value(&message).unwrap());
        }
    }
}
