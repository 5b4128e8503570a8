//! Wire protocol: JSON control messages and binary PCM framing.
//!
//! Text frames carry a single JSON object tagged by `type`; binary frames
//! are raw little-endian int16 PCM at the group's configured rate.

use serde::{Deserialize, Serialize};

/// Control messages sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authenticate with an allow-listed GUID.
    Hello { guid: String },
    /// Wake-word confidence report; opens or joins the group's arbitration.
    Confidence { value: f32 },
}

/// Control messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Acknowledges receipt of a confidence score.
    ConfRec,
    /// Cease local capture immediately.
    Stop,
    /// Adopt this GUID and reconnect.
    AssignId { id: String },
}

/// Decode a binary frame of little-endian int16 PCM.
///
/// A trailing odd byte is ignored.
pub fn decode_pcm_le(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_use_snake_case_tags() {
        let hello: ClientMessage =
            serde_json::from_str(r#"{"type":"hello","guid":"g-1"}"#).unwrap();
        assert_eq!(hello, ClientMessage::Hello { guid: "g-1".into() });

        let confidence: ClientMessage =
            serde_json::from_str(r#"{"type":"confidence","value":0.85}"#).unwrap();
        assert_eq!(confidence, ClientMessage::Confidence { value: 0.85 });
    }

    #[test]
    fn server_messages_serialize_expected_tags() {
        let json = serde_json::to_value(&ServerMessage::ConfRec).unwrap();
        assert_eq!(json["type"], "conf_rec");

        let json = serde_json::to_value(&ServerMessage::Stop).unwrap();
        assert_eq!(json["type"], "stop");

        let json = serde_json::to_value(&ServerMessage::AssignId { id: "g-7".into() }).unwrap();
        assert_eq!(json["type"], "assign_id");
        assert_eq!(json["id"], "g-7");
    }

    #[test]
    fn malformed_control_messages_fail_to_parse() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"hello"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>("not json").is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"guid":"g-1"}"#).is_err());
    }

    #[test]
    fn pcm_decode_is_little_endian() {
        let bytes = [0x01, 0x00, 0xFF, 0xFF, 0x00, 0x80];
        assert_eq!(decode_pcm_le(&bytes), vec![1, -1, i16::MIN]);
        // Odd trailing byte is dropped.
        assert_eq!(decode_pcm_le(&[0x02, 0x00, 0x7F]), vec![2]);
        assert!(decode_pcm_le(&[]).is_empty());
    }
}
