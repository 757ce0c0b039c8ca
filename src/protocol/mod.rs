//! Wire codec for the chat gateway protocol: JSON text frames over one
//! websocket. Outbound control frames are `PING`/`AUTH`; inbound frames are
//! `RESPONSE`/`PONG`/`CHAT` plus whatever else the gateway decides to send,
//! which decodes into an opaque variant and gets ignored upstream.

use rand::{distributions::Alphanumeric, Rng};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;

const NONCE_LEN: usize = 10;

/// Outbound protocol unit. Consumed exactly once by the outbound loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    Ping { nonce: String },
    Auth { nonce: String, token: String },
}

impl ControlFrame {
    pub fn ping() -> Self {
        Self::Ping {
            nonce: new_nonce(),
        }
    }

    pub fn auth(token: impl Into<String>) -> Self {
        Self::Auth {
            nonce: new_nonce(),
            token: token.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ping { .. } => "PING",
            Self::Auth { .. } => "AUTH",
        }
    }

    /// Canonical JSON text for this frame. Always succeeds.
    pub fn encode(&self) -> String {
        let value = match self {
            Self::Ping { nonce } => serde_json::json!({
                "type": "PING",
                "nonce": nonce,
            }),
            Self::Auth { nonce, token } => serde_json::json!({
                "type": "AUTH",
                "nonce": nonce,
                "data": { "token": token },
            }),
        };
        value.to_string()
    }
}

/// Correlation token for outbound frames. Best-effort unique; the gateway does
/// not branch on it, so collisions are harmless.
pub fn new_nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(NONCE_LEN)
        .map(char::from)
        .collect()
}

/// A decoded frame from the gateway.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    /// Auth acknowledgement.
    Response {
        nonce: String,
        error: Option<String>,
    },
    /// Heartbeat answer, optionally carrying a server-adjusted gap in seconds.
    Pong { gap_secs: Option<u64> },
    /// A batch of chat entries, in server order.
    Chat { entries: Vec<ChatEntry> },
    /// Anything this client does not know about.
    Other { kind: String },
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    nonce: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    data: Value,
}

/// Decode one inbound text frame. Fails only for invalid JSON or a frame
/// without a usable `type` field; unknown types decode into [`InboundMessage::Other`].
pub fn decode(text: &str) -> Result<InboundMessage, ProtocolError> {
    let raw: RawEnvelope = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;

    let msg = match raw.kind.as_str() {
        "RESPONSE" => InboundMessage::Response {
            nonce: raw.nonce,
            error: raw.error,
        },
        "PONG" => InboundMessage::Pong {
            gap_secs: raw.data.get("gap").and_then(Value::as_u64),
        },
        "CHAT" => InboundMessage::Chat {
            entries: decode_entries(&raw.data),
        },
        _ => InboundMessage::Other { kind: raw.kind },
    };
    Ok(msg)
}

fn decode_entries(data: &Value) -> Vec<ChatEntry> {
    let Some(raw_entries) = data.get("chats").and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut entries = Vec::with_capacity(raw_entries.len());
    for raw in raw_entries {
        match serde_json::from_value::<ChatEntry>(raw.clone()) {
            Ok(entry) => entries.push(entry),
            Err(err) => {
                tracing::warn!(error = %err, "undecodable chat entry skipped");
            }
        }
    }
    entries
}

/// One user-visible chat/event item inside a CHAT frame. Optional fields take
/// documented defaults instead of failing the whole frame.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChatEntry {
    #[serde(rename = "type")]
    pub kind_code: i64,
    pub content: String,
    pub nick_name: String,
    pub avatar: String,
    pub sub_tier: i64,
    pub medals: Vec<Value>,
    pub roles: Vec<String>,
    pub message_id: String,
    pub sender_id: i64,
    pub send_time: i64,
}

impl Default for ChatEntry {
    fn default() -> Self {
        Self {
            kind_code: 0,
            content: String::new(),
            nick_name: String::new(),
            avatar: String::new(),
            sub_tier: -1,
            medals: Vec::new(),
            roles: Vec::new(),
            message_id: String::new(),
            sender_id: 0,
            send_time: 0,
        }
    }
}

impl ChatEntry {
    pub fn kind(&self) -> ChatEntryKind {
        ChatEntryKind::from_code(self.kind_code)
    }

    /// Payload of a spells entry, carried as a JSON document inside `content`.
    pub fn spell_content(&self) -> Result<SpellContent, ProtocolError> {
        serde_json::from_str(&self.content).map_err(ProtocolError::Malformed)
    }
}

/// Event-kind codes the gateway assigns to chat entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatEntryKind {
    Normal,
    Spells,
    MagicSuperCap,
    MagicColorful,
    MagicSpell,
    MagicBulletScreen,
    Subscription,
    System,
    Follow,
    Welcome,
    GiftSubRandom,
    GiftSubDetailed,
    ActivityEvent,
    WelcomeFromRaid,
    CustomSpells,
    StreamToggle,
    Unfollow,
    Unknown,
}

impl ChatEntryKind {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => Self::Normal,
            5 => Self::Spells,
            6 => Self::MagicSuperCap,
            7 => Self::MagicColorful,
            8 => Self::MagicSpell,
            9 => Self::MagicBulletScreen,
            5001 => Self::Subscription,
            5002 => Self::System,
            5003 => Self::Follow,
            5004 => Self::Welcome,
            5005 => Self::GiftSubRandom,
            5006 => Self::GiftSubDetailed,
            5007 => Self::ActivityEvent,
            5008 => Self::WelcomeFromRaid,
            5009 => Self::CustomSpells,
            5012 => Self::StreamToggle,
            5013 => Self::Unfollow,
            _ => Self::Unknown,
        }
    }
}

/// Content of a spells (gift) entry.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SpellContent {
    pub value_type: String,
    pub gift_value: i64,
    pub num: i64,
}

#[derive(Debug)]
pub enum ProtocolError {
    Malformed(serde_json::Error),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(err) => write!(f, "malformed frame: {err}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_ping_has_type_and_nonce() {
        let frame = ControlFrame::ping();
        let value: Value = serde_json::from_str(&frame.encode()).unwrap();
        assert_eq!(value["type"], "PING");
        let nonce = value["nonce"].as_str().unwrap();
        assert_eq!(nonce.len(), NONCE_LEN);
        assert!(nonce.chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(value.get("data").is_none());
    }

    #[test]
    fn encode_auth_carries_token() {
        let frame = ControlFrame::auth("chat-token-1");
        let value: Value = serde_json::from_str(&frame.encode()).unwrap();
        assert_eq!(value["type"], "AUTH");
        assert_eq!(value["data"]["token"], "chat-token-1");
        assert!(value["nonce"].is_string());
    }

    #[test]
    fn decode_pong_with_gap() {
        let msg = decode(r#"{"type":"PONG","data":{"gap":45}}"#).unwrap();
        match msg {
            InboundMessage::Pong { gap_secs } => assert_eq!(gap_secs, Some(45)),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn decode_pong_without_gap() {
        let msg = decode(r#"{"type":"PONG","data":{}}"#).unwrap();
        match msg {
            InboundMessage::Pong { gap_secs } => assert_eq!(gap_secs, None),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn decode_response_keeps_error() {
        let msg = decode(r#"{"type":"RESPONSE","nonce":"abc","error":"bad token"}"#).unwrap();
        match msg {
            InboundMessage::Response { nonce, error } => {
                assert_eq!(nonce, "abc");
                assert_eq!(error.as_deref(), Some("bad token"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn decode_chat_preserves_entry_order() {
        let msg = decode(
            r#"{"type":"CHAT","data":{"chats":[
                {"type":0,"content":"first","nick_name":"a","sender_id":1,"send_time":10},
                {"type":0,"content":"second","nick_name":"b","sender_id":2,"send_time":11}
            ]}}"#,
        )
        .unwrap();
        match msg {
            InboundMessage::Chat { entries } => {
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[0].content, "first");
                assert_eq!(entries[1].content, "second");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn chat_entry_missing_optionals_takes_defaults() {
        let msg = decode(r#"{"type":"CHAT","data":{"chats":[{"type":0,"content":"hi"}]}}"#).unwrap();
        let InboundMessage::Chat { entries } = msg else {
            panic!("expected chat");
        };
        let entry = &entries[0];
        assert_eq!(entry.sub_tier, -1);
        assert_eq!(entry.sender_id, 0);
        assert_eq!(entry.send_time, 0);
        assert!(entry.medals.is_empty());
        assert!(entry.roles.is_empty());
    }

    #[test]
    fn decode_chat_without_chats_field_is_empty() {
        let msg = decode(r#"{"type":"CHAT","data":{}}"#).unwrap();
        let InboundMessage::Chat { entries } = msg else {
            panic!("expected chat");
        };
        assert!(entries.is_empty());
    }

    #[test]
    fn unknown_type_decodes_as_other() {
        let msg = decode(r#"{"type":"SHINY_NEW_THING","data":{}}"#).unwrap();
        match msg {
            InboundMessage::Other { kind } => assert_eq!(kind, "SHINY_NEW_THING"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn invalid_json_is_malformed() {
        assert!(decode("not json at all").is_err());
    }

    #[test]
    fn missing_type_field_is_malformed() {
        assert!(decode(r#"{"nonce":"x","data":{}}"#).is_err());
    }

    #[test]
    fn entry_kind_codes_map() {
        assert_eq!(ChatEntryKind::from_code(0), ChatEntryKind::Normal);
        assert_eq!(ChatEntryKind::from_code(5), ChatEntryKind::Spells);
        assert_eq!(ChatEntryKind::from_code(5001), ChatEntryKind::Subscription);
        assert_eq!(ChatEntryKind::from_code(5013), ChatEntryKind::Unfollow);
        assert_eq!(ChatEntryKind::from_code(424242), ChatEntryKind::Unknown);
    }

    #[test]
    fn spell_content_parses_from_entry_content() {
        let entry = ChatEntry {
            kind_code: 5,
            content: r#"{"value_type":"Mana","gift_value":10,"num":3}"#.to_string(),
            ..ChatEntry::default()
        };
        let spell = entry.spell_content().unwrap();
        assert_eq!(spell.value_type, "Mana");
        assert_eq!(spell.gift_value, 10);
        assert_eq!(spell.num, 3);
    }

    #[test]
    fn nonces_are_fixed_length_alphanumeric() {
        let a = new_nonce();
        let b = new_nonce();
        assert_eq!(a.len(), NONCE_LEN);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        // best-effort uniqueness, not a hard guarantee
        assert_ne!(a, b);
    }
}
