use serde::{Deserialize, Serialize};

/// The two independent point balances tracked per user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointsKind {
    Mana,
    Elixir,
}

impl PointsKind {
    /// Short label used in chat announcements ("mp" / "ep").
    pub fn label(&self) -> &'static str {
        match self {
            Self::Mana => "mp",
            Self::Elixir => "ep",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserData {
    pub name: String,
    #[serde(default)]
    pub mana: i64,
    #[serde(default)]
    pub elixir: i64,
    #[serde(default = "unknown_id")]
    pub trovo_id: i64,
}

fn unknown_id() -> i64 {
    -1
}

impl UserData {
    pub fn new(name: impl Into<String>, trovo_id: i64) -> Self {
        Self {
            name: name.into(),
            mana: 0,
            elixir: 0,
            trovo_id,
        }
    }

    pub fn balance(&self, kind: PointsKind) -> i64 {
        match kind {
            PointsKind::Mana => self.mana,
            PointsKind::Elixir => self.elixir,
        }
    }
}

/// Normalized chat event handed to the command dispatcher.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub text: String,
    pub sender: UserData,
    pub roles: Vec<String>,
}

impl ChatMessage {
    /// Role tag the gateway assigns to the channel owner.
    pub const STREAMER_ROLE: &'static str = "streamer";

    pub fn is_streamer(&self) -> bool {
        self.roles.iter().any(|r| r == Self::STREAMER_ROLE)
    }
}

/// Persisted OAuth credential record. Loaded before each connect attempt and
/// saved back after every successful validate/refresh.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl Credentials {
    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none()
    }
}
