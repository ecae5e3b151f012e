use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Current bridge protocol version.  Bump this when the wire format changes in
/// a breaking way.  Adapters check this on connect and can refuse to talk to
/// an incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

// ── identifiers ───────────────────────────────────────────────────────────────

macro_rules! snowflake {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

snowflake!(
    /// A chat community ("guild").  One playback session per group.
    GroupId
);
snowflake!(UserId);
snowflake!(
    /// A text or voice channel inside a group.
    ChannelId
);
snowflake!(
    /// Issued by the engine for every accepted request; strictly increasing.
    RequestId
);

// ── catalog data ──────────────────────────────────────────────────────────────

/// One resolved catalog track.  Never shared across requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackDescriptor {
    pub title: String,
    /// Ordered as the catalog lists them; the first one is the primary artist.
    pub artists: Vec<String>,
    pub catalog_url: String,
    #[serde(default)]
    pub album_art_url: Option<String>,
    #[serde(default)]
    pub preview_url: Option<String>,
}

impl TrackDescriptor {
    pub fn primary_artist(&self) -> &str {
        self.artists
            .first()
            .map(String::as_str)
            .unwrap_or("Unknown artist")
    }
}

/// Display card rendered for a resolved track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultCard {
    /// 0xRRGGBB
    pub color: u32,
    pub title: String,
    pub url: String,
    pub author: String,
    pub description: String,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
}

// ── chat gateway shapes ───────────────────────────────────────────────────────

/// A text message seen by the gateway adapter.  `voice_channel_id` is the
/// author's current voice channel, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextCommand {
    pub author_id: UserId,
    pub group_id: GroupId,
    pub channel_id: ChannelId,
    #[serde(default)]
    pub voice_channel_id: Option<ChannelId>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    Text { text: String },
    /// Text addressed to one user (a reply to their command).
    Reply { user_id: UserId, text: String },
    Card { card: ResultCard },
}

impl MessageContent {
    pub fn text(&self) -> Option<&str> {
        match self {
            MessageContent::Text { text } | MessageContent::Reply { text, .. } => Some(text),
            MessageContent::Card { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub group_id: GroupId,
    pub channel_id: ChannelId,
    pub content: MessageContent,
}

// ── voice transport shapes ────────────────────────────────────────────────────

/// A joined voice connection.  Transports key connections by group, so the
/// handle is the (group, channel) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionHandle {
    pub group_id: GroupId,
    pub channel_id: ChannelId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerHandle {
    pub group_id: GroupId,
    pub player_id: u64,
}

/// A fully staged audio file handed to the transport.  `request_id` and
/// `title` are resource metadata that come back on player events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioSource {
    pub request_id: RequestId,
    pub path: PathBuf,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PlayerEventKind {
    Playing,
    Error {
        message: String,
        #[serde(default)]
        track_title: Option<String>,
    },
    Idle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerEvent {
    pub group_id: GroupId,
    pub request_id: RequestId,
    pub kind: PlayerEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum VoiceOp {
    Join {
        group_id: GroupId,
        channel_id: ChannelId,
    },
    Leave {
        connection: ConnectionHandle,
    },
    CreatePlayer {
        group_id: GroupId,
    },
    Play {
        player: PlayerHandle,
        source: AudioSource,
    },
    Subscribe {
        connection: ConnectionHandle,
        player: PlayerHandle,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum VoiceResult {
    Joined { connection: ConnectionHandle },
    PlayerCreated { player: PlayerHandle },
    Done,
    Failed { message: String },
}

// ── session snapshots ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Resolving,
    Fetching,
    Playing,
    /// Waiting for the transport to confirm it left the voice channel.
    Leaving,
}

impl SessionState {
    pub fn is_idle(&self) -> bool {
        matches!(self, SessionState::Idle)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Idle => "idle",
            SessionState::Resolving => "resolving",
            SessionState::Fetching => "fetching",
            SessionState::Playing => "playing",
            SessionState::Leaving => "leaving",
        };
        f.write_str(label)
    }
}

/// Read-only view of one group's session, published after every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub group_id: GroupId,
    pub state: SessionState,
    pub request_id: Option<RequestId>,
    pub track_title: Option<String>,
    /// True while the session holds a voice connection.
    pub connected: bool,
    pub since: DateTime<Utc>,
}

// ── bridge frames ─────────────────────────────────────────────────────────────

/// Frames sent by the gateway/voice adapter to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Inbound {
    TextCommand(TextCommand),
    VoiceReply { call_id: u64, result: VoiceResult },
    PlayerEvent(PlayerEvent),
    /// The voice connection for this group was torn down outside our control.
    VoiceDisconnected { group_id: GroupId },
}

/// Frames sent by the daemon to adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Outbound {
    /// Sent immediately on connect.
    Hello { protocol_version: u32 },
    Send(OutboundMessage),
    VoiceCall { call_id: u64, op: VoiceOp },
    Log { message: String },
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Inbound(Inbound),
    Outbound(Outbound),
}

/// Frames larger than this are treated as a corrupt stream.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    /// Decode one frame from the front of `data`.  Returns `Ok(None)` when the
    /// buffer does not yet hold a complete frame.
    pub fn decode(data: &[u8]) -> anyhow::Result<Option<(Self, usize)>> {
        if data.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if len > MAX_FRAME_LEN {
            anyhow::bail!("Frame of {} bytes exceeds limit", len);
        }
        if data.len() < 4 + len {
            return Ok(None);
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok(Some((msg, 4 + len)))
    }
}
