//! Per-group playback state machine.
//!
//! ```text
//!   Idle ──request──▶ Resolving ──track──▶ Fetching ──payload──▶ Playing
//!    ▲                   │                    │                     │
//!    │                   └── failure / NoPreview ──▶ Leaving        │
//!    ├──────────────────────── left ◀───────────────────┘           │
//!    └───────────────────────────────────── Error / Idle ◀──────────┘
//! ```
//!
//! `PlaybackSession` performs no I/O.  Every transition returns the
//! `Effect`s the engine must carry out, which keeps the rules here testable
//! without a runtime.  The voice connection is left on every failure before
//! playback starts, and the session stays in `Leaving` until the transport
//! confirms, so the group's next request cannot join while the old leave is
//! still running.  Once a payload has been handed to the transport, a
//! terminal event only releases the payload and the connection stays joined.

use chrono::{DateTime, Utc};
use preview_proto::protocol::{
    AudioSource, ChannelId, ConnectionHandle, GroupId, MessageContent, PlayerEventKind, RequestId,
    ResultCard, SessionSnapshot, SessionState, TextCommand, TrackDescriptor, UserId,
};
use tracing::{debug, info, warn};

use crate::error::{FetchError, Rejection, ResolveError, TransportError};
use crate::fetcher::FetchOutcome;
use crate::janitor::{PreviewPayload, ResourceJanitor, StagingKey};
use crate::presenter;

/// One accepted `!play` command, consumed by the session that runs it.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackRequest {
    pub requester_id: UserId,
    pub group_id: GroupId,
    pub voice_channel_id: ChannelId,
    /// Text channel the command came from; replies go there.
    pub text_channel_id: ChannelId,
    pub query: String,
}

impl PlaybackRequest {
    pub fn from_command(cmd: &TextCommand, query: &str) -> Result<Self, Rejection> {
        let voice_channel_id = cmd.voice_channel_id.ok_or(Rejection::NoVoiceChannel)?;
        Ok(Self {
            requester_id: cmd.author_id,
            group_id: cmd.group_id,
            voice_channel_id,
            text_channel_id: cmd.channel_id,
            query: query.to_string(),
        })
    }
}

/// Work the engine performs on behalf of a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Join the voice channel, then resolve the query.
    JoinAndResolve {
        request_id: RequestId,
        voice_channel_id: ChannelId,
        query: String,
    },
    SendCard {
        channel_id: ChannelId,
        card: ResultCard,
    },
    Fetch {
        key: StagingKey,
        track: TrackDescriptor,
    },
    StartPlayback {
        connection: ConnectionHandle,
        source: AudioSource,
    },
    /// Start the Playing watchdog for this request.
    ArmDeadline { request_id: RequestId },
    Say {
        channel_id: ChannelId,
        content: MessageContent,
    },
    Leave(ConnectionHandle),
}

impl Effect {
    fn say(channel_id: ChannelId, text: String) -> Self {
        Effect::Say {
            channel_id,
            content: MessageContent::Text { text },
        }
    }
}

#[derive(Debug)]
enum Stage {
    Idle,
    Resolving {
        request_id: RequestId,
        reply_to: ChannelId,
    },
    Fetching {
        request_id: RequestId,
        reply_to: ChannelId,
        track: TrackDescriptor,
    },
    Playing {
        request_id: RequestId,
        reply_to: ChannelId,
        track: TrackDescriptor,
        payload: PreviewPayload,
    },
    Leaving {
        connection: ConnectionHandle,
    },
}

impl Stage {
    fn request_id(&self) -> Option<RequestId> {
        match self {
            Stage::Idle | Stage::Leaving { .. } => None,
            Stage::Resolving { request_id, .. }
            | Stage::Fetching { request_id, .. }
            | Stage::Playing { request_id, .. } => Some(*request_id),
        }
    }

    fn state(&self) -> SessionState {
        match self {
            Stage::Idle => SessionState::Idle,
            Stage::Resolving { .. } => SessionState::Resolving,
            Stage::Fetching { .. } => SessionState::Fetching,
            Stage::Playing { .. } => SessionState::Playing,
            Stage::Leaving { .. } => SessionState::Leaving,
        }
    }
}

pub struct PlaybackSession {
    group_id: GroupId,
    stage: Stage,
    /// Joined voice connection.  Kept after a natural completion so the next
    /// request finds the bot already in the channel.
    connection: Option<ConnectionHandle>,
    since: DateTime<Utc>,
}

impl PlaybackSession {
    pub fn new(group_id: GroupId) -> Self {
        Self {
            group_id,
            stage: Stage::Idle,
            connection: None,
            since: Utc::now(),
        }
    }

    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    pub fn state(&self) -> SessionState {
        self.stage.state()
    }

    pub fn request_id(&self) -> Option<RequestId> {
        self.stage.request_id()
    }

    pub fn connection(&self) -> Option<&ConnectionHandle> {
        self.connection.as_ref()
    }

    /// Path of the payload currently staged for this session, if any.
    pub fn staged_path(&self) -> Option<&std::path::Path> {
        match &self.stage {
            Stage::Playing { payload, .. } => Some(payload.path()),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let track_title = match &self.stage {
            Stage::Fetching { track, .. } | Stage::Playing { track, .. } => {
                Some(track.title.clone())
            }
            _ => None,
        };
        SessionSnapshot {
            group_id: self.group_id,
            state: self.state(),
            request_id: self.request_id(),
            track_title,
            connected: self.connection.is_some(),
            since: self.since,
        }
    }

    fn enter(&mut self, stage: Stage) {
        debug!(
            "Session {}: {} → {}",
            self.group_id,
            self.stage.state(),
            stage.state()
        );
        self.stage = stage;
        self.since = Utc::now();
    }

    /// Take the current stage if it belongs to `request_id`, leaving Idle.
    fn take_if_current(&mut self, request_id: RequestId) -> Option<Stage> {
        if self.stage.request_id() != Some(request_id) {
            debug!(
                "Session {}: ignoring stale result for request {} (current {:?})",
                self.group_id,
                request_id,
                self.stage.request_id()
            );
            return None;
        }
        let stage = std::mem::replace(&mut self.stage, Stage::Idle);
        self.since = Utc::now();
        Some(stage)
    }

    /// Hand the connection to the engine to leave and wait in `Leaving` for
    /// the transport to confirm.  Without a connection the session stays Idle.
    fn start_leaving(&mut self) -> Option<Effect> {
        let connection = self.connection.take()?;
        self.enter(Stage::Leaving {
            connection: connection.clone(),
        });
        Some(Effect::Leave(connection))
    }

    // ── transitions ───────────────────────────────────────────────────────────

    /// Idle + request → Resolving.  Any other state rejects with
    /// `SessionBusy` and produces no effects.
    pub fn begin(
        &mut self,
        request: PlaybackRequest,
        request_id: RequestId,
    ) -> Result<Vec<Effect>, Rejection> {
        if !self.state().is_idle() {
            info!(
                "Session {}: busy ({}), rejecting request {}",
                self.group_id,
                self.state(),
                request_id
            );
            return Err(Rejection::SessionBusy);
        }

        self.enter(Stage::Resolving {
            request_id,
            reply_to: request.text_channel_id,
        });
        Ok(vec![Effect::JoinAndResolve {
            request_id,
            voice_channel_id: request.voice_channel_id,
            query: request.query,
        }])
    }

    /// The voice join finished.  A failed join ends the request; nothing was
    /// joined, so there is nothing to leave.
    pub fn on_joined(
        &mut self,
        request_id: RequestId,
        result: Result<ConnectionHandle, TransportError>,
    ) -> Vec<Effect> {
        if self.stage.request_id() != Some(request_id) {
            // A late successful join for a request we no longer track still
            // holds a channel.
            return result
                .ok()
                .filter(|c| self.connection.as_ref() != Some(c))
                .map(Effect::Leave)
                .into_iter()
                .collect();
        }

        match result {
            Ok(connection) => {
                self.connection = Some(connection);
                Vec::new()
            }
            Err(e) => {
                warn!("Session {}: voice join failed: {}", self.group_id, e);
                let Some(Stage::Resolving { reply_to, .. }) = self.take_if_current(request_id)
                else {
                    return Vec::new();
                };
                vec![Effect::say(reply_to, presenter::join_failed())]
            }
        }
    }

    /// Resolving → Fetching on a track, → Idle (leaving voice) on failure.
    pub fn on_resolved(
        &mut self,
        request_id: RequestId,
        result: Result<TrackDescriptor, ResolveError>,
    ) -> Vec<Effect> {
        if !matches!(self.stage, Stage::Resolving { .. }) {
            return self.ignore("resolve", request_id);
        }
        let Some(Stage::Resolving { reply_to, .. }) = self.take_if_current(request_id) else {
            return Vec::new();
        };

        match result {
            Ok(track) => {
                info!(
                    "Session {}: resolved \"{}\" by {}",
                    self.group_id,
                    track.title,
                    track.primary_artist()
                );
                let effects = vec![
                    Effect::SendCard {
                        channel_id: reply_to,
                        card: presenter::render(&track),
                    },
                    Effect::Fetch {
                        key: StagingKey {
                            group_id: self.group_id,
                            request_id,
                        },
                        track: track.clone(),
                    },
                ];
                self.enter(Stage::Fetching {
                    request_id,
                    reply_to,
                    track,
                });
                effects
            }
            Err(e) => {
                warn!("Session {}: resolve failed: {}", self.group_id, e);
                let mut effects = vec![Effect::say(reply_to, presenter::not_found())];
                effects.extend(self.start_leaving());
                effects
            }
        }
    }

    /// Fetching → Playing on a staged payload, → Idle (leaving voice) on
    /// `NoPreview` or a fetch failure.
    pub fn on_fetched(
        &mut self,
        request_id: RequestId,
        result: Result<FetchOutcome, FetchError>,
    ) -> Vec<Effect> {
        if !matches!(self.stage, Stage::Fetching { .. })
            || self.stage.request_id() != Some(request_id)
        {
            if let Ok(FetchOutcome::Staged(mut payload)) = result {
                ResourceJanitor::release(&mut payload);
            }
            return self.ignore("fetch", request_id);
        }
        let Some(Stage::Fetching {
            reply_to, track, ..
        }) = self.take_if_current(request_id)
        else {
            return Vec::new();
        };

        match result {
            Ok(FetchOutcome::Staged(mut payload)) => {
                let source = payload.audio_source(&track.title);
                match (self.connection.clone(), source) {
                    (Some(connection), Some(source)) => {
                        self.enter(Stage::Playing {
                            request_id,
                            reply_to,
                            track,
                            payload,
                        });
                        vec![
                            Effect::StartPlayback { connection, source },
                            Effect::ArmDeadline { request_id },
                        ]
                    }
                    _ => {
                        warn!(
                            "Session {}: staged payload but no voice connection",
                            self.group_id
                        );
                        ResourceJanitor::release(&mut payload);
                        let mut effects =
                            vec![Effect::say(reply_to, presenter::playback_failed(&track.title))];
                        effects.extend(self.start_leaving());
                        effects
                    }
                }
            }
            Ok(FetchOutcome::NoPreview) => {
                info!("Session {}: no preview for \"{}\"", self.group_id, track.title);
                let mut effects = vec![Effect::say(reply_to, presenter::cannot_play(&track))];
                effects.extend(self.start_leaving());
                effects
            }
            Err(e) => {
                warn!("Session {}: fetch failed: {}", self.group_id, e);
                let mut effects = vec![Effect::say(reply_to, presenter::fetch_failed(&track))];
                effects.extend(self.start_leaving());
                effects
            }
        }
    }

    /// The create_player / play / subscribe sequence finished.  Only a
    /// failure moves the machine; success waits for player events.
    pub fn on_playback_started(
        &mut self,
        request_id: RequestId,
        result: Result<(), TransportError>,
    ) -> Vec<Effect> {
        match result {
            Ok(()) => {
                debug!(
                    "Session {}: audio delivery started for request {}",
                    self.group_id, request_id
                );
                Vec::new()
            }
            Err(e) => self.finish_playing(request_id, Some(e.to_string())),
        }
    }

    pub fn on_player_event(&mut self, request_id: RequestId, kind: PlayerEventKind) -> Vec<Effect> {
        match kind {
            PlayerEventKind::Playing => {
                if self.stage.request_id() == Some(request_id) {
                    info!("Session {}: the audio player has started playing", self.group_id);
                }
                Vec::new()
            }
            PlayerEventKind::Error {
                message,
                track_title,
            } => {
                warn!(
                    "Session {}: player error: {} with track {}",
                    self.group_id,
                    message,
                    track_title.as_deref().unwrap_or("<unknown>")
                );
                self.finish_playing(request_id, Some(message))
            }
            PlayerEventKind::Idle => self.finish_playing(request_id, None),
        }
    }

    /// No terminal event arrived in time.
    pub fn on_deadline(&mut self, request_id: RequestId) -> Vec<Effect> {
        if !matches!(self.stage, Stage::Playing { .. }) {
            return Vec::new();
        }
        warn!(
            "Session {}: no terminal player event for request {}, forcing idle",
            self.group_id, request_id
        );
        self.finish_playing(request_id, None)
    }

    /// Playing → Idle.  Releases the payload; the voice connection stays.
    fn finish_playing(&mut self, request_id: RequestId, failure: Option<String>) -> Vec<Effect> {
        if !matches!(self.stage, Stage::Playing { .. }) {
            return self.ignore("player", request_id);
        }
        let Some(Stage::Playing {
            reply_to,
            track,
            mut payload,
            ..
        }) = self.take_if_current(request_id)
        else {
            return Vec::new();
        };

        ResourceJanitor::release(&mut payload);
        match failure {
            Some(_) => vec![Effect::say(reply_to, presenter::playback_failed(&track.title))],
            None => {
                info!("Session {}: finished \"{}\"", self.group_id, track.title);
                Vec::new()
            }
        }
    }

    /// The transport finished leaving `connection`.  Only the leave this
    /// session is waiting for moves it back to Idle.
    pub fn on_left(&mut self, connection: &ConnectionHandle) -> Vec<Effect> {
        match &self.stage {
            Stage::Leaving { connection: leaving } if leaving == connection => {
                self.enter(Stage::Idle);
            }
            _ => debug!(
                "Session {}: ignoring leave of {:?} in state {}",
                self.group_id,
                connection,
                self.state()
            ),
        }
        Vec::new()
    }

    /// The voice connection was torn down externally.  Releases whatever is
    /// staged; the caller drops the session afterwards.
    pub fn on_disconnected(&mut self) {
        if let Stage::Playing { mut payload, .. } = std::mem::replace(&mut self.stage, Stage::Idle) {
            ResourceJanitor::release(&mut payload);
        }
        self.connection = None;
        self.since = Utc::now();
    }

    /// Process shutdown: release the payload and hand back the connection to
    /// leave.  A leave already in flight is not repeated.
    pub fn shutdown(&mut self) -> Vec<Effect> {
        if let Stage::Playing { mut payload, .. } = std::mem::replace(&mut self.stage, Stage::Idle) {
            ResourceJanitor::release(&mut payload);
        }
        self.since = Utc::now();
        self.connection.take().map(Effect::Leave).into_iter().collect()
    }

    fn ignore(&self, what: &str, request_id: RequestId) -> Vec<Effect> {
        debug!(
            "Session {}: ignoring {} result for request {} in state {}",
            self.group_id,
            what,
            request_id,
            self.state()
        );
        Vec::new()
    }
}
