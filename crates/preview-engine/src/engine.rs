//! Engine: single-owner event loop for every `PlaybackSession`.
//!
//! Commands, stage results and transport lifecycle events all arrive as
//! `EngineEvent`s on one channel.  The loop applies each event to the owning
//! session and carries out the returned effects, spawning a task for
//! anything that talks to a collaborator.  Those tasks report back through
//! the same channel, so no session is ever touched outside the loop.
//!
//! Chat messages go through a dedicated outbox task so that a slow gateway
//! never stalls a transition and messages for one channel keep their order.

use preview_proto::config::Config;
use preview_proto::protocol::{
    ConnectionHandle, GroupId, MessageContent, OutboundMessage, PlayerEvent, RequestId,
    TextCommand, TrackDescriptor,
};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::collab::Collaborators;
use crate::command;
use crate::error::{FetchError, Rejection, ResolveError, TransportError};
use crate::fetcher::FetchOutcome;
use crate::presenter;
use crate::session::{Effect, PlaybackRequest, PlaybackSession};
use crate::status::StatusBoard;

const EVENT_QUEUE: usize = 256;
/// How long shutdown waits for in-flight joins and leaves to report back.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

// ── EngineEvent ───────────────────────────────────────────────────────────────

/// All inputs into the engine loop.
#[derive(Debug)]
pub enum EngineEvent {
    /// A text message from the chat gateway.
    Command(TextCommand),
    Joined {
        group_id: GroupId,
        request_id: RequestId,
        result: Result<ConnectionHandle, TransportError>,
    },
    Resolved {
        group_id: GroupId,
        request_id: RequestId,
        result: Result<TrackDescriptor, ResolveError>,
    },
    Fetched {
        group_id: GroupId,
        request_id: RequestId,
        result: Result<FetchOutcome, FetchError>,
    },
    /// The create_player / play / subscribe sequence finished.
    PlaybackStarted {
        group_id: GroupId,
        request_id: RequestId,
        result: Result<(), TransportError>,
    },
    /// Lifecycle event forwarded from the voice transport.
    Player(PlayerEvent),
    Deadline {
        group_id: GroupId,
        request_id: RequestId,
    },
    /// A `leave` call returned, successfully or not.
    Left {
        group_id: GroupId,
        connection: ConnectionHandle,
    },
    /// The transport lost the group's voice connection.
    VoiceDisconnected(GroupId),
    Shutdown,
}

// ── EngineSettings ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub resolve_timeout: Duration,
    pub fetch_timeout: Duration,
    /// Upper bound on Playing without a terminal transport event.
    pub playback_deadline: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            resolve_timeout: config.catalog.resolve_timeout(),
            fetch_timeout: config.preview.fetch_timeout(),
            playback_deadline: config.playback.deadline(),
        }
    }
}

// ── EngineHandle ──────────────────────────────────────────────────────────────

/// Cheap, cloneable sender side of the engine loop.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineEvent>,
}

impl EngineHandle {
    pub async fn submit(&self, command: TextCommand) -> anyhow::Result<()> {
        self.send(EngineEvent::Command(command)).await
    }

    pub async fn player_event(&self, event: PlayerEvent) -> anyhow::Result<()> {
        self.send(EngineEvent::Player(event)).await
    }

    pub async fn voice_disconnected(&self, group_id: GroupId) -> anyhow::Result<()> {
        self.send(EngineEvent::VoiceDisconnected(group_id)).await
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.send(EngineEvent::Shutdown).await
    }

    async fn send(&self, event: EngineEvent) -> anyhow::Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| anyhow::anyhow!("engine loop has stopped"))
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

pub struct Engine {
    collab: Collaborators,
    settings: EngineSettings,
    status: StatusBoard,
    sessions: HashMap<GroupId, PlaybackSession>,
    /// Channel stage tasks use to report back into our own loop.
    event_tx: mpsc::Sender<EngineEvent>,
    outbox_tx: mpsc::UnboundedSender<OutboundMessage>,
    outbox_task: JoinHandle<()>,
    last_request_id: u64,
    /// Join and leave tasks that have not reported back yet.
    pending_joins: usize,
    pending_leaves: usize,
}

impl Engine {
    pub fn new(
        collab: Collaborators,
        settings: EngineSettings,
        status: StatusBoard,
        event_tx: mpsc::Sender<EngineEvent>,
    ) -> Self {
        let (outbox_tx, outbox_task) = spawn_outbox(collab.clone());
        Self {
            collab,
            settings,
            status,
            sessions: HashMap::new(),
            event_tx,
            outbox_tx,
            outbox_task,
            last_request_id: 0,
            pending_joins: 0,
            pending_leaves: 0,
        }
    }

    /// Build an engine and run it on its own task.
    pub fn spawn(
        collab: Collaborators,
        settings: EngineSettings,
        status: StatusBoard,
    ) -> (EngineHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        let engine = Engine::new(collab, settings, status, tx.clone());
        let task = tokio::spawn(engine.run(rx));
        (EngineHandle { tx }, task)
    }

    pub async fn run(mut self, mut event_rx: mpsc::Receiver<EngineEvent>) {
        info!("Engine: starting event loop");

        loop {
            match event_rx.recv().await {
                None => {
                    info!("Engine: event channel closed, shutting down");
                    break;
                }

                Some(EngineEvent::Shutdown) => {
                    info!("Engine: shutdown requested");
                    break;
                }

                Some(EngineEvent::Command(cmd)) => self.handle_command(cmd).await,

                Some(EngineEvent::Joined {
                    group_id,
                    request_id,
                    result,
                }) => {
                    self.pending_joins = self.pending_joins.saturating_sub(1);
                    let effects = match self.sessions.get_mut(&group_id) {
                        Some(session) => session.on_joined(request_id, result),
                        // Session was torn down while the join was in flight.
                        None => result.ok().map(Effect::Leave).into_iter().collect(),
                    };
                    self.apply(group_id, effects).await;
                }

                Some(EngineEvent::Resolved {
                    group_id,
                    request_id,
                    result,
                }) => {
                    self.with_session(group_id, |s| s.on_resolved(request_id, result))
                        .await;
                }

                Some(EngineEvent::Fetched {
                    group_id,
                    request_id,
                    result,
                }) => {
                    // A payload for a vanished session is dropped here, which
                    // removes its file.
                    self.with_session(group_id, |s| s.on_fetched(request_id, result))
                        .await;
                }

                Some(EngineEvent::PlaybackStarted {
                    group_id,
                    request_id,
                    result,
                }) => {
                    self.with_session(group_id, |s| s.on_playback_started(request_id, result))
                        .await;
                }

                Some(EngineEvent::Player(ev)) => {
                    self.with_session(ev.group_id, |s| s.on_player_event(ev.request_id, ev.kind))
                        .await;
                }

                Some(EngineEvent::Deadline {
                    group_id,
                    request_id,
                }) => {
                    self.with_session(group_id, |s| s.on_deadline(request_id))
                        .await;
                }

                Some(EngineEvent::Left {
                    group_id,
                    connection,
                }) => {
                    self.pending_leaves = self.pending_leaves.saturating_sub(1);
                    self.with_session(group_id, |s| s.on_left(&connection))
                        .await;
                }

                Some(EngineEvent::VoiceDisconnected(group_id)) => {
                    // Without a held connection the report is about a channel
                    // this session already gave up.
                    let held = self
                        .sessions
                        .get(&group_id)
                        .is_some_and(|s| s.connection().is_some());
                    if !held {
                        debug!("Engine: ignoring disconnect for group {}", group_id);
                        continue;
                    }
                    if let Some(mut session) = self.sessions.remove(&group_id) {
                        info!("Engine: voice connection for group {} lost", group_id);
                        session.on_disconnected();
                        self.status.remove(group_id).await;
                    }
                }
            }
        }

        self.cleanup(event_rx).await;
    }

    fn next_request_id(&mut self) -> RequestId {
        self.last_request_id += 1;
        RequestId(self.last_request_id)
    }

    async fn handle_command(&mut self, cmd: TextCommand) {
        let Some(query) = command::parse_play(&cmd.text) else {
            return;
        };

        let request = match PlaybackRequest::from_command(&cmd, query) {
            Ok(r) => r,
            Err(rejection) => return self.reject(&cmd, rejection),
        };

        let group_id = cmd.group_id;
        let request_id = self.next_request_id();
        let session = self
            .sessions
            .entry(group_id)
            .or_insert_with(|| PlaybackSession::new(group_id));

        match session.begin(request, request_id) {
            Ok(effects) => {
                info!(
                    "Engine: request {} in group {} for \"{}\"",
                    request_id, group_id, query
                );
                self.apply(group_id, effects).await;
            }
            Err(rejection) => self.reject(&cmd, rejection),
        }
    }

    fn reject(&self, cmd: &TextCommand, rejection: Rejection) {
        debug!("Engine: rejected command in group {}: {}", cmd.group_id, rejection);
        let text = match rejection {
            Rejection::NoVoiceChannel => presenter::no_voice_channel(),
            Rejection::SessionBusy => presenter::session_busy(),
        };
        self.post(OutboundMessage {
            group_id: cmd.group_id,
            channel_id: cmd.channel_id,
            content: MessageContent::Reply {
                user_id: cmd.author_id,
                text,
            },
        });
    }

    async fn with_session<F>(&mut self, group_id: GroupId, f: F)
    where
        F: FnOnce(&mut PlaybackSession) -> Vec<Effect>,
    {
        let Some(session) = self.sessions.get_mut(&group_id) else {
            debug!("Engine: no session for group {}, dropping event", group_id);
            return;
        };
        let effects = f(session);
        self.apply(group_id, effects).await;
    }

    /// Carry out `effects` and publish the group's new snapshot.
    async fn apply(&mut self, group_id: GroupId, effects: Vec<Effect>) {
        for effect in effects {
            self.execute(group_id, effect);
        }
        if let Some(session) = self.sessions.get(&group_id) {
            self.status.publish(session.snapshot()).await;
        }
    }

    fn execute(&mut self, group_id: GroupId, effect: Effect) {
        match effect {
            Effect::JoinAndResolve {
                request_id,
                voice_channel_id,
                query,
            } => {
                let voice = self.collab.voice.clone();
                let catalog = self.collab.catalog.clone();
                let tx = self.event_tx.clone();
                let resolve_timeout = self.settings.resolve_timeout;
                self.pending_joins += 1;
                tokio::spawn(async move {
                    let joined = voice.join(group_id, voice_channel_id).await;
                    let failed = joined.is_err();
                    let sent = tx
                        .send(EngineEvent::Joined {
                            group_id,
                            request_id,
                            result: joined,
                        })
                        .await;
                    if failed || sent.is_err() {
                        return;
                    }

                    let result = match tokio::time::timeout(resolve_timeout, catalog.resolve(&query))
                        .await
                    {
                        Ok(r) => r,
                        Err(_) => Err(ResolveError::CatalogUnavailable(format!(
                            "resolve timed out after {:?}",
                            resolve_timeout
                        ))),
                    };
                    let _ = tx
                        .send(EngineEvent::Resolved {
                            group_id,
                            request_id,
                            result,
                        })
                        .await;
                });
            }

            Effect::SendCard { channel_id, card } => self.post(OutboundMessage {
                group_id,
                channel_id,
                content: MessageContent::Card { card },
            }),

            Effect::Fetch { key, track } => {
                let fetcher = self.collab.fetcher.clone();
                let tx = self.event_tx.clone();
                let fetch_timeout = self.settings.fetch_timeout;
                tokio::spawn(async move {
                    // On timeout the fetch future is dropped, which discards
                    // its partial file.
                    let result = match tokio::time::timeout(fetch_timeout, fetcher.fetch(&track, key))
                        .await
                    {
                        Ok(r) => r,
                        Err(_) => Err(FetchError::Timeout(fetch_timeout)),
                    };
                    let _ = tx
                        .send(EngineEvent::Fetched {
                            group_id,
                            request_id: key.request_id,
                            result,
                        })
                        .await;
                });
            }

            Effect::StartPlayback { connection, source } => {
                let voice = self.collab.voice.clone();
                let tx = self.event_tx.clone();
                let request_id = source.request_id;
                tokio::spawn(async move {
                    let result = async {
                        let player = voice.create_player(group_id).await?;
                        voice.play(&player, source).await?;
                        voice.subscribe(&connection, &player).await
                    }
                    .await;
                    if let Err(e) = &result {
                        warn!("Engine: could not start playback in group {}: {}", group_id, e);
                    }
                    let _ = tx
                        .send(EngineEvent::PlaybackStarted {
                            group_id,
                            request_id,
                            result,
                        })
                        .await;
                });
            }

            Effect::ArmDeadline { request_id } => {
                let tx = self.event_tx.clone();
                let deadline = self.settings.playback_deadline;
                tokio::spawn(async move {
                    tokio::time::sleep(deadline).await;
                    let _ = tx
                        .send(EngineEvent::Deadline {
                            group_id,
                            request_id,
                        })
                        .await;
                });
            }

            Effect::Say {
                channel_id,
                content,
            } => self.post(OutboundMessage {
                group_id,
                channel_id,
                content,
            }),

            Effect::Leave(connection) => {
                let voice = self.collab.voice.clone();
                let tx = self.event_tx.clone();
                self.pending_leaves += 1;
                tokio::spawn(async move {
                    if let Err(e) = voice.leave(&connection).await {
                        warn!("Engine: leaving voice in group {} failed: {}", group_id, e);
                    }
                    let _ = tx
                        .send(EngineEvent::Left {
                            group_id,
                            connection,
                        })
                        .await;
                });
            }
        }
    }

    fn post(&self, message: OutboundMessage) {
        if self.outbox_tx.send(message).is_err() {
            error!("Engine: outbox closed, dropping chat message");
        }
    }

    /// Release every payload and leave every connection, then flush the
    /// outbox.  Joins still in flight are waited for and left as they land.
    async fn cleanup(mut self, mut event_rx: mpsc::Receiver<EngineEvent>) {
        let mut groups: Vec<GroupId> = self.sessions.keys().copied().collect();
        groups.sort();
        for group_id in groups {
            let Some(mut session) = self.sessions.remove(&group_id) else {
                continue;
            };
            for effect in session.shutdown() {
                if let Effect::Leave(connection) = effect {
                    if let Err(e) = self.collab.voice.leave(&connection).await {
                        warn!("Engine: leaving voice in group {} failed: {}", group_id, e);
                    }
                }
            }
            self.status.remove(group_id).await;
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while self.pending_joins + self.pending_leaves > 0 {
            match tokio::time::timeout_at(deadline, event_rx.recv()).await {
                Ok(Some(EngineEvent::Joined {
                    group_id, result, ..
                })) => {
                    self.pending_joins = self.pending_joins.saturating_sub(1);
                    if let Ok(connection) = result {
                        if let Err(e) = self.collab.voice.leave(&connection).await {
                            warn!("Engine: leaving voice in group {} failed: {}", group_id, e);
                        }
                    }
                }
                Ok(Some(EngineEvent::Left { .. })) => {
                    self.pending_leaves = self.pending_leaves.saturating_sub(1);
                }
                // Anything else is dropped; staged payloads delete their
                // files on drop.
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "Engine: gave up on {} join(s) and {} leave(s) still in flight",
                        self.pending_joins, self.pending_leaves
                    );
                    break;
                }
            }
        }

        drop(self.outbox_tx);
        if let Err(e) = self.outbox_task.await {
            warn!("Engine: outbox task ended abnormally: {}", e);
        }
        info!("Engine: stopped");
    }
}

fn spawn_outbox(
    collab: Collaborators,
) -> (mpsc::UnboundedSender<OutboundMessage>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundMessage>();
    let task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let channel_id = message.channel_id;
            if let Err(e) = collab.gateway.send(message).await {
                warn!("Engine: chat send to channel {} failed: {}", channel_id, e);
            }
        }
    });
    (tx, task)
}
