//! In-memory collaborators and a harness around a running engine.

#![allow(dead_code)]

use async_trait::async_trait;
use preview_engine::{
    CatalogResolver, ChatGateway, Collaborators, Engine, EngineHandle, EngineSettings,
    FetchError, FetchOutcome, PreviewFetcher, ResolveError, StagingArea, StagingKey,
    StatusBoard, TransportError, VoiceTransport,
};
use preview_proto::protocol::{
    AudioSource, ChannelId, ConnectionHandle, GroupId, MessageContent, OutboundMessage,
    PlayerHandle, ResultCard, SessionSnapshot, SessionState, TextCommand, TrackDescriptor,
    UserId,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

pub const TEXT_CHANNEL: ChannelId = ChannelId(500);
pub const VOICE_CHANNEL: ChannelId = ChannelId(600);

pub fn daft_punk(preview: bool) -> TrackDescriptor {
    TrackDescriptor {
        title: "One More Time".into(),
        artists: vec!["Daft Punk".into()],
        catalog_url: "https://open.spotify.com/track/0DiWol3AO6WpXZgp0goxAV".into(),
        album_art_url: Some("https://i.scdn.co/image/discovery".into()),
        preview_url: preview.then(|| "https://p.scdn.co/mp3-preview/omt".to_string()),
    }
}

pub fn play(group: u64, query: &str) -> TextCommand {
    TextCommand {
        author_id: UserId(42),
        group_id: GroupId(group),
        channel_id: TEXT_CHANNEL,
        voice_channel_id: Some(VOICE_CHANNEL),
        text: format!("!play {}", query),
    }
}

/// Poll `check` until it holds, panicking after two seconds.
pub async fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Async variant of `eventually`.
pub async fn eventually_async<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check().await {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ── gateway ───────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingGateway {
    sent: Mutex<Vec<OutboundMessage>>,
}

#[async_trait]
impl ChatGateway for RecordingGateway {
    async fn send(&self, message: OutboundMessage) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(message);
        Ok(())
    }
}

impl RecordingGateway {
    pub fn messages(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.messages()
            .iter()
            .filter_map(|m| m.content.text().map(str::to_string))
            .collect()
    }

    pub fn cards(&self) -> Vec<ResultCard> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m.content {
                MessageContent::Card { card } => Some(card),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

// ── voice ─────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockVoice {
    pub fail_join: AtomicBool,
    pub fail_play: AtomicBool,
    /// Milliseconds `join` and `leave` take before answering.
    pub join_delay_ms: AtomicU64,
    pub leave_delay_ms: AtomicU64,
    /// Completed joins and leaves, in the order they returned.
    calls: Mutex<Vec<&'static str>>,
    joins: AtomicUsize,
    leaves: Mutex<Vec<ConnectionHandle>>,
    plays: Mutex<Vec<AudioSource>>,
    subscribes: AtomicUsize,
    next_player: AtomicU64,
}

#[async_trait]
impl VoiceTransport for MockVoice {
    async fn join(
        &self,
        group_id: GroupId,
        channel_id: ChannelId,
    ) -> Result<ConnectionHandle, TransportError> {
        self.joins.fetch_add(1, Ordering::SeqCst);
        delay(&self.join_delay_ms).await;
        if self.fail_join.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected("missing permissions".into()));
        }
        self.calls.lock().unwrap().push("join");
        Ok(ConnectionHandle {
            group_id,
            channel_id,
        })
    }

    async fn leave(&self, connection: &ConnectionHandle) -> Result<(), TransportError> {
        delay(&self.leave_delay_ms).await;
        self.calls.lock().unwrap().push("leave");
        self.leaves.lock().unwrap().push(connection.clone());
        Ok(())
    }

    async fn create_player(&self, group_id: GroupId) -> Result<PlayerHandle, TransportError> {
        Ok(PlayerHandle {
            group_id,
            player_id: self.next_player.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn play(&self, _player: &PlayerHandle, source: AudioSource) -> Result<(), TransportError> {
        if self.fail_play.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected("no opus encoder".into()));
        }
        self.plays.lock().unwrap().push(source);
        Ok(())
    }

    async fn subscribe(
        &self,
        _connection: &ConnectionHandle,
        _player: &PlayerHandle,
    ) -> Result<(), TransportError> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn delay(ms: &AtomicU64) {
    let ms = ms.load(Ordering::SeqCst);
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

impl MockVoice {
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn joins(&self) -> usize {
        self.joins.load(Ordering::SeqCst)
    }

    pub fn leaves(&self) -> Vec<ConnectionHandle> {
        self.leaves.lock().unwrap().clone()
    }

    pub fn plays(&self) -> Vec<AudioSource> {
        self.plays.lock().unwrap().clone()
    }

    pub fn subscribes(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }
}

// ── catalog ───────────────────────────────────────────────────────────────────

/// Answers by exact query; anything unknown is `NotFound`.
#[derive(Default)]
pub struct MockCatalog {
    tracks: Mutex<HashMap<String, TrackDescriptor>>,
    calls: AtomicUsize,
}

impl MockCatalog {
    pub fn with_track(self, query: &str, track: TrackDescriptor) -> Self {
        self.tracks.lock().unwrap().insert(query.to_string(), track);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CatalogResolver for MockCatalog {
    async fn resolve(&self, query: &str) -> Result<TrackDescriptor, ResolveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.tracks
            .lock()
            .unwrap()
            .get(query)
            .cloned()
            .ok_or(ResolveError::NotFound)
    }
}

// ── fetcher ───────────────────────────────────────────────────────────────────

/// Stages a few fake bytes for every track that has a preview URL.  Fetches
/// block while the gate is closed.
pub struct GatedFetcher {
    staging: StagingArea,
    gate: Semaphore,
    pub fail_status: Mutex<Option<u16>>,
    calls: AtomicUsize,
}

impl GatedFetcher {
    pub fn new(staging: StagingArea) -> Self {
        Self {
            staging,
            gate: Semaphore::new(Semaphore::MAX_PERMITS),
            fail_status: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn closed(staging: StagingArea) -> Self {
        Self {
            gate: Semaphore::new(0),
            ..Self::new(staging)
        }
    }

    pub fn open(&self) {
        self.gate.add_permits(1024);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PreviewFetcher for GatedFetcher {
    async fn fetch(
        &self,
        track: &TrackDescriptor,
        key: StagingKey,
    ) -> Result<FetchOutcome, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| FetchError::Status(503))?;

        if track.preview_url.is_none() {
            return Ok(FetchOutcome::NoPreview);
        }
        let failure = *self.fail_status.lock().unwrap();
        if let Some(status) = failure {
            return Err(FetchError::Status(status));
        }
        let payload = self.staging.stage_bytes(key, b"ID3\x04fake-mp3").await?;
        Ok(FetchOutcome::Staged(payload))
    }
}

// ── harness ───────────────────────────────────────────────────────────────────

pub struct Harness {
    pub handle: EngineHandle,
    pub task: JoinHandle<()>,
    pub status: StatusBoard,
    pub gateway: Arc<RecordingGateway>,
    pub voice: Arc<MockVoice>,
    pub catalog: Arc<MockCatalog>,
    pub fetcher: Arc<GatedFetcher>,
    pub staging: tempfile::TempDir,
}

pub struct HarnessBuilder {
    catalog: MockCatalog,
    gated: bool,
    settings: EngineSettings,
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            catalog: MockCatalog::default()
                .with_track("Daft Punk One More Time", daft_punk(true)),
            gated: false,
            settings: EngineSettings {
                resolve_timeout: Duration::from_secs(1),
                fetch_timeout: Duration::from_secs(5),
                playback_deadline: Duration::from_secs(30),
            },
        }
    }

    pub async fn snapshot(&self, group: u64) -> Option<SessionSnapshot> {
        self.status.get(GroupId(group)).await
    }

    pub async fn wait_for_state(&self, group: u64, state: SessionState) {
        let status = self.status.clone();
        eventually_async(&format!("group {} to reach {}", group, state), || {
            let status = status.clone();
            async move {
                status
                    .get(GroupId(group))
                    .await
                    .is_some_and(|s| s.state == state)
            }
        })
        .await;
    }

    pub async fn wait_for_text(&self, text: &str) {
        let gateway = self.gateway.clone();
        eventually(&format!("message {:?}", text), || {
            gateway.texts().iter().any(|t| t == text)
        })
        .await;
    }

    /// Wait until every message posted so far has reached the gateway: a
    /// voiceless command in an unrelated group gets a reply through the same
    /// ordered outbox.
    pub async fn settle(&self) {
        let before = self.gateway.count();
        let mut probe = play(9_999, "probe");
        probe.voice_channel_id = None;
        self.handle.submit(probe).await.unwrap();
        let gateway = self.gateway.clone();
        eventually("outbox to drain", || gateway.count() > before).await;
    }

    pub fn staged_files(&self) -> usize {
        std::fs::read_dir(self.staging.path()).unwrap().count()
    }
}

impl HarnessBuilder {
    pub fn track(mut self, query: &str, track: TrackDescriptor) -> Self {
        self.catalog = self.catalog.with_track(query, track);
        self
    }

    pub fn gated(mut self) -> Self {
        self.gated = true;
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.settings.playback_deadline = deadline;
        self
    }

    pub fn start(self) -> Harness {
        let staging = tempfile::tempdir().unwrap();
        let area = StagingArea::new(staging.path());
        let fetcher = Arc::new(if self.gated {
            GatedFetcher::closed(area)
        } else {
            GatedFetcher::new(area)
        });
        let gateway = Arc::new(RecordingGateway::default());
        let voice = Arc::new(MockVoice::default());
        let catalog = Arc::new(self.catalog);
        let status = StatusBoard::new();

        let collab = Collaborators {
            gateway: gateway.clone(),
            voice: voice.clone(),
            catalog: catalog.clone(),
            fetcher: fetcher.clone(),
        };
        let (handle, task) = Engine::spawn(collab, self.settings, status.clone());

        Harness {
            handle,
            task,
            status,
            gateway,
            voice,
            catalog,
            fetcher,
            staging,
        }
    }
}
