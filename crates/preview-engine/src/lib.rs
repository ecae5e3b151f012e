//! Playback pipeline for `!play` requests: catalog resolution, preview
//! staging, voice delivery and cleanup, one session per group.
//!
//! ```text
//!   TextCommand ──▶ Engine (single owner of every PlaybackSession)
//!                     │
//!                     ├── JoinAndResolve task ── VoiceTransport::join, CatalogResolver::resolve
//!                     ├── Fetch task ─────────── PreviewFetcher::fetch → StagingArea
//!                     ├── StartPlayback task ─── create_player / play / subscribe
//!                     └── PlayerEvent ◀───────── transport lifecycle (Playing / Error / Idle)
//! ```
//!
//! Every task reports back through the engine's event channel; sessions only
//! change state inside the engine loop.

pub mod catalog;
pub mod collab;
pub mod command;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod janitor;
pub mod presenter;
pub mod session;
pub mod status;

pub use catalog::{CatalogResolver, SpotifyCatalog};
pub use collab::{ChatGateway, Collaborators, VoiceTransport};
pub use engine::{Engine, EngineEvent, EngineHandle, EngineSettings};
pub use error::{FetchError, Rejection, ResolveError, TransportError};
pub use fetcher::{FetchOutcome, HttpPreviewFetcher, PreviewFetcher};
pub use janitor::{PreviewPayload, Release, ResourceJanitor, StagingArea, StagingKey};
pub use session::{PlaybackRequest, PlaybackSession};
pub use status::StatusBoard;
