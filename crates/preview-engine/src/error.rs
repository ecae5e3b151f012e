//! Error taxonomy for the playback pipeline.
//!
//! Every variant is caught at the session boundary and turned into one chat
//! message; nothing here escapes the engine loop.

use std::time::Duration;
use thiserror::Error;

/// Why a text query did not become a track.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// The catalog returned no result (or the query was empty).
    #[error("no catalog match")]
    NotFound,

    /// The bearer session was rejected and could not be renewed.
    #[error("catalog session expired: {0}")]
    AuthExpired(String),

    /// The catalog cannot be used at all: startup grant failed, network
    /// failure, timeout or a server-side error.
    #[error("catalog unavailable: {0}")]
    CatalogUnavailable(String),
}

/// Failures while retrieving and staging a preview.  A missing preview URL is
/// not one of these; see `FetchOutcome::NoPreview`.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("preview request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("preview host answered HTTP {0}")]
    Status(u16),

    #[error("could not stage preview: {0}")]
    Storage(#[from] std::io::Error),

    #[error("preview exceeds {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("preview fetch timed out after {0:?}")]
    Timeout(Duration),
}

/// Failures reported by (or while talking to) the voice transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("voice transport rejected the call: {0}")]
    Rejected(String),

    #[error("voice transport did not answer within {0:?}")]
    Timeout(Duration),

    #[error("no voice transport connected")]
    Disconnected,
}

/// Requests turned away before any external call is made.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    #[error("a playback is already in progress for this group")]
    SessionBusy,

    #[error("requester is not in a voice channel")]
    NoVoiceChannel,
}
