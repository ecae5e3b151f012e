//! Result cards and user-visible texts.  Pure formatting, no state.

use preview_proto::protocol::{ResultCard, TrackDescriptor};

/// Catalog brand green.
pub const CARD_COLOR: u32 = 0x1DB954;

pub const CARD_CAPTION: &str = "Click the title to listen on Spotify.";

pub fn render(track: &TrackDescriptor) -> ResultCard {
    ResultCard {
        color: CARD_COLOR,
        title: track.title.clone(),
        url: track.catalog_url.clone(),
        author: track.primary_artist().to_string(),
        description: CARD_CAPTION.to_string(),
        thumbnail_url: track.album_art_url.clone(),
    }
}

pub fn no_voice_channel() -> String {
    "You need to join a voice channel first!".to_string()
}

pub fn session_busy() -> String {
    "Already playing in this server, wait for the current preview to finish.".to_string()
}

pub fn join_failed() -> String {
    "Could not join your voice channel.".to_string()
}

/// Used for every resolve failure, not only an empty result.
pub fn not_found() -> String {
    "Could not find the track.".to_string()
}

pub fn cannot_play(track: &TrackDescriptor) -> String {
    format!("Cannot play: {} by {}.", track.title, track.primary_artist())
}

pub fn fetch_failed(track: &TrackDescriptor) -> String {
    format!("Could not load the preview for {}.", track.title)
}

pub fn playback_failed(title: &str) -> String {
    format!("Playback failed for {}.", title)
}
