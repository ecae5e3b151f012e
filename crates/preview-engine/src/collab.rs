//! Seams to the external collaborators: the chat gateway and the voice
//! transport.  Implementations live outside the engine (the daemon bridges
//! them over TCP; tests use in-memory mocks).

use async_trait::async_trait;
use preview_proto::protocol::{
    AudioSource, ChannelId, ConnectionHandle, GroupId, OutboundMessage, PlayerHandle,
};
use std::sync::Arc;

use crate::catalog::CatalogResolver;
use crate::error::TransportError;
use crate::fetcher::PreviewFetcher;

/// Outbound half of the chat platform.
#[async_trait]
pub trait ChatGateway: Send + Sync {
    async fn send(&self, message: OutboundMessage) -> anyhow::Result<()>;
}

/// Live voice delivery.  Lifecycle events (`Playing`, `Error`, `Idle`) are not
/// returned from these calls; whoever owns the transport forwards them to
/// `EngineHandle::player_event`.
#[async_trait]
pub trait VoiceTransport: Send + Sync {
    /// Join (or move to) `channel_id`.  Joining the channel already held is a
    /// no-op that returns the same handle.
    async fn join(
        &self,
        group_id: GroupId,
        channel_id: ChannelId,
    ) -> Result<ConnectionHandle, TransportError>;

    async fn leave(&self, connection: &ConnectionHandle) -> Result<(), TransportError>;

    async fn create_player(&self, group_id: GroupId) -> Result<PlayerHandle, TransportError>;

    async fn play(&self, player: &PlayerHandle, source: AudioSource) -> Result<(), TransportError>;

    async fn subscribe(
        &self,
        connection: &ConnectionHandle,
        player: &PlayerHandle,
    ) -> Result<(), TransportError>;
}

/// Everything the engine calls out to.
#[derive(Clone)]
pub struct Collaborators {
    pub gateway: Arc<dyn ChatGateway>,
    pub voice: Arc<dyn VoiceTransport>,
    pub catalog: Arc<dyn CatalogResolver>,
    pub fetcher: Arc<dyn PreviewFetcher>,
}
