/// Voice transport over the bridge.
///
/// ```text
///   BridgeVoiceTransport::join()/play()/...
///         │
///         └── VoiceRpc::call(op) ── Outbound::VoiceCall{call_id} ──▶ adapter
///                  ▲                                                  │
///                  └──── pending[call_id] ◀── Inbound::VoiceReply ───┘
/// ```
///
/// Every call waits at most `voice_timeout` for its reply.  A reply that
/// arrives after the timeout finds no pending entry and is dropped.
use async_trait::async_trait;
use preview_engine::{TransportError, VoiceTransport};
use preview_proto::protocol::{
    AudioSource, ChannelId, ConnectionHandle, GroupId, Outbound, PlayerHandle, VoiceOp,
    VoiceResult,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Mutex};
use tracing::{debug, warn};

type PendingCalls = Arc<Mutex<HashMap<u64, oneshot::Sender<VoiceResult>>>>;

/// Request/reply correlation for voice operations.  Cheap to clone.
#[derive(Clone)]
pub struct VoiceRpc {
    outbound_tx: broadcast::Sender<Outbound>,
    pending: PendingCalls,
    next_call: Arc<AtomicU64>,
    timeout: Duration,
}

impl VoiceRpc {
    pub fn new(outbound_tx: broadcast::Sender<Outbound>, timeout: Duration) -> Self {
        Self {
            outbound_tx,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_call: Arc::new(AtomicU64::new(1)),
            timeout,
        }
    }

    pub async fn call(&self, op: VoiceOp) -> Result<VoiceResult, TransportError> {
        if self.outbound_tx.receiver_count() == 0 {
            return Err(TransportError::Disconnected);
        }

        let call_id = self.next_call.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().await.insert(call_id, reply_tx);

        debug!("Voice: call {} {:?}", call_id, op);
        if self
            .outbound_tx
            .send(Outbound::VoiceCall { call_id, op })
            .is_err()
        {
            self.pending.lock().await.remove(&call_id);
            return Err(TransportError::Disconnected);
        }

        match tokio::time::timeout(self.timeout, reply_rx).await {
            Ok(Ok(VoiceResult::Failed { message })) => Err(TransportError::Rejected(message)),
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(TransportError::Disconnected),
            Err(_) => {
                self.pending.lock().await.remove(&call_id);
                warn!("Voice: call {} timed out", call_id);
                Err(TransportError::Timeout(self.timeout))
            }
        }
    }

    /// Route a `VoiceReply` frame to its waiting caller.
    pub async fn complete(&self, call_id: u64, result: VoiceResult) {
        match self.pending.lock().await.remove(&call_id) {
            Some(reply) => {
                let _ = reply.send(result);
            }
            None => debug!("Voice: dropping late reply for call {}", call_id),
        }
    }

    /// Fail every in-flight call, e.g. when the last adapter disconnects.
    pub async fn abandon_all(&self) {
        let abandoned = std::mem::take(&mut *self.pending.lock().await);
        if !abandoned.is_empty() {
            warn!("Voice: abandoning {} in-flight call(s)", abandoned.len());
        }
    }
}

fn unexpected(result: VoiceResult) -> TransportError {
    TransportError::Rejected(format!("unexpected reply {:?}", result))
}

pub struct BridgeVoiceTransport {
    rpc: VoiceRpc,
}

impl BridgeVoiceTransport {
    pub fn new(rpc: VoiceRpc) -> Self {
        Self { rpc }
    }

    async fn call_done(&self, op: VoiceOp) -> Result<(), TransportError> {
        match self.rpc.call(op).await? {
            VoiceResult::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

#[async_trait]
impl VoiceTransport for BridgeVoiceTransport {
    async fn join(
        &self,
        group_id: GroupId,
        channel_id: ChannelId,
    ) -> Result<ConnectionHandle, TransportError> {
        match self.rpc.call(VoiceOp::Join { group_id, channel_id }).await? {
            VoiceResult::Joined { connection } => Ok(connection),
            other => Err(unexpected(other)),
        }
    }

    async fn leave(&self, connection: &ConnectionHandle) -> Result<(), TransportError> {
        self.call_done(VoiceOp::Leave {
            connection: connection.clone(),
        })
        .await
    }

    async fn create_player(&self, group_id: GroupId) -> Result<PlayerHandle, TransportError> {
        match self.rpc.call(VoiceOp::CreatePlayer { group_id }).await? {
            VoiceResult::PlayerCreated { player } => Ok(player),
            other => Err(unexpected(other)),
        }
    }

    async fn play(&self, player: &PlayerHandle, source: AudioSource) -> Result<(), TransportError> {
        self.call_done(VoiceOp::Play {
            player: player.clone(),
            source,
        })
        .await
    }

    async fn subscribe(
        &self,
        connection: &ConnectionHandle,
        player: &PlayerHandle,
    ) -> Result<(), TransportError> {
        self.call_done(VoiceOp::Subscribe {
            connection: connection.clone(),
            player: player.clone(),
        })
        .await
    }
}
