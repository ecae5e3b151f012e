use async_trait::async_trait;
use preview_engine::{ChatGateway, EngineHandle};
use preview_proto::protocol::{Inbound, Message, Outbound, OutboundMessage, PROTOCOL_VERSION};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use crate::voice::{BridgeVoiceTransport, VoiceRpc};

pub struct ClientHandle {
    pub id: usize,
}

/// Shared state of the adapter bridge: the outbound frame fan-out, the
/// connected clients and the voice call table.
#[derive(Clone)]
pub struct Bridge {
    outbound_tx: broadcast::Sender<Outbound>,
    clients: Arc<RwLock<Vec<ClientHandle>>>,
    rpc: VoiceRpc,
}

impl Bridge {
    pub fn new(outbound_tx: broadcast::Sender<Outbound>, voice_timeout: Duration) -> Self {
        let rpc = VoiceRpc::new(outbound_tx.clone(), voice_timeout);
        Self {
            outbound_tx,
            clients: Arc::new(RwLock::new(Vec::new())),
            rpc,
        }
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub fn gateway(&self) -> BridgeGateway {
        BridgeGateway {
            outbound_tx: self.outbound_tx.clone(),
        }
    }

    pub fn voice(&self) -> BridgeVoiceTransport {
        BridgeVoiceTransport::new(self.rpc.clone())
    }
}

/// Chat output: every connected adapter receives a `Send` frame.
pub struct BridgeGateway {
    outbound_tx: broadcast::Sender<Outbound>,
}

#[async_trait]
impl ChatGateway for BridgeGateway {
    async fn send(&self, message: OutboundMessage) -> anyhow::Result<()> {
        self.outbound_tx
            .send(Outbound::Send(message))
            .map(|_| ())
            .map_err(|_| anyhow::anyhow!("no bridge adapter connected"))
    }
}

pub fn start_server(
    bind_address: String,
    port: u16,
    bridge: Bridge,
    engine: EngineHandle,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);

        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind bridge socket {}: {}", addr, e);
                return;
            }
        };

        info!("Bridge listening at {}", addr);
        serve(listener, bridge, engine).await;
    })
}

pub async fn serve(listener: TcpListener, bridge: Bridge, engine: EngineHandle) {
    let mut client_id = 0usize;

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                client_id += 1;
                let id = client_id;

                bridge.clients.write().await.push(ClientHandle { id });
                info!("Bridge: adapter {} connected from {}", id, peer);

                let outbound_rx = bridge.outbound_tx.subscribe();
                let bridge = bridge.clone();
                let engine = engine.clone();

                tokio::spawn(async move {
                    handle_client(stream, id, &bridge, &engine, outbound_rx).await;

                    let remaining = {
                        let mut guard = bridge.clients.write().await;
                        guard.retain(|c| c.id != id);
                        guard.len()
                    };
                    info!("Bridge: adapter {} disconnected", id);
                    if remaining == 0 {
                        bridge.rpc.abandon_all().await;
                    }
                });
            }
            Err(e) => {
                error!("Bridge: failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    client_id: usize,
    bridge: &Bridge,
    engine: &EngineHandle,
    mut outbound_rx: broadcast::Receiver<Outbound>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    let hello = Message::Outbound(Outbound::Hello {
        protocol_version: PROTOCOL_VERSION,
    });
    match hello.encode() {
        Ok(encoded) => {
            if write_half.write_all(&encoded).await.is_err() {
                return;
            }
        }
        Err(e) => {
            error!("Bridge: could not encode hello: {}", e);
            return;
        }
    }

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => {
                        info!("Bridge: adapter {} closed connection", client_id);
                        break;
                    }
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);

                        loop {
                            match Message::decode(&read_buf) {
                                Ok(Some((Message::Inbound(frame), consumed))) => {
                                    read_buf.drain(..consumed);
                                    if !dispatch(frame, client_id, bridge, engine).await {
                                        warn!("Bridge: engine has stopped");
                                        return;
                                    }
                                }
                                Ok(Some((Message::Outbound(frame), consumed))) => {
                                    read_buf.drain(..consumed);
                                    debug!(
                                        "Bridge: ignoring outbound frame from adapter {}: {:?}",
                                        client_id, frame
                                    );
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    warn!("Bridge: dropping adapter {}: {}", client_id, e);
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("Bridge: read error from adapter {}: {}", client_id, e);
                        break;
                    }
                }
            }

            frame = outbound_rx.recv() => {
                match frame {
                    Ok(frame) => {
                        match Message::Outbound(frame).encode() {
                            Ok(encoded) => {
                                if write_half.write_all(&encoded).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => error!("Bridge: could not encode frame: {}", e),
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Bridge: adapter {} missed {} frames", client_id, n);
                    }
                    Err(_) => break,
                }
            }
        }
    }
}

/// Hand one inbound frame to its consumer.  False once the engine is gone.
async fn dispatch(
    frame: Inbound,
    client_id: usize,
    bridge: &Bridge,
    engine: &EngineHandle,
) -> bool {
    let sent = match frame {
        Inbound::TextCommand(cmd) => {
            debug!("Bridge: adapter {} text in group {}", client_id, cmd.group_id);
            engine.submit(cmd).await
        }
        Inbound::VoiceReply { call_id, result } => {
            bridge.rpc.complete(call_id, result).await;
            Ok(())
        }
        Inbound::PlayerEvent(ev) => engine.player_event(ev).await,
        Inbound::VoiceDisconnected { group_id } => engine.voice_disconnected(group_id).await,
    };
    sent.is_ok()
}
