//! Node (spec §4.6): wires discovery to peer-connection lifecycle and
//! routes typed messages between peer connections and the transfer engine.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::discovery::{DiscoveryBackend, DiscoveryEngine, DiscoveryEvent, LocalService};
use crate::error::EngineError;
use crate::identity;
use crate::log_layer;
use crate::peer::{PeerConnEvent, PeerConnection};
use crate::protocol::types::{LogEntry, Message, NotifyCompletion, TransferRequest, TransferResponse};
use crate::signalling::SignallingListener;
use crate::transfer::{FileSource, PeerSink, ProgressReport, Receiver, ReceiverEvent, Sender};

/// Capacity of the broadcast channel carrying [`NodeEvent`]s to the app.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events the engine reports to the application (the "out" stream of the
/// direction-typed event bus, spec §9).
#[derive(Debug, Clone)]
pub enum NodeEvent {
    PeerAdded { peer_id: String },
    PeerRemoved { peer_id: String },
    /// Forwarded verbatim so the application can prompt the user.
    TransferRequest { from_peer: String, request: TransferRequest },
    NotifyCompletion(NotifyCompletion),
}

/// Commands the application issues to the engine (the "in" stream, spec
/// §9). Callbacks from the original design become "send a command and
/// await the reply correlated by transfer id" where a reply is needed.
pub enum NodeCommand {
    SendFiles { recipients: Vec<String>, files: Vec<FileSource>, reply: oneshot::Sender<Uuid> },
    /// The user's authorization decision for a transfer requested by
    /// `to_peer`, routed to that peer's control sub-channel.
    RespondToTransfer { to_peer: String, transfer_id: Uuid, authorized: bool },
    CancelTransfer { transfer_id: Uuid },
    ProgressReport { transfer_id: Uuid, reply: oneshot::Sender<Option<ProgressReport>> },
    Shutdown,
}

type PeerMap = Arc<Mutex<HashMap<String, Arc<PeerConnection>>>>;

/// Handle used by the application to drive a running [`Node`].
#[derive(Clone)]
pub struct NodeHandle {
    cmd_tx: mpsc::Sender<NodeCommand>,
    event_tx: broadcast::Sender<NodeEvent>,
    log_tx: broadcast::Sender<LogEntry>,
}

impl NodeHandle {
    pub fn subscribe_events(&self) -> broadcast::Receiver<NodeEvent> {
        self.event_tx.subscribe()
    }

    /// Subscribe to captured log entries, decoupled from however the host
    /// application otherwise sets up its own output.
    pub fn subscribe_logs(&self) -> broadcast::Receiver<LogEntry> {
        self.log_tx.subscribe()
    }

    pub async fn send_files(&self, recipients: Vec<String>, files: Vec<FileSource>) -> Result<Uuid, EngineError> {
        let (reply, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(NodeCommand::SendFiles { recipients, files, reply })
            .await
            .map_err(|_| EngineError::Shutdown)?;
        reply_rx.await.map_err(|_| EngineError::Shutdown)
    }

    pub async fn respond_to_transfer(&self, to_peer: String, transfer_id: Uuid, authorized: bool) -> Result<(), EngineError> {
        self.cmd_tx
            .send(NodeCommand::RespondToTransfer { to_peer, transfer_id, authorized })
            .await
            .map_err(|_| EngineError::Shutdown)
    }

    pub async fn cancel_transfer(&self, transfer_id: Uuid) -> Result<(), EngineError> {
        self.cmd_tx.send(NodeCommand::CancelTransfer { transfer_id }).await.map_err(|_| EngineError::Shutdown)
    }

    pub async fn progress_report(&self, transfer_id: Uuid) -> Result<Option<ProgressReport>, EngineError> {
        let (reply, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(NodeCommand::ProgressReport { transfer_id, reply })
            .await
            .map_err(|_| EngineError::Shutdown)?;
        reply_rx.await.map_err(|_| EngineError::Shutdown)
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(NodeCommand::Shutdown).await;
    }
}

struct NodePeerSink {
    peers: PeerMap,
}

#[async_trait]
impl PeerSink for NodePeerSink {
    async fn send_to(&self, peer_id: &str, msg: Message) -> Result<(), EngineError> {
        let peers = self.peers.lock().await;
        match peers.get(peer_id) {
            Some(pc) => pc.send(msg).await,
            None => Err(EngineError::PeerNotFound(peer_id.to_string())),
        }
    }
}

/// The façade wiring discovery, peer connections, and the transfer engine
/// together (spec §4.6).
pub struct Node;

impl Node {
    /// Starts the engine: binds the signalling listener, starts advertising
    /// and browsing for peers, and runs the dispatcher loop on a background
    /// task.
    pub async fn spawn(
        config: EngineConfig,
        discovery_backend: Arc<dyn DiscoveryBackend>,
    ) -> Result<NodeHandle, EngineError> {
        let (capture_layer, _initial_log_rx) = log_layer::build_log_channel();
        let log_tx = capture_layer.sender();
        let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
        // Fails harmlessly if a global subscriber is already installed (e.g.
        // a second `Node` in the same process, or a test harness) — logs
        // just won't be captured for this instance in that case.
        let _ = tracing_subscriber::registry().with(filter).with(capture_layer).try_init();

        let listen_addr = SocketAddr::new(
            std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            config.signalling_port,
        );
        let listener = SignallingListener::bind(listen_addr).await?;
        let bound_port = listener.local_addr()?.port();

        let local_id = config.device_name.clone();
        let peers: PeerMap = Arc::new(Mutex::new(HashMap::new()));

        let listener_peers = peers.clone();
        tokio::spawn(listener.accept_loop(move |env| {
            let peers = listener_peers.clone();
            tokio::spawn(async move {
                let pc = peers.lock().await.get(&env.sender).cloned();
                match pc {
                    Some(pc) => pc.on_signalling(env).await,
                    None => warn!(sender = %env.sender, "signalling frame from unknown peer, dropping"),
                }
            });
        }));

        let local_service = LocalService { device_name: local_id.clone(), ip: config.ip, port: bound_port };
        let (discovery_handle, discovery_events) = DiscoveryEngine::spawn(discovery_backend, local_service);

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (peer_conn_tx, peer_conn_rx) = mpsc::channel(256);
        let (receiver_event_tx, receiver_event_rx) = mpsc::channel(64);

        let sink = Arc::new(NodePeerSink { peers: peers.clone() });
        let sender = Arc::new(Sender::new(local_id.clone(), sink));
        let receiver = Arc::new(Receiver::new(config.download_dir.clone(), receiver_event_tx));

        let state = NodeState {
            local_id,
            peers,
            sender,
            receiver,
            discovery_handle,
            event_tx: event_tx.clone(),
            peer_conn_tx,
            peer_shutdowns: HashMap::new(),
        };

        tokio::spawn(state.run(discovery_events, peer_conn_rx, receiver_event_rx, cmd_rx));

        Ok(NodeHandle { cmd_tx, event_tx, log_tx })
    }
}

struct NodeState {
    local_id: String,
    peers: PeerMap,
    sender: Arc<Sender>,
    receiver: Arc<Receiver>,
    discovery_handle: crate::discovery::DiscoveryHandle,
    event_tx: broadcast::Sender<NodeEvent>,
    peer_conn_tx: mpsc::Sender<(String, PeerConnEvent)>,
    peer_shutdowns: HashMap<String, oneshot::Sender<()>>,
}

impl NodeState {
    async fn run(
        mut self,
        mut discovery_events: mpsc::Receiver<DiscoveryEvent>,
        mut peer_conn_events: mpsc::Receiver<(String, PeerConnEvent)>,
        mut receiver_events: mpsc::Receiver<ReceiverEvent>,
        mut cmd_rx: mpsc::Receiver<NodeCommand>,
    ) {
        loop {
            tokio::select! {
                Some(event) = discovery_events.recv() => {
                    self.on_discovery_event(event).await;
                }
                Some((peer_id, event)) = peer_conn_events.recv() => {
                    self.on_peer_conn_event(peer_id, event).await;
                }
                Some(event) = receiver_events.recv() => {
                    match event {
                        ReceiverEvent::NotifyCompletion(n) => {
                            let _ = self.event_tx.send(NodeEvent::NotifyCompletion(n));
                        }
                    }
                }
                Some(cmd) = cmd_rx.recv() => {
                    if self.on_command(cmd).await {
                        break;
                    }
                }
                else => break,
            }
        }

        self.shutdown().await;
    }

    async fn on_discovery_event(&mut self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::PeerAdded(info) => {
                info!(peer = %info.peer_id, "peer added");
                let (shutdown_tx, shutdown_rx) = oneshot::channel();
                let addr = SocketAddr::new(info.ip, info.port);
                match PeerConnection::new(
                    self.local_id.clone(),
                    info.peer_id.clone(),
                    addr,
                    self.peer_conn_tx.clone(),
                    shutdown_rx,
                )
                .await
                {
                    Ok(pc) => {
                        self.peers.lock().await.insert(info.peer_id.clone(), pc);
                        self.peer_shutdowns.insert(info.peer_id.clone(), shutdown_tx);
                        let _ = self.event_tx.send(NodeEvent::PeerAdded { peer_id: info.peer_id });
                    }
                    Err(e) => warn!(peer = %info.peer_id, error = %e, "failed to create peer connection"),
                }
            }
            DiscoveryEvent::PeerRemoved(peer_id) => {
                self.remove_peer(&peer_id).await;
            }
        }
    }

    async fn on_peer_conn_event(&mut self, peer_id: String, event: PeerConnEvent) {
        match event {
            PeerConnEvent::Connected => info!(peer = %peer_id, "media channel connected"),
            PeerConnEvent::Closed => self.remove_peer(&peer_id).await,
            PeerConnEvent::Message(msg) => self.on_peer_message(peer_id, msg).await,
        }
    }

    async fn on_peer_message(&mut self, peer_id: String, msg: Message) {
        match msg {
            Message::Request(req) => {
                let _ = self.event_tx.send(NodeEvent::TransferRequest { from_peer: peer_id, request: req });
            }
            Message::Response(resp) => {
                self.sender.on_transfer_response(&peer_id, resp).await;
            }
            Message::Info(info) => {
                if let Err(e) = self.receiver.on_transfer_info(&peer_id, info).await {
                    warn!(peer = %peer_id, error = %e, "failed to accept transfer info");
                    if matches!(e, EngineError::Protocol(_)) {
                        self.remove_peer(&peer_id).await;
                    }
                }
            }
            Message::Chunk(chunk) => {
                let receiver = self.receiver.clone();
                tokio::spawn(async move { receiver.on_chunk(chunk).await });
            }
            Message::Cancelled(c) => {
                self.receiver.on_cancel(c.transfer_id).await;
            }
            other => warn!(peer = %peer_id, kind = other.wire_kind(), "unexpected application-level message kind"),
        }
    }

    async fn on_command(&mut self, cmd: NodeCommand) -> bool {
        match cmd {
            NodeCommand::SendFiles { recipients, files, reply } => {
                match self.sender.start_transfer(recipients, files).await {
                    Ok(id) => {
                        let _ = reply.send(id);
                    }
                    Err(e) => warn!(error = %e, "failed to start transfer"),
                }
                false
            }
            NodeCommand::RespondToTransfer { to_peer, transfer_id, authorized } => {
                let peers = self.peers.lock().await;
                if let Some(pc) = peers.get(&to_peer) {
                    let msg = Message::Response(TransferResponse { transfer_id, authorized });
                    if let Err(e) = pc.send(msg).await {
                        warn!(peer = %to_peer, error = %e, "failed to send transfer response");
                    }
                }
                false
            }
            NodeCommand::CancelTransfer { transfer_id } => {
                self.sender.cancel_transfer(transfer_id).await;
                false
            }
            NodeCommand::ProgressReport { transfer_id, reply } => {
                let _ = reply.send(self.sender.progress_report(transfer_id));
                false
            }
            NodeCommand::Shutdown => true,
        }
    }

    async fn remove_peer(&mut self, peer_id: &str) {
        if let Some(pc) = self.peers.lock().await.remove(peer_id) {
            pc.close().await;
        }
        if let Some(shutdown) = self.peer_shutdowns.remove(peer_id) {
            let _ = shutdown.send(());
        }
        self.receiver.on_peer_removed(peer_id).await;
        let _ = self.event_tx.send(NodeEvent::PeerRemoved { peer_id: peer_id.to_string() });
    }

    /// Shutdown ordering matters (spec §4.6): stop discovery first (no new
    /// peers), then close every peer connection (no more incoming
    /// messages), then the Sender and Receiver. `Sender::close` cancels any
    /// still-running chunk-streaming tasks rather than leaving them detached
    /// (spec §5: hierarchical cancellation of descendant tasks).
    async fn shutdown(&mut self) {
        self.discovery_handle.shutdown().await;
        let peer_ids: Vec<String> = self.peers.lock().await.keys().cloned().collect();
        for peer_id in peer_ids {
            self.remove_peer(&peer_id).await;
        }
        self.sender.close().await;
        self.receiver.close().await;
    }
}

/// Resolves the ambient identity used to construct an [`EngineConfig`]
/// (spec §4.1), in one call for convenience.
pub async fn resolve_local_identity(debug_mode: bool) -> Result<(String, std::net::IpAddr), EngineError> {
    let name = identity::device_name(debug_mode)?;
    let ip = identity::outbound_ip()?;
    Ok((name, ip))
}
