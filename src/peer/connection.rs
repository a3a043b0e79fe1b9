//! Per-peer state machine (spec §4.4): signalling, perfect-negotiation, and
//! the steady-state pair of media sub-channels.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::EngineError;
use crate::protocol::types::{Envelope, Message, SubChannel};
use crate::signalling::SignallingDialer;

use super::subchannel::{self, SubChannelSender};

const CONTROL_LABEL: &str = "control";
const BULK_LABEL: &str = "bulk";

/// Negotiation state (spec §4.4.2). `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    New,
    Negotiating,
    Connected,
    Closed,
}

/// Events a `PeerConnection` reports up to the owning Node.
#[derive(Debug, Clone)]
pub enum PeerConnEvent {
    Connected,
    Closed,
    Message(Message),
}

struct Channels {
    control: Mutex<Option<SubChannelSender>>,
    bulk: Mutex<Option<SubChannelSender>>,
}

/// One logical association with a remote peer, spanning signalling,
/// negotiation, and the steady-state media sub-channels.
pub struct PeerConnection {
    pub peer_id: String,
    pub polite: bool,
    local_id: String,
    rtc: Arc<RTCPeerConnection>,
    signalling: SignallingDialer,
    making_offer: Arc<AtomicBool>,
    state: Arc<Mutex<NegotiationState>>,
    channels: Arc<Channels>,
    closed: Arc<AtomicBool>,
    events: mpsc::Sender<(String, PeerConnEvent)>,
}

impl PeerConnection {
    /// Creates the peer connection, wires up negotiation/ICE callbacks, and
    /// — for the impolite side — immediately creates the two data
    /// sub-channels, which drives the first `negotiationneeded` event.
    pub async fn new(
        local_id: String,
        remote_id: String,
        peer_signalling_addr: SocketAddr,
        events: mpsc::Sender<(String, PeerConnEvent)>,
        shutdown: tokio::sync::oneshot::Receiver<()>,
    ) -> Result<Arc<Self>, EngineError> {
        let polite = remote_id < local_id;

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| EngineError::Negotiation(e.to_string()))?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| EngineError::Negotiation(e.to_string()))?;
        let api = APIBuilder::new().with_media_engine(media_engine).with_interceptor_registry(registry).build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec!["stun:stun.l.google.com:19302".to_string()],
                ..Default::default()
            }],
            ..Default::default()
        };
        let rtc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| EngineError::Negotiation(e.to_string()))?,
        );

        let signalling = SignallingDialer::spawn(peer_signalling_addr, shutdown);

        let pc = Arc::new(Self {
            peer_id: remote_id,
            polite,
            local_id,
            rtc,
            signalling,
            making_offer: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(NegotiationState::New)),
            channels: Arc::new(Channels { control: Mutex::new(None), bulk: Mutex::new(None) }),
            closed: Arc::new(AtomicBool::new(false)),
            events,
        });

        pc.install_callbacks();

        if !polite {
            pc.create_subchannel(CONTROL_LABEL).await?;
            pc.create_subchannel(BULK_LABEL).await?;
        }

        Ok(pc)
    }

    fn install_callbacks(self: &Arc<Self>) {
        let this = self.clone();
        self.rtc.on_negotiation_needed(Box::new(move || {
            let this = this.clone();
            Box::pin(async move { this.on_negotiation_needed().await })
        }));

        let this = self.clone();
        self.rtc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let this = this.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                let Ok(init) = candidate.to_json() else { return };
                let Ok(json) = serde_json::to_string(&init) else { return };
                this.queue_signalling(Message::Ice(json)).await;
            })
        }));

        let this = self.clone();
        self.rtc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let this = this.clone();
            Box::pin(async move { this.on_connection_state_change(state).await })
        }));

        let this = self.clone();
        self.rtc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let this = this.clone();
            Box::pin(async move { this.on_remote_data_channel(dc).await })
        }));
    }

    async fn create_subchannel(self: &Arc<Self>, label: &'static str) -> Result<(), EngineError> {
        let dc = self
            .rtc
            .create_data_channel(label, Some(RTCDataChannelInit { ordered: Some(true), ..Default::default() }))
            .await
            .map_err(|e| EngineError::MediaChannel(e.to_string()))?;
        self.wire_data_channel(dc);
        Ok(())
    }

    async fn on_remote_data_channel(self: &Arc<Self>, dc: Arc<RTCDataChannel>) {
        debug!(peer = %self.peer_id, label = %dc.label(), "accepted remote data channel");
        self.wire_data_channel(dc);
    }

    fn wire_data_channel(self: &Arc<Self>, dc: Arc<RTCDataChannel>) {
        let kind = match dc.label() {
            CONTROL_LABEL => SubChannel::Control,
            BULK_LABEL => SubChannel::Bulk,
            other => {
                warn!(peer = %self.peer_id, label = other, "ignoring unexpected data channel label");
                return;
            }
        };

        let this = self.clone();
        let dc_for_open = dc.clone();
        dc.on_open(Box::new(move || {
            let this = this.clone();
            let dc = dc_for_open.clone();
            Box::pin(async move {
                let sender = subchannel::spawn(dc, kind);
                let slot = match kind {
                    SubChannel::Control => &this.channels.control,
                    SubChannel::Bulk => &this.channels.bulk,
                };
                *slot.lock().expect("mutex poisoned") = Some(sender);
                info!(peer = %this.peer_id, channel = kind.label(), "sub-channel open");
            })
        }));

        let this = self.clone();
        dc.on_message(Box::new(move |msg| {
            let this = this.clone();
            Box::pin(async move { this.on_data_channel_message(msg.data.to_vec()) })
        }));

        let this = self.clone();
        dc.on_close(Box::new(move || {
            let this = this.clone();
            Box::pin(async move { this.close().await })
        }));
    }

    fn on_data_channel_message(self: &Arc<Self>, data: Vec<u8>) {
        let env: Envelope = match serde_json::from_slice(&data) {
            Ok(e) => e,
            Err(e) => {
                warn!(peer = %self.peer_id, error = %e, "dropping malformed media-channel frame");
                return;
            }
        };
        // Defensive against any loopback delivery (spec §4.4.5).
        if env.sender == self.local_id {
            return;
        }
        match Message::from_envelope(&env) {
            Ok(msg) => {
                let events = self.events.clone();
                let peer_id = self.peer_id.clone();
                tokio::spawn(async move {
                    let _ = events.send((peer_id, PeerConnEvent::Message(msg))).await;
                });
            }
            Err(e) => warn!(peer = %self.peer_id, error = %e, "protocol violation on media channel"),
        }
    }

    async fn on_negotiation_needed(self: &Arc<Self>) {
        self.making_offer.store(true, Ordering::SeqCst);
        *self.state.lock().expect("mutex poisoned") = NegotiationState::Negotiating;

        let result: Result<(), EngineError> = async {
            let offer = self
                .rtc
                .create_offer(None)
                .await
                .map_err(|e| EngineError::Negotiation(e.to_string()))?;
            self.rtc
                .set_local_description(offer.clone())
                .await
                .map_err(|e| EngineError::Negotiation(e.to_string()))?;
            let json = serde_json::to_string(&offer).map_err(|e| EngineError::Negotiation(e.to_string()))?;
            self.queue_signalling(Message::Offer(json)).await;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            warn!(peer = %self.peer_id, error = %e, "failed to create/send offer");
        }
        self.making_offer.store(false, Ordering::SeqCst);
    }

    /// Dispatches an inbound signalling-transport message (spec §4.4.2).
    /// An undecodable envelope is a protocol violation: close the
    /// connection rather than guess at recovery (spec §7).
    pub async fn on_signalling(self: &Arc<Self>, env: Envelope) {
        let msg = match Message::from_envelope(&env) {
            Ok(m) => m,
            Err(e) => {
                warn!(peer = %self.peer_id, error = %e, "protocol violation on signalling channel, closing");
                self.close().await;
                return;
            }
        };
        match msg {
            Message::Offer(sdp) => self.handle_offer(sdp).await,
            Message::Answer(sdp) => self.handle_answer(sdp).await,
            Message::Ice(candidate) => self.handle_ice(candidate).await,
            other => warn!(peer = %self.peer_id, kind = other.wire_kind(), "unexpected message kind on signalling channel"),
        }
    }

    async fn handle_offer(self: &Arc<Self>, sdp_json: String) {
        let offer: RTCSessionDescription = match serde_json::from_str(&sdp_json) {
            Ok(o) => o,
            Err(e) => {
                warn!(peer = %self.peer_id, error = %e, "malformed offer");
                return;
            }
        };

        let negotiating = self.rtc.signaling_state() != RTCSignalingState::Stable;
        let offer_collision = negotiating || self.making_offer.load(Ordering::SeqCst);
        if offer_collision && !self.polite {
            debug!(peer = %self.peer_id, "impolite peer dropping colliding remote offer");
            return;
        }

        // Polite side (or no collision): accept the remote offer. If we were
        // mid-offer ourselves, this is the implicit rollback of our own
        // local offer in favor of the remote one.
        self.making_offer.store(false, Ordering::SeqCst);
        if let Err(e) = self.rtc.set_remote_description(offer).await {
            warn!(peer = %self.peer_id, error = %e, "failed to set remote offer");
            return;
        }
        let answer = match self.rtc.create_answer(None).await {
            Ok(a) => a,
            Err(e) => {
                warn!(peer = %self.peer_id, error = %e, "failed to create answer");
                return;
            }
        };
        if let Err(e) = self.rtc.set_local_description(answer.clone()).await {
            warn!(peer = %self.peer_id, error = %e, "failed to set local answer");
            return;
        }
        match serde_json::to_string(&answer) {
            Ok(json) => self.queue_signalling(Message::Answer(json)).await,
            Err(e) => warn!(peer = %self.peer_id, error = %e, "failed to serialize answer"),
        }
    }

    async fn handle_answer(self: &Arc<Self>, sdp_json: String) {
        let answer: RTCSessionDescription = match serde_json::from_str(&sdp_json) {
            Ok(a) => a,
            Err(e) => {
                warn!(peer = %self.peer_id, error = %e, "malformed answer");
                return;
            }
        };
        if let Err(e) = self.rtc.set_remote_description(answer).await {
            warn!(peer = %self.peer_id, error = %e, "failed to set remote answer");
        }
    }

    async fn handle_ice(self: &Arc<Self>, candidate_json: String) {
        let init: RTCIceCandidateInit = match serde_json::from_str(&candidate_json) {
            Ok(c) => c,
            Err(e) => {
                warn!(peer = %self.peer_id, error = %e, "malformed ICE candidate");
                return;
            }
        };
        if let Err(e) = self.rtc.add_ice_candidate(init).await {
            warn!(peer = %self.peer_id, error = %e, "failed to apply ICE candidate");
        }
    }

    async fn on_connection_state_change(self: &Arc<Self>, state: RTCPeerConnectionState) {
        info!(peer = %self.peer_id, ?state, "connection state changed");
        match state {
            RTCPeerConnectionState::Connected => {
                *self.state.lock().expect("mutex poisoned") = NegotiationState::Connected;
                let _ = self.events.send((self.peer_id.clone(), PeerConnEvent::Connected)).await;
            }
            RTCPeerConnectionState::Disconnected
            | RTCPeerConnectionState::Failed
            | RTCPeerConnectionState::Closed => {
                self.close().await;
            }
            _ => {}
        }
    }

    async fn queue_signalling(self: &Arc<Self>, msg: Message) {
        let env = match msg.into_envelope(self.local_id.clone(), None) {
            Ok(e) => e,
            Err(e) => {
                warn!(peer = %self.peer_id, error = %e, "failed to frame signalling message");
                return;
            }
        };
        if self.signalling.queue(env).await.is_err() {
            warn!(peer = %self.peer_id, "signalling queue closed, dropping message");
        }
    }

    /// Sends `msg` on whichever sub-channel its kind belongs to. Returns an
    /// error if that sub-channel isn't open yet.
    pub async fn send(&self, msg: Message) -> Result<(), EngineError> {
        let kind = SubChannel::for_message(&msg);
        let slot = match kind {
            SubChannel::Control => &self.channels.control,
            SubChannel::Bulk => &self.channels.bulk,
        };
        let sender = slot.lock().expect("mutex poisoned").clone();
        match sender {
            Some(sender) => sender
                .send(&self.local_id, msg)
                .await
                .map_err(|_| EngineError::MediaChannel("sub-channel send loop has exited".into())),
            None => Err(EngineError::MediaChannel(format!("{} sub-channel not open", kind.label()))),
        }
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        *self.state.lock().expect("mutex poisoned")
    }

    /// Idempotent teardown: closes both sub-channels, the peer connection,
    /// and reports `Closed` to the owning Node exactly once.
    pub async fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.state.lock().expect("mutex poisoned") = NegotiationState::Closed;
        if let Err(e) = self.rtc.close().await {
            warn!(peer = %self.peer_id, error = %e, "error closing peer connection");
        }
        let _ = self.events.send((self.peer_id.clone(), PeerConnEvent::Closed)).await;
    }
}
