//! Peer discovery (spec §4.2): advertise our service on the LAN, periodically
//! browse for others, and maintain a live `peerId → PeerInfo` map with
//! liveness eviction.
//!
//! `DiscoveryBackend` is the seam between this state machine and whatever
//! multicast-DNS implementation is in use — production wires up
//! [`mdns::MdnsBackend`], tests use [`memory::InMemoryBackend`] so two
//! engines can discover each other inside one process without touching a
//! real network interface.

pub mod mdns;
pub mod memory;

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::DiscoveryError;

/// mDNS service type this engine advertises and browses for.
pub const SERVICE_TYPE: &str = "_fileshare._tcp.local.";

/// How often we issue a fresh browse query (spec: Q = 10s).
pub const QUERY_INTERVAL: Duration = Duration::from_secs(10);

/// A peer is evicted once unheard-from for this long (spec: 3Q = 30s).
pub const PEER_TIMEOUT: Duration = Duration::from_secs(30);

/// Our own service record, as advertised on the LAN.
#[derive(Debug, Clone)]
pub struct LocalService {
    pub device_name: String,
    pub ip: IpAddr,
    pub port: u16,
}

/// One entry observed while browsing, before it's folded into the live map.
#[derive(Debug, Clone)]
pub struct BrowseEntry {
    /// First label of the advertised hostname, e.g. `laptop-4711` from
    /// `laptop-4711.local.`.
    pub peer_id: String,
    pub ip: IpAddr,
    pub port: u16,
}

/// A known peer and when we last heard from it.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub peer_id: String,
    pub ip: IpAddr,
    pub port: u16,
    pub last_heard_from: Instant,
}

/// Events emitted by the discovery state machine.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    PeerAdded(PeerInfo),
    PeerRemoved(String),
}

/// Backend-agnostic multicast-DNS seam.
#[async_trait]
pub trait DiscoveryBackend: Send + Sync + 'static {
    /// Advertise `service` under [`SERVICE_TYPE`]. Idempotent.
    async fn advertise(&self, service: &LocalService) -> Result<(), DiscoveryError>;

    /// Issue one browse query and collect whatever answers arrive within
    /// the backend's own timeout window.
    async fn browse(&self) -> Result<Vec<BrowseEntry>, DiscoveryError>;

    /// Stop advertising our service. Called during shutdown.
    async fn stop_advertising(&self) -> Result<(), DiscoveryError>;
}

/// Handle for controlling a running [`DiscoveryEngine`] task.
pub struct DiscoveryHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl DiscoveryHandle {
    /// Requests shutdown: stop advertising, stop querying, and return.
    /// Idempotent — a second call after the task has already exited is a
    /// harmless no-op.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// Runs the discovery state machine described in spec §4.2: advertise once,
/// then loop browsing every [`QUERY_INTERVAL`], folding results into a live
/// peer map and evicting stale entries.
pub struct DiscoveryEngine;

impl DiscoveryEngine {
    /// Spawns the discovery task. Returns a handle to stop it and a channel
    /// of peer-added/peer-removed events.
    pub fn spawn(
        backend: std::sync::Arc<dyn DiscoveryBackend>,
        local: LocalService,
    ) -> (DiscoveryHandle, mpsc::Receiver<DiscoveryEvent>) {
        let (event_tx, event_rx) = mpsc::channel(64);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

        tokio::spawn(async move {
            if let Err(e) = backend.advertise(&local).await {
                warn!(error = %e, "failed to advertise discovery service");
            }

            let mut peers: HashMap<String, PeerInfo> = HashMap::new();
            // `interval`'s first tick fires immediately, so the first browse
            // below happens right away too — peers already up are found
            // without waiting a full query interval.
            let mut ticker = tokio::time::interval(QUERY_INTERVAL);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match backend.browse().await {
                            Ok(entries) => {
                                for entry in entries {
                                    if entry.peer_id == local.device_name {
                                        continue;
                                    }
                                    match peers.get_mut(&entry.peer_id) {
                                        Some(existing) => {
                                            existing.last_heard_from = Instant::now();
                                        }
                                        None => {
                                            let info = PeerInfo {
                                                peer_id: entry.peer_id.clone(),
                                                ip: entry.ip,
                                                port: entry.port,
                                                last_heard_from: Instant::now(),
                                            };
                                            info!(peer = %info.peer_id, "peer discovered");
                                            peers.insert(entry.peer_id.clone(), info.clone());
                                            if event_tx.send(DiscoveryEvent::PeerAdded(info)).await.is_err() {
                                                return;
                                            }
                                        }
                                    }
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "discovery query failed");
                            }
                        }

                        let now = Instant::now();
                        let stale: Vec<String> = peers
                            .iter()
                            .filter(|(_, p)| now.duration_since(p.last_heard_from) >= PEER_TIMEOUT)
                            .map(|(id, _)| id.clone())
                            .collect();
                        for id in stale {
                            peers.remove(&id);
                            debug!(peer = %id, "peer evicted (no heartbeat)");
                            if event_tx.send(DiscoveryEvent::PeerRemoved(id)).await.is_err() {
                                return;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        let _ = backend.stop_advertising().await;
                        return;
                    }
                }
            }
        });

        (DiscoveryHandle { shutdown_tx }, event_rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::memory::InMemoryBackend;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn peer_is_discovered_and_evicted_on_timeout() {
        let registry = memory::shared_registry();
        let backend_a = Arc::new(InMemoryBackend::new(registry.clone()));
        let backend_b = Arc::new(InMemoryBackend::new(registry.clone()));

        let local_a =
            LocalService { device_name: "alice".into(), ip: "10.0.0.1".parse().unwrap(), port: 9001 };
        let local_b =
            LocalService { device_name: "bob".into(), ip: "10.0.0.2".parse().unwrap(), port: 9002 };

        let (handle_a, mut events_a) = DiscoveryEngine::spawn(backend_a, local_a);
        let (_handle_b, _events_b) = DiscoveryEngine::spawn(backend_b, local_b);

        let added = tokio::time::timeout(Duration::from_secs(5), events_a.recv())
            .await
            .expect("timed out waiting for peer-added")
            .expect("channel closed");
        match added {
            DiscoveryEvent::PeerAdded(info) => assert_eq!(info.peer_id, "bob"),
            other => panic!("unexpected event: {other:?}"),
        }

        handle_a.shutdown().await;
    }
}
