//! Signalling transport (spec §4.3): a dumb, reliable pipe for exchanging
//! offers, answers and ICE candidates before a peer's media channel is up.
//!
//! The device owns exactly one signalling port (it doubles as the mDNS
//! discovery identity, §6.1), so there is one shared [`SignallingListener`]
//! accepting inbound frames from any peer, demultiplexed by the envelope's
//! `sender` field. Outbound delivery is per-peer: each [`SignallingDialer`]
//! owns the connection to one remote endpoint and retries indefinitely until
//! it succeeds, mirroring the dial-retry loop in the original TCP
//! side-channel implementation.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::codec::{read_framed, write_framed};
use crate::protocol::types::Envelope;

/// Outbound queue capacity: control traffic is bursty but tiny.
pub const QUEUE_CAPACITY: usize = 25;

/// Delay between dial attempts while the peer is unreachable.
pub const DIAL_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Listens on our signalling port and invokes `handler` for every frame
/// received on any accepted connection.
pub struct SignallingListener {
    listener: TcpListener,
}

impl SignallingListener {
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        Ok(Self { listener: TcpListener::bind(addr).await? })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs forever, accepting connections and dispatching frames to
    /// `handler`. Each accepted connection is served on its own task; a
    /// read error or clean EOF ends that connection only, never the
    /// listener itself.
    pub async fn accept_loop<F>(self, handler: F)
    where
        F: Fn(Envelope) + Clone + Send + 'static,
    {
        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "signalling accept failed");
                    continue;
                }
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                debug!(%peer_addr, "accepted signalling connection");
                let mut stream = stream;
                loop {
                    match read_framed(&mut stream).await {
                        Ok(Some(env)) => handler(env),
                        Ok(None) => break,
                        Err(e) => {
                            warn!(%peer_addr, error = %e, "signalling read error, closing connection");
                            break;
                        }
                    }
                }
            });
        }
    }
}

/// Owns the outbound side-channel to one remote peer: a bounded queue plus
/// a background task that dials with infinite retry and forwards whatever
/// is queued once connected.
pub struct SignallingDialer {
    outbound_tx: mpsc::Sender<Envelope>,
}

impl SignallingDialer {
    /// Spawns the dial/forward task targeting `peer_addr`. The task runs
    /// until `shutdown` resolves or the sender side of the queue is
    /// dropped.
    pub fn spawn(peer_addr: SocketAddr, mut shutdown: tokio::sync::oneshot::Receiver<()>) -> Self {
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Envelope>(QUEUE_CAPACITY);

        tokio::spawn(async move {
            let mut stream = loop {
                tokio::select! {
                    _ = &mut shutdown => return,
                    result = TcpStream::connect(peer_addr) => {
                        match result {
                            Ok(stream) => break stream,
                            Err(e) => {
                                debug!(%peer_addr, error = %e, "retrying signalling connection");
                                tokio::time::sleep(DIAL_RETRY_INTERVAL).await;
                            }
                        }
                    }
                }
            };

            loop {
                tokio::select! {
                    _ = &mut shutdown => return,
                    maybe_env = outbound_rx.recv() => {
                        let Some(env) = maybe_env else { return };
                        if let Err(e) = write_framed(&mut stream, &env).await {
                            warn!(%peer_addr, error = %e, "signalling write failed, dropping connection");
                            return;
                        }
                    }
                }
            }
        });

        Self { outbound_tx }
    }

    /// Non-blocking-in-spirit enqueue (blocks only when the bounded queue is
    /// full, per spec §4.3).
    pub async fn queue(&self, env: Envelope) -> Result<(), mpsc::error::SendError<Envelope>> {
        self.outbound_tx.send(env).await
    }
}
