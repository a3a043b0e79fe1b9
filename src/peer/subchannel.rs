//! A single media sub-channel's outbound send loop (spec §4.4.3/§4.4.4).
//!
//! Each sub-channel owns a bounded queue and a task that drains it onto the
//! underlying `RTCDataChannel`, waiting out backpressure before every send
//! so that a slow reader on the other end can never make us buffer
//! unboundedly in the library.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::warn;
use webrtc::data_channel::RTCDataChannel;

use crate::protocol::types::{Envelope, Message, SubChannel};

/// Queues are bounded at 100 messages; `send` blocks when full (spec §4.4.4).
pub const QUEUE_CAPACITY: usize = 100;

/// Backpressure ceiling: pause sending once the data channel's own buffer
/// holds this many bytes.
pub const BUFFERED_AMOUNT_THRESHOLD: usize = 8 * 1024 * 1024;

/// How often to poll `buffered_amount()` while waiting for it to drain.
const BACKPRESSURE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Handle for enqueuing outgoing messages onto one sub-channel.
#[derive(Clone)]
pub struct SubChannelSender {
    tx: mpsc::Sender<Envelope>,
    kind: SubChannel,
}

impl SubChannelSender {
    pub fn kind(&self) -> SubChannel {
        self.kind
    }

    /// Enqueues `msg`, blocking if the queue is already at capacity.
    pub async fn send(&self, local_id: &str, msg: Message) -> Result<(), mpsc::error::SendError<Envelope>> {
        let env = msg
            .into_envelope(local_id, None)
            .expect("message serialization is infallible for well-formed payloads");
        self.tx.send(env).await
    }
}

/// Spawns the send loop for one sub-channel and returns the handle used to
/// feed it.
pub fn spawn(dc: Arc<RTCDataChannel>, kind: SubChannel) -> SubChannelSender {
    let (tx, mut rx) = mpsc::channel::<Envelope>(QUEUE_CAPACITY);

    tokio::spawn(async move {
        while let Some(env) = rx.recv().await {
            loop {
                let buffered = dc.buffered_amount().await;
                if buffered < BUFFERED_AMOUNT_THRESHOLD {
                    break;
                }
                tokio::time::sleep(BACKPRESSURE_POLL_INTERVAL).await;
            }

            let bytes = match serde_json::to_vec(&env) {
                Ok(b) => b,
                Err(e) => {
                    warn!(channel = kind.label(), error = %e, "failed to serialize outgoing message");
                    continue;
                }
            };
            if let Err(e) = dc.send(&Bytes::from(bytes)).await {
                warn!(channel = kind.label(), error = %e, "sub-channel send failed, stopping send loop");
                return;
            }
        }
    });

    SubChannelSender { tx, kind }
}
