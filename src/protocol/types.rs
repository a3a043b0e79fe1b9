//! Wire types: the signalling/media envelope and the payloads it carries.
//!
//! The on-wire integer enumeration in the module doc below must stay stable
//! across releases — it is the interop contract between peers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CodecError;

/// Stable wire values for `Envelope::kind`. Do not renumber.
pub mod kind {
    pub const OFFER: u8 = 0;
    pub const ANSWER: u8 = 1;
    pub const ICE: u8 = 2;
    pub const TRANSFER_REQUEST: u8 = 10;
    pub const TRANSFER_RESPONSE: u8 = 11;
    pub const TRANSFER_INFO: u8 = 12;
    pub const CHUNK: u8 = 13;
    pub const TRANSFER_CANCELLED: u8 = 14;
    pub const PEER_ADDED: u8 = 20;
    pub const PEER_REMOVED: u8 = 21;
    pub const NOTIFY_COMPLETION: u8 = 22;
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

/// The envelope every `Message` is framed into for transmission, matching
/// `{sender, recipients?, type, data}` on the wire. `data` is the
/// kind-specific payload, itself serialized as JSON and then base64-encoded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipients: Option<Vec<String>>,
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// A file announced as part of a `TransferInfo`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferRequest {
    #[serde(rename = "transferId")]
    pub transfer_id: Uuid,
    #[serde(rename = "senderName")]
    pub sender_name: String,
    #[serde(rename = "humanMessage")]
    pub human_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferResponse {
    #[serde(rename = "transferId")]
    pub transfer_id: Uuid,
    pub authorized: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferInfo {
    #[serde(rename = "transferId")]
    pub transfer_id: Uuid,
    #[serde(rename = "senderName")]
    pub sender_name: String,
    pub files: Vec<FileInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chunk {
    #[serde(rename = "transferId")]
    pub transfer_id: Uuid,
    pub filename: String,
    pub offset: u64,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferCancelled {
    #[serde(rename = "transferId")]
    pub transfer_id: Uuid,
}

/// Wire representation of a discovered peer, used only for the internal
/// `PeerAdded`/`PeerRemoved` event kinds (never sent to a remote peer).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WirePeerInfo {
    #[serde(rename = "peerId")]
    pub peer_id: String,
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerRemovedInfo {
    #[serde(rename = "peerId")]
    pub peer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotifyCompletion {
    pub message: String,
    pub sender: String,
    #[serde(rename = "numFiles")]
    pub num_files: u32,
}

/// A fully-typed message, the idiomatic counterpart to the raw `Envelope`.
///
/// SDP offers/answers and ICE candidates are carried as opaque JSON strings
/// (the peer-channel library's own canonical serialization); everything else
/// is a concrete struct.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind")]
pub enum Message {
    Offer(String),
    Answer(String),
    Ice(String),
    Request(TransferRequest),
    Response(TransferResponse),
    Info(TransferInfo),
    Chunk(Chunk),
    Cancelled(TransferCancelled),
    PeerAdded(WirePeerInfo),
    PeerRemoved(PeerRemovedInfo),
    NotifyCompletion(NotifyCompletion),
}

impl Message {
    pub fn wire_kind(&self) -> u8 {
        match self {
            Message::Offer(_) => kind::OFFER,
            Message::Answer(_) => kind::ANSWER,
            Message::Ice(_) => kind::ICE,
            Message::Request(_) => kind::TRANSFER_REQUEST,
            Message::Response(_) => kind::TRANSFER_RESPONSE,
            Message::Info(_) => kind::TRANSFER_INFO,
            Message::Chunk(_) => kind::CHUNK,
            Message::Cancelled(_) => kind::TRANSFER_CANCELLED,
            Message::PeerAdded(_) => kind::PEER_ADDED,
            Message::PeerRemoved(_) => kind::PEER_REMOVED,
            Message::NotifyCompletion(_) => kind::NOTIFY_COMPLETION,
        }
    }

    /// Frames this message into the wire `Envelope`, attributed to `sender`.
    pub fn into_envelope(
        self,
        sender: impl Into<String>,
        recipients: Option<Vec<String>>,
    ) -> Result<Envelope, CodecError> {
        let kind = self.wire_kind();
        let data = match self {
            Message::Offer(s) | Message::Answer(s) | Message::Ice(s) => s.into_bytes(),
            Message::Request(v) => serde_json::to_vec(&v)?,
            Message::Response(v) => serde_json::to_vec(&v)?,
            Message::Info(v) => serde_json::to_vec(&v)?,
            Message::Chunk(v) => serde_json::to_vec(&v)?,
            Message::Cancelled(v) => serde_json::to_vec(&v)?,
            Message::PeerAdded(v) => serde_json::to_vec(&v)?,
            Message::PeerRemoved(v) => serde_json::to_vec(&v)?,
            Message::NotifyCompletion(v) => serde_json::to_vec(&v)?,
        };
        Ok(Envelope { sender: sender.into(), recipients, kind, data })
    }

    /// Recovers a typed `Message` from a wire `Envelope`. An unrecognized
    /// `kind` is a protocol violation, not a silently-dropped message.
    pub fn from_envelope(env: &Envelope) -> Result<Self, CodecError> {
        Ok(match env.kind {
            kind::OFFER => Message::Offer(String::from_utf8_lossy(&env.data).into_owned()),
            kind::ANSWER => Message::Answer(String::from_utf8_lossy(&env.data).into_owned()),
            kind::ICE => Message::Ice(String::from_utf8_lossy(&env.data).into_owned()),
            kind::TRANSFER_REQUEST => Message::Request(serde_json::from_slice(&env.data)?),
            kind::TRANSFER_RESPONSE => Message::Response(serde_json::from_slice(&env.data)?),
            kind::TRANSFER_INFO => Message::Info(serde_json::from_slice(&env.data)?),
            kind::CHUNK => Message::Chunk(serde_json::from_slice(&env.data)?),
            kind::TRANSFER_CANCELLED => Message::Cancelled(serde_json::from_slice(&env.data)?),
            kind::PEER_ADDED => Message::PeerAdded(serde_json::from_slice(&env.data)?),
            kind::PEER_REMOVED => Message::PeerRemoved(serde_json::from_slice(&env.data)?),
            kind::NOTIFY_COMPLETION => {
                Message::NotifyCompletion(serde_json::from_slice(&env.data)?)
            }
            other => return Err(CodecError::UnknownKind(other)),
        })
    }
}

/// A captured tracing event, used by [`crate::log_layer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: String,
    pub target: String,
    pub message: String,
}

/// Which of the two media sub-channels a message belongs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubChannel {
    Control,
    Bulk,
}

impl SubChannel {
    pub fn label(self) -> &'static str {
        match self {
            SubChannel::Control => "control",
            SubChannel::Bulk => "bulk",
        }
    }

    /// Which sub-channel a given message kind must travel on.
    pub fn for_message(msg: &Message) -> SubChannel {
        match msg {
            Message::Chunk(_) => SubChannel::Bulk,
            _ => SubChannel::Control,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) {
        let env = msg.clone().into_envelope("alice", None).unwrap();
        let bytes = serde_json::to_vec(&env).unwrap();
        let decoded_env: Envelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(env, decoded_env);
        let decoded = Message::from_envelope(&decoded_env).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn all_kinds_roundtrip() {
        roundtrip(Message::Offer("sdp-offer".into()));
        roundtrip(Message::Answer("sdp-answer".into()));
        roundtrip(Message::Ice("candidate".into()));
        roundtrip(Message::Request(TransferRequest {
            transfer_id: Uuid::new_v4(),
            sender_name: "alice".into(),
            human_message: "sending 1 file".into(),
        }));
        roundtrip(Message::Response(TransferResponse {
            transfer_id: Uuid::new_v4(),
            authorized: true,
        }));
        roundtrip(Message::Info(TransferInfo {
            transfer_id: Uuid::new_v4(),
            sender_name: "alice".into(),
            files: vec![FileInfo { name: "hello.bin".into(), size: 1024 }],
        }));
        roundtrip(Message::Chunk(Chunk {
            transfer_id: Uuid::new_v4(),
            filename: "hello.bin".into(),
            offset: 0,
            data: vec![1, 2, 3, 4],
        }));
        roundtrip(Message::Cancelled(TransferCancelled { transfer_id: Uuid::new_v4() }));
        roundtrip(Message::PeerAdded(WirePeerInfo {
            peer_id: "bob-42".into(),
            ip: "192.168.1.5".into(),
            port: 9000,
        }));
        roundtrip(Message::PeerRemoved(PeerRemovedInfo { peer_id: "bob-42".into() }));
        roundtrip(Message::NotifyCompletion(NotifyCompletion {
            message: "Received 1 files from alice".into(),
            sender: "alice".into(),
            num_files: 1,
        }));
    }

    #[test]
    fn unknown_kind_is_protocol_violation() {
        let env = Envelope { sender: "alice".into(), recipients: None, kind: 99, data: vec![] };
        assert!(matches!(Message::from_envelope(&env), Err(CodecError::UnknownKind(99))));
    }

    #[test]
    fn chunk_travels_on_bulk_everything_else_on_control() {
        let chunk = Message::Chunk(Chunk {
            transfer_id: Uuid::new_v4(),
            filename: "f".into(),
            offset: 0,
            data: vec![0],
        });
        assert_eq!(SubChannel::for_message(&chunk), SubChannel::Bulk);
        let req = Message::Request(TransferRequest {
            transfer_id: Uuid::new_v4(),
            sender_name: "a".into(),
            human_message: "m".into(),
        });
        assert_eq!(SubChannel::for_message(&req), SubChannel::Control);
    }
}
