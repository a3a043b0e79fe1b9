//! Transfer Engine (spec §4.5): the file-transfer protocol layered on top
//! of a peer connection's control/bulk sub-channels.

pub mod file;
pub mod receiver;
pub mod sender;

pub use receiver::{Receiver, ReceiverEvent};
pub use sender::{FileSource, PeerSink, ProgressReport, Sender};
