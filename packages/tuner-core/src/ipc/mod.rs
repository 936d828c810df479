//! Inter-process communication fabric (§4.C): a broker process and the
//! peers that connect through it.

pub mod broker;
pub mod peer;
pub mod protocol;

pub use broker::Broker;
pub use peer::{CommandHandler, EventHandler, Peer, SyncPeer};
pub use protocol::{CommandFrame, Frames, MsgType};
