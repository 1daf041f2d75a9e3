//! Wire messages and collaborator interfaces
//!
//! The engine does not own sockets. Peers talk through the [`PeerRpc`]
//! collaborator using the typed envelopes defined here; bulk bytes move
//! through [`Transport`]. Both are injected at engine construction.
//!
//! [`PeerRpc`]: traits::PeerRpc
//! [`Transport`]: traits::Transport

pub mod messages;
pub mod traits;

pub use messages::{
	EncryptLevel, FileStatMsg, MsgBody, MsgHead, RemoteMeta, RpcEnvelope,
};
pub use traits::{Discovery, Materialized, PeerEvent, PeerRpc, Transport, TransferFile};

// vim: ts=4
