//! # Treesync - Peer-to-Peer File Tree Synchronization Engine
//!
//! Treesync keeps named groups of directory trees (*syncs*) convergent
//! across cooperating devices without a central coordinator. Every file row
//! carries a vector clock; a scanner turns filesystem mutations into
//! versioned metadata, peers exchange table deltas, and a deterministic
//! classifier reconciles each path as an insert, update, rename or conflict.
//!
//! Discovery, bulk transport and the encrypted RPC channel live outside the
//! engine; they are injected as the [`protocol::Transport`] and
//! [`protocol::PeerRpc`] collaborators.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use treesync::config::Config;
//! use treesync::engine::Engine;
//!
//! #[tokio::main]
//! async fn main() -> treesync::error::Result<()> {
//!     let config = Config::load(std::path::Path::new(".treesync"))?;
//!     let mut engine = Engine::startup(config, transport, rpc)?;
//!     let sync = engine.create_sync("documents", treesync::types::SyncType::Normal)?;
//!     let tree = engine.create_tree(sync.id, "/home/me/documents", BackupType::None)?;
//!     engine.refresh(tree.id);
//!     Ok(())
//! }
//! ```

#![deny(unsafe_code)]

pub mod abort;
pub mod config;
pub mod consistency;
pub mod engine;
pub mod error;
pub mod logging;
pub mod model;
pub mod protocol;
pub mod query_cache;
pub mod rename;
pub mod resolver;
pub mod router;
pub mod scanner;
pub mod status;
pub mod sync_file;
pub mod task;
pub mod types;
pub mod updater;
pub mod util;
pub mod vclock;

// Re-export commonly used types
pub use abort::{AbortFlag, AbortRegistry};
pub use config::Config;
pub use engine::{Ctx, Engine};
pub use error::{Error, Result};
pub use model::{Device, FileStat, SyncRow, Tree};
pub use rename::RenameDetector;
pub use scanner::TreeScanner;
pub use sync_file::{PairDecision, PairKind, SyncFile, SyncMask};
pub use vclock::{VClockCmp, VectorClock};

// vim: ts=4
