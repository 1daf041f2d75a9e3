use async_trait::async_trait;
use clap::{Arg, ArgAction, Command};
use std::error::Error as StdError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use treesync::config::Config;
use treesync::engine::Engine;
use treesync::error::{Error, Result};
use treesync::logging::*;
use treesync::protocol::messages::RemoteMeta;
use treesync::protocol::{Materialized, PeerRpc, RpcEnvelope, Transport, TransferFile};
use treesync::types::{BackupType, SyncType};
use treesync::AbortFlag;

/// Placeholder collaborators for the administrative commands. Everything the
/// CLI does below works against the local tables; actual networking is wired
/// in by the hosting application.
struct OfflineTransport;

#[async_trait]
impl Transport for OfflineTransport {
	async fn fetch(
		&self,
		_endpoint: &str,
		_tree_uuid: &str,
		_files: &[TransferFile],
		_tmp_dir: &Path,
		_cancel: AbortFlag,
	) -> Result<Vec<Materialized>> {
		Err(Error::Timeout)
	}

	async fn push(
		&self,
		_endpoint: &str,
		_tree_uuid: &str,
		_tmp_dir: &Path,
		_files: &[TransferFile],
		_cancel: AbortFlag,
	) -> Result<()> {
		Err(Error::Timeout)
	}

	async fn upload_meta(
		&self,
		_endpoint: &str,
		_local_tree_uuid: &str,
		_remote_tree_uuid: &str,
		_meta: RemoteMeta,
	) -> Result<Vec<String>> {
		Err(Error::Timeout)
	}
}

struct OfflineRpc;

#[async_trait]
impl PeerRpc for OfflineRpc {
	async fn request(
		&self,
		_endpoint: &str,
		_envelope: RpcEnvelope,
		_timeout: Duration,
	) -> Result<RpcEnvelope> {
		Err(Error::Timeout)
	}
}

fn data_dir(matches: &clap::ArgMatches) -> PathBuf {
	match matches.get_one::<String>("data-dir") {
		Some(dir) => PathBuf::from(dir),
		None => match std::env::var("HOME") {
			Ok(home) => PathBuf::from(home).join(".treesync"),
			Err(_) => PathBuf::from(".treesync"),
		},
	}
}

fn boot(dir: &Path) -> Result<Engine> {
	let config = Config::load(dir)?;
	Engine::startup(config, Arc::new(OfflineTransport), Arc::new(OfflineRpc))
}

fn shutdown_marker(dir: &Path) -> PathBuf {
	dir.join("shutdown")
}

async fn run() -> Result<()> {
	let matches = Command::new("treesync")
		.version(env!("CARGO_PKG_VERSION"))
		.about("Peer-to-peer file tree synchronization engine")
		.subcommand_required(true)
		.arg(
			Arg::new("data-dir")
				.short('d')
				.long("data-dir")
				.value_name("DIR")
				.help("State directory (default: ~/.treesync)"),
		)
		.subcommand(Command::new("startup").about("Run the engine in the foreground"))
		.subcommand(Command::new("shutdown").about("Ask a running engine to exit"))
		.subcommand(
			Command::new("create_sync")
				.about("Create a sync")
				.arg(Arg::new("name").required(true))
				.arg(Arg::new("backup").long("backup").action(ArgAction::SetTrue)),
		)
		.subcommand(
			Command::new("create_tree")
				.about("Attach a local directory to a sync")
				.arg(Arg::new("sync-id").required(true))
				.arg(Arg::new("root").required(true))
				.arg(Arg::new("backup-src").long("backup-src").action(ArgAction::SetTrue))
				.arg(Arg::new("backup-dst").long("backup-dst").action(ArgAction::SetTrue)),
		)
		.subcommand(
			Command::new("list_syncs")
				.about("List syncs and their trees")
				.arg(Arg::new("json").long("json").action(ArgAction::SetTrue)),
		)
		.subcommand(
			Command::new("refresh")
				.about("Rescan one tree")
				.arg(Arg::new("tree-id").required(true)),
		)
		.subcommand(Command::new("status").about("Show tree-pair transfer status"))
		.get_matches();

	let dir = data_dir(&matches);

	match matches.subcommand() {
		Some(("startup", _)) => {
			let _ = std::fs::remove_file(shutdown_marker(&dir));
			let mut engine = boot(&dir)?;
			engine.refresh_all();
			info!("running; stop with ctrl-c or `treesync shutdown`");
			loop {
				if shutdown_marker(&dir).exists() {
					let _ = std::fs::remove_file(shutdown_marker(&dir));
					break;
				}
				tokio::select! {
					_ = tokio::signal::ctrl_c() => break,
					_ = tokio::time::sleep(Duration::from_secs(1)) => {}
				}
			}
			engine.shutdown();
		}
		Some(("shutdown", _)) => {
			if !dir.is_dir() {
				return Err(Error::NotStartup);
			}
			std::fs::write(shutdown_marker(&dir), b"")?;
		}
		Some(("create_sync", sub)) => {
			let name = sub.get_one::<String>("name").expect("required");
			let stype =
				if sub.get_flag("backup") { SyncType::Backup } else { SyncType::Normal };
			let mut engine = boot(&dir)?;
			let sync = engine.create_sync(name, stype)?;
			println!("{} {}", sync.id, sync.uuid);
			engine.shutdown();
		}
		Some(("create_tree", sub)) => {
			let sync_id: i32 = sub
				.get_one::<String>("sync-id")
				.expect("required")
				.parse()
				.map_err(|_| Error::SyncNoent { sync: String::from("?") })?;
			let root = sub.get_one::<String>("root").expect("required");
			let backup_type = if sub.get_flag("backup-src") {
				BackupType::Src
			} else if sub.get_flag("backup-dst") {
				BackupType::Dst
			} else {
				BackupType::None
			};
			let mut engine = boot(&dir)?;
			let tree = engine.create_tree(sync_id, root, backup_type)?;
			println!("{} {}", tree.id, tree.uuid);
			engine.shutdown();
		}
		Some(("list_syncs", sub)) => {
			let mut engine = boot(&dir)?;
			let snapshot = engine.list_syncs();
			if sub.get_flag("json") {
				let json = serde_json::to_string_pretty(&*snapshot)
					.map_err(|e| Error::Content { message: e.to_string() })?;
				println!("{}", json);
			} else {
				for sync in &snapshot.syncs {
					println!("{} {} ({:?})", sync.sync_id, sync.name, sync.perm);
					for tree in &sync.trees {
						println!("  tree {} {} {}", tree.tree_id, tree.device_name, tree.root);
					}
				}
				for backup in &snapshot.backups {
					println!("{} {} (backup)", backup.sync_id, backup.name);
				}
			}
			engine.shutdown();
		}
		Some(("refresh", sub)) => {
			let tree_id: i32 = sub
				.get_one::<String>("tree-id")
				.expect("required")
				.parse()
				.map_err(|_| Error::TreeNoent { tree: String::from("?") })?;
			let mut engine = boot(&dir)?;
			let summary = tokio::task::block_in_place(|| engine.refresh_now(tree_id))?;
			println!(
				"scanned {} inserted {} updated {} removed {}",
				summary.scanned, summary.inserted, summary.updated, summary.removed
			);
			engine.shutdown();
		}
		Some(("status", _)) => {
			let mut engine = boot(&dir)?;
			for pair in engine.status() {
				println!(
					"{} -> {}: down {}/{} files, up {} files, {} B/s",
					pair.remote_tree_id,
					pair.local_tree_id,
					pair.file_to_download,
					pair.file_consistent + pair.file_to_download,
					pair.file_to_upload,
					pair.speed_download,
				);
			}
			engine.shutdown();
		}
		_ => unreachable!("subcommand required"),
	}
	Ok(())
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn StdError>> {
	init_tracing();
	match run().await {
		Ok(()) => Ok(()),
		Err(e) => {
			error!("{}", e);
			std::process::exit(1);
		}
	}
}

// vim: ts=4
