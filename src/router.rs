//! Work router
//!
//! One router task multiplexes four logical queues over a pool of long-lived
//! workers per queue:
//!
//! - **refresh**: at most one in-flight refresh per tree. A request arriving
//!   while the tree is being refreshed leaves one pending marker; further
//!   arrivals are dropped. Completion re-dispatches the pending marker.
//! - **sync**: at most one in-flight sync per local tree; pending remote
//!   trees collect in a set with their `is_manual` flags OR-merged.
//! - **outer**: RPCs from peers, no dedup.
//! - **inner**: local admin requests, no dedup.
//!
//! Workers pull nothing: the router pushes one unit to an idle worker and
//! marks it busy until its completion message returns. No idle worker means
//! no dispatch, which is the only backpressure needed.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::logging::*;
use crate::protocol::RpcEnvelope;

/// A peer RPC awaiting an answer.
pub struct OuterJob {
	pub envelope: RpcEnvelope,
	pub reply: oneshot::Sender<RpcEnvelope>,
}

/// Local administrative work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InnerJob {
	/// Refresh every enabled local tree
	RefreshAll,
	/// Queue syncs against every tree of one device
	SyncWithDevice { device_id: i32 },
}

/// The engine side executing routed work.
#[async_trait]
pub trait WorkHandler: Send + Sync + 'static {
	async fn handle_refresh(&self, tree_id: i32);
	async fn handle_sync(&self, local_tree_id: i32, remote_tree_id: i32, is_manual: bool);
	async fn handle_outer(&self, job: OuterJob);
	async fn handle_inner(&self, job: InnerJob);
}

enum Msg {
	Refresh { tree_id: i32 },
	Sync { local_tree_id: i32, remote_tree_id: i32, is_manual: bool },
	Outer(OuterJob),
	Inner(InnerJob),
	RefreshDone { worker: usize, tree_id: i32 },
	SyncDone { worker: usize, local_tree_id: i32 },
	OuterDone { worker: usize },
	InnerDone { worker: usize },
	Shutdown,
}

/// Request surface of the router; cheap to clone.
#[derive(Clone)]
pub struct RouterHandle {
	tx: mpsc::UnboundedSender<Msg>,
}

impl RouterHandle {
	pub fn refresh(&self, tree_id: i32) {
		let _ = self.tx.send(Msg::Refresh { tree_id });
	}

	pub fn sync(&self, local_tree_id: i32, remote_tree_id: i32, is_manual: bool) {
		let _ = self.tx.send(Msg::Sync { local_tree_id, remote_tree_id, is_manual });
	}

	pub fn outer(&self, envelope: RpcEnvelope) -> oneshot::Receiver<RpcEnvelope> {
		let (reply, rx) = oneshot::channel();
		let _ = self.tx.send(Msg::Outer(OuterJob { envelope, reply }));
		rx
	}

	pub fn inner(&self, job: InnerJob) {
		let _ = self.tx.send(Msg::Inner(job));
	}

	pub fn shutdown(&self) {
		let _ = self.tx.send(Msg::Shutdown);
	}
}

/// Worker pool sizes.
#[derive(Debug, Clone, Copy)]
pub struct PoolSizes {
	pub refresh: usize,
	pub sync: usize,
	pub outer: usize,
	pub inner: usize,
}

#[derive(Debug, PartialEq, Eq)]
enum RefreshState {
	Work,
	Pend,
}

struct SyncState {
	in_flight: bool,
	pending: HashMap<i32, bool>,
}

struct Pool<T> {
	workers: Vec<mpsc::UnboundedSender<T>>,
	idle: Vec<usize>,
}

impl<T> Pool<T> {
	fn dispatch(&mut self, work: T) -> Option<usize> {
		let worker = self.idle.pop()?;
		if self.workers[worker].send(work).is_err() {
			return None;
		}
		Some(worker)
	}

	fn dispatch_to(&mut self, worker: usize, work: T) -> bool {
		self.workers[worker].send(work).is_ok()
	}
}

struct Router {
	rx: mpsc::UnboundedReceiver<Msg>,

	refresh_pool: Pool<i32>,
	refresh_status: HashMap<i32, RefreshState>,
	refresh_backlog: VecDeque<i32>,

	sync_pool: Pool<(i32, i32, bool)>,
	sync_status: HashMap<i32, SyncState>,
	sync_backlog: VecDeque<i32>,

	outer_pool: Pool<OuterJob>,
	outer_backlog: VecDeque<OuterJob>,

	inner_pool: Pool<InnerJob>,
	inner_backlog: VecDeque<InnerJob>,
}

/// Spawn the router and its worker pools.
pub fn spawn(handler: Arc<dyn WorkHandler>, sizes: PoolSizes) -> (RouterHandle, tokio::task::JoinHandle<()>) {
	let (tx, rx) = mpsc::unbounded_channel();

	let router = Router {
		rx,
		refresh_pool: spawn_refresh_workers(sizes.refresh, &tx, &handler),
		refresh_status: HashMap::new(),
		refresh_backlog: VecDeque::new(),
		sync_pool: spawn_sync_workers(sizes.sync, &tx, &handler),
		sync_status: HashMap::new(),
		sync_backlog: VecDeque::new(),
		outer_pool: spawn_outer_workers(sizes.outer, &tx, &handler),
		outer_backlog: VecDeque::new(),
		inner_pool: spawn_inner_workers(sizes.inner, &tx, &handler),
		inner_backlog: VecDeque::new(),
	};
	let join = tokio::spawn(router.run());
	(RouterHandle { tx }, join)
}

fn spawn_refresh_workers(
	size: usize,
	tx: &mpsc::UnboundedSender<Msg>,
	handler: &Arc<dyn WorkHandler>,
) -> Pool<i32> {
	let mut pool = Pool { workers: Vec::with_capacity(size), idle: Vec::with_capacity(size) };
	for worker in 0..size {
		let (work_tx, mut work_rx) = mpsc::unbounded_channel::<i32>();
		let handler = handler.clone();
		let tx = tx.clone();
		tokio::spawn(async move {
			while let Some(tree_id) = work_rx.recv().await {
				handler.handle_refresh(tree_id).await;
				if tx.send(Msg::RefreshDone { worker, tree_id }).is_err() {
					break;
				}
			}
		});
		pool.workers.push(work_tx);
		pool.idle.push(worker);
	}
	pool
}

fn spawn_sync_workers(
	size: usize,
	tx: &mpsc::UnboundedSender<Msg>,
	handler: &Arc<dyn WorkHandler>,
) -> Pool<(i32, i32, bool)> {
	let mut pool = Pool { workers: Vec::with_capacity(size), idle: Vec::with_capacity(size) };
	for worker in 0..size {
		let (work_tx, mut work_rx) = mpsc::unbounded_channel::<(i32, i32, bool)>();
		let handler = handler.clone();
		let tx = tx.clone();
		tokio::spawn(async move {
			while let Some((local, remote, manual)) = work_rx.recv().await {
				handler.handle_sync(local, remote, manual).await;
				if tx.send(Msg::SyncDone { worker, local_tree_id: local }).is_err() {
					break;
				}
			}
		});
		pool.workers.push(work_tx);
		pool.idle.push(worker);
	}
	pool
}

fn spawn_outer_workers(
	size: usize,
	tx: &mpsc::UnboundedSender<Msg>,
	handler: &Arc<dyn WorkHandler>,
) -> Pool<OuterJob> {
	let mut pool = Pool { workers: Vec::with_capacity(size), idle: Vec::with_capacity(size) };
	for worker in 0..size {
		let (work_tx, mut work_rx) = mpsc::unbounded_channel::<OuterJob>();
		let handler = handler.clone();
		let tx = tx.clone();
		tokio::spawn(async move {
			while let Some(job) = work_rx.recv().await {
				handler.handle_outer(job).await;
				if tx.send(Msg::OuterDone { worker }).is_err() {
					break;
				}
			}
		});
		pool.workers.push(work_tx);
		pool.idle.push(worker);
	}
	pool
}

fn spawn_inner_workers(
	size: usize,
	tx: &mpsc::UnboundedSender<Msg>,
	handler: &Arc<dyn WorkHandler>,
) -> Pool<InnerJob> {
	let mut pool = Pool { workers: Vec::with_capacity(size), idle: Vec::with_capacity(size) };
	for worker in 0..size {
		let (work_tx, mut work_rx) = mpsc::unbounded_channel::<InnerJob>();
		let handler = handler.clone();
		let tx = tx.clone();
		tokio::spawn(async move {
			while let Some(job) = work_rx.recv().await {
				handler.handle_inner(job).await;
				if tx.send(Msg::InnerDone { worker }).is_err() {
					break;
				}
			}
		});
		pool.workers.push(work_tx);
		pool.idle.push(worker);
	}
	pool
}

impl Router {
	async fn run(mut self) {
		while let Some(msg) = self.rx.recv().await {
			match msg {
				Msg::Refresh { tree_id } => self.on_refresh_request(tree_id),
				Msg::Sync { local_tree_id, remote_tree_id, is_manual } => {
					self.on_sync_request(local_tree_id, remote_tree_id, is_manual)
				}
				Msg::Outer(job) => {
					if let Some(job) = self.dispatch_or_queue_outer(job) {
						self.outer_backlog.push_back(job);
					}
				}
				Msg::Inner(job) => {
					if let Some(job) = self.dispatch_or_queue_inner(job) {
						self.inner_backlog.push_back(job);
					}
				}
				Msg::RefreshDone { worker, tree_id } => self.on_refresh_done(worker, tree_id),
				Msg::SyncDone { worker, local_tree_id } => {
					self.on_sync_done(worker, local_tree_id)
				}
				Msg::OuterDone { worker } => {
					self.outer_pool.idle.push(worker);
					if let Some(job) = self.outer_backlog.pop_front() {
						if let Some(job) = self.dispatch_or_queue_outer(job) {
							self.outer_backlog.push_front(job);
						}
					}
				}
				Msg::InnerDone { worker } => {
					self.inner_pool.idle.push(worker);
					if let Some(job) = self.inner_backlog.pop_front() {
						if let Some(job) = self.dispatch_or_queue_inner(job) {
							self.inner_backlog.push_front(job);
						}
					}
				}
				Msg::Shutdown => break,
			}
		}
		debug!("router: shut down");
	}

	fn dispatch_or_queue_outer(&mut self, job: OuterJob) -> Option<OuterJob> {
		if self.outer_pool.idle.is_empty() {
			return Some(job);
		}
		self.outer_pool.dispatch(job);
		None
	}

	fn dispatch_or_queue_inner(&mut self, job: InnerJob) -> Option<InnerJob> {
		if self.inner_pool.idle.is_empty() {
			return Some(job);
		}
		self.inner_pool.dispatch(job);
		None
	}

	fn on_refresh_request(&mut self, tree_id: i32) {
		match self.refresh_status.get_mut(&tree_id) {
			Some(RefreshState::Work) => {
				self.refresh_status.insert(tree_id, RefreshState::Pend);
			}
			Some(RefreshState::Pend) => {
				// already one run queued behind the in-flight one
			}
			None => {
				if self.refresh_pool.dispatch(tree_id).is_some() {
					self.refresh_status.insert(tree_id, RefreshState::Work);
				} else {
					self.refresh_status.insert(tree_id, RefreshState::Pend);
					self.refresh_backlog.push_back(tree_id);
				}
			}
		}
	}

	fn on_refresh_done(&mut self, worker: usize, tree_id: i32) {
		match self.refresh_status.get(&tree_id) {
			Some(RefreshState::Pend) => {
				// a request arrived while we ran: go again on this worker
				if self.refresh_pool.dispatch_to(worker, tree_id) {
					self.refresh_status.insert(tree_id, RefreshState::Work);
					return;
				}
				self.refresh_status.remove(&tree_id);
			}
			_ => {
				self.refresh_status.remove(&tree_id);
			}
		}
		// the worker is free; serve the backlog
		if let Some(next) = self.refresh_backlog.pop_front() {
			if self.refresh_pool.dispatch_to(worker, next) {
				self.refresh_status.insert(next, RefreshState::Work);
				return;
			}
		}
		self.refresh_pool.idle.push(worker);
	}

	fn on_sync_request(&mut self, local: i32, remote: i32, manual: bool) {
		if let Some(state) = self.sync_status.get_mut(&local) {
			// serialize per local tree; OR-merge the manual flag
			let entry = state.pending.entry(remote).or_insert(false);
			*entry |= manual;
			return;
		}
		if self.sync_pool.dispatch((local, remote, manual)).is_some() {
			self.sync_status.insert(local, SyncState { in_flight: true, pending: HashMap::new() });
		} else {
			let mut pending = HashMap::new();
			pending.insert(remote, manual);
			self.sync_status.insert(local, SyncState { in_flight: false, pending });
			self.sync_backlog.push_back(local);
		}
	}

	fn on_sync_done(&mut self, worker: usize, local: i32) {
		let mut freed = true;
		if let Some(state) = self.sync_status.get_mut(&local) {
			if let Some((&remote, _)) = state.pending.iter().next() {
				let manual = state.pending.remove(&remote).unwrap_or(false);
				if self.sync_pool.dispatch_to(worker, (local, remote, manual)) {
					freed = false;
				}
				if state.pending.is_empty() && !freed {
					state.in_flight = true;
				}
			} else {
				self.sync_status.remove(&local);
			}
		}
		if !freed {
			return;
		}
		// serve another local tree from the backlog
		while let Some(next) = self.sync_backlog.pop_front() {
			let dispatched = match self.sync_status.get_mut(&next) {
				Some(state) if !state.in_flight => {
					match state.pending.iter().next().map(|(&r, &m)| (r, m)) {
						Some((remote, manual)) => {
							state.pending.remove(&remote);
							if self.sync_pool.dispatch_to(worker, (next, remote, manual)) {
								state.in_flight = true;
								true
							} else {
								false
							}
						}
						None => {
							self.sync_status.remove(&next);
							false
						}
					}
				}
				_ => false,
			};
			if dispatched {
				return;
			}
		}
		self.sync_pool.idle.push(worker);
	}
}


// vim: ts=4
