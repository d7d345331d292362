/**********************************************************************

Copyright (C) 2021 by reddal

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU General Public License for more details.

You should have received a copy of the GNU General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

**********************************************************************/

use super::{
	AdapterError, ConnRecord, ProtocolConfig, ProtocolStats, ProtocolStatus, StatusCell,
};
use crate::prelude::*;
use parking_lot::Mutex;
use std::{collections::HashMap, future::Future};
use tokio::{
	net::{TcpListener, TcpStream},
	task::JoinHandle,
};

/// Everything a TCP based adapter shares with its per-connection
/// tasks: config, status cell, stats and the connection registry.
pub(crate) struct AdapterShared {
	pub config: ProtocolConfig,
	pub status: StatusCell,
	pub stats: ProtocolStats,
	pub registry: Registry,
	/// Actual bound address, useful when the config asked for port 0.
	pub local_addr: Mutex<Option<SocketAddr>>,
}

impl AdapterShared {
	pub fn new(config: ProtocolConfig) -> Self {
		Self {
			config,
			status: StatusCell::default(),
			stats: ProtocolStats::default(),
			registry: Registry::default(),
			local_addr: Mutex::new(None),
		}
	}

	pub fn local_addr(&self) -> Option<SocketAddr> {
		*self.local_addr.lock()
	}

	pub fn enter_running(&self) {
		self.stats.mark_started();
		self.status.set(ProtocolStatus::Running);
	}

	pub fn enter_error(&self, err: &dyn std::fmt::Display) {
		self.stats.record_error(err);
		self.status.set(ProtocolStatus::Error);
	}
}

struct Entry {
	record: Arc<ConnRecord>,
	task: JoinHandle<()>,
}

/// Registry of live connections and their tasks.
///
/// An entry exists exactly as long as its task is allowed to run;
/// the guard returned by [`Registry::conn_guard`] removes the entry
/// when the per-connection task finishes or is aborted.
#[derive(Default)]
pub(crate) struct Registry {
	conns: Mutex<HashMap<u64, Entry>>,
}

impl Registry {
	pub fn count(&self) -> usize {
		self.conns.lock().len()
	}

	pub fn records(&self) -> Vec<Arc<ConnRecord>> {
		self.conns.lock().values().map(|e| e.record.clone()).collect()
	}

	/// Spawn `fut` as the connection's task and register it.
	///
	/// The lock is held across the spawn so the task cannot observe
	/// a registry without its own entry.
	pub fn spawn_conn<F>(&self, record: Arc<ConnRecord>, fut: F)
	where
		F: Future<Output = ()> + Send + 'static,
	{
		let id = record.id;
		let mut conns = self.conns.lock();
		let task = tokio::spawn(fut);
		conns.insert(id, Entry { record, task });
	}

	pub fn remove(&self, id: u64) -> Option<Arc<ConnRecord>> {
		self.conns.lock().remove(&id).map(|e| e.record)
	}

	/// Cancel every connection task and wait for all of them.
	pub async fn close_all(&self) {
		let entries: Vec<Entry> = self.conns.lock().drain().map(|(_, e)| e).collect();
		for entry in &entries {
			entry.task.abort();
		}
		for entry in entries {
			let _ = entry.task.await;
		}
	}
}

/// Removes the connection from the registry and fixes the active
/// counter when the task ends, aborted or not.
pub(crate) struct ConnGuard {
	pub shared: Arc<AdapterShared>,
	pub id: u64,
}

impl Drop for ConnGuard {
	fn drop(&mut self) {
		self.shared.registry.remove(self.id);
		self.shared.stats.conn_closed();
	}
}

/// One accepted stream, handled by an adapter specific handshake and
/// pump.
#[async_trait]
pub(crate) trait StreamHandler: Send + Sync + 'static {
	async fn handle_conn(
		self: Arc<Self>,
		stream: TcpStream,
		record: Arc<ConnRecord>,
	) -> Result<(), AdapterError>;
}

/// Accept loop shared by all TCP based adapters.
///
/// Refuses connections over the configured limit before reading any
/// protocol bytes, spawns one task per accepted stream, and puts the
/// adapter into the error state if accepting itself fails.
pub(crate) async fn serve_stream<H: StreamHandler>(
	listener: TcpListener,
	handler: Arc<H>,
	shared: Arc<AdapterShared>,
) {
	let name = shared.config.name.clone();
	loop {
		let (stream, peer) = match listener.accept().await {
			Ok(res) => res,
			Err(err) => {
				error!("('{}') error when accepting connection: {}", name, err);
				shared.enter_error(&err);
				return;
			}
		};
		if shared.registry.count() >= shared.config.max_connections {
			warn!(
				"('{}') connection limit of {} reached, refusing {}",
				name, shared.config.max_connections, peer
			);
			drop(stream);
			continue;
		}
		let conn_id = rand::thread_rng().next_u64();
		let record = Arc::new(ConnRecord::new(
			conn_id,
			peer,
			shared.config.target.clone(),
		));
		shared.stats.conn_opened();
		debug!("[{:x}] ('{}') accepted connection from {}", conn_id, name, peer);

		let guard = ConnGuard {
			shared: shared.clone(),
			id: conn_id,
		};
		let handler = handler.clone();
		let task_shared = shared.clone();
		let task_record = record.clone();
		shared.registry.spawn_conn(record, async move {
			let _guard = guard;
			match handler.handle_conn(stream, task_record).await {
				Ok(()) => {
					debug!("[{:x}] connection finished", conn_id);
				}
				Err(err) => {
					task_shared.stats.record_error(&err);
					warn!("[{:x}] connection error: {}", conn_id, err);
				}
			}
		});
	}
}

/// Common `start` for TCP based adapters: bind, mark running, spawn
/// the accept loop.
pub(crate) async fn start_stream_adapter<H: StreamHandler>(
	shared: &Arc<AdapterShared>,
	handler: &Arc<H>,
	serve_task: &AsyncMutex<Option<JoinHandle<()>>>,
) -> Result<(), AdapterError> {
	match shared.status.get() {
		ProtocolStatus::Running | ProtocolStatus::Starting => return Ok(()),
		ProtocolStatus::Stopping => {
			return Err(AdapterError::InvalidState(ProtocolStatus::Stopping))
		}
		ProtocolStatus::Stopped | ProtocolStatus::Error => {}
	}
	shared.status.set(ProtocolStatus::Starting);
	let listener = match TcpListener::bind(shared.config.bind_addr).await {
		Ok(listener) => listener,
		Err(err) => {
			error!(
				"('{}') cannot bind on {}: {}",
				shared.config.name, shared.config.bind_addr, err
			);
			shared.enter_error(&err);
			return Err(err.into());
		}
	};
	let bound = listener.local_addr().ok();
	*shared.local_addr.lock() = bound;
	let task = tokio::spawn(serve_stream(listener, handler.clone(), shared.clone()));
	*serve_task.lock().await = Some(task);
	shared.enter_running();
	info!(
		"('{}') listening on {}",
		shared.config.name,
		bound.unwrap_or(shared.config.bind_addr)
	);
	Ok(())
}

/// Common `stop`: cancel the accept loop, then drain every
/// connection task before reporting stopped.
pub(crate) async fn stop_stream_adapter(
	shared: &Arc<AdapterShared>,
	serve_task: &AsyncMutex<Option<JoinHandle<()>>>,
) -> Result<(), AdapterError> {
	if shared.status.get() == ProtocolStatus::Stopped {
		return Ok(());
	}
	shared.status.set(ProtocolStatus::Stopping);
	if let Some(task) = serve_task.lock().await.take() {
		task.abort();
		let _ = task.await;
	}
	shared.registry.close_all().await;
	*shared.local_addr.lock() = None;
	shared.stats.mark_stopped();
	shared.status.set(ProtocolStatus::Stopped);
	info!("('{}') stopped", shared.config.name);
	Ok(())
}
