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

use crate::{
	prelude::*,
	protocol::{AdapterError, ProtocolAdapter, ProtocolStatus, StatsSnapshot},
};
use parking_lot::Mutex;
use std::{collections::HashMap, fmt, time::Duration};
use tokio::task::JoinHandle;

const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
	#[error("no adapter named '{0}'")]
	NotFound(Tag),
	#[error("adapter named '{0}' already registered")]
	Duplicate(Tag),
	#[error("adapter '{name}' failed ({source})")]
	Adapter {
		name: Tag,
		#[source]
		source: AdapterError,
	},
}

/// Lifecycle events, dispatched synchronously to every callback in
/// registration order.
#[derive(Debug)]
pub enum Event {
	Started(Tag),
	Stopped(Tag),
	Failed { name: Tag, error: String },
}

impl fmt::Display for Event {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Event::Started(name) => write!(f, "protocol '{}' started", name),
			Event::Stopped(name) => write!(f, "protocol '{}' stopped", name),
			Event::Failed { name, error } => {
				write!(f, "protocol '{}' failed ({})", name, error)
			}
		}
	}
}

pub type EventCallback = Box<dyn Fn(&Event) -> Result<(), BoxStdErr> + Send + Sync>;

/// Per adapter entry in a [`Summary`].
pub struct AdapterSummary {
	pub name: Tag,
	pub protocol: &'static str,
	pub status: ProtocolStatus,
	pub stats: StatsSnapshot,
}

/// Aggregate over every registered adapter.
#[derive(Default)]
pub struct Summary {
	pub adapters: Vec<AdapterSummary>,
	pub total_connections: u64,
	pub active_connections: u64,
	pub bytes_sent: u64,
	pub bytes_received: u64,
	pub errors: u64,
}

/// Owns a named set of adapters and drives their lifecycle.
///
/// The manager is the only writer of desired-state transitions;
/// adapters own their stats and registries.
pub struct ProtocolManager {
	adapters: AsyncMutex<HashMap<Tag, Arc<dyn ProtocolAdapter>>>,
	callbacks: Mutex<Vec<EventCallback>>,
	monitor_interval: Duration,
}

impl Default for ProtocolManager {
	fn default() -> Self {
		Self::new()
	}
}

impl ProtocolManager {
	#[must_use]
	pub fn new() -> Self {
		Self {
			adapters: AsyncMutex::new(HashMap::new()),
			callbacks: Mutex::new(Vec::new()),
			monitor_interval: DEFAULT_MONITOR_INTERVAL,
		}
	}

	#[must_use]
	pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
		self.monitor_interval = interval;
		self
	}

	/// Register `adapter` under its configured name.
	///
	/// # Errors
	/// Returns [`ManagerError::Duplicate`] if the name is taken.
	pub async fn register(&self, adapter: Arc<dyn ProtocolAdapter>) -> Result<(), ManagerError> {
		let name = adapter.name().clone();
		let mut adapters = self.adapters.lock().await;
		if adapters.contains_key(&name) {
			return Err(ManagerError::Duplicate(name));
		}
		info!("registered protocol '{}' ({})", name, adapter.protocol_name());
		adapters.insert(name, adapter);
		Ok(())
	}

	/// Remove the adapter named `name`, stopping it first if needed.
	///
	/// # Errors
	/// Returns [`ManagerError::NotFound`] if there is no such adapter.
	pub async fn unregister(&self, name: &str) -> Result<(), ManagerError> {
		let adapter = {
			let mut adapters = self.adapters.lock().await;
			adapters
				.remove(name)
				.ok_or_else(|| ManagerError::NotFound(Tag::new(name)))?
		};
		if adapter.status() != ProtocolStatus::Stopped {
			if let Err(err) = adapter.stop().await {
				warn!("error stopping '{}' during unregister: {}", name, err);
			}
			self.emit(&Event::Stopped(adapter.name().clone()));
		}
		info!("unregistered protocol '{}'", name);
		Ok(())
	}

	pub fn add_callback(&self, callback: EventCallback) {
		self.callbacks.lock().push(callback);
	}

	async fn get(&self, name: &str) -> Result<Arc<dyn ProtocolAdapter>, ManagerError> {
		self.adapters
			.lock()
			.await
			.get(name)
			.cloned()
			.ok_or_else(|| ManagerError::NotFound(Tag::new(name)))
	}

	/// Start the adapter named `name`.
	///
	/// # Errors
	/// Returns [`ManagerError::NotFound`] or the adapter's own error.
	pub async fn start(&self, name: &str) -> Result<(), ManagerError> {
		let adapter = self.get(name).await?;
		match adapter.start().await {
			Ok(()) => {
				self.emit(&Event::Started(adapter.name().clone()));
				Ok(())
			}
			Err(err) => {
				self.emit(&Event::Failed {
					name: adapter.name().clone(),
					error: err.to_string(),
				});
				Err(ManagerError::Adapter {
					name: Tag::new(name),
					source: err,
				})
			}
		}
	}

	/// Stop the adapter named `name`.
	///
	/// # Errors
	/// Returns [`ManagerError::NotFound`] or the adapter's own error.
	pub async fn stop(&self, name: &str) -> Result<(), ManagerError> {
		let adapter = self.get(name).await?;
		adapter.stop().await.map_err(|err| ManagerError::Adapter {
			name: Tag::new(name),
			source: err,
		})?;
		self.emit(&Event::Stopped(adapter.name().clone()));
		Ok(())
	}

	/// Stop then start the adapter named `name`.
	///
	/// # Errors
	/// Returns [`ManagerError::NotFound`] or the adapter's own error.
	pub async fn restart(&self, name: &str) -> Result<(), ManagerError> {
		if let Err(err) = self.stop(name).await {
			if matches!(err, ManagerError::NotFound(_)) {
				return Err(err);
			}
			// A failed stop should not block the restart attempt.
			warn!("restart of '{}': stop failed ({})", name, err);
		}
		self.start(name).await
	}

	/// Start every registered adapter. Returns `true` when all of
	/// them started.
	pub async fn start_all(&self) -> bool {
		let names: Vec<Tag> = self.adapters.lock().await.keys().cloned().collect();
		let mut all_ok = true;
		for name in names {
			if let Err(err) = self.start(&name).await {
				error!("{}", err);
				all_ok = false;
			}
		}
		all_ok
	}

	/// Stop every registered adapter. Returns `true` when all of
	/// them stopped cleanly.
	pub async fn stop_all(&self) -> bool {
		let names: Vec<Tag> = self.adapters.lock().await.keys().cloned().collect();
		let mut all_ok = true;
		for name in names {
			if let Err(err) = self.stop(&name).await {
				error!("{}", err);
				all_ok = false;
			}
		}
		all_ok
	}

	pub async fn status(&self, name: &str) -> Option<ProtocolStatus> {
		self.adapters.lock().await.get(name).map(|a| a.status())
	}

	pub async fn snapshot(&self, name: &str) -> Option<StatsSnapshot> {
		self.adapters.lock().await.get(name).map(|a| a.snapshot())
	}

	pub async fn summary(&self) -> Summary {
		let adapters = self.adapters.lock().await;
		let mut summary = Summary::default();
		for adapter in adapters.values() {
			let stats = adapter.snapshot();
			summary.total_connections += stats.total_connections;
			summary.active_connections += stats.active_connections;
			summary.bytes_sent += stats.bytes_sent;
			summary.bytes_received += stats.bytes_received;
			summary.errors += stats.errors;
			summary.adapters.push(AdapterSummary {
				name: adapter.name().clone(),
				protocol: adapter.protocol_name(),
				status: adapter.status(),
				stats,
			});
		}
		summary
	}

	/// Spawn the supervisory loop: every interval, adapters observed
	/// in the error state are restarted.
	#[must_use]
	pub fn spawn_monitor(self: &Arc<Self>) -> MonitorHandle {
		let manager = self.clone();
		let interval = self.monitor_interval;
		let task = tokio::spawn(async move {
			let mut ticker = tokio::time::interval(interval);
			// The first tick fires immediately, skip it.
			ticker.tick().await;
			loop {
				ticker.tick().await;
				manager.check_for_errors().await;
			}
		});
		MonitorHandle { task }
	}

	async fn check_for_errors(&self) {
		let names: Vec<Tag> = {
			let adapters = self.adapters.lock().await;
			adapters
				.iter()
				.filter(|(_, a)| a.status() == ProtocolStatus::Error)
				.map(|(name, _)| name.clone())
				.collect()
		};
		for name in names {
			warn!("protocol '{}' is in error state, restarting", name);
			if let Err(err) = self.restart(&name).await {
				error!("failed to restart '{}': {}", name, err);
			}
		}
	}

	fn emit(&self, event: &Event) {
		debug!("{}", event);
		let callbacks = self.callbacks.lock();
		for callback in callbacks.iter() {
			if let Err(err) = callback(event) {
				// One failing callback must not starve the rest.
				error!("event callback failed ({})", err);
			}
		}
	}
}

/// Handle to the spawned monitor task.
pub struct MonitorHandle {
	task: JoinHandle<()>,
}

impl MonitorHandle {
	pub fn shutdown(self) {
		self.task.abort();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::protocol::{ProtocolConfig, StatusCell};
	use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

	struct FlakyAdapter {
		config: ProtocolConfig,
		status: StatusCell,
		broken: AtomicBool,
		starts: AtomicUsize,
	}

	impl FlakyAdapter {
		fn new(name: &str) -> Self {
			Self {
				config: ProtocolConfig::new(name, "127.0.0.1:0".parse().unwrap()),
				status: StatusCell::default(),
				broken: AtomicBool::new(false),
				starts: AtomicUsize::new(0),
			}
		}
	}

	#[async_trait]
	impl ProtocolAdapter for FlakyAdapter {
		fn protocol_name(&self) -> &'static str {
			"flaky"
		}

		fn config(&self) -> &ProtocolConfig {
			&self.config
		}

		fn status(&self) -> ProtocolStatus {
			self.status.get()
		}

		fn snapshot(&self) -> StatsSnapshot {
			StatsSnapshot::default()
		}

		async fn start(&self) -> Result<(), AdapterError> {
			self.starts.fetch_add(1, Ordering::SeqCst);
			if self.broken.load(Ordering::SeqCst) {
				self.status.set(ProtocolStatus::Error);
				return Err(AdapterError::NotRunning);
			}
			self.status.set(ProtocolStatus::Running);
			Ok(())
		}

		async fn stop(&self) -> Result<(), AdapterError> {
			self.status.set(ProtocolStatus::Stopped);
			Ok(())
		}
	}

	fn rt() -> tokio::runtime::Runtime {
		let _ = env_logger::builder().is_test(true).try_init();
		tokio::runtime::Builder::new_multi_thread()
			.enable_time()
			.worker_threads(2)
			.build()
			.unwrap()
	}

	#[test]
	fn register_start_stop() {
		rt().block_on(async {
			let manager = ProtocolManager::new();
			let adapter = Arc::new(FlakyAdapter::new("a"));
			manager.register(adapter.clone()).await.unwrap();
			assert!(matches!(
				manager.register(adapter.clone()).await,
				Err(ManagerError::Duplicate(_))
			));

			manager.start("a").await.unwrap();
			assert_eq!(manager.status("a").await, Some(ProtocolStatus::Running));
			manager.stop("a").await.unwrap();
			assert_eq!(manager.status("a").await, Some(ProtocolStatus::Stopped));
			assert!(matches!(
				manager.start("missing").await,
				Err(ManagerError::NotFound(_))
			));
		});
	}

	#[test]
	fn unregister_stops_running_adapter() {
		rt().block_on(async {
			let manager = ProtocolManager::new();
			let adapter = Arc::new(FlakyAdapter::new("a"));
			manager.register(adapter.clone()).await.unwrap();
			manager.start("a").await.unwrap();
			manager.unregister("a").await.unwrap();
			assert_eq!(adapter.status(), ProtocolStatus::Stopped);
			assert!(manager.status("a").await.is_none());
		});
	}

	#[test]
	fn callbacks_isolated_and_ordered() {
		rt().block_on(async {
			let manager = ProtocolManager::new();
			let order = Arc::new(Mutex::new(Vec::new()));
			{
				let order = order.clone();
				manager.add_callback(Box::new(move |_| {
					order.lock().push(1);
					Err("first callback always fails".into())
				}));
			}
			{
				let order = order.clone();
				manager.add_callback(Box::new(move |event| {
					if matches!(event, Event::Started(_)) {
						order.lock().push(2);
					}
					Ok(())
				}));
			}
			let adapter = Arc::new(FlakyAdapter::new("a"));
			manager.register(adapter).await.unwrap();
			manager.start("a").await.unwrap();
			assert_eq!(&*order.lock(), &[1, 2]);
		});
	}

	#[test]
	fn monitor_restarts_errored_adapter() {
		rt().block_on(async {
			let manager = Arc::new(
				ProtocolManager::new().with_monitor_interval(Duration::from_millis(50)),
			);
			let adapter = Arc::new(FlakyAdapter::new("a"));
			manager.register(adapter.clone()).await.unwrap();

			adapter.broken.store(true, Ordering::SeqCst);
			assert!(!manager.start_all().await);
			assert_eq!(adapter.status(), ProtocolStatus::Error);

			// Resource becomes available again.
			adapter.broken.store(false, Ordering::SeqCst);
			let monitor = manager.spawn_monitor();
			tokio::time::sleep(Duration::from_millis(200)).await;
			assert_eq!(adapter.status(), ProtocolStatus::Running);
			assert!(adapter.starts.load(Ordering::SeqCst) >= 2);
			monitor.shutdown();
		});
	}

	#[test]
	fn summary_aggregates() {
		rt().block_on(async {
			let manager = ProtocolManager::new();
			manager
				.register(Arc::new(FlakyAdapter::new("a")))
				.await
				.unwrap();
			manager
				.register(Arc::new(FlakyAdapter::new("b")))
				.await
				.unwrap();
			let summary = manager.summary().await;
			assert_eq!(summary.adapters.len(), 2);
			assert_eq!(summary.total_connections, 0);
		});
	}
}
