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

pub(crate) mod serve;
mod target_addr;

pub use target_addr::{AddrError, AddrType, Destination, DomainName, TargetAddr};

use crate::{prelude::*, utils::Counter};
use parking_lot::Mutex;
use std::{
	collections::HashMap,
	fmt, io,
	time::{Duration, Instant, SystemTime},
};

const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;
const DEFAULT_MAX_CONNECTIONS: usize = 100;
const DEFAULT_TIMEOUT_SECS: u64 = 300;

// -------------------------------------------------------
//                    ProtocolStatus
// -------------------------------------------------------

/// Lifecycle state of an adapter.
///
/// Transitions: `Stopped -> Starting -> Running -> Stopping -> Stopped`,
/// plus `Running -> Error` on unrecoverable failure. `Error -> Starting`
/// happens only through the manager's restart path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolStatus {
	Stopped,
	Starting,
	Running,
	Stopping,
	Error,
}

impl Default for ProtocolStatus {
	#[inline]
	fn default() -> Self {
		ProtocolStatus::Stopped
	}
}

impl fmt::Display for ProtocolStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			ProtocolStatus::Stopped => "stopped",
			ProtocolStatus::Starting => "starting",
			ProtocolStatus::Running => "running",
			ProtocolStatus::Stopping => "stopping",
			ProtocolStatus::Error => "error",
		};
		f.write_str(s)
	}
}

#[derive(Debug, Default)]
pub(crate) struct StatusCell(Mutex<ProtocolStatus>);

impl StatusCell {
	#[inline]
	pub fn get(&self) -> ProtocolStatus {
		*self.0.lock()
	}

	/// Set a new status, returning the old one.
	#[inline]
	pub fn set(&self, status: ProtocolStatus) -> ProtocolStatus {
		std::mem::replace(&mut *self.0.lock(), status)
	}
}

// -------------------------------------------------------
//                    ProtocolConfig
// -------------------------------------------------------

/// Configuration shared by all adapters.
///
/// Created once at registration time, never mutated after the
/// adapter starts.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "use_serde", derive(serde::Deserialize))]
pub struct ProtocolConfig {
	pub name: Tag,
	pub bind_addr: SocketAddr,
	/// Fixed target. Adapters without one act as terminating
	/// endpoints (echo/direct mode) where that makes sense.
	#[cfg_attr(feature = "use_serde", serde(default))]
	pub target: Option<TargetAddr>,
	/// Username to password table. Empty means no authentication.
	#[cfg_attr(feature = "use_serde", serde(default))]
	pub users: HashMap<String, String>,
	#[cfg_attr(feature = "use_serde", serde(default = "default_buffer_size"))]
	pub buffer_size: usize,
	#[cfg_attr(feature = "use_serde", serde(default = "default_max_connections"))]
	pub max_connections: usize,
	/// Idle timeout for relays and handshakes, in seconds.
	#[cfg_attr(feature = "use_serde", serde(default = "default_timeout_secs"))]
	pub timeout_secs: u64,
}

const fn default_buffer_size() -> usize {
	DEFAULT_BUFFER_SIZE
}

const fn default_max_connections() -> usize {
	DEFAULT_MAX_CONNECTIONS
}

const fn default_timeout_secs() -> u64 {
	DEFAULT_TIMEOUT_SECS
}

impl ProtocolConfig {
	#[must_use]
	pub fn new(name: impl Into<Tag>, bind_addr: SocketAddr) -> Self {
		Self {
			name: name.into(),
			bind_addr,
			target: None,
			users: HashMap::new(),
			buffer_size: DEFAULT_BUFFER_SIZE,
			max_connections: DEFAULT_MAX_CONNECTIONS,
			timeout_secs: DEFAULT_TIMEOUT_SECS,
		}
	}

	#[inline]
	#[must_use]
	pub fn timeout(&self) -> Duration {
		Duration::from_secs(self.timeout_secs)
	}

	#[inline]
	#[must_use]
	pub fn auth_required(&self) -> bool {
		!self.users.is_empty()
	}
}

// -------------------------------------------------------
//                     ProtocolStats
// -------------------------------------------------------

/// Counters owned by one adapter.
///
/// Only the adapter's own connection handling code updates these,
/// the manager and external monitors read them through
/// [`ProtocolStats::snapshot`].
#[derive(Debug, Default)]
pub struct ProtocolStats {
	start_time: Mutex<Option<SystemTime>>,
	stop_time: Mutex<Option<SystemTime>>,
	total_connections: Counter,
	active_connections: Counter,
	bytes_sent: Counter,
	bytes_received: Counter,
	errors: Counter,
	last_error: Mutex<Option<String>>,
}

impl ProtocolStats {
	pub(crate) fn mark_started(&self) {
		*self.start_time.lock() = Some(SystemTime::now());
		*self.stop_time.lock() = None;
	}

	pub(crate) fn mark_stopped(&self) {
		*self.stop_time.lock() = Some(SystemTime::now());
	}

	pub(crate) fn conn_opened(&self) {
		self.total_connections.add(1);
		self.active_connections.add(1);
	}

	pub(crate) fn conn_closed(&self) {
		self.active_connections.sub(1);
	}

	pub(crate) fn record_error(&self, err: &dyn fmt::Display) {
		self.errors.add(1);
		*self.last_error.lock() = Some(err.to_string());
	}

	/// Counter for bytes flowing to clients.
	pub(crate) fn sent(&self) -> Counter {
		self.bytes_sent.clone()
	}

	/// Counter for bytes flowing from clients.
	pub(crate) fn received(&self) -> Counter {
		self.bytes_received.clone()
	}

	#[must_use]
	pub fn snapshot(&self) -> StatsSnapshot {
		StatsSnapshot {
			start_time: *self.start_time.lock(),
			stop_time: *self.stop_time.lock(),
			total_connections: self.total_connections.get(),
			active_connections: self.active_connections.get(),
			bytes_sent: self.bytes_sent.get(),
			bytes_received: self.bytes_received.get(),
			errors: self.errors.get(),
			last_error: self.last_error.lock().clone(),
		}
	}
}

/// Point-in-time copy of an adapter's [`ProtocolStats`].
#[derive(Clone, Debug, Default)]
pub struct StatsSnapshot {
	pub start_time: Option<SystemTime>,
	pub stop_time: Option<SystemTime>,
	pub total_connections: u64,
	pub active_connections: u64,
	pub bytes_sent: u64,
	pub bytes_received: u64,
	pub errors: u64,
	pub last_error: Option<String>,
}

// -------------------------------------------------------
//                      ConnRecord
// -------------------------------------------------------

/// Per-connection bookkeeping.
///
/// Lives in the owning adapter's registry exactly as long as the
/// underlying transport is open.
#[derive(Debug)]
pub struct ConnRecord {
	pub id: u64,
	pub peer: SocketAddr,
	pub target: Option<TargetAddr>,
	pub created: Instant,
	last_activity: Mutex<Instant>,
	pub(crate) recv: Counter,
	pub(crate) send: Counter,
}

impl ConnRecord {
	#[must_use]
	pub fn new(id: u64, peer: SocketAddr, target: Option<TargetAddr>) -> Self {
		let now = Instant::now();
		Self {
			id,
			peer,
			target,
			created: now,
			last_activity: Mutex::new(now),
			recv: Counter::new(),
			send: Counter::new(),
		}
	}

	pub fn touch(&self) {
		*self.last_activity.lock() = Instant::now();
	}

	#[must_use]
	pub fn idle_time(&self) -> Duration {
		self.last_activity.lock().elapsed()
	}

	#[must_use]
	pub fn bytes_received(&self) -> u64 {
		self.recv.get()
	}

	#[must_use]
	pub fn bytes_sent(&self) -> u64 {
		self.send.get()
	}
}

// -------------------------------------------------------
//                     AdapterError
// -------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
	#[error("IO error ({0})")]
	Io(#[from] io::Error),
	#[error("protocol error ({0})")]
	Protocol(BoxStdErr),
	#[error("authentication failed")]
	Auth,
	#[error("connection limit of {0} reached")]
	LimitReached(usize),
	#[error("adapter is not running")]
	NotRunning,
	#[error("cannot do that while adapter is {0}")]
	InvalidState(ProtocolStatus),
	#[error("operation requires elevated privileges ({0})")]
	PrivilegeRequired(BoxStdErr),
	#[error("{0} is not supported")]
	Unsupported(&'static str),
}

impl AdapterError {
	#[inline]
	pub fn new_protocol(e: impl Into<BoxStdErr>) -> Self {
		AdapterError::Protocol(e.into())
	}
}

// -------------------------------------------------------
//                    ProtocolAdapter
// -------------------------------------------------------

/// The contract every protocol adapter fulfills.
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
	fn protocol_name(&self) -> &'static str;
	fn config(&self) -> &ProtocolConfig;
	fn status(&self) -> ProtocolStatus;
	fn snapshot(&self) -> StatsSnapshot;

	/// Bind resources and begin serving.
	///
	/// Calling `start` on an adapter that is already starting or
	/// running is a no-op returning `Ok`.
	///
	/// # Errors
	/// On failure the adapter enters [`ProtocolStatus::Error`] and the
	/// cause is returned; the manager may retry through its restart
	/// path.
	async fn start(&self) -> Result<(), AdapterError>;

	/// Drain and close every registered connection, then release the
	/// listening resources. A no-op when already stopped.
	///
	/// # Errors
	/// Returns an [`AdapterError`] when teardown fails.
	async fn stop(&self) -> Result<(), AdapterError>;

	fn name(&self) -> &Tag {
		&self.config().name
	}
}
