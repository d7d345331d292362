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

//! Plain TCP relay.
//!
//! With a fixed target configured, every accepted connection is
//! piped to it bidirectionally. Without one, the adapter is a
//! terminating endpoint whose behavior comes from a [`DataHook`]
//! (echo by default).

use crate::{
	prelude::*,
	protocol::{
		serve::{self, AdapterShared, StreamHandler},
		AdapterError, ConnRecord, ProtocolAdapter, ProtocolConfig, ProtocolStatus, StatsSnapshot,
	},
	utils::relay::Relay,
};
use tokio::{net::TcpStream, task::JoinHandle, time::timeout};

const PROTOCOL_NAME: &str = "tcp";

/// Per-chunk processing for endpoint mode.
#[async_trait]
pub trait DataHook: Send + Sync + 'static {
	/// Returns the bytes to write back for one chunk of input.
	/// An empty result writes nothing.
	async fn on_data(&self, record: &ConnRecord, data: &[u8]) -> Result<Vec<u8>, BoxStdErr>;
}

/// The default hook, answers every chunk with itself.
pub struct EchoHook;

#[async_trait]
impl DataHook for EchoHook {
	async fn on_data(&self, _record: &ConnRecord, data: &[u8]) -> Result<Vec<u8>, BoxStdErr> {
		Ok(data.to_vec())
	}
}

pub struct TcpRelay {
	shared: Arc<AdapterShared>,
	handler: Arc<Handler>,
	serve_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl TcpRelay {
	#[must_use]
	pub fn new(config: ProtocolConfig) -> Self {
		Self::with_hook(config, Box::new(EchoHook))
	}

	#[must_use]
	pub fn with_hook(config: ProtocolConfig, hook: Box<dyn DataHook>) -> Self {
		let shared = Arc::new(AdapterShared::new(config));
		let handler = Arc::new(Handler {
			shared: shared.clone(),
			hook,
		});
		Self {
			shared,
			handler,
			serve_task: AsyncMutex::new(None),
		}
	}

	/// The address actually bound, available while running.
	#[must_use]
	pub fn local_addr(&self) -> Option<SocketAddr> {
		self.shared.local_addr()
	}
}

#[async_trait]
impl ProtocolAdapter for TcpRelay {
	fn protocol_name(&self) -> &'static str {
		PROTOCOL_NAME
	}

	fn config(&self) -> &ProtocolConfig {
		&self.shared.config
	}

	fn status(&self) -> ProtocolStatus {
		self.shared.status.get()
	}

	fn snapshot(&self) -> StatsSnapshot {
		self.shared.stats.snapshot()
	}

	async fn start(&self) -> Result<(), AdapterError> {
		serve::start_stream_adapter(&self.shared, &self.handler, &self.serve_task).await
	}

	async fn stop(&self) -> Result<(), AdapterError> {
		serve::stop_stream_adapter(&self.shared, &self.serve_task).await
	}
}

struct Handler {
	shared: Arc<AdapterShared>,
	hook: Box<dyn DataHook>,
}

#[async_trait]
impl StreamHandler for Handler {
	async fn handle_conn(
		self: Arc<Self>,
		stream: TcpStream,
		record: Arc<ConnRecord>,
	) -> Result<(), AdapterError> {
		let config = &self.shared.config;
		if let Some(target) = &config.target {
			let target_stream = timeout(config.timeout(), target.dial())
				.await
				.map_err(|_| AdapterError::Io(std::io::ErrorKind::TimedOut.into()))??;
			debug!("[{:x}] relaying to {}", record.id, target);
			let relay = Relay {
				conn_id: record.id,
				recv: vec![self.shared.stats.received(), record.recv.clone()],
				send: vec![self.shared.stats.sent(), record.send.clone()],
				buffer_size: config.buffer_size,
				idle_timeout: config.timeout(),
			};
			relay
				.run(stream.into_split(), target_stream.into_split())
				.await?;
			Ok(())
		} else {
			self.serve_endpoint(stream, &record).await
		}
	}
}

impl Handler {
	async fn serve_endpoint(
		&self,
		mut stream: TcpStream,
		record: &ConnRecord,
	) -> Result<(), AdapterError> {
		let mut buf = vec![0_u8; self.shared.config.buffer_size];
		loop {
			let n = stream.read(&mut buf).await?;
			if n == 0 {
				return Ok(());
			}
			record.touch();
			record.recv.add(n as u64);
			self.shared.stats.received().add(n as u64);
			let reply = self
				.hook
				.on_data(record, &buf[..n])
				.await
				.map_err(AdapterError::Protocol)?;
			if !reply.is_empty() {
				stream.write_all(&reply).await?;
				record.send.add(reply.len() as u64);
				self.shared.stats.sent().add(reply.len() as u64);
			}
		}
	}
}
