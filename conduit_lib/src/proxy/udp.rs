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

//! UDP datagram relay.
//!
//! Sessions are keyed by the client `(ip, port)`. The first datagram
//! from a new key creates the session and, with a fixed target
//! configured, a companion socket towards that target; later
//! datagrams from the same key reuse it. Without a target the
//! adapter echoes datagrams back.
//!
//! There is no built-in session expiry, sessions live until the
//! adapter stops.

use crate::{
	prelude::*,
	protocol::{
		AdapterError, ConnRecord, ProtocolAdapter, ProtocolConfig, ProtocolStats, ProtocolStatus,
		StatsSnapshot, StatusCell, TargetAddr,
	},
};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::{net::UdpSocket, task::JoinHandle};

const PROTOCOL_NAME: &str = "udp";

struct Session {
	record: Arc<ConnRecord>,
	/// Socket facing the fixed target, `None` in echo mode.
	upstream: Option<Arc<UdpSocket>>,
	/// Task pumping target replies back to the client.
	pump: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct SessionMap {
	sessions: Mutex<HashMap<SocketAddr, Session>>,
}

impl SessionMap {
	fn count(&self) -> usize {
		self.sessions.lock().len()
	}

	fn clear(&self) -> Vec<Session> {
		self.sessions.lock().drain().map(|(_, s)| s).collect()
	}
}

pub struct UdpRelay {
	config: ProtocolConfig,
	status: Arc<StatusCell>,
	stats: Arc<ProtocolStats>,
	sessions: Arc<SessionMap>,
	socket: Mutex<Option<Arc<UdpSocket>>>,
	serve_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl UdpRelay {
	#[must_use]
	pub fn new(config: ProtocolConfig) -> Self {
		Self {
			config,
			status: Arc::new(StatusCell::default()),
			stats: Arc::new(ProtocolStats::default()),
			sessions: Arc::new(SessionMap::default()),
			socket: Mutex::new(None),
			serve_task: AsyncMutex::new(None),
		}
	}

	#[must_use]
	pub fn local_addr(&self) -> Option<SocketAddr> {
		self.socket
			.lock()
			.as_ref()
			.and_then(|s| s.local_addr().ok())
	}

	#[must_use]
	pub fn session_count(&self) -> usize {
		self.sessions.count()
	}
}

#[async_trait]
impl ProtocolAdapter for UdpRelay {
	fn protocol_name(&self) -> &'static str {
		PROTOCOL_NAME
	}

	fn config(&self) -> &ProtocolConfig {
		&self.config
	}

	fn status(&self) -> ProtocolStatus {
		self.status.get()
	}

	fn snapshot(&self) -> StatsSnapshot {
		self.stats.snapshot()
	}

	async fn start(&self) -> Result<(), AdapterError> {
		match self.status.get() {
			ProtocolStatus::Running | ProtocolStatus::Starting => return Ok(()),
			ProtocolStatus::Stopping => {
				return Err(AdapterError::InvalidState(ProtocolStatus::Stopping))
			}
			ProtocolStatus::Stopped | ProtocolStatus::Error => {}
		}
		self.status.set(ProtocolStatus::Starting);
		let socket = match UdpSocket::bind(self.config.bind_addr).await {
			Ok(socket) => Arc::new(socket),
			Err(err) => {
				error!(
					"('{}') cannot bind on {}: {}",
					self.config.name, self.config.bind_addr, err
				);
				self.stats.record_error(&err);
				self.status.set(ProtocolStatus::Error);
				return Err(err.into());
			}
		};
		*self.socket.lock() = Some(socket.clone());

		let task = tokio::spawn(serve_datagrams(
			socket,
			self.config.clone(),
			self.stats.clone(),
			self.sessions.clone(),
			self.status.clone(),
		));
		*self.serve_task.lock().await = Some(task);
		self.stats.mark_started();
		self.status.set(ProtocolStatus::Running);
		info!(
			"('{}') listening on {}",
			self.config.name,
			self.local_addr()
				.unwrap_or(self.config.bind_addr)
		);
		Ok(())
	}

	async fn stop(&self) -> Result<(), AdapterError> {
		if self.status.get() == ProtocolStatus::Stopped {
			return Ok(());
		}
		self.status.set(ProtocolStatus::Stopping);
		if let Some(task) = self.serve_task.lock().await.take() {
			task.abort();
			let _ = task.await;
		}
		for session in self.sessions.clear() {
			if let Some(pump) = session.pump {
				pump.abort();
				let _ = pump.await;
			}
			self.stats.conn_closed();
			debug!("[{:x}] session closed", session.record.id);
		}
		*self.socket.lock() = None;
		self.stats.mark_stopped();
		self.status.set(ProtocolStatus::Stopped);
		info!("('{}') stopped", self.config.name);
		Ok(())
	}
}

async fn serve_datagrams(
	socket: Arc<UdpSocket>,
	config: ProtocolConfig,
	stats: Arc<ProtocolStats>,
	sessions: Arc<SessionMap>,
	status: Arc<StatusCell>,
) {
	let mut buf = vec![0_u8; config.buffer_size];
	loop {
		let (len, peer) = match socket.recv_from(&mut buf).await {
			Ok(res) => res,
			Err(err) => {
				error!("('{}') recv error: {}", config.name, err);
				stats.record_error(&err);
				status.set(ProtocolStatus::Error);
				return;
			}
		};
		stats.received().add(len as u64);

		// Fast path: existing session.
		let upstream = {
			let map = sessions.sessions.lock();
			map.get(&peer).map(|s| {
				s.record.touch();
				s.record.recv.add(len as u64);
				s.upstream.clone()
			})
		};
		let upstream = if let Some(upstream) = upstream {
			upstream
		} else {
			if sessions.count() >= config.max_connections {
				warn!(
					"('{}') session limit of {} reached, dropping datagram from {}",
					config.name, config.max_connections, peer
				);
				continue;
			}
			match open_session(&socket, &config, &stats, &sessions, peer).await {
				Ok(upstream) => upstream,
				Err(err) => {
					warn!("('{}') cannot open session for {}: {}", config.name, peer, err);
					stats.record_error(&err);
					continue;
				}
			}
		};

		if let Some(upstream) = upstream {
			if let Err(err) = upstream.send(&buf[..len]).await {
				warn!("('{}') send to target failed: {}", config.name, err);
				stats.record_error(&err);
			}
		} else {
			// Echo mode.
			if let Err(err) = socket.send_to(&buf[..len], peer).await {
				warn!("('{}') echo to {} failed: {}", config.name, peer, err);
				stats.record_error(&err);
			} else {
				stats.sent().add(len as u64);
			}
		}
	}
}

async fn open_session(
	socket: &Arc<UdpSocket>,
	config: &ProtocolConfig,
	stats: &Arc<ProtocolStats>,
	sessions: &Arc<SessionMap>,
	peer: SocketAddr,
) -> std::io::Result<Option<Arc<UdpSocket>>> {
	let id = rand::thread_rng().next_u64();
	let record = Arc::new(ConnRecord::new(id, peer, config.target.clone()));
	stats.conn_opened();
	debug!("[{:x}] ('{}') new session from {}", id, config.name, peer);

	let (upstream, pump) = if let Some(target) = &config.target {
		let upstream = Arc::new(UdpSocket::bind((unspecified_ip(peer), 0)).await?);
		connect_target(&upstream, target).await?;
		let pump = tokio::spawn(pump_replies(
			upstream.clone(),
			socket.clone(),
			peer,
			config.buffer_size,
			stats.clone(),
			record.clone(),
		));
		(Some(upstream), Some(pump))
	} else {
		(None, None)
	};

	let result = upstream.clone();
	sessions.sessions.lock().insert(
		peer,
		Session {
			record,
			upstream,
			pump,
		},
	);
	Ok(result)
}

fn unspecified_ip(peer: SocketAddr) -> IpAddr {
	match peer {
		SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
		SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
	}
}

async fn connect_target(socket: &UdpSocket, target: &TargetAddr) -> std::io::Result<()> {
	match &target.dest {
		Destination::Ip(ip) => socket.connect(SocketAddr::new(*ip, target.port)).await,
		Destination::Name(name) => socket.connect((name.as_str(), target.port)).await,
	}
}

/// Pump replies from the target back to the session's client.
async fn pump_replies(
	upstream: Arc<UdpSocket>,
	socket: Arc<UdpSocket>,
	peer: SocketAddr,
	buffer_size: usize,
	stats: Arc<ProtocolStats>,
	record: Arc<ConnRecord>,
) {
	let mut buf = vec![0_u8; buffer_size];
	loop {
		let len = match upstream.recv(&mut buf).await {
			Ok(len) => len,
			Err(err) => {
				debug!("[{:x}] target recv ended: {}", record.id, err);
				return;
			}
		};
		record.touch();
		record.send.add(len as u64);
		if let Err(err) = socket.send_to(&buf[..len], peer).await {
			debug!("[{:x}] reply to {} failed: {}", record.id, peer, err);
			return;
		}
		stats.sent().add(len as u64);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn rt() -> tokio::runtime::Runtime {
		tokio::runtime::Builder::new_multi_thread()
			.enable_all()
			.build()
			.unwrap()
	}

	fn test_config(name: &str) -> ProtocolConfig {
		ProtocolConfig::new(name, "127.0.0.1:0".parse().unwrap())
	}

	#[test]
	fn echo_mode() {
		rt().block_on(async {
			let adapter = UdpRelay::new(test_config("udp-echo"));
			adapter.start().await.unwrap();
			let addr = adapter.local_addr().unwrap();

			let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
			client.send_to(b"datagram", addr).await.unwrap();
			let mut buf = [0_u8; 16];
			let (n, from) = client.recv_from(&mut buf).await.unwrap();
			assert_eq!(&buf[..n], b"datagram");
			assert_eq!(from, addr);

			adapter.stop().await.unwrap();
			assert_eq!(adapter.session_count(), 0);
		});
	}

	#[test]
	fn sessions_relay_to_target() {
		rt().block_on(async {
			// Upstream UDP echo.
			let upstream = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
			let upstream_addr = upstream.local_addr().unwrap();
			{
				let upstream = upstream.clone();
				tokio::spawn(async move {
					let mut buf = [0_u8; 1024];
					while let Ok((n, from)) = upstream.recv_from(&mut buf).await {
						let _ = upstream.send_to(&buf[..n], from).await;
					}
				});
			}

			let mut config = test_config("udp-relay");
			config.target = Some(TargetAddr::from(upstream_addr));
			let adapter = UdpRelay::new(config);
			adapter.start().await.unwrap();
			let addr = adapter.local_addr().unwrap();

			let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
			client.send_to(b"one", addr).await.unwrap();
			let mut buf = [0_u8; 16];
			let (n, _) = client.recv_from(&mut buf).await.unwrap();
			assert_eq!(&buf[..n], b"one");

			// Same key reuses the session.
			client.send_to(b"two", addr).await.unwrap();
			let (n, _) = client.recv_from(&mut buf).await.unwrap();
			assert_eq!(&buf[..n], b"two");
			assert_eq!(adapter.session_count(), 1);
			assert_eq!(adapter.snapshot().total_connections, 1);

			adapter.stop().await.unwrap();
			assert_eq!(adapter.session_count(), 0);
		});
	}
}
