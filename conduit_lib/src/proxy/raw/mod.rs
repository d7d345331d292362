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

//! Raw socket engine.
//!
//! One adapter, five modes. `server` and `client` run over plain TCP
//! and need no privileges; `bridge`, `injector` and `sniffer` open
//! raw sockets and fail fast with
//! [`AdapterError::PrivilegeRequired`] when the process may not.
//!
//! * `server` answers every chunk with itself.
//! * `client` relays accepted connections to the fixed target.
//! * `bridge` treats client bytes as whole IP packets and injects
//!   them through a raw socket.
//! * `injector` takes JSON packet descriptions, builds the packet
//!   and injects it, acknowledging with
//!   `{"status":"sent","size":N}`.
//! * `sniffer` captures packets in a background loop and pushes each
//!   one that passes every registered [`PacketFilter`] through every
//!   registered [`PacketHook`].

pub mod packet;

use self::packet::{IcmpHeader, Ipv4Header, Packet, TcpHeader, UdpHeader};
use crate::{
	prelude::*,
	protocol::{
		serve::{self, AdapterShared, StreamHandler},
		AdapterError, ConnRecord, ProtocolAdapter, ProtocolConfig, ProtocolStatus, StatsSnapshot,
	},
	utils::relay::Relay,
};
use std::{
	fmt, io,
	net::UdpSocket as StdUdpSocket,
	sync::atomic::{AtomicBool, Ordering},
	time::Duration,
};
use tokio::{net::TcpStream, task::JoinHandle, time::timeout};

const PROTOCOL_NAME: &str = "raw";
/// Poll interval of the capture loop, bounds how long `stop` waits.
const SNIFF_READ_TIMEOUT: Duration = Duration::from_millis(500);
/// Back off after a capture error instead of spinning.
const SNIFF_ERROR_PAUSE: Duration = Duration::from_millis(100);
const MAX_CAPTURE_LEN: usize = 65535;

// -------------------------------------------------------
//                          Mode
// -------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "use_serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "use_serde", serde(rename_all = "lowercase"))]
pub enum Mode {
	Server,
	Client,
	Bridge,
	Sniffer,
	Injector,
}

impl Mode {
	#[must_use]
	pub fn as_str(self) -> &'static str {
		match self {
			Mode::Server => "server",
			Mode::Client => "client",
			Mode::Bridge => "bridge",
			Mode::Sniffer => "sniffer",
			Mode::Injector => "injector",
		}
	}

	/// Whether this mode opens raw sockets.
	#[must_use]
	pub fn is_privileged(self) -> bool {
		matches!(self, Mode::Bridge | Mode::Sniffer | Mode::Injector)
	}
}

impl Default for Mode {
	fn default() -> Self {
		Mode::Server
	}
}

impl fmt::Display for Mode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, thiserror::Error)]
#[error("unknown raw socket mode '{0}'")]
pub struct UnknownMode(String);

impl FromStr for Mode {
	type Err = UnknownMode;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(match s.to_ascii_lowercase().as_str() {
			"server" => Mode::Server,
			"client" => Mode::Client,
			"bridge" => Mode::Bridge,
			"sniffer" => Mode::Sniffer,
			"injector" => Mode::Injector,
			_ => return Err(UnknownMode(s.into())),
		})
	}
}

// -------------------------------------------------------
//                       PacketHook
// -------------------------------------------------------

/// Receives every captured packet that passed the filters.
///
/// Called from a blocking capture thread, implementations must not
/// block for long.
pub trait PacketHook: Send + Sync + 'static {
	fn on_packet(&self, packet: &Packet);
}

/// Predicate over captured packets. A packet reaches the hooks only
/// when every registered filter returns `true`.
pub type PacketFilter = Box<dyn Fn(&Packet) -> bool + Send + Sync>;

/// The default hook, one log line per captured packet.
pub struct LogPackets;

impl PacketHook for LogPackets {
	fn on_packet(&self, packet: &Packet) {
		info!("captured {}", packet);
	}
}

/// Filter and hook registries shared with the capture thread.
struct Dispatch {
	filters: parking_lot::Mutex<Vec<PacketFilter>>,
	hooks: parking_lot::Mutex<Vec<Arc<dyn PacketHook>>>,
}

impl Dispatch {
	fn dispatch(&self, packet: &Packet) {
		if !self.filters.lock().iter().all(|accept| accept(packet)) {
			return;
		}
		for hook in self.hooks.lock().iter() {
			hook.on_packet(packet);
		}
	}
}

// -------------------------------------------------------
//                     RawSocketEngine
// -------------------------------------------------------

pub struct RawSocketEngine {
	mode: Mode,
	shared: Arc<AdapterShared>,
	handler: Arc<Handler>,
	serve_task: AsyncMutex<Option<JoinHandle<()>>>,
	dispatch: Arc<Dispatch>,
	sniffer_run: Arc<AtomicBool>,
	sniffer_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl RawSocketEngine {
	#[must_use]
	pub fn new(config: ProtocolConfig, mode: Mode) -> Self {
		Self::with_hook(config, mode, Arc::new(LogPackets))
	}

	#[must_use]
	pub fn with_hook(config: ProtocolConfig, mode: Mode, hook: Arc<dyn PacketHook>) -> Self {
		let shared = Arc::new(AdapterShared::new(config));
		let handler = Arc::new(Handler {
			shared: shared.clone(),
			mode,
			raw_tx: parking_lot::Mutex::new(None),
		});
		Self {
			mode,
			shared,
			handler,
			serve_task: AsyncMutex::new(None),
			dispatch: Arc::new(Dispatch {
				filters: parking_lot::Mutex::new(Vec::new()),
				hooks: parking_lot::Mutex::new(vec![hook]),
			}),
			sniffer_run: Arc::new(AtomicBool::new(false)),
			sniffer_task: AsyncMutex::new(None),
		}
	}

	#[must_use]
	pub fn mode(&self) -> Mode {
		self.mode
	}

	/// Register another hook for captured packets.
	pub fn add_hook(&self, hook: Arc<dyn PacketHook>) {
		self.dispatch.hooks.lock().push(hook);
	}

	/// Register a capture filter. Filters apply to packets captured
	/// after this call; already running captures pick it up too.
	pub fn add_filter(&self, filter: PacketFilter) {
		self.dispatch.filters.lock().push(filter);
	}

	/// The address actually bound, available in the TCP modes while
	/// running.
	#[must_use]
	pub fn local_addr(&self) -> Option<SocketAddr> {
		self.shared.local_addr()
	}

	async fn start_sniffer(&self) -> Result<(), AdapterError> {
		match self.shared.status.get() {
			ProtocolStatus::Running | ProtocolStatus::Starting => return Ok(()),
			ProtocolStatus::Stopping => {
				return Err(AdapterError::InvalidState(ProtocolStatus::Stopping))
			}
			ProtocolStatus::Stopped | ProtocolStatus::Error => {}
		}
		self.shared.status.set(ProtocolStatus::Starting);
		let socket = match open_capture_socket() {
			Ok(socket) => socket,
			Err(err) => {
				error!(
					"('{}') cannot open capture socket: {}",
					self.shared.config.name, err
				);
				self.shared.enter_error(&err);
				return Err(err);
			}
		};
		self.sniffer_run.store(true, Ordering::Release);
		let run = self.sniffer_run.clone();
		let shared = self.shared.clone();
		let dispatch = self.dispatch.clone();
		let task = tokio::task::spawn_blocking(move || sniff_loop(&socket, &shared, &dispatch, &run));
		*self.sniffer_task.lock().await = Some(task);
		self.shared.enter_running();
		info!("('{}') sniffer capturing", self.shared.config.name);
		Ok(())
	}

	async fn stop_sniffer(&self) -> Result<(), AdapterError> {
		if self.shared.status.get() == ProtocolStatus::Stopped {
			return Ok(());
		}
		self.shared.status.set(ProtocolStatus::Stopping);
		self.sniffer_run.store(false, Ordering::Release);
		if let Some(task) = self.sniffer_task.lock().await.take() {
			let _ = task.await;
		}
		self.shared.stats.mark_stopped();
		self.shared.status.set(ProtocolStatus::Stopped);
		info!("('{}') stopped", self.shared.config.name);
		Ok(())
	}
}

#[async_trait]
impl ProtocolAdapter for RawSocketEngine {
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
		match self.mode {
			Mode::Server | Mode::Client => {
				serve::start_stream_adapter(&self.shared, &self.handler, &self.serve_task).await
			}
			Mode::Bridge | Mode::Injector => {
				let raw_tx = match open_raw_sender() {
					Ok(socket) => Arc::new(socket),
					Err(err) => {
						error!(
							"('{}') cannot open raw sender: {}",
							self.shared.config.name, err
						);
						self.shared.enter_error(&err);
						return Err(err);
					}
				};
				*self.handler.raw_tx.lock() = Some(raw_tx);
				serve::start_stream_adapter(&self.shared, &self.handler, &self.serve_task).await
			}
			Mode::Sniffer => self.start_sniffer().await,
		}
	}

	async fn stop(&self) -> Result<(), AdapterError> {
		if self.mode == Mode::Sniffer {
			return self.stop_sniffer().await;
		}
		let result = serve::stop_stream_adapter(&self.shared, &self.serve_task).await;
		*self.handler.raw_tx.lock() = None;
		result
	}
}

// -------------------------------------------------------
//                        Handler
// -------------------------------------------------------

struct Handler {
	shared: Arc<AdapterShared>,
	mode: Mode,
	raw_tx: parking_lot::Mutex<Option<Arc<StdUdpSocket>>>,
}

#[async_trait]
impl StreamHandler for Handler {
	async fn handle_conn(
		self: Arc<Self>,
		stream: TcpStream,
		record: Arc<ConnRecord>,
	) -> Result<(), AdapterError> {
		match self.mode {
			Mode::Server => self.serve_echo(stream, &record).await,
			Mode::Client => self.serve_relay(stream, &record).await,
			Mode::Bridge => self.serve_bridge(stream, &record).await,
			Mode::Injector => self.serve_injector(stream, &record).await,
			// No listener exists in sniffer mode.
			Mode::Sniffer => Err(AdapterError::Unsupported("connections in sniffer mode")),
		}
	}
}

impl Handler {
	fn raw_tx(&self) -> Result<Arc<StdUdpSocket>, AdapterError> {
		self.raw_tx.lock().clone().ok_or(AdapterError::NotRunning)
	}

	async fn serve_echo(&self, mut stream: TcpStream, record: &ConnRecord) -> Result<(), AdapterError> {
		let mut buf = vec![0_u8; self.shared.config.buffer_size];
		loop {
			let n = stream.read(&mut buf).await?;
			if n == 0 {
				return Ok(());
			}
			record.touch();
			record.recv.add(n as u64);
			self.shared.stats.received().add(n as u64);
			stream.write_all(&buf[..n]).await?;
			record.send.add(n as u64);
			self.shared.stats.sent().add(n as u64);
		}
	}

	async fn serve_relay(&self, stream: TcpStream, record: &ConnRecord) -> Result<(), AdapterError> {
		let config = &self.shared.config;
		let target = config.target.as_ref().ok_or_else(|| {
			AdapterError::new_protocol("client mode needs a target address")
		})?;
		let target_stream = timeout(config.timeout(), target.dial())
			.await
			.map_err(|_| AdapterError::Io(io::ErrorKind::TimedOut.into()))??;
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
	}

	/// Every chunk must be one whole IP packet; malformed packets are
	/// dropped with a warning, the connection stays up.
	async fn serve_bridge(&self, mut stream: TcpStream, record: &ConnRecord) -> Result<(), AdapterError> {
		let raw_tx = self.raw_tx()?;
		let mut buf = vec![0_u8; MAX_CAPTURE_LEN];
		loop {
			let n = stream.read(&mut buf).await?;
			if n == 0 {
				return Ok(());
			}
			record.touch();
			record.recv.add(n as u64);
			self.shared.stats.received().add(n as u64);
			let packet = match Packet::parse(&buf[..n]) {
				Ok(packet) => packet,
				Err(err) => {
					warn!("[{:x}] dropping unparsable packet: {}", record.id, err);
					self.shared.stats.record_error(&err);
					continue;
				}
			};
			let dst = packet.ip.dst();
			let sent = inject(&raw_tx, buf[..n].to_vec(), dst).await?;
			debug!("[{:x}] injected {} ({} bytes)", record.id, packet, sent);
			self.shared.stats.sent().add(sent as u64);
		}
	}

	async fn serve_injector(
		&self,
		mut stream: TcpStream,
		record: &ConnRecord,
	) -> Result<(), AdapterError> {
		let raw_tx = self.raw_tx()?;
		let mut buf = vec![0_u8; self.shared.config.buffer_size];
		loop {
			let n = stream.read(&mut buf).await?;
			if n == 0 {
				return Ok(());
			}
			record.touch();
			record.recv.add(n as u64);
			self.shared.stats.received().add(n as u64);
			let reply = match parse_inject_request(&buf[..n]) {
				Ok((packet, dst)) => {
					let sent = inject(&raw_tx, packet, dst).await?;
					self.shared.stats.sent().add(sent as u64);
					serde_json::json!({ "status": "sent", "size": sent })
				}
				Err(err) => {
					debug!("[{:x}] bad inject request: {}", record.id, err);
					self.shared.stats.record_error(&err);
					serde_json::json!({ "status": "error", "message": err.to_string() })
				}
			};
			let reply = reply.to_string();
			stream.write_all(reply.as_bytes()).await?;
			record.send.add(reply.len() as u64);
		}
	}
}

// -------------------------------------------------------
//                    Packet building
// -------------------------------------------------------

/// Parse one JSON inject request into raw packet bytes plus the
/// destination to hand the kernel.
///
/// Fields: `dst_ip` (required), `src_ip`, `protocol`
/// (`tcp`/`udp`/`icmp`, default `tcp`), `src_port`, `dst_port`,
/// `payload`, and for TCP `seq`, `ack` and `flags` (default SYN).
///
/// # Errors
/// Returns an error on invalid JSON or missing/malformed fields.
pub fn parse_inject_request(data: &[u8]) -> Result<(Vec<u8>, IpAddr), BoxStdErr> {
	let desc: serde_json::Value = serde_json::from_slice(data)?;
	build_packet(&desc)
}

fn build_packet(desc: &serde_json::Value) -> Result<(Vec<u8>, IpAddr), BoxStdErr> {
	let dst_ip: Ipv4Addr = desc
		.get("dst_ip")
		.and_then(serde_json::Value::as_str)
		.ok_or("missing 'dst_ip'")?
		.parse()
		.map_err(|_| "'dst_ip' is not an IPv4 address")?;
	let src_ip: Ipv4Addr = match desc.get("src_ip").and_then(serde_json::Value::as_str) {
		Some(s) => s.parse().map_err(|_| "'src_ip' is not an IPv4 address")?,
		None => Ipv4Addr::UNSPECIFIED,
	};
	let payload = desc
		.get("payload")
		.and_then(serde_json::Value::as_str)
		.unwrap_or("")
		.as_bytes()
		.to_vec();
	let payload_len =
		u16::try_from(payload.len()).map_err(|_| "'payload' does not fit one packet")?;
	let protocol = desc
		.get("protocol")
		.and_then(serde_json::Value::as_str)
		.unwrap_or("tcp");

	let mut transport = Vec::new();
	let proto_num = match protocol {
		"tcp" => {
			let mut header = TcpHeader::new(field_u16(desc, "src_port")?, field_u16(desc, "dst_port")?);
			header.seq = field_u32(desc, "seq")?;
			header.ack = field_u32(desc, "ack")?;
			header.flags = match desc.get("flags").and_then(serde_json::Value::as_u64) {
				Some(v) => u16::try_from(v).map_err(|_| "'flags' out of range")?,
				None => packet::TCP_SYN,
			};
			header.write_to(&mut transport);
			packet::IPPROTO_TCP
		}
		"udp" => {
			UdpHeader::new(
				field_u16(desc, "src_port")?,
				field_u16(desc, "dst_port")?,
				payload_len,
			)
			.write_to(&mut transport);
			packet::IPPROTO_UDP
		}
		"icmp" => {
			let icmp_type = desc
				.get("type")
				.and_then(serde_json::Value::as_u64)
				.unwrap_or(8);
			let mut header = IcmpHeader::new(
				u8::try_from(icmp_type).map_err(|_| "'type' out of range")?,
				0,
			);
			header.identifier = field_u16(desc, "identifier")?;
			header.sequence = field_u16(desc, "sequence")?;
			header.write_to(&payload, &mut transport);
			packet::IPPROTO_ICMP
		}
		other => return Err(format!("unknown protocol '{}'", other).into()),
	};

	let total_payload = u16::try_from(transport.len() + payload.len())
		.map_err(|_| "packet does not fit one datagram")?;
	let mut raw = Vec::with_capacity(20 + transport.len() + payload.len());
	Ipv4Header::new(src_ip, dst_ip, proto_num, total_payload).write_to(&mut raw);
	raw.extend_from_slice(&transport);
	raw.extend_from_slice(&payload);
	Ok((raw, IpAddr::V4(dst_ip)))
}

fn field_u16(desc: &serde_json::Value, key: &'static str) -> Result<u16, BoxStdErr> {
	match desc.get(key).and_then(serde_json::Value::as_u64) {
		Some(v) => u16::try_from(v).map_err(|_| format!("'{}' out of range", key).into()),
		None => Ok(0),
	}
}

fn field_u32(desc: &serde_json::Value, key: &'static str) -> Result<u32, BoxStdErr> {
	match desc.get(key).and_then(serde_json::Value::as_u64) {
		Some(v) => u32::try_from(v).map_err(|_| format!("'{}' out of range", key).into()),
		None => Ok(0),
	}
}

// -------------------------------------------------------
//                    Raw socket plumbing
// -------------------------------------------------------

async fn inject(socket: &Arc<StdUdpSocket>, packet: Vec<u8>, dst: IpAddr) -> io::Result<usize> {
	let socket = socket.clone();
	tokio::task::spawn_blocking(move || socket.send_to(&packet, (dst, 0)))
		.await
		.map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

fn sniff_loop(socket: &StdUdpSocket, shared: &AdapterShared, dispatch: &Dispatch, run: &AtomicBool) {
	let mut buf = vec![0_u8; MAX_CAPTURE_LEN];
	while run.load(Ordering::Acquire) {
		match socket.recv_from(&mut buf) {
			Ok((n, _)) => {
				shared.stats.received().add(n as u64);
				match Packet::parse(&buf[..n]) {
					Ok(packet) => dispatch.dispatch(&packet),
					Err(err) => trace!("ignoring unparsable capture: {}", err),
				}
			}
			Err(err)
				if err.kind() == io::ErrorKind::WouldBlock
					|| err.kind() == io::ErrorKind::TimedOut => {}
			Err(err) => {
				warn!("('{}') capture error: {}", shared.config.name, err);
				shared.stats.record_error(&err);
				std::thread::sleep(SNIFF_ERROR_PAUSE);
			}
		}
	}
}

#[cfg(unix)]
fn check_privileges() -> Result<(), AdapterError> {
	use socket2::{Domain, Protocol, Socket, Type};
	match Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)) {
		Ok(_) => Ok(()),
		Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
			Err(AdapterError::PrivilegeRequired(err.into()))
		}
		Err(err) => Err(err.into()),
	}
}

/// A raw IPv4 socket for sending packets with the header included.
#[cfg(unix)]
fn open_raw_sender() -> Result<StdUdpSocket, AdapterError> {
	use socket2::{Domain, Protocol, Socket, Type};
	const IPPROTO_RAW: i32 = 255;

	check_privileges()?;
	let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::from(IPPROTO_RAW)))?;
	socket.set_header_included(true)?;
	Ok(socket.into())
}

/// A raw IPv4 socket capturing TCP traffic, with a read timeout so
/// the capture loop can notice the stop flag.
#[cfg(unix)]
fn open_capture_socket() -> Result<StdUdpSocket, AdapterError> {
	use socket2::{Domain, Protocol, Socket, Type};

	check_privileges()?;
	let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::TCP))?;
	socket.set_read_timeout(Some(SNIFF_READ_TIMEOUT))?;
	Ok(socket.into())
}

#[cfg(not(unix))]
fn open_raw_sender() -> Result<StdUdpSocket, AdapterError> {
	Err(AdapterError::Unsupported("raw sockets on this platform"))
}

#[cfg(not(unix))]
fn open_capture_socket() -> Result<StdUdpSocket, AdapterError> {
	Err(AdapterError::Unsupported("raw sockets on this platform"))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::protocol::TargetAddr;
	use packet::Transport;
	use tokio::net::TcpListener;

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
	fn mode_from_str() {
		assert_eq!("server".parse::<Mode>().unwrap(), Mode::Server);
		assert_eq!("Injector".parse::<Mode>().unwrap(), Mode::Injector);
		assert_eq!("SNIFFER".parse::<Mode>().unwrap(), Mode::Sniffer);
		assert!("tunnel".parse::<Mode>().is_err());
		assert!(Mode::Bridge.is_privileged());
		assert!(!Mode::Client.is_privileged());
	}

	#[test]
	fn server_mode_echoes() {
		rt().block_on(async {
			let engine = RawSocketEngine::new(test_config("raw-server"), Mode::Server);
			engine.start().await.unwrap();
			assert_eq!(engine.status(), ProtocolStatus::Running);

			let addr = engine.local_addr().unwrap();
			let mut client = TcpStream::connect(addr).await.unwrap();
			client.write_all(b"packet?").await.unwrap();
			let mut buf = [0_u8; 7];
			client.read_exact(&mut buf).await.unwrap();
			assert_eq!(&buf, b"packet?");

			engine.stop().await.unwrap();
			assert_eq!(engine.status(), ProtocolStatus::Stopped);
		});
	}

	#[test]
	fn client_mode_relays_to_target() {
		rt().block_on(async {
			let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
			let upstream_addr = upstream.local_addr().unwrap();
			tokio::spawn(async move {
				let (mut s, _) = upstream.accept().await.unwrap();
				let mut buf = [0_u8; 4];
				s.read_exact(&mut buf).await.unwrap();
				s.write_all(&buf).await.unwrap();
			});

			let mut config = test_config("raw-client");
			config.target = Some(TargetAddr::from(upstream_addr));
			let engine = RawSocketEngine::new(config, Mode::Client);
			engine.start().await.unwrap();

			let mut client = TcpStream::connect(engine.local_addr().unwrap())
				.await
				.unwrap();
			client.write_all(b"ping").await.unwrap();
			let mut buf = [0_u8; 4];
			client.read_exact(&mut buf).await.unwrap();
			assert_eq!(&buf, b"ping");

			engine.stop().await.unwrap();
		});
	}

	#[test]
	fn inject_request_builds_tcp_packet() {
		let request = serde_json::json!({
			"protocol": "tcp",
			"src_ip": "10.0.0.1",
			"dst_ip": "10.0.0.2",
			"src_port": 4000,
			"dst_port": 80,
			"seq": 7,
			"payload": "GET"
		});
		let (raw, dst) = parse_inject_request(request.to_string().as_bytes()).unwrap();
		assert_eq!(dst, "10.0.0.2".parse::<IpAddr>().unwrap());

		let parsed = Packet::parse(&raw).unwrap();
		assert_eq!(parsed.ip.src(), "10.0.0.1".parse::<IpAddr>().unwrap());
		match &parsed.transport {
			Transport::Tcp(t) => {
				assert_eq!(t.src_port, 4000);
				assert_eq!(t.dst_port, 80);
				assert_eq!(t.seq, 7);
				// SYN is the default when no flags are given.
				assert_eq!(t.flags, packet::TCP_SYN);
			}
			other => panic!("wrong transport: {:?}", other),
		}
		assert_eq!(parsed.payload, b"GET");
	}

	#[test]
	fn inject_request_builds_icmp_echo() {
		let request = serde_json::json!({
			"protocol": "icmp",
			"dst_ip": "8.8.8.8",
			"identifier": 42,
			"sequence": 1,
			"payload": "ping"
		});
		let (raw, _) = parse_inject_request(request.to_string().as_bytes()).unwrap();
		let parsed = Packet::parse(&raw).unwrap();
		match &parsed.transport {
			Transport::Icmp(i) => {
				assert_eq!(i.icmp_type, 8);
				assert_eq!(i.identifier, 42);
				assert_eq!(i.sequence, 1);
			}
			other => panic!("wrong transport: {:?}", other),
		}
		assert_eq!(parsed.payload, b"ping");
	}

	#[test]
	fn filters_gate_registered_hooks() {
		use std::sync::atomic::AtomicUsize;

		struct CountPackets(Arc<AtomicUsize>);
		impl PacketHook for CountPackets {
			fn on_packet(&self, _packet: &Packet) {
				self.0.fetch_add(1, Ordering::SeqCst);
			}
		}

		let seen = Arc::new(AtomicUsize::new(0));
		let engine = RawSocketEngine::new(test_config("raw-sniff"), Mode::Sniffer);
		engine.add_hook(Arc::new(CountPackets(seen.clone())));
		engine.add_filter(Box::new(|packet| {
			matches!(packet.transport, Transport::Tcp(_))
		}));

		let tcp = serde_json::json!({ "protocol": "tcp", "dst_ip": "1.1.1.1", "dst_port": 80 });
		let udp = serde_json::json!({ "protocol": "udp", "dst_ip": "1.1.1.1", "dst_port": 53 });
		for desc in [tcp, udp] {
			let (raw, _) = parse_inject_request(desc.to_string().as_bytes()).unwrap();
			engine.dispatch.dispatch(&Packet::parse(&raw).unwrap());
		}

		// The UDP packet was filtered out before reaching the hooks.
		assert_eq!(seen.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn inject_request_rejects_garbage() {
		assert!(parse_inject_request(b"not json").is_err());
		// dst_ip is mandatory.
		let request = serde_json::json!({ "protocol": "udp", "dst_port": 53 });
		assert!(parse_inject_request(request.to_string().as_bytes()).is_err());
		let request = serde_json::json!({ "protocol": "gre", "dst_ip": "1.1.1.1" });
		assert!(parse_inject_request(request.to_string().as_bytes()).is_err());
	}
}
