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

//! WebSocket endpoint and tunnel.
//!
//! Accepts the RFC 6455 server handshake, then either answers
//! messages locally through a [`MessageHandler`] (echo by default)
//! or, with a target configured, performs a client handshake towards
//! it and re-frames traffic in both directions.
//!
//! Idle clients are pinged every 30 seconds and dropped when no
//! frame arrives within 10 seconds of a ping. On adapter stop every
//! open connection gets a `1001 Going Away` close frame before the
//! transport is torn down.

mod frame;

pub use frame::{Frame, FrameError, OpCode};

use crate::{
	prelude::*,
	protocol::{
		serve::{self, AdapterShared, StreamHandler},
		AdapterError, ConnRecord, ProtocolAdapter, ProtocolConfig, ProtocolStatus, StatsSnapshot,
	},
	utils::{read_until, ReadError},
};
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use std::{io, time::Duration, time::Instant};
use tokio::{
	io::{AsyncBufRead, BufReader},
	net::TcpStream,
	sync::watch,
	task::JoinHandle,
	time::timeout,
};

const PROTOCOL_NAME: &str = "websocket";
const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const PING_INTERVAL: Duration = Duration::from_secs(30);
const PING_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_GOING_AWAY: u16 = 1001;
const MAX_HEADER_SIZE: usize = 16 * 1024;
const MAX_HEADERS_NUM: usize = 64;
/// Grace period for close frames to reach clients during stop.
const STOP_GRACE: Duration = Duration::from_millis(200);

/// Message processing for endpoint mode.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
	/// Returns the payload to answer with, sent back with the same
	/// opcode. `None` answers nothing.
	async fn on_message(
		&self,
		record: &ConnRecord,
		opcode: OpCode,
		payload: &[u8],
	) -> Result<Option<Vec<u8>>, BoxStdErr>;
}

/// The default handler, answers every message with itself.
pub struct EchoMessages;

#[async_trait]
impl MessageHandler for EchoMessages {
	async fn on_message(
		&self,
		_record: &ConnRecord,
		_opcode: OpCode,
		payload: &[u8],
	) -> Result<Option<Vec<u8>>, BoxStdErr> {
		Ok(Some(payload.to_vec()))
	}
}

pub struct WebSocketProxy {
	shared: Arc<AdapterShared>,
	handler: Arc<Handler>,
	serve_task: AsyncMutex<Option<JoinHandle<()>>>,
	shutdown: watch::Sender<bool>,
}

impl WebSocketProxy {
	#[must_use]
	pub fn new(config: ProtocolConfig) -> Self {
		Self::with_handler(config, Box::new(EchoMessages))
	}

	#[must_use]
	pub fn with_handler(config: ProtocolConfig, hook: Box<dyn MessageHandler>) -> Self {
		let (shutdown, shutdown_rx) = watch::channel(false);
		let shared = Arc::new(AdapterShared::new(config));
		let handler = Arc::new(Handler {
			shared: shared.clone(),
			hook,
			shutdown_rx,
			subprotocols: Mutex::new(Vec::new()),
		});
		Self {
			shared,
			handler,
			serve_task: AsyncMutex::new(None),
			shutdown,
		}
	}

	/// Sub-protocols this endpoint is willing to speak. The first one
	/// the client also offers is selected and echoed in the `101`
	/// response.
	pub fn set_subprotocols(&self, protocols: Vec<String>) {
		*self.handler.subprotocols.lock() = protocols;
	}

	#[must_use]
	pub fn local_addr(&self) -> Option<SocketAddr> {
		self.shared.local_addr()
	}
}

#[async_trait]
impl ProtocolAdapter for WebSocketProxy {
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
		let _ = self.shutdown.send(false);
		serve::start_stream_adapter(&self.shared, &self.handler, &self.serve_task).await
	}

	async fn stop(&self) -> Result<(), AdapterError> {
		if self.shared.status.get() != ProtocolStatus::Stopped {
			// Say goodbye before the tasks are cancelled.
			let _ = self.shutdown.send(true);
			tokio::time::sleep(STOP_GRACE).await;
		}
		serve::stop_stream_adapter(&self.shared, &self.serve_task).await
	}
}

struct Handler {
	shared: Arc<AdapterShared>,
	hook: Box<dyn MessageHandler>,
	shutdown_rx: watch::Receiver<bool>,
	subprotocols: Mutex<Vec<String>>,
}

#[async_trait]
impl StreamHandler for Handler {
	async fn handle_conn(
		self: Arc<Self>,
		stream: TcpStream,
		record: Arc<ConnRecord>,
	) -> Result<(), AdapterError> {
		let config = &self.shared.config;
		let (r, mut w) = stream.into_split();
		let mut r = BufReader::with_capacity(config.buffer_size, r);

		let request = match read_handshake(&mut r).await {
			Ok(res) => res,
			Err(HandshakeFail::Io(e)) => return Err(e.into()),
			Err(HandshakeFail::BadVersion) => {
				w.write_all(
					b"HTTP/1.1 426 Upgrade Required\r\n\
					sec-websocket-version: 13\r\n\
					content-length: 0\r\n\r\n",
				)
				.await?;
				return Err(AdapterError::new_protocol("unsupported websocket version"));
			}
			Err(HandshakeFail::BadRequest(e)) => {
				w.write_all(b"HTTP/1.1 400 Bad Request\r\ncontent-length: 0\r\n\r\n")
					.await?;
				return Err(AdapterError::new_protocol(e));
			}
		};
		let accept = accept_key(&request.key);
		let protocol = {
			let supported = self.subprotocols.lock();
			request
				.protocols
				.iter()
				.find(|p| supported.iter().any(|s| s == *p))
				.cloned()
		};
		// Frame bytes may already sit behind the request head.
		let r = tokio::io::AsyncReadExt::chain(std::io::Cursor::new(request.leftover), r);

		if let Some(target) = config.target.clone() {
			self.serve_tunnel(r, w, &accept, protocol.as_deref(), &target, &record)
				.await
		} else {
			w.write_all(switch_response(&accept, protocol.as_deref()).as_bytes())
				.await?;
			w.flush().await?;
			debug!("[{:x}] websocket established (endpoint mode)", record.id);
			self.serve_endpoint(r, w, &record).await
		}
	}
}

impl Handler {
	async fn serve_endpoint<R, W>(
		&self,
		mut r: R,
		w: W,
		record: &ConnRecord,
	) -> Result<(), AdapterError>
	where
		R: AsyncRead + Unpin + Send,
		W: AsyncWrite + Unpin + Send,
	{
		let w = AsyncMutex::new(w);
		let last_frame = Mutex::new(Instant::now());
		let mut shutdown = self.shutdown_rx.clone();

		let reader = async {
			loop {
				let frame = match Frame::read(&mut r).await {
					Ok(frame) => frame,
					Err(FrameError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
						return Ok(());
					}
					Err(FrameError::Io(e)) => return Err(AdapterError::Io(e)),
					Err(e) => return Err(AdapterError::new_protocol(e)),
				};
				*last_frame.lock() = Instant::now();
				record.touch();
				record.recv.add(frame.payload.len() as u64);
				self.shared.stats.received().add(frame.payload.len() as u64);
				match frame.opcode {
					OpCode::Ping => {
						Frame::new(OpCode::Pong, frame.payload)
							.write(&mut *w.lock().await, false)
							.await?;
					}
					OpCode::Pong | OpCode::Continuation => {}
					OpCode::Close => {
						let _ = frame.write(&mut *w.lock().await, false).await;
						return Ok(());
					}
					OpCode::Text | OpCode::Binary => {
						let reply = self
							.hook
							.on_message(record, frame.opcode, &frame.payload)
							.await
							.map_err(AdapterError::Protocol)?;
						if let Some(reply) = reply {
							let len = reply.len() as u64;
							Frame::new(frame.opcode, reply)
								.write(&mut *w.lock().await, false)
								.await?;
							record.send.add(len);
							self.shared.stats.sent().add(len);
						}
					}
				}
			}
		};

		let keepalive = async {
			loop {
				tokio::time::sleep(PING_INTERVAL).await;
				Frame::new(OpCode::Ping, Vec::new())
					.write(&mut *w.lock().await, false)
					.await?;
				tokio::time::sleep(PING_TIMEOUT).await;
				if last_frame.lock().elapsed() >= PING_TIMEOUT {
					debug!("[{:x}] no pong, dropping client", record.id);
					return Err::<(), AdapterError>(AdapterError::Io(
						io::ErrorKind::TimedOut.into(),
					));
				}
			}
		};

		tokio::select! {
			res = reader => res,
			res = keepalive => res,
			_ = wait_shutdown(&mut shutdown) => {
				let _ = Frame::close(CLOSE_GOING_AWAY, "Going Away")
					.write(&mut *w.lock().await, false)
					.await;
				Ok(())
			}
		}
	}

	async fn serve_tunnel<R, W>(
		&self,
		client_r: R,
		mut client_w: W,
		accept: &str,
		protocol: Option<&str>,
		target: &TargetAddr,
		record: &ConnRecord,
	) -> Result<(), AdapterError>
	where
		R: AsyncRead + Unpin + Send,
		W: AsyncWrite + Unpin + Send,
	{
		let config = &self.shared.config;
		let target_stream = match timeout(config.timeout(), target.dial()).await {
			Ok(Ok(s)) => s,
			Ok(Err(e)) => {
				warn!("[{:x}] cannot reach {}: {}", record.id, target, e);
				client_w
					.write_all(b"HTTP/1.1 502 Bad Gateway\r\ncontent-length: 0\r\n\r\n")
					.await?;
				return Err(e.into());
			}
			Err(_) => {
				client_w
					.write_all(b"HTTP/1.1 504 Gateway Timeout\r\ncontent-length: 0\r\n\r\n")
					.await?;
				return Err(AdapterError::Io(io::ErrorKind::TimedOut.into()));
			}
		};
		let (target_r, mut target_w) = target_stream.into_split();
		let mut target_r = BufReader::with_capacity(config.buffer_size, target_r);

		// Client handshake towards the target with a fresh key.
		let target_leftover = match client_handshake(&mut target_r, &mut target_w, target, protocol)
			.await
		{
			Ok(leftover) => leftover,
			Err(e) => {
				warn!("[{:x}] target handshake failed: {}", record.id, e);
				client_w
					.write_all(b"HTTP/1.1 502 Bad Gateway\r\ncontent-length: 0\r\n\r\n")
					.await?;
				return Err(AdapterError::new_protocol(e));
			}
		};
		client_w
			.write_all(switch_response(accept, protocol).as_bytes())
			.await?;
		client_w.flush().await?;
		debug!("[{:x}] websocket tunnel to {} established", record.id, target);

		let mut client_r = client_r;
		let mut target_r =
			tokio::io::AsyncReadExt::chain(std::io::Cursor::new(target_leftover), target_r);
		let client_w = AsyncMutex::new(client_w);
		let target_w = AsyncMutex::new(target_w);
		let mut shutdown = self.shutdown_rx.clone();

		let up = async {
			loop {
				let frame = read_or_eof(&mut client_r).await?;
				let frame = match frame {
					Some(frame) => frame,
					None => return Ok(()),
				};
				record.touch();
				record.recv.add(frame.payload.len() as u64);
				self.shared.stats.received().add(frame.payload.len() as u64);
				match frame.opcode {
					OpCode::Ping => {
						Frame::new(OpCode::Pong, frame.payload)
							.write(&mut *client_w.lock().await, false)
							.await?;
					}
					OpCode::Close => {
						let _ = frame.write(&mut *target_w.lock().await, true).await;
						let _ = frame.write(&mut *client_w.lock().await, false).await;
						return Ok(());
					}
					// Frames towards a server must be masked again.
					_ => frame.write(&mut *target_w.lock().await, true).await?,
				}
			}
		};
		let down = async {
			loop {
				let frame = read_or_eof(&mut target_r).await?;
				let frame = match frame {
					Some(frame) => frame,
					None => return Ok(()),
				};
				record.send.add(frame.payload.len() as u64);
				self.shared.stats.sent().add(frame.payload.len() as u64);
				match frame.opcode {
					OpCode::Ping => {
						Frame::new(OpCode::Pong, frame.payload)
							.write(&mut *target_w.lock().await, true)
							.await?;
					}
					OpCode::Close => {
						let _ = frame.write(&mut *client_w.lock().await, false).await;
						return Ok(());
					}
					_ => frame.write(&mut *client_w.lock().await, false).await?,
				}
			}
		};

		tokio::select! {
			res = up => res,
			res = down => res,
			_ = wait_shutdown(&mut shutdown) => {
				let close = Frame::close(CLOSE_GOING_AWAY, "Going Away");
				let _ = close.write(&mut *client_w.lock().await, false).await;
				let _ = close.write(&mut *target_w.lock().await, true).await;
				Ok(())
			}
		}
	}
}

async fn read_or_eof<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Frame>, AdapterError> {
	match Frame::read(r).await {
		Ok(frame) => Ok(Some(frame)),
		Err(FrameError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
		Err(FrameError::Io(e)) => Err(AdapterError::Io(e)),
		Err(e) => Err(AdapterError::new_protocol(e)),
	}
}

async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
	loop {
		if *rx.borrow() {
			return;
		}
		if rx.changed().await.is_err() {
			// Sender gone, the adapter is being dropped.
			return;
		}
	}
}

enum HandshakeFail {
	Io(io::Error),
	BadVersion,
	BadRequest(BoxStdErr),
}

/// A validated client upgrade request.
struct UpgradeRequest {
	key: String,
	/// Sub-protocols offered by the client, in request order.
	protocols: Vec<String>,
	/// Bytes read past the request head.
	leftover: Vec<u8>,
}

/// Read and validate the client's upgrade request.
async fn read_handshake<R>(r: &mut R) -> Result<UpgradeRequest, HandshakeFail>
where
	R: AsyncBufRead + Unpin,
{
	let mut buf = Vec::new();
	let leftover = match read_until(r, CRLF_2, &mut buf, MAX_HEADER_SIZE).await {
		Ok(end) => buf.split_off(end),
		Err(ReadError::Io(e)) => return Err(HandshakeFail::Io(e)),
		Err(e @ (ReadError::Eof | ReadError::TooLarge(_))) => {
			return Err(HandshakeFail::BadRequest(e.into()))
		}
	};
	let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS_NUM];
	let mut parsed = httparse::Request::new(&mut headers);
	match parsed.parse(&buf) {
		Ok(httparse::Status::Complete(_)) => {}
		Ok(httparse::Status::Partial) => {
			return Err(HandshakeFail::BadRequest("partial request head".into()))
		}
		Err(e) => return Err(HandshakeFail::BadRequest(e.into())),
	}

	let header = |name: &str| {
		parsed
			.headers
			.iter()
			.find(|h| h.name.eq_ignore_ascii_case(name))
			.and_then(|h| std::str::from_utf8(h.value).ok())
	};
	let upgrade_ok = header("upgrade")
		.map_or(false, |v| v.to_ascii_lowercase().contains("websocket"));
	if !upgrade_ok {
		return Err(HandshakeFail::BadRequest(
			"missing websocket upgrade header".into(),
		));
	}
	match header("sec-websocket-version") {
		Some("13") => {}
		_ => return Err(HandshakeFail::BadVersion),
	}
	let key = header("sec-websocket-key")
		.map(str::to_string)
		.ok_or_else(|| HandshakeFail::BadRequest("missing sec-websocket-key".into()))?;
	let protocols = header("sec-websocket-protocol")
		.map(|v| {
			v.split(',')
				.map(|p| p.trim().to_string())
				.filter(|p| !p.is_empty())
				.collect()
		})
		.unwrap_or_default();
	Ok(UpgradeRequest {
		key,
		protocols,
		leftover,
	})
}

/// `base64(sha1(key + GUID))`, the server's proof of a real
/// websocket handshake.
#[must_use]
pub fn accept_key(key: &str) -> String {
	let mut hasher = Sha1::new();
	hasher.update(key.as_bytes());
	hasher.update(GUID.as_bytes());
	base64::encode(hasher.finalize())
}

fn switch_response(accept: &str, protocol: Option<&str>) -> String {
	let mut response = format!(
		"HTTP/1.1 101 Switching Protocols\r\n\
		upgrade: websocket\r\n\
		connection: Upgrade\r\n\
		sec-websocket-accept: {}\r\n",
		accept
	);
	if let Some(protocol) = protocol {
		response.push_str(&format!("sec-websocket-protocol: {}\r\n", protocol));
	}
	response.push_str("\r\n");
	response
}

/// Perform the client side handshake over an already connected
/// stream, returning any bytes read past the response head.
async fn client_handshake<R, W>(
	r: &mut R,
	w: &mut W,
	target: &TargetAddr,
	protocol: Option<&str>,
) -> Result<Vec<u8>, BoxStdErr>
where
	R: AsyncBufRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let mut key_bytes = [0_u8; 16];
	rand::thread_rng().fill(&mut key_bytes);
	let key = base64::encode(key_bytes);
	let expected = accept_key(&key);

	let mut request = format!(
		"GET / HTTP/1.1\r\n\
		host: {}\r\n\
		upgrade: websocket\r\n\
		connection: Upgrade\r\n\
		sec-websocket-key: {}\r\n\
		sec-websocket-version: 13\r\n",
		target, key
	);
	if let Some(protocol) = protocol {
		request.push_str(&format!("sec-websocket-protocol: {}\r\n", protocol));
	}
	request.push_str("\r\n");
	w.write_all(request.as_bytes()).await?;
	w.flush().await?;

	let mut buf = Vec::new();
	let end = read_until(r, CRLF_2, &mut buf, MAX_HEADER_SIZE).await?;
	let leftover = buf.split_off(end);
	let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS_NUM];
	let mut parsed = httparse::Response::new(&mut headers);
	match parsed.parse(&buf) {
		Ok(httparse::Status::Complete(_)) => {}
		_ => return Err("cannot parse handshake response".into()),
	}
	if parsed.code != Some(101) {
		return Err(format!("target answered {:?} instead of 101", parsed.code).into());
	}
	let accept = parsed
		.headers
		.iter()
		.find(|h| h.name.eq_ignore_ascii_case("sec-websocket-accept"))
		.and_then(|h| std::str::from_utf8(h.value).ok())
		.unwrap_or("");
	if accept != expected {
		return Err("target sent a wrong sec-websocket-accept".into());
	}
	Ok(leftover)
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Cursor;
	use tokio::io::AsyncReadExt;

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
	fn accept_key_matches_rfc_sample() {
		assert_eq!(
			accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
			"s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
		);
	}

	async fn upgrade(client: &mut TcpStream, host: SocketAddr) -> String {
		client
			.write_all(
				format!(
					"GET / HTTP/1.1\r\nhost: {}\r\nupgrade: websocket\r\n\
					connection: Upgrade\r\nsec-websocket-key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
					sec-websocket-version: 13\r\n\r\n",
					host
				)
				.as_bytes(),
			)
			.await
			.unwrap();
		let mut head = Vec::new();
		let mut byte = [0_u8; 1];
		while crate::utils::find_pat_end(&head, CRLF_2).is_none() {
			client.read_exact(&mut byte).await.unwrap();
			head.push(byte[0]);
		}
		String::from_utf8(head).unwrap()
	}

	#[test]
	fn endpoint_echoes_messages() {
		rt().block_on(async {
			let adapter = WebSocketProxy::new(test_config("ws-echo"));
			adapter.start().await.unwrap();
			let addr = adapter.local_addr().unwrap();

			let mut client = TcpStream::connect(addr).await.unwrap();
			let head = upgrade(&mut client, addr).await;
			assert!(head.starts_with("HTTP/1.1 101"));
			assert!(head.contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

			// Client frames must be masked.
			let mut buf = Vec::new();
			Frame::new(OpCode::Text, b"hello ws".to_vec()).write_to(&mut buf, true);
			client.write_all(&buf).await.unwrap();

			let reply = Frame::read(&mut client).await.unwrap();
			assert_eq!(reply.opcode, OpCode::Text);
			assert_eq!(reply.payload, b"hello ws");

			// Ping gets an inline pong with the same payload.
			let mut buf = Vec::new();
			Frame::new(OpCode::Ping, b"beat".to_vec()).write_to(&mut buf, true);
			client.write_all(&buf).await.unwrap();
			let pong = Frame::read(&mut client).await.unwrap();
			assert_eq!(pong.opcode, OpCode::Pong);
			assert_eq!(pong.payload, b"beat");

			adapter.stop().await.unwrap();
		});
	}

	#[test]
	fn wrong_version_gets_426() {
		rt().block_on(async {
			let adapter = WebSocketProxy::new(test_config("ws-version"));
			adapter.start().await.unwrap();
			let addr = adapter.local_addr().unwrap();

			let mut client = TcpStream::connect(addr).await.unwrap();
			client
				.write_all(
					b"GET / HTTP/1.1\r\nhost: x\r\nupgrade: websocket\r\n\
					connection: Upgrade\r\nsec-websocket-key: AQIDBAUGBwgJCgsMDQ4PEA==\r\n\
					sec-websocket-version: 8\r\n\r\n",
				)
				.await
				.unwrap();
			let mut head = vec![0_u8; 128];
			let n = client.read(&mut head).await.unwrap();
			let head = String::from_utf8_lossy(&head[..n]).to_string();
			assert!(head.starts_with("HTTP/1.1 426"));
			assert!(head.contains("sec-websocket-version: 13"));

			adapter.stop().await.unwrap();
		});
	}

	#[test]
	fn stop_sends_going_away() {
		rt().block_on(async {
			let adapter = WebSocketProxy::new(test_config("ws-stop"));
			adapter.start().await.unwrap();
			let addr = adapter.local_addr().unwrap();

			let mut client = TcpStream::connect(addr).await.unwrap();
			let head = upgrade(&mut client, addr).await;
			assert!(head.starts_with("HTTP/1.1 101"));

			adapter.stop().await.unwrap();
			let frame = Frame::read(&mut client).await.unwrap();
			assert_eq!(frame.opcode, OpCode::Close);
			assert_eq!(&frame.payload[..2], &CLOSE_GOING_AWAY.to_be_bytes());
			assert_eq!(&frame.payload[2..], b"Going Away");
		});
	}

	#[test]
	fn tunnel_reframes_to_target() {
		rt().block_on(async {
			// Upstream websocket echo endpoint.
			let upstream = WebSocketProxy::new(test_config("ws-upstream"));
			upstream.start().await.unwrap();
			let upstream_addr = upstream.local_addr().unwrap();

			let mut config = test_config("ws-tunnel");
			config.target = Some(TargetAddr::from(upstream_addr));
			let adapter = WebSocketProxy::new(config);
			adapter.start().await.unwrap();
			let addr = adapter.local_addr().unwrap();

			let mut client = TcpStream::connect(addr).await.unwrap();
			let head = upgrade(&mut client, addr).await;
			assert!(head.starts_with("HTTP/1.1 101"), "head: {}", head);

			let mut buf = Vec::new();
			Frame::new(OpCode::Binary, b"through the tunnel".to_vec()).write_to(&mut buf, true);
			client.write_all(&buf).await.unwrap();

			let reply = Frame::read(&mut client).await.unwrap();
			assert_eq!(reply.opcode, OpCode::Binary);
			assert_eq!(reply.payload, b"through the tunnel");

			adapter.stop().await.unwrap();
			upstream.stop().await.unwrap();
		});
	}

	#[test]
	fn handshake_parses_from_buffered_reader(){
		rt().block_on(async {
			let head = b"GET /chat HTTP/1.1\r\nHost: h\r\nUpgrade: WebSocket\r\n\
				Connection: Upgrade\r\nSec-WebSocket-Key: abc123==\r\n\
				Sec-WebSocket-Protocol: superchat, chat\r\n\
				Sec-WebSocket-Version: 13\r\n\r\n"
				.to_vec();
			let mut r = BufReader::new(Cursor::new(head));
			let request = read_handshake(&mut r).await.ok().unwrap();
			assert_eq!(request.key, "abc123==");
			assert_eq!(request.protocols, ["superchat", "chat"]);
			assert!(request.leftover.is_empty());
		});
	}

	#[test]
	fn subprotocol_negotiated_from_supported_set() {
		rt().block_on(async {
			let adapter = WebSocketProxy::new(test_config("ws-proto"));
			adapter.set_subprotocols(vec!["chat".to_string()]);
			adapter.start().await.unwrap();
			let addr = adapter.local_addr().unwrap();

			let mut client = TcpStream::connect(addr).await.unwrap();
			client
				.write_all(
					format!(
						"GET / HTTP/1.1\r\nhost: {}\r\nupgrade: websocket\r\n\
						connection: Upgrade\r\nsec-websocket-key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
						sec-websocket-protocol: superchat, chat\r\n\
						sec-websocket-version: 13\r\n\r\n",
						addr
					)
					.as_bytes(),
				)
				.await
				.unwrap();
			let mut head = Vec::new();
			let mut byte = [0_u8; 1];
			while crate::utils::find_pat_end(&head, CRLF_2).is_none() {
				client.read_exact(&mut byte).await.unwrap();
				head.push(byte[0]);
			}
			let head = String::from_utf8(head).unwrap();
			assert!(head.starts_with("HTTP/1.1 101"));
			assert!(head.contains("sec-websocket-protocol: chat\r\n"));

			adapter.stop().await.unwrap();
		});
	}

	#[test]
	fn unknown_subprotocols_are_not_selected() {
		rt().block_on(async {
			let adapter = WebSocketProxy::new(test_config("ws-no-proto"));
			adapter.set_subprotocols(vec!["graphql-ws".to_string()]);
			adapter.start().await.unwrap();
			let addr = adapter.local_addr().unwrap();

			let mut client = TcpStream::connect(addr).await.unwrap();
			// The offer shares nothing with the supported set.
			let head = upgrade(&mut client, addr).await;
			assert!(head.starts_with("HTTP/1.1 101"));
			assert!(!head.contains("sec-websocket-protocol"));

			adapter.stop().await.unwrap();
		});
	}
}
