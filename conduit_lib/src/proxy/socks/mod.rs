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

//! SOCKS proxy accepting version 4, 4a and 5 on the same port.
//!
//! The version is sniffed from the first byte. SOCKS5 supports
//! CONNECT and UDP ASSOCIATE with optional RFC 1929 authentication;
//! BIND is answered with `command not supported` on both versions.

mod utils;

pub use utils::{CommandCode, Error, Reply, ReplyCode, Request};

use self::utils::{
	make_v4_reply, AcceptableMethod, Authentication, Methods, V4Request, AUTH_FAILED,
	AUTH_SUCCESSFUL, SUB_VERS, V4_GRANTED, V4_REJECTED, VER4, VER5,
};
use crate::{
	prelude::*,
	protocol::{
		serve::{self, AdapterShared, StreamHandler},
		AdapterError, ConnRecord, ProtocolAdapter, ProtocolConfig, ProtocolStatus, StatsSnapshot,
	},
	utils::relay::Relay,
};
use std::io;
use tokio::{
	net::{TcpStream, UdpSocket},
	task::JoinHandle,
	time::timeout,
};

const PROTOCOL_NAME: &str = "socks";

pub struct SocksProxy {
	shared: Arc<AdapterShared>,
	handler: Arc<Handler>,
	serve_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl SocksProxy {
	#[must_use]
	pub fn new(config: ProtocolConfig) -> Self {
		let shared = Arc::new(AdapterShared::new(config));
		let handler = Arc::new(Handler {
			shared: shared.clone(),
		});
		Self {
			shared,
			handler,
			serve_task: AsyncMutex::new(None),
		}
	}

	#[must_use]
	pub fn local_addr(&self) -> Option<SocketAddr> {
		self.shared.local_addr()
	}
}

#[async_trait]
impl ProtocolAdapter for SocksProxy {
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
}

#[async_trait]
impl StreamHandler for Handler {
	async fn handle_conn(
		self: Arc<Self>,
		mut stream: TcpStream,
		record: Arc<ConnRecord>,
	) -> Result<(), AdapterError> {
		let ver = stream.read_u8().await?;
		match ver {
			VER4 => self.handle_v4(stream, &record).await,
			VER5 => self.handle_v5(stream, &record).await,
			other => Err(AdapterError::new_protocol(Error::WrongVersion(other))),
		}
	}
}

impl Handler {
	async fn handle_v4(
		&self,
		mut stream: TcpStream,
		record: &ConnRecord,
	) -> Result<(), AdapterError> {
		let config = &self.shared.config;
		let request = V4Request::read_no_ver(&mut stream)
			.await
			.map_err(AdapterError::new_protocol)?;

		// SOCKS4 has no password, the user id must match a known
		// username when authentication is on.
		if config.auth_required() {
			let known = std::str::from_utf8(&request.user_id)
				.map(|u| config.users.contains_key(u))
				.unwrap_or(false);
			if !known {
				stream
					.write_all(&make_v4_reply(V4_REJECTED, request.raw_port, request.raw_ip))
					.await?;
				return Err(AdapterError::Auth);
			}
		}

		match CommandCode::try_from(request.code) {
			Ok(CommandCode::Connect) => {}
			Ok(cmd) => {
				stream
					.write_all(&make_v4_reply(V4_REJECTED, request.raw_port, request.raw_ip))
					.await?;
				return Err(AdapterError::new_protocol(Error::UnsupportedCommand(cmd)));
			}
			Err(_) => {
				stream
					.write_all(&make_v4_reply(V4_REJECTED, request.raw_port, request.raw_ip))
					.await?;
				return Err(AdapterError::new_protocol(Error::UnknownCommand(
					request.code,
				)));
			}
		}

		debug!("[{:x}] SOCKS4 CONNECT to {}", record.id, request.addr);
		let target_stream = match timeout(config.timeout(), request.addr.dial()).await {
			Ok(Ok(s)) => s,
			Ok(Err(e)) => {
				stream
					.write_all(&make_v4_reply(V4_REJECTED, request.raw_port, request.raw_ip))
					.await?;
				return Err(e.into());
			}
			Err(_) => {
				stream
					.write_all(&make_v4_reply(V4_REJECTED, request.raw_port, request.raw_ip))
					.await?;
				return Err(AdapterError::Io(io::ErrorKind::TimedOut.into()));
			}
		};
		stream
			.write_all(&make_v4_reply(V4_GRANTED, request.raw_port, request.raw_ip))
			.await?;
		self.relay(stream, target_stream, record).await
	}

	async fn handle_v5(
		&self,
		mut stream: TcpStream,
		record: &ConnRecord,
	) -> Result<(), AdapterError> {
		let config = &self.shared.config;
		let methods = Methods::read(&mut stream).await?;
		let method = match methods.choose(config.auth_required()) {
			Some(method) => method,
			None => {
				stream.write_all(&[VER5, AUTH_FAILED]).await?;
				return Err(AdapterError::new_protocol(Error::UnsupportedMethod(
					methods.0,
				)));
			}
		};
		stream.write_all(&[VER5, method as u8]).await?;
		if method == AcceptableMethod::UsernamePassword {
			let auth = Authentication::read(&mut stream)
				.await
				.map_err(AdapterError::new_protocol)?;
			let ok = std::str::from_utf8(&auth.user)
				.ok()
				.and_then(|user| config.users.get(user))
				.map_or(false, |pass| pass.as_bytes() == auth.pass.as_slice());
			let status = if ok { AUTH_SUCCESSFUL } else { AUTH_FAILED };
			stream.write_all(&[SUB_VERS, status]).await?;
			if !ok {
				return Err(AdapterError::Auth);
			}
		}

		let request = Request::read(&mut stream)
			.await
			.map_err(AdapterError::new_protocol)?;
		let cmd = match CommandCode::try_from(request.code) {
			Ok(cmd) => cmd,
			Err(_) => {
				return Err(self
					.reply_error(
						&mut stream,
						&request.addr,
						ReplyCode::CommandNotSupported,
						Error::UnknownCommand(request.code),
					)
					.await);
			}
		};
		debug!(
			"[{:x}] SOCKS5 request, cmd: {}, dst: {}",
			record.id, cmd, request.addr
		);

		match cmd {
			CommandCode::Connect => self.handle_v5_connect(stream, request, record).await,
			CommandCode::Udp => self.handle_v5_udp(stream, record).await,
			CommandCode::Bind => Err(self
				.reply_error(
					&mut stream,
					&request.addr,
					ReplyCode::CommandNotSupported,
					Error::UnsupportedCommand(cmd),
				)
				.await),
		}
	}

	async fn handle_v5_connect(
		&self,
		mut stream: TcpStream,
		request: Request,
		record: &ConnRecord,
	) -> Result<(), AdapterError> {
		let config = &self.shared.config;
		let target_stream = match timeout(config.timeout(), request.addr.dial()).await {
			Ok(Ok(s)) => s,
			Ok(Err(e)) => {
				return Err(self
					.reply_error(
						&mut stream,
						&request.addr,
						ReplyCode::from_io_err(&e),
						Error::Custom(e.into()),
					)
					.await);
			}
			Err(_) => {
				return Err(self
					.reply_error(
						&mut stream,
						&request.addr,
						ReplyCode::HostUnreachable,
						Error::Custom("connect timed out".into()),
					)
					.await);
			}
		};
		let bound = target_stream
			.local_addr()
			.unwrap_or_else(|_| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
		let mut buf = Vec::with_capacity(32);
		Reply {
			code: ReplyCode::Succeeded.val(),
			addr: bound.into(),
		}
		.write_into(&mut buf);
		stream.write_all(&buf).await?;
		self.relay(stream, target_stream, record).await
	}

	/// UDP ASSOCIATE. The TCP connection only keeps the association
	/// alive; datagrams run over a fresh socket announced in the
	/// reply.
	async fn handle_v5_udp(
		&self,
		mut stream: TcpStream,
		record: &ConnRecord,
	) -> Result<(), AdapterError> {
		let config = &self.shared.config;
		let local_ip = stream.local_addr()?.ip();
		let udp = UdpSocket::bind(SocketAddr::new(local_ip, 0)).await?;
		let bound = udp.local_addr()?;
		debug!("[{:x}] UDP associate on {}", record.id, bound);

		let mut buf = Vec::with_capacity(32);
		Reply {
			code: ReplyCode::Succeeded.val(),
			addr: bound.into(),
		}
		.write_into(&mut buf);
		stream.write_all(&buf).await?;

		let peer_ip = record.peer.ip();
		let mut client_addr: Option<SocketAddr> = None;
		let mut tcp_buf = [0_u8; 64];
		let mut dgram = vec![0_u8; config.buffer_size];
		loop {
			tokio::select! {
				res = stream.read(&mut tcp_buf) => {
					match res {
						Ok(0) | Err(_) => return Ok(()),
						Ok(_) => {}
					}
				}
				res = udp.recv_from(&mut dgram) => {
					let (len, from) = res?;
					record.touch();
					let is_client = client_addr == Some(from)
						|| (client_addr.is_none() && from.ip() == peer_ip);
					if is_client {
						client_addr = Some(from);
						record.recv.add(len as u64);
						self.shared.stats.received().add(len as u64);
						if let Err(e) = forward_datagram(&udp, &dgram[..len]).await {
							debug!("[{:x}] dropping datagram: {}", record.id, e);
						}
					} else if let Some(client) = client_addr {
						let mut out = Vec::with_capacity(len + 22);
						out.put_u16(0); // RSV
						out.put_u8(0); // FRAG
						TargetAddr::from(from).write_to(&mut out);
						out.extend_from_slice(&dgram[..len]);
						udp.send_to(&out, client).await?;
						record.send.add(len as u64);
						self.shared.stats.sent().add(len as u64);
					}
				}
			}
		}
	}

	async fn reply_error<W: AsyncWrite + Unpin>(
		&self,
		w: &mut W,
		addr: &TargetAddr,
		code: ReplyCode,
		err: Error,
	) -> AdapterError {
		debug!("SOCKS5 handshake failed: {} (reply {})", err, code);
		let mut buf = Vec::with_capacity(32);
		Reply {
			code: code.val(),
			addr: addr.clone(),
		}
		.write_into(&mut buf);
		if let Err(e) = w.write_all(&buf).await {
			return e.into();
		}
		AdapterError::new_protocol(err)
	}

	async fn relay(
		&self,
		stream: TcpStream,
		target_stream: TcpStream,
		record: &ConnRecord,
	) -> Result<(), AdapterError> {
		let config = &self.shared.config;
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
}

/// Unwrap one client datagram and send the payload to its
/// destination.
///
///```not_rust
/// +-----+------+------+----------+----------+----------+
/// | RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
/// +-----+------+------+----------+----------+----------+
/// |  2  |  1   |  1   | Variable |    2     | Variable |
/// +-----+------+------+----------+----------+----------+
///```
async fn forward_datagram(udp: &UdpSocket, data: &[u8]) -> Result<(), BoxStdErr> {
	let mut cur = std::io::Cursor::new(data);
	let _rsv = cur.read_u16().await?;
	let frag = cur.read_u8().await?;
	if frag != 0 {
		return Err("fragmented datagrams are not supported".into());
	}
	let dst = TargetAddr::read_from(&mut cur).await?;
	#[allow(clippy::cast_possible_truncation)]
	let payload = &data[cur.position() as usize..];
	match &dst.dest {
		Destination::Ip(ip) => {
			udp.send_to(payload, SocketAddr::new(*ip, dst.port)).await?;
		}
		Destination::Name(name) => {
			udp.send_to(payload, (name.as_str(), dst.port)).await?;
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
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

	async fn spawn_tcp_echo() -> SocketAddr {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(async move {
			while let Ok((mut s, _)) = listener.accept().await {
				tokio::spawn(async move {
					let mut buf = [0_u8; 1024];
					while let Ok(n) = s.read(&mut buf).await {
						if n == 0 || s.write_all(&buf[..n]).await.is_err() {
							break;
						}
					}
				});
			}
		});
		addr
	}

	async fn read_v5_reply(stream: &mut TcpStream) -> u8 {
		let mut head = [0_u8; 4];
		stream.read_exact(&mut head).await.unwrap();
		assert_eq!(head[0], VER5);
		let skip = match head[3] {
			1 => 6,
			4 => 18,
			3 => {
				let len = stream.read_u8().await.unwrap();
				usize::from(len) + 2
			}
			other => panic!("bad atyp {}", other),
		};
		let mut rest = vec![0_u8; skip];
		stream.read_exact(&mut rest).await.unwrap();
		head[1]
	}

	#[test]
	fn socks5_connect_no_auth() {
		rt().block_on(async {
			let upstream = spawn_tcp_echo().await;
			let adapter = SocksProxy::new(test_config("socks5"));
			adapter.start().await.unwrap();
			let addr = adapter.local_addr().unwrap();

			let mut client = TcpStream::connect(addr).await.unwrap();
			client.write_all(&[VER5, 1, 0]).await.unwrap();
			let mut resp = [0_u8; 2];
			client.read_exact(&mut resp).await.unwrap();
			assert_eq!(resp, [VER5, 0]);

			let mut req = vec![VER5, 1, 0];
			TargetAddr::from(upstream).write_to(&mut req);
			client.write_all(&req).await.unwrap();
			assert_eq!(read_v5_reply(&mut client).await, 0);

			client.write_all(b"socks5 data").await.unwrap();
			let mut buf = [0_u8; 11];
			client.read_exact(&mut buf).await.unwrap();
			assert_eq!(&buf, b"socks5 data");

			adapter.stop().await.unwrap();
		});
	}

	#[test]
	fn socks5_userpass_authentication() {
		rt().block_on(async {
			let upstream = spawn_tcp_echo().await;
			let mut config = test_config("socks5-auth");
			config
				.users
				.insert("alice".to_string(), "secret".to_string());
			let adapter = SocksProxy::new(config);
			adapter.start().await.unwrap();
			let addr = adapter.local_addr().unwrap();

			let mut client = TcpStream::connect(addr).await.unwrap();
			client.write_all(&[VER5, 2, 0, 2]).await.unwrap();
			let mut resp = [0_u8; 2];
			client.read_exact(&mut resp).await.unwrap();
			assert_eq!(resp, [VER5, 2]);

			let mut auth = vec![SUB_VERS, 5];
			auth.extend_from_slice(b"alice");
			auth.push(6);
			auth.extend_from_slice(b"secret");
			client.write_all(&auth).await.unwrap();
			client.read_exact(&mut resp).await.unwrap();
			assert_eq!(resp, [SUB_VERS, AUTH_SUCCESSFUL]);

			let mut req = vec![VER5, 1, 0];
			TargetAddr::from(upstream).write_to(&mut req);
			client.write_all(&req).await.unwrap();
			assert_eq!(read_v5_reply(&mut client).await, 0);

			adapter.stop().await.unwrap();
		});
	}

	#[test]
	fn socks5_wrong_password_rejected() {
		rt().block_on(async {
			let mut config = test_config("socks5-badauth");
			config
				.users
				.insert("alice".to_string(), "secret".to_string());
			let adapter = SocksProxy::new(config);
			adapter.start().await.unwrap();
			let addr = adapter.local_addr().unwrap();

			let mut client = TcpStream::connect(addr).await.unwrap();
			client.write_all(&[VER5, 1, 2]).await.unwrap();
			let mut resp = [0_u8; 2];
			client.read_exact(&mut resp).await.unwrap();
			assert_eq!(resp, [VER5, 2]);

			let mut auth = vec![SUB_VERS, 5];
			auth.extend_from_slice(b"alice");
			auth.push(5);
			auth.extend_from_slice(b"wrong");
			client.write_all(&auth).await.unwrap();
			client.read_exact(&mut resp).await.unwrap();
			assert_eq!(resp, [SUB_VERS, AUTH_FAILED]);

			adapter.stop().await.unwrap();
		});
	}

	#[test]
	fn socks4_connect_and_exact_reply() {
		rt().block_on(async {
			let upstream = spawn_tcp_echo().await;
			let upstream_ip = match upstream.ip() {
				IpAddr::V4(ip) => ip.octets(),
				IpAddr::V6(_) => unreachable!(),
			};
			let adapter = SocksProxy::new(test_config("socks4"));
			adapter.start().await.unwrap();
			let addr = adapter.local_addr().unwrap();

			let mut client = TcpStream::connect(addr).await.unwrap();
			let mut req = vec![VER4, 1];
			req.extend_from_slice(&upstream.port().to_be_bytes());
			req.extend_from_slice(&upstream_ip);
			req.extend_from_slice(b"user\0");
			client.write_all(&req).await.unwrap();

			let mut reply = [0_u8; 8];
			client.read_exact(&mut reply).await.unwrap();
			let mut expected = vec![0, V4_GRANTED];
			expected.extend_from_slice(&upstream.port().to_be_bytes());
			expected.extend_from_slice(&upstream_ip);
			assert_eq!(&reply[..], &expected[..]);

			client.write_all(b"socks4 data").await.unwrap();
			let mut buf = [0_u8; 11];
			client.read_exact(&mut buf).await.unwrap();
			assert_eq!(&buf, b"socks4 data");

			adapter.stop().await.unwrap();
		});
	}

	#[test]
	fn socks5_bind_is_refused() {
		rt().block_on(async {
			let adapter = SocksProxy::new(test_config("socks5-bind"));
			adapter.start().await.unwrap();
			let addr = adapter.local_addr().unwrap();

			let mut client = TcpStream::connect(addr).await.unwrap();
			client.write_all(&[VER5, 1, 0]).await.unwrap();
			let mut resp = [0_u8; 2];
			client.read_exact(&mut resp).await.unwrap();

			let mut req = vec![VER5, 2, 0];
			TargetAddr::from(("127.0.0.1".parse::<IpAddr>().unwrap(), 80)).write_to(&mut req);
			client.write_all(&req).await.unwrap();
			assert_eq!(
				read_v5_reply(&mut client).await,
				ReplyCode::CommandNotSupported.val()
			);

			adapter.stop().await.unwrap();
		});
	}

	#[test]
	fn socks5_udp_associate_roundtrip() {
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

			let adapter = SocksProxy::new(test_config("socks5-udp"));
			adapter.start().await.unwrap();
			let addr = adapter.local_addr().unwrap();

			let mut client = TcpStream::connect(addr).await.unwrap();
			client.write_all(&[VER5, 1, 0]).await.unwrap();
			let mut resp = [0_u8; 2];
			client.read_exact(&mut resp).await.unwrap();

			// UDP ASSOCIATE with a zero client address.
			let mut req = vec![VER5, 3, 0];
			TargetAddr::from(("0.0.0.0".parse::<IpAddr>().unwrap(), 0)).write_to(&mut req);
			client.write_all(&req).await.unwrap();

			let mut head = [0_u8; 4];
			client.read_exact(&mut head).await.unwrap();
			assert_eq!(head[1], 0);
			assert_eq!(head[3], 1);
			let mut tail = [0_u8; 6];
			client.read_exact(&mut tail).await.unwrap();
			let relay_addr = SocketAddr::new(
				IpAddr::V4(Ipv4Addr::new(tail[0], tail[1], tail[2], tail[3])),
				u16::from_be_bytes([tail[4], tail[5]]),
			);

			let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
			let mut dgram = vec![0, 0, 0];
			TargetAddr::from(upstream_addr).write_to(&mut dgram);
			dgram.extend_from_slice(b"udp payload");
			udp.send_to(&dgram, relay_addr).await.unwrap();

			let mut buf = [0_u8; 1024];
			let (n, _) = udp.recv_from(&mut buf).await.unwrap();
			// Reply comes back wrapped: RSV + FRAG + IPv4 addr + payload.
			assert_eq!(&buf[..3], &[0, 0, 0]);
			assert_eq!(buf[3], 1);
			assert_eq!(&buf[10..n], b"udp payload");

			adapter.stop().await.unwrap();
		});
	}
}
