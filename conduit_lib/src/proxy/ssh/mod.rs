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

//! Simplified SSH local port forwarding.
//!
//! Accepted connections are carried to a fixed target through one
//! `direct-tcpip` channel on an SSH server. The handshake speaks
//! real SSH framing and message types but stubs the key exchange
//! (no DH, no encryption; the MAC machinery exists but no keys are
//! ever negotiated) — this is NOT a secure SSH client, it forwards
//! bytes against servers speaking the same simplified dialect.
//!
//! Remote and dynamic (SOCKS-over-SSH) forwarding are extension
//! points and refuse to start.

pub mod packet;

use self::packet::{
	banner_line, build_channel_close, build_channel_data, build_channel_eof,
	build_channel_open_direct_tcpip, build_service_request, build_userauth_password,
	build_userauth_publickey, read_banner, KexInit, Message, MsgType, PacketReader, PacketWriter,
	SshError, SERVICE_CONNECTION,
};
use crate::{
	prelude::*,
	protocol::{
		serve::{self, AdapterShared, StreamHandler},
		AdapterError, ConnRecord, ProtocolAdapter, ProtocolConfig, ProtocolStatus, StatsSnapshot,
		TargetAddr,
	},
};
use std::{fmt, io};
use tokio::{
	io::BufReader,
	net::TcpStream,
	task::JoinHandle,
	time::timeout,
};

const PROTOCOL_NAME: &str = "ssh";
const INITIAL_WINDOW_SIZE: u32 = 32 * 1024;
const MAX_PACKET_SIZE: u32 = 32 * 1024;

// -------------------------------------------------------
//                      TunnelSettings
// -------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "use_serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "use_serde", serde(rename_all = "lowercase"))]
pub enum ForwardType {
	Local,
	Remote,
	Dynamic,
}

impl Default for ForwardType {
	fn default() -> Self {
		ForwardType::Local
	}
}

impl fmt::Display for ForwardType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			ForwardType::Local => "local",
			ForwardType::Remote => "remote",
			ForwardType::Dynamic => "dynamic",
		})
	}
}

/// Where and how to reach the SSH server.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "use_serde", derive(serde::Deserialize))]
pub struct TunnelSettings {
	pub server: TargetAddr,
	pub username: String,
	/// Password auth when set, the (stub) publickey method otherwise.
	#[cfg_attr(feature = "use_serde", serde(default))]
	pub password: Option<String>,
	#[cfg_attr(feature = "use_serde", serde(default))]
	pub forward: ForwardType,
}

// -------------------------------------------------------
//                        SshTunnel
// -------------------------------------------------------

pub struct SshTunnel {
	shared: Arc<AdapterShared>,
	handler: Arc<Handler>,
	forward: ForwardType,
	serve_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl SshTunnel {
	#[must_use]
	pub fn new(config: ProtocolConfig, settings: TunnelSettings) -> Self {
		let forward = settings.forward;
		let shared = Arc::new(AdapterShared::new(config));
		let handler = Arc::new(Handler {
			shared: shared.clone(),
			settings,
		});
		Self {
			shared,
			handler,
			forward,
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
impl ProtocolAdapter for SshTunnel {
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
		match self.forward {
			ForwardType::Local => {}
			ForwardType::Remote => return Err(AdapterError::Unsupported("remote forwarding")),
			ForwardType::Dynamic => return Err(AdapterError::Unsupported("dynamic forwarding")),
		}
		serve::start_stream_adapter(&self.shared, &self.handler, &self.serve_task).await
	}

	async fn stop(&self) -> Result<(), AdapterError> {
		serve::stop_stream_adapter(&self.shared, &self.serve_task).await
	}
}

// -------------------------------------------------------
//                        Handler
// -------------------------------------------------------

/// One open `direct-tcpip` channel.
struct Channel {
	local_id: u32,
	remote_id: u32,
	#[allow(dead_code)]
	window_size: u32,
	max_packet_size: u32,
}

struct Handler {
	shared: Arc<AdapterShared>,
	settings: TunnelSettings,
}

#[async_trait]
impl StreamHandler for Handler {
	async fn handle_conn(
		self: Arc<Self>,
		stream: TcpStream,
		record: Arc<ConnRecord>,
	) -> Result<(), AdapterError> {
		let config = &self.shared.config;
		let target = config
			.target
			.as_ref()
			.ok_or_else(|| AdapterError::new_protocol("ssh tunnel needs a target address"))?;

		let ssh_stream = timeout(config.timeout(), self.settings.server.dial())
			.await
			.map_err(|_| AdapterError::Io(io::ErrorKind::TimedOut.into()))??;
		let (ssh_r, mut ssh_w) = ssh_stream.into_split();
		let mut ssh_r = BufReader::new(ssh_r);

		// Banner exchange; bytes past the newline already belong to
		// the binary protocol.
		ssh_w.write_all(&banner_line()).await?;
		ssh_w.flush().await?;
		let (server_banner, leftover) = timeout(config.timeout(), read_banner(&mut ssh_r))
			.await
			.map_err(|_| AdapterError::Io(io::ErrorKind::TimedOut.into()))?
			.map_err(ssh_err)?;
		debug!("[{:x}] ssh server banner: {}", record.id, server_banner);
		let mut ssh_r =
			tokio::io::AsyncReadExt::chain(std::io::Cursor::new(leftover), ssh_r);

		let mut pr = PacketReader::default();
		let mut pw = PacketWriter::default();
		let channel = timeout(
			config.timeout(),
			establish(
				&mut ssh_r,
				&mut ssh_w,
				&mut pr,
				&mut pw,
				&self.settings,
				target,
				record.peer,
			),
		)
		.await
		.map_err(|_| AdapterError::Io(io::ErrorKind::TimedOut.into()))??;
		info!(
			"[{:x}] channel {} -> {} open to {} via {}",
			record.id, channel.local_id, channel.remote_id, target, self.settings.server
		);

		self.pump(stream, ssh_r, ssh_w, pr, pw, channel, &record).await
	}
}

impl Handler {
	/// Carry bytes both ways until either side finishes, then close
	/// the channel.
	async fn pump<R>(
		&self,
		stream: TcpStream,
		mut ssh_r: R,
		ssh_w: tokio::net::tcp::OwnedWriteHalf,
		mut pr: PacketReader,
		pw: PacketWriter,
		channel: Channel,
		record: &ConnRecord,
	) -> Result<(), AdapterError>
	where
		R: AsyncRead + Unpin,
	{
		let (mut client_r, mut client_w) = stream.into_split();
		let ssh_tx = AsyncMutex::new((ssh_w, pw));
		let buffer_size = std::cmp::min(
			self.shared.config.buffer_size,
			channel.max_packet_size as usize,
		);

		let up = async {
			let mut buf = vec![0_u8; buffer_size];
			loop {
				let n = client_r.read(&mut buf).await?;
				if n == 0 {
					let mut tx = ssh_tx.lock().await;
					let (w, pw) = &mut *tx;
					let eof = pw.pack(&build_channel_eof(channel.remote_id));
					w.write_all(&eof).await?;
					w.flush().await?;
					return Ok::<(), AdapterError>(());
				}
				record.touch();
				record.recv.add(n as u64);
				self.shared.stats.received().add(n as u64);
				let mut tx = ssh_tx.lock().await;
				let (w, pw) = &mut *tx;
				let data = pw.pack(&build_channel_data(channel.remote_id, &buf[..n]));
				w.write_all(&data).await?;
				w.flush().await?;
			}
		};

		let down = async {
			loop {
				let payload = pr.read_packet(&mut ssh_r).await.map_err(ssh_err)?;
				match Message::parse(&payload).map_err(ssh_err)? {
					Message::ChannelData {
						recipient_channel,
						data,
					} if recipient_channel == channel.local_id => {
						record.touch();
						client_w.write_all(&data).await?;
						record.send.add(data.len() as u64);
						self.shared.stats.sent().add(data.len() as u64);
					}
					Message::ChannelEof { recipient_channel }
					| Message::ChannelClose { recipient_channel }
						if recipient_channel == channel.local_id =>
					{
						return Ok::<(), AdapterError>(());
					}
					// Window adjusts and everything else are ignored,
					// accounting is not enforced in this dialect.
					_ => {}
				}
			}
		};

		let result = tokio::select! {
			res = up => res,
			res = down => res,
		};

		// Best effort channel close, the transport goes away next.
		let mut tx = ssh_tx.lock().await;
		let (w, pw) = &mut *tx;
		let close = pw.pack(&build_channel_close(channel.remote_id));
		let _ = w.write_all(&close).await;
		let _ = w.flush().await;
		debug!("[{:x}] channel {} closed", record.id, channel.local_id);
		result
	}
}

// -------------------------------------------------------
//                       Handshake
// -------------------------------------------------------

fn ssh_err(err: SshError) -> AdapterError {
	match err {
		SshError::Io(e) => AdapterError::Io(e),
		other => AdapterError::new_protocol(other),
	}
}

/// Read the next message, skipping the ones that may arrive at any
/// time (IGNORE, DEBUG, USERAUTH_BANNER).
async fn read_message<R>(r: &mut R, pr: &mut PacketReader) -> Result<Message, AdapterError>
where
	R: AsyncRead + Unpin,
{
	loop {
		let payload = pr.read_packet(r).await.map_err(ssh_err)?;
		match Message::parse(&payload).map_err(ssh_err)? {
			Message::Other(t)
				if t == MsgType::Ignore as u8
					|| t == MsgType::Debug as u8
					|| t == MsgType::UserauthBanner as u8 => {}
			msg => return Ok(msg),
		}
	}
}

/// Key exchange (stubbed), service request, user auth and channel
/// open, in order.
async fn establish<R, W>(
	r: &mut R,
	w: &mut W,
	pr: &mut PacketReader,
	pw: &mut PacketWriter,
	settings: &TunnelSettings,
	target: &TargetAddr,
	originator: SocketAddr,
) -> Result<Channel, AdapterError>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	// KEXINIT both ways; no DH follows, keys stay unset.
	w.write_all(&pw.pack(&KexInit::default().build())).await?;
	w.flush().await?;
	let payload = pr.read_packet(r).await.map_err(ssh_err)?;
	let server_kex = KexInit::parse(&payload).map_err(ssh_err)?;
	trace!("server kex algorithms: {}", server_kex.kex_algorithms);

	w.write_all(&pw.pack(&build_service_request(SERVICE_CONNECTION)))
		.await?;
	w.flush().await?;
	match read_message(r, pr).await? {
		Message::ServiceAccept(service) if service == SERVICE_CONNECTION => {}
		other => {
			return Err(AdapterError::new_protocol(format!(
				"service request refused: {:?}",
				other
			)))
		}
	}

	let auth_request = match &settings.password {
		Some(password) => build_userauth_password(&settings.username, password),
		None => build_userauth_publickey(&settings.username),
	};
	w.write_all(&pw.pack(&auth_request)).await?;
	w.flush().await?;
	match read_message(r, pr).await? {
		Message::UserauthSuccess => {}
		Message::UserauthFailure { methods, .. } => {
			debug!("authentication refused, server accepts: {:?}", methods);
			return Err(AdapterError::Auth);
		}
		other => {
			return Err(AdapterError::new_protocol(format!(
				"unexpected auth response: {:?}",
				other
			)))
		}
	}

	// One channel per connection, the local id can stay fixed.
	let local_id = 0;
	let open = build_channel_open_direct_tcpip(
		local_id,
		INITIAL_WINDOW_SIZE,
		MAX_PACKET_SIZE,
		target,
		originator,
	);
	w.write_all(&pw.pack(&open)).await?;
	w.flush().await?;
	match read_message(r, pr).await? {
		Message::ChannelOpenConfirmation {
			recipient_channel,
			sender_channel,
			initial_window_size,
			maximum_packet_size,
		} if recipient_channel == local_id => Ok(Channel {
			local_id,
			remote_id: sender_channel,
			window_size: initial_window_size,
			max_packet_size: maximum_packet_size.max(1),
		}),
		Message::ChannelOpenFailure {
			reason_code,
			description,
			..
		} => Err(AdapterError::new_protocol(format!(
			"channel refused (code {}): {}",
			reason_code, description
		))),
		other => Err(AdapterError::new_protocol(format!(
			"unexpected channel response: {:?}",
			other
		))),
	}
}
