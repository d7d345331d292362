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

//! SSH wire format: binary packet framing and the handful of
//! messages the tunnel uses.
//!
//! Framing per RFC 4253 §6:
//! `[packet_length:4][padding_length:1][payload][padding][mac]?`
//! block-aligned with at least 4 bytes of random padding. The MAC,
//! when keys are set, is HMAC-SHA1 over the send sequence number
//! followed by the unencrypted packet.

use crate::prelude::*;
use hmac::{Hmac, Mac, NewMac};
use num_enum::TryFromPrimitive;
use sha1::Sha1;
use std::io;

pub const VERSION_BANNER: &str = "SSH-2.0-Conduit_0.1";
pub const SERVICE_CONNECTION: &str = "ssh-connection";
pub const CHANNEL_DIRECT_TCPIP: &str = "direct-tcpip";

const BLOCK_SIZE: usize = 8;
const MIN_PADDING: usize = 4;
const MAC_LEN: usize = 20;
/// Upper bound on one packet, nothing the tunnel sends comes close.
const MAX_PACKET_LEN: u32 = 256 * 1024;
const MAX_BANNER_LEN: usize = 255;

#[derive(Debug, TryFromPrimitive, PartialEq, Eq, Copy, Clone)]
#[repr(u8)]
pub enum MsgType {
	Disconnect = 1,
	Ignore = 2,
	Unimplemented = 3,
	Debug = 4,
	ServiceRequest = 5,
	ServiceAccept = 6,
	KexInit = 20,
	NewKeys = 21,
	KexDhInit = 30,
	KexDhReply = 31,
	UserauthRequest = 50,
	UserauthFailure = 51,
	UserauthSuccess = 52,
	UserauthBanner = 53,
	GlobalRequest = 80,
	RequestSuccess = 81,
	RequestFailure = 82,
	ChannelOpen = 90,
	ChannelOpenConfirmation = 91,
	ChannelOpenFailure = 92,
	ChannelWindowAdjust = 93,
	ChannelData = 94,
	ChannelExtendedData = 95,
	ChannelEof = 96,
	ChannelClose = 97,
	ChannelRequest = 98,
	ChannelSuccess = 99,
	ChannelFailure = 100,
}

#[derive(Debug, thiserror::Error)]
pub enum SshError {
	#[error("IO error ({0})")]
	Io(#[from] io::Error),
	#[error("packet of {0} bytes is too large")]
	PacketTooLarge(u32),
	#[error("packet truncated")]
	Truncated,
	#[error("MAC verification failed")]
	MacMismatch,
	#[error("invalid version banner")]
	BadBanner,
	#[error("expected {expected:?}, got message type {got}")]
	UnexpectedMessage { expected: MsgType, got: u8 },
}

// -------------------------------------------------------
//                   string/uint32 helpers
// -------------------------------------------------------

pub fn put_string(buf: &mut impl BufMut, value: &[u8]) {
	#[allow(clippy::cast_possible_truncation)]
	buf.put_u32(value.len() as u32);
	buf.put_slice(value);
}

/// # Errors
/// Returns [`SshError::Truncated`] when `buf` runs out.
pub fn read_string(buf: &mut impl Buf) -> Result<Vec<u8>, SshError> {
	if buf.remaining() < 4 {
		return Err(SshError::Truncated);
	}
	let len = buf.get_u32() as usize;
	if buf.remaining() < len {
		return Err(SshError::Truncated);
	}
	let mut value = vec![0_u8; len];
	buf.copy_to_slice(&mut value);
	Ok(value)
}

fn read_u32(buf: &mut impl Buf) -> Result<u32, SshError> {
	if buf.remaining() < 4 {
		return Err(SshError::Truncated);
	}
	Ok(buf.get_u32())
}

fn mac_of(key: &[u8], seq: u32, packet: &[u8]) -> [u8; MAC_LEN] {
	let mut mac =
		Hmac::<Sha1>::new_from_slice(key).expect("HMAC accepts keys of any length");
	mac.update(&seq.to_be_bytes());
	mac.update(packet);
	let mut out = [0_u8; MAC_LEN];
	out.copy_from_slice(&mac.finalize().into_bytes());
	out
}

// -------------------------------------------------------
//                    PacketWriter/Reader
// -------------------------------------------------------

/// Outgoing framing state: one per direction, owns the send
/// sequence number.
#[derive(Default)]
pub struct PacketWriter {
	seq: u32,
	mac_key: Option<Vec<u8>>,
}

impl PacketWriter {
	pub fn set_mac_key(&mut self, key: Vec<u8>) {
		self.mac_key = Some(key);
	}

	/// Frame `payload` into one packet, consuming a sequence number.
	pub fn pack(&mut self, payload: &[u8]) -> Vec<u8> {
		let mut padding_len = BLOCK_SIZE - ((4 + 1 + payload.len()) % BLOCK_SIZE);
		if padding_len < MIN_PADDING {
			padding_len += BLOCK_SIZE;
		}
		let mut padding = vec![0_u8; padding_len];
		rand::thread_rng().fill_bytes(&mut padding);

		let packet_length = 1 + payload.len() + padding_len;
		let mut packet = Vec::with_capacity(4 + packet_length + MAC_LEN);
		#[allow(clippy::cast_possible_truncation)]
		packet.put_u32(packet_length as u32);
		#[allow(clippy::cast_possible_truncation)]
		packet.put_u8(padding_len as u8);
		packet.put_slice(payload);
		packet.put_slice(&padding);

		if let Some(key) = &self.mac_key {
			let mac = mac_of(key, self.seq, &packet);
			packet.put_slice(&mac);
		}
		self.seq = self.seq.wrapping_add(1);
		packet
	}
}

/// Incoming framing state, mirror of [`PacketWriter`].
#[derive(Default)]
pub struct PacketReader {
	seq: u32,
	mac_key: Option<Vec<u8>>,
}

impl PacketReader {
	pub fn set_mac_key(&mut self, key: Vec<u8>) {
		self.mac_key = Some(key);
	}

	/// Read one packet and return its payload, padding stripped.
	///
	/// # Errors
	/// Returns an [`SshError`] on IO failure, oversized or malformed
	/// framing, or a MAC mismatch.
	pub async fn read_packet<R>(&mut self, r: &mut R) -> Result<Vec<u8>, SshError>
	where
		R: AsyncRead + Unpin,
	{
		let packet_length = r.read_u32().await?;
		if packet_length > MAX_PACKET_LEN {
			return Err(SshError::PacketTooLarge(packet_length));
		}
		if packet_length < 1 {
			return Err(SshError::Truncated);
		}
		let mut data = vec![0_u8; packet_length as usize];
		r.read_exact(&mut data).await?;

		if let Some(key) = &self.mac_key {
			let mut wire_mac = [0_u8; MAC_LEN];
			r.read_exact(&mut wire_mac).await?;
			let mut packet = Vec::with_capacity(4 + data.len());
			packet.put_u32(packet_length);
			packet.put_slice(&data);
			if mac_of(key, self.seq, &packet) != wire_mac {
				return Err(SshError::MacMismatch);
			}
		}
		self.seq = self.seq.wrapping_add(1);

		let padding_len = usize::from(data[0]);
		let payload_len = (packet_length as usize)
			.checked_sub(1 + padding_len)
			.ok_or(SshError::Truncated)?;
		data.drain(..1);
		data.truncate(payload_len);
		Ok(data)
	}
}

// -------------------------------------------------------
//                        Banner
// -------------------------------------------------------

pub fn banner_line() -> Vec<u8> {
	let mut line = VERSION_BANNER.as_bytes().to_vec();
	line.extend_from_slice(CRLF);
	line
}

/// Read the peer's version banner.
///
/// Returns the identification line and any bytes read past it,
/// which belong to the binary protocol that follows.
///
/// # Errors
/// Returns [`SshError::BadBanner`] unless a line starting with
/// `SSH-` arrives within the length limit.
pub async fn read_banner<R>(r: &mut R) -> Result<(String, Vec<u8>), SshError>
where
	R: tokio::io::AsyncBufRead + Unpin,
{
	let mut buf = Vec::new();
	let pos = crate::utils::read_until(r, b"\n", &mut buf, MAX_BANNER_LEN)
		.await
		.map_err(|err| match err {
			crate::utils::ReadError::Io(e) => SshError::Io(e),
			_ => SshError::BadBanner,
		})?;
	let leftover = buf.split_off(pos);
	let line = String::from_utf8(buf).map_err(|_| SshError::BadBanner)?;
	let line = line.trim_end().to_owned();
	if !line.starts_with("SSH-") {
		return Err(SshError::BadBanner);
	}
	Ok((line, leftover))
}

// -------------------------------------------------------
//                        KexInit
// -------------------------------------------------------

/// The algorithm-list message. The key exchange itself is stubbed,
/// these lists are advertised but never negotiated on; nothing here
/// is cryptographically secure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
	pub cookie: [u8; 16],
	pub kex_algorithms: String,
	pub server_host_key_algorithms: String,
	pub encryption_c2s: String,
	pub encryption_s2c: String,
	pub mac_c2s: String,
	pub mac_s2c: String,
	pub compression_c2s: String,
	pub compression_s2c: String,
	pub languages_c2s: String,
	pub languages_s2c: String,
	pub first_kex_packet_follows: bool,
}

impl Default for KexInit {
	fn default() -> Self {
		let mut cookie = [0_u8; 16];
		rand::thread_rng().fill_bytes(&mut cookie);
		Self {
			cookie,
			kex_algorithms: "diffie-hellman-group14-sha256".into(),
			server_host_key_algorithms: "ssh-rsa".into(),
			encryption_c2s: "aes128-ctr".into(),
			encryption_s2c: "aes128-ctr".into(),
			mac_c2s: "hmac-sha1".into(),
			mac_s2c: "hmac-sha1".into(),
			compression_c2s: "none".into(),
			compression_s2c: "none".into(),
			languages_c2s: String::new(),
			languages_s2c: String::new(),
			first_kex_packet_follows: false,
		}
	}
}

impl KexInit {
	#[must_use]
	pub fn build(&self) -> Vec<u8> {
		let mut payload = Vec::new();
		payload.put_u8(MsgType::KexInit as u8);
		payload.put_slice(&self.cookie);
		for list in self.name_lists() {
			put_string(&mut payload, list.as_bytes());
		}
		payload.put_u8(u8::from(self.first_kex_packet_follows));
		payload.put_u32(0); // reserved
		payload
	}

	/// # Errors
	/// Returns an [`SshError`] on wrong message type or truncation.
	pub fn parse(payload: &[u8]) -> Result<Self, SshError> {
		let mut buf = payload;
		if buf.remaining() < 1 + 16 {
			return Err(SshError::Truncated);
		}
		let msg_type = buf.get_u8();
		if msg_type != MsgType::KexInit as u8 {
			return Err(SshError::UnexpectedMessage {
				expected: MsgType::KexInit,
				got: msg_type,
			});
		}
		let mut cookie = [0_u8; 16];
		buf.copy_to_slice(&mut cookie);
		let mut lists = Vec::with_capacity(10);
		for _ in 0..10 {
			let raw = read_string(&mut buf)?;
			lists.push(String::from_utf8(raw).map_err(|_| SshError::Truncated)?);
		}
		if buf.remaining() < 1 + 4 {
			return Err(SshError::Truncated);
		}
		let first_kex_packet_follows = buf.get_u8() != 0;
		let mut lists = lists.into_iter();
		// 10 entries were just pushed.
		let mut next = move || lists.next().unwrap_or_default();
		Ok(Self {
			cookie,
			kex_algorithms: next(),
			server_host_key_algorithms: next(),
			encryption_c2s: next(),
			encryption_s2c: next(),
			mac_c2s: next(),
			mac_s2c: next(),
			compression_c2s: next(),
			compression_s2c: next(),
			languages_c2s: next(),
			languages_s2c: next(),
			first_kex_packet_follows,
		})
	}

	fn name_lists(&self) -> [&String; 10] {
		[
			&self.kex_algorithms,
			&self.server_host_key_algorithms,
			&self.encryption_c2s,
			&self.encryption_s2c,
			&self.mac_c2s,
			&self.mac_s2c,
			&self.compression_c2s,
			&self.compression_s2c,
			&self.languages_c2s,
			&self.languages_s2c,
		]
	}
}

// -------------------------------------------------------
//                    Message builders
// -------------------------------------------------------

#[must_use]
pub fn build_service_request(service: &str) -> Vec<u8> {
	let mut payload = Vec::new();
	payload.put_u8(MsgType::ServiceRequest as u8);
	put_string(&mut payload, service.as_bytes());
	payload
}

#[must_use]
pub fn build_userauth_password(username: &str, password: &str) -> Vec<u8> {
	let mut payload = userauth_prefix(username, "password");
	payload.put_u8(0); // no password change
	put_string(&mut payload, password.as_bytes());
	payload
}

/// The simplified publickey request carries an empty key blob, real
/// servers will refuse it; kept for dialect compatibility.
#[must_use]
pub fn build_userauth_publickey(username: &str) -> Vec<u8> {
	let mut payload = userauth_prefix(username, "publickey");
	payload.put_u8(0); // no signature
	put_string(&mut payload, b"ssh-rsa");
	put_string(&mut payload, b"");
	payload
}

fn userauth_prefix(username: &str, method: &str) -> Vec<u8> {
	let mut payload = Vec::new();
	payload.put_u8(MsgType::UserauthRequest as u8);
	put_string(&mut payload, username.as_bytes());
	put_string(&mut payload, SERVICE_CONNECTION.as_bytes());
	put_string(&mut payload, method.as_bytes());
	payload
}

#[must_use]
pub fn build_channel_open_direct_tcpip(
	sender_channel: u32,
	window_size: u32,
	max_packet_size: u32,
	target: &TargetAddr,
	originator: SocketAddr,
) -> Vec<u8> {
	let mut payload = Vec::new();
	payload.put_u8(MsgType::ChannelOpen as u8);
	put_string(&mut payload, CHANNEL_DIRECT_TCPIP.as_bytes());
	payload.put_u32(sender_channel);
	payload.put_u32(window_size);
	payload.put_u32(max_packet_size);
	put_string(&mut payload, target.dest.to_string().as_bytes());
	payload.put_u32(u32::from(target.port));
	put_string(&mut payload, originator.ip().to_string().as_bytes());
	payload.put_u32(u32::from(originator.port()));
	payload
}

#[must_use]
pub fn build_channel_data(recipient_channel: u32, data: &[u8]) -> Vec<u8> {
	let mut payload = Vec::with_capacity(9 + data.len());
	payload.put_u8(MsgType::ChannelData as u8);
	payload.put_u32(recipient_channel);
	put_string(&mut payload, data);
	payload
}

#[must_use]
pub fn build_channel_eof(recipient_channel: u32) -> Vec<u8> {
	let mut payload = Vec::with_capacity(5);
	payload.put_u8(MsgType::ChannelEof as u8);
	payload.put_u32(recipient_channel);
	payload
}

#[must_use]
pub fn build_channel_close(recipient_channel: u32) -> Vec<u8> {
	let mut payload = Vec::with_capacity(5);
	payload.put_u8(MsgType::ChannelClose as u8);
	payload.put_u32(recipient_channel);
	payload
}

// -------------------------------------------------------
//                    Incoming messages
// -------------------------------------------------------

/// The subset of incoming messages the tunnel reacts to. Everything
/// else surfaces as [`Message::Other`] and is skipped.
#[derive(Debug, Clone)]
pub enum Message {
	ServiceAccept(String),
	UserauthSuccess,
	UserauthFailure {
		methods: Vec<String>,
		partial_success: bool,
	},
	ChannelOpenConfirmation {
		recipient_channel: u32,
		sender_channel: u32,
		initial_window_size: u32,
		maximum_packet_size: u32,
	},
	ChannelOpenFailure {
		recipient_channel: u32,
		reason_code: u32,
		description: String,
	},
	ChannelData {
		recipient_channel: u32,
		data: Vec<u8>,
	},
	ChannelWindowAdjust {
		recipient_channel: u32,
		bytes_to_add: u32,
	},
	ChannelEof {
		recipient_channel: u32,
	},
	ChannelClose {
		recipient_channel: u32,
	},
	Other(u8),
}

impl Message {
	/// # Errors
	/// Returns an [`SshError`] on an empty or truncated payload.
	pub fn parse(payload: &[u8]) -> Result<Self, SshError> {
		let mut buf = payload;
		if buf.remaining() < 1 {
			return Err(SshError::Truncated);
		}
		let msg_type = buf.get_u8();
		Ok(match MsgType::try_from(msg_type) {
			Ok(MsgType::ServiceAccept) => {
				let service = read_string(&mut buf)?;
				Message::ServiceAccept(
					String::from_utf8(service).map_err(|_| SshError::Truncated)?,
				)
			}
			Ok(MsgType::UserauthSuccess) => Message::UserauthSuccess,
			Ok(MsgType::UserauthFailure) => {
				let methods = read_string(&mut buf)?;
				let methods = String::from_utf8(methods).map_err(|_| SshError::Truncated)?;
				let partial_success = buf.remaining() >= 1 && buf.get_u8() != 0;
				Message::UserauthFailure {
					methods: methods.split(',').map(str::to_owned).collect(),
					partial_success,
				}
			}
			Ok(MsgType::ChannelOpenConfirmation) => Message::ChannelOpenConfirmation {
				recipient_channel: read_u32(&mut buf)?,
				sender_channel: read_u32(&mut buf)?,
				initial_window_size: read_u32(&mut buf)?,
				maximum_packet_size: read_u32(&mut buf)?,
			},
			Ok(MsgType::ChannelOpenFailure) => {
				let recipient_channel = read_u32(&mut buf)?;
				let reason_code = read_u32(&mut buf)?;
				let description = read_string(&mut buf).unwrap_or_default();
				Message::ChannelOpenFailure {
					recipient_channel,
					reason_code,
					description: String::from_utf8_lossy(&description).into_owned(),
				}
			}
			Ok(MsgType::ChannelData) => Message::ChannelData {
				recipient_channel: read_u32(&mut buf)?,
				data: read_string(&mut buf)?,
			},
			Ok(MsgType::ChannelWindowAdjust) => Message::ChannelWindowAdjust {
				recipient_channel: read_u32(&mut buf)?,
				bytes_to_add: read_u32(&mut buf)?,
			},
			Ok(MsgType::ChannelEof) => Message::ChannelEof {
				recipient_channel: read_u32(&mut buf)?,
			},
			Ok(MsgType::ChannelClose) => Message::ChannelClose {
				recipient_channel: read_u32(&mut buf)?,
			},
			_ => Message::Other(msg_type),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::protocol::Destination;
	use std::io::Cursor;

	fn rt() -> tokio::runtime::Runtime {
		tokio::runtime::Builder::new_current_thread()
			.build()
			.unwrap()
	}

	#[test]
	fn framing_is_block_aligned_with_min_padding() {
		rt().block_on(async {
			let mut writer = PacketWriter::default();
			let mut reader = PacketReader::default();
			for len in [0_usize, 1, 7, 8, 100, 4096] {
				let payload = vec![0x5a_u8; len];
				let packet = writer.pack(&payload);
				assert_eq!(packet.len() % 8, 0, "len {}", len);
				// 4 length + 1 padlen + payload + at least 4 padding
				assert!(packet.len() >= 4 + 1 + len + 4);
				let parsed = reader
					.read_packet(&mut Cursor::new(packet))
					.await
					.unwrap();
				assert_eq!(parsed, payload);
			}
		});
	}

	#[test]
	fn mac_is_verified_and_sequence_dependent() {
		rt().block_on(async {
			let key = b"tunnel mac key".to_vec();
			let mut writer = PacketWriter::default();
			writer.set_mac_key(key.clone());
			let mut reader = PacketReader::default();
			reader.set_mac_key(key.clone());

			// Two packets, so the reader's sequence numbers advance
			// in step with the writer's.
			let first = writer.pack(b"one");
			let second = writer.pack(b"two");
			assert_eq!(
				reader.read_packet(&mut Cursor::new(first)).await.unwrap(),
				b"one"
			);
			assert_eq!(
				reader
					.read_packet(&mut Cursor::new(second.clone()))
					.await
					.unwrap(),
				b"two"
			);

			// Tampering with the payload trips the MAC.
			let mut tampered = writer.pack(b"three");
			tampered[6] ^= 0xff;
			let mut reader = PacketReader::default();
			reader.set_mac_key(key);
			reader.seq = 2;
			let err = reader
				.read_packet(&mut Cursor::new(tampered))
				.await
				.unwrap_err();
			assert!(matches!(err, SshError::MacMismatch));
		});
	}

	#[test]
	fn banner_roundtrip_keeps_leftover() {
		rt().block_on(async {
			let mut wire = banner_line();
			wire.extend_from_slice(b"\x00\x00\x00\x0c");
			let mut r = tokio::io::BufReader::new(Cursor::new(wire));
			let (banner, leftover) = read_banner(&mut r).await.unwrap();
			assert_eq!(banner, VERSION_BANNER);
			assert_eq!(leftover, b"\x00\x00\x00\x0c");

			let mut r = tokio::io::BufReader::new(Cursor::new(b"TELNET/1.0\r\n".to_vec()));
			assert!(matches!(
				read_banner(&mut r).await,
				Err(SshError::BadBanner)
			));
		});
	}

	#[test]
	fn kexinit_roundtrip() {
		let kexinit = KexInit::default();
		let payload = kexinit.build();
		assert_eq!(payload[0], MsgType::KexInit as u8);
		let parsed = KexInit::parse(&payload).unwrap();
		assert_eq!(parsed, kexinit);
	}

	#[test]
	fn channel_open_layout() {
		let target = TargetAddr {
			dest: Destination::from_str("internal.example").unwrap(),
			port: 5900,
		};
		let originator = "127.0.0.1:40000".parse().unwrap();
		let payload = build_channel_open_direct_tcpip(3, 32768, 32768, &target, originator);

		let mut buf = &payload[..];
		assert_eq!(buf.get_u8(), MsgType::ChannelOpen as u8);
		assert_eq!(read_string(&mut buf).unwrap(), b"direct-tcpip");
		assert_eq!(buf.get_u32(), 3);
		assert_eq!(buf.get_u32(), 32768);
		assert_eq!(buf.get_u32(), 32768);
		assert_eq!(read_string(&mut buf).unwrap(), b"internal.example");
		assert_eq!(buf.get_u32(), 5900);
		assert_eq!(read_string(&mut buf).unwrap(), b"127.0.0.1");
		assert_eq!(buf.get_u32(), 40000);
		assert_eq!(buf.remaining(), 0);
	}

	#[test]
	fn message_parse_channel_traffic() {
		let data_msg = Message::parse(&build_channel_data(7, b"forwarded")).unwrap();
		match data_msg {
			Message::ChannelData {
				recipient_channel,
				data,
			} => {
				assert_eq!(recipient_channel, 7);
				assert_eq!(data, b"forwarded");
			}
			other => panic!("wrong message: {:?}", other),
		}

		assert!(matches!(
			Message::parse(&build_channel_eof(7)).unwrap(),
			Message::ChannelEof {
				recipient_channel: 7
			}
		));
		assert!(matches!(
			Message::parse(&build_channel_close(7)).unwrap(),
			Message::ChannelClose {
				recipient_channel: 7
			}
		));
		assert!(matches!(
			Message::parse(&[MsgType::Ignore as u8]).unwrap(),
			Message::Other(2)
		));
		assert!(Message::parse(&[]).is_err());
	}

	#[test]
	fn userauth_failure_lists_methods() {
		let mut payload = Vec::new();
		payload.put_u8(MsgType::UserauthFailure as u8);
		put_string(&mut payload, b"publickey,password");
		payload.put_u8(0);
		match Message::parse(&payload).unwrap() {
			Message::UserauthFailure {
				methods,
				partial_success,
			} => {
				assert_eq!(methods, ["publickey", "password"]);
				assert!(!partial_success);
			}
			other => panic!("wrong message: {:?}", other),
		}
	}
}
