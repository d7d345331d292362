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

use crate::{prelude::*, protocol::AddrError};
use num_enum::TryFromPrimitive;
use std::{fmt::Display, io};

pub const VER4: u8 = 4;
pub const VER5: u8 = 5;
/// Subnegotiation version.
///
/// See more at <https://datatracker.ietf.org/doc/html/rfc1929#section-2>
pub const SUB_VERS: u8 = 1_u8;
pub(super) const AUTH_SUCCESSFUL: u8 = 0;
pub(super) const AUTH_FAILED: u8 = 0xff;
pub(super) const VAL_NO_AUTH: u8 = 0_u8;
pub(super) const VAL_USER_PASS: u8 = 2_u8;

/// SOCKS4 reply codes, offset by 90 per the original protocol note.
pub(super) const V4_GRANTED: u8 = 0x5a;
pub(super) const V4_REJECTED: u8 = 0x5b;

pub(super) const MAX_USERID_LEN: usize = 255;

#[derive(Debug, TryFromPrimitive, PartialEq, Eq, Copy, Clone)]
#[repr(u8)]
pub enum CommandCode {
	Connect = 1,
	Bind = 2,
	Udp = 3,
}

impl Display for CommandCode {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			CommandCode::Connect => write!(f, "CONNECT"),
			CommandCode::Bind => write!(f, "BIND"),
			CommandCode::Udp => write!(f, "UDP_ASSOCIATE"),
		}?;
		write!(f, "({})", *self as u8)
	}
}

#[derive(PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum AcceptableMethod {
	NoAuthentication = VAL_NO_AUTH,
	UsernamePassword = VAL_USER_PASS,
}

/// SOCKS5 reply code.
///
/// See more at <https://datatracker.ietf.org/doc/html/rfc1928#section-6>.
#[derive(Debug, TryFromPrimitive, PartialEq, Eq, Copy, Clone)]
#[repr(u8)]
pub enum ReplyCode {
	Succeeded = 0,
	SocksFailure = 1,
	NotAllowedByRuleset = 2,
	NetworkUnreachable = 3,
	HostUnreachable = 4,
	ConnectionsRefused = 5,
	TtlExpired = 6,
	CommandNotSupported = 7,
	AddressTypeNotSupported = 8,
}

impl ReplyCode {
	#[must_use]
	pub const fn as_str(self) -> &'static str {
		match self {
			ReplyCode::Succeeded => "succeeded",
			ReplyCode::SocksFailure => "socks failure",
			ReplyCode::NotAllowedByRuleset => "not allowed by ruleset",
			ReplyCode::NetworkUnreachable => "network unreachable",
			ReplyCode::HostUnreachable => "host unreachable",
			ReplyCode::ConnectionsRefused => "connection refused",
			ReplyCode::TtlExpired => "ttl expired",
			ReplyCode::CommandNotSupported => "command not supported",
			ReplyCode::AddressTypeNotSupported => "address type not supported",
		}
	}

	#[inline]
	#[must_use]
	pub const fn val(self) -> u8 {
		self as u8
	}

	/// Map a connect failure to the reply code a client gets.
	#[must_use]
	pub fn from_io_err(e: &io::Error) -> Self {
		match e.kind() {
			io::ErrorKind::ConnectionRefused => ReplyCode::ConnectionsRefused,
			io::ErrorKind::TimedOut => ReplyCode::HostUnreachable,
			io::ErrorKind::AddrNotAvailable => ReplyCode::NetworkUnreachable,
			_ => ReplyCode::SocksFailure,
		}
	}
}

impl Display for ReplyCode {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("wrong socks version '{0}'")]
	WrongVersion(u8),
	#[error("no acceptable authentication method in '{0:?}'")]
	UnsupportedMethod(Vec<u8>),
	#[error("unknown command code '{0}'")]
	UnknownCommand(u8),
	#[error("unsupported command {0}")]
	UnsupportedCommand(CommandCode),
	#[error("failed authentication")]
	FailedAuthentication,
	#[error("cannot read address ({0})")]
	CannotReadAddr(AddrError),
	#[error("{0}")]
	Custom(BoxStdErr),
}

/// Authentication methods offered by the client.
///
///```not_rust
/// +----+----------+----------+
/// |VER | NMETHODS | METHODS  |
/// +----+----------+----------+
/// | 1  |    1     | 1 to 255 |
/// +----+----------+----------+
///```
pub(super) struct Methods(pub Vec<u8>);

impl Methods {
	/// Read the method list. The version byte is expected to have
	/// been consumed already by the version sniffing.
	pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Self> {
		let count = r.read_u8().await?;
		let mut methods = vec![0_u8; usize::from(count)];
		r.read_exact(&mut methods).await?;
		Ok(Self(methods))
	}

	/// Pick the method the server accepts, username/password when
	/// authentication is configured, no-auth otherwise.
	pub fn choose(&self, auth_required: bool) -> Option<AcceptableMethod> {
		if auth_required {
			self.0
				.contains(&VAL_USER_PASS)
				.then(|| AcceptableMethod::UsernamePassword)
		} else {
			self.0
				.contains(&VAL_NO_AUTH)
				.then(|| AcceptableMethod::NoAuthentication)
		}
	}
}

/// RFC 1929 username/password pair.
pub(super) struct Authentication {
	pub user: Vec<u8>,
	pub pass: Vec<u8>,
}

impl Authentication {
	///```not_rust
	/// +----+------+----------+------+----------+
	/// |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
	/// +----+------+----------+------+----------+
	/// | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
	/// +----+------+----------+------+----------+
	///```
	pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, Error> {
		let ver = r.read_u8().await.map_err(custom_io)?;
		if ver != SUB_VERS {
			return Err(Error::WrongVersion(ver));
		}
		let ulen = r.read_u8().await.map_err(custom_io)?;
		let mut user = vec![0_u8; usize::from(ulen)];
		r.read_exact(&mut user).await.map_err(custom_io)?;
		let plen = r.read_u8().await.map_err(custom_io)?;
		let mut pass = vec![0_u8; usize::from(plen)];
		r.read_exact(&mut pass).await.map_err(custom_io)?;
		Ok(Self { user, pass })
	}
}

fn custom_io(e: io::Error) -> Error {
	Error::Custom(e.into())
}

/// SOCKS5 request or reply.
pub struct Request {
	pub code: u8,
	pub addr: TargetAddr,
}

pub type Reply = Request;

impl Request {
	///```not_rust
	/// +----+-----+-------+------+-------------------+----------+
	/// |VER | CMD |  RSV  | ATYP | DST.ADDR/BND.ADDR | DST.PORT |
	/// +----+-----+-------+------+-------------------+----------+
	/// | 1  |  1  | X'00' |  1   |     Variable      |    2     |
	/// +----+-----+-------+------+-------------------+----------+
	///```
	/// The version byte is expected to have been consumed already.
	pub async fn read_no_ver<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, Error> {
		let code = r.read_u8().await.map_err(custom_io)?;
		let _rsv = r.read_u8().await.map_err(custom_io)?;
		let addr = TargetAddr::read_from(r)
			.await
			.map_err(Error::CannotReadAddr)?;
		Ok(Self { code, addr })
	}

	pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, Error> {
		let ver = r.read_u8().await.map_err(custom_io)?;
		if ver != VER5 {
			return Err(Error::WrongVersion(ver));
		}
		Self::read_no_ver(r).await
	}

	pub fn write_into(&self, buf: &mut Vec<u8>) {
		buf.clear();
		buf.put_u8(VER5);
		buf.put_u8(self.code);
		buf.put_u8(0);
		self.addr.write_to(buf);
	}
}

/// SOCKS4 request, version byte already consumed.
///
///```not_rust
/// +----+-----+----------+--------+--------+------+
/// |VER | CMD | DST.PORT | DST.IP | USERID | NULL |
/// +----+-----+----------+--------+--------+------+
/// | 1  |  1  |    2     |   4    |  Var.  |  1   |
/// +----+-----+----------+--------+--------+------+
///```
/// A destination of `0.0.0.x` (x non-zero) marks a SOCKS4a request,
/// followed by a null terminated domain name.
pub(super) struct V4Request {
	pub code: u8,
	pub addr: TargetAddr,
	pub user_id: Vec<u8>,
	/// Port and IP exactly as the client sent them, echoed in the
	/// reply.
	pub raw_port: u16,
	pub raw_ip: [u8; 4],
}

impl V4Request {
	pub async fn read_no_ver<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, Error> {
		let code = r.read_u8().await.map_err(custom_io)?;
		let raw_port = r.read_u16().await.map_err(custom_io)?;
		let mut raw_ip = [0_u8; 4];
		r.read_exact(&mut raw_ip).await.map_err(custom_io)?;
		let user_id = read_z_string(r).await?;
		let dest = if raw_ip[..3] == [0, 0, 0] && raw_ip[3] != 0 {
			// SOCKS4a
			let domain = read_z_string(r).await?;
			let domain = String::from_utf8(domain)
				.map_err(|e| Error::Custom(e.into()))?;
			Destination::new_domain(&domain).map_err(Error::CannotReadAddr)?
		} else {
			Destination::new_ip(Ipv4Addr::from(raw_ip))
		};
		Ok(Self {
			code,
			addr: TargetAddr::new(dest, raw_port),
			user_id,
			raw_port,
			raw_ip,
		})
	}
}

async fn read_z_string<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>, Error> {
	let mut data = Vec::new();
	loop {
		let b = r.read_u8().await.map_err(custom_io)?;
		if b == 0 {
			return Ok(data);
		}
		if data.len() >= MAX_USERID_LEN {
			return Err(Error::Custom("SOCKS4 string too long".into()));
		}
		data.push(b);
	}
}

///```not_rust
/// +----+-----+----------+--------+
/// | VN | REP | DST.PORT | DST.IP |
/// +----+-----+----------+--------+
/// | 1  |  1  |    2     |   4    |
/// +----+-----+----------+--------+
///```
#[must_use]
pub(super) fn make_v4_reply(code: u8, port: u16, ip: [u8; 4]) -> [u8; 8] {
	let p = port.to_be_bytes();
	[0, code, p[0], p[1], ip[0], ip[1], ip[2], ip[3]]
}
