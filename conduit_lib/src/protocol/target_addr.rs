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

use crate::prelude::*;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use smol_str::SmolStr;
use std::{
	fmt::{self, Display},
	io,
	net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
	str::FromStr,
};
use tokio::net::TcpStream;

const EMPTY_STRING: &str = "empty string";

// See more at <https://tools.ietf.org/html/rfc1928>
#[derive(Debug, Clone, Copy, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum AddrType {
	Ipv4 = 1_u8,
	Name = 3_u8,
	Ipv6 = 4_u8,
}

impl AddrType {
	#[inline]
	#[must_use]
	pub const fn val(self) -> u8 {
		self as u8
	}
}

#[derive(Debug, thiserror::Error)]
pub enum AddrError {
	#[error("str is not utf8 ({0})")]
	StrNotUtf8(std::str::Utf8Error),
	#[error("unknown address type {0}")]
	UnknownAddressType(u8),
	#[error("invalid domain ({0})")]
	InvalidDomain(BoxStdErr),
	#[error("invalid port ({0})")]
	InvalidPort(BoxStdErr),
	#[error("invalid address ({0})")]
	InvalidAddress(BoxStdErr),
	#[error("IO error ({0})")]
	Io(#[from] io::Error),
}

impl AddrError {
	#[must_use]
	pub fn into_io_err(self) -> io::Error {
		if let Self::Io(e) = self {
			e
		} else {
			io::Error::new(io::ErrorKind::InvalidData, self)
		}
	}
}

// -------------------------------------------------------
//                      Destination
// -------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Destination {
	/// Must be a valid domain name.
	Name(DomainName),
	Ip(IpAddr),
}

impl Destination {
	#[inline]
	#[must_use]
	pub fn new_ip(ip: impl Into<IpAddr>) -> Self {
		Self::Ip(ip.into())
	}

	/// Create a new `Destination` from a domain string.
	///
	/// # Errors
	/// Returns an [`AddrError`] if `value` is not a valid domain name.
	#[inline]
	pub fn new_domain(value: impl AsRef<str>) -> Result<Self, AddrError> {
		DomainName::from_str(value.as_ref()).map(Destination::Name)
	}

	#[inline]
	#[must_use]
	pub fn atyp(&self) -> AddrType {
		match self {
			Destination::Name(_) => AddrType::Name,
			Destination::Ip(IpAddr::V4(_)) => AddrType::Ipv4,
			Destination::Ip(IpAddr::V6(_)) => AddrType::Ipv6,
		}
	}

	#[inline]
	#[must_use]
	pub fn to_str(&self) -> Cow<'_, str> {
		match self {
			Destination::Name(name) => Cow::Borrowed(name.as_str()),
			Destination::Ip(ip) => Cow::Owned(ip.to_string()),
		}
	}

	/// Read a destination of address type `atyp` from `r`.
	///
	/// The format for each address type:
	/// - [`AddrType::Ipv4`]: | 4 bytes |
	/// - [`AddrType::Ipv6`]: | 16 bytes |
	/// - [`AddrType::Name`]: | n, 1 byte | n bytes |
	///
	/// # Errors
	/// Returns an [`AddrError`] if reading fails or the data is invalid.
	pub async fn read_from_atyp(
		r: &mut (impl AsyncRead + Unpin),
		atyp: AddrType,
	) -> Result<Self, AddrError> {
		Ok(match atyp {
			AddrType::Ipv4 => Ipv4Addr::from(r.read_u32().await?).into(),
			AddrType::Ipv6 => Ipv6Addr::from(r.read_u128().await?).into(),
			AddrType::Name => {
				let len = r.read_u8().await?;
				if len == 0 {
					return Err(AddrError::InvalidDomain(EMPTY_STRING.into()));
				}
				// Domain length is a u8, never larger than 256.
				let mut buffer = [0_u8; 256];
				let buffer = &mut buffer[..len as usize];
				r.read_exact(buffer).await?;
				let name = std::str::from_utf8(buffer).map_err(AddrError::StrNotUtf8)?;
				Destination::from_str(name)?
			}
		})
	}

	pub fn write_to_no_atyp(&self, buf: &mut impl BufMut) {
		match self {
			Destination::Name(name) => {
				buf.put_u8(name.len());
				buf.put(name.as_bytes());
			}
			Destination::Ip(ip) => match ip {
				IpAddr::V4(ipv4) => {
					buf.put(&ipv4.octets()[..]);
				}
				IpAddr::V6(ipv6) => {
					buf.put(&ipv6.octets()[..]);
				}
			},
		}
	}

	/// Minimal buffer length needed for the serialized data,
	/// ATYP byte included.
	#[inline]
	#[must_use]
	pub fn serialized_len_atyp(&self) -> usize {
		1 + match self {
			Destination::Ip(ip) => match ip {
				IpAddr::V4(_) => 4,
				IpAddr::V6(_) => 16,
			},
			Destination::Name(name) => 1 + name.len() as usize,
		}
	}
}

impl FromStr for Destination {
	type Err = AddrError;
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		if s.is_empty() {
			return Err(AddrError::InvalidDomain(EMPTY_STRING.into()));
		}
		if let Ok(ip) = IpAddr::from_str(s) {
			return Ok(Self::Ip(ip));
		}
		DomainName::from_str(s).map(Self::Name)
	}
}

impl From<DomainName> for Destination {
	#[inline]
	fn from(domain: DomainName) -> Self {
		Self::Name(domain)
	}
}

impl From<Ipv4Addr> for Destination {
	#[inline]
	fn from(ip: Ipv4Addr) -> Self {
		Self::Ip(ip.into())
	}
}

impl From<Ipv6Addr> for Destination {
	#[inline]
	fn from(ip: Ipv6Addr) -> Self {
		Self::Ip(ip.into())
	}
}

impl From<IpAddr> for Destination {
	#[inline]
	fn from(ip: IpAddr) -> Self {
		Self::Ip(ip)
	}
}

impl Display for Destination {
	#[inline]
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Ip(ip) => ip.fmt(f),
			Self::Name(name) => name.fmt(f),
		}
	}
}

// -------------------------------------------------------
//                       TargetAddr
// -------------------------------------------------------

/// A destination plus port, written on the wire in
/// [SOCKS5 address format]:
///
/// ```not_rust
/// +------+----------------+----------------+
/// | ATYP |  Destination   |     Port       |
/// +------+----------------+----------------+
/// | u8   | various bytes  |   2 bytes      |
/// |      |                | big endian u16 |
/// +------+----------------+----------------+
/// ```
///
/// [SOCKS5 address format]: https://tools.ietf.org/html/rfc1928#section-5
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TargetAddr {
	pub dest: Destination,
	pub port: u16,
}

impl TargetAddr {
	#[inline]
	#[must_use]
	pub fn new(dest: Destination, port: u16) -> Self {
		Self { dest, port }
	}

	/// Read an address in SOCKS5 format (ATYP, destination, port).
	///
	/// # Errors
	/// Returns an [`AddrError`] if reading fails or the data is invalid.
	pub async fn read_from<R>(r: &mut R) -> Result<Self, AddrError>
	where
		R: AsyncRead + Unpin,
	{
		let atyp_num = r.read_u8().await?;
		let atyp =
			AddrType::try_from(atyp_num).map_err(|_| AddrError::UnknownAddressType(atyp_num))?;
		let dest = Destination::read_from_atyp(r, atyp).await?;
		let port = r.read_u16().await?;
		Ok(Self::new(dest, port))
	}

	/// Write the address into `buf` in SOCKS5 format.
	#[inline]
	pub fn write_to<B: BufMut>(&self, buf: &mut B) {
		buf.put_u8(self.dest.atyp().val());
		self.dest.write_to_no_atyp(buf);
		buf.put_u16(self.port);
	}

	/// Number of bytes the serialized address will take.
	#[inline]
	#[must_use]
	pub fn serialized_len_atyp(&self) -> usize {
		self.dest.serialized_len_atyp() + 2
	}

	/// Open a TCP connection to this address, resolving the domain
	/// with the system resolver if needed.
	///
	/// # Errors
	/// Returns the connect error.
	pub async fn dial(&self) -> io::Result<TcpStream> {
		match &self.dest {
			Destination::Ip(ip) => TcpStream::connect(SocketAddr::new(*ip, self.port)).await,
			Destination::Name(name) => {
				TcpStream::connect((name.as_str(), self.port)).await
			}
		}
	}

	/// Parse string `s` with an optional default port.
	///
	/// With `default_port` set, both 'host:port' and 'host' are
	/// acceptable, otherwise the port section is mandatory.
	///
	/// # Errors
	/// Returns an [`AddrError`] on invalid host or port.
	pub fn parse_str(s: &str, default_port: Option<u16>) -> Result<Self, AddrError> {
		if let Ok(addr) = s.parse::<SocketAddr>() {
			return Ok(addr.into());
		}
		if s.is_empty() {
			return Err(AddrError::InvalidAddress(EMPTY_STRING.into()));
		}
		let mut parts = s.split_terminator(':');

		let dest = {
			let host_str = parts
				.next()
				.ok_or_else(|| AddrError::InvalidAddress("missing domain/IP".into()))?;
			Destination::from_str(host_str)?
		};

		let port = if let Some(port_str) = parts.next() {
			if port_str.is_empty() {
				return Err(AddrError::InvalidPort(EMPTY_STRING.into()));
			}
			port_str
				.parse::<u16>()
				.map_err(|err| AddrError::InvalidPort(err.into()))?
		} else {
			default_port.ok_or_else(|| AddrError::InvalidAddress("missing port".into()))?
		};

		Ok(Self { dest, port })
	}
}

impl FromStr for TargetAddr {
	type Err = AddrError;
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::parse_str(s, None)
	}
}

impl Display for TargetAddr {
	#[inline]
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.dest {
			Destination::Name(name) => write!(f, "{}:{}", name, self.port),
			Destination::Ip(ip) => SocketAddr::new(*ip, self.port).fmt(f),
		}
	}
}

impl From<SocketAddr> for TargetAddr {
	#[inline]
	fn from(addr: SocketAddr) -> Self {
		Self {
			dest: addr.ip().into(),
			port: addr.port(),
		}
	}
}

impl From<(Destination, u16)> for TargetAddr {
	#[inline]
	fn from((dest, port): (Destination, u16)) -> Self {
		Self { dest, port }
	}
}

impl From<(IpAddr, u16)> for TargetAddr {
	#[inline]
	fn from((ip, port): (IpAddr, u16)) -> Self {
		Self {
			dest: Destination::Ip(ip),
			port,
		}
	}
}

impl From<(Ipv4Addr, u16)> for TargetAddr {
	#[inline]
	fn from((ip, port): (Ipv4Addr, u16)) -> Self {
		Self {
			dest: Destination::Ip(ip.into()),
			port,
		}
	}
}

#[cfg(feature = "use_serde")]
mod serde_internal {
	use super::TargetAddr;
	use serde::{de::Visitor, Deserialize, Serialize};
	use std::{
		fmt::{self, Formatter},
		str::FromStr,
	};

	impl<'de> Deserialize<'de> for TargetAddr {
		fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
		where
			D: serde::Deserializer<'de>,
		{
			struct AddressVisitor;

			impl<'de> Visitor<'de> for AddressVisitor {
				type Value = TargetAddr;

				fn expecting(&self, formatter: &mut Formatter) -> fmt::Result {
					formatter.write_str("[IP/Domain]:[Port]")
				}

				fn visit_str<E>(self, value: &str) -> Result<TargetAddr, E>
				where
					E: serde::de::Error,
				{
					TargetAddr::from_str(value).map_err(serde::de::Error::custom)
				}
			}

			deserializer.deserialize_str(AddressVisitor)
		}
	}

	impl Serialize for TargetAddr {
		fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
		where
			S: serde::Serializer,
		{
			let val = self.to_string();
			serializer.serialize_str(&val)
		}
	}
}

// -------------------------------------------------------
//                     DomainName
// -------------------------------------------------------

/// A domain string that's guaranteed to be at most 255 bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct DomainName(SmolStr);

impl DomainName {
	#[inline]
	#[must_use]
	pub fn as_str(&self) -> &str {
		self.0.as_str()
	}

	#[allow(clippy::cast_possible_truncation)]
	#[inline]
	#[must_use]
	pub fn len(&self) -> u8 {
		// Length is guaranteed to be u8
		self.0.len() as u8
	}

	#[inline]
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	#[inline]
	#[must_use]
	pub fn as_bytes(&self) -> &[u8] {
		self.0.as_bytes()
	}
}

impl std::str::FromStr for DomainName {
	type Err = AddrError;

	fn from_str(v: &str) -> Result<Self, AddrError> {
		if v.is_empty() {
			return Err(AddrError::InvalidDomain(EMPTY_STRING.into()));
		}
		if v.len() > 255 {
			return Err(AddrError::InvalidDomain("too long".into()));
		}
		// Remove the final dot '.' if possible.
		let v = v.strip_suffix('.').unwrap_or(v);
		let name =
			idna::domain_to_ascii_strict(v).map_err(|e| AddrError::InvalidDomain(e.into()))?;
		Ok(Self(SmolStr::new(&name)))
	}
}

impl AsRef<str> for DomainName {
	#[inline]
	fn as_ref(&self) -> &str {
		self.0.as_ref()
	}
}

impl Display for DomainName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		Display::fmt(&self.0, f)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Cursor;

	fn roundtrip(addr: &TargetAddr) -> TargetAddr {
		let mut buf = Vec::with_capacity(addr.serialized_len_atyp());
		addr.write_to(&mut buf);
		assert_eq!(buf.len(), addr.serialized_len_atyp());
		let rt = tokio::runtime::Builder::new_current_thread()
			.build()
			.unwrap();
		rt.block_on(async { TargetAddr::read_from(&mut Cursor::new(buf)).await.unwrap() })
	}

	#[test]
	fn addr_roundtrip_every_type() {
		let addrs = [
			TargetAddr::from((Ipv4Addr::new(1, 2, 3, 4), 80)),
			TargetAddr::from((IpAddr::V6(Ipv6Addr::new(1, 2, 3, 4, 5, 6, 7, 8)), 443)),
			TargetAddr::new(Destination::new_domain("example.com").unwrap(), 8080),
		];
		for addr in &addrs {
			assert_eq!(&roundtrip(addr), addr);
		}
	}

	#[test]
	fn parse_str_with_default_port() {
		let addr = TargetAddr::parse_str("example.com", Some(443)).unwrap();
		assert_eq!(addr.port, 443);
		let addr = TargetAddr::parse_str("example.com:80", Some(443)).unwrap();
		assert_eq!(addr.port, 80);
		assert!(TargetAddr::parse_str("example.com", None).is_err());
		assert!(TargetAddr::parse_str("", Some(1)).is_err());
	}

	#[test]
	fn parse_str_socket_addr() {
		let addr = TargetAddr::parse_str("127.0.0.1:1080", None).unwrap();
		assert_eq!(
			addr,
			TargetAddr::from((Ipv4Addr::new(127, 0, 0, 1), 1080))
		);
	}
}
