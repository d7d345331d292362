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

//! Header codecs for IPv4/IPv6, TCP, UDP and ICMP.
//!
//! Parsing never looks past the bytes it was given and building
//! always emits headers in network byte order. Transport checksums
//! are left at zero on build (the kernel or the peer stack fills
//! them in), only the IPv4 header checksum and the ICMP checksum are
//! computed here.

use crate::prelude::*;
use std::fmt;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

pub const TCP_FIN: u16 = 0x001;
pub const TCP_SYN: u16 = 0x002;
pub const TCP_RST: u16 = 0x004;
pub const TCP_PSH: u16 = 0x008;
pub const TCP_ACK: u16 = 0x010;
pub const TCP_URG: u16 = 0x020;
pub const TCP_ECE: u16 = 0x040;
pub const TCP_CWR: u16 = 0x080;
pub const TCP_NS: u16 = 0x100;

const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const TCP_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;
const ICMP_HEADER_LEN: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
	#[error("{0} header truncated")]
	Truncated(&'static str),
	#[error("unknown IP version '{0}'")]
	BadVersion(u8),
	#[error("IPv4 IHL of {0} words is invalid")]
	BadIhl(u8),
}

/// 16 bit one's complement checksum over `data`.
///
/// Bytes are summed as big endian 16 bit words, an odd trailing
/// byte counts as the high byte of a final word, carries are folded
/// back in and the result is inverted.
#[must_use]
pub fn checksum(data: &[u8]) -> u16 {
	let mut sum: u32 = 0;
	let mut chunks = data.chunks_exact(2);
	for word in &mut chunks {
		sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
	}
	if let [last] = chunks.remainder() {
		sum += u32::from(u16::from_be_bytes([*last, 0]));
	}
	while sum > 0xffff {
		sum = (sum & 0xffff) + (sum >> 16);
	}
	#[allow(clippy::cast_possible_truncation)]
	let folded = sum as u16;
	!folded
}

// -------------------------------------------------------
//                         IPv4
// -------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
	pub ihl: u8,
	pub tos: u8,
	pub total_length: u16,
	pub identification: u16,
	/// Upper 3 bits of the flags/fragment word.
	pub flags: u8,
	pub fragment_offset: u16,
	pub ttl: u8,
	pub protocol: u8,
	pub checksum: u16,
	pub src: Ipv4Addr,
	pub dst: Ipv4Addr,
}

impl Ipv4Header {
	/// A header with the usual defaults: don't-fragment, TTL 64, no
	/// options, random identification.
	#[must_use]
	pub fn new(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload_len: u16) -> Self {
		Self {
			ihl: 5,
			tos: 0,
			total_length: IPV4_HEADER_LEN as u16 + payload_len,
			identification: rand::thread_rng().gen(),
			flags: 0x2,
			fragment_offset: 0,
			ttl: 64,
			protocol,
			checksum: 0,
			src,
			dst,
		}
	}

	/// Parse the fixed header, returning it and its length in bytes
	/// (options included but not interpreted).
	///
	/// # Errors
	/// Returns a [`PacketError`] on short input or a bad IHL.
	pub fn parse(data: &[u8]) -> Result<(Self, usize), PacketError> {
		if data.len() < IPV4_HEADER_LEN {
			return Err(PacketError::Truncated("IPv4"));
		}
		let version = data[0] >> 4;
		if version != 4 {
			return Err(PacketError::BadVersion(version));
		}
		let ihl = data[0] & 0x0f;
		let header_len = usize::from(ihl) * 4;
		if ihl < 5 {
			return Err(PacketError::BadIhl(ihl));
		}
		if data.len() < header_len {
			return Err(PacketError::Truncated("IPv4 options"));
		}
		let flags_frag = u16::from_be_bytes([data[6], data[7]]);
		Ok((
			Self {
				ihl,
				tos: data[1],
				total_length: u16::from_be_bytes([data[2], data[3]]),
				identification: u16::from_be_bytes([data[4], data[5]]),
				#[allow(clippy::cast_possible_truncation)]
				flags: (flags_frag >> 13) as u8,
				fragment_offset: flags_frag & 0x1fff,
				ttl: data[8],
				protocol: data[9],
				checksum: u16::from_be_bytes([data[10], data[11]]),
				src: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
				dst: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
			},
			header_len,
		))
	}

	/// Serialize the header, computing the checksum field.
	pub fn write_to(&self, buf: &mut impl BufMut) {
		let mut raw = [0_u8; IPV4_HEADER_LEN];
		raw[0] = (4 << 4) | self.ihl;
		raw[1] = self.tos;
		raw[2..4].copy_from_slice(&self.total_length.to_be_bytes());
		raw[4..6].copy_from_slice(&self.identification.to_be_bytes());
		let flags_frag = (u16::from(self.flags) << 13) | (self.fragment_offset & 0x1fff);
		raw[6..8].copy_from_slice(&flags_frag.to_be_bytes());
		raw[8] = self.ttl;
		raw[9] = self.protocol;
		// raw[10..12] stays zero for the checksum pass
		raw[12..16].copy_from_slice(&self.src.octets());
		raw[16..20].copy_from_slice(&self.dst.octets());
		let sum = checksum(&raw);
		raw[10..12].copy_from_slice(&sum.to_be_bytes());
		buf.put_slice(&raw);
	}
}

// -------------------------------------------------------
//                         IPv6
// -------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv6Header {
	pub traffic_class: u8,
	pub flow_label: u32,
	pub payload_length: u16,
	pub next_header: u8,
	pub hop_limit: u8,
	pub src: Ipv6Addr,
	pub dst: Ipv6Addr,
}

impl Ipv6Header {
	/// # Errors
	/// Returns a [`PacketError`] on short input.
	pub fn parse(data: &[u8]) -> Result<(Self, usize), PacketError> {
		if data.len() < IPV6_HEADER_LEN {
			return Err(PacketError::Truncated("IPv6"));
		}
		let version = data[0] >> 4;
		if version != 6 {
			return Err(PacketError::BadVersion(version));
		}
		let mut src = [0_u8; 16];
		src.copy_from_slice(&data[8..24]);
		let mut dst = [0_u8; 16];
		dst.copy_from_slice(&data[24..40]);
		Ok((
			Self {
				traffic_class: (data[0] << 4) | (data[1] >> 4),
				flow_label: u32::from_be_bytes([0, data[1] & 0x0f, data[2], data[3]]),
				payload_length: u16::from_be_bytes([data[4], data[5]]),
				next_header: data[6],
				hop_limit: data[7],
				src: Ipv6Addr::from(src),
				dst: Ipv6Addr::from(dst),
			},
			IPV6_HEADER_LEN,
		))
	}
}

// -------------------------------------------------------
//                          TCP
// -------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHeader {
	pub src_port: u16,
	pub dst_port: u16,
	pub seq: u32,
	pub ack: u32,
	/// Header length in 32 bit words.
	pub data_offset: u8,
	/// 9 bit flag field, NS included (see the `TCP_*` constants).
	pub flags: u16,
	pub window: u16,
	pub checksum: u16,
	pub urgent: u16,
}

impl TcpHeader {
	#[must_use]
	pub fn new(src_port: u16, dst_port: u16) -> Self {
		Self {
			src_port,
			dst_port,
			seq: 0,
			ack: 0,
			data_offset: 5,
			flags: 0,
			window: 8192,
			checksum: 0,
			urgent: 0,
		}
	}

	/// # Errors
	/// Returns a [`PacketError`] on short input.
	pub fn parse(data: &[u8]) -> Result<(Self, usize), PacketError> {
		if data.len() < TCP_HEADER_LEN {
			return Err(PacketError::Truncated("TCP"));
		}
		let data_offset = data[12] >> 4;
		let header_len = usize::from(data_offset) * 4;
		if header_len < TCP_HEADER_LEN || data.len() < header_len {
			return Err(PacketError::Truncated("TCP options"));
		}
		let flags = (u16::from(data[12] & 0x01) << 8) | u16::from(data[13]);
		Ok((
			Self {
				src_port: u16::from_be_bytes([data[0], data[1]]),
				dst_port: u16::from_be_bytes([data[2], data[3]]),
				seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
				ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
				data_offset,
				flags,
				window: u16::from_be_bytes([data[14], data[15]]),
				checksum: u16::from_be_bytes([data[16], data[17]]),
				urgent: u16::from_be_bytes([data[18], data[19]]),
			},
			header_len,
		))
	}

	pub fn write_to(&self, buf: &mut impl BufMut) {
		buf.put_u16(self.src_port);
		buf.put_u16(self.dst_port);
		buf.put_u32(self.seq);
		buf.put_u32(self.ack);
		#[allow(clippy::cast_possible_truncation)]
		buf.put_u8((self.data_offset << 4) | ((self.flags >> 8) as u8 & 0x01));
		#[allow(clippy::cast_possible_truncation)]
		buf.put_u8(self.flags as u8);
		buf.put_u16(self.window);
		buf.put_u16(self.checksum);
		buf.put_u16(self.urgent);
	}
}

// -------------------------------------------------------
//                          UDP
// -------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpHeader {
	pub src_port: u16,
	pub dst_port: u16,
	pub length: u16,
	pub checksum: u16,
}

impl UdpHeader {
	#[must_use]
	pub fn new(src_port: u16, dst_port: u16, payload_len: u16) -> Self {
		Self {
			src_port,
			dst_port,
			length: UDP_HEADER_LEN as u16 + payload_len,
			checksum: 0,
		}
	}

	/// # Errors
	/// Returns a [`PacketError`] on short input.
	pub fn parse(data: &[u8]) -> Result<(Self, usize), PacketError> {
		if data.len() < UDP_HEADER_LEN {
			return Err(PacketError::Truncated("UDP"));
		}
		Ok((
			Self {
				src_port: u16::from_be_bytes([data[0], data[1]]),
				dst_port: u16::from_be_bytes([data[2], data[3]]),
				length: u16::from_be_bytes([data[4], data[5]]),
				checksum: u16::from_be_bytes([data[6], data[7]]),
			},
			UDP_HEADER_LEN,
		))
	}

	pub fn write_to(&self, buf: &mut impl BufMut) {
		buf.put_u16(self.src_port);
		buf.put_u16(self.dst_port);
		buf.put_u16(self.length);
		buf.put_u16(self.checksum);
	}
}

// -------------------------------------------------------
//                          ICMP
// -------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpHeader {
	pub icmp_type: u8,
	pub code: u8,
	pub checksum: u16,
	pub identifier: u16,
	pub sequence: u16,
}

impl IcmpHeader {
	#[must_use]
	pub fn new(icmp_type: u8, code: u8) -> Self {
		Self {
			icmp_type,
			code,
			checksum: 0,
			identifier: 0,
			sequence: 0,
		}
	}

	/// # Errors
	/// Returns a [`PacketError`] on short input.
	pub fn parse(data: &[u8]) -> Result<(Self, usize), PacketError> {
		if data.len() < ICMP_HEADER_LEN {
			return Err(PacketError::Truncated("ICMP"));
		}
		Ok((
			Self {
				icmp_type: data[0],
				code: data[1],
				checksum: u16::from_be_bytes([data[2], data[3]]),
				identifier: u16::from_be_bytes([data[4], data[5]]),
				sequence: u16::from_be_bytes([data[6], data[7]]),
			},
			ICMP_HEADER_LEN,
		))
	}

	/// Serialize the header with the checksum computed over the
	/// header and `payload`.
	pub fn write_to(&self, payload: &[u8], buf: &mut impl BufMut) {
		let mut raw = Vec::with_capacity(ICMP_HEADER_LEN + payload.len());
		raw.put_u8(self.icmp_type);
		raw.put_u8(self.code);
		raw.put_u16(0);
		raw.put_u16(self.identifier);
		raw.put_u16(self.sequence);
		raw.put_slice(payload);
		let sum = checksum(&raw);
		raw[2..4].copy_from_slice(&sum.to_be_bytes());
		buf.put_slice(&raw[..ICMP_HEADER_LEN]);
	}
}

// -------------------------------------------------------
//                         Packet
// -------------------------------------------------------

#[derive(Debug, Clone)]
pub enum IpHeader {
	V4(Ipv4Header),
	V6(Ipv6Header),
}

impl IpHeader {
	#[must_use]
	pub fn src(&self) -> IpAddr {
		match self {
			IpHeader::V4(h) => IpAddr::V4(h.src),
			IpHeader::V6(h) => IpAddr::V6(h.src),
		}
	}

	#[must_use]
	pub fn dst(&self) -> IpAddr {
		match self {
			IpHeader::V4(h) => IpAddr::V4(h.dst),
			IpHeader::V6(h) => IpAddr::V6(h.dst),
		}
	}

	#[must_use]
	pub fn protocol(&self) -> u8 {
		match self {
			IpHeader::V4(h) => h.protocol,
			IpHeader::V6(h) => h.next_header,
		}
	}
}

#[derive(Debug, Clone)]
pub enum Transport {
	Tcp(TcpHeader),
	Udp(UdpHeader),
	Icmp(IcmpHeader),
	Other(u8),
}

/// A fully parsed IP packet.
#[derive(Debug, Clone)]
pub struct Packet {
	pub ip: IpHeader,
	pub transport: Transport,
	pub payload: Vec<u8>,
}

impl Packet {
	/// Parse a complete packet starting at the IP header, the version
	/// dispatched on the first nibble.
	///
	/// # Errors
	/// Returns a [`PacketError`] on truncation or unknown version.
	pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
		if data.is_empty() {
			return Err(PacketError::Truncated("IP"));
		}
		let (ip, ip_len) = match data[0] >> 4 {
			4 => {
				let (h, len) = Ipv4Header::parse(data)?;
				(IpHeader::V4(h), len)
			}
			6 => {
				let (h, len) = Ipv6Header::parse(data)?;
				(IpHeader::V6(h), len)
			}
			other => return Err(PacketError::BadVersion(other)),
		};
		let rest = &data[ip_len..];
		let (transport, transport_len) = match ip.protocol() {
			IPPROTO_TCP => {
				let (h, len) = TcpHeader::parse(rest)?;
				(Transport::Tcp(h), len)
			}
			IPPROTO_UDP => {
				let (h, len) = UdpHeader::parse(rest)?;
				(Transport::Udp(h), len)
			}
			IPPROTO_ICMP => {
				let (h, len) = IcmpHeader::parse(rest)?;
				(Transport::Icmp(h), len)
			}
			other => (Transport::Other(other), 0),
		};
		Ok(Self {
			ip,
			transport,
			payload: rest[transport_len..].to_vec(),
		})
	}
}

impl fmt::Display for Packet {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.transport {
			Transport::Tcp(t) => write!(
				f,
				"TCP {}:{} -> {}:{} flags {:#05x} seq {} payload {}B",
				self.ip.src(),
				t.src_port,
				self.ip.dst(),
				t.dst_port,
				t.flags,
				t.seq,
				self.payload.len()
			),
			Transport::Udp(u) => write!(
				f,
				"UDP {}:{} -> {}:{} payload {}B",
				self.ip.src(),
				u.src_port,
				self.ip.dst(),
				u.dst_port,
				self.payload.len()
			),
			Transport::Icmp(i) => write!(
				f,
				"ICMP type {} code {} {} -> {} payload {}B",
				i.icmp_type,
				i.code,
				self.ip.src(),
				self.ip.dst(),
				self.payload.len()
			),
			Transport::Other(proto) => write!(
				f,
				"proto {} {} -> {} payload {}B",
				proto,
				self.ip.src(),
				self.ip.dst(),
				self.payload.len()
			),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn checksum_folds_carries() {
		// RFC 1071 worked example.
		let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
		assert_eq!(checksum(&data), 0x220d);
	}

	#[test]
	fn checksum_odd_trailing_byte_is_high_byte() {
		assert_eq!(checksum(&[0xff]), !0xff00);
		assert_eq!(checksum(&[0x12, 0x34, 0x56]), !0x6834_u16);
	}

	#[test]
	fn ipv4_checksum_verifies_after_rebuild() {
		let header = Ipv4Header::new(
			Ipv4Addr::new(10, 0, 0, 1),
			Ipv4Addr::new(10, 0, 0, 2),
			IPPROTO_TCP,
			20,
		);
		let mut raw = Vec::new();
		header.write_to(&mut raw);

		let (parsed, len) = Ipv4Header::parse(&raw).unwrap();
		assert_eq!(len, 20);
		assert_eq!(parsed.ttl, 64);
		assert_eq!(parsed.flags, 0x2);
		assert_eq!(parsed.total_length, 40);
		assert_eq!(parsed.src, header.src);
		assert_eq!(parsed.dst, header.dst);

		// Zero the checksum field and recompute, it must match the
		// value on the wire.
		let mut zeroed = raw.clone();
		zeroed[10] = 0;
		zeroed[11] = 0;
		assert_eq!(checksum(&zeroed[..20]), parsed.checksum);
		// And summing the header with the checksum in place
		// gives zero.
		assert_eq!(checksum(&raw[..20]), 0);
	}

	#[test]
	fn tcp_flags_cover_all_nine_bits() {
		let mut header = TcpHeader::new(1234, 80);
		header.flags = TCP_NS | TCP_CWR | TCP_SYN | TCP_FIN;
		let mut raw = Vec::new();
		header.write_to(&mut raw);
		assert_eq!(raw.len(), 20);

		let (parsed, len) = TcpHeader::parse(&raw).unwrap();
		assert_eq!(len, 20);
		assert_eq!(parsed.flags, TCP_NS | TCP_CWR | TCP_SYN | TCP_FIN);
		assert_eq!(parsed.data_offset, 5);
		assert_eq!(parsed.window, 8192);
	}

	#[test]
	fn udp_length_counts_header() {
		let header = UdpHeader::new(5353, 53, 100);
		assert_eq!(header.length, 108);
		let mut raw = Vec::new();
		header.write_to(&mut raw);
		let (parsed, _) = UdpHeader::parse(&raw).unwrap();
		assert_eq!(parsed, header);
	}

	#[test]
	fn icmp_checksum_covers_payload() {
		let header = IcmpHeader::new(8, 0);
		let mut with_payload = Vec::new();
		header.write_to(b"abcdefgh", &mut with_payload);
		let mut without = Vec::new();
		header.write_to(b"", &mut without);
		let (a, _) = IcmpHeader::parse(&with_payload).unwrap();
		let (b, _) = IcmpHeader::parse(&without).unwrap();
		assert_ne!(a.checksum, b.checksum);

		// Sum over header plus payload with the stored checksum in
		// place must be zero.
		let mut full = with_payload.clone();
		full.extend_from_slice(b"abcdefgh");
		assert_eq!(checksum(&full), 0);
	}

	#[test]
	fn ipv6_header_fields() {
		let mut raw = vec![0_u8; 40];
		raw[0] = (6 << 4) | 0x0a; // traffic class 0xa5
		raw[1] = 0x51;
		raw[2] = 0x23;
		raw[3] = 0x45;
		raw[4..6].copy_from_slice(&1280_u16.to_be_bytes());
		raw[6] = IPPROTO_UDP;
		raw[7] = 255;
		raw[23] = 1; // src ::1
		raw[39] = 2; // dst ::2

		let (parsed, len) = Ipv6Header::parse(&raw).unwrap();
		assert_eq!(len, 40);
		assert_eq!(parsed.traffic_class, 0xa5);
		assert_eq!(parsed.flow_label, 0x12345);
		assert_eq!(parsed.payload_length, 1280);
		assert_eq!(parsed.next_header, IPPROTO_UDP);
		assert_eq!(parsed.hop_limit, 255);
		assert_eq!(parsed.src, "::1".parse::<Ipv6Addr>().unwrap());
		assert_eq!(parsed.dst, "::2".parse::<Ipv6Addr>().unwrap());
	}

	#[test]
	fn packet_parse_dispatches_on_version_and_protocol() {
		let mut raw = Vec::new();
		Ipv4Header::new(
			Ipv4Addr::new(192, 168, 1, 1),
			Ipv4Addr::new(192, 168, 1, 2),
			IPPROTO_UDP,
			8 + 4,
		)
		.write_to(&mut raw);
		UdpHeader::new(1000, 2000, 4).write_to(&mut raw);
		raw.extend_from_slice(b"ping");

		let packet = Packet::parse(&raw).unwrap();
		assert_eq!(packet.ip.dst(), "192.168.1.2".parse::<IpAddr>().unwrap());
		match &packet.transport {
			Transport::Udp(u) => {
				assert_eq!(u.src_port, 1000);
				assert_eq!(u.dst_port, 2000);
			}
			other => panic!("wrong transport: {:?}", other),
		}
		assert_eq!(packet.payload, b"ping");

		// Version 4, IHL 5, cut short after three bytes.
		assert!(matches!(
			Packet::parse(&[0x45, 0, 0]),
			Err(PacketError::Truncated(_))
		));
		assert!(matches!(
			Packet::parse(&[0xf0; 40]),
			Err(PacketError::BadVersion(15))
		));
	}
}
