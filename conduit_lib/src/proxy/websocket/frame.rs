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

//! RFC 6455 frame codec.
//!
//!```not_rust
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |           (16/64)             |
//! |N|V|V|V|       |S|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |     Masking-key (if MASK)     |          Payload Data         |
//! +-------------------------------+-------------------------------+
//!```

use crate::prelude::*;
use num_enum::TryFromPrimitive;
use std::io;

/// Refuse frames bigger than this.
const MAX_PAYLOAD_LEN: u64 = 16 * 1024 * 1024;

#[derive(Debug, TryFromPrimitive, PartialEq, Eq, Copy, Clone)]
#[repr(u8)]
pub enum OpCode {
	Continuation = 0x0,
	Text = 0x1,
	Binary = 0x2,
	Close = 0x8,
	Ping = 0x9,
	Pong = 0xa,
}

impl OpCode {
	#[inline]
	#[must_use]
	pub fn is_control(self) -> bool {
		matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
	}
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
	#[error("IO error ({0})")]
	Io(#[from] io::Error),
	#[error("unknown opcode '{0:#x}'")]
	UnknownOpCode(u8),
	#[error("payload of {0} bytes is too large")]
	PayloadTooLarge(u64),
	#[error("control frame payload longer than 125 bytes")]
	ControlTooLong,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
	pub fin: bool,
	pub opcode: OpCode,
	pub payload: Vec<u8>,
}

impl Frame {
	#[inline]
	#[must_use]
	pub fn new(opcode: OpCode, payload: Vec<u8>) -> Self {
		Self {
			fin: true,
			opcode,
			payload,
		}
	}

	/// A close frame with a status code and UTF-8 reason.
	#[must_use]
	pub fn close(code: u16, reason: &str) -> Self {
		let mut payload = Vec::with_capacity(2 + reason.len());
		payload.put_u16(code);
		payload.put_slice(reason.as_bytes());
		Self::new(OpCode::Close, payload)
	}

	/// Read a single frame, unmasking the payload when needed.
	///
	/// # Errors
	/// Returns a [`FrameError`] on IO failure or malformed framing.
	pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, FrameError> {
		let b0 = r.read_u8().await?;
		let b1 = r.read_u8().await?;
		let fin = b0 & 0x80 != 0;
		let opcode_val = b0 & 0x0f;
		let opcode =
			OpCode::try_from(opcode_val).map_err(|_| FrameError::UnknownOpCode(opcode_val))?;
		let masked = b1 & 0x80 != 0;
		let len = match b1 & 0x7f {
			126 => u64::from(r.read_u16().await?),
			127 => r.read_u64().await?,
			short => u64::from(short),
		};
		if len > MAX_PAYLOAD_LEN {
			return Err(FrameError::PayloadTooLarge(len));
		}
		if opcode.is_control() && len > 125 {
			return Err(FrameError::ControlTooLong);
		}
		let mask_key = if masked {
			let mut key = [0_u8; 4];
			r.read_exact(&mut key).await?;
			Some(key)
		} else {
			None
		};
		#[allow(clippy::cast_possible_truncation)]
		let mut payload = vec![0_u8; len as usize];
		r.read_exact(&mut payload).await?;
		if let Some(key) = mask_key {
			mask_in_place(&mut payload, key);
		}
		Ok(Self {
			fin,
			opcode,
			payload,
		})
	}

	/// Serialize the frame, masking with a random key if `mask` is
	/// set (client to server direction).
	pub fn write_to(&self, buf: &mut impl BufMut, mask: bool) {
		let mut b0 = self.opcode as u8;
		if self.fin {
			b0 |= 0x80;
		}
		buf.put_u8(b0);
		let mask_bit = if mask { 0x80 } else { 0 };
		let len = self.payload.len();
		if len < 126 {
			#[allow(clippy::cast_possible_truncation)]
			buf.put_u8(mask_bit | len as u8);
		} else if len <= usize::from(u16::MAX) {
			buf.put_u8(mask_bit | 126);
			#[allow(clippy::cast_possible_truncation)]
			buf.put_u16(len as u16);
		} else {
			buf.put_u8(mask_bit | 127);
			buf.put_u64(len as u64);
		}
		if mask {
			let key: [u8; 4] = rand::thread_rng().gen();
			buf.put_slice(&key);
			let mut payload = self.payload.clone();
			mask_in_place(&mut payload, key);
			buf.put_slice(&payload);
		} else {
			buf.put_slice(&self.payload);
		}
	}

	/// Write the frame into `w` and flush.
	///
	/// # Errors
	/// Returns the IO error from the underlying stream.
	pub async fn write<W: AsyncWrite + Unpin>(&self, w: &mut W, mask: bool) -> io::Result<()> {
		let mut buf = Vec::with_capacity(self.payload.len() + 14);
		self.write_to(&mut buf, mask);
		w.write_all(&buf).await?;
		w.flush().await
	}
}

fn mask_in_place(payload: &mut [u8], key: [u8; 4]) {
	for (i, byte) in payload.iter_mut().enumerate() {
		*byte ^= key[i % 4];
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Cursor;

	fn rt() -> tokio::runtime::Runtime {
		tokio::runtime::Builder::new_current_thread()
			.build()
			.unwrap()
	}

	#[test]
	fn roundtrip_all_length_encodings() {
		rt().block_on(async {
			// 0 and 10 use the 7 bit length, 200 the 16 bit one and
			// 70000 the 64 bit one.
			for &len in &[0_usize, 10, 200, 70_000] {
				for &mask in &[false, true] {
					let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
					let frame = Frame::new(OpCode::Binary, payload.clone());
					let mut buf = Vec::new();
					frame.write_to(&mut buf, mask);

					let parsed = Frame::read(&mut Cursor::new(buf)).await.unwrap();
					assert!(parsed.fin);
					assert_eq!(parsed.opcode, OpCode::Binary);
					assert_eq!(parsed.payload, payload, "len {} mask {}", len, mask);
				}
			}
		});
	}

	#[test]
	fn masked_bytes_differ_on_wire() {
		let frame = Frame::new(OpCode::Text, b"hello".to_vec());
		let mut masked = Vec::new();
		frame.write_to(&mut masked, true);
		let mut plain = Vec::new();
		frame.write_to(&mut plain, false);
		assert_eq!(plain[plain.len() - 5..], b"hello"[..]);
		// 4 byte key present and payload scrambled (the key is
		// random, identical bytes would mean a zero key).
		assert_eq!(masked.len(), plain.len() + 4);
	}

	#[test]
	fn close_frame_carries_code_and_reason() {
		rt().block_on(async {
			let frame = Frame::close(1001, "Going Away");
			let mut buf = Vec::new();
			frame.write_to(&mut buf, false);
			let parsed = Frame::read(&mut Cursor::new(buf)).await.unwrap();
			assert_eq!(parsed.opcode, OpCode::Close);
			assert_eq!(&parsed.payload[..2], &1001_u16.to_be_bytes());
			assert_eq!(&parsed.payload[2..], b"Going Away");
		});
	}

	#[test]
	fn control_frames_reject_long_payloads() {
		rt().block_on(async {
			let frame = Frame::new(OpCode::Ping, vec![0_u8; 200]);
			let mut buf = Vec::new();
			frame.write_to(&mut buf, false);
			let err = Frame::read(&mut Cursor::new(buf)).await.unwrap_err();
			assert!(matches!(err, FrameError::ControlTooLong));
		});
	}
}
