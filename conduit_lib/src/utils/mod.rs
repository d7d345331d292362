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

pub mod relay;

use std::{
	fmt,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Display bytes number in human readable form.
#[derive(Clone, Copy)]
pub struct BytesCount(pub u64);

impl fmt::Display for BytesCount {
	#[allow(clippy::cast_possible_truncation)]
	#[allow(clippy::cast_precision_loss)]
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		const BASE: u64 = 1024;
		const NAMES: &[&str] = &["KiB", "MiB", "GiB"];
		let num = self.0;
		if num < BASE {
			write!(f, "{}B", num)
		} else {
			let num = num as f64;
			// Because num >= 1024, log2(num) >= 10,
			// and because num < 2^64, log2(num) < 64
			let index = num.log2() / 10.0 - 1.0;
			#[allow(clippy::cast_sign_loss)]
			let index = std::cmp::min(index as usize, NAMES.len() - 1);
			let value = num / (BASE.pow(index as u32 + 1) as f64);
			write!(f, "{:.2}{}", value, NAMES[index])
		}
	}
}

/// Cheaply clonable traffic/connection counter.
///
/// All operations use relaxed ordering, values are only
/// statistical.
#[derive(Clone, Debug, Default)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	#[inline]
	pub fn add(&self, value: u64) {
		self.0.fetch_add(value, Ordering::Relaxed);
	}

	#[inline]
	pub fn sub(&self, value: u64) {
		self.0.fetch_sub(value, Ordering::Relaxed);
	}

	#[inline]
	#[must_use]
	pub fn get(&self) -> u64 {
		self.0.load(Ordering::Relaxed)
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
	#[error("IO error ({0})")]
	Io(#[from] std::io::Error),
	#[error("EOF reached before pattern")]
	Eof,
	#[error("pattern not found within {0} bytes")]
	TooLarge(usize),
}

/// Find the position right after `pat` in `data`.
#[must_use]
pub fn find_pat_end(data: &[u8], pat: &[u8]) -> Option<usize> {
	if pat.is_empty() || data.len() < pat.len() {
		return None;
	}
	for i in 0..=(data.len() - pat.len()) {
		if &data[i..i + pat.len()] == pat {
			return Some(i + pat.len());
		}
	}
	None
}

/// Read from `r` into `buf` until `pat` is found or `max_len` bytes
/// are buffered.
///
/// Returns the position one past the end of `pat`. Any bytes after
/// that position were read from the stream but do not belong to the
/// patterned section; the caller owns them.
///
/// # Errors
/// Returns [`ReadError::Eof`] if the stream ends first, or
/// [`ReadError::TooLarge`] if the pattern is not within `max_len` bytes.
pub async fn read_until<R>(
	r: &mut R,
	pat: &[u8],
	buf: &mut Vec<u8>,
	max_len: usize,
) -> Result<usize, ReadError>
where
	R: AsyncBufRead + Unpin,
{
	let mut scanned = 0;
	loop {
		if let Some(end) = find_pat_end(&buf[scanned..], pat) {
			return Ok(scanned + end);
		}
		// Everything before the last pat.len()-1 bytes is settled;
		// the pattern can still straddle into the next read.
		scanned = buf.len().saturating_sub(pat.len().saturating_sub(1));
		if buf.len() >= max_len {
			return Err(ReadError::TooLarge(max_len));
		}
		let data = r.fill_buf().await?;
		if data.is_empty() {
			return Err(ReadError::Eof);
		}
		let take = std::cmp::min(data.len(), max_len.saturating_add(pat.len()) - buf.len());
		buf.extend_from_slice(&data[..take]);
		r.consume(take);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Cursor;

	#[test]
	fn bytes_count_display() {
		const KIB: u64 = 1024;
		const MIB: u64 = KIB * 1024;

		assert_eq!(BytesCount(0).to_string(), "0B");
		assert_eq!(BytesCount(512).to_string(), "512B");
		assert_eq!(BytesCount(1023).to_string(), "1023B");
		assert_eq!(BytesCount(KIB).to_string(), "1.00KiB");
		assert_eq!(BytesCount(1536).to_string(), "1.50KiB");
		assert_eq!(BytesCount(MIB).to_string(), "1.00MiB");
		assert_eq!(BytesCount(1536 * KIB).to_string(), "1.50MiB");
	}

	#[test]
	fn counter_add_sub() {
		let c = Counter::new();
		c.add(10);
		c.add(5);
		c.sub(3);
		assert_eq!(c.get(), 12);
		let c2 = c.clone();
		c2.add(1);
		assert_eq!(c.get(), 13);
	}

	#[test]
	fn find_pat_end_works() {
		assert_eq!(find_pat_end(b"abcd\r\n\r\nbody", b"\r\n\r\n"), Some(8));
		assert_eq!(find_pat_end(b"abcd", b"\r\n\r\n"), None);
		assert_eq!(find_pat_end(b"", b"\r\n"), None);
		assert_eq!(find_pat_end(b"\r\n", b"\r\n"), Some(2));
	}

	#[test]
	fn read_until_finds_pattern() {
		let rt = tokio::runtime::Builder::new_current_thread()
			.build()
			.unwrap();
		rt.block_on(async {
			let mut r = tokio::io::BufReader::new(Cursor::new(b"HEAD\r\n\r\nBODY".to_vec()));
			let mut buf = Vec::new();
			let pos = read_until(&mut r, b"\r\n\r\n", &mut buf, 1024).await.unwrap();
			assert_eq!(&buf[..pos], b"HEAD\r\n\r\n");
		});
	}

	#[test]
	fn read_until_pattern_straddles_reads() {
		let rt = tokio::runtime::Builder::new_current_thread()
			.build()
			.unwrap();
		rt.block_on(async {
			// A 3 byte reader capacity splits the terminator across
			// fill_buf calls.
			let data = Cursor::new(b"HEAD\r\n\r\nBODY".to_vec());
			let mut r = tokio::io::BufReader::with_capacity(3, data);
			let mut buf = Vec::new();
			let pos = read_until(&mut r, b"\r\n\r\n", &mut buf, 1024).await.unwrap();
			assert_eq!(&buf[..pos], b"HEAD\r\n\r\n");
		});
	}

	#[test]
	fn read_until_eof() {
		let rt = tokio::runtime::Builder::new_current_thread()
			.build()
			.unwrap();
		rt.block_on(async {
			let mut r = tokio::io::BufReader::new(Cursor::new(b"no pattern here".to_vec()));
			let mut buf = Vec::new();
			let res = read_until(&mut r, b"\r\n\r\n", &mut buf, 1024).await;
			assert!(matches!(res, Err(ReadError::Eof)));
		});
	}

	#[test]
	fn read_until_too_large() {
		let rt = tokio::runtime::Builder::new_current_thread()
			.build()
			.unwrap();
		rt.block_on(async {
			let data = vec![b'a'; 4096];
			let mut r = tokio::io::BufReader::new(Cursor::new(data));
			let mut buf = Vec::new();
			let res = read_until(&mut r, b"\r\n\r\n", &mut buf, 128).await;
			assert!(matches!(res, Err(ReadError::TooLarge(128))));
		});
	}
}
