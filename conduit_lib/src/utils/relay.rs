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

use super::Counter;
use crate::prelude::*;
use futures::future::{self, Either};
use std::{
	io,
	sync::atomic::{AtomicBool, Ordering},
	time::Duration,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

/// How long the other direction is allowed to keep going after one
/// direction is done.
const GRACE_TIMEOUT: Duration = Duration::from_secs(2);
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Bidirectional copying between a client stream and a target stream.
///
/// `recv` counters accumulate client-to-target bytes, `send`
/// counters target-to-client bytes. The relay ends when either side
/// reaches EOF or errors, or when no bytes moved for `idle_timeout`.
pub struct Relay {
	pub conn_id: u64,
	pub recv: Vec<Counter>,
	pub send: Vec<Counter>,
	pub buffer_size: usize,
	pub idle_timeout: Duration,
}

impl Relay {
	pub async fn run<AR, AW, BR, BW>(self, client: (AR, AW), target: (BR, BW)) -> io::Result<()>
	where
		AR: AsyncRead + Unpin + Send,
		AW: AsyncWrite + Unpin + Send,
		BR: AsyncRead + Unpin + Send,
		BW: AsyncWrite + Unpin + Send,
	{
		let (cr, cw) = client;
		let (tr, tw) = target;
		let is_active = Arc::new(AtomicBool::new(true));

		let up = StreamCopier {
			r: BufReader::with_capacity(self.buffer_size, cr),
			w: tw,
			counters: self.recv,
			tag: format!("[{:x}] up:", self.conn_id),
			is_active: is_active.clone(),
		};
		let down = StreamCopier {
			r: BufReader::with_capacity(self.buffer_size, tr),
			w: cw,
			counters: self.send,
			tag: format!("[{:x}] down:", self.conn_id),
			is_active: is_active.clone(),
		};

		let transfer = async move {
			let up_task = up.run();
			let down_task = down.run();
			futures::pin_mut!(up_task);
			futures::pin_mut!(down_task);
			let (first, other) = match future::select(up_task, down_task).await {
				Either::Left((res, other)) => (res, Either::Left(other)),
				Either::Right((res, other)) => (res, Either::Right(other)),
			};
			// Let the remaining direction drain for a little while.
			let other_res = match other {
				Either::Left(t) => tokio::time::timeout(GRACE_TIMEOUT, t).await,
				Either::Right(t) => tokio::time::timeout(GRACE_TIMEOUT, t).await,
			};
			match other_res {
				Ok(res) => first.and(res),
				Err(_elapsed) => first,
			}
		};

		tokio::select! {
			res = transfer => res,
			() = watch_idle(is_active, self.idle_timeout) => {
				debug!("[{:x}] relay closed for inactivity", self.conn_id);
				Err(io::ErrorKind::TimedOut.into())
			}
		}
	}
}

async fn watch_idle(is_active: Arc<AtomicBool>, timeout: Duration) {
	let max_ticks = std::cmp::max(1, timeout.as_secs());
	let mut idle_ticks = 0_u64;
	loop {
		tokio::time::sleep(TICK_INTERVAL).await;
		if is_active.swap(false, Ordering::Relaxed) {
			idle_ticks = 0;
		} else {
			idle_ticks += 1;
			if idle_ticks >= max_ticks {
				return;
			}
		}
	}
}

/// Copy bytes from `r` to `w` until EOF, then shut `w` down.
struct StreamCopier<R, W>
where
	R: AsyncBufRead + Unpin + Send,
	W: AsyncWrite + Unpin + Send,
{
	r: R,
	w: W,
	counters: Vec<Counter>,
	tag: String,
	is_active: Arc<AtomicBool>,
}

impl<R, W> StreamCopier<R, W>
where
	R: AsyncBufRead + Unpin + Send,
	W: AsyncWrite + Unpin + Send,
{
	async fn run(mut self) -> io::Result<()> {
		loop {
			let data = self.r.fill_buf().await?;
			self.is_active.store(true, Ordering::Relaxed);
			if data.is_empty() {
				trace!("{} read half reached EOF, shutting down write half", self.tag);
				self.w.shutdown().await?;
				return Ok(());
			}
			let write_amt = self.w.write(data).await?;
			if write_amt == 0 {
				return Err(io::ErrorKind::WriteZero.into());
			}
			self.w.flush().await?;
			self.r.consume(write_amt);
			for counter in &self.counters {
				counter.add(write_amt as u64);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Cursor;

	#[test]
	fn relay_copies_both_directions() {
		let rt = tokio::runtime::Builder::new_multi_thread()
			.enable_time()
			.build()
			.unwrap();
		rt.block_on(async {
			let mut client_data = vec![0_u8; 8 * 1024];
			rand::thread_rng().fill_bytes(&mut client_data);
			let mut target_data = vec![0_u8; 4 * 1024];
			rand::thread_rng().fill_bytes(&mut target_data);

			let client_read = Cursor::new(client_data.clone());
			let target_read = Cursor::new(target_data.clone());
			let mut client_write = Cursor::new(Vec::new());
			let mut target_write = Cursor::new(Vec::new());

			let recv = Counter::new();
			let send = Counter::new();
			let relay = Relay {
				conn_id: 1,
				recv: vec![recv.clone()],
				send: vec![send.clone()],
				buffer_size: 512,
				idle_timeout: Duration::from_secs(10),
			};
			relay
				.run(
					(client_read, &mut client_write),
					(target_read, &mut target_write),
				)
				.await
				.unwrap();

			assert_eq!(target_write.into_inner(), client_data);
			assert_eq!(client_write.into_inner(), target_data);
			assert_eq!(recv.get(), client_data.len() as u64);
			assert_eq!(send.get(), target_data.len() as u64);
		});
	}
}
