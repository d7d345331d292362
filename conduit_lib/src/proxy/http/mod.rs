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

//! HTTP proxy with CONNECT tunneling.
//!
//! Plain requests carry an absolute URL and are forwarded hop by hop
//! with the proxy headers stripped; `CONNECT` switches the client
//! connection into a blind relay. Authentication is Basic over
//! `Proxy-Authorization`, challenged with 407.

mod utils;

use self::utils::{
	content_length, encode_auth, is_chunked, put_request_head, read_request, url_to_addr,
	wants_close, write_response, HttpError,
};
use crate::{
	prelude::*,
	protocol::{
		serve::{self, AdapterShared, StreamHandler},
		AdapterError, ConnRecord, ProtocolAdapter, ProtocolConfig, ProtocolStatus, StatsSnapshot,
	},
	utils::{relay::Relay, Counter},
};
use http::{header, StatusCode, Uri};
use std::{collections::HashSet, io};
use tokio::{
	io::{AsyncBufRead, AsyncBufReadExt, BufReader},
	net::TcpStream,
	task::JoinHandle,
	time::timeout,
};

const PROTOCOL_NAME: &str = "http";
const MAX_HEADER_SIZE: usize = 16 * 1024;
const MAX_HEADERS_NUM: usize = 128;

pub struct HttpProxy {
	shared: Arc<AdapterShared>,
	handler: Arc<Handler>,
	serve_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl HttpProxy {
	#[must_use]
	pub fn new(config: ProtocolConfig) -> Self {
		let auths = config
			.users
			.iter()
			.map(|(user, pass)| encode_auth(user, pass))
			.collect();
		let shared = Arc::new(AdapterShared::new(config));
		let handler = Arc::new(Handler {
			shared: shared.clone(),
			auths,
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
impl ProtocolAdapter for HttpProxy {
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
	auths: HashSet<String>,
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

		loop {
			let req = match read_request(&mut r).await {
				Ok(Some(req)) => req,
				Ok(None) => return Ok(()),
				Err(HttpError::Io(e)) => return Err(e.into()),
				Err(e @ (HttpError::HeaderTooLong(_) | HttpError::BadRequest(_))) => {
					write_response(&mut w, StatusCode::BAD_REQUEST).await?;
					return Err(AdapterError::new_protocol(e));
				}
			};
			record.touch();

			if !self.check_auth(req.head.headers()) {
				debug!(
					"[{:x}] authentication missing or wrong, challenging",
					record.id
				);
				write_response(&mut w, StatusCode::PROXY_AUTHENTICATION_REQUIRED).await?;
				continue;
			}

			if req.head.method() == http::Method::CONNECT {
				return self.handle_connect(req.head.uri(), r, w, &record).await;
			}

			let close = wants_close(&req.head);
			let eof_body = self.handle_forward(req, &mut r, &mut w, &record).await?;
			if close || eof_body {
				return Ok(());
			}
		}
	}
}

impl Handler {
	fn check_auth(&self, headers: &http::HeaderMap) -> bool {
		if self.auths.is_empty() {
			return true;
		}
		let auth = headers
			.get(header::PROXY_AUTHORIZATION)
			.and_then(|v| v.to_str().ok());
		if let Some(auth) = auth {
			let mut parts = auth.splitn(2, ' ');
			if let (Some(kind), Some(code)) = (parts.next(), parts.next()) {
				return kind.eq_ignore_ascii_case("basic") && self.auths.contains(code.trim());
			}
		}
		false
	}

	async fn handle_connect<R, W>(
		&self,
		uri: &Uri,
		r: R,
		mut w: W,
		record: &ConnRecord,
	) -> Result<(), AdapterError>
	where
		R: AsyncRead + Unpin + Send,
		W: AsyncWrite + Unpin + Send,
	{
		let config = &self.shared.config;
		let target = match TargetAddr::parse_str(&uri.to_string(), Some(443)) {
			Ok(target) => target,
			Err(e) => {
				write_response(&mut w, StatusCode::BAD_REQUEST).await?;
				return Err(AdapterError::new_protocol(e));
			}
		};
		debug!("[{:x}] CONNECT to {}", record.id, target);
		let target_stream = match timeout(config.timeout(), target.dial()).await {
			Ok(Ok(s)) => s,
			Ok(Err(e)) => {
				warn!("[{:x}] cannot reach {}: {}", record.id, target, e);
				write_response(&mut w, StatusCode::BAD_GATEWAY).await?;
				return Err(e.into());
			}
			Err(_) => {
				write_response(&mut w, StatusCode::GATEWAY_TIMEOUT).await?;
				return Err(AdapterError::Io(io::ErrorKind::TimedOut.into()));
			}
		};
		w.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
			.await?;
		w.flush().await?;

		let relay = Relay {
			conn_id: record.id,
			recv: vec![self.shared.stats.received(), record.recv.clone()],
			send: vec![self.shared.stats.sent(), record.send.clone()],
			buffer_size: config.buffer_size,
			idle_timeout: config.timeout(),
		};
		relay.run((r, w), target_stream.into_split()).await?;
		Ok(())
	}

	/// Forward one plain request and relay its response back.
	///
	/// Returns `true` when the response body ran to EOF, which means
	/// the client connection cannot be reused.
	async fn handle_forward<R, W>(
		&self,
		req: utils::Request,
		r: &mut R,
		w: &mut W,
		record: &ConnRecord,
	) -> Result<bool, AdapterError>
	where
		R: AsyncBufRead + Unpin + Send,
		W: AsyncWrite + Unpin + Send,
	{
		let config = &self.shared.config;
		let target = match url_to_addr(req.head.uri()) {
			Ok(target) => target,
			Err(e) => {
				write_response(w, StatusCode::BAD_REQUEST).await?;
				return Err(AdapterError::new_protocol(e));
			}
		};
		debug!("[{:x}] {} {}", record.id, req.head.method(), target);
		let target_stream = match timeout(config.timeout(), target.dial()).await {
			Ok(Ok(s)) => s,
			Ok(Err(e)) => {
				warn!("[{:x}] cannot reach {}: {}", record.id, target, e);
				write_response(w, StatusCode::BAD_GATEWAY).await?;
				return Err(e.into());
			}
			Err(_) => {
				write_response(w, StatusCode::GATEWAY_TIMEOUT).await?;
				return Err(AdapterError::Io(io::ErrorKind::TimedOut.into()));
			}
		};
		let (tr, mut tw) = target_stream.into_split();

		let is_head = req.head.method() == http::Method::HEAD;
		let req_len = content_length(req.head.headers());
		let req_chunked = is_chunked(req.head.headers());

		// Hop headers are ours, they must not travel further.
		let mut head = req.head;
		{
			let headers = head.headers_mut();
			headers.remove(header::PROXY_AUTHORIZATION);
			if let Some(v) = headers.remove("proxy-connection") {
				headers.insert(header::CONNECTION, v);
			}
		}
		// The origin server expects an origin-form request line.
		let path_and_query = head
			.uri()
			.path_and_query()
			.cloned()
			.unwrap_or_else(|| http::uri::PathAndQuery::from_static("/"));
		let mut parts = http::uri::Parts::default();
		parts.path_and_query = Some(path_and_query);
		*head.uri_mut() = Uri::from_parts(parts).map_err(AdapterError::new_protocol)?;

		let mut head_buf = Vec::with_capacity(512);
		put_request_head(&mut head_buf, &head);
		tw.write_all(&head_buf).await?;

		let recv_counters = [self.shared.stats.received(), record.recv.clone()];
		let mut body_r = tokio::io::AsyncReadExt::chain(std::io::Cursor::new(req.leftover), r);
		if req_chunked {
			let mut body_r = BufReader::new(&mut body_r);
			copy_chunked(&mut body_r, &mut tw, &recv_counters).await?;
		} else if let Some(len) = req_len {
			copy_n(&mut body_r, &mut tw, len, config.buffer_size, &recv_counters).await?;
		}
		tw.flush().await?;

		// Response head goes back verbatim.
		let mut tr = BufReader::with_capacity(config.buffer_size, tr);
		let mut resp_buf = Vec::new();
		let head_end = crate::utils::read_until(&mut tr, CRLF_2, &mut resp_buf, MAX_HEADER_SIZE)
			.await
			.map_err(|e| AdapterError::new_protocol(format!("bad response head ({})", e)))?;
		let resp_leftover = resp_buf.split_off(head_end);

		let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS_NUM];
		let mut parsed = httparse::Response::new(&mut headers);
		let status = match parsed.parse(&resp_buf) {
			Ok(httparse::Status::Complete(_)) => parsed.code.unwrap_or(0),
			_ => {
				return Err(AdapterError::new_protocol("cannot parse response head"));
			}
		};
		let mut resp_headers = http::HeaderMap::new();
		for h in parsed.headers.iter() {
			if let (Ok(name), Ok(value)) = (
				http::header::HeaderName::from_str(h.name),
				http::HeaderValue::from_bytes(h.value),
			) {
				resp_headers.append(name, value);
			}
		}

		let send_counters = [self.shared.stats.sent(), record.send.clone()];
		w.write_all(&resp_buf).await?;
		for c in &send_counters {
			c.add(resp_buf.len() as u64);
		}
		record.touch();

		let bodyless = is_head || status == 204 || status == 304 || (100..200).contains(&status);
		let mut eof_body = false;
		if !bodyless {
			let mut body_r = BufReader::new(tokio::io::AsyncReadExt::chain(
				std::io::Cursor::new(resp_leftover),
				tr,
			));
			if is_chunked(&resp_headers) {
				copy_chunked(&mut body_r, w, &send_counters).await?;
			} else if let Some(len) = content_length(&resp_headers) {
				copy_n(&mut body_r, w, len, config.buffer_size, &send_counters).await?;
			} else {
				copy_until_eof(&mut body_r, w, config.buffer_size, &send_counters).await?;
				eof_body = true;
			}
		}
		w.flush().await?;
		Ok(eof_body)
	}
}

async fn copy_n<R, W>(
	r: &mut R,
	w: &mut W,
	mut n: u64,
	buf_size: usize,
	counters: &[Counter],
) -> io::Result<()>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let mut buf = vec![0_u8; buf_size];
	while n > 0 {
		#[allow(clippy::cast_possible_truncation)]
		let take = std::cmp::min(n, buf.len() as u64) as usize;
		let m = r.read(&mut buf[..take]).await?;
		if m == 0 {
			return Err(io::ErrorKind::UnexpectedEof.into());
		}
		w.write_all(&buf[..m]).await?;
		for c in counters {
			c.add(m as u64);
		}
		n -= m as u64;
	}
	w.flush().await
}

async fn copy_until_eof<R, W>(
	r: &mut R,
	w: &mut W,
	buf_size: usize,
	counters: &[Counter],
) -> io::Result<()>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let mut buf = vec![0_u8; buf_size];
	loop {
		let m = r.read(&mut buf).await?;
		if m == 0 {
			return w.flush().await;
		}
		w.write_all(&buf[..m]).await?;
		for c in counters {
			c.add(m as u64);
		}
	}
}

/// Copy a chunked body from `r` to `w`, chunk size lines included.
async fn copy_chunked<R, W>(r: &mut R, w: &mut W, counters: &[Counter]) -> io::Result<()>
where
	R: AsyncBufRead + Unpin,
	W: AsyncWrite + Unpin,
{
	loop {
		let mut line = Vec::new();
		r.read_until(b'\n', &mut line).await?;
		if line.is_empty() {
			return Err(io::ErrorKind::UnexpectedEof.into());
		}
		w.write_all(&line).await?;
		for c in counters {
			c.add(line.len() as u64);
		}
		let size = parse_chunk_size(&line)?;
		// Chunk data plus trailing CRLF. The zero chunk is followed
		// only by the final CRLF.
		copy_n(r, w, size + 2, 4 * 1024, counters).await?;
		if size == 0 {
			return w.flush().await;
		}
	}
}

fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
	let text = std::str::from_utf8(line)
		.map_err(|_| io::Error::from(io::ErrorKind::InvalidData))?
		.trim();
	let size_part = text.split(';').next().unwrap_or("").trim();
	u64::from_str_radix(size_part, 16).map_err(|_| io::ErrorKind::InvalidData.into())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::protocol::ProtocolConfig;
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

	async fn read_head(stream: &mut TcpStream) -> Vec<u8> {
		let mut head = Vec::new();
		let mut byte = [0_u8; 1];
		while crate::utils::find_pat_end(&head, CRLF_2).is_none() {
			let n = stream.read(&mut byte).await.unwrap();
			assert_ne!(n, 0, "stream closed before end of head");
			head.push(byte[0]);
		}
		head
	}

	#[test]
	fn connect_tunnels_to_target() {
		rt().block_on(async {
			let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
			let upstream_addr = upstream.local_addr().unwrap();
			tokio::spawn(async move {
				let (mut s, _) = upstream.accept().await.unwrap();
				let mut buf = [0_u8; 4];
				s.read_exact(&mut buf).await.unwrap();
				s.write_all(&buf).await.unwrap();
			});

			let adapter = HttpProxy::new(test_config("http"));
			adapter.start().await.unwrap();
			let addr = adapter.local_addr().unwrap();

			let mut client = TcpStream::connect(addr).await.unwrap();
			client
				.write_all(
					format!(
						"CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n",
						upstream_addr
					)
					.as_bytes(),
				)
				.await
				.unwrap();
			let head = read_head(&mut client).await;
			assert!(head.starts_with(b"HTTP/1.1 200"));

			client.write_all(b"ping").await.unwrap();
			let mut buf = [0_u8; 4];
			client.read_exact(&mut buf).await.unwrap();
			assert_eq!(&buf, b"ping");

			adapter.stop().await.unwrap();
		});
	}

	#[test]
	fn connect_to_refused_target_gets_502() {
		rt().block_on(async {
			// Bind and drop to get a port nothing listens on.
			let closed_addr = {
				let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
				listener.local_addr().unwrap()
			};

			let adapter = HttpProxy::new(test_config("http-502"));
			adapter.start().await.unwrap();
			let addr = adapter.local_addr().unwrap();

			let mut client = TcpStream::connect(addr).await.unwrap();
			client
				.write_all(
					format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n", closed_addr).as_bytes(),
				)
				.await
				.unwrap();
			let head = read_head(&mut client).await;
			assert!(head.starts_with(b"HTTP/1.1 502"));
			// The proxy closes the connection after the error reply.
			let mut byte = [0_u8; 1];
			assert_eq!(client.read(&mut byte).await.unwrap(), 0);

			adapter.stop().await.unwrap();
		});
	}

	#[test]
	fn absolute_url_request_is_forwarded() {
		rt().block_on(async {
			let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
			let upstream_addr = upstream.local_addr().unwrap();
			tokio::spawn(async move {
				let (mut s, _) = upstream.accept().await.unwrap();
				let head = {
					let mut head = Vec::new();
					let mut byte = [0_u8; 1];
					while crate::utils::find_pat_end(&head, CRLF_2).is_none() {
						s.read_exact(&mut byte).await.unwrap();
						head.push(byte[0]);
					}
					head
				};
				let head = String::from_utf8(head).unwrap();
				assert!(head.starts_with("GET / HTTP/1.1\r\n"), "head: {}", head);
				assert!(!head.to_ascii_lowercase().contains("proxy-authorization"));
				s.write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello")
					.await
					.unwrap();
			});

			let adapter = HttpProxy::new(test_config("http-fwd"));
			adapter.start().await.unwrap();
			let addr = adapter.local_addr().unwrap();

			let mut client = TcpStream::connect(addr).await.unwrap();
			client
				.write_all(
					format!(
						"GET http://{0}/ HTTP/1.1\r\nHost: {0}\r\nConnection: close\r\n\r\n",
						upstream_addr
					)
					.as_bytes(),
				)
				.await
				.unwrap();
			let head = read_head(&mut client).await;
			assert!(head.starts_with(b"HTTP/1.1 200"));
			let mut body = [0_u8; 5];
			client.read_exact(&mut body).await.unwrap();
			assert_eq!(&body, b"hello");

			adapter.stop().await.unwrap();
		});
	}

	#[test]
	fn missing_credentials_get_407() {
		rt().block_on(async {
			let mut config = test_config("http-auth");
			config
				.users
				.insert("user".to_string(), "pass".to_string());
			let adapter = HttpProxy::new(config);
			adapter.start().await.unwrap();
			let addr = adapter.local_addr().unwrap();

			let mut client = TcpStream::connect(addr).await.unwrap();
			client
				.write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
				.await
				.unwrap();
			let head = read_head(&mut client).await;
			let head = String::from_utf8(head).unwrap();
			assert!(head.starts_with("HTTP/1.1 407"));
			assert!(head
				.to_ascii_lowercase()
				.contains("proxy-authenticate: basic"));

			adapter.stop().await.unwrap();
		});
	}

	#[test]
	fn chunk_size_lines() {
		assert_eq!(parse_chunk_size(b"1a\r\n").unwrap(), 26);
		assert_eq!(parse_chunk_size(b"0\r\n").unwrap(), 0);
		assert_eq!(parse_chunk_size(b"10;ext=1\r\n").unwrap(), 16);
		assert!(parse_chunk_size(b"zz\r\n").is_err());
	}
}
