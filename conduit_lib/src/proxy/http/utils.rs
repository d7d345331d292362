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

use super::{MAX_HEADER_SIZE, MAX_HEADERS_NUM};
use crate::{
	prelude::*,
	utils::{read_until, ReadError},
};
use http::{header, StatusCode, Uri};
use std::io;
use tokio::io::AsyncBufRead;

#[derive(Debug, thiserror::Error)]
pub(super) enum HttpError {
	#[error("IO error ({0})")]
	Io(#[from] io::Error),
	#[error("HTTP header longer than {0} bytes")]
	HeaderTooLong(usize),
	#[error("bad HTTP request ({0})")]
	BadRequest(BoxStdErr),
}

/// A parsed request head plus whatever body bytes were already
/// pulled off the socket while looking for the head terminator.
pub(super) struct Request {
	pub head: http::Request<()>,
	pub leftover: Vec<u8>,
}

/// Read and parse one request head.
///
/// Returns `Ok(None)` on a clean EOF before any request byte, which
/// is how keep-alive clients end the session.
pub(super) async fn read_request<R>(r: &mut R) -> Result<Option<Request>, HttpError>
where
	R: AsyncBufRead + Unpin,
{
	let mut buf = Vec::new();
	let end = match read_until(r, CRLF_2, &mut buf, MAX_HEADER_SIZE).await {
		Ok(end) => end,
		Err(ReadError::Eof) => {
			if buf.is_empty() {
				return Ok(None);
			}
			return Err(HttpError::BadRequest(
				"connection closed in the middle of a request head".into(),
			));
		}
		Err(ReadError::Io(e)) => return Err(e.into()),
		Err(ReadError::TooLarge(max)) => return Err(HttpError::HeaderTooLong(max)),
	};
	let leftover = buf.split_off(end);

	let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS_NUM];
	let mut parsed = httparse::Request::new(&mut headers);
	match parsed
		.parse(&buf)
		.map_err(|e| HttpError::BadRequest(e.into()))?
	{
		httparse::Status::Complete(_len) => {}
		httparse::Status::Partial => {
			return Err(HttpError::BadRequest("partial request head".into()))
		}
	}

	let ver = match parsed.version {
		Some(0) => http::Version::HTTP_10,
		Some(1) => http::Version::HTTP_11,
		other => {
			return Err(HttpError::BadRequest(
				format!("unsupported HTTP version {:?}", other).into(),
			))
		}
	};
	let method = parsed
		.method
		.ok_or_else(|| HttpError::BadRequest("request has no method".into()))?;
	let uri = parsed
		.path
		.ok_or_else(|| HttpError::BadRequest("request has no path".into()))?;
	let uri = Uri::from_str(uri).map_err(|e| HttpError::BadRequest(e.into()))?;

	let mut head = http::Request::builder()
		.method(method)
		.uri(uri)
		.version(ver)
		.body(())
		.map_err(|e| HttpError::BadRequest(e.into()))?;
	insert_headers(head.headers_mut(), parsed.headers)?;

	Ok(Some(Request { head, leftover }))
}

fn insert_headers(
	headers: &mut http::HeaderMap,
	parsed_headers: &[httparse::Header<'_>],
) -> Result<(), HttpError> {
	for header in parsed_headers {
		let key = http::header::HeaderName::from_str(header.name).map_err(|_| {
			HttpError::BadRequest(format!("invalid header name {}", header.name).into())
		})?;
		let val = http::HeaderValue::from_bytes(header.value).map_err(|_| {
			HttpError::BadRequest(format!("invalid header value {:?}", header.value).into())
		})?;
		headers.append(key, val);
	}
	Ok(())
}

pub(super) fn put_request_head(buf: &mut impl BufMut, req: &http::Request<()>) {
	buf.put_slice(req.method().as_str().as_bytes());
	buf.put_u8(b' ');
	buf.put_slice(req.uri().to_string().as_bytes());
	buf.put_u8(b' ');
	let ver: &[u8] = match req.version() {
		http::Version::HTTP_10 => b"HTTP/1.0",
		_ => b"HTTP/1.1",
	};
	buf.put_slice(ver);
	buf.put_slice(CRLF);
	for (name, value) in req.headers() {
		buf.put_slice(name.as_str().as_bytes());
		buf.put_slice(b": ");
		buf.put_slice(value.as_bytes());
		buf.put_slice(CRLF);
	}
	buf.put_slice(CRLF);
}

/// Resolve a request target from an absolute URL, defaulting the
/// port from the scheme.
pub(super) fn url_to_addr(url: &Uri) -> Result<TargetAddr, BoxStdErr> {
	let host = url
		.host()
		.ok_or_else(|| format!("URL '{}' has no host", url))?;
	let port = if let Some(port) = url.port_u16() {
		port
	} else {
		match url.scheme_str() {
			None | Some("http") => 80,
			Some("https") => 443,
			Some(other) => {
				return Err(format!(
					"cannot determine port from scheme '{}' of URL '{}'",
					other, url
				)
				.into())
			}
		}
	};
	let dest = Destination::from_str(host)?;
	Ok(TargetAddr { dest, port })
}

/// Write a simple response with a small HTML body, the way every
/// error and challenge reply looks.
pub(super) async fn write_response<W>(w: &mut W, status: StatusCode) -> io::Result<()>
where
	W: AsyncWrite + Unpin,
{
	let reason = status.canonical_reason().unwrap_or("Unknown");
	let body = format!("<html><body><h1>{} {}</h1></body></html>", status.as_u16(), reason);
	let mut buf = Vec::with_capacity(256);
	buf.put_slice(b"HTTP/1.1 ");
	buf.put_slice(status.as_str().as_bytes());
	buf.put_u8(b' ');
	buf.put_slice(reason.as_bytes());
	buf.put_slice(CRLF);
	if status == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
		buf.put_slice(b"proxy-authenticate: Basic realm=\"Proxy\"\r\n");
	}
	buf.put_slice(b"content-type: text/html\r\n");
	buf.put_slice(format!("content-length: {}\r\n", body.len()).as_bytes());
	buf.put_slice(CRLF);
	buf.put_slice(body.as_bytes());
	w.write_all(&buf).await?;
	w.flush().await
}

#[inline]
pub(super) fn encode_auth(user: &str, pass: &str) -> String {
	base64::encode(format!("{}:{}", user, pass).as_bytes())
}

pub(super) fn content_length(headers: &http::HeaderMap) -> Option<u64> {
	headers
		.get(header::CONTENT_LENGTH)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.trim().parse().ok())
}

pub(super) fn is_chunked(headers: &http::HeaderMap) -> bool {
	headers
		.get(header::TRANSFER_ENCODING)
		.and_then(|v| v.to_str().ok())
		.map_or(false, |v| {
			v.split(',').any(|t| t.trim().eq_ignore_ascii_case("chunked"))
		})
}

/// Whether the client connection should close after this exchange.
pub(super) fn wants_close(req: &http::Request<()>) -> bool {
	let conn = req
		.headers()
		.get(header::CONNECTION)
		.or_else(|| req.headers().get("proxy-connection"))
		.and_then(|v| v.to_str().ok());
	match conn {
		Some(v) if v.eq_ignore_ascii_case("close") => true,
		Some(v) if v.eq_ignore_ascii_case("keep-alive") => false,
		_ => req.version() == http::Version::HTTP_10,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::BufReader;

	#[test]
	fn encode_auth_basic() {
		assert_eq!(encode_auth("hello", "world"), "aGVsbG86d29ybGQ=");
		assert_eq!(encode_auth("username", "password"), "dXNlcm5hbWU6cGFzc3dvcmQ=");
	}

	#[test]
	fn url_defaults_port_by_scheme() {
		let url = Uri::from_str("http://example.com/index.html").unwrap();
		let addr = url_to_addr(&url).unwrap();
		assert_eq!(addr.to_string(), "example.com:80");
		let url = Uri::from_str("https://example.com/").unwrap();
		assert_eq!(url_to_addr(&url).unwrap().port, 443);
	}

	#[test]
	fn request_parsing_keeps_body_bytes() {
		let rt = tokio::runtime::Builder::new_current_thread()
			.build()
			.unwrap();
		rt.block_on(async {
			let data = b"POST http://h/ HTTP/1.1\r\ncontent-length: 4\r\n\r\nbody".to_vec();
			let mut r = BufReader::new(std::io::Cursor::new(data));
			let req = read_request(&mut r).await.unwrap().unwrap();
			assert_eq!(req.head.method(), http::Method::POST);
			assert_eq!(content_length(req.head.headers()), Some(4));
			assert_eq!(req.leftover, b"body");
		});
	}

	#[test]
	fn eof_between_requests_is_clean() {
		let rt = tokio::runtime::Builder::new_current_thread()
			.build()
			.unwrap();
		rt.block_on(async {
			let mut r = BufReader::new(std::io::Cursor::new(Vec::new()));
			assert!(read_request(&mut r).await.unwrap().is_none());
		});
	}
}
