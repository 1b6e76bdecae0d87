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

/*!
The plain HTTP face of the tunnel port.

Every connection starts as an HTTP request. Upgrade requests become
WebSocket tunnels; anything else gets a small static answer so the
port looks like an ordinary web server:

- `GET /`, `GET /index.html` -> 200 with a static page
- `GET /generate_204`        -> 204, `Connection: close` (probe)
- everything else            -> 404
*/

use crate::prelude::*;
use std::{fmt::Write as _, io};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

const MAX_HEAD_LEN: usize = 8 * 1024;
const MAX_HEADERS_NUM: usize = 64;

const INDEX_HTML: &str = "<!DOCTYPE html>\n<html>\n<head><title>Welcome</title></head>\n<body>\n<h1>It works!</h1>\n<p>This is the default web page of this server.</p>\n</body>\n</html>\n";
const NOT_FOUND_HTML: &str =
	"<!DOCTYPE html>\n<html>\n<head><title>404 Not Found</title></head>\n<body>\n<h1>404 Not Found</h1>\n</body>\n</html>\n";

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
	#[error("HTTP request head IO error ({0})")]
	Io(#[from] io::Error),
	#[error("bad HTTP request head ({0})")]
	BadRequest(BoxStdErr),
	#[error("HTTP request head too long")]
	HeadTooLong,
}

/// The parts of a request head the server routes on.
#[derive(Debug)]
pub struct RequestHead {
	/// The raw head bytes, up to and including the final CRLF CRLF.
	/// Replayed into the WebSocket handshake for upgrade requests.
	pub raw: Vec<u8>,
	pub method: String,
	pub path: String,
	pub upgrade: bool,
}

/// Read and parse one HTTP request head from `r`.
///
/// Only the head is consumed; anything after the blank line stays in
/// the reader.
///
/// # Errors
///
/// Returns a [`ReadError`] on IO errors, an oversized head or a head
/// httparse cannot make sense of.
pub async fn read_request_head<R>(r: &mut R) -> Result<RequestHead, ReadError>
where
	R: AsyncBufRead + Unpin,
{
	let mut buf = [0_u8; MAX_HEAD_LEN];
	let len = read_until(r, CRLF_2, &mut buf)
		.await?
		.ok_or(ReadError::HeadTooLong)?;
	let raw = buf[..len].to_vec();

	let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS_NUM];
	let mut req = httparse::Request::new(&mut headers);
	let status = req
		.parse(&raw)
		.map_err(|e| ReadError::BadRequest(e.to_string().into()))?;
	if status.is_partial() {
		// The head ended with CRLF CRLF but still does not parse as a
		// complete request.
		return Err(ReadError::BadRequest("incomplete request head".into()));
	}

	let method = req.method.unwrap_or_default().to_string();
	let path = req.path.unwrap_or_default().to_string();
	let upgrade = is_upgrade(req.headers);
	Ok(RequestHead {
		raw,
		method,
		path,
		upgrade,
	})
}

fn is_upgrade(headers: &[httparse::Header<'_>]) -> bool {
	let mut has_upgrade_websocket = false;
	let mut connection_has_upgrade = false;
	for header in headers {
		if header.name.eq_ignore_ascii_case("upgrade") {
			if let Ok(value) = std::str::from_utf8(header.value) {
				has_upgrade_websocket = value.trim().eq_ignore_ascii_case("websocket");
			}
		} else if header.name.eq_ignore_ascii_case("connection") {
			if let Ok(value) = std::str::from_utf8(header.value) {
				connection_has_upgrade = value
					.split(',')
					.any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
			}
		}
	}
	has_upgrade_websocket && connection_has_upgrade
}

/// Answer a non-upgrade request and close the connection.
///
/// # Errors
///
/// Returns any IO error from writing the response.
pub async fn serve_plain<W>(w: &mut W, head: &RequestHead) -> io::Result<()>
where
	W: AsyncWrite + Unpin,
{
	let response = match (head.method.as_str(), head.path.as_str()) {
		("GET", "/") | ("GET", "/index.html") => {
			make_response("200 OK", Some(("text/html", INDEX_HTML)))
		}
		("GET", "/generate_204") => make_response("204 No Content", None),
		_ => make_response("404 Not Found", Some(("text/html", NOT_FOUND_HTML))),
	};
	w.write_all(response.as_bytes()).await?;
	w.flush().await?;
	w.shutdown().await
}

fn make_response(status: &str, body: Option<(&str, &str)>) -> String {
	let mut response = String::with_capacity(256);
	let _ = write!(response, "HTTP/1.1 {}\r\nConnection: close\r\n", status);
	if let Some((content_type, body)) = body {
		let _ = write!(
			response,
			"Content-Type: {}\r\nContent-Length: {}\r\n\r\n{}",
			content_type,
			body.len(),
			body
		);
	} else {
		response.push_str("\r\n");
	}
	response
}

fn find_pat(src: &[u8], pat: &[u8]) -> Option<usize> {
	if src.len() < pat.len() {
		return None;
	}
	src.windows(pat.len()).position(|window| window == pat)
}

/// Read from `r` until `pat` is found, copying into `dst`.
///
/// Consumes from `r` exactly up to the end of the pattern; everything
/// after it is left in the reader. Returns `Ok(None)` if `dst` fills
/// up before the pattern shows up.
async fn read_until(
	mut r: impl AsyncBufRead + Unpin,
	pat: &[u8],
	dst: &mut [u8],
) -> io::Result<Option<usize>> {
	let mut pos = 0;
	assert!(pat.len() < dst.len());
	assert!(!pat.is_empty());

	while pos < dst.len() {
		let data = r.fill_buf().await?;
		// Reached EOF
		if data.is_empty() {
			return Err(io::ErrorKind::UnexpectedEof.into());
		}

		let rem = &mut dst[pos..];
		let copy_len = std::cmp::min(rem.len(), data.len());
		rem[..copy_len].copy_from_slice(&data[..copy_len]);

		let start_pos = pos.saturating_sub(pat.len());
		let curr_dst = &dst[start_pos..pos + copy_len];
		if let Some(pat_pos) = find_pat(curr_dst, pat) {
			let old_pos = pos;
			pos = start_pos + pat_pos + pat.len();
			r.consume(pos - old_pos);
			return Ok(Some(pos));
		}
		pos += copy_len;
		r.consume(copy_len);
	}
	Ok(None)
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::{AsyncBufReadExt, BufReader};

	fn head_of(raw: &[u8]) -> RequestHead {
		let task = async move {
			let mut r = BufReader::new(raw);
			read_request_head(&mut r).await.unwrap()
		};
		tokio::runtime::Runtime::new().unwrap().block_on(task)
	}

	#[test]
	fn test_read_request_head_plain() {
		let head = head_of(b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n");
		assert_eq!(head.method, "GET");
		assert_eq!(head.path, "/index.html");
		assert!(!head.upgrade);
	}

	#[test]
	fn test_read_request_head_upgrade() {
		let head = head_of(
			b"GET /anything HTTP/1.1\r\n\
			Host: example.com\r\n\
			Connection: keep-alive, Upgrade\r\n\
			Upgrade: WebSocket\r\n\
			Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
			Sec-WebSocket-Version: 13\r\n\r\n",
		);
		assert_eq!(head.path, "/anything");
		assert!(head.upgrade);
	}

	#[test]
	fn test_read_request_head_leaves_rest() {
		let task = async {
			let mut r = BufReader::new(&b"GET / HTTP/1.1\r\n\r\nEXTRA"[..]);
			let head = read_request_head(&mut r).await.unwrap();
			assert_eq!(head.raw, b"GET / HTTP/1.1\r\n\r\n");
			let rest = r.fill_buf().await.unwrap();
			assert_eq!(rest, b"EXTRA");
		};
		tokio::runtime::Runtime::new().unwrap().block_on(task);
	}

	#[test]
	fn test_read_request_head_too_long() {
		let task = async {
			let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
			while raw.len() <= MAX_HEAD_LEN {
				raw.extend_from_slice(b"X-Filler: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\r\n");
			}
			raw.extend_from_slice(CRLF);
			let mut r = BufReader::new(raw.as_slice());
			assert!(matches!(
				read_request_head(&mut r).await,
				Err(ReadError::HeadTooLong)
			));
		};
		tokio::runtime::Runtime::new().unwrap().block_on(task);
	}

	#[test]
	fn test_serve_plain_routing() {
		let cases = [
			("GET", "/", "200 OK"),
			("GET", "/index.html", "200 OK"),
			("GET", "/generate_204", "204 No Content"),
			("GET", "/missing", "404 Not Found"),
			("POST", "/", "404 Not Found"),
		];
		let task = async {
			for (method, path, expected_status) in cases {
				let head = RequestHead {
					raw: Vec::new(),
					method: method.to_string(),
					path: path.to_string(),
					upgrade: false,
				};
				let mut out = std::io::Cursor::new(Vec::new());
				serve_plain(&mut out, &head).await.unwrap();
				let text = String::from_utf8(out.into_inner()).unwrap();
				assert!(
					text.starts_with(&format!("HTTP/1.1 {}\r\n", expected_status)),
					"{} {} should answer {}, got: {}",
					method,
					path,
					expected_status,
					text
				);
				assert!(text.contains("Connection: close\r\n"));
				if expected_status.starts_with("204") {
					assert!(text.ends_with("\r\n\r\n"));
				} else {
					assert!(text.contains("Content-Length: "));
				}
			}
		};
		tokio::runtime::Runtime::new().unwrap().block_on(task);
	}
}
