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

pub mod websocket;

mod display_helper;
pub use display_helper::BytesCount;

use std::io;
use tokio::io::ReadBuf;

/// A byte buffer being served out through repeated `poll_read` calls.
#[derive(Debug)]
pub struct PollBuffer {
	data: Vec<u8>,
	pos: usize,
}

impl PollBuffer {
	#[must_use]
	pub fn new(data: Vec<u8>) -> Self {
		Self { data, pos: 0 }
	}

	/// Copy as many remaining bytes as fit into `dst`.
	/// Returns `true` once the buffer is drained.
	pub fn copy_to(&mut self, dst: &mut ReadBuf<'_>) -> bool {
		let remaining = &self.data[self.pos..];
		let len = std::cmp::min(remaining.len(), dst.remaining());
		dst.put_slice(&remaining[..len]);
		self.pos += len;
		self.pos == self.data.len()
	}
}

/// A stream that serves `head` before reading from the inner IO.
/// Writes always go straight through.
///
/// Used to replay an already consumed HTTP request head to the
/// WebSocket handshake.
pub struct PrefixedStream<IO> {
	head: Option<PollBuffer>,
	io: IO,
}

impl<IO> PrefixedStream<IO> {
	pub fn new(head: Vec<u8>, io: IO) -> Self {
		let head = if head.is_empty() {
			None
		} else {
			Some(PollBuffer::new(head))
		};
		Self { head, io }
	}
}

impl<IO: tokio::io::AsyncRead + Unpin> tokio::io::AsyncRead for PrefixedStream<IO> {
	fn poll_read(
		self: std::pin::Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
		dst: &mut ReadBuf<'_>,
	) -> std::task::Poll<io::Result<()>> {
		let me = self.get_mut();
		if let Some(head) = &mut me.head {
			if head.copy_to(dst) {
				me.head = None;
			}
			Ok(()).into()
		} else {
			std::pin::Pin::new(&mut me.io).poll_read(cx, dst)
		}
	}
}

impl<IO: tokio::io::AsyncWrite + Unpin> tokio::io::AsyncWrite for PrefixedStream<IO> {
	fn poll_write(
		self: std::pin::Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
		buf: &[u8],
	) -> std::task::Poll<Result<usize, io::Error>> {
		std::pin::Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
	}

	fn poll_flush(
		self: std::pin::Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
	) -> std::task::Poll<Result<(), io::Error>> {
		std::pin::Pin::new(&mut self.get_mut().io).poll_flush(cx)
	}

	fn poll_shutdown(
		self: std::pin::Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
	) -> std::task::Poll<Result<(), io::Error>> {
		std::pin::Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::AsyncReadExt;

	#[test]
	fn test_prefixed_stream() {
		let task = async {
			let mut stream = PrefixedStream::new(b"HEAD".to_vec(), &b"BODY"[..]);
			let mut result = Vec::new();
			stream.read_to_end(&mut result).await.unwrap();
			assert_eq!(result, b"HEADBODY");
		};
		tokio::runtime::Runtime::new().unwrap().block_on(task);
	}

	#[test]
	fn test_prefixed_stream_empty_head() {
		let task = async {
			let mut stream = PrefixedStream::new(Vec::new(), &b"BODY"[..]);
			let mut result = Vec::new();
			stream.read_to_end(&mut result).await.unwrap();
			assert_eq!(result, b"BODY");
		};
		tokio::runtime::Runtime::new().unwrap().block_on(task);
	}
}
