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
Frame-oriented wrappers over [`AsyncRead`] / [`AsyncWrite`].

[`FrameReadHalf`] pulls exactly the number of bytes the [`Decode`]r
asks for, lets it transform the buffer in place, and serves the decoded
frames through `AsyncRead`/`AsyncBufRead`. The byte stream can be
chunked arbitrarily by the transport; the decoder never sees the
difference.

[`FrameWriteHalf`] feeds each written slice through an [`Encode`]r and
writes the whole encoded buffer before accepting more input, so the
inner transport receives one contiguous blob per frame.
*/

use crate::prelude::*;
use futures::ready;
use std::{
	io,
	task::{Context, Poll},
};
use tokio::io::{AsyncBufRead, ReadBuf};

pub const BUFFER_CAPACITY: usize = 16 * 1024;

pub trait Decode: Send + Sync + Unpin {
	/// Number of bytes `decode_inplace` needs next. Must not be zero.
	fn expected_len(&self) -> usize;

	/// Decode `buf` in place.
	///
	/// `buf` holds exactly `expected_len()` bytes, or nothing at all if
	/// the transport hit EOF. Returns `Ok(true)` when `buf` now holds a
	/// complete frame for the reader (an empty `buf` then means a clean
	/// EOF), `Ok(false)` when more bytes are needed.
	fn decode_inplace(&mut self, buf: &mut Vec<u8>) -> Result<bool, BoxStdErr>;
}

pub trait Encode: Send + Sync + Unpin {
	fn encode_into(&mut self, src: &[u8], buf: &mut Vec<u8>) -> Result<(), BoxStdErr>;
}

// -------------------------------------------------------
//                      Read half
// -------------------------------------------------------

#[derive(Debug)]
enum ReadState {
	/// Reading exactly `buf.len()` bytes from the transport,
	/// `pos` bytes done so far.
	Filling { pos: usize },
	/// Handing the filled buffer to the decoder.
	Decoding,
	/// Serving a decoded frame; `pos` is the first unread byte.
	Buffering { pos: usize },
	/// Clean EOF, all reads return 0 bytes.
	Eof,
	/// IO or decoding error, all reads fail.
	Closed,
}

/// A reader that takes bytes from another [`AsyncRead`] and processes
/// them with a [`Decode`].
///
/// To access the original [`AsyncRead`], use the `r` field directly.
pub struct FrameReadHalf<D: Decode, R: AsyncRead + Unpin> {
	pub r: R,
	decoder: D,
	state: ReadState,
	buf: Vec<u8>,
}

impl<D, R> FrameReadHalf<D, R>
where
	D: Decode,
	R: AsyncRead + Unpin,
{
	pub fn new(decoder: D, r: R) -> Self {
		let len = decoder.expected_len();
		debug_assert!(len > 0);
		let mut buf = Vec::with_capacity(std::cmp::max(len, BUFFER_CAPACITY));
		buf.resize(len, 0);
		Self {
			r,
			decoder,
			state: ReadState::Filling { pos: 0 },
			buf,
		}
	}

	/// Prepare the buffer for the next frame and go back to reading.
	fn next_frame(&mut self) {
		self.buf.resize(self.decoder.expected_len(), 0);
		self.state = ReadState::Filling { pos: 0 };
	}
}

impl<D, R> AsyncRead for FrameReadHalf<D, R>
where
	D: Decode,
	R: AsyncRead + Unpin,
{
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		read_buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		let data = ready!(self.as_mut().poll_fill_buf(cx))?;
		let amt = std::cmp::min(data.len(), read_buf.remaining());
		read_buf.put_slice(&data[..amt]);
		self.consume(amt);
		Poll::Ready(Ok(()))
	}
}

impl<D, R> AsyncBufRead for FrameReadHalf<D, R>
where
	D: Decode,
	R: AsyncRead + Unpin,
{
	fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
		let me = self.get_mut();
		loop {
			match &mut me.state {
				ReadState::Filling { pos } => {
					let n = match ready!(poll_read_exact(Pin::new(&mut me.r), cx, &mut me.buf, pos))
					{
						Ok(n) => n,
						Err(e) => {
							me.state = ReadState::Closed;
							return Err(e).into();
						}
					};
					// n is 0 only on EOF right at a frame boundary; the
					// decoder decides below whether that is acceptable.
					me.buf.truncate(n);
					me.state = ReadState::Decoding;
				}
				ReadState::Decoding => {
					let done = match me.decoder.decode_inplace(&mut me.buf) {
						Ok(done) => done,
						Err(e) => {
							me.state = ReadState::Closed;
							return Err(io::Error::new(io::ErrorKind::InvalidData, e)).into();
						}
					};
					if done {
						if me.buf.is_empty() {
							// Decoder reports a clean EOF.
							me.state = ReadState::Eof;
							me.buf = Vec::new();
							return Ok(&[][..]).into();
						}
						me.state = ReadState::Buffering { pos: 0 };
					} else {
						me.next_frame();
					}
				}
				ReadState::Buffering { pos } => {
					if *pos == me.buf.len() {
						me.next_frame();
					} else {
						return Ok(&me.buf[*pos..]).into();
					}
				}
				ReadState::Eof => return Ok(&[][..]).into(),
				ReadState::Closed => {
					return Err(io::Error::new(
						io::ErrorKind::BrokenPipe,
						"frame reader already closed",
					))
					.into();
				}
			}
		}
	}

	fn consume(self: Pin<&mut Self>, amt: usize) {
		let me = self.get_mut();
		if let ReadState::Buffering { pos } = &mut me.state {
			*pos += amt;
			debug_assert!(*pos <= me.buf.len());
		} else {
			debug_assert!(amt == 0, "consume outside of a buffered frame");
		}
	}
}

// -------------------------------------------------------
//                      Write half
// -------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
enum WriteState {
	/// Encoding bytes from source into the buffer.
	Encoding,
	/// Writing the buffer into the inner writer, `pos` bytes done.
	Writing { pos: usize },
	Closed,
}

/// A writer that encodes bytes with an [`Encode`] and writes them into
/// another [`AsyncWrite`].
///
/// To access the internal encoder or writer, use the `encoder` and `w`
/// fields directly.
pub struct FrameWriteHalf<E: Encode, W: AsyncWrite + Unpin> {
	pub max_payload_len: usize,
	pub encoder: E,
	pub w: W,
	state: WriteState,
	buf: Vec<u8>,
}

impl<E, W> FrameWriteHalf<E, W>
where
	E: Encode,
	W: AsyncWrite + Unpin,
{
	/// Create a new [`FrameWriteHalf`].
	///
	/// If a slice larger than `max_payload_len` is written, only the
	/// first `max_payload_len` bytes are consumed; callers using
	/// `write_all` will loop and emit several frames.
	pub fn new(max_payload_len: usize, encoder: E, w: W) -> Self {
		Self {
			max_payload_len,
			encoder,
			w,
			state: WriteState::Encoding,
			buf: Vec::with_capacity(BUFFER_CAPACITY),
		}
	}
}

impl<E, W> AsyncWrite for FrameWriteHalf<E, W>
where
	E: Encode,
	W: AsyncWrite + Unpin,
{
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		mut src: &[u8],
	) -> Poll<Result<usize, io::Error>> {
		let me = self.get_mut();
		if src.len() > me.max_payload_len {
			src = &src[..me.max_payload_len];
		}
		loop {
			match &mut me.state {
				WriteState::Encoding => {
					me.encoder
						.encode_into(src, &mut me.buf)
						.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
					me.state = WriteState::Writing { pos: 0 };
				}
				WriteState::Writing { pos } => {
					ready!(poll_write_all(Pin::new(&mut me.w), cx, pos, &me.buf))?;
					// Clear the buffer so the encoder overwrites instead
					// of appending next time.
					me.buf.clear();
					me.state = WriteState::Encoding;
					return Poll::Ready(Ok(src.len()));
				}
				WriteState::Closed => {
					return Err(io::Error::new(
						io::ErrorKind::BrokenPipe,
						"frame writer already closed",
					))
					.into();
				}
			}
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
		let me = self.get_mut();
		Pin::new(&mut me.w).poll_flush(cx)
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
		let me = self.get_mut();
		me.state = WriteState::Closed;
		Pin::new(&mut me.w).poll_shutdown(cx)
	}
}

// -------------------------------------------------------
//                      Poll helpers
// -------------------------------------------------------

/// Poll-read exactly `buf.len()` bytes into `buf`, `*pos` of them done
/// already.
///
/// Returns `Ok(buf.len())` when the buffer is full, `Ok(0)` when EOF is
/// reached before any byte arrived, and `Err(UnexpectedEof)` when EOF
/// interrupts a partially filled buffer.
fn poll_read_exact<R>(
	mut reader: Pin<&mut R>,
	cx: &mut Context<'_>,
	buf: &mut [u8],
	pos: &mut usize,
) -> Poll<io::Result<usize>>
where
	R: AsyncRead,
{
	while *pos < buf.len() {
		let mut read_buf = ReadBuf::new(&mut buf[*pos..]);
		ready!(reader.as_mut().poll_read(cx, &mut read_buf))?;
		let n = read_buf.filled().len();
		if n == 0 {
			if *pos == 0 {
				return Poll::Ready(Ok(0));
			}
			return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
		}
		*pos += n;
	}
	Poll::Ready(Ok(buf.len()))
}

/// Poll-write all of `src` into `writer`, `*pos` bytes done already.
fn poll_write_all<W>(
	mut writer: Pin<&mut W>,
	cx: &mut Context<'_>,
	pos: &mut usize,
	src: &[u8],
) -> Poll<io::Result<()>>
where
	W: AsyncWrite + Unpin,
{
	debug_assert!(*pos <= src.len());
	while *pos < src.len() {
		let n = ready!(writer.as_mut().poll_write(cx, &src[*pos..]))?;
		if n == 0 {
			return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
		}
		*pos += n;
	}
	Poll::Ready(Ok(()))
}
