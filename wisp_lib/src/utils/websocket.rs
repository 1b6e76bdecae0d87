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
WebSocket as a byte pipe.

[`StreamWrapper`] turns a message-oriented WebSocket into an
[`AsyncRead`] / [`AsyncWrite`] pair: every `write` becomes exactly one
binary message, and incoming binary messages are drained byte by byte.
The tunnel is an opaque encrypted byte stream, so message boundaries
carry no meaning on the way in.
*/

use super::PollBuffer;
use crate::prelude::*;
use async_tungstenite::{
	tokio::{accept_hdr_async, client_async, TokioAdapter},
	tungstenite::{
		error::Error as WsError,
		handshake::server::{Callback, ErrorResponse, Request, Response},
	},
	WebSocketStream,
};
use futures::{ready, Sink as ItemSink, Stream as ItemStream};
use std::{
	io,
	task::{Context, Poll},
};
use tokio::io::ReadBuf;

pub use async_tungstenite::tungstenite::protocol::Message;

pub type MessageStream<IO> = WebSocketStream<TokioAdapter<IO>>;
pub type Stream<IO> = StreamWrapper<MessageStream<IO>>;

/// Accept a WebSocket handshake on `stream`.
///
/// The upgrade is accepted on any path; the tunnel does not care which
/// endpoint the client picked.
///
/// # Errors
///
/// Returns an IO error if the handshake fails.
pub async fn accept_stream<IO>(stream: IO) -> io::Result<Stream<IO>>
where
	IO: AsyncRead + AsyncWrite + Unpin,
{
	let inner = accept_hdr_async(stream, AnyPath)
		.await
		.map_err(to_io_err)?;
	Ok(StreamWrapper::new(inner))
}

/// Initiate a WebSocket handshake over `stream` with `request`.
///
/// # Errors
///
/// Returns an IO error if the handshake fails or the server does not
/// switch protocols.
pub async fn connect_stream<IO>(stream: IO, request: Request) -> io::Result<Stream<IO>>
where
	IO: 'static + AsyncRead + AsyncWrite + Unpin,
{
	debug!("establishing websocket connection with request {:?}", request);
	let (stream, response) = match client_async(request, stream).await {
		Ok(res) => res,
		Err(err) => return Err(to_io_err(err)),
	};
	if response.status() != http::StatusCode::SWITCHING_PROTOCOLS {
		let msg = format!(
			"incorrect HTTP response status code during websocket connection: {}",
			response.status()
		);
		return Err(io::Error::new(io::ErrorKind::Other, msg));
	}
	Ok(StreamWrapper::new(stream))
}

struct AnyPath;

impl Callback for AnyPath {
	fn on_request(self, request: &Request, response: Response) -> Result<Response, ErrorResponse> {
		debug!("websocket upgrade on path '{}'", request.uri().path());
		Ok(response)
	}
}

#[derive(Debug)]
enum ReadingState {
	Reading,
	Buffering(PollBuffer),
}

/// Adapter from a WebSocket message stream/sink to a byte stream.
#[derive(Debug)]
pub struct StreamWrapper<S>
where
	S: ItemStream<Item = Result<Message, WsError>> + ItemSink<Message, Error = WsError> + Unpin,
{
	inner: S,
	state: ReadingState,
}

impl<S> StreamWrapper<S>
where
	S: ItemStream<Item = Result<Message, WsError>> + ItemSink<Message, Error = WsError> + Unpin,
{
	fn new(inner: S) -> Self {
		Self {
			inner,
			state: ReadingState::Reading,
		}
	}
}

impl<S> AsyncRead for StreamWrapper<S>
where
	S: ItemStream<Item = Result<Message, WsError>> + ItemSink<Message, Error = WsError> + Unpin,
{
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		dst: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		let me = self.get_mut();
		loop {
			match &mut me.state {
				ReadingState::Reading => {
					let res = ready!(Pin::new(&mut me.inner).poll_next(cx));
					if let Some(res) = res {
						match res.map_err(to_io_err)? {
							Message::Binary(buf) => {
								me.state = ReadingState::Buffering(PollBuffer::new(buf));
							}
							Message::Text(buf) => {
								me.state =
									ReadingState::Buffering(PollBuffer::new(buf.into_bytes()));
							}
							Message::Close(_) => {
								return Ok(()).into();
							}
							// Ping/pong is handled by tungstenite itself.
							_ => {}
						}
					} else {
						// EOF reached.
						return Ok(()).into();
					}
				}
				ReadingState::Buffering(buf) => {
					let is_empty = buf.copy_to(dst);
					if is_empty {
						me.state = ReadingState::Reading;
					}
					return Ok(()).into();
				}
			}
		}
	}
}

impl<S> AsyncWrite for StreamWrapper<S>
where
	S: ItemStream<Item = Result<Message, WsError>> + ItemSink<Message, Error = WsError> + Unpin,
{
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<Result<usize, io::Error>> {
		let me = self.get_mut();
		if let Err(err) = ready!(Pin::new(&mut me.inner).poll_ready(cx)) {
			return Err(to_io_err(err)).into();
		}
		if let Err(err) = Pin::new(&mut me.inner).start_send(Message::Binary(buf.to_vec())) {
			return Err(to_io_err(err)).into();
		}
		Ok(buf.len()).into()
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
		let me = self.get_mut();
		if let Err(err) = ready!(Pin::new(&mut me.inner).poll_flush(cx)) {
			return Err(to_io_err(err)).into();
		}
		Ok(()).into()
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
		let me = self.get_mut();
		match ready!(Pin::new(&mut me.inner).poll_close(cx)) {
			// A peer that already went away is fine; the goal was to
			// close the connection anyway.
			Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()).into(),
			Err(err) => Err(to_io_err(err)).into(),
		}
	}
}

#[inline]
fn to_io_err(err: WsError) -> io::Error {
	if let WsError::Io(err) = err {
		return err;
	}
	io::Error::new(io::ErrorKind::Other, err)
}
