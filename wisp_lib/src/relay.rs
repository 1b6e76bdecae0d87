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
Bidirectional relay between the inbound (decrypted WebSocket) stream
and the outbound (remote TCP) stream.

Each direction is one copier that reads a chunk, then writes it out
completely before reading again. That single-operation-in-flight shape
is what bounds buffering on both sides: neither direction can pile up
more than one chunk.

Half-close rules: a copier that hits read EOF shuts down the opposite
write half and stops; the other direction keeps running so in-flight
data still drains. When one direction finishes, the other is given a
short grace period before the relay returns and both streams drop.
*/

use crate::prelude::*;
use futures::future::{self, Either};
use std::{future::Future, io, time::Duration};
use tokio::time::timeout;

/// Read buffer size per direction. One full shadowsocks payload frame,
/// so one remote read becomes one encrypted frame.
const BUFFER_SIZE: usize = 0x3fff;

const OTHER_TASK_TIMEOUT: Duration = Duration::from_millis(2000);

/// Bytes moved by a finished relay, for the closing log line.
#[derive(Debug, Clone, Copy)]
pub struct Transferred {
	/// Inbound -> outbound.
	pub send: u64,
	/// Outbound -> inbound.
	pub recv: u64,
}

pub struct Relay<'a> {
	pub conn_id: &'a str,
}

impl Relay<'_> {
	/// Relay until both directions are done.
	///
	/// `ir`/`iw` are the inbound read/write halves, `or`/`ow` the
	/// outbound ones.
	///
	/// # Errors
	///
	/// Returns the first IO error that actually matters: write errors
	/// on a direction whose peer already stopped reading are ignored,
	/// as is everything after the grace period expires.
	pub async fn relay_stream<IR, IW, OR, OW>(
		&self,
		ir: IR,
		iw: IW,
		or: OR,
		ow: OW,
	) -> io::Result<Transferred>
	where
		IR: AsyncRead + Unpin,
		IW: AsyncWrite + Unpin,
		OR: AsyncRead + Unpin,
		OW: AsyncWrite + Unpin,
	{
		let send_tag = format!("[{} send]", self.conn_id);
		let recv_tag = format!("[{} recv]", self.conn_id);

		// Inbound ---> Outbound
		let send_task = copy_one_way(ir, ow, &send_tag);
		// Inbound <--- Outbound
		let recv_task = copy_one_way(or, iw, &recv_tag);

		futures::pin_mut!(send_task);
		futures::pin_mut!(recv_task);

		let (send, recv) = match future::select(send_task, recv_task).await {
			Either::Left(((send, send_res), recv_task)) => {
				trace!("{} finished first", send_tag);
				send_res?;
				let recv = finish_other(&recv_tag, recv_task).await?;
				(send, recv)
			}
			Either::Right(((recv, recv_res), send_task)) => {
				trace!("{} finished first", recv_tag);
				recv_res?;
				let send = finish_other(&send_tag, send_task).await?;
				(send, recv)
			}
		};
		Ok(Transferred { send, recv })
	}
}

/// Wait for the remaining direction, but not forever.
async fn finish_other<F>(tag: &str, task: Pin<&mut F>) -> io::Result<u64>
where
	F: Future<Output = (u64, io::Result<()>)>,
{
	match timeout(OTHER_TASK_TIMEOUT, task).await {
		Ok((count, res)) => {
			if let Err(err) = res {
				// The connection is going away anyway.
				debug!("{} error ({}), ignored during teardown", tag, err);
			}
			Ok(count)
		}
		Err(_) => {
			debug!(
				"{} did not finish within {} ms, cutting it off",
				tag,
				OTHER_TASK_TIMEOUT.as_millis()
			);
			Err(io::Error::new(
				io::ErrorKind::TimedOut,
				"relay did not finish in time",
			))
		}
	}
}

/// Copy bytes from `r` to `w` until EOF or error, then shut down `w`.
/// Returns the number of bytes copied.
async fn copy_one_way<R, W>(mut r: R, mut w: W, tag: &str) -> (u64, io::Result<()>)
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let mut count = 0_u64;
	let mut buffer = vec![0_u8; BUFFER_SIZE];
	loop {
		let n = match r.read(&mut buffer).await {
			Ok(n) => n,
			Err(err) => return (count, Err(err)),
		};
		if n == 0 {
			debug!("{} read half reached EOF, shutting down write half", tag);
			let res = w.shutdown().await.map_err(|err| {
				debug!("{} error when shutting down write half ({})", tag, err);
				err
			});
			return (count, res);
		}
		if let Err(err) = w.write_all(&buffer[..n]).await {
			debug!("{} error when writing data ({})", tag, err);
			return (count, Err(err));
		}
		count += n as u64;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Cursor;

	#[test]
	fn test_relay_stream() {
		// in_data  -> out_result
		// out_data -> in_result
		let mut in_data = vec![0_u8; 64];
		for (i, b) in in_data.iter_mut().enumerate() {
			*b = i as u8;
		}
		let mut out_data = vec![0_u8; 128];
		for (i, b) in out_data.iter_mut().enumerate() {
			*b = (i + 64) as u8;
		}

		let rt = tokio::runtime::Runtime::new().unwrap();
		rt.block_on(async move {
			let in_reader = Cursor::new(in_data.clone());
			let in_writer = Cursor::new(Vec::new());
			let out_reader = Cursor::new(out_data.clone());
			let out_writer = Cursor::new(Vec::new());

			let mut in_writer = in_writer;
			let mut out_writer = out_writer;
			let transferred = Relay { conn_id: "test" }
				.relay_stream(in_reader, &mut in_writer, out_reader, &mut out_writer)
				.await
				.unwrap();

			assert_eq!(transferred.send, in_data.len() as u64);
			assert_eq!(transferred.recv, out_data.len() as u64);
			assert_eq!(in_writer.into_inner(), out_data);
			assert_eq!(out_writer.into_inner(), in_data);
		});
	}
}
