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
The Shadowsocks AEAD stream framing.
See more at <https://shadowsocks.org/en/wiki/AEAD-Ciphers.html>

Each direction starts with a randomly generated salt used to derive the
session key, followed by any number of chunks:

```not_rust
+------------------+------------+-------------+----------+
|    encrypted     |    length  |  encrypted  |  payload |
|  payload length  |     tag    |   payload   |    tag   |
+------------------+------------+-------------+----------+
|     2 bytes      |  16 bytes  |  n bytes    | 16 bytes |
+------------------+------------+-------------+----------+
```

The payload length is a big endian u16 in `[1, 0x3FFF]`.

The first decrypted payload of a connection starts with the target
address in [SOCKS5 address format] (use [`SocksAddr::write_to`] to
serialize); any bytes after the address in that payload are the head of
the tunneled stream.

[SOCKS5 address format]: https://tools.ietf.org/html/rfc1928#section-5
*/

mod codec;

pub use codec::{Decoder, Encoder, MAX_PAYLOAD_LEN};

use crate::{
	codec::{FrameReadHalf, FrameWriteHalf},
	crypto::Method,
	prelude::*,
	protocol::ReadError,
};
use bytes::Bytes;
use rand::thread_rng;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("shadowsocks crypto error ({0})")]
	FailedCrypto(BoxStdErr),
	#[error("shadowsocks payload length {0} out of range [1, 16383]")]
	BadLength(u16),
	#[error("shadowsocks payload of {0} bytes cannot be framed")]
	BadPayload(usize),
	#[error("shadowsocks address error ({0})")]
	FailedAddressParsing(#[from] ReadError),
	#[error("EOF in the middle of a shadowsocks frame")]
	UnexpectedEof,
}

pub type CryptReadHalf<R> = FrameReadHalf<Decoder, R>;
pub type CryptWriteHalf<W> = FrameWriteHalf<Encoder, W>;

/// Wrap a split transport into a decrypting read half and an
/// encrypting write half.
///
/// `local_salt` is this side's salt; it is emitted as the first bytes
/// of the write half together with the first frame. The read half
/// derives its session key from the peer's salt once it arrives.
///
/// # Errors
///
/// Returns [`Error::FailedCrypto`] if the encryption key cannot be
/// initialized.
pub fn new_crypt_stream<R, W>(
	r: R,
	w: W,
	method: Method,
	key: Bytes,
	local_salt: Vec<u8>,
) -> Result<(CryptReadHalf<R>, CryptWriteHalf<W>), Error>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	debug_assert_eq!(local_salt.len(), method.salt_size());
	let encoder = Encoder::new(method, &key, local_salt)?;
	let w = FrameWriteHalf::new(MAX_PAYLOAD_LEN.into(), encoder, w);
	let r = FrameReadHalf::new(Decoder::new(method, key), r);
	Ok((r, w))
}

/// Generate a fresh random salt for `method`.
#[must_use]
pub fn new_salt(method: Method) -> Vec<u8> {
	// very unlikely to generate a used salt
	let mut salt = vec![0_u8; method.salt_size()];
	thread_rng().fill_bytes(&mut salt);
	salt
}
