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

use super::Error;
use crate::{
	codec::{Decode, Encode},
	crypto::{
		aead::{Decryptor, Encryptor, TAG_LEN},
		key_to_session_key, Method,
	},
	prelude::*,
};
use bytes::Bytes;
use std::num::NonZeroU16;

/// Maximum number of plaintext bytes per payload frame.
pub const MAX_PAYLOAD_LEN: u16 = 0x3fff;

const LEN_FRAME_LEN: usize = 2 + TAG_LEN;

enum ReadState {
	/// Waiting for the peer's salt. Holds the master key the session
	/// key will be derived from.
	Salt { key: Bytes },
	Frames { dec: Box<Decryptor>, next: Frame },
}

enum Frame {
	Length,
	Payload(NonZeroU16),
}

/// Streaming decoder for one direction of a shadowsocks AEAD stream.
///
/// State graph:
///
/// ```not_rust
///                +----------------+     decrypted length     +-----------------+
/// +------+      |                 +------------------------->|                 |
/// | Salt +----->|     Length      |                          |     Payload     |
/// +------+      |                 |<-------------------------+                 |
///                +----------------+     decrypted payload    +-----------------+
/// ```
///
/// A tag that fails to verify or a length outside `[1, 0x3FFF]`
/// poisons the decoder; the connection must be torn down.
pub struct Decoder {
	method: Method,
	state: ReadState,
}

impl Decoder {
	pub fn new(method: Method, key: Bytes) -> Self {
		Self {
			method,
			state: ReadState::Salt { key },
		}
	}
}

impl Decode for Decoder {
	fn expected_len(&self) -> usize {
		match &self.state {
			ReadState::Salt { .. } => self.method.salt_size(),
			ReadState::Frames { next, .. } => match next {
				Frame::Length => LEN_FRAME_LEN,
				Frame::Payload(len) => usize::from(len.get()) + TAG_LEN,
			},
		}
	}

	fn decode_inplace(&mut self, buf: &mut Vec<u8>) -> Result<bool, BoxStdErr> {
		if buf.is_empty() {
			// Transport EOF. Only acceptable on a chunk boundary.
			return match &self.state {
				ReadState::Frames {
					next: Frame::Length,
					..
				} => Ok(true),
				_ => Err(Error::UnexpectedEof.into()),
			};
		}
		match &mut self.state {
			ReadState::Salt { key } => {
				trace!("reading shadowsocks salt ({} bytes)", buf.len());
				debug_assert_eq!(buf.len(), self.method.salt_size());
				let session_key = key_to_session_key(key, buf, self.method);
				let dec = Decryptor::new(&session_key).map_err(Error::FailedCrypto)?;
				self.state = ReadState::Frames {
					dec: Box::new(dec),
					next: Frame::Length,
				};
				Ok(false)
			}
			ReadState::Frames { dec, next } => match next {
				Frame::Length => {
					debug_assert_eq!(buf.len(), LEN_FRAME_LEN);
					dec.open_inplace(buf, &[]).map_err(Error::FailedCrypto)?;
					let len = u16::from_be_bytes([buf[0], buf[1]]);
					let len = NonZeroU16::new(len)
						.filter(|l| l.get() <= MAX_PAYLOAD_LEN)
						.ok_or(Error::BadLength(len))?;
					trace!("shadowsocks payload length: {}", len);
					*next = Frame::Payload(len);
					Ok(false)
				}
				Frame::Payload(len) => {
					let len = usize::from(len.get());
					debug_assert_eq!(buf.len(), len + TAG_LEN);
					dec.open_inplace(buf, &[]).map_err(Error::FailedCrypto)?;
					buf.truncate(len);
					*next = Frame::Length;
					Ok(true)
				}
			},
		}
	}
}

/// Streaming encoder for one direction of a shadowsocks AEAD stream.
///
/// The local salt is sent lazily: it is prepended to the first encoded
/// chunk so that salt and first frame leave in one write.
pub struct Encoder {
	lazy_salt: Vec<u8>,
	enc: Encryptor,
}

impl Encoder {
	/// # Errors
	///
	/// Returns [`Error::FailedCrypto`] if the session key cannot be
	/// used to build an encryptor.
	pub fn new(method: Method, key: &[u8], local_salt: Vec<u8>) -> Result<Self, Error> {
		let session_key = key_to_session_key(key, &local_salt, method);
		let enc = Encryptor::new(&session_key).map_err(Error::FailedCrypto)?;
		Ok(Self {
			lazy_salt: local_salt,
			enc,
		})
	}
}

impl Encode for Encoder {
	fn encode_into(&mut self, src: &[u8], buf: &mut Vec<u8>) -> Result<(), BoxStdErr> {
		buf.clear();

		let src_len = u16::try_from(src.len())
			.ok()
			.and_then(NonZeroU16::new)
			.filter(|len| len.get() <= MAX_PAYLOAD_LEN)
			.ok_or(Error::BadPayload(src.len()))?;

		if !self.lazy_salt.is_empty() {
			buf.extend_from_slice(&self.lazy_salt);
			// Release memory.
			self.lazy_salt = Vec::new();
		}

		buf.reserve(LEN_FRAME_LEN + src.len() + TAG_LEN);
		{
			// Length frame, 2 + TAG_LEN bytes.
			let start = buf.len();
			buf.put_u16(src_len.get());
			let tag = self.enc.seal_inplace(&mut buf[start..], &[])?;
			buf.extend_from_slice(&tag);
		}
		{
			// Payload frame, src.len() + TAG_LEN bytes.
			let start = buf.len();
			buf.extend_from_slice(src);
			let tag = self.enc.seal_inplace(&mut buf[start..], &[])?;
			buf.extend_from_slice(&tag);
		}
		trace!(
			"encoded shadowsocks chunk: {} payload bytes into {} bytes",
			src.len(),
			buf.len()
		);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		codec::{FrameReadHalf, FrameWriteHalf},
		crypto::{self, aead},
		shadow,
	};
	use tokio::io::duplex;

	const PASSWORD: &str = "super-simple-password";

	fn master_key(method: Method) -> Bytes {
		crypto::password_to_key(method.key_size(), PASSWORD)
	}

	/// Encrypt-then-decrypt through an in-memory pipe with a tiny
	/// buffer, so both halves see the stream in small arbitrary
	/// chunks.
	#[test]
	fn test_roundtrip_any_split() {
		let task = async {
			for method in [Method::Aes256Gcm, Method::Chacha20Poly1305] {
				let (client, server) = duplex(7);
				let (_, cw) = tokio::io::split(client);
				let (sr, _) = tokio::io::split(server);

				let salt = shadow::new_salt(method);
				let mut enc = FrameWriteHalf::new(
					MAX_PAYLOAD_LEN.into(),
					Encoder::new(method, &master_key(method), salt).unwrap(),
					cw,
				);
				let mut dec = FrameReadHalf::new(Decoder::new(method, master_key(method)), sr);

				let payloads: Vec<Vec<u8>> = vec![
					b"hello".to_vec(),
					vec![0xab_u8; 1],
					vec![0xcd_u8; 5000],
					vec![0xef_u8; usize::from(MAX_PAYLOAD_LEN)],
				];
				let total: usize = payloads.iter().map(Vec::len).sum();

				let write_task = async {
					for p in &payloads {
						enc.write_all(p).await.unwrap();
					}
					enc.shutdown().await.unwrap();
				};
				let read_task = async {
					let mut result = Vec::new();
					dec.read_to_end(&mut result).await.unwrap();
					result
				};
				let (_, result) = futures::future::join(write_task, read_task).await;

				assert_eq!(result.len(), total);
				let expected: Vec<u8> = payloads.iter().flatten().copied().collect();
				assert_eq!(result, expected, "bad roundtrip for method {}", method);
			}
		};
		tokio::runtime::Runtime::new().unwrap().block_on(task);
	}

	#[test]
	fn test_large_write_is_chunked() {
		// A single write bigger than MAX_PAYLOAD_LEN must come out as
		// several frames but identical bytes.
		let task = async {
			let method = Method::Chacha20Poly1305;
			let (client, server) = duplex(64 * 1024);
			let (_, cw) = tokio::io::split(client);
			let (sr, _) = tokio::io::split(server);

			let mut enc = FrameWriteHalf::new(
				MAX_PAYLOAD_LEN.into(),
				Encoder::new(method, &master_key(method), shadow::new_salt(method)).unwrap(),
				cw,
			);
			let mut dec = FrameReadHalf::new(Decoder::new(method, master_key(method)), sr);

			let data: Vec<u8> = (0..100_000_u32).map(|i| i as u8).collect();
			let write_task = async {
				enc.write_all(&data).await.unwrap();
				enc.shutdown().await.unwrap();
			};
			let read_task = async {
				let mut result = Vec::new();
				dec.read_to_end(&mut result).await.unwrap();
				result
			};
			let (_, result) = futures::future::join(write_task, read_task).await;
			assert_eq!(result, data);
		};
		tokio::runtime::Runtime::new().unwrap().block_on(task);
	}

	#[test]
	fn test_tampered_tag_rejected() {
		let task = async {
			let method = Method::Aes256Gcm;
			let salt = shadow::new_salt(method);
			let mut encoder = Encoder::new(method, &master_key(method), salt).unwrap();

			let mut wire = Vec::new();
			encoder.encode_into(b"hello", &mut wire).unwrap();
			// Flip one bit in the payload tag (the very last byte).
			let last = wire.len() - 1;
			wire[last] ^= 0x01;

			let mut dec =
				FrameReadHalf::new(Decoder::new(method, master_key(method)), wire.as_slice());
			let mut result = Vec::new();
			let err = dec.read_to_end(&mut result).await.unwrap_err();
			assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
			// No plaintext may leak out of a tampered stream.
			assert!(result.is_empty());
		};
		tokio::runtime::Runtime::new().unwrap().block_on(task);
	}

	#[test]
	fn test_tampered_ciphertext_rejected() {
		let task = async {
			let method = Method::Chacha20Poly1305;
			let salt = shadow::new_salt(method);
			let salt_len = salt.len();
			let mut encoder = Encoder::new(method, &master_key(method), salt).unwrap();

			let mut wire = Vec::new();
			encoder.encode_into(b"hello", &mut wire).unwrap();
			// Flip one bit in the length frame ciphertext.
			wire[salt_len] ^= 0x80;

			let mut dec =
				FrameReadHalf::new(Decoder::new(method, master_key(method)), wire.as_slice());
			let mut result = Vec::new();
			let err = dec.read_to_end(&mut result).await.unwrap_err();
			assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
			assert!(result.is_empty());
		};
		tokio::runtime::Runtime::new().unwrap().block_on(task);
	}

	/// Build a raw stream whose length frame decrypts fine but holds a
	/// forbidden value.
	fn wire_with_length(method: Method, len: u16) -> Vec<u8> {
		let salt = shadow::new_salt(method);
		let session_key = key_to_session_key(&master_key(method), &salt, method);
		let mut enc = aead::Encryptor::new(&session_key).unwrap();

		let mut wire = salt;
		let start = wire.len();
		wire.extend_from_slice(&len.to_be_bytes());
		let tag = enc.seal_inplace(&mut wire[start..], &[]).unwrap();
		wire.extend_from_slice(&tag);
		wire
	}

	#[test]
	fn test_bad_length_rejected() {
		let task = async {
			let method = Method::Chacha20Poly1305;
			for bad_len in [0_u16, 0x4000, 0xffff] {
				let wire = wire_with_length(method, bad_len);
				let mut dec =
					FrameReadHalf::new(Decoder::new(method, master_key(method)), wire.as_slice());
				let mut result = Vec::new();
				let err = dec.read_to_end(&mut result).await.unwrap_err();
				assert_eq!(
					err.kind(),
					std::io::ErrorKind::InvalidData,
					"length {} must be rejected",
					bad_len
				);
			}
		};
		tokio::runtime::Runtime::new().unwrap().block_on(task);
	}

	#[test]
	fn test_eof_inside_frame() {
		let task = async {
			let method = Method::Chacha20Poly1305;
			let salt = shadow::new_salt(method);
			let mut encoder = Encoder::new(method, &master_key(method), salt).unwrap();

			let mut wire = Vec::new();
			encoder.encode_into(b"hello", &mut wire).unwrap();
			// Cut the stream in the middle of the payload frame.
			wire.truncate(wire.len() - 3);

			let mut dec =
				FrameReadHalf::new(Decoder::new(method, master_key(method)), wire.as_slice());
			let mut result = Vec::new();
			assert!(dec.read_to_end(&mut result).await.is_err());
		};
		tokio::runtime::Runtime::new().unwrap().block_on(task);
	}

	#[test]
	fn test_encoder_rejects_empty_and_oversize() {
		let method = Method::Chacha20Poly1305;
		let mut encoder =
			Encoder::new(method, &master_key(method), shadow::new_salt(method)).unwrap();
		let mut buf = Vec::new();
		assert!(encoder.encode_into(&[], &mut buf).is_err());
		let big = vec![0_u8; usize::from(MAX_PAYLOAD_LEN) + 1];
		assert!(encoder.encode_into(&big, &mut buf).is_err());
	}
}
