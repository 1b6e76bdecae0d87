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

use crate::prelude::BoxStdErr;
use std::convert::TryInto;
use ring::aead::{
	Aad, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey, AES_256_GCM,
	CHACHA20_POLY1305,
};

pub const TAG_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;

/// A session key bound to one AEAD algorithm.
pub enum Key {
	Aes256Gcm([u8; 32]),
	ChaCha20Poly1305([u8; 32]),
}

impl Key {
	#[inline]
	#[must_use]
	pub fn as_slice(&self) -> &[u8] {
		match self {
			Key::Aes256Gcm(key) | Key::ChaCha20Poly1305(key) => key,
		}
	}

	fn to_unbound(&self) -> Result<UnboundKey, BoxStdErr> {
		let (algo, key) = match self {
			Key::Aes256Gcm(key) => (&AES_256_GCM, key.as_ref()),
			Key::ChaCha20Poly1305(key) => (&CHACHA20_POLY1305, key.as_ref()),
		};
		UnboundKey::new(algo, key).map_err(|_| "invalid AEAD key length".into())
	}
}

impl AsRef<[u8]> for Key {
	#[inline]
	fn as_ref(&self) -> &[u8] {
		self.as_slice()
	}
}

/// A nonce sequence that treats the nonce as an unsigned little-endian
/// integer starting at zero, increased by 1 after every frame.
pub struct CounterSequence {
	nonce: [u8; NONCE_LEN],
}

impl Default for CounterSequence {
	fn default() -> Self {
		Self {
			nonce: [0_u8; NONCE_LEN],
		}
	}
}

impl CounterSequence {
	#[inline]
	#[must_use]
	pub fn curr(&self) -> &[u8; NONCE_LEN] {
		&self.nonce
	}
}

impl NonceSequence for CounterSequence {
	fn advance(&mut self) -> Result<Nonce, ring::error::Unspecified> {
		let val = self.nonce;
		increase(&mut self.nonce);
		Ok(Nonce::assume_unique_for_key(val))
	}
}

#[inline]
pub fn increase(nonce: &mut [u8; NONCE_LEN]) {
	for i in nonce {
		if *i == u8::MAX {
			*i = 0;
		} else {
			*i += 1;
			return;
		}
	}
}

pub struct Encryptor {
	key: SealingKey<CounterSequence>,
}

impl Encryptor {
	/// Create an encryptor with the nonce counter at zero.
	///
	/// # Errors
	///
	/// Returns an error if the key length does not match the algorithm.
	pub fn new(key: &Key) -> Result<Self, BoxStdErr> {
		Ok(Self {
			key: SealingKey::new(key.to_unbound()?, CounterSequence::default()),
		})
	}

	/// Seal `buf` in place and return the detached tag.
	/// The nonce counter advances on every call.
	///
	/// # Errors
	///
	/// Returns an error if sealing fails (e.g. input too large).
	pub fn seal_inplace(&mut self, buf: &mut [u8], aad: &[u8]) -> Result<[u8; TAG_LEN], BoxStdErr> {
		let tag = self
			.key
			.seal_in_place_separate_tag(Aad::from(aad), buf)
			.map_err(|_| "unable to seal AEAD plaintext")?;
		Ok(tag
			.as_ref()
			.try_into()
			.expect("AEAD tag is always 16 bytes"))
	}
}

pub struct Decryptor {
	key: OpeningKey<CounterSequence>,
}

impl Decryptor {
	/// Create a decryptor with the nonce counter at zero.
	///
	/// # Errors
	///
	/// Returns an error if the key length does not match the algorithm.
	pub fn new(key: &Key) -> Result<Self, BoxStdErr> {
		Ok(Self {
			key: OpeningKey::new(key.to_unbound()?, CounterSequence::default()),
		})
	}

	/// Open `buf` (ciphertext || tag) in place, returning the plaintext
	/// part. An authentication failure is unrecoverable; the stream
	/// must be torn down.
	///
	/// # Errors
	///
	/// Returns an error if the tag does not verify.
	pub fn open_inplace<'b>(
		&mut self,
		buf: &'b mut [u8],
		aad: &[u8],
	) -> Result<&'b [u8], BoxStdErr> {
		let plain_text = self
			.key
			.open_in_place(Aad::from(aad), buf)
			.map_err(|_| "unable to decrypt AEAD ciphertext")?;
		Ok(plain_text)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::crypto::{key_to_session_key, password_to_key, Method};

	fn test_key(method: Method) -> Key {
		let key = password_to_key(32, "test-password");
		key_to_session_key(&key, &[0x42_u8; 32], method)
	}

	#[test]
	fn test_nonce_increase() {
		let mut nonce = [0_u8; NONCE_LEN];
		increase(&mut nonce);
		assert_eq!(nonce, [1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
		nonce[0] = u8::MAX;
		increase(&mut nonce);
		assert_eq!(nonce, [0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
		let mut nonce = [u8::MAX; NONCE_LEN];
		increase(&mut nonce);
		assert_eq!(nonce, [0_u8; NONCE_LEN]);
	}

	#[test]
	fn test_counter_sequence() {
		let mut seq = CounterSequence::default();
		assert_eq!(seq.curr(), &[0_u8; NONCE_LEN]);
		seq.advance().unwrap();
		assert_eq!(seq.curr(), &[1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
		seq.advance().unwrap();
		assert_eq!(seq.curr(), &[2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
	}

	#[test]
	fn test_seal_open() {
		for method in [Method::Aes256Gcm, Method::Chacha20Poly1305] {
			let mut enc = Encryptor::new(&test_key(method)).unwrap();
			let mut dec = Decryptor::new(&test_key(method)).unwrap();

			let zeros = [0_u8; 1000];
			for msg in [&b"hello"[..], &b"world"[..], &zeros[..]] {
				let mut buf = msg.to_vec();
				let tag = enc.seal_inplace(&mut buf, &[]).unwrap();
				buf.extend_from_slice(&tag);

				let plain = dec.open_inplace(&mut buf, &[]).unwrap();
				assert_eq!(plain, msg);
			}
		}
	}

	#[test]
	fn test_open_tampered() {
		let mut enc = Encryptor::new(&test_key(Method::Chacha20Poly1305)).unwrap();
		let mut dec = Decryptor::new(&test_key(Method::Chacha20Poly1305)).unwrap();

		let mut buf = b"hello".to_vec();
		let tag = enc.seal_inplace(&mut buf, &[]).unwrap();
		buf.extend_from_slice(&tag);
		// Flip one bit of the tag.
		let last = buf.len() - 1;
		buf[last] ^= 0x01;
		assert!(dec.open_inplace(&mut buf, &[]).is_err());
	}

	#[test]
	fn test_open_wrong_nonce_order() {
		let mut enc = Encryptor::new(&test_key(Method::Aes256Gcm)).unwrap();
		let mut dec = Decryptor::new(&test_key(Method::Aes256Gcm)).unwrap();

		let mut first = b"first".to_vec();
		let tag = enc.seal_inplace(&mut first, &[]).unwrap();
		first.extend_from_slice(&tag);

		let mut second = b"second".to_vec();
		let tag = enc.seal_inplace(&mut second, &[]).unwrap();
		second.extend_from_slice(&tag);

		// Decrypting the second frame first must fail: nonces are strictly
		// ordered per direction.
		assert!(dec.open_inplace(&mut second, &[]).is_err());
	}
}
