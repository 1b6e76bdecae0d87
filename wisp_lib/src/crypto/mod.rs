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
Key material for the Shadowsocks AEAD protocol.

The master key comes from the password with the legacy MD5 chain
(`EVP_BytesToKey` without salt). Each direction of a connection then
derives its own session key with HKDF-SHA1 over a fresh random salt.
*/

pub mod aead;

use crate::prelude::*;
use aead::Key;
use bytes::Bytes;
use hkdf::Hkdf;
use md5::{digest::Digest, Md5};
use sha1::Sha1;
use std::fmt::{self, Display};

const SUBKEY_INFO: &[u8] = b"ss-subkey";

/// Supported AEAD cipher methods.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Method {
	Aes256Gcm,
	Chacha20Poly1305,
}

impl Method {
	#[inline]
	#[must_use]
	pub fn name(self) -> &'static str {
		match self {
			Method::Aes256Gcm => "aes-256-gcm",
			Method::Chacha20Poly1305 => "chacha20-poly1305",
		}
	}

	#[inline]
	#[must_use]
	pub fn key_size(self) -> usize {
		match self {
			Method::Aes256Gcm | Method::Chacha20Poly1305 => 32,
		}
	}

	/// Salt size equals key size for every supported method.
	#[inline]
	#[must_use]
	pub fn salt_size(self) -> usize {
		self.key_size()
	}

	#[inline]
	#[must_use]
	pub fn tag_size(self) -> usize {
		aead::TAG_LEN
	}
}

impl FromStr for Method {
	type Err = UnsupportedMethod;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(match s {
			"aes-256-gcm" => Method::Aes256Gcm,
			"chacha20-poly1305" => Method::Chacha20Poly1305,
			_ => return Err(UnsupportedMethod(s.into())),
		})
	}
}

impl Display for Method {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

#[derive(Debug, thiserror::Error)]
#[error("unsupported cipher method '{0}', must be one of ['aes-256-gcm', 'chacha20-poly1305']")]
pub struct UnsupportedMethod(pub String);

/// Derive `key_len` bytes of master key from `password`.
///
/// This is the legacy MD5 chain: `K0 = MD5(pass)`,
/// `Ki = MD5(K(i-1) || pass)`, key = first `key_len` bytes of
/// `K0 || K1 || ...`. Deterministic, no salt.
#[must_use]
pub fn password_to_key(key_len: usize, password: &str) -> Bytes {
	let digest_len = Md5::output_size();
	let mut result = Vec::with_capacity(std::cmp::max(key_len, digest_len) * 2);

	let mut last: Option<md5::digest::Output<Md5>> = None;
	let mut d = Md5::new();
	while result.len() < key_len {
		if let Some(prev) = &last {
			d.update(prev);
		}
		d.update(password);
		let digest = d.finalize_reset();
		result.extend_from_slice(&digest);
		last = Some(digest);
	}

	result.truncate(key_len);
	result.into()
}

/// Derive the per-direction session key from the master key and a salt
/// with HKDF-SHA1 and the fixed info string `ss-subkey`.
#[must_use]
pub fn key_to_session_key(key: &[u8], salt: &[u8], method: Method) -> Key {
	debug_assert_eq!(salt.len(), method.salt_size());
	let h = Hkdf::<Sha1>::new(Some(salt), key);
	let mut okm = [0_u8; 32];
	h.expand(SUBKEY_INFO, &mut okm)
		.expect("invalid output length for hkdf expanding");
	match method {
		Method::Aes256Gcm => Key::Aes256Gcm(okm),
		Method::Chacha20Poly1305 => Key::ChaCha20Poly1305(okm),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_method_from_str() {
		assert_eq!(Method::from_str("aes-256-gcm").unwrap(), Method::Aes256Gcm);
		assert_eq!(
			Method::from_str("chacha20-poly1305").unwrap(),
			Method::Chacha20Poly1305
		);
		assert!(Method::from_str("aes-128-gcm").is_err());
		assert!(Method::from_str("rc4-md5").is_err());
		assert!(Method::from_str("").is_err());
	}

	#[test]
	fn test_method_sizes() {
		for method in [Method::Aes256Gcm, Method::Chacha20Poly1305] {
			assert_eq!(method.key_size(), 32);
			assert_eq!(method.salt_size(), 32);
			assert_eq!(method.tag_size(), 16);
		}
	}

	#[test]
	fn test_password_to_key() {
		let key = password_to_key(32, "secret");
		assert_eq!(key.len(), 32);
		// Deterministic
		assert_eq!(key, password_to_key(32, "secret"));
		// Short output is a prefix of the long one
		assert_eq!(&key[..16], &password_to_key(16, "secret")[..]);
		// Different passwords give different keys
		assert_ne!(key, password_to_key(32, "secret2"));
	}

	#[test]
	fn test_session_key() {
		let key = password_to_key(32, "secret");
		let salt_a = [0x11_u8; 32];
		let salt_b = [0x22_u8; 32];
		let a = key_to_session_key(&key, &salt_a, Method::Chacha20Poly1305);
		let a2 = key_to_session_key(&key, &salt_a, Method::Chacha20Poly1305);
		let b = key_to_session_key(&key, &salt_b, Method::Chacha20Poly1305);
		assert_eq!(a.as_slice(), a2.as_slice());
		assert_ne!(a.as_slice(), b.as_slice());
		assert_ne!(a.as_slice(), &key[..]);
	}
}
