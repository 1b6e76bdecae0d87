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
Target address in [SOCKS5 address format], the same format the
Shadowsocks request header uses.

```not_rust
+------+----------------+----------------+
| ATYP |  Destination   |     Port       |
+------+----------------+----------------+
| u8   | various bytes  |   2 bytes      |
|      |                | big endian u16 |
+------+----------------+----------------+
```

[SOCKS5 address format]: https://tools.ietf.org/html/rfc1928#section-5
*/

use crate::prelude::*;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use smol_str::SmolStr;
use std::{
	fmt::{self, Display},
	io,
};

const EMPTY_STRING: &str = "empty string";

#[derive(Debug, Clone, Copy, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum AddrType {
	Ipv4 = 1_u8,
	Name = 3_u8,
	Ipv6 = 4_u8,
}

impl AddrType {
	#[inline]
	#[must_use]
	pub const fn val(self) -> u8 {
		self as u8
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
	#[error("unknown address type {0}")]
	UnknownAddressType(u8),
	#[error("invalid domain ({0})")]
	InvalidDomain(BoxStdErr),
	#[error("IO error ({0})")]
	Io(#[from] io::Error),
}

impl ReadError {
	#[must_use]
	pub fn into_io_err(self) -> io::Error {
		if let Self::Io(e) = self {
			e
		} else {
			io::Error::new(io::ErrorKind::InvalidData, self)
		}
	}
}

// -------------------------------------------------------
//                     SocksDestination
// -------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SocksDestination {
	/// Must be a valid domain name.
	Name(DomainName),
	Ip(IpAddr),
}

impl SocksDestination {
	#[inline]
	#[must_use]
	pub fn atyp(&self) -> AddrType {
		match self {
			SocksDestination::Name(_) => AddrType::Name,
			SocksDestination::Ip(IpAddr::V4(_)) => AddrType::Ipv4,
			SocksDestination::Ip(IpAddr::V6(_)) => AddrType::Ipv6,
		}
	}

	/// Read a destination of address type `atyp` from `r`.
	///
	/// The format for each address type:
	/// - [`AddrType::Ipv4`]: | 4 bytes |
	/// - [`AddrType::Ipv6`]: | 16 bytes |
	/// - [`AddrType::Name`]: | n, 1 byte | n bytes |
	///
	/// # Errors
	///
	/// Returns a [`ReadError`] if the stream ends early or the domain
	/// is not valid.
	pub async fn async_read_from_atyp(
		r: &mut (impl AsyncRead + Unpin),
		atyp: AddrType,
	) -> Result<Self, ReadError> {
		Ok(match atyp {
			AddrType::Ipv4 => Ipv4Addr::from(r.read_u32().await?).into(),
			AddrType::Ipv6 => Ipv6Addr::from(r.read_u128().await?).into(),
			AddrType::Name => {
				let len = r.read_u8().await?;
				if len == 0 {
					return Err(ReadError::InvalidDomain(EMPTY_STRING.into()));
				}
				// Domain length is a u8, which will never be larger than 255.
				let mut buffer = [0_u8; 255];
				let buffer = &mut buffer[..len as usize];
				r.read_exact(buffer).await?;
				let name =
					std::str::from_utf8(buffer).map_err(|e| ReadError::InvalidDomain(e.into()))?;
				SocksDestination::Name(DomainName::from_str(name)?)
			}
		})
	}

	pub fn write_to_no_atyp(&self, buf: &mut impl BufMut) {
		match self {
			SocksDestination::Name(name) => {
				buf.put_u8(name.len());
				buf.put(name.as_bytes());
			}
			SocksDestination::Ip(ip) => match ip {
				IpAddr::V4(ipv4) => {
					buf.put(&ipv4.octets()[..]);
				}
				IpAddr::V6(ipv6) => {
					buf.put(&ipv6.octets()[..]);
				}
			},
		}
	}

	/// Get the minimal length of buffer needed to store the serialized data.
	#[inline]
	#[must_use]
	pub fn serialized_len_atyp(&self) -> usize {
		// ATYP (1 byte) + ADDR
		1 + match self {
			SocksDestination::Ip(ip) => match ip {
				IpAddr::V4(_) => 4,
				IpAddr::V6(_) => 16,
			},
			// N (1 byte) + NAME (N bytes)
			SocksDestination::Name(name) => 1 + name.len() as usize,
		}
	}
}

impl From<DomainName> for SocksDestination {
	#[inline]
	fn from(domain: DomainName) -> Self {
		Self::Name(domain)
	}
}

impl From<Ipv4Addr> for SocksDestination {
	#[inline]
	fn from(ip: Ipv4Addr) -> Self {
		Self::Ip(ip.into())
	}
}

impl From<Ipv6Addr> for SocksDestination {
	#[inline]
	fn from(ip: Ipv6Addr) -> Self {
		Self::Ip(ip.into())
	}
}

impl From<IpAddr> for SocksDestination {
	#[inline]
	fn from(ip: IpAddr) -> Self {
		Self::Ip(ip)
	}
}

impl Display for SocksDestination {
	#[inline]
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Ip(ip) => ip.fmt(f),
			Self::Name(name) => name.fmt(f),
		}
	}
}

// -------------------------------------------------------
//                       SocksAddr
// -------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SocksAddr {
	pub dest: SocksDestination,
	pub port: u16,
}

impl SocksAddr {
	#[inline]
	#[must_use]
	pub fn new(dest: SocksDestination, port: u16) -> Self {
		Self { dest, port }
	}

	/// Read an address from byte stream `r`.
	///
	/// 1) 1 byte is read to determine the address type. See [`AddrType`].
	/// 2) a [`SocksDestination`] is read using that type.
	/// 3) 2 bytes are read into a big endian u16 as port.
	///
	/// # Errors
	///
	/// Returns a [`ReadError`] on an unknown address type, a bad domain
	/// or an IO error (a short buffer shows up as `UnexpectedEof`).
	pub async fn async_read_from<R>(r: &mut R) -> Result<Self, ReadError>
	where
		R: AsyncRead + Unpin,
	{
		let atyp_num = r.read_u8().await?;
		let atyp =
			AddrType::try_from(atyp_num).map_err(|_| ReadError::UnknownAddressType(atyp_num))?;
		let dest = SocksDestination::async_read_from_atyp(r, atyp).await?;
		let port = r.read_u16().await?;
		Ok(Self::new(dest, port))
	}

	/// Return the number of bytes it takes to store the serialized address.
	#[inline]
	#[must_use]
	pub fn serialized_len_atyp(&self) -> usize {
		// length of port(u16) plus the other parts
		self.dest.serialized_len_atyp() + 2
	}

	/// Write the address into `buf` in SOCKS5 address format.
	#[inline]
	pub fn write_to<B: BufMut>(&self, buf: &mut B) {
		buf.put_u8(self.dest.atyp().val());
		self.dest.write_to_no_atyp(buf);
		buf.put_u16(self.port);
	}
}

impl Display for SocksAddr {
	#[inline]
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.dest {
			SocksDestination::Name(name) => write!(f, "{}:{}", name, self.port),
			SocksDestination::Ip(ip) => SocketAddr::new(*ip, self.port).fmt(f),
		}
	}
}

impl From<SocketAddr> for SocksAddr {
	#[inline]
	fn from(addr: SocketAddr) -> Self {
		Self {
			dest: addr.ip().into(),
			port: addr.port(),
		}
	}
}

impl From<(SocksDestination, u16)> for SocksAddr {
	#[inline]
	fn from((dest, port): (SocksDestination, u16)) -> Self {
		Self { dest, port }
	}
}

// -------------------------------------------------------
//                     DomainName
// -------------------------------------------------------

/// A domain string that's guaranteed to be non-empty, at most 255 bytes
/// and ASCII.
///
/// The name travels the wire verbatim and is handed to the resolver as
/// is, so no IDNA normalization is done here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct DomainName(SmolStr);

impl DomainName {
	#[inline]
	#[must_use]
	pub fn as_str(&self) -> &str {
		self.0.as_str()
	}

	#[allow(clippy::cast_possible_truncation)]
	#[inline]
	#[must_use]
	pub fn len(&self) -> u8 {
		// Length is guaranteed to be u8
		self.0.len() as u8
	}

	#[inline]
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

impl FromStr for DomainName {
	type Err = ReadError;

	fn from_str(v: &str) -> Result<Self, ReadError> {
		if v.is_empty() {
			return Err(ReadError::InvalidDomain(EMPTY_STRING.into()));
		}
		if v.len() > 255 {
			return Err(ReadError::InvalidDomain("too long".into()));
		}
		if !v.is_ascii() {
			return Err(ReadError::InvalidDomain(
				format!("'{}' is not ASCII", v.escape_default()).into(),
			));
		}
		// Remove the final dot '.' if possible.
		let v = v.strip_suffix('.').unwrap_or(v);
		Ok(Self(SmolStr::new(v)))
	}
}

impl AsRef<str> for DomainName {
	#[inline]
	fn as_ref(&self) -> &str {
		self.0.as_ref()
	}
}

impl std::ops::Deref for DomainName {
	type Target = SmolStr;

	#[inline]
	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl Display for DomainName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		Display::fmt(&self.0, f)
	}
}

// -------------------------------------------------------
//                          Tests
// -------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use lazy_static::lazy_static;

	const TEST_IPV4: Ipv4Addr = Ipv4Addr::new(1, 2, 3, 4);
	const TEST_IPV6: Ipv6Addr = Ipv6Addr::new(1, 2, 3, 4, 5, 6, 7, 8);
	const TEST_PORT: u16 = 54321;
	lazy_static! {
		static ref TEST_DOMAIN: DomainName = DomainName::from_str("hello.world").unwrap();
	}

	fn test_inputs() -> Vec<(Vec<u8>, SocksAddr)> {
		vec![
			(
				{
					let mut input = vec![];
					input.put_u8(AddrType::Ipv4.val());
					input.put_slice(&TEST_IPV4.octets());
					input.put_u16(TEST_PORT);
					input
				},
				SocksAddr::new(TEST_IPV4.into(), TEST_PORT),
			),
			(
				{
					let mut input = vec![];
					input.put_u8(AddrType::Ipv6.val());
					input.put_slice(&TEST_IPV6.octets());
					input.put_u16(TEST_PORT);
					input
				},
				SocksAddr::new(TEST_IPV6.into(), TEST_PORT),
			),
			(
				{
					let mut input = vec![];
					input.put_u8(AddrType::Name.val());
					input.put_u8(TEST_DOMAIN.len());
					input.put_slice(TEST_DOMAIN.as_bytes());
					input.put_u16(TEST_PORT);
					input
				},
				SocksAddr::new(TEST_DOMAIN.clone().into(), TEST_PORT),
			),
		]
	}

	#[test]
	fn test_addr_async_read_from() {
		let rt = tokio::runtime::Runtime::new().unwrap();
		rt.block_on(async move {
			for (input, expected) in test_inputs() {
				let result = SocksAddr::async_read_from(&mut input.as_slice())
					.await
					.unwrap();
				assert_eq!(
					result, expected,
					"cannot read {:?} into {:?}",
					input, expected
				);
				assert_eq!(result.serialized_len_atyp(), input.len());
			}
		});
	}

	#[test]
	fn test_addr_write_to() {
		for (expected, addr) in test_inputs() {
			let mut buf = Vec::new();
			addr.write_to(&mut buf);
			assert_eq!(buf, expected, "cannot write {:?} to {:?}", addr, expected);
		}
	}

	#[test]
	fn test_addr_read_trailing_bytes_left() {
		// Bytes after the address must stay in the reader untouched.
		let rt = tokio::runtime::Runtime::new().unwrap();
		rt.block_on(async move {
			let mut input = vec![];
			let addr = SocksAddr::new(TEST_IPV4.into(), 80);
			addr.write_to(&mut input);
			input.extend_from_slice(b"GET / HTTP/1.0\r\n\r\n");

			let mut reader = input.as_slice();
			let result = SocksAddr::async_read_from(&mut reader).await.unwrap();
			assert_eq!(result, addr);
			assert_eq!(reader, b"GET / HTTP/1.0\r\n\r\n");
		});
	}

	#[test]
	fn test_addr_read_error() {
		let rt = tokio::runtime::Runtime::new().unwrap();
		rt.block_on(async move {
			{
				// Unknown address type
				let input = [0x02_u8, 0, 0, 0, 0, 0, 0];
				let e = SocksAddr::async_read_from(&mut input.as_ref())
					.await
					.unwrap_err();
				assert!(matches!(e, ReadError::UnknownAddressType(2)));
			}
			{
				// Too short for IPv4
				let input = [0x01_u8, 127, 0];
				let e = SocksAddr::async_read_from(&mut input.as_ref())
					.await
					.unwrap_err();
				assert!(matches!(e, ReadError::Io(_)));
			}
			{
				// Empty domain
				let input = [0x03_u8, 0];
				let e = SocksAddr::async_read_from(&mut input.as_ref())
					.await
					.unwrap_err();
				assert!(matches!(e, ReadError::InvalidDomain(_)));
			}
		});
	}

	#[test]
	fn test_domain_from_str_error() {
		assert!(DomainName::from_str("").is_err(), "empty string");
		assert!(
			DomainName::from_str("bäd.domain").is_err(),
			"non-ASCII should not be accepted"
		);
		assert!(
			DomainName::from_str(std::str::from_utf8(&[b'a'; 256]).unwrap()).is_err(),
			"name longer than 255 bytes should not be accepted"
		);
		// The name goes to the resolver verbatim; any ASCII byte is
		// let through, odd ones included.
		assert!(DomainName::from_str("odd name.example").is_ok());
	}

	#[test]
	fn test_addr_display() {
		let inputs = [
			SocksAddr::new(TEST_IPV4.into(), TEST_PORT),
			SocksAddr::new(TEST_IPV6.into(), TEST_PORT),
			SocksAddr::new(TEST_DOMAIN.clone().into(), TEST_PORT),
		];
		let expected_results = [
			SocketAddr::new(TEST_IPV4.into(), TEST_PORT).to_string(),
			SocketAddr::new(TEST_IPV6.into(), TEST_PORT).to_string(),
			format!("{}:{}", TEST_DOMAIN.as_str(), TEST_PORT),
		];
		for (input, expected) in inputs.iter().zip(expected_results.iter()) {
			assert_eq!(&input.to_string(), expected);
		}
	}
}
