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
Server side of an encrypted TCP tunnel carried over WebSocket.

A client opens a WebSocket connection and sends a Shadowsocks AEAD
byte stream over binary messages. The first decrypted payload starts
with a SOCKS5-style target address; everything after that is relayed
to the target TCP endpoint, with the return traffic re-encrypted on
its way back into the WebSocket.
*/

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]
#![allow(clippy::default_trait_access)]

mod prelude;

pub mod codec;
pub mod crypto;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod shadow;
pub mod utils;

pub use server::{Config as ServerConfig, Server};
