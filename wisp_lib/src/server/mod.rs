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
The tunnel server.

Every inbound TCP connection starts as HTTP. Plain requests get the
static landing page; WebSocket upgrades become tunnels. A tunnel
connection walks through these phases, one task per connection:

1. decrypt the stream and read the target address from the first
   payload,
2. connect to the target over TCP,
3. relay both directions until either side is done.

Anything that fails before phase 3 tears the WebSocket down without
telling the peer why.
*/

pub mod http;

use crate::{
	crypto::{password_to_key, Method},
	prelude::*,
	protocol::ReadError,
	relay::Relay,
	shadow,
	utils::{websocket, BytesCount, PrefixedStream},
};
use bytes::Bytes;
use std::io;
use tokio::{
	io::BufReader,
	net::{TcpListener, TcpStream},
};

pub struct Config {
	pub method: Method,
	pub password: String,
	pub port: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("cannot bind on {addr} ({err})")]
	Bind { addr: SocketAddr, err: io::Error },
	#[error("cannot accept connection ({0})")]
	Accept(io::Error),
}

/// Data shared by every connection, immutable after startup.
struct Context {
	method: Method,
	key: Bytes,
}

pub struct Server {
	ctx: Arc<Context>,
	listener: TcpListener,
}

impl Server {
	/// Derive the master key and bind the listening socket.
	///
	/// # Errors
	///
	/// Returns [`Error::Bind`] if the port cannot be bound.
	pub async fn bind(config: Config) -> Result<Self, Error> {
		let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.port);
		let listener = TcpListener::bind(addr)
			.await
			.map_err(|err| Error::Bind { addr, err })?;
		let key = password_to_key(config.method.key_size(), &config.password);
		Ok(Self {
			ctx: Arc::new(Context {
				method: config.method,
				key,
			}),
			listener,
		})
	}

	/// Local address of the listening socket.
	///
	/// # Errors
	///
	/// Returns an IO error if the socket has no local address.
	pub fn local_addr(&self) -> io::Result<SocketAddr> {
		self.listener.local_addr()
	}

	/// Accept connections forever, one task per connection.
	///
	/// # Errors
	///
	/// Returns [`Error::Accept`] if the listener itself breaks.
	pub async fn serve(self) -> Result<(), Error> {
		loop {
			let (stream, peer) = self.listener.accept().await.map_err(Error::Accept)?;
			let ctx = self.ctx.clone();
			tokio::spawn(async move {
				handle_connection(ctx, stream, peer).await;
			});
		}
	}
}

async fn handle_connection(ctx: Arc<Context>, stream: TcpStream, peer: SocketAddr) {
	trace!("accepted connection from {}", peer);
	let mut stream = BufReader::new(stream);

	let head = match http::read_request_head(&mut stream).await {
		Ok(head) => head,
		Err(http::ReadError::Io(e)) => {
			debug!("[{}] failed to read request head ({})", peer, e);
			return;
		}
		Err(e) => {
			warn!("[{}] {}", peer, e);
			return;
		}
	};

	if !head.upgrade {
		debug!("[{}] plain HTTP {} {}", peer, head.method, head.path);
		if let Err(e) = http::serve_plain(&mut stream, &head).await {
			debug!("[{}] failed to answer plain HTTP request ({})", peer, e);
		}
		return;
	}

	// The request head has already been consumed; replay it so the
	// WebSocket handshake can parse the same request again.
	let ws = match websocket::accept_stream(PrefixedStream::new(head.raw, stream)).await {
		Ok(ws) => ws,
		Err(e) => {
			warn!("[{}] websocket handshake failed ({})", peer, e);
			return;
		}
	};

	if let Err(e) = run_tunnel(&ctx, ws, peer).await {
		debug!("[{}] tunnel closed with error ({})", peer, e);
	}
}

async fn run_tunnel<IO>(ctx: &Context, ws: IO, peer: SocketAddr) -> io::Result<()>
where
	IO: AsyncRead + AsyncWrite + Send + Unpin,
{
	let (r, w) = tokio::io::split(ws);

	let local_salt = shadow::new_salt(ctx.method);
	let (mut crypt_read, crypt_write) =
		shadow::new_crypt_stream(r, w, ctx.method, ctx.key.clone(), local_salt)
			.map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

	// The first payload starts with the target address. Dropping the
	// streams on any failure here force-closes the WebSocket without
	// giving the peer a reason.
	let addr = match SocksAddr::async_read_from(&mut crypt_read).await {
		Ok(addr) => addr,
		Err(ReadError::Io(e)) => {
			warn!("[{}] broken shadowsocks stream ({})", peer, e);
			return Err(e);
		}
		Err(e) => {
			warn!("[{}] invalid target address ({})", peer, e);
			return Err(e.into_io_err());
		}
	};
	trace!("[{}] tunnel target address: {}", peer, addr);

	let remote = match connect_remote(&addr).await {
		Ok(remote) => remote,
		Err(e) => {
			error!("[{}] cannot connect to '{}' ({})", peer, addr, e);
			return Err(e);
		}
	};

	let conn_id = format!("{} -> {}", peer, addr);
	info!("[{}] tunnel established", conn_id);

	let (remote_read, remote_write) = remote.into_split();
	let result = Relay { conn_id: &conn_id }
		.relay_stream(crypt_read, crypt_write, remote_read, remote_write)
		.await;

	match &result {
		Ok(transferred) => info!(
			"[{}] tunnel closed, sent {}, received {}",
			conn_id,
			BytesCount(transferred.send),
			BytesCount(transferred.recv),
		),
		// InvalidData comes out of the AEAD framing (failed tag, bad
		// frame length): the peer misbehaved, not the network.
		Err(e) if e.kind() == io::ErrorKind::InvalidData => {
			warn!("[{}] broken shadowsocks stream ({})", conn_id, e);
		}
		Err(e) => error!("[{}] tunnel broken ({})", conn_id, e),
	}
	result.map(|_| ())
}

async fn connect_remote(addr: &SocksAddr) -> io::Result<TcpStream> {
	match &addr.dest {
		SocksDestination::Ip(ip) => TcpStream::connect(SocketAddr::new(*ip, addr.port)).await,
		SocksDestination::Name(name) => TcpStream::connect((name.as_str(), addr.port)).await,
	}
}
