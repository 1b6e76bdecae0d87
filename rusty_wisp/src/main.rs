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

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::default_trait_access)]

mod config;

use config::LogOutput;
use log::info;
use structopt::StructOpt;
use tokio::runtime::Runtime;
use wisp_lib::Server;

type BoxStdErr = Box<dyn std::error::Error + Send + Sync>;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(StructOpt)]
#[structopt(name = "rusty_wisp")]
pub struct AppOptions {
	/// Set the log level. Must be one of ["trace", "debug", "info", "warn" (default), "error"]
	#[structopt(long, name = "LOG_LEVEL")]
	log: Option<log::LevelFilter>,

	/// Set the output for log. Can be a file path, '@stdout' (default), '@stderr' or '@none'.
	#[structopt(long, name = "LOG_FILE")]
	log_out: Option<String>,

	/// Print version.
	#[structopt(long)]
	version: bool,
}

fn main() {
	if let Err(err) = run(AppOptions::from_args()) {
		eprintln!("Error: {}", err);
		std::process::exit(1);
	}
}

fn run(opts: AppOptions) -> Result<(), BoxStdErr> {
	if opts.version {
		println!("rusty_wisp {}", VERSION);
		return Ok(());
	}

	let log = config::Log {
		level: opts.log.unwrap_or(log::LevelFilter::Warn),
		output: opts
			.log_out
			.as_deref()
			.map_or(Some(LogOutput::Stdout), LogOutput::from_str),
	};
	log.init_logger()?;

	// Unsupported method or bad port is fatal here, before anything
	// touches the network.
	let server_config = config::from_env()?;
	info!(
		"starting rusty_wisp {} with method '{}' on port {}",
		VERSION, server_config.method, server_config.port
	);

	let rt = Runtime::new()?;
	rt.block_on(async move {
		let server = Server::bind(server_config).await?;
		info!("listening on {}", server.local_addr()?);
		server.serve().await?;
		Ok(())
	})
}
