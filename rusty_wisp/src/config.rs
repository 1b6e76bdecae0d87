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

use crate::BoxStdErr;
use fern::colors::{Color, ColoredLevelConfig};
use log::LevelFilter;
use std::str::FromStr;
use wisp_lib::{crypto::Method, ServerConfig};

// ------------------- Logging -------------------
const STR_STDOUT: &str = "@stdout";
const STR_STDERR: &str = "@stderr";
const STR_NONE: &str = "@none";

pub enum LogOutput {
	Stdout,
	Stderr,
	File(String),
}

impl LogOutput {
	pub fn is_colorful(&self) -> bool {
		matches!(self, Self::Stdout | Self::Stderr)
	}

	pub fn from_str(s: &str) -> Option<Self> {
		match s {
			STR_NONE => None,
			STR_STDOUT | "" => Some(LogOutput::Stdout),
			STR_STDERR => Some(LogOutput::Stderr),
			_ => Some(LogOutput::File(s.to_string())),
		}
	}
}

pub struct Log {
	pub level: LevelFilter,
	pub output: Option<LogOutput>,
}

impl Log {
	/// Initialize logger.
	///
	/// DO NOT call this function more than once!
	pub fn init_logger(&self) -> Result<(), BoxStdErr> {
		let output = if let Some(output) = &self.output {
			output
		} else {
			// Logging disabled.
			return Ok(());
		};
		let time_format =
			time::format_description::parse("[year]-[month]-[day]T[hour]:[minute]:[second]Z")
				.expect("hardcoded time format must be valid");
		let is_colorful = output.is_colorful();
		let colors = ColoredLevelConfig::new()
			.info(Color::Blue)
			.trace(Color::Magenta);
		let dispatch = fern::Dispatch::new()
			.level(self.level)
			.format(move |out, message, record| {
				let time = time::OffsetDateTime::now_utc()
					.format(&time_format)
					.unwrap_or_default();
				if is_colorful {
					out.finish(format_args!(
						"[{} {} {}] {}",
						time,
						colors.color(record.level()),
						record.target(),
						message
					));
				} else {
					out.finish(format_args!(
						"[{} {} {}] {}",
						time,
						record.level(),
						record.target(),
						message
					));
				}
			});
		match output {
			LogOutput::Stdout => dispatch.chain(std::io::stdout()),
			LogOutput::Stderr => dispatch.chain(std::io::stderr()),
			LogOutput::File(f) => dispatch.chain(fern::log_file(f)?),
		}
		.apply()?;
		Ok(())
	}
}

// ------------------- Server -------------------

const ENV_METHOD: &str = "METHOD";
const ENV_PASS: &str = "PASS";
const ENV_PORT: &str = "PORT";

const DEFAULT_METHOD: Method = Method::Chacha20Poly1305;
const DEFAULT_PASS: &str = "secret";
const DEFAULT_PORT: u16 = 80;

/// Build the server configuration from the environment variables
/// `METHOD`, `PASS` and `PORT`, falling back to the defaults
/// `chacha20-poly1305`, `secret` and `80`.
///
/// # Errors
///
/// Returns an error on an unsupported method or a malformed port.
/// Both are fatal; the caller should exit with a non-zero status.
pub fn from_env() -> Result<ServerConfig, BoxStdErr> {
	let method = match std::env::var(ENV_METHOD) {
		Ok(value) => Method::from_str(&value)?,
		Err(_) => DEFAULT_METHOD,
	};
	let password = std::env::var(ENV_PASS).unwrap_or_else(|_| DEFAULT_PASS.to_string());
	let port = match std::env::var(ENV_PORT) {
		Ok(value) => value
			.parse::<u16>()
			.map_err(|e| format!("invalid {} '{}' ({})", ENV_PORT, value, e))?,
		Err(_) => DEFAULT_PORT,
	};
	Ok(ServerConfig {
		method,
		password,
		port,
	})
}
