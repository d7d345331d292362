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

use super::BoxStdErr;
use clap::{CommandFactory, Parser};

#[cfg(feature = "parse-config")]
use super::config::Format;

#[derive(Parser)]
#[command(name = "rusty_conduit")]
pub struct AppOptions {
	/// Set the format of the config file. Can be 'toml' (default) or 'yaml'.
	#[cfg(feature = "parse-config")]
	#[arg(short, long)]
	format: Option<Format>,

	/// Read config from file.
	#[cfg(feature = "parse-config")]
	#[arg(short, long, value_name = "FILE")]
	config: Option<String>,

	/// Print version.
	#[arg(long)]
	version: bool,

	/// Set the log level. Must be one of ["debug", "info", "warn" (default), "error"]
	#[arg(long, value_name = "LEVEL")]
	log: Option<log::LevelFilter>,

	/// Set the output file for log.
	#[arg(long, value_name = "FILE")]
	log_out: Option<String>,
}

impl AppOptions {
	pub fn new_from_args() -> Self {
		Self::parse()
	}

	pub fn into_action(self) -> Result<Action, BoxStdErr> {
		if self.version {
			return Ok(Action::CheckVersion);
		}

		let coms = ActionCommons {
			log: self.log,
			log_out: self.log_out,
		};

		#[cfg(feature = "parse-config")]
		if let Some(path) = self.config {
			let path = std::path::PathBuf::from(path);
			let format = self.format.unwrap_or_else(|| {
				let mut format = Format::default();
				if let Some(ext) = path.extension() {
					if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") {
						format = Format::Yaml;
					}
				}
				format
			});
			return Ok(Action::Serve(ServeAction { coms, path, format }));
		}

		let _ = coms;
		let mut cmd = Self::command();
		cmd.print_help()?;
		std::process::exit(1);
	}
}

pub enum Action {
	CheckVersion,
	#[cfg(feature = "parse-config")]
	Serve(ServeAction),
}

pub struct ActionCommons {
	pub log: Option<log::LevelFilter>,
	pub log_out: Option<String>,
}

#[cfg(feature = "parse-config")]
pub struct ServeAction {
	pub coms: ActionCommons,
	pub path: std::path::PathBuf,
	pub format: Format,
}
