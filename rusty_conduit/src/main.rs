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

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::default_trait_access)]

mod args;
mod config;

use args::{Action, AppOptions};
use std::{borrow::Cow, io};

type BoxStdErr = Box<dyn std::error::Error + Send + Sync>;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, thiserror::Error)]
enum Error {
	#[error("[IO error] {0}")]
	Io(#[from] io::Error),
	#[error("[input] {0}")]
	Input(Cow<'static, str>),
	#[error("[config] {0}")]
	Config(BoxStdErr),
	#[error("[runtime] {0}")]
	Runtime(BoxStdErr),
}

impl Error {
	fn exit_code(&self) -> i32 {
		match self {
			Error::Io(_) => exitcode::IOERR,
			Error::Input(_) | Error::Config(_) => exitcode::CONFIG,
			Error::Runtime(_) => exitcode::SOFTWARE,
		}
	}
}

fn main() {
	let action = match AppOptions::new_from_args().into_action() {
		Ok(action) => action,
		Err(err) => {
			eprintln!("{err}");
			std::process::exit(exitcode::USAGE);
		}
	};
	let result = match action {
		Action::CheckVersion => {
			println!("{VERSION}");
			return;
		}
		#[cfg(feature = "parse-config")]
		Action::Serve(action) => serve_utils::serve(action),
	};
	if let Err(err) = result {
		eprintln!("Error happened during initialization:\n {err}\n");
		std::process::exit(err.exit_code());
	}
}

#[cfg(feature = "parse-config")]
mod serve_utils {
	use super::{
		args::ServeAction,
		config::{Config, Format, LogOutput},
		BoxStdErr, Error,
	};
	use conduit_lib::{BytesCount, Event, ProtocolManager};
	use log::{error, info, warn};
	use std::{fs::File, io::Read, path::Path, sync::Arc};
	use tokio::runtime::Runtime;

	fn read_conf_str(path: &Path) -> Result<String, std::io::Error> {
		let mut conf_str = String::with_capacity(1024);
		File::open(path)?.read_to_string(&mut conf_str)?;
		Ok(conf_str)
	}

	fn read_config(conf_str: &str, format: Format) -> Result<Config, BoxStdErr> {
		Ok(match format {
			#[cfg(feature = "parse-config-toml")]
			Format::Toml => toml::from_str(conf_str)?,
			#[cfg(feature = "parse-config-yaml")]
			Format::Yaml => serde_yaml::from_str(conf_str)?,
			#[allow(unreachable_patterns)]
			_ => return Err("config format not supported by this build".into()),
		})
	}

	pub(super) fn serve(action: ServeAction) -> Result<(), Error> {
		let mut conf = {
			let conf_str = read_conf_str(&action.path)
				.map_err(|e| Error::Input(format!("cannot read config: {e}").into()))?;
			read_config(&conf_str, action.format).map_err(Error::Config)?
		};

		// Command line options beat the config file.
		if let Some(level) = action.coms.log {
			conf.log.level = level;
		}
		if let Some(output) = &action.coms.log_out {
			conf.log.output = LogOutput::from_str(output);
		}
		conf.log.init_logger().map_err(Error::Config)?;

		if conf.proxies.is_empty() {
			return Err(Error::Input("no proxies in config".into()));
		}

		let rt = Runtime::new()?;
		rt.block_on(run(conf)).map_err(Error::Runtime)
	}

	async fn run(conf: Config) -> Result<(), BoxStdErr> {
		let manager = Arc::new(ProtocolManager::new());
		manager.add_callback(Box::new(|event| {
			match event {
				Event::Started(name) => info!("adapter '{name}' started"),
				Event::Stopped(name) => info!("adapter '{name}' stopped"),
				Event::Failed { name, error } => error!("adapter '{name}' failed: {error}"),
			}
			Ok(())
		}));

		for proxy in conf.proxies {
			manager.register(proxy.build()).await?;
		}
		if !manager.start_all().await {
			warn!("some adapters failed to start");
		}
		let monitor = manager.spawn_monitor();

		tokio::signal::ctrl_c().await?;
		info!("shutting down");
		monitor.shutdown();
		if !manager.stop_all().await {
			warn!("some adapters failed to stop");
		}

		let summary = manager.summary().await;
		info!(
			"served {} connections, {} sent, {} received, {} errors",
			summary.total_connections,
			BytesCount(summary.bytes_sent),
			BytesCount(summary.bytes_received),
			summary.errors
		);
		Ok(())
	}
}
