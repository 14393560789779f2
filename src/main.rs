// Copyright 2025 Stairwell, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{ops::Range, path::PathBuf, process::ExitCode};

use anyhow::{Context, Result};
use clap::Parser;
use multijuju::{
    Config, ConnectManager, ConnectOptions, ControllerConfig, PersonalConfig, TcpController,
    DEFAULT_PORT_RANGE,
};
use smol::LocalExecutor;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = env!("MULTIJUJU_DEFAULT_CONFIG");
const SEPARATOR: &str = "-----------------------------------------------------";

#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Controllers to connect to (default: every configured controller)
    controllers: Vec<String>,

    /// Controller configuration file
    #[arg(short, long, env = "MULTIJUJU_CONFIG", default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Personal configuration overriding controller credentials
    #[arg(long, env = "MULTIJUJU_PERSONAL_CONFIG")]
    personal_config: Option<PathBuf>,

    /// Route tunnelled controllers through sshuttle rather than an SSH port forward
    #[arg(long)]
    sshuttle: bool,

    /// Replace cached connections instead of reusing them
    #[arg(short, long)]
    reconnect: bool,

    /// Local ports available to SSH port forwards, as FIRST-LAST
    #[arg(long, value_parser = parse_port_range)]
    ports: Option<Range<u16>>,

    /// Increase log verbosity (overridden by RUST_LOG)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_port_range(s: &str) -> Result<Range<u16>, String> {
    let (first, last) = s
        .split_once('-')
        .ok_or_else(|| format!("expected FIRST-LAST, got {:?}", s))?;
    let first: u16 = first.parse().map_err(|e| format!("{}: {}", first, e))?;
    let last: u16 = last.parse().map_err(|e| format!("{}: {}", last, e))?;
    if first > last || last == u16::MAX {
        return Err(format!("invalid port range {}-{}", first, last));
    }
    Ok(first..last + 1)
}

fn connect_options(args: &Args) -> ConnectOptions {
    ConnectOptions {
        port_range: args.ports.clone().unwrap_or(DEFAULT_PORT_RANGE),
        reconnect: args.reconnect,
        sshuttle: args.sshuttle,
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "multijuju=debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn transport(controller: &ControllerConfig, sshuttle: bool) -> String {
    match &controller.connection {
        None => "direct".into(),
        Some(c) if sshuttle => format!("sshuttle via {}", c.destination),
        Some(c) => format!("ssh tunnel via {}", c.destination),
    }
}

async fn check(
    manager: &ConnectManager,
    controller: &ControllerConfig,
    options: &ConnectOptions,
) -> bool {
    match manager.get_controller(controller, options).await {
        Ok(_) => {
            println!(
                "{}: connected ({})",
                controller.name,
                transport(controller, options.sshuttle)
            );
            true
        }
        Err(e) => {
            println!("{}: {:#}", controller.name, anyhow::Error::new(e));
            false
        }
    }
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let mut config = Config::load(&args.config)?;
    if let Some(path) = &args.personal_config {
        config = config.merge(PersonalConfig::load(path)?)?;
    }
    config.validate()?;

    let selected: Vec<&ControllerConfig> = if args.controllers.is_empty() {
        config.controllers.iter().collect()
    } else {
        args.controllers
            .iter()
            .map(|name| {
                config
                    .controller(name)
                    .with_context(|| format!("unknown controller {}", name))
            })
            .collect::<Result<_>>()?
    };
    if selected.is_empty() {
        anyhow::bail!("no controllers configured in {}", args.config.display());
    }

    let options = connect_options(&args);
    let manager = ConnectManager::new(TcpController::factory());
    let ex = LocalExecutor::new();

    let (failed, cleaned) = smol::block_on(ex.run(async {
        println!("{}", SEPARATOR);
        let tasks: Vec<_> = selected
            .iter()
            .map(|controller| ex.spawn(check(&manager, controller, &options)))
            .collect();
        let mut failed = 0usize;
        for task in tasks {
            if !task.await {
                failed += 1;
            }
        }
        let cleaned = manager.clean().await;
        println!("{}", SEPARATOR);
        (failed, cleaned)
    }));
    cleaned.context("failed to close connections")?;

    if failed > 0 {
        eprintln!("{} of {} controllers unreachable", failed, selected.len());
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
