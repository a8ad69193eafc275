mod classifier;
mod configs;
mod confirm;
mod control;
mod error;
mod hosts;
mod notify;
mod orchestrator;
mod process;
mod remote;
mod snapshot;
mod template;
#[cfg(test)]
mod testing;

use crate::classifier::{is_valid_ip, HostClassifier};
use crate::configs::PatcherConfig;
use crate::control::ControlAction;
use crate::hosts::HostRunner;
use crate::remote::{SshExecutor, Target};
use clap::{Args as ClapArgs, Parser, Subcommand};
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Stops and restarts application processes around server patching")]
struct Args {
    /// Configuration file
    #[arg(
        short,
        long,
        env = "SERVER_PATCHER_CONFIG",
        value_name = "FILE",
        default_value = "config.yml"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Snapshot and stop the managed processes
    Stop {
        #[command(flatten)]
        connection: Connection,
        /// Skip the confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
        /// Handle all hosts at once
        #[arg(long, requires = "yes")]
        parallel: bool,
    },
    /// Start the processes recorded by the last stop
    Start {
        #[command(flatten)]
        connection: Connection,
        /// Handle all hosts at once
        #[arg(long)]
        parallel: bool,
    },
    /// Print the server type of each address
    Classify {
        #[arg(required = true, value_name = "IP")]
        hosts: Vec<String>,
    },
}

#[derive(ClapArgs, Debug)]
struct Connection {
    /// Target host, repeatable
    #[arg(long = "host", value_name = "IP", required = true)]
    hosts: Vec<String>,
    #[arg(short, long, default_value_t = 22)]
    port: u16,
    #[arg(short = 'u', long, env = "SERVER_PATCHER_USER")]
    user: String,
    #[arg(long, env = "SERVER_PATCHER_PASSWORD", hide_env_values = true)]
    password: String,
}

impl Connection {
    fn targets(&self) -> Result<Vec<Target>> {
        self.hosts
            .iter()
            .map(|host| {
                if !is_valid_ip(host) {
                    return Err(eyre!("`{host}` is not a valid IP address"));
                }
                Ok(Target {
                    host: host.clone(),
                    port: self.port,
                    username: self.user.clone(),
                    password: self.password.clone(),
                })
            })
            .collect()
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let args = Args::parse();
    let config: PatcherConfig =
        serde_yaml::from_reader(File::open(&args.config).wrap_err("Failed to open config")?)
            .wrap_err("Failed to read config!")?;

    let filter = EnvFilter::try_from_env("SERVER_PATCHER_LOG")
        .or_else(|_| EnvFilter::try_new(&config.log))
        .wrap_err("Invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    config.validate().wrap_err("Invalid config")?;
    let config = Arc::new(config);

    let (action, connection, assume_yes, parallel) = match args.command {
        Command::Classify { hosts } => {
            let classifier = HostClassifier::new(&config.server_types)?;
            for host in hosts {
                if !is_valid_ip(&host) {
                    return Err(eyre!("`{host}` is not a valid IP address"));
                }
                println!("{host}: {}", classifier.classify(&host));
            }
            return Ok(ExitCode::SUCCESS);
        }
        Command::Stop {
            connection,
            yes,
            parallel,
        } => (ControlAction::Stop, connection, yes, parallel),
        Command::Start {
            connection,
            parallel,
        } => (ControlAction::Start, connection, true, parallel),
    };
    let targets = connection.targets()?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, finishing the current command");
                cancel.cancel();
            }
        }
    });

    let executor = Arc::new(SshExecutor::new(config.ssh.clone()));
    let runner = HostRunner::new(config.clone(), executor, cancel, assume_yes)?;
    let reports = Arc::new(runner).run_all(action, targets, parallel).await;

    for report in &reports {
        match &report.result {
            Ok(outcome) => {
                for line in outcome.report() {
                    info!(host = %report.host, "{line}");
                }
            }
            Err(err) => error!(host = %report.host, "Failed: {err}"),
        }
    }
    Ok(ExitCode::from(hosts::exit_status(&reports)))
}
