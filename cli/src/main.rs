//! Warden CLI binary
//!
//! Runs child processes under a supervisor, either a single program or
//! command line, or every process listed in a TOML file.

use clap::{Parser, Subcommand};
use cli::{forward_input, run_status, CliError, OutputMode, Runner, Sinks, StdinMode};
use std::path::PathBuf;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{error, info, warn};
use warden_core::config::load_from_toml_path;
use warden_core::utils::{init_tracing, shell_exit_status};
use warden_core::{ProcessOptions, Target};

/// Time allowed for children to exit after a terminate request
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "Run and supervise child processes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every process listed in a TOML file
    Run {
        /// Path to the TOML file
        #[arg(long, value_name = "FILE")]
        config: PathBuf,
        /// Give up waiting after this many seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },
    /// Run a program directly
    Exec {
        /// Give up waiting after this many seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
        /// Create a new process group for the child
        #[arg(long)]
        group: bool,
        program: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Run a command line through /bin/sh
    Sh {
        /// Give up waiting after this many seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
        /// Create a new process group for the child
        #[arg(long)]
        group: bool,
        command_line: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { config, timeout } => run_config(config, timeout, cli.log_level).await,
        Commands::Exec {
            timeout,
            group,
            program,
            args,
        } => {
            setup_tracing(cli.log_level.as_deref());
            let target = Target::Program {
                executable: program,
                args,
            };
            run_single(target, group, timeout).await
        }
        Commands::Sh {
            timeout,
            group,
            command_line,
        } => {
            setup_tracing(cli.log_level.as_deref());
            run_single(Target::Shell { command_line }, group, timeout).await
        }
    };

    match result {
        Ok(status) => std::process::exit(status),
        Err(e) => {
            error!("Command failed: {}", e);
            eprintln!("warden: {} ({})", e, e.code());
            std::process::exit(1);
        }
    }
}

fn setup_tracing(level: Option<&str>) {
    if let Err(e) = init_tracing(level.unwrap_or("warn")) {
        eprintln!("warden: {}", e);
    }
}

async fn run_config(
    path: PathBuf,
    timeout: Option<u64>,
    log_level: Option<String>,
) -> cli::Result<i32> {
    let file = load_from_toml_path(&path).map_err(|e| CliError::ConfigError(e.to_string()))?;
    setup_tracing(log_level.as_deref().or(file.supervisor.log_level.as_deref()));

    let max_wait = timeout
        .map(Duration::from_secs)
        .or_else(|| file.supervisor.wait_timeout());

    let runner = Runner::new(Handle::current(), Sinks::stdio());
    for entry in &file.processes {
        if let Err(e) = runner.spawn_entry(entry) {
            error!("[{}] failed to start: {}", entry.name, e);
            runner.supervisor().terminate_all();
            runner.wait(Some(SHUTDOWN_GRACE)).await?;
            return Err(e);
        }
    }
    info!("Started {} processes from {:?}", file.processes.len(), path);

    let completed = supervise(&runner, max_wait).await?;
    Ok(run_status(&runner.exits(), completed))
}

async fn run_single(target: Target, group: bool, timeout: Option<u64>) -> cli::Result<i32> {
    let runner = Runner::new(Handle::current(), Sinks::stdio());
    let options = ProcessOptions::default().with_new_process_group(group);
    let child = runner.spawn("main", target, options, StdinMode::Open, OutputMode::Raw)?;
    tokio::spawn(forward_input(tokio::io::stdin(), child));

    let completed = supervise(&runner, timeout.map(Duration::from_secs)).await?;
    if !completed {
        return Ok(2);
    }
    let code = runner
        .exits()
        .first()
        .map(|exit| exit.code)
        .unwrap_or(warden_core::EXIT_CODE_UNKNOWN);
    Ok(shell_exit_status(code))
}

/// Wait for every child, terminating them all on Ctrl-C or timeout
///
/// Returns `false` on timeout, or when the children did not exit within the
/// shutdown grace period after an interrupt.
async fn supervise(runner: &Runner, max_wait: Option<Duration>) -> cli::Result<bool> {
    let interrupted = tokio::select! {
        res = runner.wait(max_wait) => {
            if res? {
                return Ok(true);
            }
            false
        }
        _ = tokio::signal::ctrl_c() => true,
    };

    if interrupted {
        info!("Interrupted, terminating children");
    } else {
        warn!("Timed out waiting for children, terminating");
    }

    runner.supervisor().terminate_all();
    let drained = runner.wait(Some(SHUTDOWN_GRACE)).await?;
    if !drained {
        warn!(
            "Children still running after {:?}: {:?}",
            SHUTDOWN_GRACE,
            runner.supervisor().running_pids()
        );
    }
    Ok(interrupted && drained)
}
