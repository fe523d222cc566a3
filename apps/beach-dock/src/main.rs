use beach_dock::config::DockConfig;
use beach_dock::telemetry::logging::{self as logctl, LogConfig, LogLevel};
use beach_dock::{DockError, DockHandle, SessionId, SessionNotice, SessionStatus};
use clap::{Args, Parser, Subcommand};
use std::io::{self, Write};
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

#[tokio::main]
async fn main() {
    match run().await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("❌ {err}");
            std::process::exit(1);
        }
    }
}

async fn run() -> Result<i32, CliError> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logctl::init(&log_config).map_err(|err| CliError::Logging(err.to_string()))?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let config = DockConfig::from_env().map_err(DockError::from)?;
    debug!(api = %config.api_base(), stream = %config.stream_base(), "backend configured");
    let dock = DockHandle::connect(config)?;

    let code = match cli.command {
        Command::Run(args) => handle_run(&dock, args).await,
        Command::Shell(args) => handle_shell(&dock, args).await,
    };
    let _ = dock.shutdown().await;
    code
}

#[derive(Parser, Debug)]
#[command(
    name = "beach-dock",
    about = "Run remote jobs and shells with resumable output streams",
    author,
    version
)]
struct Cli {
    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "BEACH_DOCK_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "BEACH_DOCK_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a command as a remote job and stream its output
    Run(RunArgs),
    /// Open an interactive shell; stdin lines are forwarded as input
    Shell(ShellArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(
        long,
        short = 'w',
        value_name = "DIR",
        default_value = ".",
        help = "Workspace the job runs in"
    )]
    workspace: String,

    #[arg(
        trailing_var_arg = true,
        required = true,
        value_name = "COMMAND",
        help = "Command line to execute"
    )]
    command: Vec<String>,
}

#[derive(Args, Debug)]
struct ShellArgs {
    #[arg(
        long,
        short = 'w',
        value_name = "DIR",
        default_value = ".",
        help = "Workspace the shell starts in"
    )]
    workspace: String,

    #[arg(long, value_name = "PROGRAM", help = "Program to launch instead of the default shell")]
    command: Option<String>,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Dock(#[from] DockError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("no command given")]
    MissingCommand,
    #[error("logging initialization failed: {0}")]
    Logging(String),
}

async fn handle_run(dock: &DockHandle, args: RunArgs) -> Result<i32, CliError> {
    let command = args.command.join(" ");
    if command.trim().is_empty() {
        return Err(CliError::MissingCommand);
    }
    let notices = dock.subscribe();
    let tab = dock.open_tab(command.clone()).await?;
    let session = dock
        .create_job_session(tab, command, args.workspace)
        .await?;
    follow(dock, session, notices).await
}

async fn handle_shell(dock: &DockHandle, args: ShellArgs) -> Result<i32, CliError> {
    let notices = dock.subscribe();
    let tab = dock.open_tab("shell").await?;
    let session = dock
        .create_terminal_session(tab, args.workspace, args.command)
        .await?;

    let input = dock.clone();
    let forward = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Err(err) = input.send_stdin(session, format!("{line}\n")).await {
                        warn!(error = %err, "failed to forward input");
                        break;
                    }
                }
                Ok(None) => {
                    debug!("stdin closed; ending shell");
                    let _ = input.close(session).await;
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "failed to read stdin");
                    break;
                }
            }
        }
    });

    let code = follow(dock, session, notices).await;
    forward.abort();
    code
}

/// Prints the session's output until it reaches a terminal status. Ctrl-C
/// cancels the session instead of exiting.
async fn follow(
    dock: &DockHandle,
    session: SessionId,
    mut notices: broadcast::Receiver<SessionNotice>,
) -> Result<i32, CliError> {
    let mut stdout = io::stdout();
    loop {
        let notice = tokio::select! {
            notice = notices.recv() => notice,
            _ = tokio::signal::ctrl_c() => {
                dock.cancel(session).await?;
                continue;
            }
        };
        match notice {
            Ok(SessionNotice::Output {
                session: owner,
                sequence,
                data,
            }) if owner == session => {
                match sequence {
                    Some(_) => write!(stdout, "{data}")?,
                    // Synthetic lines (stream errors, exit summaries) are dimmed.
                    None => writeln!(stdout, "\x1b[2m{data}\x1b[0m")?,
                }
                stdout.flush()?;
            }
            Ok(SessionNotice::Status {
                session: owner,
                status,
            }) if owner == session && status.is_terminal() => {
                return Ok(exit_code(dock, session, status).await);
            }
            Ok(SessionNotice::Removed { session: owner }) if owner == session => return Ok(0),
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "output notices dropped"),
            Err(RecvError::Closed) => return Err(DockError::EngineStopped.into()),
        }
    }
}

async fn exit_code(dock: &DockHandle, session: SessionId, status: SessionStatus) -> i32 {
    let reported = dock
        .session(session)
        .await
        .ok()
        .and_then(|snapshot| snapshot.exit_code);
    match (status, reported) {
        (_, Some(code)) => code,
        (SessionStatus::Done, None) | (SessionStatus::Killed, None) => 0,
        (SessionStatus::Cancelled, None) => 130,
        _ => 1,
    }
}
