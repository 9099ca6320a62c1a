//! termrooms daemon and CLI
//!
//! `termrooms start` runs the daemon in the foreground; every other command
//! talks to a running daemon over its Unix socket.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use termrooms::config::Config;
use termrooms::ipc::{get_socket_path, IpcClient, IpcRequest, IpcResponse};
use termrooms::orchestrator::{DaemonOrchestrator, OrchestratorEvent};
use termrooms::session::{BroadcastReport, DriverParams, RoomEvent, SessionSummary};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// How long client commands wait to reach the daemon.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// termrooms - interactive sessions shared through output rooms.
#[derive(Parser, Debug)]
#[command(name = "termrooms")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Daemon socket (defaults to $XDG_RUNTIME_DIR/termrooms/daemon.sock)
    #[arg(long, global = true, value_name = "PATH")]
    pub socket: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the daemon in the foreground
    Start,

    /// Stop the running daemon
    Stop {
        /// Timeout in seconds for graceful shutdown (default: 30)
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Show daemon status
    Status,

    /// Manage sessions
    #[command(subcommand)]
    Sessions(SessionsCommands),

    /// Send input lines to several sessions at once
    Broadcast {
        /// Target session IDs, comma separated (default: every session)
        #[arg(long, short, value_delimiter = ',')]
        targets: Vec<String>,

        /// Lines to send, in order
        #[arg(required = true)]
        inputs: Vec<String>,
    },

    /// Watch a session's output and type into it
    Attach {
        /// Session ID to attach to
        session_id: String,

        /// Observer name shown to the daemon (generated if omitted)
        #[arg(long)]
        client_id: Option<String>,

        /// Only watch; do not forward stdin
        #[arg(long)]
        read_only: bool,
    },
}

/// Subcommands for session management.
#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    /// List all sessions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Start a session (local by default, remote with --remote)
    Start(StartArgs),

    /// Replace a session with a fresh one, keeping its observers
    Restart(StartArgs),

    /// Stop a session, keeping its history
    Stop {
        /// Session ID to stop
        session_id: String,
    },

    /// Stop a session and forget it
    Kill {
        /// Session ID to kill
        session_id: String,
    },

    /// Send one line of input to a session
    Send {
        /// Target session ID
        session_id: String,

        /// Line to send
        text: String,
    },

    /// Print a session's output history
    History {
        /// Session ID
        session_id: String,

        /// Print chunks exactly as stored instead of rendering line breaks
        #[arg(long)]
        raw: bool,
    },
}

/// Arguments shared by `sessions start` and `sessions restart`.
#[derive(Args, Debug, Clone, PartialEq)]
pub struct StartArgs {
    /// Session ID
    pub session_id: String,

    /// Log in to this host over ssh instead of spawning a local command
    #[arg(long, value_name = "HOST")]
    pub remote: Option<String>,

    /// Remote user name (default: $USER)
    #[arg(long, short, requires = "remote")]
    pub user: Option<String>,

    /// Remote ssh port
    #[arg(long, short, requires = "remote")]
    pub port: Option<u16>,

    /// Remote password, answered at the login prompt
    #[arg(long, requires = "remote")]
    pub password: Option<String>,

    /// Extra ssh `-o` option (repeatable)
    #[arg(long = "ssh-option", short = 'o', requires = "remote")]
    pub ssh_options: Vec<String>,

    /// Working directory for a local command
    #[arg(long, conflicts_with = "remote")]
    pub cwd: Option<String>,

    /// Environment variable KEY=VALUE for a local command (repeatable)
    #[arg(long = "env", short = 'e', value_parser = parse_env_pair, conflicts_with = "remote")]
    pub env: Vec<(String, String)>,

    /// Local command and arguments, after `--` (default: configured shell)
    #[arg(last = true, conflicts_with = "remote")]
    pub command: Vec<String>,
}

impl StartArgs {
    /// Driver parameters for the daemon.
    pub fn params(&self) -> anyhow::Result<DriverParams> {
        if let Some(host) = &self.remote {
            let username = match &self.user {
                Some(user) => user.clone(),
                None => std::env::var("USER").context("--user is required when $USER is unset")?,
            };
            return Ok(DriverParams::Remote {
                host: host.clone(),
                port: self.port,
                username,
                password: self.password.clone(),
                options: self.ssh_options.clone(),
            });
        }

        let mut words = self.command.iter().cloned();
        Ok(DriverParams::Local {
            command: words.next(),
            args: words.collect(),
            env: self.env.clone(),
            cwd: self.cwd.clone(),
        })
    }
}

/// Parse a `KEY=VALUE` pair.
fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Validate configuration
    config.validate()?;

    let daemon_mode = matches!(cli.command, Commands::Start);
    let _log_guard = init_logging(&config, cli.verbose, daemon_mode)?;

    if let Some(config_path) = &cli.config {
        tracing::debug!("Using config file: {:?}", config_path);
    }

    let socket_path = cli.socket.clone().unwrap_or_else(get_socket_path);

    let result = match cli.command {
        Commands::Start => run_daemon(config, socket_path).await,
        Commands::Stop { timeout } => graceful_stop_daemon(&socket_path, timeout).await,
        Commands::Status => print_status(&socket_path).await,
        Commands::Sessions(cmd) => run_sessions_command(&socket_path, cmd).await,
        Commands::Broadcast { targets, inputs } => {
            let targets = if targets.is_empty() {
                None
            } else {
                Some(targets)
            };
            let mut client = connect(&socket_path).await?;
            let response = expect_ok(client.send(IpcRequest::Broadcast { targets, inputs }).await?)?;
            match response {
                IpcResponse::Broadcasted { report } => {
                    print_broadcast_report(&report);
                    Ok(())
                }
                _ => Err(unexpected()),
            }
        }
        Commands::Attach {
            session_id,
            client_id,
            read_only,
        } => attach(&socket_path, session_id, client_id, read_only).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// Installs the tracing subscriber.
///
/// Logs go to stderr. When running the daemon with `log_file` set, they are
/// also written to a daily rolling file next to it; the returned guard
/// flushes that file on drop.
fn init_logging(
    config: &Config,
    verbose: bool,
    daemon_mode: bool,
) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

    let mut guard = None;
    let file_layer = match (&config.daemon.log_file, daemon_mode) {
        (Some(log_file), true) => {
            let log_file = if log_file.is_relative() {
                config.daemon.data_dir.join(log_file)
            } else {
                log_file.clone()
            };
            let directory = log_file
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            let file_name = log_file
                .file_name()
                .context("log_file must name a file")?
                .to_owned();
            std::fs::create_dir_all(&directory).with_context(|| {
                format!("Failed to create log directory: {}", directory.display())
            })?;

            let appender = tracing_appender::rolling::daily(directory, file_name);
            let (writer, file_guard) = tracing_appender::non_blocking(appender);
            guard = Some(file_guard);
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(writer),
            )
        }
        _ => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(guard)
}

/// Connect to the daemon or explain that it is not running.
async fn connect(socket_path: &Path) -> anyhow::Result<IpcClient> {
    IpcClient::connect_with_timeout(socket_path, CONNECT_TIMEOUT)
        .await
        .map_err(|_| anyhow::anyhow!("Daemon is not running (cannot connect to socket)"))
}

/// Turns an `Error` response into an `Err`.
fn expect_ok(response: IpcResponse) -> anyhow::Result<IpcResponse> {
    match response {
        IpcResponse::Error { kind, message } => {
            anyhow::bail!("{} ({:?})", message, kind)
        }
        other => Ok(other),
    }
}

fn unexpected() -> anyhow::Error {
    anyhow::anyhow!("Unexpected response from daemon")
}

/// Run the daemon until SIGTERM, SIGINT or a client's `Stop` request.
async fn run_daemon(config: Config, socket_path: PathBuf) -> anyhow::Result<()> {
    // Check for an existing daemon before replacing its socket
    if let Ok(mut client) =
        IpcClient::connect_with_timeout(&socket_path, Duration::from_millis(500)).await
    {
        if client.ping().await.unwrap_or(false) {
            anyhow::bail!(
                "Daemon already running on {} (stop it with: termrooms stop)",
                socket_path.display()
            );
        }
    }

    tracing::info!("termrooms daemon starting...");

    let mut orchestrator = DaemonOrchestrator::new(config, socket_path);
    orchestrator.start().await?;

    // Subscribe to orchestrator events for logging
    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!("Orchestrator state: {:?}", state);
                }
                OrchestratorEvent::SessionStarted { session_id } => {
                    tracing::info!(session_id = %session_id, "Session started");
                }
                OrchestratorEvent::SessionTerminated { session_id } => {
                    tracing::info!(session_id = %session_id, "Session terminated");
                }
                OrchestratorEvent::ClientAttached {
                    session_id,
                    client_id,
                } => {
                    tracing::debug!(session_id = %session_id, client_id = %client_id, "Observer attached");
                }
                OrchestratorEvent::ClientDetached {
                    session_id,
                    client_id,
                } => {
                    tracing::debug!(session_id = %session_id, client_id = %client_id, "Observer detached");
                }
                OrchestratorEvent::StopRequested => {
                    tracing::info!("Stop requested by client");
                }
                OrchestratorEvent::Error { message } => {
                    tracing::error!("Orchestrator error: {}", message);
                }
            }
        }
    });

    let shutdown = orchestrator.shutdown_token();
    tokio::select! {
        signal = wait_for_shutdown_signal() => signal?,
        _ = shutdown.cancelled() => {}
    }

    orchestrator.stop().await?;

    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

/// Gracefully stop the daemon via IPC.
///
/// Sends a stop request and waits until the socket stops accepting
/// connections.
async fn graceful_stop_daemon(socket_path: &Path, timeout_secs: u64) -> anyhow::Result<()> {
    let mut client = connect(socket_path).await?;

    println!("Sending shutdown request...");

    client.set_timeout(Duration::from_secs(timeout_secs));
    match expect_ok(client.stop().await?)? {
        IpcResponse::Stopping => {
            println!("Shutdown acknowledged, waiting for daemon to exit...");
        }
        _ => return Err(unexpected()),
    }

    // Wait for daemon to actually exit by polling the socket
    let start = std::time::Instant::now();
    let timeout = Duration::from_secs(timeout_secs);

    while start.elapsed() < timeout {
        if !socket_path.exists()
            || IpcClient::connect_with_timeout(socket_path, Duration::from_millis(100))
                .await
                .is_err()
        {
            println!("Daemon stopped successfully");
            return Ok(());
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    Err(anyhow::anyhow!(
        "Timeout waiting for daemon to exit ({}s)",
        timeout_secs
    ))
}

async fn print_status(socket_path: &Path) -> anyhow::Result<()> {
    let mut client = connect(socket_path).await?;

    match expect_ok(client.status().await?)? {
        IpcResponse::Status {
            running,
            uptime_secs,
            session_count,
            capacity,
        } => {
            println!(
                "Daemon Status: {}",
                if running { "running" } else { "stopping" }
            );
            println!("  Socket:   {}", socket_path.display());
            println!("  Uptime:   {}", format_duration(uptime_secs));
            println!("  Sessions: {}/{}", session_count, capacity);
            Ok(())
        }
        _ => Err(unexpected()),
    }
}

async fn run_sessions_command(socket_path: &Path, cmd: SessionsCommands) -> anyhow::Result<()> {
    let mut client = connect(socket_path).await?;

    match cmd {
        SessionsCommands::List { json } => match expect_ok(client.list_sessions().await?)? {
            IpcResponse::Sessions { sessions } => {
                if json {
                    println!("{}", serde_json::to_string_pretty(&sessions)?);
                } else {
                    print_sessions_table(&sessions);
                }
                Ok(())
            }
            _ => Err(unexpected()),
        },
        SessionsCommands::Start(args) => {
            let params = args.params()?;
            let response = client.start_session(args.session_id, params).await?;
            print_started(expect_ok(response)?)
        }
        SessionsCommands::Restart(args) => {
            let params = args.params()?;
            let response = client
                .send(IpcRequest::RestartSession {
                    session_id: args.session_id,
                    params,
                })
                .await?;
            print_started(expect_ok(response)?)
        }
        SessionsCommands::Stop { session_id } => {
            let response = client.send(IpcRequest::StopSession { session_id }).await?;
            match expect_ok(response)? {
                IpcResponse::SessionStopped { session_id } => {
                    println!("Session {} stopped", session_id);
                    Ok(())
                }
                _ => Err(unexpected()),
            }
        }
        SessionsCommands::Kill { session_id } => {
            let response = client
                .send(IpcRequest::TerminateSession { session_id })
                .await?;
            match expect_ok(response)? {
                IpcResponse::SessionTerminated { session_id } => {
                    println!("Session {} terminated", session_id);
                    Ok(())
                }
                _ => Err(unexpected()),
            }
        }
        SessionsCommands::Send { session_id, text } => {
            match expect_ok(client.send_input(session_id, text).await?)? {
                IpcResponse::InputSent { .. } => Ok(()),
                _ => Err(unexpected()),
            }
        }
        SessionsCommands::History { session_id, raw } => {
            match expect_ok(client.history(session_id).await?)? {
                IpcResponse::History { chunks, .. } => {
                    let mut stdout = tokio::io::stdout();
                    for chunk in chunks {
                        let text = if raw { chunk } else { render_chunk(&chunk) };
                        stdout.write_all(text.as_bytes()).await?;
                    }
                    if raw {
                        stdout.write_all(b"\n").await?;
                    }
                    stdout.flush().await?;
                    Ok(())
                }
                _ => Err(unexpected()),
            }
        }
    }
}

fn print_started(response: IpcResponse) -> anyhow::Result<()> {
    match response {
        IpcResponse::SessionStarted { session } => {
            println!(
                "Session {} {} ({})",
                session.id, session.state, session.driver
            );
            Ok(())
        }
        _ => Err(unexpected()),
    }
}

/// Stream a session's room to stdout and forward stdin lines as input.
async fn attach(
    socket_path: &Path,
    session_id: String,
    client_id: Option<String>,
    read_only: bool,
) -> anyhow::Result<()> {
    let mut client = connect(socket_path).await?;

    let response = client
        .send(IpcRequest::Attach {
            session_id: session_id.clone(),
            client_id,
        })
        .await?;
    match expect_ok(response)? {
        IpcResponse::Attached { client_id, .. } => {
            eprintln!("Attached to {} as {} (Ctrl-C to detach)", session_id, client_id);
        }
        _ => return Err(unexpected()),
    }

    let (mut reader, mut writer) = client.into_split();

    let input_task = if read_only {
        None
    } else {
        let target = session_id.clone();
        Some(tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let request = IpcRequest::SendInput {
                    session_id: target.clone(),
                    text: line,
                };
                if writer.send_request(&request).await.is_err() {
                    break;
                }
            }
        }))
    };

    let mut stdout = tokio::io::stdout();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let result = loop {
        tokio::select! {
            _ = &mut ctrl_c => break Ok(()),
            response = reader.next_response() => match response {
                Ok(Some(IpcResponse::Event { event })) => match event {
                    RoomEvent::History { chunks, .. } => {
                        for chunk in chunks {
                            stdout.write_all(render_chunk(&chunk).as_bytes()).await?;
                        }
                        stdout.flush().await?;
                    }
                    RoomEvent::Output { chunk, .. } => {
                        stdout.write_all(render_chunk(&chunk).as_bytes()).await?;
                        stdout.flush().await?;
                    }
                    RoomEvent::Closed { .. } => {
                        eprintln!();
                        eprintln!("Session {} closed", session_id);
                        break Ok(());
                    }
                    RoomEvent::Dropped { .. } => {
                        eprintln!();
                        break Err(anyhow::anyhow!(
                            "Lost the output of session {}: fell behind or was replaced by another observer",
                            session_id
                        ));
                    }
                },
                Ok(Some(IpcResponse::Error { message, .. })) => eprintln!("Error: {}", message),
                Ok(Some(_)) => {}
                Ok(None) => break Err(anyhow::anyhow!("Daemon closed the connection")),
                Err(e) => break Err(e.into()),
            },
        }
    };

    if let Some(task) = input_task {
        task.abort();
    }
    result
}

/// Turns a filtered chunk back into terminal text.
fn render_chunk(chunk: &str) -> String {
    chunk.replace("<br>", "\n")
}

fn print_broadcast_report(report: &BroadcastReport) {
    println!("Delivered to {} session(s)", report.delivered.len());
    for id in &report.delivered {
        println!("  {}", id);
    }
    if !report.skipped.is_empty() {
        println!("Skipped {} session(s)", report.skipped.len());
        for skipped in &report.skipped {
            println!("  {}: {}", skipped.session_id, skipped.reason);
        }
    }
}

/// Print sessions in a formatted ASCII table.
fn print_sessions_table(sessions: &[SessionSummary]) {
    if sessions.is_empty() {
        println!("No sessions.");
        return;
    }

    // Calculate column widths
    let id_width = sessions
        .iter()
        .map(|s| s.id.chars().count())
        .max()
        .unwrap_or(8)
        .clamp(8, 24);
    let driver_width = sessions
        .iter()
        .map(|s| s.driver.chars().count())
        .max()
        .unwrap_or(6)
        .clamp(6, 32);

    println!(
        "{:<id_width$}  {:<8}  {:<driver_width$}  {:>7}  {:>10}",
        "ID",
        "STATE",
        "DRIVER",
        "CHUNKS",
        "CREATED",
        id_width = id_width,
        driver_width = driver_width
    );
    println!("{}", "-".repeat(id_width + driver_width + 35));

    for session in sessions {
        let state = if session.output_closed {
            format!("{}*", session.state)
        } else {
            session.state.to_string()
        };

        println!(
            "{:<id_width$}  {:<8}  {:<driver_width$}  {:>7}  {:>10}",
            truncate_str(&session.id, id_width),
            state,
            truncate_str(&session.driver, driver_width),
            session.history_chunks,
            format_relative_time(session.created_at),
            id_width = id_width,
            driver_width = driver_width
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
    if sessions.iter().any(|s| s.output_closed) {
        println!("* output closed after a driver error");
    }
}

/// Format a Unix timestamp as relative time (e.g., "5m ago").
fn format_relative_time(timestamp: u64) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let elapsed = now.saturating_sub(timestamp);

    if elapsed < 60 {
        format!("{}s ago", elapsed)
    } else if elapsed < 3600 {
        format!("{}m ago", elapsed / 60)
    } else if elapsed < 86400 {
        format!("{}h ago", elapsed / 3600)
    } else {
        format!("{}d ago", elapsed / 86400)
    }
}

/// Truncate a string to a maximum length, adding "..." if truncated.
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Format a duration in seconds to human-readable format.
fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
