//! Remote shell driver.
//!
//! Runs the system `ssh` client inside a PTY and drives the interactive
//! login: host-key confirmation, a single password exchange, and detection of
//! rejected logins. A rejected login is reported as
//! [`DriverError::AuthenticationFailed`] so callers can surface it.

use std::time::{Duration, Instant};

use portable_pty::CommandBuilder;

use super::driver::{DriverError, InteractiveDriver};
use super::pty::PtyProcess;

/// How much login transcript to pull per read.
const LOGIN_READ_SIZE: usize = 1024;

/// Upper bound on a single wait while the login is in progress.
const LOGIN_POLL: Duration = Duration::from_millis(100);

/// Settings shared by every remote driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSettings {
    /// ssh client binary.
    pub ssh_program: String,
    /// How long the whole login may take.
    pub login_timeout: Duration,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            ssh_program: "ssh".to_string(),
            login_timeout: Duration::from_secs(15),
        }
    }
}

/// What the login transcript so far indicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LoginEvent {
    /// The server asks for a password.
    PasswordPrompt,
    /// ssh asks to confirm an unknown host key.
    HostKeyPrompt,
    /// The server rejected the credentials.
    Denied(String),
    /// The connection could not be established.
    ConnectFailed(String),
    /// A shell prompt is visible.
    ShellPrompt,
    /// Nothing conclusive yet.
    Pending,
}

const CONNECT_FAILURES: &[&str] = &[
    "could not resolve hostname",
    "connection refused",
    "connection timed out",
    "no route to host",
    "connection closed by",
    "network is unreachable",
];

/// Classifies the login transcript received since the last answered prompt.
pub(crate) fn classify_login_output(transcript: &str) -> LoginEvent {
    let lower = transcript.to_lowercase();

    if lower.contains("permission denied") {
        return LoginEvent::Denied(last_line(transcript));
    }

    if CONNECT_FAILURES.iter().any(|needle| lower.contains(needle)) {
        return LoginEvent::ConnectFailed(last_line(transcript));
    }

    if lower.contains("are you sure you want to continue connecting") {
        return LoginEvent::HostKeyPrompt;
    }

    let tail = lower.trim_end();
    if tail.ends_with("password:") || tail.ends_with("passphrase:") {
        return LoginEvent::PasswordPrompt;
    }

    if tail.ends_with(&['$', '#', '>', '%'][..]) {
        return LoginEvent::ShellPrompt;
    }

    LoginEvent::Pending
}

fn last_line(transcript: &str) -> String {
    transcript
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .unwrap_or("")
        .to_string()
}

/// Drives the login. Returns the transcript that belongs to the shell
/// session (everything received after the login completed).
fn login(
    process: &mut PtyProcess,
    password: Option<&str>,
    timeout: Duration,
) -> Result<Vec<u8>, DriverError> {
    let deadline = Instant::now() + timeout;
    let mut transcript = String::new();
    let mut password_sent = false;

    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(DriverError::Spawn(format!(
                "login timed out after {:?}",
                timeout
            )));
        }

        match process.read(LOGIN_READ_SIZE, (deadline - now).min(LOGIN_POLL)) {
            Some(data) => transcript.push_str(&String::from_utf8_lossy(&data)),
            None => {
                if process.has_exited() {
                    return Err(DriverError::Spawn(format!(
                        "ssh exited during login: {}",
                        last_line(&transcript)
                    )));
                }
                continue;
            }
        }

        match classify_login_output(&transcript) {
            LoginEvent::Denied(reason) => return Err(DriverError::AuthenticationFailed(reason)),
            LoginEvent::ConnectFailed(reason) => return Err(DriverError::Spawn(reason)),
            LoginEvent::HostKeyPrompt => {
                process.write_line("yes")?;
                transcript.clear();
            }
            LoginEvent::PasswordPrompt => {
                if password_sent {
                    return Err(DriverError::AuthenticationFailed(
                        "password rejected".to_string(),
                    ));
                }
                let Some(password) = password else {
                    return Err(DriverError::AuthenticationFailed(
                        "password required but none was provided".to_string(),
                    ));
                };
                process.write_line(password)?;
                password_sent = true;
                transcript.clear();
            }
            LoginEvent::ShellPrompt => return Ok(transcript.into_bytes()),
            LoginEvent::Pending => {
                if password_sent && !transcript.trim().is_empty() {
                    return Ok(transcript.into_bytes());
                }
            }
        }
    }
}

/// Interactive shell on a remote host, reached through `ssh`.
pub struct RemoteDriver {
    host: String,
    port: Option<u16>,
    username: String,
    password: Option<String>,
    options: Vec<String>,
    settings: RemoteSettings,
    process: Option<PtyProcess>,
    terminated: bool,
}

impl RemoteDriver {
    pub fn new(
        host: String,
        port: Option<u16>,
        username: String,
        password: Option<String>,
        options: Vec<String>,
        settings: RemoteSettings,
    ) -> Self {
        Self {
            host,
            port,
            username,
            password,
            options,
            settings,
            process: None,
            terminated: false,
        }
    }

    fn command_builder(&self) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.settings.ssh_program);
        cmd.arg("-l");
        cmd.arg(&self.username);

        if let Some(port) = self.port {
            cmd.arg("-p");
            cmd.arg(port.to_string());
        }

        for option in &self.options {
            cmd.arg("-o");
            cmd.arg(option);
        }

        cmd.arg(&self.host);
        cmd
    }
}

impl InteractiveDriver for RemoteDriver {
    fn start(&mut self) -> Result<(), DriverError> {
        if self.terminated {
            return Err(DriverError::Terminated);
        }
        if self.process.is_some() {
            return Ok(());
        }

        tracing::debug!(host = %self.host, user = %self.username, "Spawning ssh login");
        let mut process = PtyProcess::spawn(self.command_builder())?;

        match login(
            &mut process,
            self.password.as_deref(),
            self.settings.login_timeout,
        ) {
            Ok(banner) => {
                process.unread(&banner);
                tracing::info!(host = %self.host, user = %self.username, "Remote login succeeded");
                self.process = Some(process);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(host = %self.host, user = %self.username, error = %e, "Remote login failed");
                process.kill();
                Err(e)
            }
        }
    }

    fn send(&mut self, line: &str) -> Result<(), DriverError> {
        match self.process.as_mut() {
            Some(process) => process.write_line(line),
            None if self.terminated => Err(DriverError::Terminated),
            None => Err(DriverError::NotStarted),
        }
    }

    fn read_nonblocking(
        &mut self,
        max_bytes: usize,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, DriverError> {
        match self.process.as_mut() {
            Some(process) => Ok(process.read(max_bytes, timeout)),
            None if self.terminated => Ok(None),
            None => Err(DriverError::NotStarted),
        }
    }

    fn terminate(&mut self) {
        self.terminated = true;
        if let Some(mut process) = self.process.take() {
            // Polite logout first; the kill covers a hung connection.
            let _ = process.write_line("exit");
            process.kill();
            tracing::debug!(host = %self.host, "Remote shell terminated");
        }
    }

    fn describe(&self) -> String {
        match self.port {
            Some(port) => format!("remote:{}@{}:{}", self.username, self.host, port),
            None => format!("remote:{}@{}", self.username, self.host),
        }
    }
}

impl Drop for RemoteDriver {
    fn drop(&mut self) {
        self.terminate();
    }
}
