//! The interactive process driver contract.
//!
//! A driver owns one interactive child process or remote shell. Sessions only
//! ever talk to a driver through [`InteractiveDriver`], so the local and the
//! remote variants are interchangeable from the session's point of view.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::pty::LocalDriver;
use super::remote::{RemoteDriver, RemoteSettings};

/// Errors reported by a driver.
#[derive(Error, Debug)]
pub enum DriverError {
    /// The remote side rejected the login.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The process or connection could not be established.
    #[error("failed to spawn: {0}")]
    Spawn(String),

    /// Unexpected I/O failure (not a timeout).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The driver has not been started yet.
    #[error("driver not started")]
    NotStarted,

    /// The driver was terminated.
    #[error("driver terminated")]
    Terminated,
}

/// Operations a session requires from an interactive process.
///
/// All methods are blocking but bounded: `read_nonblocking` never waits
/// longer than its timeout. Callers on an async runtime run reads on the
/// blocking pool.
pub trait InteractiveDriver: Send {
    /// Establishes the underlying process or connection.
    fn start(&mut self) -> Result<(), DriverError>;

    /// Writes one line of input followed by a newline.
    fn send(&mut self, line: &str) -> Result<(), DriverError>;

    /// Reads up to `max_bytes` of output, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` both when nothing arrived in time and when the
    /// output stream has ended.
    fn read_nonblocking(
        &mut self,
        max_bytes: usize,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, DriverError>;

    /// Ends the process or connection. Calling it again is a no-op.
    fn terminate(&mut self);

    /// Short human readable label, e.g. `local:/bin/sh`.
    fn describe(&self) -> String;
}

/// Which kind of driver backs a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    Local,
    Remote,
}

/// Parameters selecting and configuring a driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriverParams {
    /// Spawn a local command in a pseudo-terminal.
    Local {
        /// Program to run. `None` uses the configured default command.
        #[serde(default)]
        command: Option<String>,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: Vec<(String, String)>,
        #[serde(default)]
        cwd: Option<String>,
    },
    /// Log in to a remote host over ssh.
    Remote {
        host: String,
        #[serde(default)]
        port: Option<u16>,
        username: String,
        #[serde(default)]
        password: Option<String>,
        /// Extra `-o` options passed to ssh.
        #[serde(default)]
        options: Vec<String>,
    },
}

impl DriverParams {
    /// Local parameters running `command` with no arguments.
    pub fn local(command: impl Into<String>) -> Self {
        DriverParams::Local {
            command: Some(command.into()),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
        }
    }

    pub fn kind(&self) -> DriverKind {
        match self {
            DriverParams::Local { .. } => DriverKind::Local,
            DriverParams::Remote { .. } => DriverKind::Remote,
        }
    }
}

/// Settings shared by every driver built by a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverDefaults {
    /// Program used when local params do not name one.
    pub command: String,
    /// Arguments used together with the default program.
    pub args: Vec<String>,
    /// Remote login settings.
    pub remote: RemoteSettings,
}

impl Default for DriverDefaults {
    fn default() -> Self {
        Self {
            command: std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string()),
            args: Vec::new(),
            remote: RemoteSettings::default(),
        }
    }
}

/// Builds a driver for `params`. Nothing is spawned until `start()`.
pub fn build_driver(
    params: &DriverParams,
    defaults: &DriverDefaults,
) -> Box<dyn InteractiveDriver> {
    match params {
        DriverParams::Local {
            command,
            args,
            env,
            cwd,
        } => {
            let (command, args) = match command {
                Some(command) => (command.clone(), args.clone()),
                None => (defaults.command.clone(), defaults.args.clone()),
            };
            Box::new(LocalDriver::new(command, args, env.clone(), cwd.clone()))
        }
        DriverParams::Remote {
            host,
            port,
            username,
            password,
            options,
        } => Box::new(RemoteDriver::new(
            host.clone(),
            *port,
            username.clone(),
            password.clone(),
            options.clone(),
            defaults.remote.clone(),
        )),
    }
}

/// Builds drivers for new sessions.
pub trait DriverFactory: Send + Sync {
    fn build(&self, params: &DriverParams) -> Box<dyn InteractiveDriver>;
}

/// The production factory: local PTY and ssh drivers.
#[derive(Debug, Clone, Default)]
pub struct PtyDriverFactory {
    defaults: DriverDefaults,
}

impl PtyDriverFactory {
    pub fn new(defaults: DriverDefaults) -> Self {
        Self { defaults }
    }
}

impl DriverFactory for PtyDriverFactory {
    fn build(&self, params: &DriverParams) -> Box<dyn InteractiveDriver> {
        build_driver(params, &self.defaults)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A scripted in-memory driver for exercising sessions without a PTY.

    use std::collections::VecDeque;
    use std::sync::{Arc, Barrier, Mutex};

    use super::*;

    /// Everything the mock observed, shared with the test body.
    #[derive(Debug, Default)]
    pub struct MockLog {
        pub starts: usize,
        pub sent: Vec<String>,
        pub terminations: usize,
    }

    pub struct MockDriver {
        pub log: Arc<Mutex<MockLog>>,
        pub output: Arc<Mutex<VecDeque<Result<Vec<u8>, std::io::ErrorKind>>>>,
        pub fail_start: Option<fn() -> DriverError>,
        /// When set, `start()` meets the test on this barrier twice: once on
        /// entry and once before returning.
        pub start_gate: Option<Arc<Barrier>>,
        started: bool,
        terminated: bool,
    }

    impl MockDriver {
        pub fn new() -> Self {
            Self {
                log: Arc::new(Mutex::new(MockLog::default())),
                output: Arc::new(Mutex::new(VecDeque::new())),
                fail_start: None,
                start_gate: None,
                started: false,
                terminated: false,
            }
        }

        pub fn failing(error: fn() -> DriverError) -> Self {
            let mut driver = Self::new();
            driver.fail_start = Some(error);
            driver
        }

        pub fn gated(gate: Arc<Barrier>) -> Self {
            let mut driver = Self::new();
            driver.start_gate = Some(gate);
            driver
        }

        pub fn push_output(&self, data: &[u8]) {
            self.output.lock().unwrap().push_back(Ok(data.to_vec()));
        }
    }

    impl InteractiveDriver for MockDriver {
        fn start(&mut self) -> Result<(), DriverError> {
            self.log.lock().unwrap().starts += 1;
            if let Some(gate) = &self.start_gate {
                gate.wait();
                gate.wait();
            }
            if let Some(error) = self.fail_start {
                return Err(error());
            }
            self.started = true;
            Ok(())
        }

        fn send(&mut self, line: &str) -> Result<(), DriverError> {
            if !self.started {
                return Err(DriverError::NotStarted);
            }
            if self.terminated {
                return Err(DriverError::Terminated);
            }
            self.log.lock().unwrap().sent.push(line.to_string());
            Ok(())
        }

        fn read_nonblocking(
            &mut self,
            max_bytes: usize,
            _timeout: Duration,
        ) -> Result<Option<Vec<u8>>, DriverError> {
            if self.terminated {
                return Ok(None);
            }
            match self.output.lock().unwrap().pop_front() {
                Some(Ok(mut data)) => {
                    data.truncate(max_bytes);
                    Ok(Some(data))
                }
                Some(Err(kind)) => Err(DriverError::Io(std::io::Error::from(kind))),
                None => Ok(None),
            }
        }

        fn terminate(&mut self) {
            if !self.terminated {
                self.terminated = true;
                self.log.lock().unwrap().terminations += 1;
            }
        }

        fn describe(&self) -> String {
            "mock".to_string()
        }
    }
}
