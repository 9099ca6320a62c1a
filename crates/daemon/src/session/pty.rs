//! PTY process plumbing and the local driver.
//!
//! A [`PtyProcess`] runs a child inside a pseudo-terminal. A dedicated reader
//! thread moves everything the child writes into a channel, so a bounded read
//! is just a channel receive with a timeout. When the child exits the reader
//! thread sees EOF, drops its sender, and later reads report no data.

use std::io::{Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::Duration;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};

use super::driver::{DriverError, InteractiveDriver};

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Terminal size handed to every spawned child.
const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// A child process attached to a pseudo-terminal.
pub(crate) struct PtyProcess {
    /// Kept alive for the lifetime of the child; dropping it hangs up the PTY.
    _master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
    output: Receiver<Vec<u8>>,
    /// Bytes received from the reader thread but not yet handed out.
    pending: Vec<u8>,
    pid: Option<u32>,
    closed: bool,
}

impl PtyProcess {
    /// Spawns `cmd` in a fresh PTY and starts the reader thread.
    pub(crate) fn spawn(cmd: CommandBuilder) -> Result<Self, DriverError> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: DEFAULT_ROWS,
                cols: DEFAULT_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| DriverError::Spawn(e.to_string()))?;

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| DriverError::Spawn(e.to_string()))?;
        // The child holds its own copy; ours would keep the PTY open past exit.
        drop(pair.slave);

        let pid = child.process_id();

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| DriverError::Spawn(e.to_string()))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| DriverError::Spawn(e.to_string()))?;

        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name(format!("pty-reader-{}", pid.unwrap_or(0)))
            .spawn(move || pump_output(reader, tx))?;

        Ok(Self {
            _master: pair.master,
            writer,
            child,
            output: rx,
            pending: Vec::new(),
            pid,
            closed: false,
        })
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Writes `line` and a trailing newline.
    pub(crate) fn write_line(&mut self, line: &str) -> Result<(), DriverError> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    /// Reads up to `max_bytes`, waiting at most `timeout` for the first byte.
    pub(crate) fn read(&mut self, max_bytes: usize, timeout: Duration) -> Option<Vec<u8>> {
        if max_bytes == 0 {
            return None;
        }

        if self.pending.is_empty() {
            if self.closed {
                return None;
            }
            match self.output.recv_timeout(timeout) {
                Ok(data) => self.pending.extend_from_slice(&data),
                Err(RecvTimeoutError::Timeout) => return None,
                Err(RecvTimeoutError::Disconnected) => {
                    self.closed = true;
                    return None;
                }
            }
        }

        // Take whatever else is already queued without waiting.
        while self.pending.len() < max_bytes {
            match self.output.try_recv() {
                Ok(data) => self.pending.extend_from_slice(&data),
                Err(_) => break,
            }
        }

        let n = self.pending.len().min(max_bytes);
        Some(self.pending.drain(..n).collect())
    }

    /// Puts bytes back in front of the unread output.
    pub(crate) fn unread(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut restored = data.to_vec();
        restored.append(&mut self.pending);
        self.pending = restored;
    }

    /// Whether the child has already exited.
    pub(crate) fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    /// Kills the child and reaps it.
    pub(crate) fn kill(&mut self) {
        if self.has_exited() {
            return;
        }
        if let Err(e) = self.child.kill() {
            tracing::debug!(pid = ?self.pid, error = %e, "Failed to kill child");
            return;
        }
        if let Err(e) = self.child.wait() {
            tracing::debug!(pid = ?self.pid, error = %e, "Failed to reap child");
        }
    }
}

/// Reader thread body: forward PTY output until EOF or the receiver is gone.
fn pump_output(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<Vec<u8>>) {
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buffer[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // Linux reports EIO on the master once the child is gone.
                tracing::trace!(error = %e, "PTY reader finished");
                break;
            }
        }
    }
}

/// Runs a local command in a PTY.
pub struct LocalDriver {
    command: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    cwd: Option<String>,
    process: Option<PtyProcess>,
    terminated: bool,
}

impl LocalDriver {
    pub fn new(
        command: String,
        args: Vec<String>,
        env: Vec<(String, String)>,
        cwd: Option<String>,
    ) -> Self {
        Self {
            command,
            args,
            env,
            cwd,
            process: None,
            terminated: false,
        }
    }

    /// Process ID of the running child, if started.
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(PtyProcess::pid)
    }

    fn command_builder(&self) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.command);
        cmd.args(&self.args);

        if let Some(ref dir) = self.cwd {
            cmd.cwd(dir);
        }

        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        cmd
    }
}

impl InteractiveDriver for LocalDriver {
    fn start(&mut self) -> Result<(), DriverError> {
        if self.terminated {
            return Err(DriverError::Terminated);
        }
        if self.process.is_some() {
            return Ok(());
        }

        let process = PtyProcess::spawn(self.command_builder())?;
        tracing::debug!(command = %self.command, pid = ?process.pid(), "Spawned local process");
        self.process = Some(process);
        Ok(())
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
            process.kill();
            tracing::debug!(command = %self.command, "Local process terminated");
        }
    }

    fn describe(&self) -> String {
        let mut label = format!("local:{}", self.command);
        for arg in &self.args {
            label.push(' ');
            label.push_str(arg);
        }
        label
    }
}

impl Drop for LocalDriver {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_until(driver: &mut LocalDriver, marker: &str) -> bool {
        let mut seen = String::new();
        for _ in 0..100 {
            if let Ok(Some(data)) = driver.read_nonblocking(4096, Duration::from_millis(50)) {
                seen.push_str(&String::from_utf8_lossy(&data));
                if seen.contains(marker) {
                    return true;
                }
            }
        }
        false
    }

    #[test]
    fn test_describe() {
        let driver = LocalDriver::new(
            "/bin/sh".to_string(),
            vec!["-c".to_string(), "true".to_string()],
            vec![],
            None,
        );
        assert_eq!(driver.describe(), "local:/bin/sh -c true");
    }

    #[test]
    fn test_send_before_start() {
        let mut driver = LocalDriver::new("/bin/sh".to_string(), vec![], vec![], None);
        assert!(matches!(driver.send("echo hi"), Err(DriverError::NotStarted)));
        assert!(matches!(
            driver.read_nonblocking(16, Duration::from_millis(1)),
            Err(DriverError::NotStarted)
        ));
    }

    #[test]
    fn test_spawn_and_echo() {
        let mut driver = LocalDriver::new("/bin/sh".to_string(), vec![], vec![], None);
        driver.start().unwrap();
        assert!(driver.pid().is_some());

        driver.send("echo local_driver_marker").unwrap();
        assert!(read_until(&mut driver, "local_driver_marker"));

        driver.terminate();
    }

    #[test]
    fn test_env_vars() {
        let env = vec![("TERMROOMS_TEST".to_string(), "env_value_42".to_string())];
        let mut driver = LocalDriver::new("/bin/sh".to_string(), vec![], env, None);
        driver.start().unwrap();

        driver.send("echo $TERMROOMS_TEST").unwrap();
        assert!(read_until(&mut driver, "env_value_42"));

        driver.terminate();
    }

    #[test]
    fn test_read_respects_max_bytes() {
        let mut driver = LocalDriver::new(
            "/bin/sh".to_string(),
            vec!["-c".to_string(), "printf 0123456789; sleep 1".to_string()],
            vec![],
            None,
        );
        driver.start().unwrap();

        let mut collected = Vec::new();
        for _ in 0..100 {
            if let Ok(Some(data)) = driver.read_nonblocking(4, Duration::from_millis(50)) {
                assert!(data.len() <= 4);
                collected.extend(data);
            }
            if collected.len() >= 10 {
                break;
            }
        }
        assert_eq!(String::from_utf8_lossy(&collected), "0123456789");

        driver.terminate();
    }

    #[test]
    fn test_read_after_exit_returns_none() {
        let mut driver = LocalDriver::new(
            "/bin/sh".to_string(),
            vec!["-c".to_string(), "exit 0".to_string()],
            vec![],
            None,
        );
        driver.start().unwrap();

        std::thread::sleep(Duration::from_millis(300));

        // Drain whatever the shell printed, then EOF reads as no data.
        let mut last = Some(Vec::new());
        for _ in 0..20 {
            last = driver
                .read_nonblocking(4096, Duration::from_millis(20))
                .unwrap();
            if last.is_none() {
                break;
            }
        }
        assert!(last.is_none());
    }

    #[test]
    fn test_terminate_is_idempotent() {
        let mut driver = LocalDriver::new("/bin/sh".to_string(), vec![], vec![], None);
        driver.start().unwrap();

        driver.terminate();
        driver.terminate();

        assert!(matches!(driver.send("echo hi"), Err(DriverError::Terminated)));
        assert!(driver
            .read_nonblocking(16, Duration::from_millis(1))
            .unwrap()
            .is_none());
        assert!(matches!(driver.start(), Err(DriverError::Terminated)));
    }
}
