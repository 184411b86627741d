//! Process handle for worker subprocesses.

use super::ipc::{LineReader, LineWriter, PipeFd};
use super::signals::TerminationReason;
use crate::error::{PoolError, Result};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Handle to a worker subprocess.
///
/// The pipes are handed out at spawn time; this handle only tracks the
/// process itself.
#[derive(Debug)]
pub struct Proc {
    pid: Pid,
    /// Termination reason once reaped.
    reaped: Option<TerminationReason>,
}

impl Proc {
    /// Spawn `command` with piped stdin/stdout.
    ///
    /// Returns the handle, a writer to the child's stdin and a reader of its
    /// stdout. Stderr is inherited so worker logs reach the parent's stderr.
    pub fn spawn(command: &mut Command) -> Result<(Self, LineWriter, LineReader)> {
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| PoolError::Worker(format!("Failed to spawn worker: {}", e)))?;

        let pid = Pid::from_raw(child.id() as i32);
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::Worker("Child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::Worker("Child stdout not captured".into()))?;

        // `Child` neither kills nor waits on drop; reaping happens through waitpid below
        let proc = Self { pid, reaped: None };
        Ok((
            proc,
            LineWriter::new(PipeFd::from(stdin)),
            LineReader::new(PipeFd::from(stdout)),
        ))
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Check if the process is still running (non-blocking).
    pub fn is_running(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }

    /// Reason for termination, if the process has been reaped.
    #[cfg(test)]
    pub(crate) fn reason(&self) -> Option<TerminationReason> {
        self.reaped
    }

    /// Try to reap the process without blocking.
    ///
    /// Returns `None` while it is still running.
    pub fn try_wait(&mut self) -> Result<Option<TerminationReason>> {
        if let Some(reason) = self.reaped {
            return Ok(Some(reason));
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => Ok(Some(self.record(status.into()))),
            Err(nix::errno::Errno::ECHILD) => Ok(Some(self.record(TerminationReason::Unknown))),
            Err(e) => Err(PoolError::Worker(format!("waitpid failed: {}", e))),
        }
    }

    /// Wait for the process to exit (blocking).
    pub fn wait(&mut self) -> Result<TerminationReason> {
        if let Some(reason) = self.reaped {
            return Ok(reason);
        }
        match waitpid(self.pid, None) {
            Ok(status) => Ok(self.record(status.into())),
            Err(nix::errno::Errno::ECHILD) => Ok(self.record(TerminationReason::Unknown)),
            Err(e) => Err(PoolError::Worker(format!("waitpid failed: {}", e))),
        }
    }

    fn record(&mut self, reason: TerminationReason) -> TerminationReason {
        self.reaped = Some(reason);
        reason
    }

    /// Send SIGTERM to the process.
    pub fn terminate(&self) -> Result<()> {
        self.signal(Signal::SIGTERM)
    }

    /// Send SIGKILL to the process and wait for it to exit.
    pub fn kill(&mut self) -> Result<TerminationReason> {
        self.signal(Signal::SIGKILL)?;
        self.wait()
    }

    fn signal(&self, sig: Signal) -> Result<()> {
        if self.reaped.is_some() {
            return Ok(());
        }
        match signal::kill(self.pid, sig) {
            // Exited but not yet reaped
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(PoolError::Worker(format!("Failed to send {:?}: {}", sig, e))),
        }
    }

    /// Give the process `grace` to exit on its own, then SIGTERM, then SIGKILL.
    pub fn stop(&mut self, grace: Duration) -> Result<TerminationReason> {
        if let Some(reason) = self.wait_for(grace)? {
            return Ok(reason);
        }

        self.terminate()?;
        if let Some(reason) = self.wait_for(Duration::from_millis(100))? {
            return Ok(reason);
        }

        self.kill()
    }

    fn wait_for(&mut self, timeout: Duration) -> Result<Option<TerminationReason>> {
        let start = Instant::now();
        loop {
            if let Some(reason) = self.try_wait()? {
                return Ok(Some(reason));
            }
            if start.elapsed() >= timeout {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if self.reaped.is_none() {
            let _ = signal::kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
            self.reaped = Some(TerminationReason::Unknown);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_cat_and_stop() {
        let (mut proc, mut writer, mut reader) =
            Proc::spawn(&mut Command::new("cat")).expect("Failed to spawn cat");
        assert!(proc.is_running());

        writer.write_line("echo me").unwrap();
        assert_eq!(reader.read_line().unwrap(), Some("echo me"));

        // Closing stdin lets cat exit cleanly within the grace period
        drop(writer);
        let reason = proc.stop(Duration::from_secs(2)).expect("Failed to stop");
        assert!(reason.is_clean());
        assert!(!proc.is_running());
    }

    #[test]
    fn test_terminate_sleep() {
        let mut command = Command::new("sleep");
        command.arg("60");
        let (mut proc, _writer, _reader) = Proc::spawn(&mut command).expect("Failed to spawn sleep");
        assert!(proc.is_running());

        proc.terminate().expect("Failed to terminate");
        let reason = proc.wait().unwrap();
        assert_eq!(reason, TerminationReason::Signaled(Signal::SIGTERM));
        assert!(!proc.is_running());
        assert_eq!(proc.reason(), Some(reason));
    }

    #[test]
    fn test_stop_escalates_when_process_lingers() {
        let mut command = Command::new("sleep");
        command.arg("60");
        let (mut proc, _writer, _reader) = Proc::spawn(&mut command).unwrap();
        let reason = proc.stop(Duration::from_millis(20)).unwrap();
        assert!(reason.is_requested());
    }

    #[test]
    fn test_signal_after_reap_is_noop() {
        let (mut proc, writer, _reader) = Proc::spawn(&mut Command::new("cat")).unwrap();
        drop(writer);
        proc.wait().unwrap();
        assert!(proc.terminate().is_ok());
        assert!(proc.kill().is_ok());
    }

    #[test]
    fn test_spawn_missing_program_fails() {
        let err = Proc::spawn(&mut Command::new("/nonexistent/procpool-worker")).unwrap_err();
        assert!(err.to_string().contains("Failed to spawn worker"));
    }
}
