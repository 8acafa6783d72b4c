//! Supervision of the external trainer process.
//!
//! The child's stdout and stderr share one pipe, so output arrives as a single
//! stream in the order it was written. The supervisor runs one cooperative
//! loop per child: every iteration checks the abort token and whether the
//! child has exited, then waits at most one poll interval for the next line.
//! A silent child therefore never delays cancellation by more than the poll
//! interval, and a descendant holding the pipe open never outlives the run.

use crate::error::{TrainingError, TrainingResult};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A fully resolved trainer invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl TrainerCommand {
    /// Shell-like rendering for logs.
    pub fn display(&self) -> String {
        let mut out = self.program.display().to_string();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }
}

/// How a supervised run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Aborted,
    Failed {
        /// `None` when the child was killed by a signal or never produced a status.
        exit_code: Option<i32>,
        /// Unrecognized output lines in arrival order; empty when the handler
        /// recorded a structured exception.
        trailing: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineDisposition {
    Recognized,
    Unrecognized,
}

/// Consumer of trainer output lines.
pub trait LineHandler: Send {
    /// Handles one non-empty, whitespace-trimmed line.
    ///
    /// An error ends the run: the child is terminated and the outcome is
    /// `Failed`.
    fn handle_line(&mut self, line: &str) -> TrainingResult<LineDisposition>;

    /// Terminal exception recorded so far, if any.
    fn exception(&self) -> Option<&str>;

    /// Records a terminal exception unless one is already set.
    fn record_exception(&mut self, message: String);
}

/// Runs trainer processes under a shared abort token.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    poll_interval: Duration,
    abort: CancellationToken,
}

impl ProcessSupervisor {
    #[must_use]
    pub fn new(poll_interval: Duration, abort: CancellationToken) -> Self {
        Self { poll_interval, abort }
    }

    /// Spawns `command`, feeds its output to `handler` and reduces the exit
    /// into a [`RunOutcome`].
    ///
    /// Only a failure to spawn is returned as `Err`.
    pub async fn run<H>(&self, command: &TrainerCommand, handler: &mut H) -> TrainingResult<RunOutcome>
    where
        H: LineHandler + ?Sized,
    {
        let spawn_error = |source: std::io::Error| TrainingError::Spawn {
            program: command.program.display().to_string(),
            source,
        };

        let (writer, reader) = pipe::pipe().map_err(spawn_error)?;
        let stderr = writer.into_blocking_fd().map_err(spawn_error)?;
        let stdout = stderr.try_clone().map_err(spawn_error)?;

        // The command owns the parent's copies of the write end; they are
        // closed when it drops at the end of this statement.
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .current_dir(&command.cwd)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;

        info!(pid = ?child.id(), command = %command.display(), "Trainer started");

        // Split on raw bytes and decode lossily; a stray invalid byte in
        // trainer output must not end the run.
        let mut output = BufReader::new(reader).split(b'\n');

        let mut unrecognized = Vec::new();
        let mut aborted = false;
        let mut failed = false;
        let mut exited: Option<ExitStatus> = None;
        let mut drain_until: Option<Instant> = None;

        loop {
            if self.abort.is_cancelled() {
                info!(pid = ?child.id(), "Abort requested, terminating trainer");
                aborted = true;
                terminate(&mut child);
                break;
            }

            if exited.is_none() {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        debug!(?status, "Trainer exited, draining buffered output");
                        exited = Some(status);
                        drain_until = Some(Instant::now() + self.poll_interval);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!(error = %e, "Failed to poll trainer");
                        handler.record_exception(format!("failed to poll trainer: {e}"));
                        failed = true;
                        terminate(&mut child);
                        break;
                    }
                }
            }

            let deadline = drain_until.unwrap_or_else(|| Instant::now() + self.poll_interval);
            let segment = match timeout_at(deadline, output.next_segment()).await {
                // Only a descendant can still hold the pipe once the child is gone.
                Err(_) if drain_until.is_some() => break,
                Err(_) => continue,
                Ok(Ok(Some(segment))) => segment,
                Ok(Ok(None)) => break,
                Ok(Err(e)) => {
                    error!(error = %e, "Failed to read trainer output");
                    handler.record_exception(format!("failed to read trainer output: {e}"));
                    failed = true;
                    terminate(&mut child);
                    break;
                }
            };

            let line = String::from_utf8_lossy(&segment);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match handler.handle_line(line) {
                Ok(LineDisposition::Recognized) => {}
                Ok(LineDisposition::Unrecognized) => {
                    warn!("Unrecognized trainer output: {line}");
                    unrecognized.push(line.to_string());
                }
                Err(e) => {
                    error!(error = %e, "Trainer output rejected, terminating trainer");
                    handler.record_exception(e.to_string());
                    failed = true;
                    terminate(&mut child);
                    break;
                }
            }
        }

        drop(output);
        let status = match exited {
            Some(status) => Ok(status),
            None => self.wait(&mut child, &mut aborted).await,
        };

        if aborted || self.abort.is_cancelled() {
            return Ok(RunOutcome::Aborted);
        }

        let exit_code = match &status {
            Ok(status) => status.code(),
            Err(e) => {
                error!(error = %e, "Failed to wait for trainer");
                handler.record_exception(format!("failed to wait for trainer: {e}"));
                failed = true;
                None
            }
        };

        let succeeded = status.as_ref().is_ok_and(ExitStatus::success);
        if succeeded && !failed {
            info!("Trainer completed");
            return Ok(RunOutcome::Completed);
        }

        match exit_code {
            Some(code) => error!(code, "Trainer failed with error code {code}"),
            None => error!("Trainer terminated without an exit code"),
        }
        let trailing = if handler.exception().is_none() { unrecognized } else { Vec::new() };
        Ok(RunOutcome::Failed { exit_code, trailing })
    }

    /// Waits for the child to exit, still honouring the abort token.
    async fn wait(&self, child: &mut Child, aborted: &mut bool) -> std::io::Result<ExitStatus> {
        loop {
            if let Some(status) = child.try_wait()? {
                debug!(?status, "Trainer exited");
                return Ok(status);
            }
            if !*aborted && self.abort.is_cancelled() {
                info!(pid = ?child.id(), "Abort requested, terminating trainer");
                *aborted = true;
                terminate(child);
            }
            sleep(self.poll_interval).await;
        }
    }
}

fn terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Trainer already exited");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::log_line::parse_line;
    
    /// Treats header lines as recognized and fails on `FATAL`. Cancels
    /// `cancel_on` when a line containing `CANCEL` arrives.
    #[derive(Default)]
    struct ScriptedHandler {
        lines: Vec<String>,
        exception: Option<String>,
        cancel_on: Option<CancellationToken>,
    }

    impl LineHandler for ScriptedHandler {
        fn handle_line(&mut self, line: &str) -> TrainingResult<LineDisposition> {
            self.lines.push(line.to_string());
            if line.contains("CANCEL") {
                if let Some(token) = &self.cancel_on {
                    token.cancel();
                }
            }
            if line.contains("FATAL") {
                return Err(TrainingError::InvalidMetric("fatal line".to_string()));
            }
            Ok(match parse_line(line) {
                Some(_) => LineDisposition::Recognized,
                None => LineDisposition::Unrecognized,
            })
        }

        fn exception(&self) -> Option<&str> {
            self.exception.as_deref()
        }

        fn record_exception(&mut self, message: String) {
            self.exception.get_or_insert(message);
        }
    }

    fn sh(script: &str) -> TrainerCommand {
        TrainerCommand {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: std::env::temp_dir(),
        }
    }

    fn supervisor(abort: CancellationToken) -> ProcessSupervisor {
        ProcessSupervisor::new(Duration::from_millis(10), abort)
    }

    #[tokio::test]
    async fn test_zero_exit_completes() {
        let mut handler = ScriptedHandler::default();
        let outcome = supervisor(CancellationToken::new())
            .run(&sh("echo '2015-06-01 12:30:45 [INFO ] hello'; echo '   '; echo oops >&2"), &mut handler)
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(handler.lines.len(), 2);
        assert!(handler.lines.contains(&"oops".to_string()));
    }

    #[tokio::test]
    async fn test_nonzero_exit_reports_unrecognized_lines_in_order() {
        let mut handler = ScriptedHandler::default();
        let outcome = supervisor(CancellationToken::new())
            .run(
                &sh("echo '2015-06-01 12:30:45 [INFO ] loading'; echo first; echo second; exit 137"),
                &mut handler,
            )
            .await
            .unwrap();

        assert_eq!(
            outcome,
            RunOutcome::Failed { exit_code: Some(137), trailing: vec!["first".to_string(), "second".to_string()] }
        );
    }

    #[tokio::test]
    async fn test_stderr_lines_keep_write_order() {
        for _ in 0..20 {
            let mut handler = ScriptedHandler::default();
            let outcome = supervisor(CancellationToken::new())
                .run(&sh("echo a; echo b >&2; echo c; echo d >&2; exit 137"), &mut handler)
                .await
                .unwrap();

            let expected: Vec<String> = ["a", "b", "c", "d"].iter().map(ToString::to_string).collect();
            assert_eq!(outcome, RunOutcome::Failed { exit_code: Some(137), trailing: expected });
        }
    }

    #[tokio::test]
    async fn test_run_ends_when_child_exits_despite_background_writer() {
        let started = Instant::now();
        let mut handler = ScriptedHandler::default();
        let outcome = supervisor(CancellationToken::new())
            .run(&sh("sleep 5 & echo done; exit 0"), &mut handler)
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(handler.lines, vec!["done".to_string()]);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_exit_drains_buffered_output() {
        let mut handler = ScriptedHandler::default();
        let outcome = supervisor(CancellationToken::new())
            .run(&sh("sleep 5 & for i in 1 2 3 4 5; do echo line $i; done; exit 4"), &mut handler)
            .await
            .unwrap();

        match outcome {
            RunOutcome::Failed { exit_code, trailing } => {
                assert_eq!(exit_code, Some(4));
                assert_eq!(trailing.len(), 5);
                assert_eq!(trailing.last().map(String::as_str), Some("line 5"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_recorded_exception_suppresses_trailing_lines() {
        let mut handler = ScriptedHandler { exception: Some("out of memory".to_string()), ..Default::default() };
        let outcome = supervisor(CancellationToken::new())
            .run(&sh("echo garbage; exit 3"), &mut handler)
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::Failed { exit_code: Some(3), trailing: Vec::new() });
    }

    #[tokio::test]
    async fn test_abort_before_zero_exit_wins() {
        let abort = CancellationToken::new();
        abort.cancel();

        let mut handler = ScriptedHandler::default();
        let outcome = supervisor(abort).run(&sh("exit 0"), &mut handler).await.unwrap();
        assert_eq!(outcome, RunOutcome::Aborted);
    }

    #[tokio::test]
    async fn test_abort_during_output_then_zero_exit_is_aborted() {
        let abort = CancellationToken::new();
        let mut handler = ScriptedHandler { cancel_on: Some(abort.clone()), ..Default::default() };
        let outcome = supervisor(abort)
            .run(&sh("echo one; echo CANCEL; echo three; echo four; exit 0"), &mut handler)
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::Aborted);
        assert_eq!(handler.lines[..2], ["one".to_string(), "CANCEL".to_string()]);
    }

    #[tokio::test]
    async fn test_abort_after_output_closes_terminates_child() {
        let abort = CancellationToken::new();
        let trigger = abort.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let mut handler = ScriptedHandler::default();
        let outcome = supervisor(abort)
            .run(&sh("echo closing; exec >&- 2>&-; exec sleep 30"), &mut handler)
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::Aborted);
        assert_eq!(handler.lines, vec!["closing".to_string()]);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_abort_terminates_silent_child() {
        let abort = CancellationToken::new();
        let trigger = abort.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let mut handler = ScriptedHandler::default();
        let outcome = supervisor(abort).run(&sh("echo started; exec sleep 30"), &mut handler).await.unwrap();

        assert_eq!(outcome, RunOutcome::Aborted);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(handler.lines, vec!["started".to_string()]);
    }

    #[tokio::test]
    async fn test_handler_error_terminates_child() {
        let started = Instant::now();
        let mut handler = ScriptedHandler::default();
        let outcome = supervisor(CancellationToken::new())
            .run(&sh("echo FATAL; exec sleep 30"), &mut handler)
            .await
            .unwrap();

        assert!(matches!(outcome, RunOutcome::Failed { trailing, .. } if trailing.is_empty()));
        assert_eq!(handler.exception.as_deref(), Some("fatal line"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_an_error() {
        let command = TrainerCommand {
            program: PathBuf::from("/nonexistent/th"),
            args: Vec::new(),
            cwd: std::env::temp_dir(),
        };
        let mut handler = ScriptedHandler::default();
        let err = supervisor(CancellationToken::new()).run(&command, &mut handler).await.unwrap_err();
        assert!(matches!(err, TrainingError::Spawn { .. }));
    }
}
