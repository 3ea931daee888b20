use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

use crate::dispatch::failure::{FailureStage, OperationFailure};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

/// Captured result of one fully reaped process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

pub trait OperationCommandRunner: Send + Sync + 'static {
    fn run(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, OperationFailure>;
}

#[derive(Debug, Default, Clone)]
pub struct StdOperationCommandRunner;

impl OperationCommandRunner for StdOperationCommandRunner {
    fn run(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, OperationFailure> {
        if cancel.is_cancelled() {
            return Err(OperationFailure::cancelled());
        }

        let mut command = Command::new(spec.program.as_str());
        command
            .args(spec.args.iter().map(String::as_str))
            .current_dir(spec.cwd.as_path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = command
            .spawn()
            .map_err(|source| OperationFailure::spawn(spec.program.as_str(), &source))?;
        debug!(program = %spec.program, pid = child.id(), "spawned local processor");

        let stdout_reader = drain_stream(child.stdout.take());
        let stderr_reader = drain_stream(child.stderr.take());

        let waited = wait_until_exit_or_cancel(&mut child, cancel);
        if matches!(waited, WaitResult::Exited(_)) {
            // Background helpers left in the group would hold the pipes open.
            terminate_process_group(&mut child);
        }
        let stdout = join_reader(stdout_reader);
        let stderr = join_reader(stderr_reader);

        match waited {
            WaitResult::Exited(status) => Ok(ExecutionOutcome {
                exit_code: status.code().unwrap_or(-1),
                stdout,
                stderr,
            }),
            WaitResult::Cancelled => Err(OperationFailure::cancelled()),
            WaitResult::WaitFailed(error) => Err(OperationFailure::new(
                FailureStage::Execution,
                format!("failed waiting for '{}': {error}", spec.program),
            )),
        }
    }
}

enum WaitResult {
    Exited(ExitStatus),
    Cancelled,
    WaitFailed(std::io::Error),
}

fn wait_until_exit_or_cancel(child: &mut Child, cancel: &CancellationToken) -> WaitResult {
    loop {
        if cancel.is_cancelled() {
            terminate_process_group(child);
            let _ = child.wait();
            return WaitResult::Cancelled;
        }
        match child.wait_timeout(WAIT_POLL_INTERVAL) {
            Ok(Some(status)) => return WaitResult::Exited(status),
            Ok(None) => continue,
            Err(error) => {
                terminate_process_group(child);
                let _ = child.wait();
                return WaitResult::WaitFailed(error);
            }
        }
    }
}

fn drain_stream<S>(stream: Option<S>) -> JoinHandle<Vec<u8>>
where
    S: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Some(mut stream) = stream {
            if let Err(error) = stream.read_to_end(&mut buffer) {
                warn!(error = %error, "failed to drain process output");
            }
        }
        buffer
    })
}

fn join_reader(handle: JoinHandle<Vec<u8>>) -> Vec<u8> {
    handle.join().unwrap_or_default()
}

#[cfg(unix)]
fn terminate_process_group(child: &mut Child) {
    let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
        let _ = child.kill();
        return;
    };
    // SAFETY: killpg only signals; the child leads its own group (process_group(0)).
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn terminate_process_group(child: &mut Child) {
    let _ = child.kill();
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec {
            program: String::from("sh"),
            args: vec![String::from("-c"), script.to_string()],
            cwd: std::env::temp_dir(),
        }
    }

    #[test]
    fn captures_stdout_stderr_and_exit_code_independently() {
        let outcome = StdOperationCommandRunner
            .run(
                &sh("printf '{\"image\":\"QUJD\"}'; printf 'warn' >&2; exit 3"),
                &CancellationToken::new(),
            )
            .expect("process should run");
        assert_eq!(outcome.exit_code, 3);
        assert_eq!(outcome.stdout, b"{\"image\":\"QUJD\"}");
        assert_eq!(outcome.stderr, b"warn");
    }

    #[test]
    fn captures_large_stdout_without_truncation() {
        let outcome = StdOperationCommandRunner
            .run(
                &sh("head -c 3000000 /dev/zero | tr '\\0' 'A'"),
                &CancellationToken::new(),
            )
            .expect("process should run");
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.stdout.len(), 3_000_000);
    }

    #[test]
    fn missing_binary_fails_at_spawn_stage() {
        let err = StdOperationCommandRunner
            .run(
                &CommandSpec {
                    program: String::from("imgpop-definitely-missing-binary"),
                    args: Vec::new(),
                    cwd: std::env::temp_dir(),
                },
                &CancellationToken::new(),
            )
            .expect_err("missing binary should fail");
        assert_eq!(err.stage, FailureStage::Spawn);
        assert!(err.message.contains("imgpop-definitely-missing-binary"));
    }

    #[test]
    fn cancellation_kills_and_reaps_long_running_process() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            trigger.cancel();
        });

        let started = Instant::now();
        let err = StdOperationCommandRunner
            .run(&sh("sleep 30 & sleep 30; wait"), &cancel)
            .expect_err("cancelled run should fail");
        canceller.join().expect("canceller thread should finish");

        assert_eq!(err.stage, FailureStage::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn background_helper_holding_stdout_does_not_block_return() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            trigger.cancel();
        });

        let started = Instant::now();
        let outcome = StdOperationCommandRunner
            .run(&sh("sleep 4 & echo '{\"text\":\"hi\"}'"), &cancel)
            .expect("leader exit should complete the run");
        canceller.join().expect("canceller thread should finish");

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.stdout, b"{\"text\":\"hi\"}\n");
    }

    #[test]
    fn already_cancelled_token_never_spawns() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = StdOperationCommandRunner
            .run(&sh("exit 0"), &cancel)
            .expect_err("cancelled token should short-circuit");
        assert_eq!(err.stage, FailureStage::Cancelled);
    }
}
