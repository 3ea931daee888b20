use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::dispatch::failure::{FailureStage, OperationFailure};
use crate::dispatch::normalize::{normalize_outcome, OperationResult};
use crate::dispatch::registry::{OperationRegistry, OperationSpec, RoutePolicy};
use crate::dispatch::remote::RemoteImageService;
use crate::dispatch::request::OperationRequest;
use crate::dispatch::runner::{CommandSpec, OperationCommandRunner};

pub type SharedRemoteImageService = Arc<dyn RemoteImageService>;

/// Routes each request to the remote service, a local processor, or both in
/// order, and always resolves to exactly one result or failure.
pub struct Dispatcher<R> {
    registry: OperationRegistry,
    runner: R,
    remote: Option<SharedRemoteImageService>,
    working_dir: PathBuf,
}

impl<R> Dispatcher<R>
where
    R: OperationCommandRunner,
{
    pub fn new(registry: OperationRegistry, runner: R, working_dir: PathBuf) -> Self {
        Self {
            registry,
            runner,
            remote: None,
            working_dir,
        }
    }

    pub fn with_remote(mut self, remote: SharedRemoteImageService) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    pub fn remote(&self) -> Option<&SharedRemoteImageService> {
        self.remote.as_ref()
    }

    pub fn execute(&self, request: &OperationRequest) -> Result<OperationResult, OperationFailure> {
        self.execute_with_cancel(request, &CancellationToken::new())
    }

    pub fn execute_with_cancel(
        &self,
        request: &OperationRequest,
        cancel: &CancellationToken,
    ) -> Result<OperationResult, OperationFailure> {
        let operation = request.operation.as_str();
        let Some(spec) = self.registry.get(request.operation) else {
            return Err(OperationFailure::new(
                FailureStage::Spawn,
                format!("operation '{operation}' has no registered processor"),
            ));
        };

        let result = match spec.policy {
            RoutePolicy::RemoteOnly => self.run_remote(spec, request, cancel),
            RoutePolicy::LocalOnly => self.run_local(spec, request, cancel),
            RoutePolicy::RemoteThenLocal => self.run_remote_then_local(spec, request, cancel),
        };

        match &result {
            Ok(payload) => info!(operation, kind = payload.kind(), "operation completed"),
            Err(failure) => warn!(
                operation,
                stage = failure.stage.as_str(),
                exit_code = failure.exit_code,
                message = %failure.message,
                "operation failed"
            ),
        }
        result
    }

    fn run_remote_then_local(
        &self,
        spec: &OperationSpec,
        request: &OperationRequest,
        cancel: &CancellationToken,
    ) -> Result<OperationResult, OperationFailure> {
        if self.remote.is_none() {
            return self.run_local(spec, request, cancel);
        }

        let remote_failure = match self.run_remote(spec, request, cancel) {
            Ok(result) => return Ok(result),
            Err(failure) if failure.stage == FailureStage::Cancelled => return Err(failure),
            Err(failure) => failure,
        };
        warn!(
            operation = request.operation.as_str(),
            stage = remote_failure.stage.as_str(),
            http_status = remote_failure.http_status,
            message = %remote_failure.message,
            "remote attempt failed, falling back to local processor"
        );

        self.run_local(spec, request, cancel)
            .map_err(|local_failure| local_failure.with_remote_attempt(remote_failure))
    }

    fn run_remote(
        &self,
        spec: &OperationSpec,
        request: &OperationRequest,
        cancel: &CancellationToken,
    ) -> Result<OperationResult, OperationFailure> {
        let Some(remote) = self.remote.as_ref() else {
            return Err(OperationFailure::remote_transport(
                "remote image service is not configured",
            ));
        };
        let Some(endpoint) = spec.remote.as_ref() else {
            return Err(OperationFailure::remote_transport(format!(
                "operation '{}' has no remote endpoint",
                spec.name.as_str()
            )));
        };
        remote.execute(endpoint, request, cancel)
    }

    fn run_local(
        &self,
        spec: &OperationSpec,
        request: &OperationRequest,
        cancel: &CancellationToken,
    ) -> Result<OperationResult, OperationFailure> {
        if cancel.is_cancelled() {
            return Err(OperationFailure::cancelled());
        }

        let input = request.input.materialize().map_err(|e| {
            OperationFailure::new(
                FailureStage::Spawn,
                format!("failed to stage input image: {e}"),
            )
        })?;
        let secondary = request
            .secondary_input
            .as_ref()
            .map(|input| input.materialize())
            .transpose()
            .map_err(|e| {
                OperationFailure::new(
                    FailureStage::Spawn,
                    format!("failed to stage secondary input: {e}"),
                )
            })?;

        let Some((program, args)) =
            spec.local_argv(request, input.path(), secondary.as_ref().map(|v| v.path()))
        else {
            return Err(OperationFailure::new(
                FailureStage::Spawn,
                format!(
                    "operation '{}' has no local processor",
                    spec.name.as_str()
                ),
            ));
        };

        let outcome = self.runner.run(
            &CommandSpec {
                program,
                args,
                cwd: self.working_dir.clone(),
            },
            cancel,
        )?;
        normalize_outcome(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Mutex;

    use crate::dispatch::normalize::ImagePayload;
    use crate::dispatch::registry::{resize_args, LocalProgram, RemoteEndpoint};
    use crate::dispatch::request::{InputRef, OperationName};
    use crate::dispatch::runner::ExecutionOutcome;

    #[derive(Clone, Default)]
    struct FakeRunner {
        seen: Arc<Mutex<Vec<CommandSpec>>>,
        next: Arc<Mutex<Vec<Result<ExecutionOutcome, OperationFailure>>>>,
    }

    impl FakeRunner {
        fn with_next(result: Result<ExecutionOutcome, OperationFailure>) -> Self {
            Self {
                seen: Arc::new(Mutex::new(Vec::new())),
                next: Arc::new(Mutex::new(vec![result])),
            }
        }

        fn exiting(exit_code: i32, stdout: &str, stderr: &str) -> Self {
            Self::with_next(Ok(ExecutionOutcome {
                exit_code,
                stdout: stdout.as_bytes().to_vec(),
                stderr: stderr.as_bytes().to_vec(),
            }))
        }

        fn take_seen(&self) -> Vec<CommandSpec> {
            std::mem::take(&mut *self.seen.lock().expect("fake runner mutex poisoned"))
        }
    }

    impl OperationCommandRunner for FakeRunner {
        fn run(
            &self,
            spec: &CommandSpec,
            _cancel: &CancellationToken,
        ) -> Result<ExecutionOutcome, OperationFailure> {
            self.seen
                .lock()
                .expect("fake runner mutex poisoned")
                .push(spec.clone());
            self.next
                .lock()
                .expect("fake runner mutex poisoned")
                .pop()
                .unwrap_or_else(|| {
                    Ok(ExecutionOutcome {
                        exit_code: 0,
                        stdout: Vec::new(),
                        stderr: Vec::new(),
                    })
                })
        }
    }

    #[derive(Default)]
    struct FakeRemote {
        calls: Mutex<usize>,
        next: Mutex<Option<Result<OperationResult, OperationFailure>>>,
    }

    impl FakeRemote {
        fn with_next(result: Result<OperationResult, OperationFailure>) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(0),
                next: Mutex::new(Some(result)),
            })
        }

        fn calls(&self) -> usize {
            *self.calls.lock().expect("fake remote mutex poisoned")
        }
    }

    impl RemoteImageService for FakeRemote {
        fn execute(
            &self,
            _endpoint: &RemoteEndpoint,
            _request: &OperationRequest,
            _cancel: &CancellationToken,
        ) -> Result<OperationResult, OperationFailure> {
            *self.calls.lock().expect("fake remote mutex poisoned") += 1;
            self.next
                .lock()
                .expect("fake remote mutex poisoned")
                .take()
                .unwrap_or_else(|| Err(OperationFailure::remote_transport("no response queued")))
        }

        fn ping(&self) -> Result<String, OperationFailure> {
            Ok(String::from("pong"))
        }
    }

    fn registry() -> OperationRegistry {
        OperationRegistry::with_python_tools("python3", Path::new("tools"))
            .expect("registry should build")
    }

    fn resize_request() -> OperationRequest {
        OperationRequest::new(OperationName::Resize, InputRef::path("/in/a.png"))
            .with_param("width", 64u32)
            .with_param("height", 32u32)
            .with_param("expand", false)
    }

    fn image(bytes: &[u8]) -> OperationResult {
        OperationResult::Image(ImagePayload {
            bytes: bytes.to_vec(),
            mime: None,
        })
    }

    #[test]
    fn local_success_produces_image_payload() {
        let runner = FakeRunner::exiting(0, "{\"image\":\"QUJD\"}", "");
        let dispatcher = Dispatcher::new(registry(), runner.clone(), PathBuf::from("/work"));

        let result = dispatcher
            .execute(&resize_request())
            .expect("local resize should succeed");

        assert_eq!(result, image(b"ABC"));
        let seen = runner.take_seen();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].program, "python3");
        assert_eq!(seen[0].cwd, PathBuf::from("/work"));
        assert_eq!(
            &seen[0].args[1..],
            &["/in/a.png", "64", "32", "false"]
        );
    }

    #[test]
    fn remote_success_skips_local_processor() {
        let runner = FakeRunner::default();
        let remote = FakeRemote::with_next(Ok(image(b"remote")));
        let dispatcher = Dispatcher::new(registry(), runner.clone(), PathBuf::from("."))
            .with_remote(remote.clone());

        let result = dispatcher
            .execute(&resize_request())
            .expect("remote resize should succeed");

        assert_eq!(result, image(b"remote"));
        assert_eq!(remote.calls(), 1);
        assert!(runner.take_seen().is_empty());
    }

    #[test]
    fn remote_status_failure_falls_back_to_local_exactly_once() {
        let runner = FakeRunner::exiting(0, "{\"image\":\"QUJD\"}", "");
        let remote = FakeRemote::with_next(Err(OperationFailure::remote_status(503, "busy")));
        let dispatcher = Dispatcher::new(registry(), runner.clone(), PathBuf::from("."))
            .with_remote(remote.clone());

        let result = dispatcher
            .execute(&resize_request())
            .expect("local fallback should succeed");

        assert_eq!(result, image(b"ABC"));
        assert_eq!(remote.calls(), 1);
        assert_eq!(runner.take_seen().len(), 1);
    }

    #[test]
    fn remote_timeout_is_not_surfaced_when_local_succeeds() {
        let runner = FakeRunner::exiting(0, "{\"image\":\"QUJD\"}", "");
        let remote = FakeRemote::with_next(Err(OperationFailure::remote_transport(
            "HTTP request failed: operation timed out",
        )));
        let dispatcher =
            Dispatcher::new(registry(), runner, PathBuf::from(".")).with_remote(remote);

        let result = dispatcher
            .execute(&resize_request())
            .expect("local fallback should succeed");
        assert_eq!(result, image(b"ABC"));
    }

    #[test]
    fn local_failure_after_remote_failure_reports_local_and_keeps_remote_detail() {
        let runner = FakeRunner::exiting(1, "", "");
        let remote = FakeRemote::with_next(Err(OperationFailure::remote_status(400, "bad size")));
        let dispatcher =
            Dispatcher::new(registry(), runner, PathBuf::from(".")).with_remote(remote);

        let err = dispatcher
            .execute(&resize_request())
            .expect_err("both paths should fail");

        assert_eq!(err.stage, FailureStage::Execution);
        assert_eq!(err.message, "process exited with code 1");
        assert_eq!(err.exit_code, Some(1));
        let remote = err.remote_attempt.as_deref().expect("remote detail kept");
        assert_eq!(remote.http_status, Some(400));
    }

    #[test]
    fn local_only_operation_never_calls_remote() {
        let runner = FakeRunner::exiting(0, "{\"text\":\"hello\"}", "");
        let remote = FakeRemote::with_next(Ok(image(b"unused")));
        let dispatcher = Dispatcher::new(registry(), runner, PathBuf::from("."))
            .with_remote(remote.clone());

        let result = dispatcher
            .execute(&OperationRequest::new(
                OperationName::ExtractText,
                InputRef::path("scan.png"),
            ))
            .expect("ocr should succeed");

        assert_eq!(result, OperationResult::Text(String::from("hello")));
        assert_eq!(remote.calls(), 0);
    }

    #[test]
    fn remote_then_local_without_remote_service_goes_local() {
        let runner = FakeRunner::exiting(0, "plain text result", "");
        let dispatcher = Dispatcher::new(registry(), runner.clone(), PathBuf::from("."));

        let result = dispatcher
            .execute(&resize_request())
            .expect("local resize should succeed");
        assert_eq!(result, OperationResult::Raw(String::from("plain text result")));
        assert_eq!(runner.take_seen().len(), 1);
    }

    #[test]
    fn remote_only_failure_propagates_as_is() {
        let registry = OperationRegistry::new(vec![OperationSpec {
            name: OperationName::Resize,
            local: None,
            remote: Some(RemoteEndpoint::new("/resize-image")),
            policy: RoutePolicy::RemoteOnly,
            build_args: resize_args,
        }])
        .expect("registry should build");
        let runner = FakeRunner::default();
        let remote = FakeRemote::with_next(Err(OperationFailure::remote_status(500, "boom")));
        let dispatcher =
            Dispatcher::new(registry, runner.clone(), PathBuf::from(".")).with_remote(remote);

        let err = dispatcher
            .execute(&resize_request())
            .expect_err("remote-only failure should propagate");
        assert_eq!(err.stage, FailureStage::RemoteStatus);
        assert!(err.remote_attempt.is_none());
        assert!(runner.take_seen().is_empty());
    }

    #[test]
    fn spawn_failure_is_terminal() {
        let runner = FakeRunner::with_next(Err(OperationFailure::new(
            FailureStage::Spawn,
            "failed to launch 'python3': No such file or directory",
        )));
        let dispatcher = Dispatcher::new(registry(), runner, PathBuf::from("."));

        let err = dispatcher
            .execute(&OperationRequest::new(
                OperationName::RemoveBackground,
                InputRef::path("a.png"),
            ))
            .expect_err("spawn failure should surface");
        assert_eq!(err.stage, FailureStage::Spawn);
    }

    #[test]
    fn cancelled_remote_attempt_does_not_start_local() {
        let runner = FakeRunner::default();
        let remote = FakeRemote::with_next(Err(OperationFailure::cancelled()));
        let dispatcher = Dispatcher::new(registry(), runner.clone(), PathBuf::from("."))
            .with_remote(remote);

        let err = dispatcher
            .execute(&resize_request())
            .expect_err("cancel should surface");
        assert_eq!(err.stage, FailureStage::Cancelled);
        assert!(runner.take_seen().is_empty());
    }

    #[test]
    fn byte_inputs_are_staged_for_local_processor_and_cleaned_up() {
        let runner = FakeRunner::exiting(0, "{\"image\":\"QUJD\"}", "");
        let dispatcher = Dispatcher::new(registry(), runner.clone(), PathBuf::from("."));
        let request = OperationRequest::new(
            OperationName::Cleanup,
            InputRef::bytes(b"img".to_vec(), Some(String::from("photo.png"))),
        )
        .with_secondary_input(InputRef::bytes(b"mask".to_vec(), None));

        dispatcher.execute(&request).expect("cleanup should succeed");

        let seen = runner.take_seen();
        let staged_image = PathBuf::from(seen[0].args[1].as_str());
        let staged_mask = PathBuf::from(seen[0].args[2].as_str());
        assert!(staged_image.starts_with(std::env::temp_dir()));
        assert_ne!(staged_image, staged_mask);
        assert!(!staged_image.exists());
        assert!(!staged_mask.exists());
    }

    #[test]
    fn repeated_invocations_yield_same_variant() {
        let runner = FakeRunner {
            seen: Arc::default(),
            next: Arc::new(Mutex::new(vec![
                Ok(ExecutionOutcome {
                    exit_code: 0,
                    stdout: b"{\"image\":\"QUJD\"}".to_vec(),
                    stderr: Vec::new(),
                }),
                Ok(ExecutionOutcome {
                    exit_code: 0,
                    stdout: b"{\"image\":\"QUJD\"}".to_vec(),
                    stderr: Vec::new(),
                }),
            ])),
        };
        let dispatcher = Dispatcher::new(registry(), runner, PathBuf::from("."));
        let first = dispatcher.execute(&resize_request()).expect("first run");
        let second = dispatcher.execute(&resize_request()).expect("second run");
        assert_eq!(first.kind(), second.kind());
    }

    #[test]
    fn local_program_prefix_is_kept_ahead_of_positional_args() {
        let registry = OperationRegistry::new(vec![OperationSpec {
            name: OperationName::Resize,
            local: Some(LocalProgram {
                program: String::from("resizer"),
                leading_args: vec![String::from("--json")],
            }),
            remote: None,
            policy: RoutePolicy::LocalOnly,
            build_args: resize_args,
        }])
        .expect("registry should build");
        let runner = FakeRunner::exiting(0, "{\"image\":\"QUJD\"}", "");
        let dispatcher = Dispatcher::new(registry, runner.clone(), PathBuf::from("."));

        dispatcher.execute(&resize_request()).expect("resize should run");
        let seen = runner.take_seen();
        assert_eq!(seen[0].program, "resizer");
        assert_eq!(seen[0].args, vec!["--json", "/in/a.png", "64", "32", "false"]);
    }
}
