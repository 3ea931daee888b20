use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureStage {
    Spawn,
    Execution,
    Parse,
    RemoteTransport,
    RemoteStatus,
    Cancelled,
}

impl FailureStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Spawn => "spawn",
            Self::Execution => "execution",
            Self::Parse => "parse",
            Self::RemoteTransport => "remote-transport",
            Self::RemoteStatus => "remote-status",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_remote(self) -> bool {
        matches!(self, Self::RemoteTransport | Self::RemoteStatus)
    }
}

/// Terminal failure of one operation invocation.
///
/// `remote_attempt` carries the absorbed remote failure when a
/// remote-then-local operation also failed locally; the primary stage and
/// message always describe the last attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationFailure {
    pub stage: FailureStage,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_attempt: Option<Box<OperationFailure>>,
}

impl OperationFailure {
    pub fn new(stage: FailureStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            exit_code: None,
            http_status: None,
            remote_attempt: None,
        }
    }

    pub fn spawn(program: &str, source: &std::io::Error) -> Self {
        Self::new(
            FailureStage::Spawn,
            format!("failed to launch '{program}': {source}"),
        )
    }

    pub fn execution(exit_code: i32, message: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            ..Self::new(FailureStage::Execution, message)
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(FailureStage::Parse, message)
    }

    pub fn remote_transport(message: impl Into<String>) -> Self {
        Self::new(FailureStage::RemoteTransport, message)
    }

    pub fn remote_status(http_status: u16, message: impl Into<String>) -> Self {
        Self {
            http_status: Some(http_status),
            ..Self::new(FailureStage::RemoteStatus, message)
        }
    }

    pub fn cancelled() -> Self {
        Self::new(FailureStage::Cancelled, "operation was cancelled")
    }

    pub fn with_remote_attempt(mut self, remote: OperationFailure) -> Self {
        self.remote_attempt = Some(Box::new(remote));
        self
    }
}

impl fmt::Display for OperationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failure: {}", self.stage.as_str(), self.message)
    }
}

impl std::error::Error for OperationFailure {}
