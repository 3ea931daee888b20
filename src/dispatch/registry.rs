use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::dispatch::request::{OperationName, OperationRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoutePolicy {
    RemoteOnly,
    LocalOnly,
    RemoteThenLocal,
}

impl RoutePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RemoteOnly => "remote_only",
            Self::LocalOnly => "local_only",
            Self::RemoteThenLocal => "remote_then_local",
        }
    }

    fn needs_remote(self) -> bool {
        matches!(self, Self::RemoteOnly | Self::RemoteThenLocal)
    }

    fn needs_local(self) -> bool {
        matches!(self, Self::LocalOnly | Self::RemoteThenLocal)
    }
}

/// Executable plus fixed leading arguments (for example an interpreter and
/// the processor script it runs).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalProgram {
    pub program: String,
    pub leading_args: Vec<String>,
}

impl LocalProgram {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    pub fn python_script(python_bin: &str, script: PathBuf) -> Self {
        Self {
            program: python_bin.to_string(),
            leading_args: vec![script.to_string_lossy().to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEndpoint {
    pub path: String,
}

impl RemoteEndpoint {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

/// Builds the positional argument vector from a request and the resolved
/// primary / secondary input files. Must not depend on anything else.
pub type ArgBuilder = fn(&OperationRequest, &Path, Option<&Path>) -> Vec<String>;

#[derive(Clone)]
pub struct OperationSpec {
    pub name: OperationName,
    pub local: Option<LocalProgram>,
    pub remote: Option<RemoteEndpoint>,
    pub policy: RoutePolicy,
    pub build_args: ArgBuilder,
}

impl std::fmt::Debug for OperationSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationSpec")
            .field("name", &self.name)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl OperationSpec {
    pub fn local_argv(
        &self,
        request: &OperationRequest,
        input: &Path,
        secondary: Option<&Path>,
    ) -> Option<(String, Vec<String>)> {
        let local = self.local.as_ref()?;
        let mut args = local.leading_args.clone();
        args.extend((self.build_args)(request, input, secondary));
        Some((local.program.clone(), args))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("operation '{0}' is registered more than once")]
    DuplicateOperation(&'static str),
    #[error("operation '{operation}' uses policy {policy} but has no remote endpoint")]
    MissingRemoteEndpoint {
        operation: &'static str,
        policy: &'static str,
    },
    #[error("operation '{operation}' uses policy {policy} but has no local program")]
    MissingLocalProgram {
        operation: &'static str,
        policy: &'static str,
    },
}

#[derive(Debug, Clone)]
pub struct OperationRegistry {
    specs: BTreeMap<OperationName, OperationSpec>,
}

impl OperationRegistry {
    pub fn new(specs: Vec<OperationSpec>) -> Result<Self, RegistryError> {
        let mut by_name = BTreeMap::new();
        for spec in specs {
            let operation = spec.name.as_str();
            let policy = spec.policy.as_str();
            if spec.policy.needs_remote() && spec.remote.is_none() {
                return Err(RegistryError::MissingRemoteEndpoint { operation, policy });
            }
            if spec.policy.needs_local() && spec.local.is_none() {
                return Err(RegistryError::MissingLocalProgram { operation, policy });
            }
            if by_name.insert(spec.name, spec).is_some() {
                return Err(RegistryError::DuplicateOperation(operation));
            }
        }
        Ok(Self { specs: by_name })
    }

    pub fn get(&self, name: OperationName) -> Option<&OperationSpec> {
        self.specs.get(&name)
    }

    pub fn operations(&self) -> impl Iterator<Item = OperationName> + '_ {
        self.specs.keys().copied()
    }

    /// Registry for the bundled python processors under `tools_dir`.
    pub fn with_python_tools(python_bin: &str, tools_dir: &Path) -> Result<Self, RegistryError> {
        let script = |name: &str| LocalProgram::python_script(python_bin, tools_dir.join(name));
        Self::new(vec![
            OperationSpec {
                name: OperationName::Resize,
                local: Some(script("resize_image.py")),
                remote: Some(RemoteEndpoint::new("/resize-image")),
                policy: RoutePolicy::RemoteThenLocal,
                build_args: resize_args,
            },
            OperationSpec {
                name: OperationName::GenerativeFill,
                local: Some(script("generative_fill.py")),
                remote: None,
                policy: RoutePolicy::LocalOnly,
                build_args: generative_fill_args,
            },
            OperationSpec {
                name: OperationName::RemoveBackground,
                local: Some(script("remove_background.py")),
                remote: None,
                policy: RoutePolicy::LocalOnly,
                build_args: image_only_args,
            },
            OperationSpec {
                name: OperationName::Cleanup,
                local: Some(script("cleanup.py")),
                remote: None,
                policy: RoutePolicy::LocalOnly,
                build_args: cleanup_args,
            },
            OperationSpec {
                name: OperationName::Upscale,
                local: Some(script("upscale.py")),
                remote: None,
                policy: RoutePolicy::LocalOnly,
                build_args: upscale_args,
            },
            OperationSpec {
                name: OperationName::ExtractText,
                local: Some(script("ocr.py")),
                remote: None,
                policy: RoutePolicy::LocalOnly,
                build_args: image_only_args,
            },
        ])
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn optional_path_arg(path: Option<&Path>) -> String {
    path.map(path_arg).unwrap_or_default()
}

pub fn resize_args(request: &OperationRequest, input: &Path, _: Option<&Path>) -> Vec<String> {
    vec![
        path_arg(input),
        request.param_arg("width"),
        request.param_arg("height"),
        request.param_arg("expand"),
    ]
}

pub fn generative_fill_args(
    request: &OperationRequest,
    input: &Path,
    mask: Option<&Path>,
) -> Vec<String> {
    vec![
        path_arg(input),
        request.param_arg("prompt"),
        optional_path_arg(mask),
    ]
}

pub fn cleanup_args(_: &OperationRequest, input: &Path, mask: Option<&Path>) -> Vec<String> {
    vec![path_arg(input), optional_path_arg(mask)]
}

pub fn upscale_args(request: &OperationRequest, input: &Path, _: Option<&Path>) -> Vec<String> {
    vec![path_arg(input), request.param_arg("scale")]
}

pub fn image_only_args(_: &OperationRequest, input: &Path, _: Option<&Path>) -> Vec<String> {
    vec![path_arg(input)]
}
